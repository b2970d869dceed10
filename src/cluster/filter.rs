// src/cluster/filter.rs
//! Optional noise filter run before clustering.

use metrics::counter;
use tracing::{debug, warn};

use super::schema::parse_filter_reply;
use super::BatchClusterer;
use crate::model::{ItemKey, NormalizedItem, TokenUsage};
use crate::retry::with_backoff;

#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub kept: Vec<NormalizedItem>,
    /// Items judged not worth an article. They are still committed as processed.
    pub trash: Vec<ItemKey>,
    pub usage: TokenUsage,
}

impl BatchClusterer {
    /// Drop items the classifier flags as noise. A failed or unparsable reply
    /// keeps its whole batch.
    pub async fn filter_noise(&self, items: &[NormalizedItem], batch_size: usize) -> FilterOutcome {
        let mut out = FilterOutcome::default();
        let classifier = self.classifier.as_ref();

        for (batch_idx, batch) in items.chunks(batch_size.max(1)).enumerate() {
            let reply = with_backoff(&self.retry, "filter_batch", move || classifier.filter_batch(batch)).await;
            let trash = match reply {
                Ok(reply) => {
                    out.usage += reply.usage;
                    match parse_filter_reply(&reply.text, batch.len()) {
                        Ok(trash) => trash,
                        Err(e) => {
                            warn!(batch = batch_idx, error = %e, "filter reply rejected, keeping batch");
                            Default::default()
                        }
                    }
                }
                Err(e) => {
                    warn!(batch = batch_idx, error = %e, "filter unavailable, keeping batch");
                    Default::default()
                }
            };

            for (pos, item) in batch.iter().enumerate() {
                if trash.contains(&pos) {
                    out.trash.push(item.key.clone());
                } else {
                    out.kept.push(item.clone());
                }
            }
        }

        counter!("filter_trash_total").increment(out.trash.len() as u64);
        debug!(kept = out.kept.len(), trash = out.trash.len(), "noise filter finished");
        out
    }
}
