// src/cluster/mod.rs
//! Two-pass batch clusterer.
//!
//! Pass 1 asks the classifier to partition each batch into topics. Pass 2
//! (only when more than one batch produced clusters) asks it which clusters
//! across batches describe the same story; the answer is applied with a
//! union–find so the final partition does not depend on instruction order.
//! The clusterer never fails: any classifier problem degrades to singleton
//! clusters, so every input item ends up in exactly one output cluster.

pub mod filter;
pub mod schema;
pub mod union_find;

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::classifier::{ClusterRequest, ClusterSummary, DynClassifier};
use crate::model::{excerpt, Cluster, MergeInstruction, NormalizedItem, TokenUsage};
use crate::retry::{with_backoff, RetryPolicy};

pub use filter::FilterOutcome;
use schema::{parse_cluster_reply, parse_merge_reply, BatchPartition};
use union_find::UnionFind;

/// What happened in pass 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStatus {
    /// Zero or one batch produced clusters.
    NotNeeded,
    Applied { absorbed: usize },
    /// The merge reply was unusable; pass-1 clusters were kept as they were.
    Skipped { reason: String },
}

#[derive(Debug, Clone)]
pub struct ClusterOutcome {
    pub clusters: Vec<Cluster>,
    pub batches: usize,
    /// Batches that fell back to one singleton per item.
    pub degraded_batches: usize,
    pub merge: MergeStatus,
    pub usage: TokenUsage,
}

impl Default for ClusterOutcome {
    fn default() -> Self {
        Self {
            clusters: Vec::new(),
            batches: 0,
            degraded_batches: 0,
            merge: MergeStatus::NotNeeded,
            usage: TokenUsage::default(),
        }
    }
}

impl ClusterOutcome {
    pub fn is_degraded(&self) -> bool {
        self.degraded_batches > 0
    }

    pub fn item_count(&self) -> usize {
        self.clusters.iter().map(|c| c.items.len()).sum()
    }
}

pub struct BatchClusterer {
    classifier: DynClassifier,
    retry: RetryPolicy,
}

impl BatchClusterer {
    pub fn new(classifier: DynClassifier) -> Self {
        Self {
            classifier,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Partition `items` into clusters, `batch_size` items per classifier call.
    pub async fn cluster(
        &self,
        items: &[NormalizedItem],
        sections: &[String],
        batch_size: usize,
    ) -> ClusterOutcome {
        let mut outcome = ClusterOutcome::default();
        if items.is_empty() {
            return outcome;
        }

        let mut batches_with_clusters = 0;
        for (batch_idx, batch) in items.chunks(batch_size.max(1)).enumerate() {
            outcome.batches += 1;
            let clusters = match self
                .first_pass(batch_idx, batch, sections, &mut outcome.usage)
                .await
            {
                Some(clusters) => clusters,
                None => {
                    outcome.degraded_batches += 1;
                    counter!("clusterer_degraded_batches_total").increment(1);
                    singletons(batch_idx, batch)
                }
            };
            if !clusters.is_empty() {
                batches_with_clusters += 1;
            }
            outcome.clusters.extend(clusters);
        }

        if batches_with_clusters > 1 {
            let pre_merge = std::mem::take(&mut outcome.clusters);
            let (merged, status) = self.second_pass(pre_merge, &mut outcome.usage).await;
            outcome.clusters = merged;
            outcome.merge = status;
        }

        counter!("clusterer_clusters_total").increment(outcome.clusters.len() as u64);
        info!(
            items = items.len(),
            batches = outcome.batches,
            clusters = outcome.clusters.len(),
            degraded_batches = outcome.degraded_batches,
            merge = ?outcome.merge,
            "clustering finished"
        );
        outcome
    }

    /// `None` means the batch must degrade.
    async fn first_pass(
        &self,
        batch_idx: usize,
        batch: &[NormalizedItem],
        sections: &[String],
        usage: &mut TokenUsage,
    ) -> Option<Vec<Cluster>> {
        let classifier = self.classifier.as_ref();
        for strict_reminder in [false, true] {
            let request = ClusterRequest {
                items: batch,
                sections,
                strict_reminder,
            };
            let req = &request;
            let reply = match with_backoff(&self.retry, "cluster_batch", move || {
                classifier.cluster_batch(req)
            })
            .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(batch = batch_idx, error = %e, "classifier unavailable for batch");
                    return None;
                }
            };
            *usage += reply.usage;

            match parse_cluster_reply(&reply.text, batch.len(), sections) {
                Ok(partition) => return Some(materialize_batch(batch_idx, batch, partition)),
                Err(e) => {
                    counter!("clusterer_malformed_replies_total").increment(1);
                    warn!(batch = batch_idx, strict_reminder, error = %e, "cluster reply rejected");
                }
            }
        }
        None
    }

    async fn second_pass(
        &self,
        clusters: Vec<Cluster>,
        usage: &mut TokenUsage,
    ) -> (Vec<Cluster>, MergeStatus) {
        let summaries: Vec<ClusterSummary> = clusters.iter().map(ClusterSummary::from).collect();
        let classifier = self.classifier.as_ref();
        let summaries = summaries.as_slice();
        let reply = match with_backoff(&self.retry, "merge_clusters", move || {
            classifier.merge_clusters(summaries)
        })
        .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "merge pass unavailable, keeping pass-1 clusters");
                return (clusters, MergeStatus::Skipped { reason: e.to_string() });
            }
        };
        *usage += reply.usage;

        let known: HashSet<&str> = clusters.iter().map(|c| c.id.as_str()).collect();
        let instructions = match parse_merge_reply(&reply.text, |id| known.contains(id)) {
            Ok(instructions) => instructions,
            Err(e) => {
                counter!("clusterer_malformed_replies_total").increment(1);
                warn!(error = %e, "merge reply rejected, keeping pass-1 clusters");
                return (clusters, MergeStatus::Skipped { reason: e.0 });
            }
        };

        let before = clusters.len();
        let merged = apply_merges(clusters, &instructions);
        debug!(before, after = merged.len(), instructions = instructions.len(), "merge applied");
        let absorbed = before - merged.len();
        (merged, MergeStatus::Applied { absorbed })
    }
}

fn materialize_batch(batch_idx: usize, batch: &[NormalizedItem], partition: BatchPartition) -> Vec<Cluster> {
    let mut out = Vec::with_capacity(partition.topics.len() + partition.unassigned.len());
    for (n, topic) in partition.topics.into_iter().enumerate() {
        let items: Vec<NormalizedItem> = topic.members.iter().map(|&p| batch[p].clone()).collect();
        let summary = if topic.summary.is_empty() {
            excerpt(&items[0].text, 100)
        } else {
            topic.summary
        };
        out.push(Cluster {
            id: format!("b{batch_idx}_t{n}"),
            items,
            summary,
            section: topic.section,
            article_type: topic.article_type,
        });
    }
    for pos in partition.unassigned {
        out.push(Cluster::singleton(format!("b{batch_idx}_s{pos}"), batch[pos].clone()));
    }
    out
}

fn singletons(batch_idx: usize, batch: &[NormalizedItem]) -> Vec<Cluster> {
    batch
        .iter()
        .enumerate()
        .map(|(pos, item)| Cluster::singleton(format!("b{batch_idx}_s{pos}"), item.clone()))
        .collect()
}

/// Fold clusters together per `instructions`.
///
/// The resulting partition, and each merged cluster's id, section, type and
/// summary, depend only on the set of instructions, not their order. Ids that
/// match no cluster are ignored.
pub fn apply_merges(clusters: Vec<Cluster>, instructions: &[MergeInstruction]) -> Vec<Cluster> {
    let mut uf = UnionFind::new(clusters.len());
    let mut proposed: HashMap<usize, (usize, String)> = HashMap::new();
    {
        let index: HashMap<&str, usize> = clusters
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.as_str(), i))
            .collect();

        for ins in instructions {
            let Some(&keep) = index.get(ins.keep.as_str()) else {
                continue;
            };
            for id in &ins.absorbed {
                if let Some(&other) = index.get(id.as_str()) {
                    uf.union(keep, other);
                }
            }
        }

        // Pick one proposed summary per group: lowest keep index, then text.
        for ins in instructions {
            let (Some(&keep), Some(summary)) = (index.get(ins.keep.as_str()), ins.summary.as_ref())
            else {
                continue;
            };
            let root = uf.find(keep);
            let candidate = (keep, summary.clone());
            match proposed.get(&root) {
                Some(current) if *current <= candidate => {}
                _ => {
                    proposed.insert(root, candidate);
                }
            }
        }
    }

    let groups = uf.groups();
    let mut slots: Vec<Option<Cluster>> = clusters.into_iter().map(Some).collect();
    let mut out = Vec::with_capacity(groups.len());
    for members in groups {
        let root = uf.find(members[0]);
        let parts: Vec<(usize, Cluster)> = members
            .iter()
            .filter_map(|&i| slots[i].take().map(|c| (i, c)))
            .collect();
        let summary = proposed.remove(&root).map(|(_, s)| s);
        if let Some(merged) = merge_group(parts, summary) {
            out.push(merged);
        }
    }
    out
}

/// Earliest timestamp first, then lower pre-merge position.
type Precedence = (Option<DateTime<Utc>>, usize);

fn merge_group(parts: Vec<(usize, Cluster)>, summary: Option<String>) -> Option<Cluster> {
    if parts.len() <= 1 {
        return parts.into_iter().next().map(|(_, c)| c);
    }

    let ranked: Vec<Precedence> = parts
        .iter()
        .map(|(i, c)| (c.earliest_timestamp(), *i))
        .collect();
    let anchor = ranked
        .iter()
        .zip(parts.iter())
        .min_by_key(|(p, _)| **p)
        .map(|(_, (_, c))| c)?;

    let section = vote(parts.iter().zip(&ranked).map(|((_, c), p)| (c.section.clone(), *p)))
        .unwrap_or_else(|| anchor.section.clone());
    let article_type = vote(parts.iter().zip(&ranked).map(|((_, c), p)| (c.article_type, *p)))
        .unwrap_or(anchor.article_type);
    let summary = summary.unwrap_or_else(|| anchor.summary.clone());
    // Members are sorted, so the first part has the lowest position.
    let id = parts[0].1.id.clone();

    let mut items: Vec<NormalizedItem> = parts.into_iter().flat_map(|(_, c)| c.items).collect();
    items.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.key.cmp(&b.key)));
    items.dedup_by(|a, b| a.key == b.key);

    Some(Cluster {
        id,
        items,
        summary,
        section,
        article_type,
    })
}

/// Majority value; ties go to the value whose best voter has the highest precedence.
fn vote<T: Ord>(votes: impl Iterator<Item = (T, Precedence)>) -> Option<T> {
    let mut tally: BTreeMap<T, (usize, Precedence)> = BTreeMap::new();
    for (value, precedence) in votes {
        let entry = tally.entry(value).or_insert((0, precedence));
        entry.0 += 1;
        if precedence < entry.1 {
            entry.1 = precedence;
        }
    }
    tally
        .into_iter()
        .max_by(|(_, (count_a, prec_a)), (_, (count_b, prec_b))| {
            count_a.cmp(count_b).then_with(|| prec_b.cmp(prec_a))
        })
        .map(|(value, _)| value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ArticleType, BRIEF_SECTION};
    use chrono::TimeZone;

    fn item(id: &str, minute: u32) -> NormalizedItem {
        let t = Utc.with_ymd_and_hms(2025, 2, 1, 12, minute, 0).unwrap();
        NormalizedItem::new("chan", id, t, format!("item {id}"))
    }

    fn cluster(id: &str, items: Vec<NormalizedItem>, section: &str, ty: ArticleType) -> Cluster {
        Cluster {
            id: id.to_string(),
            summary: format!("summary {id}"),
            items,
            section: section.to_string(),
            article_type: ty,
        }
    }

    fn merge(keep: &str, absorbed: &[&str], summary: Option<&str>) -> MergeInstruction {
        MergeInstruction {
            keep: keep.to_string(),
            absorbed: absorbed.iter().map(|s| s.to_string()).collect(),
            summary: summary.map(str::to_string),
        }
    }

    #[test]
    fn chained_merges_collapse_into_one_group() {
        let clusters = vec![
            cluster("a", vec![item("1", 5)], "Politics", ArticleType::HardNews),
            cluster("b", vec![item("2", 1)], "World", ArticleType::Opinion),
            cluster("c", vec![item("3", 9)], "World", ArticleType::HardNews),
            cluster("d", vec![item("4", 0)], BRIEF_SECTION, ArticleType::Brief),
        ];
        let merged = apply_merges(
            clusters,
            &[merge("a", &["b"], Some("Summit")), merge("c", &["b"], None)],
        );
        assert_eq!(merged.len(), 2);
        let big = &merged[0];
        assert_eq!(big.id, "a");
        assert_eq!(big.items.len(), 3);
        // two "World" votes beat one "Politics"
        assert_eq!(big.section, "World");
        // 2x HardNews vs 1x Opinion
        assert_eq!(big.article_type, ArticleType::HardNews);
        assert_eq!(big.summary, "Summit");
        // items come out chronological
        assert_eq!(big.items[0].key.item_id, "2");
        assert_eq!(merged[1].id, "d");
    }

    #[test]
    fn vote_ties_go_to_earliest_cluster() {
        let clusters = vec![
            cluster("a", vec![item("1", 30)], "Politics", ArticleType::Opinion),
            cluster("b", vec![item("2", 10)], "World", ArticleType::Feature),
        ];
        let merged = apply_merges(clusters, &[merge("a", &["b"], None)]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].section, "World");
        assert_eq!(merged[0].article_type, ArticleType::Feature);
        assert_eq!(merged[0].summary, "summary b");
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let clusters = vec![
            cluster("a", vec![item("1", 0)], "World", ArticleType::HardNews),
            cluster("b", vec![item("2", 1)], "World", ArticleType::HardNews),
        ];
        let merged = apply_merges(clusters, &[merge("zzz", &["a"], None), merge("a", &["nope"], None)]);
        assert_eq!(merged.len(), 2);
    }
}
