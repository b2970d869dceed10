// src/notify/html_file.rs
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::format::{Item, StrftimeItems};
use tracing::info;

use super::{DeliverySink, Document};

/// Writes the HTML edition to disk. The path is a strftime template
/// expanded with the edition's generation time, e.g.
/// `output/digest-%Y-%m-%d-%H%M.html`.
pub struct HtmlFileSink {
    name: String,
    template: String,
}

impl HtmlFileSink {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        if StrftimeItems::new(&template).any(|i| matches!(i, Item::Error)) {
            anyhow::bail!("invalid strftime placeholder in path template {template:?}");
        }
        Ok(Self {
            name: name.into(),
            template,
        })
    }

    pub fn path_for(&self, doc: &Document) -> PathBuf {
        PathBuf::from(doc.generated_at.format(&self.template).to_string())
    }
}

#[async_trait]
impl DeliverySink for HtmlFileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, doc: &Document) -> Result<()> {
        let path = self.path_for(doc);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp = path.with_extension("html.tmp");
        tokio::fs::write(&tmp, doc.html.as_bytes())
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming into {}", path.display()))?;
        info!(path = %path.display(), "edition written");
        Ok(())
    }
}
