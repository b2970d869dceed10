// src/classifier/mod.rs
//! Classifier port: the external model that groups items, proposes merges,
//! writes articles and flags noise.
//!
//! Every method returns the model's raw text. Validation happens in
//! `cluster::schema`, never in adapters, so a wrong or partial answer is
//! treated the same whichever backend produced it.

pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::PortError;
use crate::model::{ArticleType, Cluster, NormalizedItem, TokenUsage};

/// Raw classifier output plus what it cost.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawReply {
    pub text: String,
    pub usage: TokenUsage,
}

impl RawReply {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: TokenUsage::default(),
        }
    }
}

impl From<String> for RawReply {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl From<&str> for RawReply {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

/// Pass-1 request: one batch, numbered from 1 in slice order.
#[derive(Debug, Clone, Copy)]
pub struct ClusterRequest<'a> {
    pub items: &'a [NormalizedItem],
    pub sections: &'a [String],
    /// Set on the retry after a malformed reply.
    pub strict_reminder: bool,
}

/// Compact view of a pass-1 cluster sent to the merge pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterSummary {
    pub cluster_id: String,
    pub summary: String,
    pub section: String,
    pub article_type: ArticleType,
    pub item_count: usize,
}

impl From<&Cluster> for ClusterSummary {
    fn from(c: &Cluster) -> Self {
        Self {
            cluster_id: c.id.clone(),
            summary: c.summary.clone(),
            section: c.section.clone(),
            article_type: c.article_type,
            item_count: c.items.len(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ArticleRequest<'a> {
    pub cluster: &'a Cluster,
    pub article_type: ArticleType,
    pub section: &'a str,
    pub language: &'a str,
    pub publication: &'a str,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn cluster_batch(&self, request: &ClusterRequest<'_>) -> Result<RawReply, PortError>;

    async fn merge_clusters(&self, clusters: &[ClusterSummary]) -> Result<RawReply, PortError>;

    async fn generate_article(&self, request: &ArticleRequest<'_>) -> Result<RawReply, PortError>;

    /// Split a batch into worth-reporting and noise.
    async fn filter_batch(&self, items: &[NormalizedItem]) -> Result<RawReply, PortError>;
}

pub type DynClassifier = Arc<dyn Classifier>;
