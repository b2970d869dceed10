// src/quota.rs
//! Process-wide call budgets for the shared feed credential and classifier
//! key. Independent of the per-subscription run lock: two subscriptions can
//! run at once and still queue here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::histogram;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tokio::time::Instant;

use crate::classifier::{ArticleRequest, Classifier, ClusterRequest, ClusterSummary, DynClassifier, RawReply};
use crate::error::PortError;
use crate::feed::{DynFeed, FeedSource};
use crate::model::NormalizedItem;

/// Concurrency cap plus a minimum gap between call starts.
pub struct Quota {
    name: &'static str,
    permits: Semaphore,
    min_spacing: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl Quota {
    pub fn new(name: &'static str, max_concurrent: usize, min_spacing: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            permits: Semaphore::new(max_concurrent.clamp(1, Semaphore::MAX_PERMITS)),
            min_spacing,
            next_slot: Mutex::new(None),
        })
    }

    pub fn unlimited(name: &'static str) -> Arc<Self> {
        Self::new(name, Semaphore::MAX_PERMITS, Duration::ZERO)
    }

    /// Wait for a permit and for this caller's start slot.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, PortError> {
        let started = Instant::now();
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PortError::Transport(format!("{} quota closed", self.name)))?;

        if !self.min_spacing.is_zero() {
            let wait = {
                let mut next = self.next_slot.lock().await;
                let now = Instant::now();
                let slot = next.map_or(now, |n| n.max(now));
                *next = Some(slot + self.min_spacing);
                slot.saturating_duration_since(now)
            };
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }

        histogram!("quota_wait_ms", "quota" => self.name).record(started.elapsed().as_secs_f64() * 1_000.0);
        Ok(permit)
    }
}

/// Classifier wrapper that takes a quota permit per call.
pub struct GatedClassifier {
    inner: DynClassifier,
    quota: Arc<Quota>,
}

impl GatedClassifier {
    pub fn wrap(inner: DynClassifier, quota: Arc<Quota>) -> DynClassifier {
        Arc::new(Self { inner, quota })
    }
}

#[async_trait]
impl Classifier for GatedClassifier {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn cluster_batch(&self, request: &ClusterRequest<'_>) -> Result<RawReply, PortError> {
        let _permit = self.quota.acquire().await?;
        self.inner.cluster_batch(request).await
    }

    async fn merge_clusters(&self, clusters: &[ClusterSummary]) -> Result<RawReply, PortError> {
        let _permit = self.quota.acquire().await?;
        self.inner.merge_clusters(clusters).await
    }

    async fn generate_article(&self, request: &ArticleRequest<'_>) -> Result<RawReply, PortError> {
        let _permit = self.quota.acquire().await?;
        self.inner.generate_article(request).await
    }

    async fn filter_batch(&self, items: &[NormalizedItem]) -> Result<RawReply, PortError> {
        let _permit = self.quota.acquire().await?;
        self.inner.filter_batch(items).await
    }
}

pub struct GatedFeed {
    inner: DynFeed,
    quota: Arc<Quota>,
}

impl GatedFeed {
    pub fn wrap(inner: DynFeed, quota: Arc<Quota>) -> DynFeed {
        Arc::new(Self { inner, quota })
    }
}

#[async_trait]
impl FeedSource for GatedFeed {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn fetch(
        &self,
        channel_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<NormalizedItem>, PortError> {
        let _permit = self.quota.acquire().await?;
        self.inner.fetch(channel_id, since, until).await
    }
}
