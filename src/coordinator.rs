// src/coordinator.rs
//! Run coordinator: one fire of one subscription, end to end.
//!
//! pending → fetching → clustering → generating → delivering → committing →
//! completed | failed. Only a successful commit writes processed marks; any
//! earlier failure closes the run without touching the watermark.

use std::collections::{BTreeSet, HashSet};
use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::{ArticleRequest, DynClassifier};
use crate::cluster::schema::parse_article_reply;
use crate::cluster::{BatchClusterer, ClusterOutcome, MergeStatus};
use crate::digest::assemble_sections;
use crate::error::{PortError, RunError};
use crate::feed::DynFeed;
use crate::model::{Article, ArticleType, Cluster, Digest, ItemKey, NormalizedItem, SourceRef, TokenUsage, BRIEF_SECTION};
use crate::notify::{deliver_all, DeliveryReport, DynSink};
use crate::retry::{with_backoff, RetryPolicy};
use crate::schedule::{Fire, RunWindow};
use crate::state::{CommitSummary, WatermarkStore};
use crate::subscription::Subscription;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Pending,
    Fetching,
    Clustering,
    Generating,
    Delivering,
    Committing,
    Completed,
    Failed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Pending => "pending",
            RunPhase::Fetching => "fetching",
            RunPhase::Clustering => "clustering",
            RunPhase::Generating => "generating",
            RunPhase::Delivering => "delivering",
            RunPhase::Committing => "committing",
            RunPhase::Completed => "completed",
            RunPhase::Failed => "failed",
        }
    }
}

/// What a completed run did.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub subscription_id: String,
    pub window: RunWindow,
    pub items_fetched: usize,
    /// Items that went into clustering.
    pub items_considered: usize,
    pub items_committed: usize,
    pub skipped_channels: Vec<String>,
    pub degraded: bool,
    pub dropped_clusters: usize,
    /// Oldest item left unmarked; the next window reaches back to it.
    pub retry_from: Option<DateTime<Utc>>,
    pub delivery: Option<DeliveryReport>,
    pub digest: Digest,
}

/// Items after dedup and the deliberate exclusions.
struct Intake {
    fetched: usize,
    skipped_channels: Vec<String>,
    items: Vec<NormalizedItem>,
    /// Keys committed without ever reaching a digest.
    excluded: BTreeSet<ItemKey>,
    /// Oldest item held back by the cap.
    deferred_from: Option<DateTime<Utc>>,
}

/// Articles plus what they cover.
struct Generated {
    articles: Vec<Article>,
    represented: BTreeSet<ItemKey>,
    dropped: usize,
    /// Oldest item of any dropped cluster.
    dropped_from: Option<DateTime<Utc>>,
}

pub struct RunCoordinator {
    store: WatermarkStore,
    feed: DynFeed,
    classifier: DynClassifier,
    clusterer: BatchClusterer,
    sinks: Vec<DynSink>,
    retry: RetryPolicy,
}

impl RunCoordinator {
    pub fn new(store: WatermarkStore, feed: DynFeed, classifier: DynClassifier, sinks: Vec<DynSink>) -> Self {
        Self {
            clusterer: BatchClusterer::new(classifier.clone()),
            store,
            feed,
            classifier,
            sinks,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self.clusterer = BatchClusterer::new(self.classifier.clone()).with_retry(retry);
        self
    }

    pub fn store(&self) -> &WatermarkStore {
        &self.store
    }

    /// Run `sub` for `fire`. Returns `Err` when the run could not start or
    /// ended without a commit; the run row then says why.
    pub async fn execute(&self, sub: &Subscription, fire: &Fire) -> Result<RunReport, RunError> {
        let started = Instant::now();
        let watermark = self.store.watermark_of(&sub.id)?;
        let retry_floor = self.store.retry_floor_of(&sub.id)?;
        let window = sub.schedule.window(fire.at, fire.lookback, watermark, retry_floor);
        let run_id = self.store.begin_run(&sub.id, window.start, window.end)?;
        info!(
            run_id = %run_id,
            subscription = %sub.id,
            since = %window.start,
            until = %window.end,
            retry_floor = ?retry_floor,
            "run started"
        );

        let mut phase = RunPhase::Pending;
        let result = self.drive(sub, &run_id, window, &mut phase).await;
        histogram!("run_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        match result {
            Ok(report) => {
                counter!("runs_total", "status" => "completed").increment(1);
                info!(
                    run_id = %run_id,
                    subscription = %sub.id,
                    fetched = report.items_fetched,
                    committed = report.items_committed,
                    articles = report.digest.article_count(),
                    degraded = report.degraded,
                    "run completed"
                );
                Ok(report)
            }
            Err(err) => {
                counter!("runs_total", "status" => "failed").increment(1);
                warn!(run_id = %run_id, subscription = %sub.id, phase = phase.as_str(), error = %err, "run failed");
                let detail = format!("{}: {err}", phase.as_str());
                if let Err(e) = self.store.abort_run(&run_id, &detail) {
                    warn!(run_id = %run_id, error = %e, "could not close failed run");
                }
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        sub: &Subscription,
        run_id: &str,
        window: RunWindow,
        phase: &mut RunPhase,
    ) -> Result<RunReport, RunError> {
        *phase = RunPhase::Fetching;
        let intake = self.fetch(sub, window).await?;
        let mut notes: Vec<String> = intake
            .skipped_channels
            .iter()
            .map(|c| format!("channel skipped: {c}"))
            .collect();
        let mut excluded = intake.excluded;
        let mut items = intake.items;
        let mut usage = TokenUsage::default();

        if sub.processing.filter_noise && !items.is_empty() {
            let filtered = self
                .clusterer
                .filter_noise(&items, sub.processing.batch_size)
                .await;
            usage += filtered.usage;
            excluded.extend(filtered.trash);
            items = filtered.kept;
        }

        *phase = RunPhase::Clustering;
        let candidates = sub.edition.section_candidates();
        let outcome = self
            .clusterer
            .cluster(&items, &candidates, sub.processing.batch_size)
            .await;
        usage += outcome.usage;
        note_clustering(&outcome, &mut notes);

        *phase = RunPhase::Generating;
        let Generated {
            articles,
            represented,
            dropped,
            dropped_from,
        } = self.generate(sub, &outcome.clusters, &mut usage).await?;
        if dropped > 0 {
            notes.push(format!("{dropped} cluster(s) dropped after failed generation"));
        }
        let retry_from = [intake.deferred_from, dropped_from].into_iter().flatten().min();

        let digest = Digest {
            edition_id: Uuid::new_v4(),
            subscription_id: sub.id.clone(),
            title: sub.edition.title.clone(),
            tagline: sub.edition.tagline.clone(),
            language: sub.edition.language.clone(),
            generated_at: Utc::now(),
            period_start: window.start,
            period_end: window.end,
            sections: assemble_sections(articles, &sub.edition.sections),
            items_considered: items.len(),
            channel_count: sub.channels.len() - intake.skipped_channels.len().min(sub.channels.len()),
            degraded: outcome.is_degraded(),
            token_usage: usage,
        };

        *phase = RunPhase::Delivering;
        let delivery = if digest.is_empty() {
            debug!(run_id, "empty digest, nothing to deliver");
            None
        } else {
            let sinks = self.sinks_for(sub);
            let report = deliver_all(&sinks, &digest).await;
            for (sink, err) in &report.failed {
                notes.push(format!("sink {sink} failed: {err}"));
            }
            Some(report)
        };

        *phase = RunPhase::Committing;
        let mut commit_set = represented;
        commit_set.extend(excluded);
        let summary = CommitSummary {
            items_fetched: intake.fetched,
            degraded: digest.degraded,
            error_detail: (!notes.is_empty()).then(|| notes.join("; ")),
            retry_from,
        };
        let committed = self.store.commit_run(run_id, &commit_set, &summary)?;
        counter!("items_committed_total").increment(committed as u64);
        *phase = RunPhase::Completed;

        Ok(RunReport {
            run_id: run_id.to_string(),
            subscription_id: sub.id.clone(),
            window,
            items_fetched: intake.fetched,
            items_considered: items.len(),
            items_committed: committed,
            skipped_channels: intake.skipped_channels,
            degraded: digest.degraded,
            dropped_clusters: dropped,
            retry_from,
            delivery,
            digest,
        })
    }

    async fn fetch(&self, sub: &Subscription, window: RunWindow) -> Result<Intake, RunError> {
        let feed = self.feed.as_ref();
        let mut fetched = Vec::new();
        let mut skipped_channels = Vec::new();

        for channel in &sub.channels {
            let channel_id = channel.as_str();
            let res = with_backoff(&self.retry, "feed_fetch", move || {
                feed.fetch(channel_id, window.start, window.end)
            })
            .await;
            match res {
                Ok(items) => {
                    debug!(channel = channel_id, items = items.len(), "channel fetched");
                    fetched.extend(items);
                }
                Err(PortError::ChannelAccess { reason, .. }) => {
                    counter!("feed_channels_skipped_total").increment(1);
                    warn!(subscription = %sub.id, channel = channel_id, reason = %reason, "channel skipped");
                    skipped_channels.push(channel.clone());
                }
                Err(source) => {
                    return Err(RunError::Fetch {
                        channel: channel.clone(),
                        source,
                    })
                }
            }
        }

        let total = fetched.len();
        let mut seen = HashSet::new();
        fetched.retain(|i| seen.insert(i.key.clone()));

        let already = self.store.processed_among(&sub.id, fetched.iter().map(|i| &i.key))?;
        fetched.retain(|i| !already.contains(&i.key));

        let mut excluded = BTreeSet::new();
        if !sub.processing.include_forwards {
            fetched.retain(|i| {
                if i.is_forward() {
                    excluded.insert(i.key.clone());
                    false
                } else {
                    true
                }
            });
        }

        fetched.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.key.cmp(&b.key)));
        let cap = sub.processing.max_items;
        let mut deferred_from = None;
        if cap > 0 && fetched.len() > cap {
            // Items past the cap stay unmarked and are fetched again next run.
            deferred_from = Some(fetched[cap].timestamp);
            debug!(subscription = %sub.id, cap, deferred = fetched.len() - cap, "item cap applied");
            fetched.truncate(cap);
        }

        info!(
            subscription = %sub.id,
            fetched = total,
            already_processed = already.len(),
            forwards_excluded = excluded.len(),
            kept = fetched.len(),
            "intake ready"
        );
        Ok(Intake {
            fetched: total,
            skipped_channels,
            items: fetched,
            excluded,
            deferred_from,
        })
    }

    /// One article per cluster. A cluster whose generation keeps failing is
    /// dropped and its items stay unmarked for the next run.
    async fn generate(
        &self,
        sub: &Subscription,
        clusters: &[Cluster],
        usage: &mut TokenUsage,
    ) -> Result<Generated, RunError> {
        let mut articles = Vec::with_capacity(clusters.len());
        let mut represented = BTreeSet::new();
        let mut dropped = 0;
        let mut dropped_from: Option<DateTime<Utc>> = None;

        for cluster in clusters {
            let (article_type, section) = if cluster.source_count() < sub.processing.min_sources {
                (ArticleType::Brief, BRIEF_SECTION)
            } else {
                (cluster.article_type, cluster.section.as_str())
            };
            let request = ArticleRequest {
                cluster,
                article_type,
                section,
                language: &sub.edition.language,
                publication: &sub.edition.title,
            };

            match self.generate_one(&request, sub.processing.generation_attempts, usage).await? {
                Some(article) => {
                    represented.extend(cluster.keys().cloned());
                    articles.push(article);
                }
                None => {
                    dropped += 1;
                    let oldest = cluster.items.iter().map(|i| i.timestamp).min();
                    dropped_from = [dropped_from, oldest].into_iter().flatten().min();
                    counter!("generation_dropped_clusters_total").increment(1);
                    warn!(subscription = %sub.id, cluster = %cluster.id, items = cluster.items.len(), "cluster dropped");
                }
            }
        }
        Ok(Generated {
            articles,
            represented,
            dropped,
            dropped_from,
        })
    }

    async fn generate_one(
        &self,
        request: &ArticleRequest<'_>,
        attempts: u32,
        usage: &mut TokenUsage,
    ) -> Result<Option<Article>, RunError> {
        let classifier = self.classifier.as_ref();
        for attempt in 1..=attempts.max(1) {
            let reply = match with_backoff(&self.retry, "generate_article", move || {
                classifier.generate_article(request)
            })
            .await
            {
                Ok(reply) => reply,
                Err(e @ PortError::Auth(_)) => return Err(RunError::Classifier(e)),
                Err(e) => {
                    warn!(cluster = %request.cluster.id, attempt, error = %e, "article generation failed");
                    continue;
                }
            };
            *usage += reply.usage;

            match parse_article_reply(&reply.text) {
                Ok(draft) => {
                    return Ok(Some(Article {
                        headline: draft.headline,
                        subheadline: draft.subheadline,
                        body: draft.body,
                        stance_summary: draft.stance_summary,
                        article_type: request.article_type,
                        section: request.section.to_string(),
                        sources: request.cluster.items.iter().map(SourceRef::from).collect(),
                    }))
                }
                Err(e) => {
                    counter!("generation_malformed_replies_total").increment(1);
                    warn!(cluster = %request.cluster.id, attempt, error = %e, "article reply rejected");
                }
            }
        }
        Ok(None)
    }

    fn sinks_for(&self, sub: &Subscription) -> Vec<DynSink> {
        if sub.sinks.is_empty() {
            return self.sinks.clone();
        }
        self.sinks
            .iter()
            .filter(|s| sub.sinks.iter().any(|n| n == s.name()))
            .cloned()
            .collect()
    }
}

fn note_clustering(outcome: &ClusterOutcome, notes: &mut Vec<String>) {
    if outcome.is_degraded() {
        notes.push(format!(
            "{} of {} batch(es) degraded to singletons",
            outcome.degraded_batches, outcome.batches
        ));
    }
    if let MergeStatus::Skipped { reason } = &outcome.merge {
        notes.push(format!("merge pass skipped: {reason}"));
    }
}
