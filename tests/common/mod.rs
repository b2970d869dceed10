// tests/common/mod.rs
// Fakes for the feed, classifier and sink ports plus small builders.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};

use newsroom_digest::classifier::{ArticleRequest, Classifier, ClusterRequest, ClusterSummary, RawReply};
use newsroom_digest::error::PortError;
use newsroom_digest::feed::FeedSource;
use newsroom_digest::model::{NormalizedItem, Provenance};
use newsroom_digest::notify::{DeliverySink, Document};
use newsroom_digest::schedule::{DailySlot, Fire, Recurrence, ScheduleSpec, WindowMode};
use newsroom_digest::subscription::{EditionParams, ProcessingParams, Subscription};

pub fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

pub fn item(channel: &str, id: &str, at: DateTime<Utc>, text: &str) -> NormalizedItem {
    NormalizedItem::new(channel, id, at, text)
}

pub fn forward(channel: &str, id: &str, at: DateTime<Utc>, text: &str) -> NormalizedItem {
    let mut i = item(channel, id, at, text);
    i.provenance = Provenance::Forward { from: Some("elsewhere".into()) };
    i
}

/// `n` items on `channel`, one minute apart starting at `start`.
pub fn items(channel: &str, n: usize, start: DateTime<Utc>) -> Vec<NormalizedItem> {
    (0..n)
        .map(|i| {
            item(
                channel,
                &format!("{channel}-{i}"),
                start + Duration::minutes(i as i64),
                &format!("story {i} from {channel}"),
            )
        })
        .collect()
}

/// Daily 18:00 UTC, 24h lookback.
pub fn daily_18_utc() -> ScheduleSpec {
    ScheduleSpec {
        recurrence: Recurrence::DailyMulti {
            slots: vec![DailySlot {
                at: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
                lookback: None,
            }],
        },
        timezone: chrono_tz::UTC,
        default_lookback: Duration::hours(24),
        window_mode: WindowMode::SinceLast,
    }
}

pub fn subscription(id: &str, channels: &[&str]) -> Subscription {
    Subscription {
        id: id.to_string(),
        channels: channels.iter().map(|c| c.to_string()).collect(),
        schedule: daily_18_utc(),
        processing: ProcessingParams {
            min_sources: 1,
            ..ProcessingParams::default()
        },
        edition: EditionParams::default(),
        sinks: Vec::new(),
    }
}

pub fn fire(at: DateTime<Utc>) -> Fire {
    Fire {
        at,
        lookback: Duration::hours(24),
        skipped: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeFeed {
    channels: Mutex<HashMap<String, Result<Vec<NormalizedItem>, PortError>>>,
    pub calls: AtomicUsize,
}

impl FakeFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, channel: &str, items: Vec<NormalizedItem>) {
        self.channels.lock().unwrap().insert(channel.to_string(), Ok(items));
    }

    pub fn fail(&self, channel: &str, err: PortError) {
        self.channels.lock().unwrap().insert(channel.to_string(), Err(err));
    }
}

#[async_trait]
impl FeedSource for FakeFeed {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn fetch(
        &self,
        channel_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<NormalizedItem>, PortError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.channels.lock().unwrap().get(channel_id) {
            None => Ok(Vec::new()),
            Some(Err(e)) => Err(e.clone()),
            Some(Ok(items)) => Ok(items
                .iter()
                .filter(|i| i.timestamp >= since && i.timestamp < until)
                .cloned()
                .collect()),
        }
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

type Script = Mutex<VecDeque<Result<String, PortError>>>;

/// Replies are taken from per-operation queues. An empty queue falls back to
/// a well-formed default: no topics, no merges, a valid article, no trash.
#[derive(Default)]
pub struct ScriptedClassifier {
    cluster: Script,
    merge: Script,
    article: Script,
    filter: Script,
    unreachable: bool,
    pub cluster_calls: AtomicUsize,
    pub merge_calls: AtomicUsize,
    pub article_calls: AtomicUsize,
    pub filter_calls: AtomicUsize,
    pub strict_flags: Mutex<Vec<bool>>,
    pub merge_inputs: Mutex<Vec<Vec<ClusterSummary>>>,
}

impl ScriptedClassifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every call fails with a transport error.
    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            unreachable: true,
            ..Self::default()
        })
    }

    pub fn push_cluster(&self, reply: impl Into<String>) {
        self.cluster.lock().unwrap().push_back(Ok(reply.into()));
    }

    pub fn push_cluster_err(&self, err: PortError) {
        self.cluster.lock().unwrap().push_back(Err(err));
    }

    pub fn push_merge(&self, reply: impl Into<String>) {
        self.merge.lock().unwrap().push_back(Ok(reply.into()));
    }

    pub fn push_article(&self, reply: impl Into<String>) {
        self.article.lock().unwrap().push_back(Ok(reply.into()));
    }

    pub fn push_article_err(&self, err: PortError) {
        self.article.lock().unwrap().push_back(Err(err));
    }

    pub fn push_filter(&self, reply: impl Into<String>) {
        self.filter.lock().unwrap().push_back(Ok(reply.into()));
    }

    fn next(&self, script: &Script, fallback: impl FnOnce() -> String) -> Result<RawReply, PortError> {
        if self.unreachable {
            return Err(PortError::Transport("connection refused".into()));
        }
        match script.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(RawReply::new(text)),
            Some(Err(e)) => Err(e),
            None => Ok(RawReply::new(fallback())),
        }
    }
}

pub fn article_json(headline: &str) -> String {
    serde_json::json!({
        "headline": headline,
        "subheadline": "sub",
        "body": format!("<p>{headline}</p>"),
    })
    .to_string()
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn cluster_batch(&self, request: &ClusterRequest<'_>) -> Result<RawReply, PortError> {
        self.cluster_calls.fetch_add(1, Ordering::SeqCst);
        self.strict_flags.lock().unwrap().push(request.strict_reminder);
        self.next(&self.cluster, || r#"{"topics": []}"#.to_string())
    }

    async fn merge_clusters(&self, clusters: &[ClusterSummary]) -> Result<RawReply, PortError> {
        self.merge_calls.fetch_add(1, Ordering::SeqCst);
        self.merge_inputs.lock().unwrap().push(clusters.to_vec());
        self.next(&self.merge, || r#"{"merges": []}"#.to_string())
    }

    async fn generate_article(&self, request: &ArticleRequest<'_>) -> Result<RawReply, PortError> {
        self.article_calls.fetch_add(1, Ordering::SeqCst);
        let headline = request.cluster.summary.clone();
        self.next(&self.article, move || article_json(&headline))
    }

    async fn filter_batch(&self, _items: &[NormalizedItem]) -> Result<RawReply, PortError> {
        self.filter_calls.fetch_add(1, Ordering::SeqCst);
        self.next(&self.filter, || r#"{"legitimate": [], "trash": []}"#.to_string())
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

pub struct RecordingSink {
    name: String,
    fail: bool,
    pub sent: Mutex<Vec<Document>>,
}

impl RecordingSink {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: false,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: true,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, document: &Document) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("sink {} is down", self.name);
        }
        self.sent.lock().unwrap().push(document.clone());
        Ok(())
    }
}

/// JSON for one pass-1 topic.
pub fn topic(summary: &str, ids: &[u32], article_type: &str, section: &str) -> serde_json::Value {
    serde_json::json!({
        "summary": summary,
        "message_ids": ids,
        "article_type": article_type,
        "section": section,
    })
}

pub fn topics(list: Vec<serde_json::Value>) -> String {
    serde_json::json!({ "topics": list }).to_string()
}
