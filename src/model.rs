// src/model.rs
//! Values that flow between the feed, the clusterer, article generation and
//! delivery. All of them live for one run only, except `ItemKey`, which is the
//! identity persisted as a processed mark.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Section that holds briefs and anything the classifier could not place.
pub const BRIEF_SECTION: &str = "In Brief";

/// Section list used when a subscription does not configure its own.
pub const DEFAULT_SECTIONS: &[&str] = &[
    "Breaking News",
    "Politics",
    "World",
    "Business",
    "Technology",
    "Science",
    "Health",
    "Culture",
    "Sports",
    "Opinion",
];

/// Identity of one feed item inside a subscription.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub channel_id: String,
    pub item_id: String,
}

impl ItemKey {
    pub fn new(channel_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            item_id: item_id.into(),
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.channel_id, self.item_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Original,
    /// Reposted from somewhere else; `from` names the origin when the feed knows it.
    Forward { from: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// MIME type or a coarse kind such as "photo".
    pub kind: String,
    pub url: String,
}

/// One feed item after the adapter has cleaned it up. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedItem {
    pub key: ItemKey,
    pub channel_title: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub provenance: Provenance,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub links: Vec<String>,
    pub permalink: Option<String>,
}

impl NormalizedItem {
    pub fn new(
        channel_id: impl Into<String>,
        item_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        text: impl Into<String>,
    ) -> Self {
        let key = ItemKey::new(channel_id, item_id);
        Self {
            channel_title: key.channel_id.clone(),
            key,
            timestamp,
            text: text.into(),
            provenance: Provenance::Original,
            attachments: Vec::new(),
            links: Vec::new(),
            permalink: None,
        }
    }

    pub fn is_forward(&self) -> bool {
        matches!(self.provenance, Provenance::Forward { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArticleType {
    HardNews,
    Opinion,
    Brief,
    Feature,
}

impl ArticleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArticleType::HardNews => "HARD_NEWS",
            ArticleType::Opinion => "OPINION",
            ArticleType::Brief => "BRIEF",
            ArticleType::Feature => "FEATURE",
        }
    }

    /// Accepts the wire labels in any case, with `-` or space for `_`.
    pub fn from_label(label: &str) -> Option<Self> {
        let norm = label.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        match norm.as_str() {
            "HARD_NEWS" | "NEWS" => Some(ArticleType::HardNews),
            "OPINION" => Some(ArticleType::Opinion),
            "BRIEF" => Some(ArticleType::Brief),
            "FEATURE" => Some(ArticleType::Feature),
            _ => None,
        }
    }
}

/// A group of items the classifier judged to be about the same story.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub id: String,
    pub items: Vec<NormalizedItem>,
    pub summary: String,
    pub section: String,
    pub article_type: ArticleType,
}

impl Cluster {
    /// A single item filed as a brief.
    pub fn singleton(id: impl Into<String>, item: NormalizedItem) -> Self {
        Self {
            id: id.into(),
            summary: excerpt(&item.text, 100),
            items: vec![item],
            section: BRIEF_SECTION.to_string(),
            article_type: ArticleType::Brief,
        }
    }

    /// Number of distinct channels backing this cluster.
    pub fn source_count(&self) -> usize {
        self.items
            .iter()
            .map(|i| i.key.channel_id.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn earliest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.items.iter().map(|i| i.timestamp).min()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ItemKey> {
        self.items.iter().map(|i| &i.key)
    }
}

/// Pass-2 output: fold every cluster in `absorbed` into `keep`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeInstruction {
    pub keep: String,
    pub absorbed: BTreeSet<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRef {
    pub key: ItemKey,
    pub channel_title: String,
    pub timestamp: DateTime<Utc>,
    pub link: Option<String>,
}

impl From<&NormalizedItem> for SourceRef {
    fn from(item: &NormalizedItem) -> Self {
        Self {
            key: item.key.clone(),
            channel_title: item.channel_title.clone(),
            timestamp: item.timestamp,
            link: item.permalink.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Article {
    pub headline: String,
    pub subheadline: Option<String>,
    pub body: String,
    pub stance_summary: Option<String>,
    pub article_type: ArticleType,
    pub section: String,
    pub sources: Vec<SourceRef>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub calls: u64,
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
        self.calls += rhs.calls;
    }
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestSection {
    pub name: String,
    pub articles: Vec<Article>,
}

/// One delivered edition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Digest {
    pub edition_id: Uuid,
    pub subscription_id: String,
    pub title: String,
    pub tagline: String,
    pub language: String,
    pub generated_at: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub sections: Vec<DigestSection>,
    pub items_considered: usize,
    pub channel_count: usize,
    pub degraded: bool,
    pub token_usage: TokenUsage,
}

impl Digest {
    pub fn article_count(&self) -> usize {
        self.sections.iter().map(|s| s.articles.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.article_count() == 0
    }

    pub fn articles(&self) -> impl Iterator<Item = &Article> {
        self.sections.iter().flat_map(|s| s.articles.iter())
    }
}

/// First `max_chars` characters of `text`, with an ellipsis when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}
