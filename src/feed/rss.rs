// src/feed/rss.rs
//! RSS 2.0 feed source. A channel id is the feed URL.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{normalize_text, FeedSource};
use crate::error::PortError;
use crate::model::{Attachment, NormalizedItem, Provenance};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(default)]
    title: Option<String>,
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<Guid>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    /// Set by feeds that republish other sources.
    source: Option<ItemSource>,
    #[serde(rename = "enclosure", default)]
    enclosures: Vec<Enclosure>,
}

#[derive(Debug, Deserialize)]
struct Guid {
    #[serde(rename = "$text")]
    value: String,
}

#[derive(Debug, Deserialize)]
struct ItemSource {
    #[serde(rename = "@url")]
    url: Option<String>,
    #[serde(rename = "$text", default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Enclosure {
    #[serde(rename = "@url")]
    url: String,
    #[serde(rename = "@type", default)]
    kind: Option<String>,
}

pub struct RssFeed {
    client: reqwest::Client,
}

impl RssFeed {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("newsroom-digest/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Parse a feed document and keep items published in `[since, until)`.
    pub fn parse_items(
        channel_id: &str,
        xml: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<NormalizedItem>, PortError> {
        let t0 = Instant::now();
        let xml_clean = scrub_html_entities_for_xml(xml);
        let rss: Rss = from_str(&xml_clean).map_err(|e| PortError::ChannelAccess {
            channel: channel_id.to_string(),
            reason: format!("unparsable feed: {e}"),
        })?;

        let channel_title = rss
            .channel
            .title
            .as_deref()
            .map(normalize_text)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| channel_id.to_string());

        let mut out = Vec::with_capacity(rss.channel.item.len());
        for it in rss.channel.item {
            let Some(timestamp) = it
                .pub_date
                .as_deref()
                .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
                .map(|d| d.with_timezone(&Utc))
            else {
                counter!("feed_items_undated_total").increment(1);
                continue;
            };
            if timestamp < since || timestamp >= until {
                continue;
            }

            let text = normalize_text(&format!(
                "{}. {}",
                it.title.as_deref().unwrap_or_default(),
                it.description.as_deref().unwrap_or_default()
            ));
            let text = text.trim_start_matches(". ").to_string();
            if text.is_empty() {
                continue;
            }

            let item_id = it
                .guid
                .map(|g| g.value.trim().to_string())
                .filter(|g| !g.is_empty())
                .or_else(|| it.link.clone())
                .unwrap_or_else(|| format!("{}#{}", timestamp.timestamp(), text.len()));

            let provenance = match it.source {
                Some(src) => Provenance::Forward {
                    from: src.name.filter(|n| !n.trim().is_empty()).or(src.url),
                },
                None => Provenance::Original,
            };

            let mut item = NormalizedItem::new(channel_id, item_id, timestamp, text);
            item.channel_title = channel_title.clone();
            item.provenance = provenance;
            item.permalink = it.link.clone();
            item.links = it.link.into_iter().collect();
            item.attachments = it
                .enclosures
                .into_iter()
                .map(|e| Attachment {
                    kind: e.kind.unwrap_or_else(|| "file".to_string()),
                    url: e.url,
                })
                .collect();
            out.push(item);
        }

        histogram!("feed_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        counter!("feed_items_total").increment(out.len() as u64);
        Ok(out)
    }
}

#[async_trait]
impl FeedSource for RssFeed {
    fn name(&self) -> &'static str {
        "rss"
    }

    async fn fetch(
        &self,
        channel_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<NormalizedItem>, PortError> {
        let resp = self.client.get(channel_id).send().await.map_err(|e| {
            counter!("feed_errors_total").increment(1);
            tracing::warn!(error = ?e, channel = channel_id, "feed http error");
            PortError::Transport(e.to_string())
        })?;

        let status = resp.status();
        if !status.is_success() {
            counter!("feed_errors_total").increment(1);
            return Err(status_to_error(channel_id, status, retry_after(&resp)));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| PortError::Transport(format!("reading feed body: {e}")))?;
        Self::parse_items(channel_id, &body, since, until)
    }
}

pub(crate) fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn status_to_error(channel: &str, status: StatusCode, retry_after: Option<Duration>) -> PortError {
    match status {
        StatusCode::UNAUTHORIZED => PortError::Auth(format!("{channel}: HTTP {status}")),
        StatusCode::TOO_MANY_REQUESTS => PortError::RateLimited { retry_after },
        StatusCode::FORBIDDEN | StatusCode::NOT_FOUND | StatusCode::GONE => PortError::ChannelAccess {
            channel: channel.to_string(),
            reason: format!("HTTP {status}"),
        },
        s if s.is_server_error() => PortError::Transport(format!("{channel}: HTTP {status}")),
        _ => PortError::ChannelAccess {
            channel: channel.to_string(),
            reason: format!("unexpected HTTP {status}"),
        },
    }
}

/// HTML entities that are not valid XML and show up in real feeds.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
}
