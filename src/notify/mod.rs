// src/notify/mod.rs
//! Delivery sinks. Each sink renders the digest into its own document and
//! sends it; one sink failing never stops the others.

pub mod email;
pub mod html_file;
pub mod render;
pub mod telegram;
pub mod webhook;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{info, warn};

use crate::config::{resolve_secret, SinkConfig, WebhookFlavor};
use crate::model::Digest;

/// A rendered edition, ready for one transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub subject: String,
    pub html: String,
    pub text: String,
    pub generated_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeliverySink: Send + Sync {
    fn name(&self) -> &str;

    fn render(&self, digest: &Digest) -> Result<Document> {
        Ok(render::render_document(digest))
    }

    async fn send(&self, document: &Document) -> Result<()>;
}

pub type DynSink = Arc<dyn DeliverySink>;

/// Per-sink result of one delivery round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    /// `(sink, error)` pairs.
    pub failed: Vec<(String, String)>,
}

impl DeliveryReport {
    pub fn all_failed(&self) -> bool {
        self.delivered.is_empty() && !self.failed.is_empty()
    }
}

/// Fan `digest` out to `sinks`, isolating failures.
pub async fn deliver_all(sinks: &[DynSink], digest: &Digest) -> DeliveryReport {
    let mut report = DeliveryReport {
        delivered: Vec::new(),
        failed: Vec::new(),
    };
    for sink in sinks {
        let name = sink.name().to_string();
        let outcome = match sink.render(digest) {
            Ok(doc) => sink.send(&doc).await,
            Err(e) => Err(e.context("render")),
        };
        match outcome {
            Ok(()) => {
                counter!("delivery_sent_total", "sink" => name.clone()).increment(1);
                info!(sink = %name, edition = %digest.edition_id, "digest delivered");
                report.delivered.push(name);
            }
            Err(e) => {
                counter!("delivery_failures_total", "sink" => name.clone()).increment(1);
                warn!(sink = %name, error = ?e, "delivery failed");
                report.failed.push((name, format!("{e:#}")));
            }
        }
    }
    report
}

/// Build sinks from config, resolving "ENV" secrets.
pub fn build_sinks(configs: &[SinkConfig]) -> Result<Vec<DynSink>> {
    let mut sinks: Vec<DynSink> = Vec::with_capacity(configs.len());
    for cfg in configs {
        let sink: DynSink = match cfg {
            SinkConfig::HtmlFile { name, path } => Arc::new(html_file::HtmlFileSink::new(name.as_str(), path.as_str())?),
            SinkConfig::Email {
                name,
                smtp_host,
                smtp_port,
                security,
                smtp_user,
                smtp_pass,
                from,
                to,
            } => Arc::new(email::EmailSink::new(
                name.as_str(),
                email::SmtpServer {
                    host: smtp_host,
                    port: smtp_port.unwrap_or_else(|| security.default_port()),
                    security: *security,
                },
                resolve_secret(smtp_user, "SMTP_USER")?,
                resolve_secret(smtp_pass, "SMTP_PASS")?,
                from,
                to,
            )?),
            SinkConfig::Webhook { name, flavor, url } => {
                let var = match flavor {
                    WebhookFlavor::Slack => "SLACK_WEBHOOK_URL",
                    WebhookFlavor::Discord => "DISCORD_WEBHOOK_URL",
                };
                Arc::new(webhook::WebhookSink::new(name.as_str(), *flavor, resolve_secret(url, var)?))
            }
            SinkConfig::Telegram {
                name,
                bot_token,
                chat_id,
            } => Arc::new(telegram::TelegramSink::new(
                name.as_str(),
                &resolve_secret(bot_token, "TELEGRAM_BOT_TOKEN")?,
                chat_id.as_str(),
            )?),
        };
        info!(sink = %cfg.name(), "delivery sink configured");
        sinks.push(sink);
    }
    Ok(sinks)
}
