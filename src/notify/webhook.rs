// src/notify/webhook.rs
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use super::{DeliverySink, Document};
use crate::config::WebhookFlavor;
use crate::model::excerpt;

/// Discord rejects embed descriptions above 4096 characters.
const DISCORD_DESCRIPTION_MAX: usize = 4000;
/// Slack truncates long messages; keep the summary readable.
const SLACK_TEXT_MAX: usize = 3500;

/// Posts the plain-text summary to a Slack or Discord incoming webhook.
#[derive(Clone)]
pub struct WebhookSink {
    name: String,
    flavor: WebhookFlavor,
    url: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl WebhookSink {
    pub fn new(name: impl Into<String>, flavor: WebhookFlavor, url: String) -> Self {
        Self {
            name: name.into(),
            flavor,
            url,
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    fn payload(&self, doc: &Document) -> serde_json::Value {
        match self.flavor {
            WebhookFlavor::Slack => serde_json::json!({
                "text": excerpt(&doc.text, SLACK_TEXT_MAX),
            }),
            WebhookFlavor::Discord => serde_json::to_value(DiscordWebhookPayload::embed(
                &doc.subject,
                &excerpt(&doc.text, DISCORD_DESCRIPTION_MAX),
            ))
            .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl DeliverySink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, doc: &Document) -> Result<()> {
        let payload = self.payload(doc);
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await;

            let err = match res {
                Ok(rsp) => match rsp.error_for_status_ref() {
                    Ok(_) => return Ok(()),
                    Err(e) => anyhow!("webhook HTTP error: {e}"),
                },
                Err(e) => anyhow!("webhook request failed: {e}"),
            };
            if attempt >= self.max_retries {
                return Err(err);
            }
            debug!(sink = %self.name, attempt, error = %err, "webhook attempt failed, retrying");
            tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
        }
    }
}

#[derive(Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
}

#[derive(Serialize)]
struct DiscordWebhookPayload {
    content: Option<String>,
    embeds: Vec<DiscordEmbed>,
}

impl DiscordWebhookPayload {
    fn embed(title: &str, description: &str) -> Self {
        Self {
            content: None,
            embeds: vec![DiscordEmbed {
                title: title.to_string(),
                description: description.to_string(),
            }],
        }
    }
}
