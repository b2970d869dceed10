// src/notify/telegram.rs
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{DeliverySink, Document};
use crate::model::excerpt;

/// Bot API limit for one message.
const MESSAGE_MAX: usize = 4000;

/// Sends the plain-text summary to a chat via the Bot API `sendMessage`.
pub struct TelegramSink {
    name: String,
    endpoint: String,
    chat_id: String,
    client: Client,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Deserialize)]
struct ApiReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramSink {
    pub fn new(name: impl Into<String>, bot_token: &str, chat_id: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("building telegram client")?;
        Ok(Self {
            name: name.into(),
            endpoint: format!("https://api.telegram.org/bot{bot_token}/sendMessage"),
            chat_id: chat_id.into(),
            client,
        })
    }
}

#[async_trait]
impl DeliverySink for TelegramSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, doc: &Document) -> Result<()> {
        let text = excerpt(&doc.text, MESSAGE_MAX);
        let body = SendMessage {
            chat_id: &self.chat_id,
            text: &text,
            disable_web_page_preview: true,
        };
        let rsp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            // The URL carries the token; keep it out of logs.
            .map_err(|e| anyhow!("telegram request failed: {}", e.without_url()))?;
        let status = rsp.status();
        let reply: ApiReply = rsp
            .json()
            .await
            .map_err(|e| anyhow!("telegram reply unreadable (HTTP {status}): {}", e.without_url()))?;
        if !reply.ok {
            return Err(anyhow!(
                "telegram rejected message (HTTP {status}): {}",
                reply.description.unwrap_or_default()
            ));
        }
        Ok(())
    }
}
