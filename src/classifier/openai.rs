// src/classifier/openai.rs
//! Chat-completions classifier for any OpenAI-compatible endpoint.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ArticleRequest, Classifier, ClusterRequest, ClusterSummary, RawReply};
use crate::config::LlmConfig;
use crate::error::PortError;
use crate::feed::rss::retry_after;
use crate::model::{ArticleType, NormalizedItem, TokenUsage};

/// Characters of item text shown to the model while clustering or filtering.
const PREVIEW_CHARS: usize = 500;

pub struct OpenAiClassifier {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiClassifier {
    /// `cfg` must already be resolved (see [`LlmConfig::resolved`]).
    pub fn new(cfg: &LlmConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("newsroom-digest/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
        })
    }

    fn json_mode(&self) -> bool {
        self.model.to_lowercase().contains("gpt")
    }

    async fn complete(&self, op: &'static str, system: &str, user: &str) -> Result<RawReply, PortError> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct ResponseFormat {
            #[serde(rename = "type")]
            kind: &'static str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
            #[serde(skip_serializing_if = "Option::is_none")]
            response_format: Option<ResponseFormat>,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
            #[serde(default)]
            usage: Option<Usage>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            #[serde(default)]
            content: Option<String>,
        }
        #[derive(Deserialize)]
        struct Usage {
            #[serde(default)]
            prompt_tokens: u64,
            #[serde(default)]
            completion_tokens: u64,
        }

        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: system,
                },
                Msg {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            response_format: self.json_mode().then_some(ResponseFormat { kind: "json_object" }),
        };

        counter!("classifier_calls_total", "op" => op).increment(1);
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| PortError::Transport(format!("{op}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            counter!("classifier_errors_total", "op" => op).increment(1);
            return Err(status_to_error(op, status, retry_after(&resp)));
        }

        let body: Resp = resp
            .json()
            .await
            .map_err(|e| PortError::Malformed(format!("{op}: unreadable completion: {e}")))?;
        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let usage = body
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                calls: 1,
            })
            .unwrap_or(TokenUsage {
                calls: 1,
                ..TokenUsage::default()
            });
        counter!("classifier_tokens_total", "op" => op).increment(usage.total());
        debug!(op, tokens = usage.total(), "completion received");
        Ok(RawReply { text, usage })
    }
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn cluster_batch(&self, request: &ClusterRequest<'_>) -> Result<RawReply, PortError> {
        let system = cluster_prompt(request.sections, request.strict_reminder);
        let user = format!("News items to cluster:\n\n{}", numbered_items(request.items));
        self.complete("cluster", &system, &user).await
    }

    async fn merge_clusters(&self, clusters: &[ClusterSummary]) -> Result<RawReply, PortError> {
        let mut user = String::from("Topic summaries:\n");
        for c in clusters {
            let _ = write!(
                user,
                "\n[{}] Section: {}, Type: {}, Items: {}\nSummary: {}\n",
                c.cluster_id,
                c.section,
                c.article_type.as_str(),
                c.item_count,
                c.summary
            );
        }
        self.complete("merge", MERGE_PROMPT, &user).await
    }

    async fn generate_article(&self, request: &ArticleRequest<'_>) -> Result<RawReply, PortError> {
        let system = article_prompt(request);
        let mut user = String::from("SOURCE MATERIAL:\n");
        for (i, item) in request.cluster.items.iter().enumerate() {
            let _ = write!(
                user,
                "\n[Source {}] {} ({}): {}\n",
                i + 1,
                item.channel_title,
                item.timestamp.format("%Y-%m-%d %H:%M"),
                item.text
            );
        }
        self.complete("article", &system, &user).await
    }

    async fn filter_batch(&self, items: &[NormalizedItem]) -> Result<RawReply, PortError> {
        let user = format!("Messages to review:\n\n{}", numbered_items(items));
        self.complete("filter", FILTER_PROMPT, &user).await
    }
}

fn status_to_error(op: &str, status: StatusCode, retry_after: Option<Duration>) -> PortError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PortError::Auth(format!("{op}: HTTP {status}")),
        StatusCode::TOO_MANY_REQUESTS => PortError::RateLimited { retry_after },
        s if s.is_server_error() => PortError::Transport(format!("{op}: HTTP {status}")),
        _ => PortError::Malformed(format!("{op}: rejected with HTTP {status}")),
    }
}

fn numbered_items(items: &[NormalizedItem]) -> String {
    let mut out = String::new();
    for (i, item) in items.iter().enumerate() {
        let preview = crate::model::excerpt(&item.text, PREVIEW_CHARS);
        let _ = write!(out, "[{}] {}: {}\n\n", i + 1, item.channel_title, preview);
    }
    out
}

fn cluster_prompt(sections: &[String], strict: bool) -> String {
    let mut p = format!(
        r#"You are an editor at a newspaper reviewing incoming news items from multiple sources.

Your task is to:
1. DEDUPLICATE: identify items that report on the same story, even if worded differently.
2. CLUSTER: group related items into coherent topics.
3. CLASSIFY each topic as HARD_NEWS, OPINION, BRIEF or FEATURE.
4. CATEGORIZE each topic into one of these sections: {}

Items from the same channel about the same story are updates; keep them in one topic.
Leave greetings, ads and promotional items out of every topic.

Respond in JSON:
{{
  "topics": [
    {{
      "summary": "Brief description of the story",
      "message_ids": [1, 3, 7],
      "article_type": "HARD_NEWS",
      "section": "Politics"
    }}
  ]
}}"#,
        sections.join(", ")
    );
    if strict {
        p.push_str(
            "\n\nYour previous answer could not be used. Reply with a single JSON object exactly \
             matching the structure above. Every message id must be a number shown in the input, \
             and no id may appear in more than one topic.",
        );
    }
    p
}

const MERGE_PROMPT: &str = r#"You are an editor consolidating topic clusters from separate batches.

Some topics below may be the same story reported in different batches. Identify those and return merge instructions. Only use cluster ids shown in the input.

Respond in JSON:
{
  "merges": [
    {
      "keep": "b0_t2",
      "absorbed": ["b1_t0", "b2_t4"],
      "summary": "Updated summary for the merged topic"
    }
  ]
}
Return {"merges": []} when nothing should be merged."#;

const FILTER_PROMPT: &str = r#"You are a news editor screening incoming messages.

Classify every message as legitimate news content or trash. Trash is greetings, advertisements, donation requests, channel promotion and other content without news value.

Respond in JSON:
{
  "legitimate": [1, 2, 5],
  "trash": [3, 4]
}"#;

fn article_prompt(req: &ArticleRequest<'_>) -> String {
    let publication = req.publication;
    let language = req.language;
    let (role, rules, shape) = match req.article_type {
        ArticleType::HardNews => (
            format!("You are a journalist writing for {publication}. Write a news article based on the source material."),
            "- Use the inverted pyramid: most important facts first\n\
             - Be factual and objective, no editorializing\n\
             - Attribute every claim with an inline citation [Source: Channel Name]\n\
             - Format the body as HTML paragraphs (<p>)",
            r#"{"headline": "...", "subheadline": "...", "body": "..."}"#,
        ),
        ArticleType::Opinion => (
            format!("You are a columnist writing for {publication}. Write an opinion piece based on the commentary in the sources."),
            "- Preserve the stance of the sources and say whose views they are\n\
             - Engaging style suited to opinion journalism\n\
             - Inline citations [Source: Channel Name]\n\
             - Format the body as HTML paragraphs (<p>)",
            r#"{"headline": "...", "subheadline": "...", "stance_summary": "One sentence on the perspective", "body": "..."}"#,
        ),
        ArticleType::Brief => (
            format!("You are writing a brief news item for {publication}."),
            "- One or two sentences with the essential facts\n\
             - One citation [Source: Channel Name]\n\
             - Short headline",
            r#"{"headline": "...", "subheadline": null, "body": "..."}"#,
        ),
        ArticleType::Feature => (
            format!("You are a feature writer for {publication}. Write a longer-form article based on the source material."),
            "- Give context and analysis beyond the bare facts\n\
             - Narrative style while staying informative\n\
             - Inline citations [Source: Channel Name]\n\
             - Format the body as HTML paragraphs (<p>)",
            r#"{"headline": "...", "subheadline": "...", "body": "..."}"#,
        ),
    };
    format!(
        "{role}\n\nREQUIREMENTS:\n- Write in {language}\n{rules}\n\nSection: {}\nTopic: {}\n\nRespond in JSON:\n{shape}",
        req.section, req.cluster.summary
    )
}
