// src/cluster/schema.rs
//! Strict parsing of classifier replies. Nothing past this module sees raw
//! model output.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use thiserror::Error;

use crate::model::{ArticleType, MergeInstruction, BRIEF_SECTION};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed classifier response: {0}")]
pub struct MalformedResponse(pub String);

fn malformed(msg: impl Into<String>) -> MalformedResponse {
    MalformedResponse(msg.into())
}

/// Strip a surrounding markdown code fence (```json ... ```), if any.
pub fn strip_code_fences(raw: &str) -> &str {
    let s = raw.trim();
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    // Drop the info string ("json") on the opening line.
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

#[derive(Debug, Deserialize)]
struct RawClusterReply {
    topics: Vec<RawTopic>,
}

#[derive(Debug, Deserialize)]
struct RawTopic {
    #[serde(default)]
    summary: String,
    message_ids: Vec<u32>,
    #[serde(default)]
    article_type: Option<String>,
    #[serde(default)]
    section: Option<String>,
}

/// One topic from a pass-1 reply, positions already 0-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicAssignment {
    pub summary: String,
    pub members: Vec<usize>,
    pub article_type: ArticleType,
    pub section: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchPartition {
    pub topics: Vec<TopicAssignment>,
    /// Positions no topic claimed, ascending.
    pub unassigned: Vec<usize>,
}

/// Validate a pass-1 reply for a batch of `batch_len` items numbered 1..=batch_len.
///
/// Rejects ids outside the batch and ids claimed by two topics. Repeats inside
/// one topic collapse; topics with no ids are ignored.
pub fn parse_cluster_reply(
    raw: &str,
    batch_len: usize,
    sections: &[String],
) -> Result<BatchPartition, MalformedResponse> {
    let reply: RawClusterReply = serde_json::from_str(strip_code_fences(raw))
        .map_err(|e| malformed(format!("cluster reply is not valid JSON: {e}")))?;

    let mut owner: Vec<Option<usize>> = vec![None; batch_len];
    let mut topics = Vec::new();

    for (topic_idx, topic) in reply.topics.into_iter().enumerate() {
        let mut members = BTreeSet::new();
        for id in topic.message_ids {
            let id = id as usize;
            if id == 0 || id > batch_len {
                return Err(malformed(format!(
                    "item id {id} is outside the batch (1..={batch_len})"
                )));
            }
            let pos = id - 1;
            match owner[pos] {
                Some(other) if other != topic_idx => {
                    return Err(malformed(format!("item id {id} is claimed by two topics")));
                }
                _ => owner[pos] = Some(topic_idx),
            }
            members.insert(pos);
        }
        if members.is_empty() {
            continue;
        }
        topics.push(TopicAssignment {
            summary: topic.summary.trim().to_string(),
            members: members.into_iter().collect(),
            article_type: topic
                .article_type
                .as_deref()
                .and_then(ArticleType::from_label)
                .unwrap_or(ArticleType::HardNews),
            section: resolve_section(topic.section.as_deref(), sections),
        });
    }

    let unassigned = owner
        .iter()
        .enumerate()
        .filter_map(|(pos, o)| o.is_none().then_some(pos))
        .collect();

    Ok(BatchPartition { topics, unassigned })
}

/// Map a model-chosen section onto the configured list, case-insensitively.
/// Anything unknown lands in the brief section.
pub fn resolve_section(section: Option<&str>, candidates: &[String]) -> String {
    let Some(s) = section.map(str::trim).filter(|s| !s.is_empty()) else {
        return BRIEF_SECTION.to_string();
    };
    if s.eq_ignore_ascii_case(BRIEF_SECTION) {
        return BRIEF_SECTION.to_string();
    }
    if candidates.is_empty() {
        return s.to_string();
    }
    candidates
        .iter()
        .find(|c| c.eq_ignore_ascii_case(s))
        .cloned()
        .unwrap_or_else(|| BRIEF_SECTION.to_string())
}

#[derive(Debug, Deserialize)]
struct RawMergeReply {
    merges: Vec<RawMerge>,
}

#[derive(Debug, Deserialize)]
struct RawMerge {
    keep: String,
    #[serde(alias = "merge_into_it", alias = "absorb")]
    absorbed: Vec<String>,
    #[serde(default, alias = "combined_summary")]
    summary: Option<String>,
}

/// Validate a pass-2 reply. Every referenced id must satisfy `is_known`.
pub fn parse_merge_reply<F>(raw: &str, is_known: F) -> Result<Vec<MergeInstruction>, MalformedResponse>
where
    F: Fn(&str) -> bool,
{
    let reply: RawMergeReply = serde_json::from_str(strip_code_fences(raw))
        .map_err(|e| malformed(format!("merge reply is not valid JSON: {e}")))?;

    let mut out = Vec::with_capacity(reply.merges.len());
    for m in reply.merges {
        for id in std::iter::once(&m.keep).chain(m.absorbed.iter()) {
            if !is_known(id) {
                return Err(malformed(format!("merge references unknown cluster {id:?}")));
            }
        }
        let mut absorbed: BTreeSet<String> = m.absorbed.into_iter().collect();
        absorbed.remove(&m.keep);
        if absorbed.is_empty() {
            continue;
        }
        out.push(MergeInstruction {
            keep: m.keep,
            absorbed,
            summary: m
                .summary
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        });
    }
    Ok(out)
}

#[derive(Debug, Deserialize)]
struct RawArticle {
    headline: String,
    #[serde(default)]
    subheadline: Option<String>,
    body: String,
    #[serde(default)]
    stance_summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleDraft {
    pub headline: String,
    pub subheadline: Option<String>,
    pub body: String,
    pub stance_summary: Option<String>,
}

pub fn parse_article_reply(raw: &str) -> Result<ArticleDraft, MalformedResponse> {
    let a: RawArticle = serde_json::from_str(strip_code_fences(raw))
        .map_err(|e| malformed(format!("article reply is not valid JSON: {e}")))?;
    let headline = a.headline.trim().to_string();
    let body = a.body.trim().to_string();
    if headline.is_empty() || body.is_empty() {
        return Err(malformed("article has an empty headline or body"));
    }
    let non_empty = |s: Option<String>| s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    Ok(ArticleDraft {
        headline,
        subheadline: non_empty(a.subheadline),
        body,
        stance_summary: non_empty(a.stance_summary),
    })
}

#[derive(Debug, Deserialize)]
struct RawFilterReply {
    #[serde(default)]
    legitimate: Vec<u32>,
    #[serde(default)]
    trash: Vec<u32>,
}

/// Positions (0-based) the model flagged as noise. Ids listed as both
/// legitimate and trash are kept.
pub fn parse_filter_reply(raw: &str, batch_len: usize) -> Result<BTreeSet<usize>, MalformedResponse> {
    let r: RawFilterReply = serde_json::from_str(strip_code_fences(raw))
        .map_err(|e| malformed(format!("filter reply is not valid JSON: {e}")))?;

    let mut verdict: BTreeMap<usize, bool> = BTreeMap::new();
    for (ids, is_trash) in [(&r.trash, true), (&r.legitimate, false)] {
        for &id in ids {
            let id = id as usize;
            if id == 0 || id > batch_len {
                return Err(malformed(format!(
                    "item id {id} is outside the batch (1..={batch_len})"
                )));
            }
            // Legitimate is applied last so it wins.
            verdict.insert(id - 1, is_trash);
        }
    }
    Ok(verdict
        .into_iter()
        .filter_map(|(pos, trash)| trash.then_some(pos))
        .collect())
}
