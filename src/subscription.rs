// src/subscription.rs
//! A subscription: which channels to read, when, and how to shape the digest.
//! Built from configuration and immutable while a run uses it.

use crate::model::{BRIEF_SECTION, DEFAULT_SECTIONS};
use crate::schedule::ScheduleSpec;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingParams {
    pub batch_size: usize,
    /// 0 means no cap.
    pub max_items: usize,
    /// Clusters backed by fewer distinct channels are written as briefs.
    pub min_sources: usize,
    pub include_forwards: bool,
    pub filter_noise: bool,
    /// Attempts per cluster before it is dropped from the digest.
    pub generation_attempts: u32,
}

impl Default for ProcessingParams {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_items: 0,
            min_sources: 2,
            include_forwards: true,
            filter_noise: false,
            generation_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditionParams {
    pub title: String,
    pub tagline: String,
    pub language: String,
    /// Section order for the digest; also the candidates offered to the classifier.
    pub sections: Vec<String>,
}

impl Default for EditionParams {
    fn default() -> Self {
        Self {
            title: "The Evening Digest".to_string(),
            tagline: "All the news that's fit to aggregate".to_string(),
            language: "English".to_string(),
            sections: DEFAULT_SECTIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EditionParams {
    /// Section candidates including the brief section, without duplicates.
    pub fn section_candidates(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.sections.len() + 1);
        for s in &self.sections {
            if !out.iter().any(|o| o.eq_ignore_ascii_case(s)) {
                out.push(s.clone());
            }
        }
        if !out.iter().any(|o| o.eq_ignore_ascii_case(BRIEF_SECTION)) {
            out.push(BRIEF_SECTION.to_string());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: String,
    /// Channel ids in configured order.
    pub channels: Vec<String>,
    pub schedule: ScheduleSpec,
    pub processing: ProcessingParams,
    pub edition: EditionParams,
    /// Names of delivery sinks this subscription sends to.
    pub sinks: Vec<String>,
}
