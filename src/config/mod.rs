// src/config/mod.rs
//! TOML configuration.
//!
//! Lookup order:
//! 1) $DIGEST_CONFIG_PATH
//! 2) config/digest.toml
//!
//! Secrets given as `"ENV"` are read from a well-known environment variable;
//! `"env:NAME"` reads from `NAME`.

pub mod llm;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail, Context, Result};
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::info;

use crate::retry::RetryPolicy;
use crate::schedule::{
    parse_lookback, parse_time_of_day, parse_weekday, DailySlot, Recurrence, ScheduleSpec, WindowMode,
};
use crate::subscription::{EditionParams, ProcessingParams, Subscription};

pub use llm::LlmConfig;

pub const ENV_CONFIG_PATH: &str = "DIGEST_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/digest.toml";

/// Upper bound for `missed_fire_tolerance_mins`.
const MAX_TOLERANCE_MINS: i64 = 24 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub feed: FeedSection,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionToml>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub state_path: PathBuf,
    pub tick_secs: u64,
    pub max_concurrent_runs: usize,
    pub missed_fire_tolerance_mins: i64,
    pub shutdown_grace_secs: u64,
    /// Watch the config file and swap subscriptions when it changes.
    pub hot_reload: bool,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("data/digest.db"),
            tick_secs: 30,
            max_concurrent_runs: 4,
            missed_fire_tolerance_mins: crate::schedule::DEFAULT_MISSED_FIRE_TOLERANCE_MINS,
            shutdown_grace_secs: 60,
            hot_reload: true,
        }
    }
}

impl DaemonSection {
    pub fn to_daemon_config(&self) -> crate::daemon::DaemonConfig {
        crate::daemon::DaemonConfig {
            tick_interval: Duration::from_secs(self.tick_secs.max(1)),
            max_concurrent_runs: self.max_concurrent_runs.max(1),
            missed_fire_tolerance: chrono::Duration::minutes(
                self.missed_fire_tolerance_mins.clamp(0, MAX_TOLERANCE_MINS),
            ),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub feed_max_concurrent: usize,
    pub feed_min_spacing_ms: u64,
    pub classifier_max_concurrent: usize,
    pub classifier_min_spacing_ms: u64,
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            feed_max_concurrent: 4,
            feed_min_spacing_ms: 250,
            classifier_max_concurrent: 2,
            classifier_min_spacing_ms: 500,
            retry_attempts: 3,
            retry_base_ms: 500,
            retry_max_ms: 30_000,
        }
    }
}

impl LimitsSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedSection {
    pub timeout_secs: u64,
}

impl Default for FeedSection {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    HtmlFile {
        name: String,
        /// strftime placeholders are filled from the edition's generation date.
        path: String,
    },
    Email {
        name: String,
        smtp_host: String,
        /// Defaults to the usual port for `security`.
        #[serde(default)]
        smtp_port: Option<u16>,
        #[serde(default)]
        security: SmtpSecurity,
        #[serde(default = "env_marker")]
        smtp_user: String,
        #[serde(default = "env_marker")]
        smtp_pass: String,
        from: String,
        to: Vec<String>,
    },
    Webhook {
        name: String,
        flavor: WebhookFlavor,
        #[serde(default = "env_marker")]
        url: String,
    },
    Telegram {
        name: String,
        #[serde(default = "env_marker")]
        bot_token: String,
        chat_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookFlavor {
    Slack,
    Discord,
}

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmtpSecurity {
    /// Plain connect, then upgrade with STARTTLS.
    #[default]
    Starttls,
    /// TLS from the first byte.
    Tls,
}

impl SmtpSecurity {
    pub fn default_port(self) -> u16 {
        match self {
            SmtpSecurity::Starttls => 587,
            SmtpSecurity::Tls => 465,
        }
    }
}

fn env_marker() -> String {
    "ENV".to_string()
}

impl SinkConfig {
    pub fn name(&self) -> &str {
        match self {
            SinkConfig::HtmlFile { name, .. }
            | SinkConfig::Email { name, .. }
            | SinkConfig::Webhook { name, .. }
            | SinkConfig::Telegram { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionToml {
    pub id: String,
    pub channels: Vec<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_lookback")]
    pub lookback: String,
    #[serde(default)]
    pub window: WindowToml,
    pub schedule: ScheduleToml,
    #[serde(default)]
    pub processing: ProcessingToml,
    #[serde(default)]
    pub edition: EditionToml,
    #[serde(default)]
    pub sinks: Vec<String>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_lookback() -> String {
    "24 hours".to_string()
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowToml {
    #[default]
    SinceLast,
    Full,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleToml {
    Daily {
        times: Vec<SlotToml>,
    },
    Weekly {
        day: DayToml,
        time: String,
        #[serde(default)]
        lookback: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SlotToml {
    At(String),
    Detailed {
        at: String,
        #[serde(default)]
        lookback: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DayToml {
    Index(u8),
    Name(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingToml {
    pub batch_size: usize,
    pub max_items: usize,
    pub min_sources: usize,
    pub include_forwards: bool,
    #[serde(alias = "filter_trash")]
    pub filter_noise: bool,
    pub generation_attempts: u32,
}

impl Default for ProcessingToml {
    fn default() -> Self {
        let p = ProcessingParams::default();
        Self {
            batch_size: p.batch_size,
            max_items: p.max_items,
            min_sources: p.min_sources,
            include_forwards: p.include_forwards,
            filter_noise: p.filter_noise,
            generation_attempts: p.generation_attempts,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EditionToml {
    pub title: Option<String>,
    pub tagline: Option<String>,
    pub language: Option<String>,
    pub sections: Option<Vec<String>>,
}

impl AppConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("parsing digest config TOML")
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("in {}", path.display()))
    }

    /// Validate subscriptions and convert them into domain values.
    pub fn subscriptions(&self) -> Result<Vec<Subscription>> {
        let sink_names: HashSet<&str> = self.sinks.iter().map(|s| s.name()).collect();
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(self.subscriptions.len());
        for raw in &self.subscriptions {
            let sub = raw
                .to_subscription()
                .with_context(|| format!("subscription {:?}", raw.id))?;
            if !seen.insert(sub.id.clone()) {
                bail!("duplicate subscription id {:?}", sub.id);
            }
            if let Some(unknown) = sub.sinks.iter().find(|n| !sink_names.contains(n.as_str())) {
                bail!("subscription {:?} names unknown sink {unknown:?}", sub.id);
            }
            out.push(sub);
        }
        Ok(out)
    }
}

impl SubscriptionToml {
    pub fn to_subscription(&self) -> Result<Subscription> {
        let id = self.id.trim().to_string();
        if id.is_empty() {
            bail!("subscription id must not be empty");
        }

        let mut channels: Vec<String> = Vec::with_capacity(self.channels.len());
        for c in &self.channels {
            let c = c.trim();
            if !c.is_empty() && !channels.iter().any(|x| x == c) {
                channels.push(c.to_string());
            }
        }
        if channels.is_empty() {
            bail!("at least one channel is required");
        }

        let timezone: Tz = self
            .timezone
            .trim()
            .parse()
            .map_err(|_| anyhow!("unknown timezone {:?}", self.timezone))?;
        let default_lookback = parse_lookback(&self.lookback)?;

        let recurrence = match &self.schedule {
            ScheduleToml::Daily { times } => {
                if times.is_empty() {
                    bail!("daily schedule needs at least one time");
                }
                let mut slots = Vec::with_capacity(times.len());
                for t in times {
                    let (at, lookback) = match t {
                        SlotToml::At(at) => (at, None),
                        SlotToml::Detailed { at, lookback } => (at, lookback.as_deref()),
                    };
                    slots.push(DailySlot {
                        at: parse_time_of_day(at)?,
                        lookback: lookback.map(parse_lookback).transpose()?,
                    });
                }
                Recurrence::DailyMulti { slots }
            }
            ScheduleToml::Weekly {
                day,
                time,
                lookback,
            } => Recurrence::Weekly {
                day: match day {
                    DayToml::Index(n) => parse_weekday(&n.to_string())?,
                    DayToml::Name(s) => parse_weekday(s)?,
                },
                at: parse_time_of_day(time)?,
                lookback: match lookback {
                    Some(l) => parse_lookback(l)?,
                    None => chrono::Duration::weeks(1),
                },
            },
        };

        let p = &self.processing;
        if p.batch_size == 0 {
            bail!("processing.batch_size must be positive");
        }

        let defaults = EditionParams::default();
        let e = &self.edition;
        let edition = EditionParams {
            title: e.title.clone().unwrap_or(defaults.title),
            tagline: e.tagline.clone().unwrap_or(defaults.tagline),
            language: e.language.clone().unwrap_or(defaults.language),
            sections: e
                .sections
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.sections),
        };

        Ok(Subscription {
            id,
            channels,
            schedule: ScheduleSpec {
                recurrence,
                timezone,
                default_lookback,
                window_mode: match self.window {
                    WindowToml::SinceLast => WindowMode::SinceLast,
                    WindowToml::Full => WindowMode::Full,
                },
            },
            processing: ProcessingParams {
                batch_size: p.batch_size,
                max_items: p.max_items,
                min_sources: p.min_sources.max(1),
                include_forwards: p.include_forwards,
                filter_noise: p.filter_noise,
                generation_attempts: p.generation_attempts.max(1),
            },
            edition,
            sinks: self.sinks.clone(),
        })
    }
}

/// `$DIGEST_CONFIG_PATH` if set (must exist), else `config/digest.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Ok(pb);
        }
        return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path {}", pb.display()));
    }
    let fallback = PathBuf::from(DEFAULT_CONFIG_PATH);
    if fallback.exists() {
        return Ok(fallback);
    }
    Err(anyhow!(
        "no config found: set {ENV_CONFIG_PATH} or create {DEFAULT_CONFIG_PATH}"
    ))
}

pub fn load_default() -> Result<(AppConfig, PathBuf)> {
    let path = default_config_path()?;
    let cfg = AppConfig::load_from(&path)?;
    info!(path = %path.display(), subscriptions = cfg.subscriptions.len(), "config loaded");
    Ok((cfg, path))
}

/// `"ENV"` → `$default_var`; `"env:NAME"` → `$NAME`; anything else is literal.
pub fn resolve_secret(value: &str, default_var: &str) -> Result<String> {
    let v = value.trim();
    let var = if v.eq_ignore_ascii_case("env") {
        default_var
    } else if let Some(name) = v.strip_prefix("env:") {
        name.trim()
    } else {
        return Ok(value.to_string());
    };
    std::env::var(var).map_err(|_| anyhow!("Missing {var} env var"))
}

/// Polls the config file's mtime and reloads subscriptions when it changes.
pub struct ConfigWatcher {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf) -> Self {
        let last_modified = modified(&path);
        Self {
            path,
            last_modified,
        }
    }

    /// `None` when the file is unchanged. A file that fails to parse or
    /// validate yields `Some(Err)` and is not retried until it changes again.
    pub fn poll(&mut self) -> Option<Result<Vec<Subscription>>> {
        let current = modified(&self.path)?;
        if self.last_modified == Some(current) {
            return None;
        }
        self.last_modified = Some(current);
        let result = AppConfig::load_from(&self.path).and_then(|cfg| cfg.subscriptions());
        if result.is_ok() {
            info!(path = %self.path.display(), "config change detected");
        }
        Some(result)
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
