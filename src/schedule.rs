// src/schedule.rs
//! Recurrence specs and next-fire computation.
//!
//! Everything here is pure: the caller passes in the last fire read from the
//! run history and the current instant, so a restart recomputes the same
//! answer from durable state alone.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use once_cell::sync::OnceCell;
use regex::Regex;

/// Fires older than this many minutes are skipped instead of run late.
pub const DEFAULT_MISSED_FIRE_TOLERANCE_MINS: i64 = 15;

pub fn default_tolerance() -> Duration {
    Duration::minutes(DEFAULT_MISSED_FIRE_TOLERANCE_MINS)
}

/// Unmarked items older than this many days are no longer pulled back into a window.
pub const RETRY_HORIZON_DAYS: i64 = 7;

/// Upper bound on skipped occurrences collected after a long outage.
const MAX_SKIPPED: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailySlot {
    pub at: NaiveTime,
    /// Overrides the subscription's default lookback for this slot.
    pub lookback: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recurrence {
    /// One fire per listed time, every calendar day.
    DailyMulti { slots: Vec<DailySlot> },
    Weekly {
        day: Weekday,
        at: NaiveTime,
        lookback: Duration,
    },
}

/// How the start of a run's window is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowMode {
    /// From the previous commit's watermark when there is one.
    #[default]
    SinceLast,
    /// Always `fire - lookback`; processed marks still filter repeats.
    Full,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleSpec {
    pub recurrence: Recurrence,
    pub timezone: Tz,
    pub default_lookback: Duration,
    pub window_mode: WindowMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub at: DateTime<Utc>,
    pub lookback: Duration,
}

/// The next fire for a subscription plus the occurrences skipped to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fire {
    pub at: DateTime<Utc>,
    pub lookback: Duration,
    pub skipped: Vec<DateTime<Utc>>,
}

impl Fire {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ScheduleSpec {
    /// First occurrence strictly after `after`.
    pub fn next_occurrence_after(&self, after: DateTime<Utc>) -> Option<Occurrence> {
        let local_day = after.with_timezone(&self.timezone).date_naive();
        // Start a day early: DST shifts can map a local time on the previous
        // date past `after`.
        (-1..=8)
            .flat_map(|offset| self.occurrences_on(local_day + Duration::days(offset)))
            .filter(|occ| occ.at > after)
            .min_by_key(|occ| occ.at)
    }

    fn occurrences_on(&self, day: NaiveDate) -> Vec<Occurrence> {
        match &self.recurrence {
            Recurrence::DailyMulti { slots } => slots
                .iter()
                .filter_map(|slot| {
                    self.localize(day, slot.at).map(|at| Occurrence {
                        at,
                        lookback: slot.lookback.unwrap_or(self.default_lookback),
                    })
                })
                .collect(),
            Recurrence::Weekly {
                day: weekday,
                at,
                lookback,
            } if day.weekday() == *weekday => self
                .localize(day, *at)
                .map(|at| Occurrence {
                    at,
                    lookback: *lookback,
                })
                .into_iter()
                .collect(),
            Recurrence::Weekly { .. } => Vec::new(),
        }
    }

    fn localize(&self, day: NaiveDate, at: NaiveTime) -> Option<DateTime<Utc>> {
        let naive = day.and_time(at);
        match self.timezone.from_local_datetime(&naive) {
            LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
            LocalResult::Ambiguous(first, _) => Some(first.with_timezone(&Utc)),
            // Wall-clock time skipped by a DST jump: fire an hour later.
            LocalResult::None => self
                .timezone
                .from_local_datetime(&(naive + Duration::hours(1)))
                .earliest()
                .map(|t| t.with_timezone(&Utc)),
        }
    }

    /// Window for a run fired at `fire_at`.
    ///
    /// `retry_floor` is the oldest item the previous commit left unmarked; the
    /// window reaches back to it unless it is older than [`RETRY_HORIZON_DAYS`].
    pub fn window(
        &self,
        fire_at: DateTime<Utc>,
        lookback: Duration,
        watermark: Option<DateTime<Utc>>,
        retry_floor: Option<DateTime<Utc>>,
    ) -> RunWindow {
        let mut start = match (self.window_mode, watermark) {
            (WindowMode::SinceLast, Some(w)) => w.min(fire_at),
            _ => fire_at
                .checked_sub_signed(lookback)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        };
        let horizon = fire_at
            .checked_sub_signed(Duration::days(RETRY_HORIZON_DAYS))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        if let Some(floor) = retry_floor.filter(|f| *f >= horizon) {
            start = start.min(floor);
        }
        RunWindow { start, end: fire_at }
    }
}

/// Next fire for `spec`, given the last fire in durable history.
///
/// Occurrences older than `now - tolerance` are skipped, not backfilled; they
/// come back in `Fire::skipped` so the caller can note them. With no history
/// the first occurrence inside the tolerance window (or in the future) is used.
pub fn next_fire_time(
    spec: &ScheduleSpec,
    last_fire: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    tolerance: Duration,
) -> Option<Fire> {
    let floor = now - tolerance;
    let anchor = last_fire.unwrap_or(floor - Duration::nanoseconds(1));

    let mut next = spec.next_occurrence_after(anchor)?;
    let mut skipped = Vec::new();
    while next.at < floor {
        if skipped.len() >= MAX_SKIPPED {
            next = spec.next_occurrence_after(floor - Duration::nanoseconds(1))?;
            break;
        }
        skipped.push(next.at);
        next = spec.next_occurrence_after(next.at)?;
    }

    Some(Fire {
        at: next.at,
        lookback: next.lookback,
        skipped,
    })
}

/// Parse `"N minutes" | "N hours" | "N days" | "N weeks"` (singular accepted).
pub fn parse_lookback(s: &str) -> Result<Duration> {
    static RE: OnceCell<Regex> = OnceCell::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(\d+)\s*(minute|min|hour|h|day|d|week|w)s?\s*$").unwrap()
    });
    let caps = re
        .captures(s)
        .ok_or_else(|| anyhow!("invalid lookback {s:?} (expected e.g. \"24 hours\")"))?;
    let n: i64 = caps[1].parse()?;
    if n == 0 {
        bail!("lookback {s:?} must be positive");
    }
    let unit = caps[2].to_ascii_lowercase();
    let lookback = match unit.as_str() {
        "minute" | "min" => Duration::try_minutes(n),
        "hour" | "h" => Duration::try_hours(n),
        "day" | "d" => Duration::try_days(n),
        _ => Duration::try_weeks(n),
    };
    match lookback {
        Some(d) => Ok(d),
        None => bail!("lookback {s:?} is out of range"),
    }
}

/// `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| anyhow!("invalid time of day {s:?} (expected HH:MM)"))
}

/// Weekday name ("monday", "Tue") or index with Monday = 0.
pub fn parse_weekday(s: &str) -> Result<Weekday> {
    let s = s.trim();
    if let Ok(n) = s.parse::<u8>() {
        return Weekday::try_from(n).map_err(|_| anyhow!("weekday index {n} out of range 0..=6"));
    }
    s.parse::<Weekday>()
        .map_err(|_| anyhow!("invalid weekday {s:?}"))
}
