// src/daemon.rs
//! The scheduler loop: one periodic tick over all subscriptions, each due fire
//! dispatched as its own task on a bounded worker pool.
//!
//! A tick only reads run history and computes instants; all network I/O
//! happens inside the spawned runs.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ConfigWatcher;
use crate::coordinator::{RunCoordinator, RunReport};
use crate::error::RunError;
use crate::schedule::{default_tolerance, next_fire_time, Fire};
use crate::subscription::Subscription;

/// Error text for runs still open when the shutdown grace period ends.
pub const SHUTDOWN_REASON: &str = "aborted: shutdown grace period elapsed";

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub tick_interval: Duration,
    pub max_concurrent_runs: usize,
    pub missed_fire_tolerance: chrono::Duration,
    pub shutdown_grace: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            max_concurrent_runs: 4,
            missed_fire_tolerance: default_tolerance(),
            shutdown_grace: Duration::from_secs(60),
        }
    }
}

/// Result of one dispatched run.
#[derive(Debug)]
pub struct RunOutcome {
    pub subscription_id: String,
    pub fire_at: DateTime<Utc>,
    pub result: Result<RunReport, RunError>,
}

pub type Subscriptions = Arc<Vec<Arc<Subscription>>>;

pub struct Daemon {
    coordinator: Arc<RunCoordinator>,
    subscriptions: RwLock<Subscriptions>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    workers: Arc<Semaphore>,
    config: DaemonConfig,
}

/// Releases a subscription's in-flight slot even when its task is aborted.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
            gauge!("runs_in_flight").set(set.len() as f64);
        }
    }
}

impl Daemon {
    pub fn new(coordinator: Arc<RunCoordinator>, subscriptions: Vec<Subscription>, config: DaemonConfig) -> Self {
        Self {
            coordinator,
            subscriptions: RwLock::new(snapshot(subscriptions)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            workers: Arc::new(Semaphore::new(config.max_concurrent_runs.max(1))),
            config,
        }
    }

    pub fn coordinator(&self) -> &RunCoordinator {
        &self.coordinator
    }

    /// Current subscription set. Runs keep the snapshot they started with.
    pub fn subscriptions(&self) -> Subscriptions {
        match self.subscriptions.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace_subscriptions(&self, subscriptions: Vec<Subscription>) {
        let next = snapshot(subscriptions);
        info!(subscriptions = next.len(), "subscriptions replaced");
        match self.subscriptions.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    pub fn is_in_flight(&self, subscription_id: &str) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(subscription_id))
            .unwrap_or(false)
    }

    /// Fires due at `now`. Subscriptions with a run in flight are deferred to
    /// a later tick; skipped occurrences are noted in run history.
    pub fn due_fires(&self, now: DateTime<Utc>) -> Vec<(Arc<Subscription>, Fire)> {
        let store = self.coordinator.store();
        let mut due = Vec::new();

        for sub in self.subscriptions().iter() {
            if self.is_in_flight(&sub.id) {
                debug!(subscription = %sub.id, "run in flight, fire deferred");
                continue;
            }
            let last_fire = match store.last_fire_of(&sub.id) {
                Ok(t) => t,
                Err(e) => {
                    error!(subscription = %sub.id, error = %e, "reading run history failed");
                    continue;
                }
            };
            let Some(fire) = next_fire_time(&sub.schedule, last_fire, now, self.config.missed_fire_tolerance)
            else {
                continue;
            };

            if !fire.skipped.is_empty() {
                match store.note_skipped_fires(&sub.id, &fire.skipped) {
                    Ok(0) => {}
                    Ok(n) => {
                        counter!("scheduler_skipped_fires_total").increment(n as u64);
                        warn!(
                            subscription = %sub.id,
                            skipped = n,
                            first = %fire.skipped[0],
                            next = %fire.at,
                            "missed fires skipped"
                        );
                    }
                    Err(e) => warn!(subscription = %sub.id, error = %e, "recording skipped fires failed"),
                }
            }

            if fire.is_due(now) {
                due.push((sub.clone(), fire));
            }
        }
        due
    }

    /// One scheduler tick. Returns the number of runs dispatched.
    pub fn tick(&self, now: DateTime<Utc>, tasks: &mut JoinSet<RunOutcome>) -> usize {
        let due = self.due_fires(now);
        let dispatched = due.len();

        for (sub, fire) in due {
            let guard = {
                let Ok(mut set) = self.in_flight.lock() else {
                    error!("in-flight set poisoned, skipping dispatch");
                    return 0;
                };
                set.insert(sub.id.clone());
                gauge!("runs_in_flight").set(set.len() as f64);
                InFlightGuard {
                    set: self.in_flight.clone(),
                    id: sub.id.clone(),
                }
            };

            let coordinator = self.coordinator.clone();
            let workers = self.workers.clone();
            info!(subscription = %sub.id, fire = %fire.at, "fire dispatched");
            tasks.spawn(async move {
                let _guard = guard;
                let _permit = workers.acquire_owned().await;
                let result = coordinator.execute(&sub, &fire).await;
                RunOutcome {
                    subscription_id: sub.id.clone(),
                    fire_at: fire.at,
                    result,
                }
            });
        }
        dispatched
    }

    /// Tick until `shutdown` flips, then drain.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        mut watcher: Option<ConfigWatcher>,
    ) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks: JoinSet<RunOutcome> = JoinSet::new();
        info!(
            subscriptions = self.subscriptions().len(),
            tick_secs = self.config.tick_interval.as_secs(),
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(w) = watcher.as_mut() {
                        match w.poll() {
                            Some(Ok(subs)) => self.replace_subscriptions(subs),
                            Some(Err(e)) => warn!(error = ?e, "config reload rejected, keeping previous subscriptions"),
                            None => {}
                        }
                    }
                    self.tick(Utc::now(), &mut tasks);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_joined(joined);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain(tasks).await
    }

    /// Give in-flight runs the grace period, then abort whatever is left.
    pub async fn drain(&self, mut tasks: JoinSet<RunOutcome>) -> anyhow::Result<()> {
        info!(
            in_flight = tasks.len(),
            grace_secs = self.config.shutdown_grace.as_secs(),
            "shutting down"
        );
        let deadline = tokio::time::sleep(self.config.shutdown_grace);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(joined) => log_joined(joined),
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(remaining = tasks.len(), "grace period elapsed, aborting in-flight runs");
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        let aborted = self.coordinator.store().abort_all_running(SHUTDOWN_REASON)?;
        if aborted > 0 {
            warn!(aborted, "uncommitted runs aborted at shutdown");
        }
        info!("scheduler stopped");
        Ok(())
    }
}

fn snapshot(subscriptions: Vec<Subscription>) -> Subscriptions {
    Arc::new(subscriptions.into_iter().map(Arc::new).collect())
}

fn log_joined(joined: Result<RunOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(RunOutcome {
            subscription_id,
            result: Err(e),
            ..
        }) if e.is_concurrent_run() => {
            info!(subscription = %subscription_id, "another run holds the subscription, fire deferred");
        }
        Ok(RunOutcome {
            subscription_id,
            fire_at,
            result: Err(e),
        }) => {
            // Already logged and recorded by the coordinator.
            debug!(subscription = %subscription_id, fire = %fire_at, error = %e, "run ended without commit");
        }
        Ok(_) => {}
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!(error = %e, "run task panicked"),
    }
}
