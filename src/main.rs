//! newsroom-digest daemon entrypoint.
//!
//! Usage:
//!   newsroom-digest                          run the scheduler until Ctrl-C
//!   newsroom-digest history [SUB] [LIMIT]    print recent runs

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use newsroom_digest::classifier::openai::OpenAiClassifier;
use newsroom_digest::classifier::DynClassifier;
use newsroom_digest::config::{self, AppConfig, ConfigWatcher};
use newsroom_digest::feed::rss::RssFeed;
use newsroom_digest::feed::DynFeed;
use newsroom_digest::quota::{GatedClassifier, GatedFeed, Quota};
use newsroom_digest::subscription::Subscription;
use newsroom_digest::{metrics, notify, Daemon, RunCoordinator, WatermarkStore};

/// `LOG_FORMAT=json` switches to JSON lines; the default is compact text.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("newsroom_digest=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let (cfg, path) = config::load_default()?;
    let subscriptions = cfg.subscriptions()?;

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None => {}
        Some("history") => {
            let sub = args.next();
            let limit = match args.next() {
                Some(n) => n.parse().with_context(|| format!("invalid limit {n:?}"))?,
                None => 10,
            };
            return print_history(&cfg, &subscriptions, sub.as_deref(), limit);
        }
        Some(other) => bail!("unknown command {other:?} (expected none or `history [SUB] [LIMIT]`)"),
    }

    metrics::init(metrics::listen_addr_from_env()?)?;

    let store = WatermarkStore::open(&cfg.daemon.state_path)
        .with_context(|| format!("opening state db {}", cfg.daemon.state_path.display()))?;
    let coordinator = build_coordinator(&cfg, store)?;

    let watcher = cfg.daemon.hot_reload.then(|| ConfigWatcher::new(path.clone()));
    let daemon = Arc::new(Daemon::new(
        Arc::new(coordinator),
        subscriptions,
        cfg.daemon.to_daemon_config(),
    ));

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => warn!(error = %e, "ctrl-c handler failed, shutting down"),
        }
        let _ = tx.send(true);
    });

    info!(config = %path.display(), "newsroom-digest starting");
    daemon.run(rx, watcher).await
}

fn build_coordinator(cfg: &AppConfig, store: WatermarkStore) -> Result<RunCoordinator> {
    let limits = &cfg.limits;

    let feed: DynFeed = Arc::new(RssFeed::new(Duration::from_secs(cfg.feed.timeout_secs.max(1)))?);
    let feed = GatedFeed::wrap(
        feed,
        Quota::new(
            "feed",
            limits.feed_max_concurrent,
            Duration::from_millis(limits.feed_min_spacing_ms),
        ),
    );

    let llm = cfg.llm.resolved()?;
    info!(model = %llm.model, base_url = %llm.base_url, "classifier configured");
    let classifier: DynClassifier = Arc::new(OpenAiClassifier::new(&llm)?);
    let classifier = GatedClassifier::wrap(
        classifier,
        Quota::new(
            "classifier",
            limits.classifier_max_concurrent,
            Duration::from_millis(limits.classifier_min_spacing_ms),
        ),
    );

    let sinks = notify::build_sinks(&cfg.sinks)?;
    if sinks.is_empty() {
        warn!("no delivery sinks configured; editions will only be recorded");
    }

    Ok(RunCoordinator::new(store, feed, classifier, sinks).with_retry(limits.retry_policy()))
}

fn print_history(cfg: &AppConfig, subscriptions: &[Subscription], only: Option<&str>, limit: usize) -> Result<()> {
    let store = WatermarkStore::open_for_inspection(&cfg.daemon.state_path)
        .with_context(|| format!("opening state db {}", cfg.daemon.state_path.display()))?;

    let ids: Vec<&str> = match only {
        Some(id) => vec![id],
        None => subscriptions.iter().map(|s| s.id.as_str()).collect(),
    };
    for id in ids {
        println!("== {id} ==");
        match store.watermark_of(id)? {
            Some(w) => println!("watermark: {}", w.to_rfc3339()),
            None => println!("watermark: none"),
        }
        for r in store.recent_runs(id, limit)? {
            println!(
                "{}  {:<9}  {} .. {}  fetched={} processed={}{}{}",
                r.started_at.format("%Y-%m-%d %H:%M:%S"),
                r.status.as_str(),
                r.period_start.format("%Y-%m-%d %H:%M"),
                r.period_end.format("%Y-%m-%d %H:%M"),
                r.items_fetched,
                r.items_processed,
                if r.degraded { " degraded" } else { "" },
                r.error_message.map(|e| format!("  [{e}]")).unwrap_or_default(),
            );
        }
        let skipped = store.skipped_fires(id)?;
        if !skipped.is_empty() {
            println!("skipped fires: {}", skipped.len());
        }
    }
    Ok(())
}
