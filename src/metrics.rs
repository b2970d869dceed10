// src/metrics.rs
use std::net::SocketAddr;

use anyhow::Context;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// Env var holding the scrape listener address, e.g. `0.0.0.0:9000`.
pub const ENV_METRICS_ADDR: &str = "METRICS_ADDR";

/// Install the Prometheus recorder. With `listen` set, the exporter serves
/// `/metrics` itself; otherwise the returned handle renders on demand.
/// Must be called inside a Tokio runtime.
pub fn init(listen: Option<SocketAddr>) -> anyhow::Result<Option<PrometheusHandle>> {
    describe_all();
    let builder = PrometheusBuilder::new();
    match listen {
        Some(addr) => {
            builder
                .with_http_listener(addr)
                .install()
                .context("prometheus: install exporter")?;
            tracing::info!(%addr, "metrics exporter listening");
            Ok(None)
        }
        None => {
            let handle = builder
                .install_recorder()
                .context("prometheus: install recorder")?;
            Ok(Some(handle))
        }
    }
}

pub fn listen_addr_from_env() -> anyhow::Result<Option<SocketAddr>> {
    match std::env::var(ENV_METRICS_ADDR) {
        Ok(s) if !s.trim().is_empty() => s
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {ENV_METRICS_ADDR} {s:?}")),
        _ => Ok(None),
    }
}

pub fn describe_all() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("runs_total", "Finished runs by terminal status.");
        describe_histogram!("run_duration_ms", "Wall time of one run in milliseconds.");
        describe_gauge!("runs_in_flight", "Subscriptions with a run in progress.");
        describe_counter!("items_committed_total", "Items marked processed by committed runs.");
        describe_counter!(
            "scheduler_skipped_fires_total",
            "Scheduled fires skipped because they were missed by more than the tolerance."
        );

        describe_counter!("feed_items_total", "Items parsed from feeds inside the run window.");
        describe_counter!("feed_items_undated_total", "Feed items dropped for lacking a date.");
        describe_counter!("feed_errors_total", "Feed fetch or parse errors.");
        describe_counter!("feed_channels_skipped_total", "Channels skipped for access errors.");
        describe_histogram!("feed_parse_ms", "Feed parse time in milliseconds.");

        describe_counter!("classifier_calls_total", "Classifier requests by operation.");
        describe_counter!("classifier_errors_total", "Classifier HTTP errors by operation.");
        describe_counter!("classifier_tokens_total", "Tokens consumed by operation.");
        describe_counter!("clusterer_clusters_total", "Clusters produced by the clusterer.");
        describe_counter!(
            "clusterer_degraded_batches_total",
            "Batches that fell back to singleton clusters."
        );
        describe_counter!(
            "clusterer_malformed_replies_total",
            "Classifier replies rejected by schema validation."
        );
        describe_counter!("filter_trash_total", "Items flagged as noise before clustering.");
        describe_counter!(
            "generation_dropped_clusters_total",
            "Clusters whose article could not be generated."
        );
        describe_counter!(
            "generation_malformed_replies_total",
            "Article replies rejected by schema validation."
        );

        describe_counter!("port_retries_total", "Retried port calls by operation.");
        describe_histogram!("quota_wait_ms", "Time spent waiting for a quota slot.");
        describe_counter!("delivery_sent_total", "Editions delivered, by sink.");
        describe_counter!("delivery_failures_total", "Failed deliveries, by sink.");
    });
}
