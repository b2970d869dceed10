// tests/coordinator_runs.rs
mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Duration;

use common::{
    fire, forward, item, items, subscription, topic, topics, ts, FakeFeed, RecordingSink, ScriptedClassifier,
};
use newsroom_digest::error::{PortError, RunError};
use newsroom_digest::model::{ArticleType, ItemKey, BRIEF_SECTION};
use newsroom_digest::notify::DynSink;
use newsroom_digest::retry::RetryPolicy;
use newsroom_digest::schedule::{Fire, WindowMode};
use newsroom_digest::state::RunStatus;
use newsroom_digest::{RunCoordinator, WatermarkStore};

struct Rig {
    feed: Arc<FakeFeed>,
    classifier: Arc<ScriptedClassifier>,
    sink: Arc<RecordingSink>,
    coordinator: RunCoordinator,
}

fn rig_with(classifier: Arc<ScriptedClassifier>, extra_sinks: Vec<DynSink>) -> Rig {
    let feed = FakeFeed::new();
    let sink = RecordingSink::new("archive");
    let mut sinks: Vec<DynSink> = vec![sink.clone() as DynSink];
    sinks.extend(extra_sinks);
    let coordinator = RunCoordinator::new(
        WatermarkStore::open_in_memory().unwrap(),
        feed.clone(),
        classifier.clone(),
        sinks,
    )
    .with_retry(RetryPolicy::immediate(1));
    Rig {
        feed,
        classifier,
        sink,
        coordinator,
    }
}

fn rig() -> Rig {
    rig_with(ScriptedClassifier::new(), Vec::new())
}

fn store(r: &Rig) -> &WatermarkStore {
    r.coordinator.store()
}

#[tokio::test]
async fn run_commits_represented_items_and_delivers() {
    let r = rig();
    r.feed.set("a", items("a", 3, ts(2025, 3, 2, 9, 0)));
    let mut b = items("b", 2, ts(2025, 3, 2, 10, 0));
    // Outside the window.
    b.push(item("b", "old", ts(2025, 3, 1, 12, 0), "yesterday"));
    r.feed.set("b", b);
    r.classifier.push_cluster(topics(vec![topic("Bridge closed", &[1, 4], "HARD_NEWS", "World")]));

    let mut sub = subscription("evening", &["a", "b"]);
    sub.processing.min_sources = 2;
    let at = ts(2025, 3, 2, 18, 0);
    let report = r.coordinator.execute(&sub, &fire(at)).await.unwrap();

    assert_eq!(report.items_fetched, 5);
    assert_eq!(report.items_committed, 5);
    assert!(!report.degraded);
    assert_eq!(report.window.start, at - Duration::hours(24));
    assert_eq!(report.digest.article_count(), 4);

    let names: Vec<&str> = report.digest.sections.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["World", BRIEF_SECTION]);
    let lead = &report.digest.sections[0].articles[0];
    assert_eq!(lead.article_type, ArticleType::HardNews);
    assert_eq!(lead.sources.len(), 2);

    assert_eq!(r.sink.count(), 1);
    assert_eq!(report.delivery.as_ref().unwrap().delivered, vec!["archive".to_string()]);
    assert_eq!(store(&r).watermark_of("evening").unwrap(), Some(at));
    assert_eq!(store(&r).processed_count("evening").unwrap(), 5);
    assert!(!store(&r).is_processed("evening", &ItemKey::new("b", "old")).unwrap());
}

#[tokio::test]
async fn single_source_cluster_becomes_a_brief() {
    let r = rig();
    r.feed.set("a", items("a", 2, ts(2025, 3, 2, 9, 0)));
    r.classifier.push_cluster(topics(vec![topic("Local fire", &[1, 2], "HARD_NEWS", "World")]));

    let mut sub = subscription("s", &["a"]);
    sub.processing.min_sources = 2;
    let report = r.coordinator.execute(&sub, &fire(ts(2025, 3, 2, 18, 0))).await.unwrap();

    let article = report.digest.articles().next().unwrap();
    assert_eq!(article.article_type, ArticleType::Brief);
    assert_eq!(article.section, BRIEF_SECTION);
}

#[tokio::test]
async fn next_run_starts_at_the_watermark() {
    let r = rig();
    let sub = subscription("s", &["a"]);
    r.feed.set("a", items("a", 2, ts(2025, 3, 2, 9, 0)));
    r.coordinator.execute(&sub, &fire(ts(2025, 3, 2, 18, 0))).await.unwrap();

    let mut all = items("a", 2, ts(2025, 3, 2, 9, 0));
    all.push(item("a", "new", ts(2025, 3, 3, 8, 0), "fresh"));
    r.feed.set("a", all);
    let report = r.coordinator.execute(&sub, &fire(ts(2025, 3, 3, 18, 0))).await.unwrap();

    assert_eq!(report.window.start, ts(2025, 3, 2, 18, 0));
    assert_eq!(report.items_fetched, 1);
    assert_eq!(report.items_committed, 1);
    assert_eq!(store(&r).processed_count("s").unwrap(), 3);
}

#[tokio::test]
async fn full_window_relies_on_processed_marks() {
    let r = rig();
    let mut sub = subscription("s", &["a"]);
    sub.schedule.window_mode = WindowMode::Full;
    r.feed.set("a", items("a", 2, ts(2025, 3, 2, 9, 0)));
    r.coordinator.execute(&sub, &fire(ts(2025, 3, 2, 18, 0))).await.unwrap();

    let mut all = items("a", 2, ts(2025, 3, 2, 9, 0));
    all.push(item("a", "new", ts(2025, 3, 3, 8, 0), "fresh"));
    r.feed.set("a", all);
    let wide = Fire {
        at: ts(2025, 3, 3, 18, 0),
        lookback: Duration::hours(48),
        skipped: Vec::new(),
    };
    let report = r.coordinator.execute(&sub, &wide).await.unwrap();

    assert_eq!(report.window.start, ts(2025, 3, 1, 18, 0));
    assert_eq!(report.items_fetched, 3);
    assert_eq!(report.items_considered, 1);
    assert_eq!(report.items_committed, 1);
}

#[tokio::test]
async fn invalid_cluster_json_still_commits_every_item() {
    let r = rig();
    r.feed.set("a", items("a", 40, ts(2025, 3, 2, 6, 0)));
    r.classifier.push_cluster("not json at all");
    r.classifier.push_cluster("{\"topics\": ");

    let report = r
        .coordinator
        .execute(&subscription("s", &["a"]), &fire(ts(2025, 3, 2, 18, 0)))
        .await
        .unwrap();

    assert!(report.degraded);
    assert!(report.digest.degraded);
    assert_eq!(report.digest.article_count(), 40);
    assert_eq!(report.items_committed, 40);
    let run = store(&r).run(&report.run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.degraded);
    assert_eq!(run.items_processed, 40);
}

#[tokio::test]
async fn unreachable_classifier_is_not_a_run_failure() {
    let r = rig_with(ScriptedClassifier::unreachable(), Vec::new());
    r.feed.set("a", items("a", 6, ts(2025, 3, 2, 6, 0)));
    let at = ts(2025, 3, 2, 18, 0);

    let report = r.coordinator.execute(&subscription("s", &["a"]), &fire(at)).await.unwrap();

    assert!(report.degraded);
    // Every singleton failed generation, so nothing is marked.
    assert_eq!(report.dropped_clusters, 6);
    assert_eq!(report.items_committed, 0);
    assert!(report.digest.is_empty());
    assert_eq!(r.sink.count(), 0);
    let run = store(&r).run(&report.run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(store(&r).watermark_of("s").unwrap(), Some(at));
}

#[tokio::test]
async fn fetch_failure_aborts_and_leaves_state_untouched() {
    let r = rig();
    r.feed.set("a", items("a", 3, ts(2025, 3, 2, 9, 0)));
    r.feed.fail("b", PortError::Transport("connection reset".into()));

    let err = r
        .coordinator
        .execute(&subscription("s", &["a", "b"]), &fire(ts(2025, 3, 2, 18, 0)))
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Fetch { ref channel, .. } if channel == "b"));
    assert_eq!(store(&r).watermark_of("s").unwrap(), None);
    assert_eq!(store(&r).processed_count("s").unwrap(), 0);
    let runs = store(&r).recent_runs("s", 5).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0].error_message.as_deref().unwrap().starts_with("fetching"));
    assert_eq!(r.classifier.cluster_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn inaccessible_channel_is_skipped() {
    let r = rig();
    r.feed.set("a", items("a", 2, ts(2025, 3, 2, 9, 0)));
    r.feed.fail(
        "gone",
        PortError::ChannelAccess {
            channel: "gone".into(),
            reason: "HTTP 404".into(),
        },
    );

    let report = r
        .coordinator
        .execute(&subscription("s", &["a", "gone"]), &fire(ts(2025, 3, 2, 18, 0)))
        .await
        .unwrap();

    assert_eq!(report.skipped_channels, vec!["gone".to_string()]);
    assert_eq!(report.digest.channel_count, 1);
    let run = store(&r).run(&report.run_id).unwrap().unwrap();
    assert!(run.error_message.unwrap().contains("channel skipped: gone"));
}

#[tokio::test]
async fn excluded_forwards_and_trash_are_marked_without_articles() {
    let r = rig();
    let mut feed_items = items("a", 3, ts(2025, 3, 2, 9, 0));
    feed_items.push(forward("a", "fwd", ts(2025, 3, 2, 11, 0), "reposted"));
    r.feed.set("a", feed_items);
    // Positions after forward exclusion: a-0, a-1, a-2.
    r.classifier.push_filter(r#"{"legitimate": [1, 3], "trash": [2]}"#);

    let mut sub = subscription("s", &["a"]);
    sub.processing.include_forwards = false;
    sub.processing.filter_noise = true;
    let report = r.coordinator.execute(&sub, &fire(ts(2025, 3, 2, 18, 0))).await.unwrap();

    assert_eq!(report.items_considered, 2);
    assert_eq!(report.digest.article_count(), 2);
    assert_eq!(report.items_committed, 4);
    assert!(store(&r).is_processed("s", &ItemKey::new("a", "fwd")).unwrap());
    assert!(store(&r).is_processed("s", &ItemKey::new("a", "a-1")).unwrap());
}

#[tokio::test]
async fn item_cap_leaves_the_rest_unmarked() {
    let r = rig();
    r.feed.set("a", items("a", 5, ts(2025, 3, 2, 9, 0)));
    let mut sub = subscription("s", &["a"]);
    sub.processing.max_items = 3;

    let report = r.coordinator.execute(&sub, &fire(ts(2025, 3, 2, 18, 0))).await.unwrap();

    assert_eq!(report.items_committed, 3);
    // Earliest items are kept.
    assert!(store(&r).is_processed("s", &ItemKey::new("a", "a-0")).unwrap());
    assert!(!store(&r).is_processed("s", &ItemKey::new("a", "a-4")).unwrap());
    assert_eq!(report.retry_from, Some(ts(2025, 3, 2, 9, 3)));
}

#[tokio::test]
async fn capped_items_are_picked_up_by_the_next_run() {
    let r = rig();
    r.feed.set("a", items("a", 5, ts(2025, 3, 2, 9, 0)));
    let mut sub = subscription("s", &["a"]);
    sub.processing.max_items = 3;
    r.coordinator.execute(&sub, &fire(ts(2025, 3, 2, 18, 0))).await.unwrap();

    let report = r.coordinator.execute(&sub, &fire(ts(2025, 3, 3, 18, 0))).await.unwrap();

    assert_eq!(report.window.start, ts(2025, 3, 2, 9, 3));
    assert_eq!(report.items_fetched, 2);
    assert_eq!(report.items_committed, 2);
    assert_eq!(report.retry_from, None);
    assert_eq!(store(&r).processed_count("s").unwrap(), 5);
    assert_eq!(store(&r).retry_floor_of("s").unwrap(), None);
}

#[tokio::test]
async fn rejected_credentials_fail_the_run() {
    let r = rig();
    r.feed.set("a", items("a", 1, ts(2025, 3, 2, 9, 0)));
    r.classifier.push_article_err(PortError::Auth("HTTP 401".into()));

    let err = r
        .coordinator
        .execute(&subscription("s", &["a"]), &fire(ts(2025, 3, 2, 18, 0)))
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Classifier(PortError::Auth(_))));
    assert_eq!(store(&r).watermark_of("s").unwrap(), None);
    assert_eq!(r.sink.count(), 0);
}

#[tokio::test]
async fn malformed_article_is_retried_then_dropped() {
    let r = rig();
    r.feed.set("a", items("a", 2, ts(2025, 3, 2, 9, 0)));
    // Cluster 1: two bad replies, dropped. Cluster 2: default reply.
    r.classifier.push_article("{}");
    r.classifier.push_article("{\"headline\": \"\", \"body\": \"x\"}");

    let report = r
        .coordinator
        .execute(&subscription("s", &["a"]), &fire(ts(2025, 3, 2, 18, 0)))
        .await
        .unwrap();

    assert_eq!(report.dropped_clusters, 1);
    assert_eq!(report.items_committed, 1);
    assert!(!store(&r).is_processed("s", &ItemKey::new("a", "a-0")).unwrap());
    assert_eq!(r.classifier.article_calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.retry_from, Some(ts(2025, 3, 2, 9, 0)));
}

#[tokio::test]
async fn dropped_cluster_is_retried_on_the_next_run() {
    let r = rig();
    let sub = subscription("s", &["a"]);
    r.feed.set("a", items("a", 2, ts(2025, 3, 2, 9, 0)));
    r.classifier.push_article("{}");
    r.classifier.push_article("{}");
    let first = r.coordinator.execute(&sub, &fire(ts(2025, 3, 2, 18, 0))).await.unwrap();
    assert_eq!(first.dropped_clusters, 1);
    assert_eq!(store(&r).watermark_of("s").unwrap(), Some(ts(2025, 3, 2, 18, 0)));

    // Nothing new was published; the window still reaches back to the dropped item.
    let second = r.coordinator.execute(&sub, &fire(ts(2025, 3, 3, 18, 0))).await.unwrap();

    assert_eq!(second.window.start, ts(2025, 3, 2, 9, 0));
    assert_eq!(second.items_fetched, 2);
    assert_eq!(second.items_considered, 1);
    assert_eq!(second.items_committed, 1);
    assert_eq!(second.digest.article_count(), 1);
    assert!(store(&r).is_processed("s", &ItemKey::new("a", "a-0")).unwrap());
    assert_eq!(store(&r).retry_floor_of("s").unwrap(), None);
    // Back to a plain incremental window.
    let third = r.coordinator.execute(&sub, &fire(ts(2025, 3, 4, 18, 0))).await.unwrap();
    assert_eq!(third.window.start, ts(2025, 3, 3, 18, 0));
    assert_eq!(third.items_fetched, 0);
}

#[tokio::test]
async fn empty_window_commits_without_delivery() {
    let r = rig();
    let at = ts(2025, 3, 2, 18, 0);
    let report = r.coordinator.execute(&subscription("s", &["a"]), &fire(at)).await.unwrap();

    assert!(report.digest.is_empty());
    assert!(report.delivery.is_none());
    assert_eq!(r.sink.count(), 0);
    assert_eq!(store(&r).watermark_of("s").unwrap(), Some(at));
}

#[tokio::test]
async fn failing_sink_is_noted_and_others_still_deliver() {
    let down: DynSink = RecordingSink::failing("pager");
    let r = rig_with(ScriptedClassifier::new(), vec![down]);
    r.feed.set("a", items("a", 1, ts(2025, 3, 2, 9, 0)));

    let report = r
        .coordinator
        .execute(&subscription("s", &["a"]), &fire(ts(2025, 3, 2, 18, 0)))
        .await
        .unwrap();

    let delivery = report.delivery.unwrap();
    assert_eq!(delivery.delivered, vec!["archive".to_string()]);
    assert_eq!(delivery.failed.len(), 1);
    assert_eq!(report.items_committed, 1);
    let run = store(&r).run(&report.run_id).unwrap().unwrap();
    assert!(run.error_message.unwrap().contains("sink pager failed"));
}

#[tokio::test]
async fn subscription_sink_names_select_sinks() {
    let other = RecordingSink::new("other");
    let r = rig_with(ScriptedClassifier::new(), vec![other.clone()]);
    r.feed.set("a", items("a", 1, ts(2025, 3, 2, 9, 0)));
    let mut sub = subscription("s", &["a"]);
    sub.sinks = vec!["other".into()];

    r.coordinator.execute(&sub, &fire(ts(2025, 3, 2, 18, 0))).await.unwrap();

    assert_eq!(r.sink.count(), 0);
    assert_eq!(other.count(), 1);
}

#[tokio::test]
async fn second_run_is_refused_while_one_is_open() {
    let r = rig();
    let at = ts(2025, 3, 2, 18, 0);
    store(&r).begin_run("s", at - Duration::hours(24), at).unwrap();

    let err = r.coordinator.execute(&subscription("s", &["a"]), &fire(at)).await.unwrap_err();

    assert!(err.is_concurrent_run());
    assert_eq!(r.feed.calls.load(Ordering::SeqCst), 0);
}
