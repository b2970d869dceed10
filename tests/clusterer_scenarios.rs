// tests/clusterer_scenarios.rs
mod common;

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::Ordering;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use common::{items, topic, topics, ts, ScriptedClassifier};
use newsroom_digest::cluster::{apply_merges, BatchClusterer, MergeStatus};
use newsroom_digest::model::{ArticleType, Cluster, ItemKey, MergeInstruction, BRIEF_SECTION};
use newsroom_digest::retry::RetryPolicy;

fn sections() -> Vec<String> {
    ["Politics", "World", "Business", BRIEF_SECTION]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn keys(clusters: &[Cluster]) -> Vec<ItemKey> {
    clusters.iter().flat_map(|c| c.keys().cloned()).collect()
}

#[tokio::test]
async fn partial_assignment_yields_topics_plus_singletons() {
    let input = items("wire", 10, ts(2025, 5, 1, 8, 0));
    let classifier = ScriptedClassifier::new();
    classifier.push_cluster(topics(vec![
        topic("Election results", &[1, 2, 3, 4], "HARD_NEWS", "Politics"),
        topic("Market slump", &[5, 6, 7], "HARD_NEWS", "business"),
    ]));

    let clusterer = BatchClusterer::new(classifier.clone()).with_retry(RetryPolicy::immediate(1));
    let out = clusterer.cluster(&input, &sections(), 50).await;

    assert_eq!(out.clusters.len(), 5);
    assert_eq!(out.clusters.iter().filter(|c| c.items.len() > 1).count(), 2);
    assert_eq!(out.clusters[1].section, "Business");
    let singles: Vec<&Cluster> = out.clusters.iter().filter(|c| c.items.len() == 1).collect();
    assert!(singles
        .iter()
        .all(|c| c.section == BRIEF_SECTION && c.article_type == ArticleType::Brief));
    assert!(!out.is_degraded());
    assert_eq!(out.merge, MergeStatus::NotNeeded);
    assert_eq!(classifier.merge_calls.load(Ordering::SeqCst), 0);
}

/// `pairs` two-item topics followed by single-item topics up to 50 items.
fn batch_reply(pairs: u32) -> String {
    let mut list = Vec::new();
    for k in 0..pairs {
        list.push(topic(&format!("pair {k}"), &[2 * k + 1, 2 * k + 2], "HARD_NEWS", "World"));
    }
    for id in (2 * pairs + 1)..=50 {
        list.push(topic(&format!("single {id}"), &[id], "OPINION", "Politics"));
    }
    topics(list)
}

#[tokio::test]
async fn cross_batch_merge_folds_one_cluster() {
    let input = items("wire", 100, ts(2025, 5, 1, 6, 0));
    let classifier = ScriptedClassifier::new();
    classifier.push_cluster(batch_reply(20)); // 20 + 10 = 30 clusters
    classifier.push_cluster(batch_reply(22)); // 22 + 6 = 28 clusters
    classifier.push_merge(
        r#"{"merges": [{"keep": "b0_t0", "absorbed": ["b1_t0"], "summary": "pair story"}]}"#,
    );

    let clusterer = BatchClusterer::new(classifier.clone()).with_retry(RetryPolicy::immediate(1));
    let out = clusterer.cluster(&input, &sections(), 50).await;

    assert_eq!(out.batches, 2);
    assert_eq!(out.clusters.len(), 57);
    assert_eq!(out.merge, MergeStatus::Applied { absorbed: 1 });
    assert_eq!(classifier.merge_inputs.lock().unwrap()[0].len(), 58);

    let merged = out.clusters.iter().find(|c| c.id == "b0_t0").unwrap();
    let got: BTreeSet<ItemKey> = merged.keys().cloned().collect();
    let want: BTreeSet<ItemKey> = [0, 1, 50, 51]
        .iter()
        .map(|i| ItemKey::new("wire", format!("wire-{i}")))
        .collect();
    assert_eq!(got, want);
    assert_eq!(merged.summary, "pair story");
    assert!(out.clusters.iter().all(|c| c.id != "b1_t0"));

    let all = keys(&out.clusters);
    assert_eq!(all.len(), 100);
    assert_eq!(all.iter().collect::<HashSet<_>>().len(), 100);
}

#[tokio::test]
async fn invalid_json_twice_degrades_batch_to_singletons() {
    let input = items("wire", 40, ts(2025, 5, 1, 6, 0));
    let classifier = ScriptedClassifier::new();
    classifier.push_cluster("Sure! Here are the topics you asked for.");
    classifier.push_cluster(r#"{"topics": [{"summary": "x", "message_ids": [41]}]}"#);

    let clusterer = BatchClusterer::new(classifier.clone()).with_retry(RetryPolicy::immediate(1));
    let out = clusterer.cluster(&input, &sections(), 50).await;

    assert_eq!(out.clusters.len(), 40);
    assert!(out.clusters.iter().all(|c| c.items.len() == 1));
    assert_eq!(out.degraded_batches, 1);
    assert!(out.is_degraded());
    assert_eq!(*classifier.strict_flags.lock().unwrap(), vec![false, true]);
}

#[tokio::test]
async fn unreachable_classifier_degrades_without_failing() {
    let input = items("wire", 12, ts(2025, 5, 1, 6, 0));
    let classifier = ScriptedClassifier::unreachable();

    let clusterer = BatchClusterer::new(classifier.clone()).with_retry(RetryPolicy::immediate(2));
    let out = clusterer.cluster(&input, &sections(), 5).await;

    assert_eq!(out.batches, 3);
    assert_eq!(out.degraded_batches, 3);
    assert_eq!(out.clusters.len(), 12);
    // Two transient attempts per batch, no strict retry after a transport failure.
    assert_eq!(classifier.cluster_calls.load(Ordering::SeqCst), 6);
    // Merge pass was attempted and skipped.
    assert!(matches!(out.merge, MergeStatus::Skipped { .. }));
    assert_eq!(keys(&out.clusters).len(), 12);
}

#[tokio::test]
async fn merge_reply_with_unknown_ids_keeps_pass_one() {
    let input = items("wire", 4, ts(2025, 5, 1, 6, 0));
    let classifier = ScriptedClassifier::new();
    classifier.push_cluster(topics(vec![topic("a", &[1, 2], "HARD_NEWS", "World")]));
    classifier.push_cluster(topics(vec![topic("b", &[1, 2], "HARD_NEWS", "World")]));
    classifier.push_merge(r#"{"merges": [{"keep": "b0_t0", "absorbed": ["b9_t9"]}]}"#);

    let clusterer = BatchClusterer::new(classifier).with_retry(RetryPolicy::immediate(1));
    let out = clusterer.cluster(&input, &sections(), 2).await;

    assert_eq!(out.clusters.len(), 2);
    assert!(matches!(out.merge, MergeStatus::Skipped { .. }));
    assert!(!out.is_degraded());
}

#[tokio::test]
async fn noise_filter_drops_trash_and_keeps_unclassified() {
    let input = items("wire", 6, ts(2025, 5, 1, 6, 0));
    let classifier = ScriptedClassifier::new();
    classifier.push_filter(r#"{"legitimate": [1, 2, 3], "trash": [4, 5]}"#);
    classifier.push_filter("garbage");

    let clusterer = BatchClusterer::new(classifier).with_retry(RetryPolicy::immediate(1));
    let out = clusterer.filter_noise(&input, 5).await;

    assert_eq!(
        out.trash,
        vec![ItemKey::new("wire", "wire-3"), ItemKey::new("wire", "wire-4")]
    );
    // Item 6 went to the second batch, whose reply was unusable.
    assert_eq!(out.kept.len(), 4);
}

fn fixture_clusters(n: usize) -> Vec<Cluster> {
    let base = ts(2025, 5, 1, 0, 0);
    (0..n)
        .map(|i| {
            let mut c = Cluster::singleton(
                format!("c{i}"),
                common::item("wire", &format!("i{i}"), base + chrono::Duration::minutes((i * 7 % 13) as i64), "t"),
            );
            c.section = ["World", "Politics", "Business"][i % 3].to_string();
            c.article_type = if i % 2 == 0 {
                ArticleType::HardNews
            } else {
                ArticleType::Opinion
            };
            c.summary = format!("summary {i}");
            c
        })
        .collect()
}

#[test]
fn merge_result_does_not_depend_on_instruction_order() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..50 {
        let clusters = fixture_clusters(20);
        let mut instructions: Vec<MergeInstruction> = (0..rng.random_range(1..8))
            .map(|k| {
                let keep = rng.random_range(0..20);
                let absorbed: BTreeSet<String> = (0..rng.random_range(1..4))
                    .map(|_| format!("c{}", rng.random_range(0..20)))
                    .filter(|id| *id != format!("c{keep}"))
                    .collect();
                MergeInstruction {
                    keep: format!("c{keep}"),
                    absorbed,
                    summary: (k % 2 == 0).then(|| format!("merged {k}")),
                }
            })
            .collect();

        let baseline = apply_merges(clusters.clone(), &instructions);
        for _ in 0..5 {
            instructions.shuffle(&mut rng);
            let again = apply_merges(clusters.clone(), &instructions);
            assert_eq!(again, baseline);
        }

        // Nothing lost, nothing duplicated.
        let all = keys(&baseline);
        assert_eq!(all.len(), 20);
        assert_eq!(all.iter().collect::<HashSet<_>>().len(), 20);
    }
}

#[test]
fn merged_cluster_takes_earliest_member_on_ties() {
    let mut clusters = fixture_clusters(2);
    clusters[0].items[0].timestamp = ts(2025, 5, 1, 12, 0);
    clusters[1].items[0].timestamp = ts(2025, 5, 1, 9, 0);
    // One vote each: the earlier cluster's section and type win.
    let out = apply_merges(
        clusters,
        &[MergeInstruction {
            keep: "c0".into(),
            absorbed: ["c1".to_string()].into_iter().collect(),
            summary: None,
        }],
    );
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].id, "c0");
    assert_eq!(out[0].section, "Politics");
    assert_eq!(out[0].article_type, ArticleType::Opinion);
    assert_eq!(out[0].items[0].key.item_id, "i1");
}
