// tests/feed_rss.rs
use chrono::{DateTime, TimeZone, Utc};

use newsroom_digest::error::PortError;
use newsroom_digest::feed::rss::RssFeed;
use newsroom_digest::model::Provenance;

const FEED_XML: &str = include_str!("fixtures/feed.xml");
const CHANNEL: &str = "https://wire.example.org/rss";

fn ts(d: u32, h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, d, h, m, 0).unwrap()
}

#[test]
fn fixture_yields_dated_items_inside_the_window() {
    let items = RssFeed::parse_items(CHANNEL, FEED_XML, ts(1, 0, 0), ts(3, 0, 0)).unwrap();

    let ids: Vec<&str> = items.iter().map(|i| i.key.item_id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            "wire-1001",
            "https://wire.example.org/2025/03/02/buses",
            "wire-1003"
        ]
    );
    assert!(items.iter().all(|i| i.key.channel_id == CHANNEL));
    assert!(items.iter().all(|i| i.channel_title == "City & Harbour Wire"));
}

#[test]
fn text_is_normalized_and_attachments_kept() {
    let items = RssFeed::parse_items(CHANNEL, FEED_XML, ts(1, 0, 0), ts(3, 0, 0)).unwrap();
    let bridge = &items[0];

    assert_eq!(
        bridge.text,
        "Harbour bridge closed after inspection. Engineers found cracks in the main span."
    );
    assert_eq!(bridge.timestamp, ts(2, 9, 15));
    assert_eq!(bridge.permalink.as_deref(), Some("https://wire.example.org/2025/03/02/bridge"));
    assert_eq!(bridge.attachments.len(), 1);
    assert_eq!(bridge.attachments[0].kind, "image/jpeg");
    assert_eq!(bridge.provenance, Provenance::Original);
}

#[test]
fn offsets_are_converted_to_utc() {
    let items = RssFeed::parse_items(CHANNEL, FEED_XML, ts(1, 0, 0), ts(3, 0, 0)).unwrap();
    assert_eq!(items[1].timestamp, ts(2, 10, 40));
}

#[test]
fn republished_items_are_forwards() {
    let items = RssFeed::parse_items(CHANNEL, FEED_XML, ts(1, 0, 0), ts(3, 0, 0)).unwrap();
    assert_eq!(
        items[2].provenance,
        Provenance::Forward {
            from: Some("National Desk".to_string())
        }
    );
}

#[test]
fn window_end_is_exclusive() {
    let items = RssFeed::parse_items(CHANNEL, FEED_XML, ts(2, 9, 15), ts(2, 10, 40)).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].key.item_id, "wire-1001");
}

#[test]
fn garbage_document_is_a_channel_error() {
    let err = RssFeed::parse_items(CHANNEL, "<html><body>moved</body>", ts(1, 0, 0), ts(3, 0, 0))
        .unwrap_err();
    assert!(matches!(err, PortError::ChannelAccess { ref channel, .. } if channel == CHANNEL));
    assert!(!err.is_transient());
}
