//! Cross-module integration: a write event fans out through the cache and
//! into a live stream session for a follower, exercised end to end rather
//! than unit-at-a-time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use timeline_core::cache::{CacheConfig, ResultCache};
use timeline_core::fanout;
use timeline_core::metrics::Metrics;
use timeline_core::model::{EventKind, FanoutTask, Note, RankedItem, Signals, Source};
use timeline_core::streaming::{SubscriptionRegistry, TimelineUpdate};
use timeline_core::sources::memory::InMemoryFollowGraph;

fn note(id: &str, author: &str) -> Note {
    Note {
        note_id: id.to_string(),
        author_id: author.to_string(),
        text_content: "hello from the fanout test".to_string(),
        created_at: Utc::now(),
        has_media: false,
        hashtags: vec![],
        mentions: vec![],
        views: 0,
        likes: 0,
        reshares: 0,
        replies: 0,
        quotes: 0,
        nsfw: false,
        author_suspended: false,
    }
}

fn ranked(id: &str, author: &str) -> RankedItem {
    RankedItem {
        note: note(id, author),
        source: Source::Following,
        final_score: 1.0,
        signals: Signals::default(),
        injected_at: Utc::now(),
        injection_reason: "test".to_string(),
    }
}

#[tokio::test]
async fn write_event_invalidates_cache_and_pushes_a_stream_update() {
    let graph = Arc::new(InMemoryFollowGraph::new());
    graph.follow("follower-1", "author-a");

    let metrics = Arc::new(Metrics::new());
    let cache = Arc::new(ResultCache::new(CacheConfig::default(), metrics.clone()));
    cache.put("follower-1", vec![ranked("n1", "author-a")], None).await;

    let streams = Arc::new(SubscriptionRegistry::new(16, 100.0, Duration::from_secs(10), metrics.clone()));
    let session = streams.subscribe("follower-1");

    let (producer, worker) = fanout::channel(16, graph, cache.clone(), streams.clone(), metrics.clone());
    let handle = tokio::spawn(worker.run());

    producer.submit(FanoutTask { note: note("n2", "author-a"), event_kind: EventKind::Created });
    drop(producer);
    handle.await.unwrap();

    assert!(cache.get("follower-1").await.is_none(), "cache must be invalidated after fan-out drains");

    let update = session.recv_update().await;
    assert!(matches!(
        update,
        Some(TimelineUpdate::NewNote { note_id, .. }) if note_id == "n2"
    ));
    assert_eq!(metrics.snapshot().fanout_tasks_processed_total, 1);
}

#[tokio::test]
async fn non_follower_is_unaffected_by_an_authors_write_event() {
    let graph = Arc::new(InMemoryFollowGraph::new());
    graph.follow("follower-1", "author-a");
    // "bystander" does not follow author-a.

    let metrics = Arc::new(Metrics::new());
    let cache = Arc::new(ResultCache::new(CacheConfig::default(), metrics.clone()));
    cache.put("bystander", vec![ranked("n1", "author-b")], None).await;

    let streams = Arc::new(SubscriptionRegistry::new(16, 100.0, Duration::from_secs(10), metrics.clone()));
    let (producer, worker) = fanout::channel(16, graph, cache.clone(), streams, metrics);
    let handle = tokio::spawn(worker.run());

    producer.submit(FanoutTask { note: note("n2", "author-a"), event_kind: EventKind::Created });
    drop(producer);
    handle.await.unwrap();

    assert!(cache.get("bystander").await.is_some(), "a write event for an unrelated author must not invalidate bystander's cache");
}
