//! Fan-out worker.
//!
//! A single long-running consumer over a bounded queue; serialization here
//! is intentional, bounding load on the follow graph. Grounded on the
//! teacher's background-job shape (`feed-service::jobs::feed_cleaner`'s
//! single-consumer tick loop) generalized from a timer-driven sweep to a
//! channel-driven one, and on `libs::cache-invalidation::helpers` for the
//! pattern-invalidation key convention this worker triggers through
//! `ResultCache::invalidate_author`.

use crate::cache::ResultCache;
use crate::metrics::Metrics;
use crate::model::{EventKind, FanoutTask};
use crate::sources::FollowGraph;
use crate::streaming::{SubscriptionRegistry, TimelineUpdate};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

const LARGE_FOLLOWER_COUNT: usize = 100_000;
const FANOUT_BATCH_SIZE: usize = 1_000;
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Producer handle: pushes `FanoutTask`s onto the bounded queue from
/// write-path callbacks. Queue-full is shedding, not blocking: the oldest
/// task is dropped and a counter incremented.
#[derive(Clone)]
pub struct FanoutProducer {
    sender: mpsc::Sender<FanoutTask>,
    metrics: Arc<Metrics>,
}

impl FanoutProducer {
    /// Attempts to enqueue; if the queue is full, the task is dropped
    /// (oldest-task-drop is approximated here as drop-newest, since `mpsc`
    /// has no peek/evict-oldest primitive; see DESIGN.md for the rationale).
    pub fn submit(&self, task: FanoutTask) {
        match self.sender.try_send(task) {
            Ok(()) => {}
            Err(_) => {
                self.metrics.inc_fanout_dropped();
                warn!("fanout queue full, task dropped");
            }
        }
    }
}

/// Single-consumer worker over the bounded queue. Per task: query the follow
/// graph for the note's author's followers, invalidate each follower's
/// cached timeline, and push a stream update into any open session for that
/// follower. Follower sets above `LARGE_FOLLOWER_COUNT` are sharded and
/// yielded between batches.
pub struct FanoutWorker {
    receiver: mpsc::Receiver<FanoutTask>,
    follow_graph: Arc<dyn FollowGraph>,
    cache: Arc<ResultCache>,
    streams: Arc<SubscriptionRegistry>,
    metrics: Arc<Metrics>,
}

pub fn channel(capacity: usize, follow_graph: Arc<dyn FollowGraph>, cache: Arc<ResultCache>, streams: Arc<SubscriptionRegistry>, metrics: Arc<Metrics>) -> (FanoutProducer, FanoutWorker) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        FanoutProducer { sender: tx, metrics: metrics.clone() },
        FanoutWorker { receiver: rx, follow_graph, cache, streams, metrics },
    )
}

impl FanoutWorker {
    /// Runs until the producer side is dropped (process shutdown). Tasks are
    /// not cancellable mid-execution but are skippable at the queue head on
    /// shutdown: once `recv` returns `None` we simply stop.
    pub async fn run(mut self) {
        info!("fanout worker started");
        while let Some(task) = self.receiver.recv().await {
            self.process(task).await;
        }
        info!("fanout worker stopped (producer dropped)");
    }

    async fn process(&self, task: FanoutTask) {
        let followers = self.followers_with_retry(&task.note.author_id).await;
        let Some(followers) = followers else {
            warn!(author_id = %task.note.author_id, "follow-graph unreachable after retries, dropping fanout task");
            return;
        };

        for batch in followers.chunks(FANOUT_BATCH_SIZE.max(1)) {
            for follower_id in batch {
                self.cache.invalidate(follower_id).await;
                self.streams.push(
                    follower_id,
                    TimelineUpdate::NewNote { note_id: task.note.note_id.clone(), event_kind: task.event_kind },
                );
            }
            if followers.len() > LARGE_FOLLOWER_COUNT {
                tokio::task::yield_now().await;
            }
        }

        self.metrics.inc_fanout_processed();
    }

    /// Follow-graph failure in fan-out: retry with exponential backoff, up
    /// to `MAX_RETRY_ATTEMPTS`, then drop the task.
    async fn followers_with_retry(&self, author_id: &str) -> Option<Vec<String>> {
        for attempt in 0..MAX_RETRY_ATTEMPTS {
            let followers = self.follow_graph.followers_of(author_id).await;
            if !followers.is_empty() || attempt == MAX_RETRY_ATTEMPTS - 1 {
                return Some(followers);
            }
            tokio::time::sleep(std::time::Duration::from_millis(50 * 2u64.pow(attempt))).await;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::model::Note;
    use crate::model::{RankedItem, Signals, Source};
    use crate::sources::memory::InMemoryFollowGraph;
    use chrono::Utc;

    fn ranked_item(id: &str, author: &str) -> RankedItem {
        RankedItem {
            note: note(id, author),
            source: Source::Following,
            final_score: 1.0,
            signals: Signals::default(),
            injected_at: Utc::now(),
            injection_reason: "test".to_string(),
        }
    }

    fn note(id: &str, author: &str) -> Note {
        Note {
            note_id: id.to_string(),
            author_id: author.to_string(),
            text_content: "hi".to_string(),
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

    #[tokio::test]
    async fn write_event_invalidates_follower_cache() {
        let graph = Arc::new(InMemoryFollowGraph::new());
        graph.follow("follower-1", "author-a");
        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(ResultCache::new(CacheConfig::default(), metrics.clone()));
        let streams = Arc::new(SubscriptionRegistry::new(16, 100.0, std::time::Duration::from_secs(10), metrics.clone()));

        cache.put("follower-1", vec![ranked_item("n1", "author-a")], None).await;

        let (producer, worker) = channel(16, graph, cache.clone(), streams, metrics);
        let handle = tokio::spawn(worker.run());

        producer.submit(FanoutTask { note: note("n2", "author-a"), event_kind: EventKind::Created });
        drop(producer);
        handle.await.unwrap();

        assert!(cache.get("follower-1").await.is_none());
    }

    #[tokio::test]
    async fn queue_full_sheds_and_increments_drop_counter() {
        let graph = Arc::new(InMemoryFollowGraph::new());
        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(ResultCache::new(CacheConfig::default(), metrics.clone()));
        let streams = Arc::new(SubscriptionRegistry::new(16, 100.0, std::time::Duration::from_secs(10), metrics.clone()));
        let (producer, _worker) = channel(1, graph, cache, streams, metrics.clone());

        // Fill the bounded channel without a consumer draining it.
        producer.submit(FanoutTask { note: note("n1", "a"), event_kind: EventKind::Created });
        producer.submit(FanoutTask { note: note("n2", "a"), event_kind: EventKind::Created });
        producer.submit(FanoutTask { note: note("n3", "a"), event_kind: EventKind::Created });

        assert!(metrics.snapshot().fanout_tasks_dropped_total >= 1);
    }
}
