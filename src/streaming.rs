//! Streaming subscriptions.
//!
//! Grounded on `notification-service::websocket::manager::ConnectionManager`
//! for the per-viewer registry and subscribe/send/broadcast shape, adapted
//! from "one sender per connection" to a bounded-queue `StreamSession` with
//! a per-session token bucket and keep-alive sentinel. The viewer-to-sessions
//! mapping holds only weak references and no back-reference to the viewer;
//! dead entries are pruned lazily on the next observation of that viewer's
//! session list rather than via an eager unregister callback, since this
//! crate has no wire transport to hook a disconnect event to.

use crate::metrics::Metrics;
use crate::model::EventKind;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// One incremental update delivered to a subscriber.
#[derive(Debug, Clone)]
pub enum TimelineUpdate {
    NewNote { note_id: String, event_kind: EventKind },
    Invalidated,
    KeepAlive,
}

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(messages_per_second: f64) -> Self {
        Self {
            tokens: messages_per_second,
            capacity: messages_per_second,
            refill_per_second: messages_per_second,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// One active subscriber connection. Owns the receiving end of a bounded
/// channel and its own token bucket; the sending half is held by the
/// `SubscriptionRegistry` entry that created it.
pub struct StreamSession {
    viewer_id: String,
    receiver: tokio::sync::Mutex<mpsc::Receiver<TimelineUpdate>>,
    open: AtomicBool,
    rate_bucket: std::sync::Mutex<TokenBucket>,
    dropped: AtomicU64,
    heartbeat: std::time::Duration,
}

impl StreamSession {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Blocks for the next update, or returns a `KeepAlive` sentinel if the
    /// heartbeat interval elapses with nothing pending. Returns `None` once
    /// the session is closed and drained; all internal waits return
    /// immediately once the session is closed.
    pub async fn recv_update(&self) -> Option<TimelineUpdate> {
        if !self.is_open() {
            return None;
        }
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            update = receiver.recv() => {
                if update.is_none() {
                    self.close();
                }
                update
            }
            _ = tokio::time::sleep(self.heartbeat) => {
                if self.is_open() {
                    Some(TimelineUpdate::KeepAlive)
                } else {
                    None
                }
            }
        }
    }
}

struct SessionEntry {
    sender: mpsc::Sender<TimelineUpdate>,
    session: Weak<StreamSession>,
}

/// Per-viewer session registry. `subscribe` creates a session and registers
/// its sender keyed by viewer id; `push` delivers to every live session for
/// that viewer, applying each session's own rate limit.
pub struct SubscriptionRegistry {
    sessions: DashMap<String, Vec<SessionEntry>>,
    queue_capacity: usize,
    messages_per_second: f64,
    heartbeat: std::time::Duration,
    metrics: Arc<Metrics>,
}

impl SubscriptionRegistry {
    pub fn new(
        queue_capacity: usize,
        messages_per_second: f64,
        heartbeat: std::time::Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            queue_capacity,
            messages_per_second,
            heartbeat,
            metrics,
        }
    }

    /// Creates a new session for `viewer_id`, registers its sender, and
    /// hands back the `Arc<StreamSession>` the caller polls.
    pub fn subscribe(&self, viewer_id: &str) -> Arc<StreamSession> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let session = Arc::new(StreamSession {
            viewer_id: viewer_id.to_string(),
            receiver: tokio::sync::Mutex::new(rx),
            open: AtomicBool::new(true),
            rate_bucket: std::sync::Mutex::new(TokenBucket::new(self.messages_per_second)),
            dropped: AtomicU64::new(0),
            heartbeat: self.heartbeat,
        });

        self.sessions
            .entry(viewer_id.to_string())
            .or_default()
            .push(SessionEntry { sender: tx, session: Arc::downgrade(&session) });
        debug!(viewer_id, "stream session subscribed");
        session
    }

    /// Pushes an update to every live session for `viewer_id`. Each
    /// session's own rate bucket decides whether the message is actually
    /// delivered or dropped: excess deliveries are dropped, not queued.
    /// Dead weak references observed here are pruned.
    pub fn push(&self, viewer_id: &str, update: TimelineUpdate) {
        let Some(mut entry) = self.sessions.get_mut(viewer_id) else { return };
        entry.retain(|e| {
            let Some(session) = e.session.upgrade() else { return false };
            if session.is_open() {
                if admit_for_delivery(&session) {
                    let _ = e.sender.try_send(update.clone());
                    self.metrics.inc_stream_delivered();
                } else {
                    self.metrics.inc_stream_dropped();
                }
            }
            true
        });
    }

    pub fn session_count(&self, viewer_id: &str) -> usize {
        self.sessions
            .get(viewer_id)
            .map(|e| e.iter().filter(|entry| entry.session.strong_count() > 0).count())
            .unwrap_or(0)
    }
}

/// Applies the per-session token bucket before a delivery attempt;
/// returns `true` if the message should be delivered, `false` if it must be
/// dropped rather than queued, per the session's backpressure policy.
pub fn admit_for_delivery(session: &StreamSession) -> bool {
    let allowed = session.rate_bucket.lock().unwrap().allow();
    if !allowed {
        session.dropped.fetch_add(1, Ordering::Relaxed);
    }
    allowed
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        debug!(viewer_id = %self.viewer_id, "stream session dropped");
    }
}
