//! Result cache.
//!
//! Two-tier by contract: an optional `RemoteCache` trait object (required to
//! be nothing more than a "best-effort external KV") and a mandatory
//! in-process tier. Every operation tries the remote tier first when
//! configured and falls back to (and populates) the in-process tier on a
//! miss or remote error, mirroring `feed-service`'s Redis-backed `FeedCache`
//! but with an always-available local fallback since a real deployment's
//! Redis can be down: a remote cache failure proceeds with the in-process
//! tier rather than surfacing as an error.
//!
//! Keys mirror `feed-service`'s `feed:{id}` / `post:{id}` convention, adapted
//! to this crate's own remote-tier namespaces: `timeline:{viewer_id}`,
//! `profile:{viewer_id}`, `lastread:{viewer_id}`.

use crate::metrics::Metrics;
use crate::model::{RankedItem, ViewerProfile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Best-effort external KV collaborator. Nothing is pinned about its
/// internal semantics; this crate requires only that the two tiers be
/// semantically equivalent, not byte-compatible.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    async fn get_timeline(&self, viewer_id: &str) -> anyhow::Result<Option<Vec<RankedItem>>>;
    async fn put_timeline(&self, viewer_id: &str, items: &[RankedItem], ttl_secs: u64) -> anyhow::Result<()>;
    async fn delete_timeline(&self, viewer_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3600,
            max_entries: 10_000,
        }
    }
}

struct TimelineEntry {
    items: Vec<RankedItem>,
    expires_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
}

struct ProfileEntry {
    profile: ViewerProfile,
    expires_at: DateTime<Utc>,
}

/// The mandatory in-process tier plus an optional pluggable remote tier.
/// Bounded entry count with least-recently-accessed eviction, lazy TTL
/// discovery on read, and an author-index to bound `invalidate_author` cost.
pub struct ResultCache {
    remote: Option<Arc<dyn RemoteCache>>,
    timelines: DashMap<String, TimelineEntry>,
    profiles: DashMap<String, ProfileEntry>,
    last_read: DashMap<String, DateTime<Utc>>,
    /// author_id -> viewer_ids whose cached timeline contains that author.
    author_index: DashMap<String, HashSet<String>>,
    order: Mutex<Vec<String>>,
    config: CacheConfig,
    evictions: AtomicU64,
    metrics: Arc<Metrics>,
}

impl ResultCache {
    pub fn new(config: CacheConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            remote: None,
            timelines: DashMap::new(),
            profiles: DashMap::new(),
            last_read: DashMap::new(),
            author_index: DashMap::new(),
            order: Mutex::new(Vec::new()),
            config,
            evictions: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteCache>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get the cached timeline for a viewer, if present and unexpired.
    /// Cache entries never outlive their TTL on read.
    pub async fn get(&self, viewer_id: &str) -> Option<Vec<RankedItem>> {
        if let Some(remote) = &self.remote {
            match remote.get_timeline(viewer_id).await {
                Ok(Some(items)) => {
                    debug!(viewer_id, "remote cache hit");
                    return Some(items);
                }
                Ok(None) => {}
                Err(e) => warn!(viewer_id, error = %e, "remote cache get failed, falling back to in-process tier"),
            }
        }

        let now = Utc::now();
        let hit = self.timelines.get(viewer_id).map(|e| e.expires_at > now).unwrap_or(false);
        if !hit {
            if self.timelines.remove(viewer_id).is_some() {
                debug!(viewer_id, "in-process cache entry expired");
            }
            return None;
        }

        let items = {
            let mut entry = self.timelines.get_mut(viewer_id).unwrap();
            entry.last_accessed = now;
            entry.items.clone()
        };
        self.touch_order(viewer_id).await;
        Some(items)
    }

    /// Writes through both tiers and indexes authors for pattern invalidation.
    pub async fn put(&self, viewer_id: &str, items: Vec<RankedItem>, ttl: Option<std::time::Duration>) {
        let ttl_secs = ttl.map(|d| d.as_secs()).unwrap_or(self.config.default_ttl_secs);
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(ttl_secs as i64);

        if let Some(remote) = &self.remote {
            if let Err(e) = remote.put_timeline(viewer_id, &items, ttl_secs).await {
                warn!(viewer_id, error = %e, "remote cache put failed, continuing with in-process tier");
            }
        }

        self.unindex_authors(viewer_id);
        for item in &items {
            self.author_index
                .entry(item.note.author_id.clone())
                .or_default()
                .insert(viewer_id.to_string());
        }

        self.timelines.insert(
            viewer_id.to_string(),
            TimelineEntry {
                items,
                expires_at,
                last_accessed: now,
            },
        );
        self.touch_order(viewer_id).await;
        self.evict_if_over_capacity().await;
    }

    pub async fn invalidate(&self, viewer_id: &str) {
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.delete_timeline(viewer_id).await {
                warn!(viewer_id, error = %e, "remote cache delete failed");
            }
        }
        self.timelines.remove(viewer_id);
        self.unindex_authors(viewer_id);
        self.order.lock().await.retain(|v| v != viewer_id);
    }

    /// Drops any cached timeline containing a note by this author, using
    /// the author-index so the cost stays bounded by the number of viewers
    /// actually affected rather than a full scan.
    pub async fn invalidate_author(&self, author_id: &str) {
        let Some((_, viewers)) = self.author_index.remove(author_id) else {
            return;
        };
        for viewer_id in viewers {
            self.invalidate(&viewer_id).await;
        }
    }

    pub fn get_profile(&self, viewer_id: &str) -> Option<ViewerProfile> {
        let now = Utc::now();
        match self.profiles.get(viewer_id) {
            Some(entry) if entry.expires_at > now => Some(entry.profile.clone()),
            Some(_) => {
                self.profiles.remove(viewer_id);
                None
            }
            None => None,
        }
    }

    pub fn put_profile(&self, viewer_id: &str, profile: ViewerProfile, ttl: std::time::Duration) {
        self.profiles.insert(
            viewer_id.to_string(),
            ProfileEntry {
                profile,
                expires_at: Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64),
            },
        );
    }

    pub fn get_last_read(&self, viewer_id: &str) -> DateTime<Utc> {
        self.last_read
            .get(viewer_id)
            .map(|v| *v)
            .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC)
    }

    /// Monotonic: a new marker strictly before the stored one is ignored.
    pub fn set_last_read(&self, viewer_id: &str, instant: DateTime<Utc>) {
        let mut entry = self.last_read.entry(viewer_id.to_string()).or_insert(instant);
        if instant > *entry {
            *entry = instant;
        }
    }

    fn unindex_authors(&self, viewer_id: &str) {
        self.author_index.retain(|_, viewers| {
            viewers.remove(viewer_id);
            !viewers.is_empty()
        });
    }

    async fn touch_order(&self, viewer_id: &str) {
        let mut order = self.order.lock().await;
        order.retain(|v| v != viewer_id);
        order.push(viewer_id.to_string());
    }

    /// LRU eviction once over `max_entries`.
    async fn evict_if_over_capacity(&self) {
        if self.timelines.len() <= self.config.max_entries {
            return;
        }
        let mut order = self.order.lock().await;
        while self.timelines.len() > self.config.max_entries {
            if let Some(oldest) = order.first().cloned() {
                order.remove(0);
                if self.timelines.remove(&oldest).is_some() {
                    self.unindex_authors(&oldest);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    self.metrics.inc_cache_eviction();
                    debug!(viewer_id = %oldest, "evicted from result cache (LRU)");
                }
            } else {
                break;
            }
        }
    }
}
