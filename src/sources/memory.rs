//! In-memory reference implementations of the candidate-source and
//! follow-graph collaborator interfaces.
//!
//! These origins are treated as opaque external systems; the types here
//! exist only so the pipeline can be exercised end-to-end in tests without a
//! real note store or graph service, the same role the `RecallStrategy`
//! implementations in `ranking-service::services::recall` play relative to
//! `graph-service`/`trending_repo`.

use super::{CandidateSource, FollowGraph};
use crate::model::{Note, Source, TimelineConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Shared backing store of notes, keyed by author. All reference sources
/// read from the same store; tests populate it directly.
#[derive(Debug, Default)]
pub struct NoteStore {
    by_author: DashMap<String, Vec<Note>>,
}

impl NoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, note: Note) {
        self.by_author.entry(note.author_id.clone()).or_default().push(note);
    }

    fn notes_by_authors(
        &self,
        authors: &HashSet<String>,
        since: DateTime<Utc>,
        max_count: usize,
    ) -> Vec<Note> {
        let mut out: Vec<Note> = authors
            .iter()
            .filter_map(|a| self.by_author.get(a))
            .flat_map(|entry| entry.value().clone())
            .filter(|n| n.created_at > since)
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(max_count);
        out
    }
}

/// In-memory follow graph: viewer -> set of followed author ids, plus the
/// reverse index needed by fan-out.
#[derive(Debug, Default)]
pub struct InMemoryFollowGraph {
    following: DashMap<String, HashSet<String>>,
    followers: DashMap<String, HashSet<String>>,
}

impl InMemoryFollowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn follow(&self, viewer_id: &str, author_id: &str) {
        self.following
            .entry(viewer_id.to_string())
            .or_default()
            .insert(author_id.to_string());
        self.followers
            .entry(author_id.to_string())
            .or_default()
            .insert(viewer_id.to_string());
    }
}

#[async_trait]
impl FollowGraph for InMemoryFollowGraph {
    async fn following_of(&self, viewer_id: &str) -> Vec<String> {
        self.following
            .get(viewer_id)
            .map(|s| s.value().iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn followers_of(&self, author_id: &str) -> Vec<String> {
        self.followers
            .get(author_id)
            .map(|s| s.value().iter().cloned().collect())
            .unwrap_or_default()
    }
}

struct CachedFollowSet {
    authors: HashSet<String>,
    fetched_at: Instant,
}

/// Following source. Consults a short-lived in-memory cache of
/// follow-sets (10-minute TTL) before falling back to the follow graph.
pub struct FollowingSource {
    graph: Arc<dyn FollowGraph>,
    notes: Arc<NoteStore>,
    cache: RwLock<std::collections::HashMap<String, CachedFollowSet>>,
    ttl: Duration,
}

impl FollowingSource {
    pub fn new(graph: Arc<dyn FollowGraph>, notes: Arc<NoteStore>) -> Self {
        Self {
            graph,
            notes,
            cache: RwLock::new(std::collections::HashMap::new()),
            ttl: Duration::from_secs(600),
        }
    }

    async fn follow_set(&self, viewer_id: &str) -> HashSet<String> {
        if let Some(cached) = self.cache.read().await.get(viewer_id) {
            if cached.fetched_at.elapsed() < self.ttl {
                return cached.authors.clone();
            }
        }
        let authors: HashSet<String> = self.graph.following_of(viewer_id).await.into_iter().collect();
        self.cache.write().await.insert(
            viewer_id.to_string(),
            CachedFollowSet {
                authors: authors.clone(),
                fetched_at: Instant::now(),
            },
        );
        authors
    }
}

#[async_trait]
impl CandidateSource for FollowingSource {
    fn source(&self) -> Source {
        Source::Following
    }

    async fn fetch(
        &self,
        viewer_id: &str,
        _config: &TimelineConfig,
        since: DateTime<Utc>,
        max_count: usize,
    ) -> Vec<Note> {
        let authors = self.follow_set(viewer_id).await;
        if authors.is_empty() {
            return Vec::new();
        }
        self.notes.notes_by_authors(&authors, since, max_count)
    }
}

/// Recommended source. Prediction is opaque to the pipeline; this
/// reference implementation serves a precomputed per-viewer pool so tests
/// can control exactly what it returns.
pub struct RecommendedSource {
    pool: DashMap<String, Vec<Note>>,
}

impl RecommendedSource {
    pub fn new() -> Self {
        Self { pool: DashMap::new() }
    }

    pub fn set_pool(&self, viewer_id: &str, notes: Vec<Note>) {
        self.pool.insert(viewer_id.to_string(), notes);
    }
}

impl Default for RecommendedSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CandidateSource for RecommendedSource {
    fn source(&self) -> Source {
        Source::Recommended
    }

    async fn fetch(
        &self,
        viewer_id: &str,
        _config: &TimelineConfig,
        since: DateTime<Utc>,
        max_count: usize,
    ) -> Vec<Note> {
        let Some(pool) = self.pool.get(viewer_id) else {
            return Vec::new();
        };
        let mut notes: Vec<Note> = pool.value().iter().filter(|n| n.created_at > since).cloned().collect();
        notes.truncate(max_count);
        notes
    }
}

/// Trending source: viewer-agnostic, elevated-velocity notes.
pub struct TrendingSource {
    notes: RwLock<Vec<Note>>,
}

impl TrendingSource {
    pub fn new() -> Self {
        Self { notes: RwLock::new(Vec::new()) }
    }

    pub async fn set_trending(&self, notes: Vec<Note>) {
        *self.notes.write().await = notes;
    }
}

impl Default for TrendingSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CandidateSource for TrendingSource {
    fn source(&self) -> Source {
        Source::Trending
    }

    async fn fetch(
        &self,
        _viewer_id: &str,
        _config: &TimelineConfig,
        since: DateTime<Utc>,
        max_count: usize,
    ) -> Vec<Note> {
        let notes = self.notes.read().await;
        let mut out: Vec<Note> = notes.iter().filter(|n| n.created_at > since).cloned().collect();
        out.truncate(max_count);
        out
    }
}

/// Lists source: notes authored by members of viewer-curated lists.
pub struct ListsSource {
    list_members: DashMap<String, HashSet<String>>,
    notes: Arc<NoteStore>,
}

impl ListsSource {
    pub fn new(notes: Arc<NoteStore>) -> Self {
        Self {
            list_members: DashMap::new(),
            notes,
        }
    }

    pub fn add_to_list(&self, viewer_id: &str, author_id: &str) {
        self.list_members
            .entry(viewer_id.to_string())
            .or_default()
            .insert(author_id.to_string());
    }
}

#[async_trait]
impl CandidateSource for ListsSource {
    fn source(&self) -> Source {
        Source::Lists
    }

    async fn fetch(
        &self,
        viewer_id: &str,
        _config: &TimelineConfig,
        since: DateTime<Utc>,
        max_count: usize,
    ) -> Vec<Note> {
        let Some(members) = self.list_members.get(viewer_id) else {
            return Vec::new();
        };
        self.notes.notes_by_authors(members.value(), since, max_count)
    }
}
