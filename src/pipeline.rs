//! Pipeline: orchestrates candidate sources, the content filter, the ranker,
//! the result cache, and admission control into the three read entry points
//! plus the refresh/engagement/mark-read write operations.
//!
//! Grounded on the fetch -> dedupe -> filter -> score -> paginate shape of
//! `ranking-service::services::feed_assembler` (see DESIGN.md), generalized
//! to the per-source quota/cap/deadline machinery and the optional external
//! re-rank step this pipeline adds on top of that shape.

use crate::admission::{authorize, CallerClaims, EndpointClass, RateLimiter};
use crate::cache::ResultCache;
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::filter::ContentFilter;
use crate::metrics::Metrics;
use crate::model::{
    AbWeights, Algorithm, EngagementAction, Note, Page, PaginationInfo, RankedItem,
    RankedItemView, ResponseMetadata, Source, SourceCaps, SourceMix, TimelineConfig,
    TimelineResponse, ViewerProfile,
};
use crate::ranker::Ranker;
use crate::sources::{CandidateSource, FollowGraph};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::warn;

const DEFAULT_REQUEST_DEADLINE: StdDuration = StdDuration::from_secs(30);
const PER_SOURCE_DEADLINE_SHARE: f64 = 0.4;

/// External preference-of-record collaborator. Core treats the real profile
/// store as opaque; a miss here is not an error, it is the NONE -> DEFAULTED
/// transition of the `ViewerProfile` state machine.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn load_profile(&self, viewer_id: &str) -> Option<ViewerProfile>;
}

/// Reference `PreferenceStore` that always defers to the DEFAULTED state.
/// Exists for the same reason the in-memory candidate sources do: real
/// preference storage is out of scope and opaque to this crate.
#[derive(Debug, Default)]
pub struct NullPreferenceStore;

#[async_trait]
impl PreferenceStore for NullPreferenceStore {
    async fn load_profile(&self, _viewer_id: &str) -> Option<ViewerProfile> {
        None
    }
}

/// The optional external heavy-ranker ("Overdrive").
#[async_trait]
pub trait HeavyReranker: Send + Sync {
    /// Returns `(note_id, score)` pairs for as many of `candidate_ids` as it
    /// chose to rank. Unreturned ids keep their pre-existing score.
    async fn rank_for_you(
        &self,
        viewer_id: &str,
        candidate_ids: Vec<String>,
        limit: usize,
    ) -> anyhow::Result<Vec<(String, f64)>>;
}

/// Per-request overrides accepted from headers/metadata.
#[derive(Debug, Clone, Default)]
pub struct RequestOverrides {
    pub ab_weights: Option<AbWeights>,
    pub caps: Option<SourceCaps>,
    /// For-You only; scales non-following ratios to sum to this share.
    pub discovery_share: Option<f64>,
    pub use_overdrive: bool,
    /// `x-rate-rpm`: may only lower the configured rate, never raise it.
    pub rate_rpm_override: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct GetTimelineRequest {
    pub viewer_id: String,
    /// `UNSPECIFIED` is modeled as `None`; General honors an explicit choice
    /// here, For-You/Following force their own regardless.
    pub algorithm: Option<Algorithm>,
    pub offset: usize,
    pub limit: usize,
    /// Whether the response's projected items carry `signals`.
    pub include_ranking_signals: bool,
    pub overrides: RequestOverrides,
}

impl Default for GetTimelineRequest {
    fn default() -> Self {
        Self {
            viewer_id: String::new(),
            algorithm: None,
            offset: 0,
            limit: 20,
            include_ranking_signals: false,
            overrides: RequestOverrides::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryPoint {
    General,
    ForYou,
    Following,
}

pub struct Pipeline {
    config: Config,
    sources: Vec<Arc<dyn CandidateSource>>,
    follow_graph: Arc<dyn FollowGraph>,
    preferences: Arc<dyn PreferenceStore>,
    filter: ContentFilter,
    ranker: Ranker,
    cache: Arc<ResultCache>,
    admission: RateLimiter,
    metrics: Arc<Metrics>,
    reranker: Option<Arc<dyn HeavyReranker>>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        sources: Vec<Arc<dyn CandidateSource>>,
        follow_graph: Arc<dyn FollowGraph>,
        preferences: Arc<dyn PreferenceStore>,
        cache: Arc<ResultCache>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            sources,
            follow_graph,
            preferences,
            filter: ContentFilter::new(),
            ranker: Ranker::new(),
            cache,
            admission: RateLimiter::new(),
            metrics,
            reranker: None,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn HeavyReranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn ranker(&self) -> &Ranker {
        &self.ranker
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn admission(&self) -> &RateLimiter {
        &self.admission
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// General entry point: the full algorithm and resolved config.
    pub async fn get_timeline(&self, claims: &CallerClaims, request: GetTimelineRequest) -> Result<TimelineResponse> {
        let include_signals = request.include_ranking_signals;
        let viewer_id = request.viewer_id.clone();
        let (page, config) = self.run(claims, request, EntryPoint::General).await?;
        Ok(self.to_response(&viewer_id, page, config, include_signals))
    }

    /// For-You: forces a HYBRID-style algorithm; accepts discovery-share
    /// overrides.
    pub async fn get_for_you(&self, claims: &CallerClaims, mut request: GetTimelineRequest) -> Result<TimelineResponse> {
        request.algorithm = Some(Algorithm::Hybrid);
        let include_signals = request.include_ranking_signals;
        let viewer_id = request.viewer_id.clone();
        let (page, config) = self.run(claims, request, EntryPoint::ForYou).await?;
        Ok(self.to_response(&viewer_id, page, config, include_signals))
    }

    /// Following: forces CHRONOLOGICAL, following_ratio = 1, all others = 0.
    pub async fn get_following(&self, claims: &CallerClaims, mut request: GetTimelineRequest) -> Result<TimelineResponse> {
        request.algorithm = Some(Algorithm::Chronological);
        let include_signals = request.include_ranking_signals;
        let viewer_id = request.viewer_id.clone();
        let (page, config) = self.run(claims, request, EntryPoint::Following).await?;
        Ok(self.to_response(&viewer_id, page, config, include_signals))
    }

    /// Builds the metadata/pagination blocks around one assembled page.
    /// `new_items_since_last_fetch` counts items on the page newer than the
    /// viewer's current last-read marker.
    fn to_response(&self, viewer_id: &str, page: Page, config: TimelineConfig, include_signals: bool) -> TimelineResponse {
        let last_read = self.cache.get_last_read(viewer_id);
        let new_items_since_last_fetch = page.items.iter().filter(|i| i.note.created_at > last_read).count();
        let metadata = ResponseMetadata {
            algorithm: config.algorithm,
            signal_weights: config.weights,
            total_items: page.total_count,
            new_items_since_last_fetch,
            last_updated: Utc::now(),
        };
        let pagination = PaginationInfo {
            offset: page.offset,
            limit: page.limit,
            total_count: page.total_count,
            has_next: page.has_next,
        };
        TimelineResponse {
            items: page.items.iter().map(|i| RankedItemView::project(i, include_signals)).collect(),
            metadata,
            pagination,
        }
    }

    /// `RefreshTimeline`: forces a cache invalidation and returns only items
    /// newer than `since`.
    pub async fn refresh_timeline(
        &self,
        claims: &CallerClaims,
        viewer_id: &str,
        since: DateTime<Utc>,
        max_items: usize,
    ) -> Result<Page> {
        if !authorize(claims, viewer_id) {
            return Err(PipelineError::Unauthorized);
        }
        self.cache.invalidate(viewer_id).await;

        let request = GetTimelineRequest {
            viewer_id: viewer_id.to_string(),
            algorithm: None,
            offset: 0,
            limit: max_items,
            include_ranking_signals: true,
            overrides: RequestOverrides::default(),
        };
        let (page, _config) = self.run(claims, request, EntryPoint::General).await?;
        let items: Vec<RankedItem> = page.items.into_iter().filter(|i| i.note.created_at > since).collect();
        let total_count = items.len();
        Ok(Page {
            items,
            offset: 0,
            limit: max_items,
            total_count,
            has_next: false,
        })
    }

    /// `RecordEngagement`: feeds the ranker's affinity tables.
    pub fn record_engagement(
        &self,
        claims: &CallerClaims,
        viewer_id: &str,
        note: &Note,
        action: EngagementAction,
    ) -> Result<()> {
        if !authorize(claims, viewer_id) {
            return Err(PipelineError::Unauthorized);
        }
        self.ranker.record_engagement(viewer_id, note, action);
        Ok(())
    }

    /// `MarkTimelineRead`: advances the monotonic last-read marker.
    pub fn mark_timeline_read(
        &self,
        claims: &CallerClaims,
        viewer_id: &str,
        read_until: DateTime<Utc>,
    ) -> Result<()> {
        if !authorize(claims, viewer_id) {
            return Err(PipelineError::Unauthorized);
        }
        self.cache.set_last_read(viewer_id, read_until);
        Ok(())
    }

    async fn run(
        &self,
        claims: &CallerClaims,
        request: GetTimelineRequest,
        entry: EntryPoint,
    ) -> Result<(Page, TimelineConfig)> {
        if request.viewer_id.trim().is_empty() {
            return Err(PipelineError::InvalidArgument("viewer_id must not be empty".to_string()));
        }

        // Step 1: admission.
        if !authorize(claims, &request.viewer_id) {
            return Err(PipelineError::Unauthorized);
        }
        if !self.admission.allow(EndpointClass::Timeline, &claims.caller_id, request.overrides.rate_rpm_override) {
            self.metrics.inc_rate_limited();
            return Err(PipelineError::RateLimited);
        }

        // Step 2: config resolution.
        let profile = self.resolve_profile(&request.viewer_id).await;
        let config = self.resolve_config(&request, entry);

        // Step 3: cache probe. A single canonical cache slot per viewer_id;
        // the entry points share it rather than each keeping a private copy,
        // so a write-path invalidation invalidates every entry point at once
        // with a single `cache.invalidate(viewer_id)` call.
        if let Some(cached) = self.cache.get(&request.viewer_id).await {
            self.metrics.inc_cache_hit();
            return Ok((paginate(cached, request.offset, request.limit), config));
        }
        self.metrics.inc_cache_miss();

        // Step 4: candidate fetch with per-source quotas and deadlines.
        let now = Utc::now();
        let since = now - chrono::Duration::milliseconds((config.max_age_hours * 3_600_000.0) as i64);
        let per_source_deadline = StdDuration::from_millis(
            (DEFAULT_REQUEST_DEADLINE.as_millis() as f64 * PER_SOURCE_DEADLINE_SHARE) as u64,
        );

        let mut fetches = FuturesUnordered::new();
        for source in &self.sources {
            let kind = source.source();
            let ratio = config.mix.ratio_for(kind) * config.ab_weights.weight_for(kind);
            let limit_source = ((config.max_items as f64) * ratio).floor() as usize;
            let limit_source = limit_source.min(config.caps.cap_for(kind));
            if limit_source == 0 {
                continue;
            }
            let source = Arc::clone(source);
            let viewer_id = request.viewer_id.clone();
            fetches.push(async move {
                let notes = match tokio::time::timeout(
                    per_source_deadline,
                    source.fetch(&viewer_id, &config, since, limit_source),
                )
                .await
                {
                    Ok(notes) => notes,
                    Err(_) => {
                        warn!(source = ?kind, viewer_id = %viewer_id, "candidate source exceeded its soft deadline, treating as empty");
                        Vec::new()
                    }
                };
                (kind, notes)
            });
        }

        let mut any_returned = fetches.is_empty();
        let mut best_source: HashMap<String, (Source, Note)> = HashMap::new();
        let deadline_sleep = tokio::time::sleep(DEFAULT_REQUEST_DEADLINE);
        tokio::pin!(deadline_sleep);
        loop {
            tokio::select! {
                next = fetches.next() => {
                    match next {
                        Some((kind, notes)) => {
                            any_returned = true;
                            for note in notes {
                                // Dedupe by note_id: lower source ordinal wins.
                                match best_source.get(&note.note_id) {
                                    Some((existing_kind, _)) if existing_kind.ordinal() <= kind.ordinal() => {}
                                    _ => {
                                        best_source.insert(note.note_id.clone(), (kind, note));
                                    }
                                }
                            }
                        }
                        None => break,
                    }
                }
                _ = &mut deadline_sleep => {
                    warn!(viewer_id = %request.viewer_id, "request deadline exceeded, proceeding with whatever candidates returned");
                    break;
                }
            }
        }
        if !any_returned {
            return Err(PipelineError::DeadlineExceeded);
        }

        let source_map: HashMap<String, Source> =
            best_source.iter().map(|(id, (kind, _))| (id.clone(), *kind)).collect();
        let notes: Vec<Note> = best_source.into_values().map(|(_, note)| note).collect();

        // Step 6: filter, fail-closed on a panic inside the filter.
        let filtered = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.filter.filter(notes, &profile))) {
            Ok(filtered) => filtered,
            Err(_) => {
                return Err(PipelineError::internal(anyhow::anyhow!("content filter failed unexpectedly")));
            }
        };

        // Step 7: score. Ranker failure falls back to CHRONOLOGICAL and
        // records a warning counter rather than failing the request.
        let source_of = |id: &str| source_map.get(id).copied().unwrap_or(Source::Recommended);
        let ranked = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.ranker.score(filtered.clone(), &request.viewer_id, &profile, &config, source_of, now)
        })) {
            Ok(items) => items,
            Err(_) => {
                self.metrics.inc_ranker_fallback();
                warn!(viewer_id = %request.viewer_id, "ranker failed, falling back to chronological ordering");
                let mut fallback_config = config;
                fallback_config.algorithm = Algorithm::Chronological;
                self.ranker.score(filtered, &request.viewer_id, &profile, &fallback_config, source_of, now)
            }
        };

        // Step 8: cap enforcement.
        let mut capped: Vec<RankedItem> = Vec::new();
        let mut per_source_counts: HashMap<Source, usize> = HashMap::new();
        for item in ranked {
            if capped.len() >= config.max_items {
                break;
            }
            if item.final_score < config.min_score_threshold {
                break;
            }
            let cap = config.caps.cap_for(item.source);
            let count = per_source_counts.entry(item.source).or_insert(0);
            if *count >= cap {
                continue;
            }
            *count += 1;
            capped.push(item);
        }

        // Step 9: optional external re-rank via the "Overdrive" heavy-ranker.
        let mut final_items = capped;
        if request.overrides.use_overdrive {
            if let Some(reranker) = &self.reranker {
                let candidate_ids: Vec<String> = final_items.iter().map(|i| i.note.note_id.clone()).collect();
                match reranker.rank_for_you(&request.viewer_id, candidate_ids, config.max_items).await {
                    Ok(scores) => {
                        let score_map: HashMap<String, f64> = scores.into_iter().collect();
                        for item in final_items.iter_mut() {
                            if let Some(&new_score) = score_map.get(item.note_id()) {
                                item.final_score = new_score.max(0.0);
                            }
                        }
                        final_items.sort_by(|a, b| {
                            b.final_score
                                .partial_cmp(&a.final_score)
                                .unwrap_or(std::cmp::Ordering::Equal)
                                .then_with(|| b.note.created_at.cmp(&a.note.created_at))
                                .then_with(|| a.note.note_id.cmp(&b.note.note_id))
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, viewer_id = %request.viewer_id, "heavy reranker call failed, keeping existing ranking");
                    }
                }
            }
        }

        // Step 10: cache write-back.
        self.cache.put(&request.viewer_id, final_items.clone(), None).await;

        // Step 11: paginate.
        Ok((paginate(final_items, request.offset, request.limit), config))
    }

    async fn resolve_profile(&self, viewer_id: &str) -> ViewerProfile {
        let ttl = StdDuration::from_secs(self.config.cache.profile_ttl_secs);
        let mut profile = match self.cache.get_profile(viewer_id) {
            Some(profile) => profile,
            None => {
                let profile = self
                    .preferences
                    .load_profile(viewer_id)
                    .await
                    .unwrap_or_else(|| ViewerProfile::defaulted(viewer_id, Utc::now()));
                self.cache.put_profile(viewer_id, profile.clone(), ttl);
                profile
            }
        };
        let following = self.follow_graph.following_of(viewer_id).await;
        profile.follow_set.extend(following);
        profile
    }

    fn resolve_config(&self, request: &GetTimelineRequest, entry: EntryPoint) -> TimelineConfig {
        let mut config = self.config.timeline.resolve();
        if let Some(algorithm) = request.algorithm {
            config.algorithm = algorithm;
        }
        if let Some(ab_weights) = request.overrides.ab_weights {
            config.ab_weights = ab_weights;
        }
        if let Some(caps) = request.overrides.caps {
            config.caps = caps;
        }
        config.use_overdrive = request.overrides.use_overdrive;

        match entry {
            EntryPoint::General => {}
            EntryPoint::ForYou => {
                config.algorithm = Algorithm::Hybrid;
                if let Some(share) = request.overrides.discovery_share {
                    config.mix = config.mix.with_discovery_share(share);
                }
            }
            EntryPoint::Following => {
                config.algorithm = Algorithm::Chronological;
                config.mix = SourceMix {
                    following: 1.0,
                    recommended: 0.0,
                    trending: 0.0,
                    lists: 0.0,
                };
            }
        }
        config
    }
}

/// Offset clamped to [0, size]; `has_next = offset + limit < size`.
fn paginate(items: Vec<RankedItem>, offset: usize, limit: usize) -> Page {
    let total_count = items.len();
    let offset = offset.min(total_count);
    let end = offset.saturating_add(limit).min(total_count);
    let has_next = offset + limit < total_count;
    Page {
        items: items[offset..end].to_vec(),
        offset,
        limit,
        total_count,
        has_next,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::sources::memory::{FollowingSource, InMemoryFollowGraph, ListsSource, NoteStore, RecommendedSource, TrendingSource};
    use chrono::Duration as ChronoDuration;

    fn note(id: &str, author: &str, created_at: DateTime<Utc>) -> Note {
        Note {
            note_id: id.to_string(),
            author_id: author.to_string(),
            text_content: "a reasonably long note body for testing purposes".to_string(),
            created_at,
            has_media: false,
            hashtags: vec![],
            mentions: vec![],
            views: 10,
            likes: 1,
            reshares: 0,
            replies: 0,
            quotes: 0,
            nsfw: false,
            author_suspended: false,
        }
    }

    struct FixedProfileStore(ViewerProfile);

    #[async_trait]
    impl PreferenceStore for FixedProfileStore {
        async fn load_profile(&self, _viewer_id: &str) -> Option<ViewerProfile> {
            Some(self.0.clone())
        }
    }

    fn claims(caller_id: &str) -> CallerClaims {
        CallerClaims { caller_id: caller_id.to_string(), is_admin: false }
    }

    fn build_pipeline(
        sources: Vec<Arc<dyn CandidateSource>>,
        graph: Arc<dyn FollowGraph>,
        preferences: Arc<dyn PreferenceStore>,
    ) -> Pipeline {
        Pipeline::new(
            Config::default(),
            sources,
            graph,
            preferences,
            Arc::new(ResultCache::new(CacheConfig::default(), Arc::new(Metrics::new()))),
            Arc::new(Metrics::new()),
        )
    }

    /// Pure chronological ordering.
    #[tokio::test]
    async fn chronological_entry_orders_by_recency() {
        let graph = Arc::new(InMemoryFollowGraph::new());
        graph.follow("v", "a");
        graph.follow("v", "b");

        let now = Utc::now();
        let store = Arc::new(NoteStore::new());
        store.insert(note("n1", "a", now - ChronoDuration::seconds(5)));
        store.insert(note("n2", "b", now - ChronoDuration::seconds(0)));
        store.insert(note("n3", "a", now - ChronoDuration::seconds(10)));

        let following = Arc::new(FollowingSource::new(graph.clone(), store)) as Arc<dyn CandidateSource>;
        let pipeline = build_pipeline(vec![following], graph, Arc::new(NullPreferenceStore));

        let request = GetTimelineRequest {
            viewer_id: "v".to_string(),
            algorithm: Some(Algorithm::Chronological),
            offset: 0,
            limit: 10,
            include_ranking_signals: false,
            overrides: RequestOverrides::default(),
        };
        let page = pipeline.get_timeline(&claims("v"), request).await.unwrap();
        let ids: Vec<_> = page.items.iter().map(|i| i.note_id().to_string()).collect();
        assert_eq!(ids, vec!["n2", "n1", "n3"]);
        assert!(page.items.iter().all(|i| i.source == Source::Following));
    }

    /// Dedup across sources, lower-ordinal source wins.
    #[tokio::test]
    async fn dedup_prefers_following_over_recommended() {
        let graph = Arc::new(InMemoryFollowGraph::new());
        graph.follow("v", "a");

        let now = Utc::now();
        let store = Arc::new(NoteStore::new());
        store.insert(note("n1", "a", now));
        store.insert(note("n2", "a", now));

        let recommended = Arc::new(RecommendedSource::new());
        recommended.set_pool("v", vec![note("n2", "a", now), note("n3", "z", now)]);

        let following = Arc::new(FollowingSource::new(graph.clone(), store)) as Arc<dyn CandidateSource>;
        let recommended = recommended as Arc<dyn CandidateSource>;
        let pipeline = build_pipeline(vec![following, recommended], graph, Arc::new(NullPreferenceStore));

        let request = GetTimelineRequest {
            viewer_id: "v".to_string(),
            algorithm: None,
            offset: 0,
            limit: 10,
            include_ranking_signals: false,
            overrides: RequestOverrides::default(),
        };
        let page = pipeline.get_timeline(&claims("v"), request).await.unwrap();
        let ids: std::collections::HashSet<_> = page.items.iter().map(|i| i.note_id().to_string()).collect();
        assert_eq!(ids, ["n1", "n2", "n3"].into_iter().map(String::from).collect());
        let n2 = page.items.iter().find(|i| i.note_id() == "n2").unwrap();
        assert_eq!(n2.source, Source::Following);
    }

    /// Mute takes effect.
    #[tokio::test]
    async fn muted_author_is_removed() {
        let graph = Arc::new(InMemoryFollowGraph::new());
        graph.follow("v", "a");
        graph.follow("v", "b");

        let now = Utc::now();
        let store = Arc::new(NoteStore::new());
        store.insert(note("n1", "a", now));
        store.insert(note("n2", "b", now));

        let mut profile = ViewerProfile::defaulted("v", now);
        profile.muted_users.insert("a".to_string());

        let following = Arc::new(FollowingSource::new(graph.clone(), store)) as Arc<dyn CandidateSource>;
        let pipeline = build_pipeline(vec![following], graph, Arc::new(FixedProfileStore(profile)));

        let request = GetTimelineRequest {
            viewer_id: "v".to_string(),
            algorithm: None,
            offset: 0,
            limit: 10,
            include_ranking_signals: false,
            overrides: RequestOverrides::default(),
        };
        let page = pipeline.get_timeline(&claims("v"), request).await.unwrap();
        let ids: Vec<_> = page.items.iter().map(|i| i.note_id().to_string()).collect();
        assert_eq!(ids, vec!["n2"]);
    }

    /// Cap enforcement.
    #[tokio::test]
    async fn source_cap_is_enforced() {
        let graph = Arc::new(InMemoryFollowGraph::new());
        graph.follow("v", "a");

        let now = Utc::now();
        let store = Arc::new(NoteStore::new());
        for i in 0..5 {
            store.insert(note(&format!("f{i}"), "a", now - ChronoDuration::seconds(i)));
        }
        let recommended = Arc::new(RecommendedSource::new());
        recommended.set_pool(
            "v",
            (0..5).map(|i| note(&format!("r{i}"), "z", now - ChronoDuration::seconds(i))).collect(),
        );

        let following = Arc::new(FollowingSource::new(graph.clone(), store)) as Arc<dyn CandidateSource>;
        let recommended = recommended as Arc<dyn CandidateSource>;
        let pipeline = build_pipeline(vec![following, recommended], graph, Arc::new(NullPreferenceStore));

        let mut caps = SourceCaps::default();
        caps.following = 2;
        let request = GetTimelineRequest {
            viewer_id: "v".to_string(),
            algorithm: None,
            offset: 0,
            limit: 10,
            include_ranking_signals: false,
            overrides: RequestOverrides {
                caps: Some(caps),
                ..RequestOverrides::default()
            },
        };
        let page = pipeline.get_timeline(&claims("v"), request).await.unwrap();
        let following_count = page.items.iter().filter(|i| i.source == Source::Following).count();
        assert!(following_count <= 2, "following cap must be honored: got {following_count}");
        assert!(page.items.iter().any(|i| i.source == Source::Recommended), "remainder filled by recommended");
    }

    /// Rate limit.
    #[tokio::test]
    async fn second_request_within_window_is_rate_limited() {
        let graph = Arc::new(InMemoryFollowGraph::new());
        let pipeline = build_pipeline(vec![], graph, Arc::new(NullPreferenceStore));
        pipeline.admission().configure_default(
            EndpointClass::Timeline,
            crate::admission::EndpointDefaults { rpm: 1.0, burst: 1.0 },
        );

        let request = || GetTimelineRequest {
            viewer_id: "v".to_string(),
            algorithm: None,
            offset: 0,
            limit: 10,
            include_ranking_signals: false,
            overrides: RequestOverrides::default(),
        };
        assert!(pipeline.get_timeline(&claims("v"), request()).await.is_ok());
        let second = pipeline.get_timeline(&claims("v"), request()).await;
        assert!(matches!(second, Err(PipelineError::RateLimited)));
    }

    #[tokio::test]
    async fn unauthorized_caller_is_rejected() {
        let graph = Arc::new(InMemoryFollowGraph::new());
        let pipeline = build_pipeline(vec![], graph, Arc::new(NullPreferenceStore));
        let request = GetTimelineRequest {
            viewer_id: "someone-else".to_string(),
            algorithm: None,
            offset: 0,
            limit: 10,
            include_ranking_signals: false,
            overrides: RequestOverrides::default(),
        };
        let result = pipeline.get_timeline(&claims("v"), request).await;
        assert!(matches!(result, Err(PipelineError::Unauthorized)));
    }

    #[tokio::test]
    async fn zero_limit_returns_empty_page_with_correct_has_next() {
        let graph = Arc::new(InMemoryFollowGraph::new());
        graph.follow("v", "a");
        let store = Arc::new(NoteStore::new());
        store.insert(note("n1", "a", Utc::now()));
        let following = Arc::new(FollowingSource::new(graph.clone(), store)) as Arc<dyn CandidateSource>;
        let pipeline = build_pipeline(vec![following], graph, Arc::new(NullPreferenceStore));

        let request = GetTimelineRequest {
            viewer_id: "v".to_string(),
            algorithm: None,
            offset: 0,
            limit: 0,
            include_ranking_signals: false,
            overrides: RequestOverrides::default(),
        };
        let page = pipeline.get_timeline(&claims("v"), request).await.unwrap();
        assert!(page.items.is_empty());
        assert!(page.pagination.has_next);
    }

    #[tokio::test]
    async fn all_sources_empty_is_not_an_error() {
        let graph = Arc::new(InMemoryFollowGraph::new());
        let following = Arc::new(FollowingSource::new(graph.clone(), Arc::new(NoteStore::new()))) as Arc<dyn CandidateSource>;
        let trending = Arc::new(TrendingSource::new()) as Arc<dyn CandidateSource>;
        let lists = Arc::new(ListsSource::new(Arc::new(NoteStore::new()))) as Arc<dyn CandidateSource>;
        let pipeline = build_pipeline(vec![following, trending, lists], graph, Arc::new(NullPreferenceStore));

        let request = GetTimelineRequest {
            viewer_id: "v".to_string(),
            algorithm: None,
            offset: 0,
            limit: 10,
            include_ranking_signals: false,
            overrides: RequestOverrides::default(),
        };
        let page = pipeline.get_timeline(&claims("v"), request).await.unwrap();
        assert!(page.items.is_empty());
        assert!(!page.pagination.has_next);
    }

    #[tokio::test]
    async fn cache_hit_serves_without_refetching() {
        let graph = Arc::new(InMemoryFollowGraph::new());
        graph.follow("v", "a");
        let now = Utc::now();
        let store = Arc::new(NoteStore::new());
        store.insert(note("n1", "a", now));
        let following = Arc::new(FollowingSource::new(graph.clone(), store)) as Arc<dyn CandidateSource>;
        let pipeline = build_pipeline(vec![following], graph, Arc::new(NullPreferenceStore));

        let request = || GetTimelineRequest {
            viewer_id: "v".to_string(),
            algorithm: None,
            offset: 0,
            limit: 10,
            include_ranking_signals: false,
            overrides: RequestOverrides::default(),
        };
        let first = pipeline.get_timeline(&claims("v"), request()).await.unwrap();
        let second = pipeline.get_timeline(&claims("v"), request()).await.unwrap();
        assert_eq!(first.items.len(), second.items.len());
        assert_eq!(pipeline.metrics().snapshot().cache_hits_total, 1);
    }

    #[tokio::test]
    async fn refresh_timeline_invalidates_and_filters_by_since() {
        let graph = Arc::new(InMemoryFollowGraph::new());
        graph.follow("v", "a");
        let now = Utc::now();
        let store = Arc::new(NoteStore::new());
        store.insert(note("old", "a", now - ChronoDuration::hours(1)));
        store.insert(note("new", "a", now));
        let following = Arc::new(FollowingSource::new(graph.clone(), store)) as Arc<dyn CandidateSource>;
        let pipeline = build_pipeline(vec![following], graph, Arc::new(NullPreferenceStore));

        let since = now - ChronoDuration::minutes(1);
        let page = pipeline.refresh_timeline(&claims("v"), "v", since, 10).await.unwrap();
        let ids: Vec<_> = page.items.iter().map(|i| i.note_id().to_string()).collect();
        assert_eq!(ids, vec!["new"]);
    }

    /// Response shape: signals are omitted unless requested, and the
    /// metadata block reports the algorithm/weights actually used plus the
    /// pre-pagination total.
    #[tokio::test]
    async fn response_metadata_and_signal_projection() {
        let graph = Arc::new(InMemoryFollowGraph::new());
        graph.follow("v", "a");
        let now = Utc::now();
        let store = Arc::new(NoteStore::new());
        store.insert(note("n1", "a", now));
        let following = Arc::new(FollowingSource::new(graph.clone(), store)) as Arc<dyn CandidateSource>;
        let pipeline = build_pipeline(vec![following], graph, Arc::new(NullPreferenceStore));

        let request = GetTimelineRequest {
            viewer_id: "v".to_string(),
            algorithm: Some(Algorithm::Chronological),
            offset: 0,
            limit: 10,
            include_ranking_signals: false,
            overrides: RequestOverrides::default(),
        };
        let response = pipeline.get_timeline(&claims("v"), request).await.unwrap();
        assert!(response.items[0].signals.is_none(), "signals must be omitted by default");
        assert_eq!(response.metadata.algorithm, Algorithm::Chronological);
        assert_eq!(response.metadata.total_items, 1);
        assert_eq!(response.pagination.total_count, 1);

        let request_with_signals = GetTimelineRequest {
            viewer_id: "v".to_string(),
            algorithm: Some(Algorithm::Chronological),
            offset: 0,
            limit: 10,
            include_ranking_signals: true,
            overrides: RequestOverrides::default(),
        };
        pipeline.cache().invalidate("v").await;
        let response = pipeline.get_timeline(&claims("v"), request_with_signals).await.unwrap();
        assert!(response.items[0].signals.is_some(), "signals must be present when requested");
    }

    #[tokio::test]
    async fn record_engagement_updates_ranker_affinity() {
        let graph = Arc::new(InMemoryFollowGraph::new());
        let pipeline = build_pipeline(vec![], graph, Arc::new(NullPreferenceStore));
        let n = note("n1", "author-a", Utc::now());
        pipeline.record_engagement(&claims("v"), "v", &n, EngagementAction::Follow).unwrap();
        assert_eq!(pipeline.ranker().author_affinity_for("v", "author-a"), 0.30);
    }

    #[tokio::test]
    async fn mark_timeline_read_is_monotonic() {
        let graph = Arc::new(InMemoryFollowGraph::new());
        let pipeline = build_pipeline(vec![], graph, Arc::new(NullPreferenceStore));
        let t1 = Utc::now();
        let t0 = t1 - ChronoDuration::seconds(30);
        pipeline.mark_timeline_read(&claims("v"), "v", t1).unwrap();
        pipeline.mark_timeline_read(&claims("v"), "v", t0).unwrap();
        assert_eq!(pipeline.cache().get_last_read("v"), t1);
    }
}
