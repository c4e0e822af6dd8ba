//! Core value types shared across the timeline pipeline.
//!
//! `Note` is an immutable snapshot, `RankedItem` wraps one note with
//! viewer-specific scoring, `ViewerProfile` holds per-viewer preference
//! state, and `TimelineConfig` is the resolved, per-request configuration
//! the pipeline ranks and paginates against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// An immutable note snapshot. Core never mutates these; sources and the
/// cache only ever hand out clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub note_id: String,
    pub author_id: String,
    pub text_content: String,
    pub created_at: DateTime<Utc>,
    pub has_media: bool,
    pub hashtags: Vec<String>,
    pub mentions: Vec<String>,
    pub views: u64,
    pub likes: u64,
    pub reshares: u64,
    pub replies: u64,
    pub quotes: u64,
    pub nsfw: bool,
    pub author_suspended: bool,
}

impl Note {
    /// Total engagement count across all engagement kinds.
    pub fn total_engagements(&self) -> u64 {
        self.likes + self.reshares + self.replies + self.quotes
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_seconds().max(0) as f64 / 3600.0
    }
}

/// The logical origin a candidate note was fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    Following,
    Recommended,
    Trending,
    Lists,
}

impl Source {
    pub fn all() -> [Source; 4] {
        [Source::Following, Source::Recommended, Source::Trending, Source::Lists]
    }

    /// Lower ordinal wins ties in dedup: FOLLOWING beats RECOMMENDED.
    pub fn ordinal(self) -> u8 {
        match self {
            Source::Following => 0,
            Source::Recommended => 1,
            Source::Trending => 2,
            Source::Lists => 3,
        }
    }
}

/// Named scoring components, each normalized to [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Signals {
    pub author_affinity: f64,
    pub content_quality: f64,
    pub engagement_velocity: f64,
    pub recency: f64,
    pub personalization: f64,
}

/// A Note wrapped with viewer-specific ranking output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedItem {
    pub note: Note,
    pub source: Source,
    pub final_score: f64,
    pub signals: Signals,
    pub injected_at: DateTime<Utc>,
    pub injection_reason: String,
}

impl RankedItem {
    pub fn note_id(&self) -> &str {
        &self.note.note_id
    }
}

/// Per-viewer preference and affinity state.
///
/// Lifecycle: NONE -> DEFAULTED (first request) -> PRIMED (engagement
/// recorded) -> EVICTED (cache TTL) -> NONE again. There is no destroyed
/// terminal state; eviction just means the next request re-defaults it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerProfile {
    pub viewer_id: String,
    pub follow_set: HashSet<String>,
    pub author_affinity: HashMap<String, f64>,
    pub hashtag_interest: HashMap<String, f64>,
    pub muted_users: HashSet<String>,
    pub muted_keywords: HashSet<String>,
    pub nsfw_opt_in: bool,
    pub engaged_hashtags: HashSet<String>,
    pub active_hours: HashSet<u8>,
    pub last_updated: DateTime<Utc>,
}

impl ViewerProfile {
    pub fn defaulted(viewer_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            follow_set: HashSet::new(),
            author_affinity: HashMap::new(),
            hashtag_interest: HashMap::new(),
            muted_users: HashSet::new(),
            muted_keywords: HashSet::new(),
            nsfw_opt_in: false,
            engaged_hashtags: HashSet::new(),
            active_hours: HashSet::new(),
            last_updated: now,
        }
    }
}

/// Algorithm tag a request resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    Chronological,
    Hybrid,
}

/// Per-signal scoring weights. Invariant: values >= 0, sum ~= 1.
///
/// `diversity_weight` is treated as a shaping-time multiplier only (see
/// `TimelineConfig::diversity_weight`), not one of the five scoring weights
/// here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SignalWeights {
    pub recency: f64,
    pub engagement: f64,
    pub author_affinity: f64,
    pub content_quality: f64,
    pub personalization: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            recency: 0.3,
            engagement: 0.2,
            author_affinity: 0.3,
            content_quality: 0.15,
            personalization: 0.05,
        }
    }
}

/// Source mix ratios, each of [0, 1], summing to ~1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SourceMix {
    pub following: f64,
    pub recommended: f64,
    pub trending: f64,
    pub lists: f64,
}

impl Default for SourceMix {
    fn default() -> Self {
        Self {
            following: 0.5,
            recommended: 0.25,
            trending: 0.15,
            lists: 0.10,
        }
    }
}

impl SourceMix {
    pub fn ratio_for(&self, source: Source) -> f64 {
        match source {
            Source::Following => self.following,
            Source::Recommended => self.recommended,
            Source::Trending => self.trending,
            Source::Lists => self.lists,
        }
    }

    /// Scale all non-following ratios so they sum to `share`, holding
    /// `following` fixed at `1.0 - share` (the discovery-share parameter).
    pub fn with_discovery_share(&self, share: f64) -> Self {
        let share = share.clamp(0.0, 1.0);
        let discovery_sum = self.recommended + self.trending + self.lists;
        if discovery_sum <= 0.0 {
            return Self {
                following: 1.0 - share,
                recommended: share,
                trending: 0.0,
                lists: 0.0,
            };
        }
        let scale = share / discovery_sum;
        Self {
            following: 1.0 - share,
            recommended: self.recommended * scale,
            trending: self.trending * scale,
            lists: self.lists * scale,
        }
    }
}

/// Per-source absolute caps. Invariant: values >= 0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SourceCaps {
    pub following: usize,
    pub recommended: usize,
    pub trending: usize,
    pub lists: usize,
}

impl Default for SourceCaps {
    fn default() -> Self {
        Self {
            following: 60,
            recommended: 40,
            trending: 25,
            lists: 25,
        }
    }
}

impl SourceCaps {
    pub fn cap_for(&self, source: Source) -> usize {
        match source {
            Source::Following => self.following,
            Source::Recommended => self.recommended,
            Source::Trending => self.trending,
            Source::Lists => self.lists,
        }
    }
}

/// A/B weight multipliers applied per source on top of the ratio.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AbWeights {
    pub following: f64,
    pub recommended: f64,
    pub trending: f64,
    pub lists: f64,
}

impl Default for AbWeights {
    fn default() -> Self {
        Self {
            following: 1.0,
            recommended: 1.0,
            trending: 1.0,
            lists: 1.0,
        }
    }
}

impl AbWeights {
    pub fn weight_for(&self, source: Source) -> f64 {
        match source {
            Source::Following => self.following,
            Source::Recommended => self.recommended,
            Source::Trending => self.trending,
            Source::Lists => self.lists,
        }
    }
}

/// Per-request resolved configuration. Built by merging defaults, stored
/// viewer preferences, and per-request overrides.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimelineConfig {
    pub algorithm: Algorithm,
    pub max_items: usize,
    pub max_age_hours: f64,
    pub min_score_threshold: f64,
    pub weights: SignalWeights,
    /// Shaping-time multiplier for diversity adjustments. Not one of the
    /// five scoring weights; see `SignalWeights` doc comment.
    pub diversity_weight: f64,
    pub mix: SourceMix,
    pub caps: SourceCaps,
    pub ab_weights: AbWeights,
    pub use_overdrive: bool,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Hybrid,
            max_items: 20,
            max_age_hours: 72.0,
            min_score_threshold: 0.0,
            weights: SignalWeights::default(),
            diversity_weight: 0.2,
            mix: SourceMix::default(),
            caps: SourceCaps::default(),
            ab_weights: AbWeights::default(),
            use_overdrive: false,
        }
    }
}

/// One write event entering the fan-out queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutTask {
    pub note: Note,
    pub event_kind: EventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

/// Engagement action recorded against a (viewer, note) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngagementAction {
    Like,
    Reshare,
    Reply,
    Follow,
    Hide,
}

impl EngagementAction {
    /// Affinity delta this action contributes.
    pub fn affinity_delta(self) -> f64 {
        match self {
            EngagementAction::Like => 0.05,
            EngagementAction::Reshare => 0.10,
            EngagementAction::Reply => 0.15,
            EngagementAction::Follow => 0.30,
            EngagementAction::Hide => 0.0,
        }
    }
}

/// One page of a timeline response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<RankedItem>,
    pub offset: usize,
    pub limit: usize,
    pub total_count: usize,
    pub has_next: bool,
}

/// One `RankedItem` projected for wire delivery, optionally omitting
/// `signals` per the request's `include_ranking_signals` flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedItemView {
    pub note: Note,
    pub source: Source,
    pub final_score: f64,
    pub signals: Option<Signals>,
    pub injected_at: DateTime<Utc>,
    pub injection_reason: String,
}

impl RankedItemView {
    pub fn note_id(&self) -> &str {
        &self.note.note_id
    }

    pub fn project(item: &RankedItem, include_signals: bool) -> Self {
        Self {
            note: item.note.clone(),
            source: item.source,
            final_score: item.final_score,
            signals: include_signals.then_some(item.signals),
            injected_at: item.injected_at,
            injection_reason: item.injection_reason.clone(),
        }
    }
}

/// The metadata block accompanying a `GetTimeline`/`GetForYou`/`GetFollowing`
/// response: which algorithm and signal weights actually produced this
/// assembly, how many items survive cap enforcement before pagination, how
/// many are new since the viewer's last-read marker, and when the timeline
/// was last assembled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub algorithm: Algorithm,
    pub signal_weights: SignalWeights,
    pub total_items: usize,
    pub new_items_since_last_fetch: usize,
    pub last_updated: DateTime<Utc>,
}

/// Pagination block: offset/limit as requested, `total_count` over the
/// full assembled (pre-pagination) result, and `has_next`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PaginationInfo {
    pub offset: usize,
    pub limit: usize,
    pub total_count: usize,
    pub has_next: bool,
}

/// The full `GetTimeline`/`GetForYou`/`GetFollowing` response shape:
/// projected items, a metadata block, and a pagination block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineResponse {
    pub items: Vec<RankedItemView>,
    pub metadata: ResponseMetadata,
    pub pagination: PaginationInfo,
}
