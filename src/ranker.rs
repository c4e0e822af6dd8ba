//! Ranker.
//!
//! Scores candidates into `RankedItem`s and applies the three shaping passes
//! in order (diversity, repetition control, hybrid freshness micro-boost).
//! Grounded on `ranking-service::services::ranking::scorer::RankingScorer`
//! for the score-then-shape structure and `ranking-service::services::
//! diversity::DiversityLayer` for the author-overrepresentation penalty
//! shape, adapted from that service's MMR rerank to the additive
//! penalty/boost shaping passes used here. `diversity_weight` is treated as
//! a shaping-time multiplier only, not a sixth scoring weight.

use crate::model::{Algorithm, Note, RankedItem, Signals, Source, TimelineConfig, ViewerProfile};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

const RECENCY_HALF_LIFE_HOURS: f64 = 6.0;
const DIVERSITY_AUTHOR_SOFT_CAP: usize = 3;
const REPETITION_AUTHOR_SOFT_CAP: usize = 2;
const HASHTAG_OVERREP_THRESHOLD: usize = 4;

/// Per-viewer affinity state mutated only by `record_engagement`. Guarded by
/// one dedicated lock; reads are brief and writes are the only mutators.
#[derive(Debug, Default)]
struct AffinityTables {
    /// viewer_id -> author_id -> affinity
    viewer_author_affinity: HashMap<String, HashMap<String, f64>>,
    /// author_id -> global score, informed by aggregate engagement.
    global_author_score: HashMap<String, f64>,
    /// viewer_id -> hashtags the viewer has engaged with.
    engaged_hashtags: HashMap<String, std::collections::HashSet<String>>,
}

pub struct Ranker {
    affinity: Mutex<AffinityTables>,
}

impl Ranker {
    pub fn new() -> Self {
        Self { affinity: Mutex::new(AffinityTables::default()) }
    }

    /// Scores every note for one viewer and applies shaping. Under
    /// `Algorithm::Chronological` the ranking short-circuits: score is the
    /// note's `created_at` epoch seconds and shaping passes are skipped.
    pub fn score(
        &self,
        notes: Vec<Note>,
        viewer_id: &str,
        profile: &ViewerProfile,
        config: &TimelineConfig,
        source_of: impl Fn(&str) -> Source,
        now: DateTime<Utc>,
    ) -> Vec<RankedItem> {
        if config.algorithm == Algorithm::Chronological {
            let mut items: Vec<RankedItem> = notes
                .into_iter()
                .map(|note| {
                    let source = source_of(&note.note_id);
                    let score = note.created_at.timestamp() as f64;
                    RankedItem {
                        source,
                        final_score: score.max(0.0),
                        signals: Signals::default(),
                        injected_at: now,
                        injection_reason: "chronological".to_string(),
                        note,
                    }
                })
                .collect();
            Self::stable_sort(&mut items);
            return items;
        }

        let affinity = self.affinity.lock().unwrap();
        let mut items: Vec<RankedItem> = notes
            .into_iter()
            .map(|note| {
                let source = source_of(&note.note_id);
                let signals = self.compute_signals(&note, viewer_id, profile, &affinity, now);
                let final_score = signals.recency * config.weights.recency
                    + signals.engagement_velocity * config.weights.engagement
                    + signals.author_affinity * config.weights.author_affinity
                    + signals.content_quality * config.weights.content_quality
                    + signals.personalization * config.weights.personalization;
                RankedItem {
                    note,
                    source,
                    final_score: final_score.max(0.0),
                    signals,
                    injected_at: now,
                    injection_reason: "scored".to_string(),
                }
            })
            .collect();
        drop(affinity);

        self.apply_diversity_shaping(&mut items, config.diversity_weight);
        self.apply_repetition_control(&mut items);
        if config.algorithm == Algorithm::Hybrid {
            self.apply_hybrid_freshness_boost(&mut items, now);
        }

        for item in &mut items {
            item.final_score = item.final_score.max(0.0);
        }
        Self::stable_sort(&mut items);
        items
    }

    fn compute_signals(
        &self,
        note: &Note,
        viewer_id: &str,
        profile: &ViewerProfile,
        affinity: &AffinityTables,
        now: DateTime<Utc>,
    ) -> Signals {
        Signals {
            author_affinity: Self::author_affinity(note, viewer_id, profile, affinity),
            content_quality: Self::content_quality(note),
            engagement_velocity: Self::engagement_velocity(note, now),
            recency: Self::recency(note, now),
            personalization: Self::personalization(note, viewer_id, profile),
        }
    }

    /// `max(0.8 if followed else 0.1, historical_affinity, 0.2 * global_author_score)`,
    /// clipped to 1.
    fn author_affinity(
        note: &Note,
        viewer_id: &str,
        profile: &ViewerProfile,
        affinity: &AffinityTables,
    ) -> f64 {
        let base = if profile.follow_set.contains(&note.author_id) { 0.8 } else { 0.1 };
        let historical = affinity
            .viewer_author_affinity
            .get(viewer_id)
            .and_then(|m| m.get(&note.author_id))
            .copied()
            .unwrap_or(0.0);
        let global = affinity.global_author_score.get(&note.author_id).copied().unwrap_or(0.0);
        base.max(historical).max(0.2 * global).min(1.0)
    }

    /// Base 0.5 plus text-length/media/hashtag/mention boosts, URL/spam/
    /// short-text penalties, plus clipped engagement-rate bonus.
    fn content_quality(note: &Note) -> f64 {
        let mut score = 0.5;
        let len = note.text_content.chars().count();

        if (50..=280).contains(&len) {
            score += 0.1;
        }
        if note.has_media {
            score += 0.15;
        }
        if (1..=5).contains(&note.hashtags.len()) {
            score += 0.08;
        }
        if (1..=3).contains(&note.mentions.len()) {
            score += 0.12;
        }
        if note.text_content.contains("http://") || note.text_content.contains("https://") {
            score -= 0.05;
        }
        if note.hashtags.len() > 10 {
            score -= 0.1;
        }
        if len < 10 {
            score -= 0.2;
        }

        let total = note.total_engagements() as f64;
        let engagement_rate = if note.views > 0 { total / note.views as f64 } else { 0.0 };
        score += engagement_rate.min(1.0) * 0.3;

        score.clamp(0.0, 1.0)
    }

    /// Total engagements per hour since `created_at`, divided by 10, clipped
    /// to 1.
    fn engagement_velocity(note: &Note, now: DateTime<Utc>) -> f64 {
        let age_hours = note.age_hours(now).max(1.0 / 60.0);
        let per_hour = note.total_engagements() as f64 / age_hours;
        (per_hour / 10.0).min(1.0)
    }

    /// `exp(-age_hours * ln2 / half_life)` with half_life = 6h.
    fn recency(note: &Note, now: DateTime<Utc>) -> f64 {
        let age_hours = note.age_hours(now);
        (-age_hours * std::f64::consts::LN_2 / RECENCY_HALF_LIFE_HOURS).exp().clamp(0.0, 1.0)
    }

    /// Small boosts for matching viewer-engaged hashtags and the viewer's
    /// active-hour window.
    fn personalization(note: &Note, viewer_id: &str, profile: &ViewerProfile) -> f64 {
        let mut score = 0.0;
        for tag in &note.hashtags {
            if profile.engaged_hashtags.contains(tag) || profile.hashtag_interest.contains_key(tag) {
                score += 0.05;
            }
        }
        let hour = note.created_at.format("%H").to_string().parse::<u8>().unwrap_or(0);
        if profile.active_hours.contains(&hour) {
            score += 0.1;
        }
        let _ = viewer_id;
        score.min(1.0)
    }

    /// Pass 1: penalize authors appearing more than 3 times in the batch;
    /// boost items whose hashtag is a batch-singleton.
    fn apply_diversity_shaping(&self, items: &mut [RankedItem], diversity_weight: f64) {
        let mut author_counts: HashMap<String, usize> = HashMap::new();
        for item in items.iter() {
            *author_counts.entry(item.note.author_id.clone()).or_insert(0) += 1;
        }
        let mut hashtag_counts: HashMap<String, usize> = HashMap::new();
        for item in items.iter() {
            for tag in &item.note.hashtags {
                *hashtag_counts.entry(tag.clone()).or_insert(0) += 1;
            }
        }

        for item in items.iter_mut() {
            let count = author_counts.get(&item.note.author_id).copied().unwrap_or(0);
            let mut adjustment = 0.0;
            if count > DIVERSITY_AUTHOR_SOFT_CAP {
                adjustment -= 0.05 * (count - DIVERSITY_AUTHOR_SOFT_CAP) as f64;
            }
            if item
                .note
                .hashtags
                .iter()
                .any(|t| hashtag_counts.get(t).copied().unwrap_or(0) == 1)
            {
                adjustment += 0.02;
            }
            item.final_score += adjustment * diversity_weight;
        }
    }

    /// Pass 2: TikTok-style repetition control applied in score order: soft
    /// per-author cap, back-to-back penalty, and hashtag over-representation
    /// adjustments.
    fn apply_repetition_control(&self, items: &mut [RankedItem]) {
        Self::stable_sort(items);

        let mut hashtag_counts: HashMap<String, usize> = HashMap::new();
        for item in items.iter() {
            for tag in &item.note.hashtags {
                *hashtag_counts.entry(tag.clone()).or_insert(0) += 1;
            }
        }

        let mut seen_counts: HashMap<String, usize> = HashMap::new();
        let mut last_author: Option<String> = None;
        for item in items.iter_mut() {
            let count_so_far = seen_counts.entry(item.note.author_id.clone()).or_insert(0);
            *count_so_far += 1;
            let count = *count_so_far;

            let mut adjustment = 0.0;
            if count > REPETITION_AUTHOR_SOFT_CAP {
                adjustment -= 0.06 * (count - REPETITION_AUTHOR_SOFT_CAP) as f64;
            }
            if last_author.as_deref() == Some(item.note.author_id.as_str()) {
                adjustment -= 0.05;
            }
            for tag in &item.note.hashtags {
                let freq = hashtag_counts.get(tag).copied().unwrap_or(0);
                if freq > HASHTAG_OVERREP_THRESHOLD {
                    adjustment -= 0.01;
                } else if freq == 1 {
                    adjustment += 0.02;
                }
            }

            item.final_score += adjustment;
            last_author = Some(item.note.author_id.clone());
        }
    }

    /// Pass 3, HYBRID only: very-fresh items and non-following-source items
    /// get a small discovery boost.
    fn apply_hybrid_freshness_boost(&self, items: &mut [RankedItem], now: DateTime<Utc>) {
        for item in items.iter_mut() {
            let age_minutes = (now - item.note.created_at).num_seconds().max(0) as f64 / 60.0;
            if age_minutes <= 30.0 {
                item.final_score += 0.02;
            }
            if item.source != Source::Following {
                item.final_score += 0.01;
            }
        }
    }

    /// Descending score, then `created_at` descending, then `note_id`
    /// ascending, for deterministic tie-breaks.
    fn stable_sort(items: &mut [RankedItem]) {
        items.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.note.created_at.cmp(&a.note.created_at))
                .then_with(|| a.note.note_id.cmp(&b.note.note_id))
        });
    }

    /// Updates viewer->author affinity monotonically and the global author
    /// score; joins the note's hashtags into the viewer's engaged set.
    pub fn record_engagement(
        &self,
        viewer_id: &str,
        note: &Note,
        action: crate::model::EngagementAction,
    ) {
        let delta = action.affinity_delta();
        let mut affinity = self.affinity.lock().unwrap();

        let viewer_map = affinity.viewer_author_affinity.entry(viewer_id.to_string()).or_default();
        let entry = viewer_map.entry(note.author_id.clone()).or_insert(0.0);
        *entry = (*entry + delta).clamp(0.0, 1.0);

        let global = affinity.global_author_score.entry(note.author_id.clone()).or_insert(0.0);
        *global = (*global + 0.01).clamp(0.0, 1.0);

        let hashtags = affinity.engaged_hashtags.entry(viewer_id.to_string()).or_default();
        for tag in &note.hashtags {
            hashtags.insert(tag.clone());
        }

        debug!(viewer_id, author_id = %note.author_id, action = ?action, "engagement recorded");
    }

    pub fn author_affinity_for(&self, viewer_id: &str, author_id: &str) -> f64 {
        self.affinity
            .lock()
            .unwrap()
            .viewer_author_affinity
            .get(viewer_id)
            .and_then(|m| m.get(author_id))
            .copied()
            .unwrap_or(0.0)
    }
}

impl Default for Ranker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EngagementAction;
    use chrono::Duration as ChronoDuration;

    fn note(id: &str, author: &str, created_at: DateTime<Utc>) -> Note {
        Note {
            note_id: id.to_string(),
            author_id: author.to_string(),
            text_content: "a reasonably long note body for testing quality scoring purposes".to_string(),
            created_at,
            has_media: false,
            hashtags: vec![],
            mentions: vec![],
            views: 100,
            likes: 10,
            reshares: 2,
            replies: 1,
            quotes: 0,
            nsfw: false,
            author_suspended: false,
        }
    }

    #[test]
    fn chronological_orders_by_created_at_desc() {
        let ranker = Ranker::new();
        let now = Utc::now();
        let notes = vec![
            note("n1", "a", now - ChronoDuration::seconds(5)),
            note("n2", "b", now - ChronoDuration::seconds(10)),
            note("n3", "a", now - ChronoDuration::seconds(1)),
        ];
        let profile = ViewerProfile::defaulted("viewer", now);
        let mut config = TimelineConfig::default();
        config.algorithm = Algorithm::Chronological;

        let items = ranker.score(notes, "viewer", &profile, &config, |_| Source::Following, now);
        let ids: Vec<_> = items.iter().map(|i| i.note.note_id.clone()).collect();
        assert_eq!(ids, vec!["n3", "n1", "n2"]);
    }

    #[test]
    fn no_item_has_negative_final_score() {
        let ranker = Ranker::new();
        let now = Utc::now();
        let mut n = note("n1", "a", now - ChronoDuration::hours(1000));
        n.likes = 0;
        n.views = 0;
        let profile = ViewerProfile::defaulted("viewer", now);
        let config = TimelineConfig::default();
        let items = ranker.score(vec![n], "viewer", &profile, &config, |_| Source::Recommended, now);
        assert!(items[0].final_score >= 0.0);
    }

    #[test]
    fn engagement_feedback_is_monotonic_and_capped() {
        let ranker = Ranker::new();
        let n = note("n1", "author-a", Utc::now());
        for _ in 0..50 {
            ranker.record_engagement("viewer", &n, EngagementAction::Like);
        }
        assert_eq!(ranker.author_affinity_for("viewer", "author-a"), 1.0);
    }

    #[test]
    fn diversity_shaping_penalizes_overrepresented_author() {
        let ranker = Ranker::new();
        let now = Utc::now();
        let notes: Vec<Note> = (0..6).map(|i| note(&format!("n{i}"), "same-author", now)).collect();
        let profile = ViewerProfile::defaulted("viewer", now);
        let config = TimelineConfig::default();
        let items = ranker.score(notes, "viewer", &profile, &config, |_| Source::Following, now);
        // every item should have been penalized relative to a lone post by the same author
        let lone = ranker.score(
            vec![note("solo", "same-author", now)],
            "viewer",
            &profile,
            &config,
            |_| Source::Following,
            now,
        );
        assert!(items[0].final_score <= lone[0].final_score);
    }

    #[test]
    fn hybrid_boosts_very_fresh_and_non_following_items() {
        let ranker = Ranker::new();
        let now = Utc::now();
        let profile = ViewerProfile::defaulted("viewer", now);
        let config = TimelineConfig::default(); // Hybrid by default

        let fresh = note("fresh", "a", now - ChronoDuration::minutes(5));
        let old = note("old", "a", now - ChronoDuration::hours(5));

        let scored_fresh = ranker.score(
            vec![fresh],
            "viewer",
            &profile,
            &config,
            |_| Source::Recommended,
            now,
        );
        let scored_old = ranker.score(vec![old], "viewer", &profile, &config, |_| Source::Recommended, now);
        assert!(scored_fresh[0].signals.recency >= scored_old[0].signals.recency);
    }
}
