//! Candidate sources.
//!
//! `CandidateSource` is the uniform trait every origin (following,
//! recommended, trending, lists) implements, in the same `async_trait`
//! dynamic-dispatch shape as `ranking-service::services::recall::RecallStrategy`.
//! The contract is deliberately infallible at this boundary: a source that
//! cannot produce results returns an empty `Vec` rather than an `Err`, so one
//! misbehaving source can never fail the overall request.

pub mod memory;

use crate::model::{Note, Source, TimelineConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// One candidate origin. Implementations own their own failure handling:
/// a timeout, a downstream error, or an empty backing store all surface the
/// same way to the pipeline, as an empty result.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    fn source(&self) -> Source;

    /// Returns at most `max_count` notes created after `since`. Ordering is
    /// not guaranteed to the caller; the pipeline re-sorts globally.
    async fn fetch(
        &self,
        viewer_id: &str,
        config: &TimelineConfig,
        since: DateTime<Utc>,
        max_count: usize,
    ) -> Vec<Note>;
}

/// External follow-graph collaborator, treated as an opaque query interface.
/// The fan-out worker queries it for a note author's follower set.
#[async_trait]
pub trait FollowGraph: Send + Sync {
    async fn following_of(&self, viewer_id: &str) -> Vec<String>;
    async fn followers_of(&self, author_id: &str) -> Vec<String>;
}
