//! Timeline assembly and ranking core.
//!
//! A library crate: no transport, no data stores. Callers wire up
//! `CandidateSource`/`FollowGraph`/`PreferenceStore` implementations backed
//! by their own services and drive everything else through `Pipeline`.

pub mod admission;
pub mod cache;
pub mod config;
pub mod error;
pub mod fanout;
pub mod filter;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod ranker;
pub mod sources;
pub mod streaming;

pub use admission::{CallerClaims, EndpointClass, RateLimiter};
pub use cache::{CacheConfig, ResultCache};
pub use config::Config;
pub use error::{PipelineError, Result};
pub use fanout::{FanoutProducer, FanoutWorker};
pub use metrics::{Metrics, MetricsSnapshot};
pub use model::{PaginationInfo, RankedItemView, ResponseMetadata, TimelineResponse};
pub use pipeline::{GetTimelineRequest, Pipeline, RequestOverrides};
pub use streaming::{StreamSession, SubscriptionRegistry, TimelineUpdate};
