//! Process-level configuration, loaded from the environment in the shape of
//! `feed-service::config::Config` (nested sub-structs, typed defaults,
//! `from_env` constructor).

use crate::model::{AbWeights, SignalWeights, SourceCaps, SourceMix, TimelineConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub timeline: TimelineDefaults,
    pub cache: CacheDefaults,
    pub admission: AdmissionDefaults,
    pub fanout: FanoutDefaults,
    pub streaming: StreamingDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub env: String,
    pub log_level: String,
}

/// Default `TimelineConfig` values before per-viewer/per-request overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineDefaults {
    pub max_items: usize,
    pub max_age_hours: f64,
    pub min_score_threshold: f64,
    pub weights: SignalWeights,
    pub diversity_weight: f64,
    pub mix: SourceMix,
    pub caps: SourceCaps,
    pub ab_weights: AbWeights,
}

impl TimelineDefaults {
    pub fn resolve(&self) -> TimelineConfig {
        TimelineConfig {
            algorithm: crate::model::Algorithm::Hybrid,
            max_items: self.max_items,
            max_age_hours: self.max_age_hours,
            min_score_threshold: self.min_score_threshold,
            weights: self.weights,
            diversity_weight: self.diversity_weight,
            mix: self.mix,
            caps: self.caps,
            ab_weights: self.ab_weights,
            use_overdrive: false,
        }
    }
}

impl Default for TimelineDefaults {
    fn default() -> Self {
        Self {
            max_items: 20,
            max_age_hours: 72.0,
            min_score_threshold: 0.0,
            weights: SignalWeights::default(),
            diversity_weight: 0.2,
            mix: SourceMix::default(),
            caps: SourceCaps::default(),
            ab_weights: AbWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDefaults {
    pub feed_ttl_secs: u64,
    pub profile_ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheDefaults {
    fn default() -> Self {
        Self {
            feed_ttl_secs: 3600,
            profile_ttl_secs: 1800,
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionDefaults {
    pub timeline_rpm: f64,
    pub timeline_burst: f64,
}

impl Default for AdmissionDefaults {
    fn default() -> Self {
        Self {
            timeline_rpm: 120.0,
            timeline_burst: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutDefaults {
    pub queue_capacity: usize,
    pub shard_size: usize,
}

impl Default for FanoutDefaults {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            shard_size: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingDefaults {
    pub session_queue_capacity: usize,
    pub messages_per_second: f64,
    pub heartbeat_ms: u64,
}

impl Default for StreamingDefaults {
    fn default() -> Self {
        Self {
            session_queue_capacity: 256,
            messages_per_second: 5.0,
            heartbeat_ms: 500,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            env: "development".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig::default(),
            timeline: TimelineDefaults::default(),
            cache: CacheDefaults::default(),
            admission: AdmissionDefaults::default(),
            fanout: FanoutDefaults::default(),
            streaming: StreamingDefaults::default(),
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults for
    /// anything unset (mirrors `feed-service::config::Config::from_env`).
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Config::default();

        cfg.app.env = std::env::var("APP_ENV").unwrap_or(cfg.app.env);
        cfg.app.log_level = std::env::var("LOG_LEVEL").unwrap_or(cfg.app.log_level);

        if let Ok(v) = std::env::var("TIMELINE_MAX_ITEMS") {
            cfg.timeline.max_items = v.parse()?;
        }
        if let Ok(v) = std::env::var("TIMELINE_MAX_AGE_HOURS") {
            cfg.timeline.max_age_hours = v.parse()?;
        }
        if let Ok(v) = std::env::var("CACHE_FEED_TTL_SECS") {
            cfg.cache.feed_ttl_secs = v.parse()?;
        }
        if let Ok(v) = std::env::var("CACHE_MAX_ENTRIES") {
            cfg.cache.max_entries = v.parse()?;
        }
        if let Ok(v) = std::env::var("ADMISSION_TIMELINE_RPM") {
            cfg.admission.timeline_rpm = v.parse()?;
        }
        if let Ok(v) = std::env::var("FANOUT_QUEUE_CAPACITY") {
            cfg.fanout.queue_capacity = v.parse()?;
        }

        Ok(cfg)
    }
}

/// Initialize structured JSON logging the way `main.rs`'s fallback branch
/// does when OpenTelemetry export is not configured. Safe to call once per
/// process; intended for binaries and integration tests.
pub fn init_tracing(log_level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.timeline.max_items, 20);
        assert_eq!(cfg.cache.feed_ttl_secs, 3600);
        assert!(cfg.admission.timeline_rpm > 0.0);
    }
}
