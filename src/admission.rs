//! Request admission: per-caller token-bucket rate limiting plus the
//! authorization check.
//!
//! `graphql-gateway::middleware::rate_limit` wraps `governor` as a single
//! global per-IP limiter; that shape doesn't fit a rate limiter keyed by
//! (endpoint-class, caller-id) with distinct configured rates per scope, so
//! this module hand-rolls the bucket in the same check-and-consume,
//! warn-on-deny spirit (see DESIGN.md).

use dashmap::DashMap;
use std::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Login,
    Register,
    Timeline,
    NoteCreate,
}

/// One caller's token bucket for one endpoint class.
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_second,
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

#[derive(Debug, Clone, Copy)]
pub struct EndpointDefaults {
    pub rpm: f64,
    pub burst: f64,
}

/// Per-(endpoint-class, caller-id) token buckets, shared and lock-protected.
/// Each bucket's lock is acquired briefly and never held across an await.
pub struct RateLimiter {
    buckets: DashMap<(EndpointClass, String), Mutex<Bucket>>,
    defaults: DashMap<EndpointClass, EndpointDefaults>,
}

impl RateLimiter {
    pub fn new() -> Self {
        let defaults = DashMap::new();
        defaults.insert(EndpointClass::Login, EndpointDefaults { rpm: 10.0, burst: 5.0 });
        defaults.insert(EndpointClass::Register, EndpointDefaults { rpm: 5.0, burst: 2.0 });
        defaults.insert(EndpointClass::Timeline, EndpointDefaults { rpm: 120.0, burst: 20.0 });
        defaults.insert(EndpointClass::NoteCreate, EndpointDefaults { rpm: 30.0, burst: 10.0 });
        Self { buckets: DashMap::new(), defaults }
    }

    pub fn configure_default(&self, class: EndpointClass, defaults: EndpointDefaults) {
        self.defaults.insert(class, defaults);
    }

    /// `allow` consumes one token if available. `override_rpm` is the
    /// per-request `x-rate-rpm` header, which may only lower the configured
    /// rate, never raise it.
    pub fn allow(&self, class: EndpointClass, caller_id: &str, override_rpm: Option<f64>) -> bool {
        let key = (class, caller_id.to_string());
        if !self.buckets.contains_key(&key) {
            let defaults = self.defaults.get(&class).map(|d| *d).unwrap_or(EndpointDefaults { rpm: 60.0, burst: 10.0 });
            let rpm = override_rpm.map(|r| r.min(defaults.rpm)).unwrap_or(defaults.rpm);
            self.buckets.insert(key.clone(), Mutex::new(Bucket::new(defaults.burst, rpm / 60.0)));
        }

        let bucket = self.buckets.get(&key).unwrap();
        let allowed = bucket.lock().unwrap().allow();
        if !allowed {
            warn!(caller_id, class = ?class, "rate limit denied");
        }
        allowed
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// The caller's asserted identity, parsed from transport-already-validated
/// claims. Token validation itself is out of scope; core receives the
/// already-parsed identity.
#[derive(Debug, Clone)]
pub struct CallerClaims {
    pub caller_id: String,
    pub is_admin: bool,
}

/// Authorization rule: the caller's asserted identity must equal the
/// requested `viewer_id`, or the caller must carry the admin flag.
pub fn authorize(claims: &CallerClaims, viewer_id: &str) -> bool {
    claims.is_admin || claims.caller_id == viewer_id
}
