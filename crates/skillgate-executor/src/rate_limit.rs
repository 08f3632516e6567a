//! Rate limiting: the host's defense against recursion and flooding.
//!
//! Three independent gates, checked in order with first-failure-wins:
//! self-identity rejection (a bot must never process its own output),
//! per-requester sliding window and concurrency with a cooldown that
//! penalizes repeat offenders, and a global sliding window and concurrency.
//! `record_start`/`record_end` bracket each admitted request; the executor
//! guarantees `record_end` runs exactly once on every exit path.
//!
//! State lives behind a single mutex; pruning happens inside the critical
//! section on read and on write, so admission decisions always see a
//! consistent snapshot.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use skillgate_core::error::RateLimitReason;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub max_requests_per_requester: u32,
    pub max_concurrent_per_requester: u32,
    pub max_global_requests: u32,
    pub max_global_concurrent: u32,
    pub window: Duration,
    pub cooldown: Duration,
    /// Identities of this host itself, compared case-insensitively.
    pub self_ids: Vec<String>,
}

impl RateLimiterConfig {
    /// Default public-facing profile.
    pub fn public_default() -> Self {
        Self {
            max_requests_per_requester: 10,
            max_concurrent_per_requester: 2,
            max_global_requests: 100,
            max_global_concurrent: 10,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            self_ids: Vec::new(),
        }
    }

    /// Tighter profile for hostile environments.
    pub fn strict() -> Self {
        Self {
            max_requests_per_requester: 5,
            max_concurrent_per_requester: 1,
            max_global_requests: 30,
            max_global_concurrent: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
            self_ids: Vec::new(),
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::public_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied {
        reason: RateLimitReason,
        retry_after: Option<Duration>,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RateLimiterStats {
    pub global_concurrent: u32,
    pub global_window_len: usize,
    pub tracked_requesters: usize,
    pub requesters_in_cooldown: usize,
}

#[derive(Debug, Default)]
struct RequesterState {
    requests: VecDeque<Instant>,
    concurrent: u32,
    cooldown_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    requesters: HashMap<String, RequesterState>,
    global_requests: VecDeque<Instant>,
    global_concurrent: u32,
    self_ids: HashSet<String>,
}

fn prune(window: &mut VecDeque<Instant>, span: Duration, now: Instant) {
    while let Some(front) = window.front() {
        if now.duration_since(*front) >= span {
            window.pop_front();
        } else {
            break;
        }
    }
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let self_ids = config
            .self_ids
            .iter()
            .map(|s| s.to_ascii_lowercase())
            .collect();
        Self {
            config,
            inner: Mutex::new(Inner {
                self_ids,
                ..Inner::default()
            }),
        }
    }

    fn denied(reason: RateLimitReason, retry_after: Option<Duration>) -> RateDecision {
        RateDecision::Denied {
            reason,
            retry_after,
        }
    }

    /// The admission check. First failing gate wins; allowed requests must
    /// be bracketed with `record_start`/`record_end`.
    pub fn check(&self, id: &str) -> RateDecision {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("rate limiter lock");

        // 1. absolute bar: never process our own output
        if inner.self_ids.contains(&id.to_ascii_lowercase()) {
            return Self::denied(RateLimitReason::SelfMessage, None);
        }

        let requester = inner.requesters.entry(id.to_string()).or_default();

        // 2. cooldown
        if let Some(until) = requester.cooldown_until {
            if now < until {
                return Self::denied(
                    RateLimitReason::RequesterCooldown,
                    Some(until.duration_since(now)),
                );
            }
            requester.cooldown_until = None;
        }

        // 3. per-requester concurrency
        if requester.concurrent >= self.config.max_concurrent_per_requester {
            return Self::denied(RateLimitReason::RequesterConcurrent, None);
        }

        // 4. per-requester window; opening a cooldown penalizes the repeat
        // offender beyond the window itself
        prune(&mut requester.requests, self.config.window, now);
        if requester.requests.len() as u32 >= self.config.max_requests_per_requester {
            requester.cooldown_until = Some(now + self.config.cooldown);
            return Self::denied(
                RateLimitReason::RequesterRateLimit,
                Some(self.config.cooldown),
            );
        }

        // 5. global concurrency
        if inner.global_concurrent >= self.config.max_global_concurrent {
            return Self::denied(RateLimitReason::GlobalConcurrent, None);
        }

        // 6. global window
        prune(&mut inner.global_requests, self.config.window, now);
        if inner.global_requests.len() as u32 >= self.config.max_global_requests {
            let retry = inner
                .global_requests
                .front()
                .map(|f| self.config.window.saturating_sub(now.duration_since(*f)));
            return Self::denied(RateLimitReason::GlobalRateLimit, retry);
        }

        RateDecision::Allowed
    }

    pub fn record_start(&self, id: &str) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("rate limiter lock");
        let requester = inner.requesters.entry(id.to_string()).or_default();
        requester.concurrent += 1;
        requester.requests.push_back(now);
        inner.global_concurrent += 1;
        inner.global_requests.push_back(now);
    }

    pub fn record_end(&self, id: &str) {
        let mut inner = self.inner.lock().expect("rate limiter lock");
        if let Some(requester) = inner.requesters.get_mut(id) {
            requester.concurrent = requester.concurrent.saturating_sub(1);
        }
        inner.global_concurrent = inner.global_concurrent.saturating_sub(1);
    }

    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("rate limiter lock");
        prune(&mut inner.global_requests, self.config.window, now);
        RateLimiterStats {
            global_concurrent: inner.global_concurrent,
            global_window_len: inner.global_requests.len(),
            tracked_requesters: inner.requesters.len(),
            requesters_in_cooldown: inner
                .requesters
                .values()
                .filter(|r| r.cooldown_until.is_some_and(|u| u > now))
                .count(),
        }
    }

    pub fn add_self_id(&self, id: &str) {
        let mut inner = self.inner.lock().expect("rate limiter lock");
        inner.self_ids.insert(id.to_ascii_lowercase());
    }

    pub fn remove_self_id(&self, id: &str) {
        let mut inner = self.inner.lock().expect("rate limiter lock");
        inner.self_ids.remove(&id.to_ascii_lowercase());
    }

    pub fn clear_cooldown(&self, id: &str) {
        let mut inner = self.inner.lock().expect("rate limiter lock");
        if let Some(requester) = inner.requesters.get_mut(id) {
            requester.cooldown_until = None;
        }
    }

    /// Administrative reset: drop all counters and windows, keep self ids.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("rate limiter lock");
        inner.requesters.clear();
        inner.global_requests.clear();
        inner.global_concurrent = 0;
    }
}

// ── token-bucket variant ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TokenBucketConfig {
    pub requester_rate_per_sec: f64,
    pub requester_burst: f64,
    pub global_rate_per_sec: f64,
    pub global_burst: f64,
    pub self_ids: Vec<String>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(burst: f64) -> Self {
        Self {
            tokens: burst,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, rate: f64, burst: f64, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;
    }

    fn retry_after(&self, rate: f64) -> Option<Duration> {
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64((1.0 - self.tokens).max(0.0) / rate))
    }
}

struct BucketInner {
    requesters: HashMap<String, Bucket>,
    global: Bucket,
    self_ids: HashSet<String>,
}

/// Bucket-based variant for bursty workloads. Preserves the self-identity
/// bar; `check` denies when either bucket is below one token, `consume`
/// debits both.
pub struct TokenBucketLimiter {
    config: TokenBucketConfig,
    inner: Mutex<BucketInner>,
}

impl TokenBucketLimiter {
    pub fn new(config: TokenBucketConfig) -> Self {
        let self_ids = config
            .self_ids
            .iter()
            .map(|s| s.to_ascii_lowercase())
            .collect();
        let global = Bucket::new(config.global_burst);
        Self {
            config,
            inner: Mutex::new(BucketInner {
                requesters: HashMap::new(),
                global,
                self_ids,
            }),
        }
    }

    pub fn check(&self, id: &str) -> RateDecision {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("token bucket lock");
        if inner.self_ids.contains(&id.to_ascii_lowercase()) {
            return RateDecision::Denied {
                reason: RateLimitReason::SelfMessage,
                retry_after: None,
            };
        }

        let burst = self.config.requester_burst;
        let rate = self.config.requester_rate_per_sec;
        let requester = inner
            .requesters
            .entry(id.to_string())
            .or_insert_with(|| Bucket::new(burst));
        requester.refill(rate, burst, now);
        if requester.tokens < 1.0 {
            let retry = requester.retry_after(rate);
            return RateDecision::Denied {
                reason: RateLimitReason::RequesterRateLimit,
                retry_after: retry,
            };
        }

        inner
            .global
            .refill(self.config.global_rate_per_sec, self.config.global_burst, now);
        if inner.global.tokens < 1.0 {
            let retry = inner.global.retry_after(self.config.global_rate_per_sec);
            return RateDecision::Denied {
                reason: RateLimitReason::GlobalRateLimit,
                retry_after: retry,
            };
        }
        RateDecision::Allowed
    }

    /// Debit one token from both buckets.
    pub fn consume(&self, id: &str) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("token bucket lock");
        let burst = self.config.requester_burst;
        let rate = self.config.requester_rate_per_sec;
        let requester = inner
            .requesters
            .entry(id.to_string())
            .or_insert_with(|| Bucket::new(burst));
        requester.refill(rate, burst, now);
        requester.tokens = (requester.tokens - 1.0).max(0.0);

        inner
            .global
            .refill(self.config.global_rate_per_sec, self.config.global_burst, now);
        inner.global.tokens = (inner.global.tokens - 1.0).max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(config: RateLimiterConfig) -> RateLimiter {
        RateLimiter::new(config)
    }

    #[test]
    fn self_identity_is_an_absolute_bar() {
        let rl = limiter(RateLimiterConfig {
            self_ids: vec!["bot-1".to_string()],
            ..RateLimiterConfig::public_default()
        });
        let decision = rl.check("BOT-1");
        assert_eq!(
            decision,
            RateDecision::Denied {
                reason: RateLimitReason::SelfMessage,
                retry_after: None
            }
        );
        // no state change
        let stats = rl.stats();
        assert_eq!(stats.global_window_len, 0);
        assert_eq!(stats.global_concurrent, 0);
    }

    #[test]
    fn sliding_window_opens_a_cooldown() {
        let rl = limiter(RateLimiterConfig {
            max_requests_per_requester: 3,
            cooldown: Duration::from_secs(30),
            ..RateLimiterConfig::public_default()
        });

        for _ in 0..3 {
            assert!(rl.check("u1").is_allowed());
            rl.record_start("u1");
            rl.record_end("u1");
        }

        // fourth request trips the window and opens the cooldown
        let fourth = rl.check("u1");
        assert!(matches!(
            fourth,
            RateDecision::Denied {
                reason: RateLimitReason::RequesterRateLimit,
                ..
            }
        ));

        // fifth within the cooldown reports cooldown with a retry-after
        match rl.check("u1") {
            RateDecision::Denied {
                reason: RateLimitReason::RequesterCooldown,
                retry_after: Some(retry),
            } => assert!(retry > Duration::ZERO && retry <= Duration::from_secs(30)),
            other => panic!("expected cooldown, got {other:?}"),
        }
        assert_eq!(rl.stats().requesters_in_cooldown, 1);
    }

    #[test]
    fn requester_concurrency_gate() {
        let rl = limiter(RateLimiterConfig {
            max_concurrent_per_requester: 2,
            ..RateLimiterConfig::public_default()
        });
        rl.record_start("u1");
        rl.record_start("u1");
        assert!(matches!(
            rl.check("u1"),
            RateDecision::Denied {
                reason: RateLimitReason::RequesterConcurrent,
                ..
            }
        ));
        rl.record_end("u1");
        assert!(rl.check("u1").is_allowed());
    }

    #[test]
    fn global_window_gate() {
        let rl = limiter(RateLimiterConfig {
            max_global_requests: 3,
            max_requests_per_requester: 100,
            ..RateLimiterConfig::public_default()
        });
        for id in ["a", "b", "c"] {
            assert!(rl.check(id).is_allowed());
            rl.record_start(id);
            rl.record_end(id);
        }
        assert!(matches!(
            rl.check("d"),
            RateDecision::Denied {
                reason: RateLimitReason::GlobalRateLimit,
                ..
            }
        ));
    }

    #[test]
    fn global_concurrency_gate() {
        let rl = limiter(RateLimiterConfig {
            max_global_concurrent: 2,
            max_concurrent_per_requester: 10,
            ..RateLimiterConfig::public_default()
        });
        rl.record_start("a");
        rl.record_start("b");
        assert!(matches!(
            rl.check("c"),
            RateDecision::Denied {
                reason: RateLimitReason::GlobalConcurrent,
                ..
            }
        ));
        rl.record_end("a");
        assert!(rl.check("c").is_allowed());
    }

    #[test]
    fn counters_never_go_negative() {
        let rl = limiter(RateLimiterConfig::public_default());
        rl.record_start("u1");
        rl.record_end("u1");
        rl.record_end("u1"); // extra end must not underflow
        let stats = rl.stats();
        assert_eq!(stats.global_concurrent, 0);
        assert!(rl.check("u1").is_allowed());
    }

    #[test]
    fn clear_cooldown_and_reset() {
        let rl = limiter(RateLimiterConfig {
            max_requests_per_requester: 1,
            ..RateLimiterConfig::public_default()
        });
        rl.record_start("u1");
        rl.record_end("u1");
        assert!(!rl.check("u1").is_allowed());
        rl.clear_cooldown("u1");
        // window is still full; reset drops it
        rl.reset();
        assert!(rl.check("u1").is_allowed());
        assert_eq!(rl.stats().tracked_requesters, 1);
    }

    #[test]
    fn self_id_admin_ops() {
        let rl = limiter(RateLimiterConfig::public_default());
        assert!(rl.check("bot-x").is_allowed());
        rl.add_self_id("Bot-X");
        assert!(!rl.check("bot-x").is_allowed());
        rl.remove_self_id("BOT-X");
        assert!(rl.check("bot-x").is_allowed());
    }

    #[test]
    fn presets_match_their_profiles() {
        let public = RateLimiterConfig::public_default();
        assert_eq!(public.max_requests_per_requester, 10);
        assert_eq!(public.max_global_requests, 100);
        assert_eq!(public.max_concurrent_per_requester, 2);
        assert_eq!(public.max_global_concurrent, 10);
        assert_eq!(public.cooldown, Duration::from_secs(30));

        let strict = RateLimiterConfig::strict();
        assert_eq!(strict.max_requests_per_requester, 5);
        assert_eq!(strict.max_global_requests, 30);
        assert_eq!(strict.max_concurrent_per_requester, 1);
        assert_eq!(strict.max_global_concurrent, 5);
        assert_eq!(strict.cooldown, Duration::from_secs(60));
    }

    #[test]
    fn token_bucket_denies_when_drained() {
        let tb = TokenBucketLimiter::new(TokenBucketConfig {
            requester_rate_per_sec: 0.001,
            requester_burst: 2.0,
            global_rate_per_sec: 100.0,
            global_burst: 100.0,
            self_ids: vec!["bot-1".to_string()],
        });
        assert!(tb.check("u1").is_allowed());
        tb.consume("u1");
        assert!(tb.check("u1").is_allowed());
        tb.consume("u1");
        match tb.check("u1") {
            RateDecision::Denied {
                reason: RateLimitReason::RequesterRateLimit,
                retry_after: Some(retry),
            } => assert!(retry > Duration::ZERO),
            other => panic!("expected drain, got {other:?}"),
        }
        // the self bar is preserved
        assert!(!tb.check("BOT-1").is_allowed());
    }
}
