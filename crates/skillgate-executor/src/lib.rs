pub mod executor;
pub mod policy;
pub mod rate_limit;

pub use executor::{Executor, ExecutorConfig};
pub use rate_limit::{
    RateDecision, RateLimiter, RateLimiterConfig, RateLimiterStats, TokenBucketConfig,
    TokenBucketLimiter,
};
