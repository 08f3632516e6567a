//! Execution result returned to the host for every call.

use std::time::Duration;

use serde_json::Value;

use crate::error::{RateLimitReason, SkillError};

/// Outcome of one executor call. The caller always receives one of these,
/// never an error; `success` plus `error` describe what happened.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub value: Option<Value>,
    pub error: Option<SkillError>,
    pub fuel_used: u64,
    pub trace: Option<Vec<String>>,
    pub warnings: Vec<String>,
    pub success: bool,
    pub duration: Duration,
    /// Set when the request was refused by the rate limiter before execution.
    pub rate_limit_reason: Option<RateLimitReason>,
    pub retry_after: Option<Duration>,
}

impl ExecutionResult {
    pub fn success(value: Option<Value>, fuel_used: u64, duration: Duration) -> Self {
        Self {
            value,
            error: None,
            fuel_used,
            trace: None,
            warnings: Vec::new(),
            success: true,
            duration,
            rate_limit_reason: None,
            retry_after: None,
        }
    }

    pub fn failure(error: SkillError, duration: Duration) -> Self {
        Self {
            value: None,
            error: Some(error),
            fuel_used: 0,
            trace: None,
            warnings: Vec::new(),
            success: false,
            duration,
            rate_limit_reason: None,
            retry_after: None,
        }
    }

    /// Refusal produced before the interpreter was ever invoked.
    pub fn rate_limited(reason: RateLimitReason, retry_after: Option<Duration>) -> Self {
        Self {
            value: None,
            error: Some(SkillError::RateLimited {
                reason,
                retry_after,
            }),
            fuel_used: 0,
            trace: None,
            warnings: Vec::new(),
            success: false,
            duration: Duration::ZERO,
            rate_limit_reason: Some(reason),
            retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_result_is_marked_before_execution() {
        let res = ExecutionResult::rate_limited(
            RateLimitReason::RequesterCooldown,
            Some(Duration::from_secs(12)),
        );
        assert!(!res.success);
        assert_eq!(res.rate_limit_reason, Some(RateLimitReason::RequesterCooldown));
        assert_eq!(res.retry_after, Some(Duration::from_secs(12)));
        assert_eq!(res.fuel_used, 0);
    }
}
