//! Error taxonomy for skill execution.
//!
//! Errors carry a *kind* and an opaque message. The messages surfaced to a
//! running skill are drawn from a tiny closed vocabulary so a skill cannot
//! learn from the message why it was blocked; detailed reasons travel only
//! through event hooks and tracing.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::trust::{Provenance, TrustLevel};

/// Opaque refusal for filesystem operations.
pub const MSG_ACCESS_DENIED: &str = "Access denied";
/// Opaque refusal for shell operations.
pub const MSG_COMMAND_FAILED: &str = "Command failed";
/// Opaque refusal for fetch and LLM operations.
pub const MSG_REQUEST_BLOCKED: &str = "Request blocked";

/// The capability family an effect belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityDomain {
    Fs,
    Shell,
    Fetch,
    Llm,
}

impl CapabilityDomain {
    /// The closed-vocabulary message skills see for refusals in this domain.
    pub fn opaque_message(&self) -> &'static str {
        match self {
            CapabilityDomain::Fs => MSG_ACCESS_DENIED,
            CapabilityDomain::Shell => MSG_COMMAND_FAILED,
            CapabilityDomain::Fetch | CapabilityDomain::Llm => MSG_REQUEST_BLOCKED,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityDomain::Fs => "fs",
            CapabilityDomain::Shell => "shell",
            CapabilityDomain::Fetch => "fetch",
            CapabilityDomain::Llm => "llm",
        }
    }
}

/// Why the rate limiter refused a request. First failing gate wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitReason {
    SelfMessage,
    RequesterCooldown,
    RequesterConcurrent,
    RequesterRateLimit,
    GlobalConcurrent,
    GlobalRateLimit,
}

impl RateLimitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitReason::SelfMessage => "self_message",
            RateLimitReason::RequesterCooldown => "requester_cooldown",
            RateLimitReason::RequesterConcurrent => "requester_concurrent",
            RateLimitReason::RequesterRateLimit => "requester_rate_limit",
            RateLimitReason::GlobalConcurrent => "global_concurrent",
            RateLimitReason::GlobalRateLimit => "global_rate_limit",
        }
    }
}

/// Terminal outcome of a refused or failed execution.
///
/// `CapabilityRefused` is the only kind a skill can observe mid-run; the
/// rest short-circuit before the interpreter or terminate it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SkillError {
    #[error("{message}")]
    SkillValidationFailed { message: String },

    #[error("trust level not permitted for this source")]
    TrustDenied {
        level: TrustLevel,
        provenance: Provenance,
    },

    #[error("rate limited")]
    RateLimited {
        reason: RateLimitReason,
        retry_after: Option<Duration>,
    },

    #[error("{}", domain.opaque_message())]
    CapabilityRefused { domain: CapabilityDomain },

    #[error("fuel exhausted")]
    FuelExhausted,

    #[error("execution timed out")]
    Timeout,

    #[error("{0}")]
    InterpreterError(String),

    #[error("{0}")]
    HostError(String),
}

impl SkillError {
    pub fn refused(domain: CapabilityDomain) -> Self {
        SkillError::CapabilityRefused { domain }
    }

    /// Stable kind tag for audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            SkillError::SkillValidationFailed { .. } => "skill_validation_failed",
            SkillError::TrustDenied { .. } => "trust_denied",
            SkillError::RateLimited { .. } => "rate_limited",
            SkillError::CapabilityRefused { .. } => "capability_refused",
            SkillError::FuelExhausted => "fuel_exhausted",
            SkillError::Timeout => "timeout",
            SkillError::InterpreterError(_) => "interpreter_error",
            SkillError::HostError(_) => "host_error",
        }
    }
}
