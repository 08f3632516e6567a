//! Tracing init and structured audit events.
//!
//! The sandbox emits events, it does not store them: every blocked access,
//! execution boundary, and rate-limit decision lands here as a structured
//! tracing event with the detailed (non-opaque) reason. Hosts that want
//! durable audit wire a subscriber or the executor/capability hooks.

use std::env;

use tracing_subscriber::{prelude::*, EnvFilter};

/// Initialize tracing. Call once at process startup.
///
/// `SKILLGATE_LOG_LEVEL` controls the filter (default `skillgate=info`);
/// `SKILLGATE_LOG_JSON=1` switches to the JSON layer.
pub fn init_tracing() {
    let level =
        env::var("SKILLGATE_LOG_LEVEL").unwrap_or_else(|_| "skillgate=info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let json = env::var("SKILLGATE_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let _ = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .try_init()
    };
}

/// A capability refused an operation. Carries the detailed reason that the
/// opaque error deliberately omits.
pub fn security_blocked(domain: &str, op: &str, resource: &str, reason: &str) {
    tracing::warn!(
        target: "skillgate::audit",
        event = "security_blocked",
        domain,
        op,
        resource,
        reason,
    );
}

/// A capability performed an effect.
pub fn capability_access(domain: &str, op: &str, resource: &str) {
    tracing::debug!(
        target: "skillgate::audit",
        event = "capability_access",
        domain,
        op,
        resource,
    );
}

pub fn execution_started(skill: &str, requester: Option<&str>, provenance: &str) {
    tracing::info!(
        target: "skillgate::audit",
        event = "execution_started",
        skill,
        requester = requester.unwrap_or("-"),
        provenance,
    );
}

pub fn execution_completed(skill: &str, success: bool, fuel_used: u64, duration_ms: u64) {
    tracing::info!(
        target: "skillgate::audit",
        event = "execution_completed",
        skill,
        success,
        fuel_used,
        duration_ms,
    );
}

pub fn trust_denied(skill: &str, level: &str, provenance: &str) {
    tracing::warn!(
        target: "skillgate::audit",
        event = "trust_denied",
        skill,
        level,
        provenance,
    );
}

pub fn rate_limited(requester: &str, reason: &str, retry_after_ms: Option<u64>) {
    tracing::warn!(
        target: "skillgate::audit",
        event = "rate_limited",
        requester,
        reason,
        retry_after_ms = retry_after_ms.unwrap_or(0),
    );
}
