//! Contract for the external bytecode interpreter.
//!
//! The interpreter executes a compiled program against an injected
//! capability table under a fuel budget; every effect the program attempts
//! is dispatched through the table. Its internals are not redesigned here.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use skillgate_core::error::SkillError;
use skillgate_core::interp::Program;
use skillgate_core::trust::ExecBudget;

use crate::table::CapabilityTable;

/// What one execution produced. `error` set means the run terminated on a
/// condition the skill did not handle (fuel exhaustion, an unhandled
/// capability refusal, an interpreter fault).
#[derive(Debug, Clone, Default)]
pub struct InterpreterOutcome {
    pub value: Option<Value>,
    pub error: Option<SkillError>,
    pub fuel_used: u64,
    pub trace: Option<Vec<String>>,
    pub warnings: Vec<String>,
}

impl InterpreterOutcome {
    pub fn success(value: Value, fuel_used: u64) -> Self {
        Self {
            value: Some(value),
            fuel_used,
            ..Self::default()
        }
    }

    pub fn failure(error: SkillError, fuel_used: u64) -> Self {
        Self {
            error: Some(error),
            fuel_used,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Execute `program` with `args`, dispatching effects through `caps`.
    /// The wall-clock half of `budget` is enforced by the caller, which
    /// aborts this future on expiry; implementations must tolerate being
    /// dropped at any suspension point.
    async fn execute(
        &self,
        program: &Program,
        args: Value,
        caps: &CapabilityTable,
        budget: ExecBudget,
        context: &BTreeMap<String, String>,
    ) -> InterpreterOutcome;
}
