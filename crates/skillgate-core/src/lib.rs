pub mod context;
pub mod error;
pub mod interp;
pub mod llm_client;
pub mod manifest;
pub mod observability;
pub mod result;
pub mod trust;

pub use context::{CommandSpec, ExecutionContext};
pub use error::{CapabilityDomain, RateLimitReason, SkillError};
pub use interp::{Program, SkillCompiler};
pub use llm_client::{LlmClient, PredictOptions, PredictResponse};
pub use result::ExecutionResult;
pub use trust::{ExecBudget, Provenance, TrustLevel};
