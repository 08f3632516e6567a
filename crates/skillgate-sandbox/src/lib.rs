pub mod fetch;
pub mod fs;
pub mod interp;
pub mod llm;
pub mod process;
pub mod security;
pub mod shell;
pub mod table;

pub use fetch::{FetchCapability, FetchConfig, FetchResponse};
pub use fs::{FsCapability, FsConfig};
pub use interp::{Interpreter, InterpreterOutcome};
pub use llm::{LlmCapability, LlmConfig};
pub use shell::{ShellCapability, ShellConfig, ShellResult};
pub use table::CapabilityTable;

use std::sync::Arc;

/// Hook fired when a capability performs an effect: `(op, target)`.
pub type AccessHook = Arc<dyn Fn(&str, &str) + Send + Sync>;
/// Hook fired when a capability refuses an effect: `(op, target, reason)`.
/// Receives the detailed reason the opaque error omits.
pub type BlockedHook = Arc<dyn Fn(&str, &str, &str) + Send + Sync>;
