//! Contracts for the external transpiler.
//!
//! The skill-language compiler and bytecode interpreter are collaborators
//! consumed through these types; their internals live elsewhere. A compiled
//! `Program` is opaque to the sandbox apart from its capability-use set,
//! which feeds trust-level inference.

use crate::error::SkillError;

/// A compiled skill program.
#[derive(Debug, Clone, Default)]
pub struct Program {
    /// Opaque compiled representation owned by the transpiler.
    pub bytecode: Vec<u8>,
    /// Capability opcodes the compiler observed in the source. More reliable
    /// than a textual sweep of the source for inferring a trust level.
    pub capability_uses: Vec<String>,
}

impl Program {
    pub fn is_empty(&self) -> bool {
        self.bytecode.is_empty()
    }
}

/// Pure `compile(source) -> Program` contract.
pub trait SkillCompiler: Send + Sync {
    fn compile(&self, source: &str) -> Result<Program, SkillError>;
}
