//! Per-call execution context supplied by the host.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::llm_client::LlmClient;
use crate::trust::Provenance;

/// One allowlisted shell command. Consumed by the shell capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Binary name as invoked (no path separators).
    pub name: String,
    /// Regexes each argument may match when `strict_args` is on.
    #[serde(default)]
    pub arg_patterns: Vec<String>,
    /// Require every argument to match at least one of `arg_patterns`;
    /// with no patterns declared, refuse any argument at all.
    #[serde(default)]
    pub strict_args: bool,
    /// Working directory override for this command.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// Extra environment for this command (sanitized before injection).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_output_bytes: Option<u64>,
}

impl CommandSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            arg_patterns: Vec::new(),
            strict_args: false,
            workdir: None,
            env: BTreeMap::new(),
            timeout_secs: None,
            max_output_bytes: None,
        }
    }
}

/// Everything the executor needs to assemble a capability table for one call.
#[derive(Clone)]
pub struct ExecutionContext {
    pub provenance: Provenance,
    pub requester_id: Option<String>,
    pub channel_id: Option<String>,
    /// Jail root. Every filesystem and shell path is confined to it.
    pub workdir: PathBuf,
    /// Host patterns the fetch capability may reach (`*.example.com`, `10.*`).
    pub allowed_hosts: Vec<String>,
    /// Sub-directories of `workdir` that write-level skills may modify.
    /// Empty means the whole jail once writes are enabled.
    pub writable_subdirs: Vec<PathBuf>,
    /// Additional shell allowlist entries merged after the defaults.
    pub extra_commands: Vec<CommandSpec>,
    pub llm: Option<Arc<dyn LlmClient>>,
    /// Free-form metadata propagated to the skill's context map.
    pub metadata: BTreeMap<String, String>,
}

impl ExecutionContext {
    pub fn new(provenance: Provenance, workdir: impl Into<PathBuf>) -> Self {
        Self {
            provenance,
            requester_id: None,
            channel_id: None,
            workdir: workdir.into(),
            allowed_hosts: Vec::new(),
            writable_subdirs: Vec::new(),
            extra_commands: Vec::new(),
            llm: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Flatten provenance fields into the map handed to the skill.
    pub fn context_map(&self) -> BTreeMap<String, String> {
        let mut map = self.metadata.clone();
        map.insert("provenance".to_string(), self.provenance.as_str().to_string());
        if let Some(ref id) = self.requester_id {
            map.insert("requester_id".to_string(), id.clone());
        }
        if let Some(ref ch) = self.channel_id {
            map.insert("channel_id".to_string(), ch.clone());
        }
        map
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("provenance", &self.provenance)
            .field("requester_id", &self.requester_id)
            .field("channel_id", &self.channel_id)
            .field("workdir", &self.workdir)
            .field("allowed_hosts", &self.allowed_hosts)
            .field("writable_subdirs", &self.writable_subdirs)
            .field("extra_commands", &self.extra_commands.len())
            .field("llm", &self.llm.is_some())
            .finish()
    }
}
