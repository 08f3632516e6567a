//! Trust-level policy: provenance ceilings and capability assembly.
//!
//! Assembly is monotonic: each level starts from the prior level's
//! capability set and adds or relaxes exactly one thing. `full` relaxes
//! writes and deletes but still enforces the shell allowlist; there is no
//! level at which untrusted code reaches an unrestricted shell.

use std::sync::Arc;

use anyhow::Result;

use skillgate_core::context::{CommandSpec, ExecutionContext};
use skillgate_core::error::SkillError;
use skillgate_core::observability;
use skillgate_core::trust::{Provenance, TrustLevel};

use skillgate_sandbox::fetch::{FetchCapability, FetchConfig};
use skillgate_sandbox::fs::{FsCapability, FsConfig};
use skillgate_sandbox::llm::{LlmCapability, LlmConfig};
use skillgate_sandbox::shell::{ShellCapability, ShellConfig};
use skillgate_sandbox::table::CapabilityTable;

/// Conservative built-in shell allowlist. Context-supplied entries are
/// merged after these and shadow same-named entries.
pub fn default_shell_commands() -> Vec<CommandSpec> {
    ["cat", "ls", "echo", "head", "tail", "wc", "grep", "sort", "uniq", "date"]
        .iter()
        .map(|name| CommandSpec::new(name))
        .collect()
}

/// Refuse a declared level above the provenance ceiling. This failure
/// precedes execution and bypasses all skill-visible error handling.
pub fn check_ceiling(
    skill: &str,
    level: TrustLevel,
    provenance: Provenance,
) -> Result<(), SkillError> {
    if provenance.allows(level) {
        return Ok(());
    }
    observability::trust_denied(skill, level.as_str(), provenance.as_str());
    Err(SkillError::TrustDenied { level, provenance })
}

/// Build the capability table for one execution at `level`.
pub fn assemble_capabilities(
    level: TrustLevel,
    ctx: &ExecutionContext,
) -> Result<CapabilityTable> {
    let mut table = CapabilityTable::new();

    if level >= TrustLevel::Network {
        let fetch = FetchCapability::new(FetchConfig::new(ctx.allowed_hosts.clone()))?;
        table = table.with_fetch(Arc::new(fetch));
    }

    if level >= TrustLevel::Read {
        let mut fs_cfg = FsConfig::read_only(&ctx.workdir);
        if level >= TrustLevel::Write {
            fs_cfg.allow_write = true;
            fs_cfg.allow_create = true;
            if level < TrustLevel::Full && !ctx.writable_subdirs.is_empty() {
                for dir in &ctx.writable_subdirs {
                    let dir = dir.to_string_lossy();
                    fs_cfg.write_allow_patterns.push(dir.to_string());
                    fs_cfg.write_allow_patterns.push(format!("{dir}/**"));
                }
            }
        }
        if level >= TrustLevel::Full {
            fs_cfg.allow_delete = true;
        }
        table = table.with_fs(Arc::new(FsCapability::new(fs_cfg)?));
    }

    if level >= TrustLevel::Llm {
        if let Some(client) = &ctx.llm {
            let llm = LlmCapability::new(client.clone(), LlmConfig::default())?;
            table = table.with_llm(Arc::new(llm));
        }
    }

    if level >= TrustLevel::Shell {
        let mut commands = default_shell_commands();
        for extra in &ctx.extra_commands {
            commands.retain(|c| c.name != extra.name);
            commands.push(extra.clone());
        }
        let shell = ShellCapability::new(ShellConfig::new(&ctx.workdir, commands))?;
        table = table.with_shell(Arc::new(shell));
    }

    Ok(table)
}
