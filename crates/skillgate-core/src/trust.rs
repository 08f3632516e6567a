//! Trust levels, request provenance, and per-level execution budgets.
//!
//! A trust level is a rung on a strict total order; each level implies
//! strictly more authority than the prior one. Provenance is where a request
//! came from, and maps to a ceiling level the policy will not exceed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Ordered trust ladder. Derived `Ord` follows declaration order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    #[default]
    None,
    Network,
    Read,
    Llm,
    Write,
    Shell,
    Full,
}

impl TrustLevel {
    pub const ALL: [TrustLevel; 7] = [
        TrustLevel::None,
        TrustLevel::Network,
        TrustLevel::Read,
        TrustLevel::Llm,
        TrustLevel::Write,
        TrustLevel::Shell,
        TrustLevel::Full,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::None => "none",
            TrustLevel::Network => "network",
            TrustLevel::Read => "read",
            TrustLevel::Llm => "llm",
            TrustLevel::Write => "write",
            TrustLevel::Shell => "shell",
            TrustLevel::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Option<TrustLevel> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Some(TrustLevel::None),
            "network" => Some(TrustLevel::Network),
            "read" => Some(TrustLevel::Read),
            "llm" => Some(TrustLevel::Llm),
            "write" => Some(TrustLevel::Write),
            "shell" => Some(TrustLevel::Shell),
            "full" => Some(TrustLevel::Full),
            _ => None,
        }
    }

    /// Default interpreter fuel budget for this level.
    pub fn default_fuel(&self) -> u64 {
        match self {
            TrustLevel::None => 100,
            TrustLevel::Network => 500,
            TrustLevel::Read => 500,
            TrustLevel::Llm => 2_000,
            TrustLevel::Write => 1_000,
            TrustLevel::Shell => 2_000,
            TrustLevel::Full => 5_000,
        }
    }

    /// Default wall-clock timeout for a whole execution at this level.
    pub fn default_timeout(&self) -> Duration {
        let secs = match self {
            TrustLevel::None => 5,
            TrustLevel::Network => 30,
            TrustLevel::Read => 15,
            TrustLevel::Llm => 120,
            TrustLevel::Write => 30,
            TrustLevel::Shell => 60,
            TrustLevel::Full => 300,
        };
        Duration::from_secs(secs)
    }

    pub fn budget(&self) -> ExecBudget {
        ExecBudget {
            fuel: self.default_fuel(),
            timeout: self.default_timeout(),
        }
    }

    /// Minimum level that satisfies a single capability-name tag.
    fn required_for(tag: &str) -> TrustLevel {
        match tag.trim().to_ascii_lowercase().as_str() {
            "exec" | "spawn" | "shell" | "run" => TrustLevel::Shell,
            "write" | "delete" | "mkdir" => TrustLevel::Write,
            "predict" | "embed" | "llm" => TrustLevel::Llm,
            "read" | "list" | "stat" | "exists" | "fs" => TrustLevel::Read,
            "fetch" | "http" | "network" => TrustLevel::Network,
            _ => TrustLevel::None,
        }
    }

    /// Map a set of capability-name tags to the minimum trust level that
    /// satisfies all of them.
    pub fn infer<'a, I>(tags: I) -> TrustLevel
    where
        I: IntoIterator<Item = &'a str>,
    {
        tags.into_iter()
            .map(TrustLevel::required_for)
            .max()
            .unwrap_or(TrustLevel::None)
    }
}

/// Who initiated the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Main,
    Dm,
    Group,
    Public,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Main => "main",
            Provenance::Dm => "dm",
            Provenance::Group => "group",
            Provenance::Public => "public",
        }
    }

    /// Ceiling: the highest trust level this provenance may run at.
    pub fn max_trust(&self) -> TrustLevel {
        match self {
            Provenance::Main => TrustLevel::Full,
            Provenance::Dm => TrustLevel::Write,
            Provenance::Group => TrustLevel::Llm,
            Provenance::Public => TrustLevel::Network,
        }
    }

    pub fn allows(&self, level: TrustLevel) -> bool {
        level <= self.max_trust()
    }
}

/// Fuel plus wall-clock budget handed to the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecBudget {
    pub fuel: u64,
    pub timeout: Duration,
}
