//! Blocked file patterns and dangerous path shapes.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// What kind of sensitive material a pattern protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    Credentials,
    Ssh,
    CloudConfig,
    PackageManager,
    History,
    System,
    AgentConfig,
    DangerousPath,
}

/// A catalog match. Absence of a hit means the input is not blocked.
#[derive(Debug, Clone)]
pub struct BlockHit {
    pub pattern: String,
    pub description: &'static str,
    pub category: PatternCategory,
}

struct RuleDef {
    pattern: &'static str,
    description: &'static str,
    category: PatternCategory,
}

/// Path shapes that are refused outright, before any resolution: traversal,
/// absolute system paths, home references, URL-encoded escapes, null bytes.
const DANGEROUS_PATHS: &[RuleDef] = &[
    RuleDef {
        pattern: r"\.\.([/\\]|$)",
        description: "Dangerous path pattern",
        category: PatternCategory::DangerousPath,
    },
    RuleDef {
        pattern: r"^~",
        description: "Home directory reference",
        category: PatternCategory::DangerousPath,
    },
    RuleDef {
        pattern: r"^/(etc|proc|sys|dev|boot|root|var/log)(/|$)",
        description: "Absolute system path",
        category: PatternCategory::DangerousPath,
    },
    RuleDef {
        pattern: r"(?i)%2e%2e",
        description: "URL-encoded traversal",
        category: PatternCategory::DangerousPath,
    },
    RuleDef {
        pattern: r"(?i)%252e",
        description: "Double URL-encoded traversal",
        category: PatternCategory::DangerousPath,
    },
    RuleDef {
        pattern: "\x00",
        description: "Null byte in path",
        category: PatternCategory::DangerousPath,
    },
];

/// Files and directories never exposed to a skill, wherever they appear.
const BLOCKED_FILES: &[RuleDef] = &[
    RuleDef {
        pattern: r"(?i)(^|/)\.env(\.[^/]+)?$",
        description: "Environment file",
        category: PatternCategory::Credentials,
    },
    RuleDef {
        pattern: r"(?i)(^|/)credentials?(\.(json|ya?ml|toml|xml|txt))?$",
        description: "Credential file",
        category: PatternCategory::Credentials,
    },
    RuleDef {
        pattern: r"(?i)(^|/)secrets?\.(json|ya?ml|toml)$",
        description: "Secret store",
        category: PatternCategory::Credentials,
    },
    RuleDef {
        pattern: r"(?i)\.(pem|key|p12|pfx)$",
        description: "Key material",
        category: PatternCategory::Credentials,
    },
    RuleDef {
        pattern: r"(?i)(^|/)wallet\.dat$",
        description: "Wallet file",
        category: PatternCategory::Credentials,
    },
    RuleDef {
        pattern: r"(?i)(^|/)id_(rsa|dsa|ecdsa|ed25519)(\.pub)?$",
        description: "SSH key",
        category: PatternCategory::Ssh,
    },
    RuleDef {
        pattern: r"(?i)(^|/)\.ssh(/|$)",
        description: "SSH configuration directory",
        category: PatternCategory::Ssh,
    },
    RuleDef {
        pattern: r"(?i)(^|/)known_hosts$|(?i)(^|/)authorized_keys$",
        description: "SSH host/key registry",
        category: PatternCategory::Ssh,
    },
    RuleDef {
        pattern: r"(?i)(^|/)\.aws(/|$)",
        description: "AWS configuration",
        category: PatternCategory::CloudConfig,
    },
    RuleDef {
        pattern: r"(?i)(^|/)\.kube(/|$)",
        description: "Kubernetes configuration",
        category: PatternCategory::CloudConfig,
    },
    RuleDef {
        pattern: r"(?i)(^|/)\.docker(/|$)",
        description: "Docker configuration",
        category: PatternCategory::CloudConfig,
    },
    RuleDef {
        pattern: r"(?i)(^|/)\.gnupg(/|$)",
        description: "GnuPG keyring",
        category: PatternCategory::Credentials,
    },
    RuleDef {
        pattern: r"(?i)(^|/)\.netrc$",
        description: "Netrc credentials",
        category: PatternCategory::Credentials,
    },
    RuleDef {
        pattern: r"(?i)(^|/)\.(npmrc|pypirc|gemrc)$",
        description: "Package manager credentials",
        category: PatternCategory::PackageManager,
    },
    RuleDef {
        pattern: r"(?i)(^|/)\.cargo/credentials(\.toml)?$",
        description: "Cargo registry credentials",
        category: PatternCategory::PackageManager,
    },
    RuleDef {
        pattern: r"(?i)(^|/)\.git/(config|hooks)(/|$)",
        description: "Git configuration",
        category: PatternCategory::PackageManager,
    },
    RuleDef {
        pattern: r"(?i)(^|/)\.[a-z]+_history$",
        description: "Shell history",
        category: PatternCategory::History,
    },
    RuleDef {
        pattern: r"(?i)(^|/)(shadow|passwd|sudoers)$",
        description: "System account database",
        category: PatternCategory::System,
    },
    RuleDef {
        pattern: r"(?i)(^|/)\.(claude|cursor|mcp\.json)(/|$)",
        description: "Agent configuration",
        category: PatternCategory::AgentConfig,
    },
];

struct Rule {
    re: Regex,
    pattern: &'static str,
    description: &'static str,
    category: PatternCategory,
}

fn compile(defs: &'static [RuleDef]) -> Vec<Rule> {
    defs.iter()
        .map(|d| Rule {
            re: Regex::new(d.pattern).expect("catalog pattern is valid"),
            pattern: d.pattern,
            description: d.description,
            category: d.category,
        })
        .collect()
}

lazy_static! {
    static ref DANGEROUS: Vec<Rule> = compile(DANGEROUS_PATHS);
    static ref BLOCKED: Vec<Rule> = compile(BLOCKED_FILES);
}

fn hit(rule: &Rule) -> BlockHit {
    BlockHit {
        pattern: rule.pattern.to_string(),
        description: rule.description,
        category: rule.category,
    }
}

/// Test only the dangerous-path table (traversal, system roots, encodings).
pub fn dangerous_path(path: &str) -> Option<BlockHit> {
    DANGEROUS.iter().find(|r| r.re.is_match(path)).map(hit)
}

/// Test only the blocked-file table, against the whole path and each path
/// component.
pub fn blocked_file(path: &str) -> Option<BlockHit> {
    for rule in BLOCKED.iter() {
        if rule.re.is_match(path) {
            return Some(hit(rule));
        }
        for component in path.split(['/', '\\']) {
            if !component.is_empty() && rule.re.is_match(component) {
                return Some(hit(rule));
            }
        }
    }
    None
}

/// Classify a path. The dangerous-path table runs first; then the blocked
/// file table. Short-circuits on the first match; `None` means not blocked.
pub fn is_blocked(path: &str) -> Option<BlockHit> {
    dangerous_path(path).or_else(|| blocked_file(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_and_encodings_are_dangerous() {
        for p in [
            "../../../etc/passwd",
            "a/../b",
            "~",
            "~/secrets",
            "/etc/passwd",
            "/proc/self/environ",
            "a/%2e%2e/b",
            "a/%2E%2E/b",
            "%252e%252e/x",
            "file\x00.txt",
        ] {
            assert!(is_blocked(p).is_some(), "not blocked: {p:?}");
        }
    }

    #[test]
    fn dangerous_path_table_runs_first() {
        let hit = is_blocked("../.env").unwrap();
        assert_eq!(hit.category, PatternCategory::DangerousPath);
    }

    #[test]
    fn blocked_files_match_anywhere_in_the_tree() {
        for p in [
            ".env",
            "config/.env.production",
            "data/credentials.json",
            "credentials",
            "keys/id_rsa",
            "nested/.ssh/config",
            "certs/server.pem",
            "home/.bash_history",
            "project/.git/hooks/pre-commit",
            ".aws/config",
        ] {
            assert!(is_blocked(p).is_some(), "not blocked: {p}");
        }
    }

    #[test]
    fn component_matching_catches_deep_names() {
        // the suffix-anchored rule misses "id_rsa" mid-path on the whole
        // string; the per-component pass must catch it
        assert!(is_blocked("backup/id_rsa/copy").is_some());
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert!(is_blocked("Credentials.JSON").is_some());
        assert!(is_blocked(".ENV").is_some());
        assert!(is_blocked("ID_RSA").is_some());
    }

    #[test]
    fn ordinary_paths_pass() {
        for p in [
            "notes.txt",
            "src/main.rs",
            "data/report.json",
            "deeply/nested/dir/file.md",
            "environment.md",
            "envelope.txt",
        ] {
            assert!(is_blocked(p).is_none(), "wrongly blocked: {p}");
        }
    }

    #[test]
    fn classification_is_idempotent() {
        let a = is_blocked("x/credentials.json").map(|h| h.pattern);
        let b = is_blocked("x/credentials.json").map(|h| h.pattern);
        assert_eq!(a, b);
    }
}
