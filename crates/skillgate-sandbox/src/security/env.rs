//! Dangerous environment variable detection and filtering.

use std::collections::BTreeMap;

/// Variables that alter loader, interpreter, or shell behavior when a child
/// process starts. Compared case-insensitively.
const DANGEROUS_ENV_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "DYLD_FRAMEWORK_PATH",
    "PYTHONPATH",
    "PYTHONSTARTUP",
    "NODE_OPTIONS",
    "NODE_PATH",
    "PERL5LIB",
    "PERL5OPT",
    "RUBYLIB",
    "RUBYOPT",
    "IFS",
    "ENV",
    "BASH_ENV",
    "SHELLOPTS",
    "PS4",
    "GIT_SSH_COMMAND",
    "GIT_PROXY_COMMAND",
];

const DANGEROUS_PREFIXES: &[&str] = &["LD_", "DYLD_"];

/// Is `name` an environment variable a skill must not control?
///
/// Membership in the enumerated set, the `LD_`/`DYLD_` prefixes, and the
/// exact name `PATH` all count. Case-insensitive.
pub fn is_dangerous_env(name: &str) -> bool {
    let upper = name.trim().to_ascii_uppercase();
    if upper == "PATH" {
        return true;
    }
    if DANGEROUS_PREFIXES.iter().any(|p| upper.starts_with(p)) {
        return true;
    }
    DANGEROUS_ENV_VARS.iter().any(|v| *v == upper)
}

/// Keyed filter: drop every dangerous name. Idempotent.
pub fn sanitize_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(k, _)| !is_dangerous_env(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_enumerated_prefixed_and_path() {
        assert!(is_dangerous_env("LD_PRELOAD"));
        assert!(is_dangerous_env("ld_preload"));
        assert!(is_dangerous_env("LD_ANYTHING_AT_ALL"));
        assert!(is_dangerous_env("DYLD_INSERT_LIBRARIES"));
        assert!(is_dangerous_env("PATH"));
        assert!(is_dangerous_env("path"));
        assert!(is_dangerous_env("NODE_OPTIONS"));
        assert!(is_dangerous_env("Ifs"));

        assert!(!is_dangerous_env("HOME"));
        assert!(!is_dangerous_env("LANG"));
        assert!(!is_dangerous_env("MY_APP_TOKEN"));
        // PATH is exact-name only; PATHEXT and friends pass
        assert!(!is_dangerous_env("PATHEXT"));
    }

    #[test]
    fn sanitize_drops_dangerous_keys_and_is_idempotent() {
        let mut env = BTreeMap::new();
        env.insert("HOME".to_string(), "/tmp/ws".to_string());
        env.insert("LD_PRELOAD".to_string(), "evil.so".to_string());
        env.insert("PATH".to_string(), "/usr/bin".to_string());
        env.insert("LANG".to_string(), "C".to_string());

        let once = sanitize_env(&env);
        assert_eq!(once.len(), 2);
        assert!(once.contains_key("HOME"));
        assert!(once.contains_key("LANG"));

        let twice = sanitize_env(&once);
        assert_eq!(once, twice);
    }
}
