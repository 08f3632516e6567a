//! Skill manifests and the on-disk loader.
//!
//! A skill arrives either as a standalone YAML manifest next to its source
//! file, or as a single document whose YAML front matter carries the
//! manifest and whose body carries the source. The loader also runs the
//! forbidden-construct screen: source that reaches for code evaluators,
//! prototype or constructor access, or module imports is rejected before it
//! is ever compiled.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SkillError;
use crate::trust::TrustLevel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillManifest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub trust_level: Option<TrustLevel>,
    /// Capability-name tags declared by the author (`read`, `fetch`, ...).
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
    /// Source file reference, relative to the manifest (standalone form).
    #[serde(default)]
    pub source: Option<String>,
}

impl SkillManifest {
    /// Declared trust level, falling back to inference from the tags.
    pub fn effective_trust(&self) -> TrustLevel {
        self.trust_level
            .unwrap_or_else(|| TrustLevel::infer(self.capabilities.iter().map(String::as_str)))
    }
}

/// Manifest plus source text, ready for compilation.
#[derive(Debug, Clone)]
pub struct LoadedSkillSource {
    pub manifest: SkillManifest,
    pub source: String,
    /// sha256 of the source, for cache invalidation.
    pub source_hash: String,
    pub path: PathBuf,
}

struct ForbiddenConstruct {
    pattern: &'static str,
    description: &'static str,
}

const FORBIDDEN_CONSTRUCTS: &[ForbiddenConstruct] = &[
    ForbiddenConstruct {
        pattern: r"\beval\s*\(",
        description: "code evaluator",
    },
    ForbiddenConstruct {
        pattern: r"\bnew\s+Function\b|\bFunction\s*\(",
        description: "dynamic function constructor",
    },
    ForbiddenConstruct {
        pattern: r"__proto__",
        description: "prototype access",
    },
    ForbiddenConstruct {
        pattern: r"\.prototype\b",
        description: "prototype access",
    },
    ForbiddenConstruct {
        pattern: r"\bconstructor\b",
        description: "constructor access",
    },
    ForbiddenConstruct {
        pattern: r"\brequire\s*\(",
        description: "module import",
    },
    ForbiddenConstruct {
        pattern: r"\bimport\b",
        description: "module import",
    },
    ForbiddenConstruct {
        pattern: r"\bclass\b",
        description: "class declaration",
    },
];

lazy_static! {
    static ref FORBIDDEN_REGEXES: Vec<(Regex, &'static str)> = FORBIDDEN_CONSTRUCTS
        .iter()
        .map(|c| {
            (
                Regex::new(c.pattern).expect("forbidden-construct pattern is valid"),
                c.description,
            )
        })
        .collect();
    /// Capability opcode tokens, for inference when neither a declared level
    /// nor tags nor a compiler-emitted use set is available.
    static ref CAPABILITY_TOKEN: Regex = Regex::new(
        r"\b(read|write|delete|mkdir|list|stat|exists|run|exec|spawn|shell|fetch|predict|embed)\b"
    )
    .expect("capability token pattern is valid");
}

/// Reject source containing constructs the skill language must not reach.
pub fn check_forbidden_constructs(source: &str) -> Result<(), SkillError> {
    for (re, description) in FORBIDDEN_REGEXES.iter() {
        if re.is_match(source) {
            return Err(SkillError::SkillValidationFailed {
                message: format!("forbidden construct: {description}"),
            });
        }
    }
    Ok(())
}

/// Textual sweep for capability opcodes. Approximate; the compiler-emitted
/// use set wins when present.
pub fn scan_capability_tokens(source: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for cap in CAPABILITY_TOKEN.captures_iter(source) {
        let tok = cap[1].to_string();
        if !seen.contains(&tok) {
            seen.push(tok);
        }
    }
    seen
}

pub fn source_hash(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}

/// Load a skill from disk.
///
/// `path` is either a `.yaml`/`.yml` manifest (standalone form) or a
/// source-carrying document with a `---` front-matter block.
pub fn load_skill(path: &Path) -> Result<LoadedSkillSource> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read skill: {}", path.display()))?;

    let (manifest, source) = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => {
            let manifest: SkillManifest = serde_yaml::from_str(&raw)
                .with_context(|| format!("Failed to parse manifest: {}", path.display()))?;
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let source_path = match manifest.source {
                Some(ref rel) => dir.join(rel),
                None => dir.join(format!(
                    "{}.skill",
                    path.file_stem().and_then(|s| s.to_str()).unwrap_or("skill")
                )),
            };
            let source = fs::read_to_string(&source_path).with_context(|| {
                format!("Failed to read skill source: {}", source_path.display())
            })?;
            (manifest, source)
        }
        _ => parse_front_matter(&raw)
            .with_context(|| format!("Failed to parse skill document: {}", path.display()))?,
    };

    if manifest.name.trim().is_empty() {
        anyhow::bail!("skill manifest is missing a name: {}", path.display());
    }

    check_forbidden_constructs(&source).map_err(|e| anyhow::anyhow!("{e}"))?;

    let hash = source_hash(&source);
    Ok(LoadedSkillSource {
        manifest,
        source,
        source_hash: hash,
        path: path.to_path_buf(),
    })
}

/// Split a `---` fenced front-matter document into manifest and source body.
pub fn parse_front_matter(document: &str) -> Result<(SkillManifest, String)> {
    let rest = document
        .strip_prefix("---")
        .context("document does not start with a front-matter fence")?;
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end = rest
        .find("\n---")
        .context("unterminated front-matter block")?;
    let yaml = &rest[..end];
    let body = rest[end + 4..].trim_start_matches('\n');

    let manifest: SkillManifest =
        serde_yaml::from_str(yaml).context("invalid front-matter manifest")?;
    Ok((manifest, body.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DOC: &str = "---\nname: greet\ndescription: say hello\ncapabilities:\n  - read\n---\nlet x = caps.read(\"greeting.txt\")\nreturn x\n";

    #[test]
    fn front_matter_parses_manifest_and_body() {
        let (manifest, body) = parse_front_matter(DOC).unwrap();
        assert_eq!(manifest.name, "greet");
        assert_eq!(manifest.capabilities, vec!["read".to_string()]);
        assert!(body.starts_with("let x"));
        assert_eq!(manifest.effective_trust(), TrustLevel::Read);
    }

    #[test]
    fn load_front_matter_document_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greet.skill");
        fs::write(&path, DOC).unwrap();

        let loaded = load_skill(&path).unwrap();
        assert_eq!(loaded.manifest.name, "greet");
        assert_eq!(loaded.source_hash.len(), 64);
    }

    #[test]
    fn load_standalone_manifest_with_source_ref() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("greet.yaml");
        let mut f = fs::File::create(&manifest_path).unwrap();
        writeln!(f, "name: greet\nsource: body.txt\ntrust_level: network").unwrap();
        fs::write(dir.path().join("body.txt"), "return fetch(\"https://example.com\")").unwrap();

        let loaded = load_skill(&manifest_path).unwrap();
        assert_eq!(loaded.manifest.trust_level, Some(TrustLevel::Network));
        assert!(loaded.source.contains("example.com"));
    }

    #[test]
    fn forbidden_constructs_are_rejected() {
        for src in [
            "eval(\"1+1\")",
            "new Function(\"x\")",
            "a.__proto__.b = 1",
            "Array.prototype.push",
            "obj.constructor",
            "require(\"fs\")",
            "import something",
            "class Foo {}",
        ] {
            assert!(check_forbidden_constructs(src).is_err(), "accepted: {src}");
        }
        assert!(check_forbidden_constructs("let a = caps.read(\"f\")").is_ok());
    }

    #[test]
    fn loader_rejects_forbidden_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.skill");
        fs::write(&path, "---\nname: bad\n---\neval(\"boom\")\n").unwrap();
        assert!(load_skill(&path).is_err());
    }

    #[test]
    fn capability_token_sweep_finds_opcodes() {
        let toks = scan_capability_tokens("let a = read(p); exec(\"ls\", [])");
        assert!(toks.contains(&"read".to_string()));
        assert!(toks.contains(&"exec".to_string()));
        assert_eq!(TrustLevel::infer(toks.iter().map(String::as_str)), TrustLevel::Shell);
    }

    #[test]
    fn source_hash_is_stable() {
        assert_eq!(source_hash("abc"), source_hash("abc"));
        assert_ne!(source_hash("abc"), source_hash("abd"));
    }
}
