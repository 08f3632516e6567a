//! Filesystem capability: every file operation gated to a jail root.
//!
//! Admission for every operation: reject home-directory syntax, run the
//! dangerous-path table, resolve against the jail root, canonicalize
//! lexically, verify the offset from the root cannot escape, run the
//! blocked-file table (relative, absolute, and per component), then match
//! the allow set. Per-operation flags gate writes, creation, and deletes.
//!
//! All refusals surface the opaque "Access denied"; the detailed reason
//! goes to the `on_blocked` hook and the audit stream. No file handle
//! outlives a call.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::Serialize;

use skillgate_core::error::{CapabilityDomain, SkillError};
use skillgate_core::observability;

use crate::security;
use crate::{AccessHook, BlockedHook};

pub const DEFAULT_MAX_READ_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_WRITE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Jail root. Resolved to absolute form once at construction.
    pub root: PathBuf,
    /// Glob allow set, relative to the root. Empty means everything.
    pub allow_patterns: Vec<String>,
    /// Additional glob set write-class operations must also match.
    /// Empty means the whole jail once writes are enabled.
    pub write_allow_patterns: Vec<String>,
    /// Extra block regexes layered over the built-in catalog.
    pub block_patterns: Vec<String>,
    pub allow_write: bool,
    pub allow_delete: bool,
    pub allow_create: bool,
    pub max_read_bytes: u64,
    pub max_write_bytes: u64,
}

impl FsConfig {
    pub fn read_only(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            allow_patterns: Vec::new(),
            write_allow_patterns: Vec::new(),
            block_patterns: Vec::new(),
            allow_write: false,
            allow_delete: false,
            allow_create: false,
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
            max_write_bytes: DEFAULT_MAX_WRITE_BYTES,
        }
    }

    pub fn writable(root: impl Into<PathBuf>) -> Self {
        Self {
            allow_write: true,
            allow_create: true,
            ..Self::read_only(root)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
    pub is_file: bool,
    pub modified_epoch_secs: Option<u64>,
    pub readonly: bool,
}

pub struct FsCapability {
    root: PathBuf,
    allow: GlobSet,
    allow_is_default: bool,
    write_allow: Option<GlobSet>,
    extra_block: Vec<Regex>,
    allow_write: bool,
    allow_delete: bool,
    allow_create: bool,
    max_read_bytes: u64,
    max_write_bytes: u64,
    on_access: Option<AccessHook>,
    on_blocked: Option<BlockedHook>,
}

/// Collapse `.` and `..` without touching the filesystem.
pub(crate) fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    // underflow: preserve the component so containment fails
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        builder.add(Glob::new(p).with_context(|| format!("invalid allow pattern: {p}"))?);
    }
    builder.build().context("failed to build glob set")
}

impl FsCapability {
    pub fn new(config: FsConfig) -> Result<Self> {
        let root = config
            .root
            .canonicalize()
            .with_context(|| format!("invalid jail root: {}", config.root.display()))?;

        let allow_is_default = config.allow_patterns.is_empty();
        let allow = if allow_is_default {
            build_globset(&["**".to_string()])?
        } else {
            build_globset(&config.allow_patterns)?
        };
        let write_allow = if config.write_allow_patterns.is_empty() {
            None
        } else {
            Some(build_globset(&config.write_allow_patterns)?)
        };
        let extra_block = config
            .block_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("invalid block pattern: {p}")))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root,
            allow,
            allow_is_default,
            write_allow,
            extra_block,
            allow_write: config.allow_write,
            allow_delete: config.allow_delete,
            allow_create: config.allow_create,
            max_read_bytes: config.max_read_bytes,
            max_write_bytes: config.max_write_bytes,
            on_access: None,
            on_blocked: None,
        })
    }

    pub fn with_access_hook(mut self, hook: AccessHook) -> Self {
        self.on_access = Some(hook);
        self
    }

    pub fn with_blocked_hook(mut self, hook: BlockedHook) -> Self {
        self.on_blocked = Some(hook);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn deny(&self, op: &str, target: &str, reason: &str) -> SkillError {
        observability::security_blocked("fs", op, target, reason);
        if let Some(hook) = &self.on_blocked {
            hook(op, target, reason);
        }
        SkillError::refused(CapabilityDomain::Fs)
    }

    fn accessed(&self, op: &str, target: &str) {
        observability::capability_access("fs", op, target);
        if let Some(hook) = &self.on_access {
            hook(op, target);
        }
    }

    /// The admission algorithm. Returns the resolved absolute path.
    fn admit(&self, op: &str, raw: &str) -> Result<PathBuf, SkillError> {
        if raw.starts_with('~') {
            return Err(self.deny(op, raw, "Home directory reference"));
        }
        if let Some(hit) = security::dangerous_path(raw) {
            return Err(self.deny(op, raw, hit.description));
        }
        for re in &self.extra_block {
            if re.is_match(raw) {
                return Err(self.deny(op, raw, "Blocked by configured pattern"));
            }
        }

        let input = Path::new(raw);
        let joined = if input.is_absolute() {
            input.to_path_buf()
        } else {
            self.root.join(input)
        };
        let resolved = normalize_lexical(&joined);

        let offset = match resolved.strip_prefix(&self.root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => return Err(self.deny(op, raw, "Path escapes the jail")),
        };
        if offset.is_absolute()
            || matches!(offset.components().next(), Some(Component::ParentDir))
        {
            return Err(self.deny(op, raw, "Path escapes the jail"));
        }

        let offset_str = offset.to_string_lossy();
        if let Some(hit) = security::blocked_file(&offset_str) {
            return Err(self.deny(op, raw, hit.description));
        }
        if let Some(hit) = security::blocked_file(&resolved.to_string_lossy()) {
            return Err(self.deny(op, raw, hit.description));
        }

        if !offset.as_os_str().is_empty() || !self.allow_is_default {
            if !self.allow.is_match(&offset) {
                return Err(self.deny(op, raw, "Path not in allow set"));
            }
        }

        Ok(resolved)
    }

    /// Write-class operations must also fall inside the writable set.
    fn admit_write(&self, op: &str, raw: &str) -> Result<PathBuf, SkillError> {
        let resolved = self.admit(op, raw)?;
        if let Some(write_allow) = &self.write_allow {
            let offset = resolved
                .strip_prefix(&self.root)
                .expect("admitted path is under the root");
            if !write_allow.is_match(offset) {
                return Err(self.deny(op, raw, "Path not writable"));
            }
        }
        Ok(resolved)
    }

    pub fn read(&self, path: &str) -> Result<String, SkillError> {
        let resolved = self.admit("read", path)?;
        let meta = std::fs::metadata(&resolved)
            .map_err(|_| self.deny("read", path, "Not found"))?;
        if meta.is_dir() {
            return Err(self.deny("read", path, "Is a directory"));
        }
        if meta.len() > self.max_read_bytes {
            return Err(self.deny("read", path, "File exceeds read size cap"));
        }
        let bytes =
            std::fs::read(&resolved).map_err(|_| self.deny("read", path, "Read failed"))?;
        let content = String::from_utf8(bytes)
            .map_err(|_| self.deny("read", path, "Not valid UTF-8"))?;
        self.accessed("read", path);
        Ok(content)
    }

    /// Write `contents`, creating the file and missing parents when
    /// `allow_create` is set. An execution aborted mid-write is not rolled
    /// back.
    pub fn write(&self, path: &str, contents: &str) -> Result<u64, SkillError> {
        if !self.allow_write {
            return Err(self.deny("write", path, "Writes disabled"));
        }
        if contents.len() as u64 > self.max_write_bytes {
            return Err(self.deny("write", path, "Write exceeds size cap"));
        }
        let resolved = self.admit_write("write", path)?;

        if !resolved.exists() && !self.allow_create {
            return Err(self.deny("write", path, "Creation disabled"));
        }
        if let Some(parent) = resolved.parent() {
            if !parent.exists() {
                if !self.allow_create {
                    return Err(self.deny("write", path, "Parent directory missing"));
                }
                std::fs::create_dir_all(parent)
                    .map_err(|_| self.deny("write", path, "Write failed"))?;
            }
        }
        std::fs::write(&resolved, contents)
            .map_err(|_| self.deny("write", path, "Write failed"))?;
        self.accessed("write", path);
        Ok(contents.len() as u64)
    }

    /// Refused access answers *false* so that the existence of blocked
    /// paths is not disclosed.
    pub fn exists(&self, path: &str) -> bool {
        match self.admit("exists", path) {
            Ok(resolved) => {
                self.accessed("exists", path);
                resolved.exists()
            }
            Err(_) => false,
        }
    }

    /// Directory listing, filtered: entries that would themselves be
    /// refused by the blocked-file table are omitted, not disclosed.
    pub fn list(&self, path: &str) -> Result<Vec<String>, SkillError> {
        let resolved = self.admit("list", path)?;
        let meta = std::fs::metadata(&resolved)
            .map_err(|_| self.deny("list", path, "Not found"))?;
        if !meta.is_dir() {
            return Err(self.deny("list", path, "Not a directory"));
        }
        let entries = std::fs::read_dir(&resolved)
            .map_err(|_| self.deny("list", path, "List failed"))?;

        let mut names = BTreeSet::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let joined = resolved.join(&name);
            if security::blocked_file(&name).is_some()
                || security::blocked_file(&joined.to_string_lossy()).is_some()
            {
                continue;
            }
            names.insert(name);
        }
        self.accessed("list", path);
        Ok(names.into_iter().collect())
    }

    pub fn stat(&self, path: &str) -> Result<FileStat, SkillError> {
        let resolved = self.admit("stat", path)?;
        let meta = std::fs::metadata(&resolved)
            .map_err(|_| self.deny("stat", path, "Not found"))?;
        self.accessed("stat", path);
        Ok(FileStat {
            size: meta.len(),
            is_dir: meta.is_dir(),
            is_file: meta.is_file(),
            modified_epoch_secs: meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            readonly: meta.permissions().readonly(),
        })
    }

    /// Delete a regular file. Directories and symlinks are refused.
    pub fn delete(&self, path: &str) -> Result<(), SkillError> {
        if !self.allow_delete {
            return Err(self.deny("delete", path, "Deletes disabled"));
        }
        let resolved = self.admit_write("delete", path)?;
        let meta = std::fs::symlink_metadata(&resolved)
            .map_err(|_| self.deny("delete", path, "Not found"))?;
        if !meta.file_type().is_file() {
            return Err(self.deny("delete", path, "Not a regular file"));
        }
        std::fs::remove_file(&resolved)
            .map_err(|_| self.deny("delete", path, "Delete failed"))?;
        self.accessed("delete", path);
        Ok(())
    }

    pub fn mkdir(&self, path: &str) -> Result<(), SkillError> {
        if !self.allow_write {
            return Err(self.deny("mkdir", path, "Writes disabled"));
        }
        if !self.allow_create {
            return Err(self.deny("mkdir", path, "Creation disabled"));
        }
        let resolved = self.admit_write("mkdir", path)?;
        std::fs::create_dir_all(&resolved)
            .map_err(|_| self.deny("mkdir", path, "Mkdir failed"))?;
        self.accessed("mkdir", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn jail() -> (tempfile::TempDir, FsConfig) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/report.json"), "{}").unwrap();
        std::fs::write(dir.path().join("data/.env"), "SECRET=1").unwrap();
        let cfg = FsConfig::read_only(dir.path());
        (dir, cfg)
    }

    fn blocked_reasons() -> (Arc<Mutex<Vec<String>>>, BlockedHook) {
        let reasons: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = reasons.clone();
        let hook: BlockedHook =
            Arc::new(move |_op, _path, reason| sink.lock().unwrap().push(reason.to_string()));
        (reasons, hook)
    }

    #[test]
    fn traversal_is_refused_with_opaque_error_and_detailed_hook() {
        let (_dir, cfg) = jail();
        let (reasons, hook) = blocked_reasons();
        let fs = FsCapability::new(cfg).unwrap().with_blocked_hook(hook);

        let err = fs.read("../../../etc/passwd").unwrap_err();
        assert_eq!(err, SkillError::refused(CapabilityDomain::Fs));
        assert_eq!(err.to_string(), "Access denied");
        assert_eq!(reasons.lock().unwrap().as_slice(), ["Dangerous path pattern"]);
    }

    #[test]
    fn reads_inside_the_jail_succeed() {
        let (_dir, cfg) = jail();
        let fs = FsCapability::new(cfg).unwrap();
        assert_eq!(fs.read("notes.txt").unwrap(), "hello");
        assert_eq!(fs.read("data/report.json").unwrap(), "{}");
    }

    #[test]
    fn absolute_paths_outside_the_jail_are_refused() {
        let (_dir, cfg) = jail();
        let fs = FsCapability::new(cfg).unwrap();
        assert!(fs.read("/tmp/unrelated.txt").is_err());
        // absolute path *inside* the jail is fine
        let inside = fs.root().join("notes.txt");
        assert_eq!(fs.read(&inside.to_string_lossy()).unwrap(), "hello");
    }

    #[test]
    fn home_syntax_is_refused() {
        let (_dir, cfg) = jail();
        let fs = FsCapability::new(cfg).unwrap();
        assert!(fs.read("~/anything").is_err());
    }

    #[test]
    fn blocked_catalog_applies_to_relative_and_components() {
        let (_dir, cfg) = jail();
        let fs = FsCapability::new(cfg).unwrap();
        assert!(fs.read("data/.env").is_err());
        assert!(fs.read(".ssh/config").is_err());
        assert!(fs.read("credentials.json").is_err());
    }

    #[test]
    fn oversize_read_is_refused() {
        let (dir, mut cfg) = jail();
        cfg.max_read_bytes = 3;
        let fs = FsCapability::new(cfg).unwrap();
        assert!(fs.read("notes.txt").is_err());
        drop(dir);
    }

    #[test]
    fn directory_read_is_refused() {
        let (_dir, cfg) = jail();
        let fs = FsCapability::new(cfg).unwrap();
        assert!(fs.read("data").is_err());
    }

    #[test]
    fn writes_require_the_flag() {
        let (_dir, cfg) = jail();
        let fs = FsCapability::new(cfg).unwrap();
        let err = fs.write("out.txt", "x").unwrap_err();
        assert_eq!(err.to_string(), "Access denied");
    }

    #[test]
    fn write_and_create_paths() {
        let (dir, _) = jail();
        let mut cfg = FsConfig::writable(dir.path());
        cfg.allow_create = false;
        let fs = FsCapability::new(cfg).unwrap();
        // existing file: ok without create
        assert_eq!(fs.write("notes.txt", "updated").unwrap(), 7);
        // new file without create: refused
        assert!(fs.write("fresh.txt", "x").is_err());

        let fs = FsCapability::new(FsConfig::writable(dir.path())).unwrap();
        assert!(fs.write("new/dir/file.txt", "y").is_ok());
        assert_eq!(fs.read("new/dir/file.txt").unwrap(), "y");
    }

    #[test]
    fn oversize_write_is_refused() {
        let (dir, _) = jail();
        let mut cfg = FsConfig::writable(dir.path());
        cfg.max_write_bytes = 4;
        let fs = FsCapability::new(cfg).unwrap();
        assert!(fs.write("big.txt", "too big").is_err());
    }

    #[test]
    fn write_allow_patterns_confine_writes() {
        let (dir, _) = jail();
        let mut cfg = FsConfig::writable(dir.path());
        cfg.write_allow_patterns = vec!["data/**".to_string()];
        let fs = FsCapability::new(cfg).unwrap();
        assert!(fs.write("data/out.txt", "ok").is_ok());
        assert!(fs.write("top.txt", "no").is_err());
        // reads unaffected
        assert_eq!(fs.read("notes.txt").unwrap(), "hello");
    }

    #[test]
    fn exists_answers_false_for_blocked_paths() {
        let (_dir, cfg) = jail();
        let fs = FsCapability::new(cfg).unwrap();
        assert!(fs.exists("notes.txt"));
        assert!(!fs.exists("missing.txt"));
        // present on disk, but blocked: must be false, not an error
        assert!(!fs.exists("data/.env"));
        assert!(!fs.exists("../../etc/passwd"));
    }

    #[test]
    fn list_omits_blocked_entries() {
        let (_dir, cfg) = jail();
        let fs = FsCapability::new(cfg).unwrap();
        let entries = fs.list("data").unwrap();
        assert_eq!(entries, vec!["report.json".to_string()]);
    }

    #[test]
    fn delete_rules() {
        let (dir, _) = jail();
        let mut cfg = FsConfig::writable(dir.path());
        cfg.allow_delete = true;
        let fs = FsCapability::new(cfg).unwrap();
        assert!(fs.delete("data").is_err()); // not a regular file
        assert!(fs.delete("notes.txt").is_ok());
        assert!(!fs.exists("notes.txt"));

        let fs = FsCapability::new(FsConfig::writable(dir.path())).unwrap();
        assert!(fs.delete("data/report.json").is_err()); // flag off
    }

    #[test]
    fn mkdir_requires_write_and_create() {
        let (dir, cfg) = jail();
        let fs = FsCapability::new(cfg).unwrap();
        assert!(fs.mkdir("sub").is_err());
        let fs = FsCapability::new(FsConfig::writable(dir.path())).unwrap();
        assert!(fs.mkdir("sub/deeper").is_ok());
        assert!(fs.exists("sub/deeper"));
    }

    #[test]
    fn allow_patterns_gate_reads() {
        let (dir, _) = jail();
        let mut cfg = FsConfig::read_only(dir.path());
        cfg.allow_patterns = vec!["data/**".to_string()];
        let fs = FsCapability::new(cfg).unwrap();
        assert!(fs.read("data/report.json").is_ok());
        assert!(fs.read("notes.txt").is_err());
    }

    #[test]
    fn stat_reports_shape() {
        let (_dir, cfg) = jail();
        let fs = FsCapability::new(cfg).unwrap();
        let st = fs.stat("notes.txt").unwrap();
        assert!(st.is_file);
        assert_eq!(st.size, 5);
        let st = fs.stat("data").unwrap();
        assert!(st.is_dir);
    }

    #[test]
    fn read_write_round_trip_is_byte_identical() {
        let (dir, _) = jail();
        let fs = FsCapability::new(FsConfig::writable(dir.path())).unwrap();
        let original = fs.read("notes.txt").unwrap();
        fs.write("notes.txt", &original).unwrap();
        assert_eq!(fs.read("notes.txt").unwrap(), original);
    }

    #[test]
    fn normalize_is_idempotent() {
        let p = Path::new("/a/b/./c/../d");
        let once = normalize_lexical(p);
        let twice = normalize_lexical(&once);
        assert_eq!(once, twice);
        assert_eq!(once, PathBuf::from("/a/b/d"));
    }
}
