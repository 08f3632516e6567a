//! Shell capability: allowlisted commands in a detached process group.
//!
//! `run` parses a command line with quote-aware lexing and refuses any token
//! carrying shell metacharacters; arguments go through a taxonomy of
//! dangerous-argument patterns, the blocked-file catalog, and jail
//! containment for path-shaped values. `exec` is the host-trusted entry: it
//! bypasses parsing and the argument taxonomy but never the allowlist, the
//! timeout, the output cap, or tree termination.
//!
//! Commands are spawned without a shell interpreter, in a new process group,
//! with a minimal environment (canonical PATH, HOME pinned to the jail so
//! tilde expansion is neutralized). Output is streamed into capped buffers;
//! crossing the cap kills the tree mid-stream. Timeouts go SIGTERM, one
//! second of grace, then SIGKILL to the group.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use skillgate_core::context::CommandSpec;
use skillgate_core::error::{CapabilityDomain, SkillError};
use skillgate_core::observability;

use crate::fs::normalize_lexical;
use crate::process::{self, ChildGuard};
use crate::security;
use crate::BlockedHook;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_OUTPUT_BYTES: u64 = 1024 * 1024;
const KILL_GRACE: Duration = Duration::from_secs(1);

const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>', '\\', '\n', '\r',
];

const SYSTEM_PATH: &str = "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin";

lazy_static! {
    static ref DANGEROUS_ARGS: Vec<(Regex, &'static str)> = vec![
        (Regex::new(r"\.\.([/\\]|$)").unwrap(), "Path traversal"),
        (
            Regex::new(r"^/(etc|proc|sys|dev|boot|root|var/log)(/|$)").unwrap(),
            "Absolute system path",
        ),
        (Regex::new(r"~").unwrap(), "Home directory reference"),
        (Regex::new("\x00").unwrap(), "Null byte"),
        (Regex::new(r"(?i)%2e%2e").unwrap(), "URL-encoded traversal"),
        (Regex::new(r"(?i)%252e").unwrap(), "Double URL-encoded traversal"),
    ];
}

/// Hook fired before a spawn: `(binary, args)`.
pub type BeforeExecHook = Arc<dyn Fn(&str, &[String]) + Send + Sync>;
/// Hook fired after a clean exit: `(binary, exit_code)`.
pub type AfterExecHook = Arc<dyn Fn(&str, i32) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Jail workdir; also injected as `HOME`.
    pub workdir: PathBuf,
    pub commands: Vec<CommandSpec>,
    /// Extra blocked-path regexes layered over the argument taxonomy.
    pub block_patterns: Vec<String>,
    pub timeout: Duration,
    pub max_output_bytes: u64,
}

impl ShellConfig {
    pub fn new(workdir: impl Into<PathBuf>, commands: Vec<CommandSpec>) -> Self {
        Self {
            workdir: workdir.into(),
            commands,
            block_patterns: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShellResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

struct CompiledCommand {
    spec: CommandSpec,
    arg_patterns: Vec<Regex>,
}

pub struct ShellCapability {
    workdir: PathBuf,
    commands: BTreeMap<String, CompiledCommand>,
    extra_block: Vec<Regex>,
    timeout: Duration,
    max_output_bytes: u64,
    on_before_exec: Option<BeforeExecHook>,
    on_after_exec: Option<AfterExecHook>,
    on_blocked: Option<BlockedHook>,
}

/// Whitespace-separated lexer honoring single and double quotes.
fn lex(line: &str) -> Result<Vec<String>, &'static str> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut has_token = false;

    for c in line.chars() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                has_token = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                has_token = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if in_single || in_double {
        return Err("Unterminated quote");
    }
    if has_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn has_metacharacter(token: &str) -> bool {
    token.chars().any(|c| SHELL_METACHARACTERS.contains(&c))
}

impl ShellCapability {
    pub fn new(config: ShellConfig) -> Result<Self> {
        let workdir = config
            .workdir
            .canonicalize()
            .with_context(|| format!("invalid shell workdir: {}", config.workdir.display()))?;

        let mut commands = BTreeMap::new();
        for spec in config.commands {
            let arg_patterns = spec
                .arg_patterns
                .iter()
                .map(|p| {
                    Regex::new(p).with_context(|| format!("invalid argument pattern: {p}"))
                })
                .collect::<Result<Vec<_>>>()?;
            commands.insert(spec.name.clone(), CompiledCommand { spec, arg_patterns });
        }
        let extra_block = config
            .block_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("invalid block pattern: {p}")))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            workdir,
            commands,
            extra_block,
            timeout: config.timeout,
            max_output_bytes: config.max_output_bytes,
            on_before_exec: None,
            on_after_exec: None,
            on_blocked: None,
        })
    }

    pub fn with_before_exec_hook(mut self, hook: BeforeExecHook) -> Self {
        self.on_before_exec = Some(hook);
        self
    }

    pub fn with_after_exec_hook(mut self, hook: AfterExecHook) -> Self {
        self.on_after_exec = Some(hook);
        self
    }

    pub fn with_blocked_hook(mut self, hook: BlockedHook) -> Self {
        self.on_blocked = Some(hook);
        self
    }

    pub fn workdir(&self) -> &PathBuf {
        &self.workdir
    }

    fn deny(&self, op: &str, target: &str, reason: &str) -> SkillError {
        observability::security_blocked("shell", op, target, reason);
        if let Some(hook) = &self.on_blocked {
            hook(op, target, reason);
        }
        SkillError::refused(CapabilityDomain::Shell)
    }

    /// The argument taxonomy. Flags (leading `-`) skip path classification
    /// but not metacharacter or null-byte rejection.
    fn validate_arg(&self, arg: &str) -> Result<(), String> {
        if has_metacharacter(arg) {
            return Err("Shell metacharacter in argument".to_string());
        }
        if arg.contains('\0') {
            return Err("Null byte in argument".to_string());
        }
        if arg.starts_with('-') {
            return Ok(());
        }
        for (re, reason) in DANGEROUS_ARGS.iter() {
            if re.is_match(arg) {
                return Err((*reason).to_string());
            }
        }
        for re in &self.extra_block {
            if re.is_match(arg) {
                return Err("Blocked by configured pattern".to_string());
            }
        }
        // catalog applies to every non-flag argument, path-shaped or not,
        // so `credentials.json` is refused even when it is a bare name
        if let Some(hit) = security::blocked_file(arg) {
            return Err(hit.description.to_string());
        }
        if arg.contains('/') || arg.starts_with('.') {
            let joined = if std::path::Path::new(arg).is_absolute() {
                PathBuf::from(arg)
            } else {
                self.workdir.join(arg)
            };
            if normalize_lexical(&joined).strip_prefix(&self.workdir).is_err() {
                return Err("Path outside the jail".to_string());
            }
        }
        Ok(())
    }

    fn validate_strict_args(&self, cmd: &CompiledCommand, args: &[String]) -> Result<(), String> {
        if !cmd.spec.strict_args {
            return Ok(());
        }
        if cmd.arg_patterns.is_empty() {
            if args.is_empty() {
                return Ok(());
            }
            return Err("Unexpected argument".to_string());
        }
        for arg in args {
            if !cmd.arg_patterns.iter().any(|re| re.is_match(arg)) {
                return Err("Argument does not match declared patterns".to_string());
            }
        }
        Ok(())
    }

    /// Parse and run a command line.
    pub async fn run(&self, cmdline: &str) -> Result<ShellResult, SkillError> {
        let tokens = match lex(cmdline) {
            Ok(t) => t,
            Err(reason) => return Err(self.deny("run", cmdline, reason)),
        };
        if tokens.is_empty() {
            return Err(self.deny("run", cmdline, "Empty command"));
        }
        for token in &tokens {
            if has_metacharacter(token) {
                return Err(self.deny("run", cmdline, "Shell metacharacter"));
            }
        }

        let binary = &tokens[0];
        if binary.contains('/') {
            return Err(self.deny("run", cmdline, "Command path not allowed"));
        }
        let Some(cmd) = self.commands.get(binary.as_str()) else {
            return Err(self.deny("run", cmdline, "Command not in allowlist"));
        };

        let args: Vec<String> = tokens[1..].to_vec();
        for arg in &args {
            if let Err(reason) = self.validate_arg(arg) {
                return Err(self.deny("run", cmdline, &reason));
            }
        }
        if let Err(reason) = self.validate_strict_args(cmd, &args) {
            return Err(self.deny("run", cmdline, &reason));
        }

        self.execute(cmd, &args).await
    }

    /// Host-trusted entry: bypasses parsing and the argument taxonomy, not
    /// the allowlist or the runtime bounds.
    pub async fn exec(&self, binary: &str, args: &[String]) -> Result<ShellResult, SkillError> {
        let Some(cmd) = self.commands.get(binary) else {
            return Err(self.deny("exec", binary, "Command not in allowlist"));
        };
        self.execute(cmd, args).await
    }

    async fn execute(&self, cmd: &CompiledCommand, args: &[String]) -> Result<ShellResult, SkillError> {
        let name = cmd.spec.name.as_str();
        let timeout = cmd
            .spec
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.timeout);
        let cap = cmd.spec.max_output_bytes.unwrap_or(self.max_output_bytes);
        let workdir = cmd.spec.workdir.as_ref().unwrap_or(&self.workdir);

        // minimal environment; HOME pinned to the jail neutralizes tilde
        let mut env: BTreeMap<String, String> = BTreeMap::new();
        env.insert("PATH".to_string(), SYSTEM_PATH.to_string());
        env.insert("HOME".to_string(), self.workdir.to_string_lossy().to_string());
        for (k, v) in security::sanitize_env(&cmd.spec.env) {
            env.insert(k, v);
        }

        if let Some(hook) = &self.on_before_exec {
            hook(name, args);
        }
        observability::capability_access("shell", "exec", name);

        let mut command = Command::new(name);
        command
            .args(args)
            .current_dir(workdir)
            .env_clear()
            .envs(&env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        process::set_new_session(&mut command);

        let mut child = command
            .spawn()
            .map_err(|_| self.deny("exec", name, "Spawn failed"))?;
        let pid = child.id().unwrap_or(0);
        let mut guard = ChildGuard::new(child.id());

        let total = Arc::new(AtomicU64::new(0));
        let overflowed = Arc::new(AtomicBool::new(false));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut out_task = tokio::spawn(read_capped(
            stdout,
            total.clone(),
            cap,
            pid,
            overflowed.clone(),
        ));
        let mut err_task = tokio::spawn(read_capped(
            stderr,
            total.clone(),
            cap,
            pid,
            overflowed.clone(),
        ));

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => {
                process::kill_tree_now(pid);
                guard.disarm();
                return Err(self.deny("exec", name, "Wait failed"));
            }
            Err(_) => {
                process::terminate_tree(&mut child, pid, KILL_GRACE).await;
                guard.disarm();
                let _ = drain(&mut out_task, pid).await;
                let _ = drain(&mut err_task, pid).await;
                return Err(self.deny("exec", name, "Timeout"));
            }
        };
        guard.disarm();

        // a surviving grandchild can hold the pipes open past the parent's
        // exit; bound the drain and kill the tree if it stalls
        let stdout = drain(&mut out_task, pid).await;
        let stderr = drain(&mut err_task, pid).await;
        if overflowed.load(Ordering::SeqCst) {
            return Err(self.deny("exec", name, "Output cap exceeded"));
        }

        let exit_code = status.code().unwrap_or(-1);
        if let Some(hook) = &self.on_after_exec {
            hook(name, exit_code);
        }
        Ok(ShellResult {
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            exit_code,
        })
    }
}

const DRAIN_WINDOW: Duration = Duration::from_secs(2);

/// Collect a reader task's buffer, killing the tree if the pipe is still
/// held open past the drain window.
async fn drain(task: &mut tokio::task::JoinHandle<Vec<u8>>, pid: u32) -> Vec<u8> {
    match tokio::time::timeout(DRAIN_WINDOW, &mut *task).await {
        Ok(buf) => buf.unwrap_or_default(),
        Err(_) => {
            process::kill_tree_now(pid);
            task.await.unwrap_or_default()
        }
    }
}

/// Accumulate a stream into a buffer, sharing a combined byte budget with
/// the sibling stream. Crossing the budget kills the process tree.
async fn read_capped<R>(
    reader: Option<R>,
    total: Arc<AtomicU64>,
    cap: u64,
    pid: u32,
    overflowed: Arc<AtomicBool>,
) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                let seen = total.fetch_add(n as u64, Ordering::SeqCst) + n as u64;
                if seen > cap {
                    overflowed.store(true, Ordering::SeqCst);
                    process::kill_tree_now(pid);
                    break;
                }
            }
        }
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capability(commands: Vec<CommandSpec>) -> (tempfile::TempDir, ShellCapability) {
        let dir = tempfile::tempdir().unwrap();
        let shell = ShellCapability::new(ShellConfig::new(dir.path(), commands)).unwrap();
        (dir, shell)
    }

    #[test]
    fn lexer_honors_quotes() {
        assert_eq!(
            lex("echo 'hello world' plain").unwrap(),
            vec!["echo", "hello world", "plain"]
        );
        assert_eq!(lex("echo \"a b\"").unwrap(), vec!["echo", "a b"]);
        assert_eq!(lex("   ").unwrap(), Vec::<String>::new());
        assert_eq!(lex("echo ''").unwrap(), vec!["echo", ""]);
        assert!(lex("echo 'unterminated").is_err());
    }

    #[tokio::test]
    async fn metacharacters_are_refused() {
        let (_dir, shell) = capability(vec![CommandSpec::new("echo")]);
        for line in [
            "echo hi; rm -rf /",
            "echo $(whoami)",
            "echo `id`",
            "echo a | cat",
            "echo a > /tmp/x",
            "echo {a,b}",
            "echo a\\ b",
        ] {
            let err = shell.run(line).await.unwrap_err();
            assert_eq!(err.to_string(), "Command failed", "accepted: {line}");
        }
    }

    #[tokio::test]
    async fn unlisted_commands_are_refused() {
        let (_dir, shell) = capability(vec![CommandSpec::new("echo")]);
        assert!(shell.run("cat notes.txt").await.is_err());
        assert!(shell.run("/bin/echo hi").await.is_err());
        assert!(shell.exec("curl", &[]).await.is_err());
    }

    #[tokio::test]
    async fn dangerous_arguments_are_refused() {
        let (_dir, shell) = capability(vec![CommandSpec::new("cat")]);
        for line in [
            "cat ../../etc/passwd",
            "cat /etc/shadow",
            "cat ~/secrets",
            "cat %2e%2e/x",
            "cat credentials.json",
            "cat .env",
            "cat /somewhere/else.txt",
        ] {
            assert!(shell.run(line).await.is_err(), "accepted: {line}");
        }
    }

    #[tokio::test]
    async fn flags_skip_path_classification() {
        let (_dir, shell) = capability(vec![CommandSpec::new("echo")]);
        let res = shell.run("echo -n hi").await.unwrap();
        assert_eq!(res.exit_code, 0);
    }

    #[tokio::test]
    async fn strict_args_enforce_declared_patterns() {
        let mut ls = CommandSpec::new("echo");
        ls.arg_patterns = vec!["^[a-z]+$".to_string()];
        ls.strict_args = true;
        let (_dir, shell) = capability(vec![ls]);
        assert!(shell.run("echo hello").await.is_ok());
        assert!(shell.run("echo HELLO9").await.is_err());

        let mut bare = CommandSpec::new("date");
        bare.strict_args = true;
        let (_dir2, shell) = capability(vec![bare]);
        assert!(shell.run("date").await.is_ok());
        assert!(shell.run("date now").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_captures_output() {
        let (_dir, shell) = capability(vec![CommandSpec::new("echo")]);
        let res = shell.run("echo hello world").await.unwrap();
        assert_eq!(res.stdout.trim_end(), "hello world");
        assert_eq!(res.exit_code, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn quoted_arguments_stay_grouped() {
        let (_dir, shell) = capability(vec![CommandSpec::new("echo")]);
        let res = shell.run("echo 'hello world'").await.unwrap();
        assert_eq!(res.stdout.trim_end(), "hello world");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_delivered_not_an_error() {
        let (_dir, shell) = capability(vec![CommandSpec::new("sh")]);
        let res = shell
            .exec("sh", &["-c".to_string(), "exit 3".to_string()])
            .await
            .unwrap();
        assert_eq!(res.exit_code, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn home_is_pinned_to_the_jail() {
        let (_dir, shell) = capability(vec![CommandSpec::new("sh")]);
        let res = shell
            .exec("sh", &["-c".to_string(), "printf %s \"$HOME\"".to_string()])
            .await
            .unwrap();
        assert_eq!(res.stdout, shell.workdir().to_string_lossy());
    }

    #[cfg(target_os = "linux")]
    fn marker_running(marker: &str) -> bool {
        for entry in std::fs::read_dir("/proc").into_iter().flatten().flatten() {
            let name = entry.file_name();
            let s = name.to_string_lossy();
            if !s.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            if let Ok(cmd) = std::fs::read(entry.path().join("cmdline")) {
                if String::from_utf8_lossy(&cmd).contains(marker) {
                    return true;
                }
            }
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_the_whole_process_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = ShellConfig::new(dir.path(), vec![CommandSpec::new("sh")]);
        cfg.timeout = Duration::from_millis(500);
        let shell = ShellCapability::new(cfg).unwrap();

        let start = std::time::Instant::now();
        let err = shell
            .exec(
                "sh",
                &[
                    "-c".to_string(),
                    "sleep 97.31 & sleep 97.31 & wait".to_string(),
                ],
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Command failed");
        assert!(start.elapsed() < Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!marker_running("97.31"), "descendant sleeps survived the kill");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_cap_terminates_mid_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = ShellConfig::new(dir.path(), vec![CommandSpec::new("sh")]);
        cfg.max_output_bytes = 64 * 1024;
        cfg.timeout = Duration::from_secs(30);
        let shell = ShellCapability::new(cfg).unwrap();

        let start = std::time::Instant::now();
        let err = shell
            .exec("sh", &["-c".to_string(), "yes overflow-marker".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Command failed");
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn blocked_hook_carries_detailed_reason() {
        use std::sync::Mutex;
        let reasons: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = reasons.clone();
        let (_dir, shell) = capability(vec![CommandSpec::new("cat")]);
        let shell = shell.with_blocked_hook(Arc::new(move |_op, _t, reason| {
            sink.lock().unwrap().push(reason.to_string());
        }));

        let _ = shell.run("cat ../../etc/passwd").await;
        assert_eq!(reasons.lock().unwrap().as_slice(), ["Path traversal"]);
    }
}
