//! The executor: one guarded call from request to result.
//!
//! Orchestrates the rate-limit contract, the trust-policy contract, and
//! capability assembly so they meet exactly once per call. The caller
//! always receives an `ExecutionResult`, never an error; every admitted
//! request has its `record_end` run on every exit path via a drop guard.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use skillgate_core::context::ExecutionContext;
use skillgate_core::error::{RateLimitReason, SkillError};
use skillgate_core::interp::{Program, SkillCompiler};
use skillgate_core::manifest::{self, SkillManifest};
use skillgate_core::observability;
use skillgate_core::result::ExecutionResult;
use skillgate_core::trust::{ExecBudget, Provenance, TrustLevel};

use skillgate_sandbox::interp::Interpreter;
use skillgate_sandbox::table::CapabilityTable;

use crate::policy;
use crate::rate_limit::{RateDecision, RateLimiter};

pub type BeforeExecuteHook = Arc<dyn Fn(&str, &ExecutionContext) + Send + Sync>;
pub type AfterExecuteHook = Arc<dyn Fn(&str, &ExecutionResult) + Send + Sync>;
pub type TrustDeniedHook = Arc<dyn Fn(&str, TrustLevel, Provenance) + Send + Sync>;
pub type RateLimitedHook = Arc<dyn Fn(&str, RateLimitReason) + Send + Sync>;
/// Operator-configured per-skill adjustment, applied after assembly so
/// operator policy wins over defaults.
pub type CapabilityOverride = Arc<dyn Fn(&mut CapabilityTable) + Send + Sync>;

#[derive(Default, Clone)]
pub struct ExecutorConfig {
    /// Fallback fuel when set; otherwise the trust level's default.
    pub default_fuel: Option<u64>,
    /// Fallback timeout when set; otherwise the trust level's default.
    pub default_timeout: Option<Duration>,
    pub enable_trace: bool,
    /// Operator-declared trust overrides by skill name; these win over the
    /// skill's own declaration.
    pub trust_overrides: HashMap<String, TrustLevel>,
}

#[derive(Debug)]
struct LoadedSkill {
    manifest: SkillManifest,
    program: Program,
    trust: TrustLevel,
    #[allow(dead_code)]
    source_hash: String,
}

#[derive(Default, Clone)]
struct ExecutorHooks {
    before_execute: Option<BeforeExecuteHook>,
    after_execute: Option<AfterExecuteHook>,
    trust_denied: Option<TrustDeniedHook>,
    rate_limited: Option<RateLimitedHook>,
}

/// Runs `record_end` exactly once, on every exit path of an admitted
/// request, including unwinds.
struct EndGuard {
    limiter: Arc<RateLimiter>,
    id: String,
}

impl Drop for EndGuard {
    fn drop(&mut self) {
        self.limiter.record_end(&self.id);
    }
}

pub struct Executor {
    compiler: Arc<dyn SkillCompiler>,
    interpreter: Arc<dyn Interpreter>,
    rate_limiter: Option<Arc<RateLimiter>>,
    config: ExecutorConfig,
    cache: Mutex<HashMap<PathBuf, Arc<LoadedSkill>>>,
    capability_overrides: Mutex<HashMap<String, CapabilityOverride>>,
    hooks: ExecutorHooks,
}

impl Executor {
    pub fn new(compiler: Arc<dyn SkillCompiler>, interpreter: Arc<dyn Interpreter>) -> Self {
        Self {
            compiler,
            interpreter,
            rate_limiter: None,
            config: ExecutorConfig::default(),
            cache: Mutex::new(HashMap::new()),
            capability_overrides: Mutex::new(HashMap::new()),
            hooks: ExecutorHooks::default(),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_before_execute_hook(mut self, hook: BeforeExecuteHook) -> Self {
        self.hooks.before_execute = Some(hook);
        self
    }

    pub fn with_after_execute_hook(mut self, hook: AfterExecuteHook) -> Self {
        self.hooks.after_execute = Some(hook);
        self
    }

    pub fn with_trust_denied_hook(mut self, hook: TrustDeniedHook) -> Self {
        self.hooks.trust_denied = Some(hook);
        self
    }

    pub fn with_rate_limited_hook(mut self, hook: RateLimitedHook) -> Self {
        self.hooks.rate_limited = Some(hook);
        self
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    /// Register an operator adjustment applied to the assembled table for
    /// one skill.
    pub fn set_capability_override(&self, skill: &str, adjust: CapabilityOverride) {
        self.capability_overrides
            .lock()
            .expect("override lock")
            .insert(skill.to_string(), adjust);
    }

    /// Drop one cached skill, forcing a reload on next use.
    pub fn invalidate(&self, path: &Path) {
        self.cache.lock().expect("cache lock").remove(path);
    }

    pub fn reset_cache(&self) {
        self.cache.lock().expect("cache lock").clear();
    }

    fn load(&self, path: &Path) -> Result<Arc<LoadedSkill>, SkillError> {
        if let Some(skill) = self.cache.lock().expect("cache lock").get(path) {
            return Ok(skill.clone());
        }

        tracing::debug!(path = %path.display(), "skill cache miss, loading");
        let loaded = manifest::load_skill(path).map_err(|e| SkillError::SkillValidationFailed {
            message: e.to_string(),
        })?;
        let program = self.compiler.compile(&loaded.source)?;

        // declared level wins; otherwise infer from declared tags plus the
        // compiler-emitted use set, with a textual sweep as the last resort
        let trust = loaded.manifest.trust_level.unwrap_or_else(|| {
            let mut tags = loaded.manifest.capabilities.clone();
            tags.extend(program.capability_uses.iter().cloned());
            if tags.is_empty() {
                tags = manifest::scan_capability_tokens(&loaded.source);
            }
            TrustLevel::infer(tags.iter().map(String::as_str))
        });

        let skill = Arc::new(LoadedSkill {
            manifest: loaded.manifest,
            program,
            trust,
            source_hash: loaded.source_hash,
        });
        self.cache
            .lock()
            .expect("cache lock")
            .insert(path.to_path_buf(), skill.clone());
        Ok(skill)
    }

    /// Run one skill. Always resolves to an `ExecutionResult`.
    pub async fn execute(
        &self,
        skill_path: &Path,
        args: Value,
        ctx: &ExecutionContext,
    ) -> ExecutionResult {
        let started = Instant::now();

        let skill = match self.load(skill_path) {
            Ok(skill) => skill,
            Err(error) => return ExecutionResult::failure(error, started.elapsed()),
        };
        let name = skill.manifest.name.clone();

        if let (Some(limiter), Some(requester)) = (&self.rate_limiter, &ctx.requester_id) {
            if let RateDecision::Denied {
                reason,
                retry_after,
            } = limiter.check(requester)
            {
                observability::rate_limited(
                    requester,
                    reason.as_str(),
                    retry_after.map(|d| d.as_millis() as u64),
                );
                if let Some(hook) = &self.hooks.rate_limited {
                    hook(&name, reason);
                }
                let mut result = ExecutionResult::rate_limited(reason, retry_after);
                result.duration = started.elapsed();
                return result;
            }
        }

        // bracket the admitted request; the guard runs record_end on every
        // exit path from here on
        let _guard = match (&self.rate_limiter, &ctx.requester_id) {
            (Some(limiter), Some(requester)) => {
                limiter.record_start(requester);
                Some(EndGuard {
                    limiter: limiter.clone(),
                    id: requester.clone(),
                })
            }
            _ => None,
        };

        self.execute_admitted(&skill, &name, args, ctx, started).await
    }

    async fn execute_admitted(
        &self,
        skill: &LoadedSkill,
        name: &str,
        args: Value,
        ctx: &ExecutionContext,
        started: Instant,
    ) -> ExecutionResult {
        if skill.program.is_empty() {
            return ExecutionResult::failure(
                SkillError::SkillValidationFailed {
                    message: "compiled program is empty".to_string(),
                },
                started.elapsed(),
            );
        }

        let level = self
            .config
            .trust_overrides
            .get(name)
            .copied()
            .unwrap_or(skill.trust);

        if let Err(error) = policy::check_ceiling(name, level, ctx.provenance) {
            if let Some(hook) = &self.hooks.trust_denied {
                hook(name, level, ctx.provenance);
            }
            return ExecutionResult::failure(error, started.elapsed());
        }

        let mut table = match policy::assemble_capabilities(level, ctx) {
            Ok(table) => table,
            Err(e) => {
                return ExecutionResult::failure(
                    SkillError::HostError(e.to_string()),
                    started.elapsed(),
                )
            }
        };
        if let Some(adjust) = self
            .capability_overrides
            .lock()
            .expect("override lock")
            .get(name)
        {
            adjust(&mut table);
        }

        let budget = ExecBudget {
            fuel: self.config.default_fuel.unwrap_or_else(|| level.default_fuel()),
            timeout: self
                .config
                .default_timeout
                .unwrap_or_else(|| level.default_timeout()),
        };

        if let Some(hook) = &self.hooks.before_execute {
            hook(name, ctx);
        }
        observability::execution_started(name, ctx.requester_id.as_deref(), ctx.provenance.as_str());

        let context_map = ctx.context_map();
        let outcome = tokio::time::timeout(
            budget.timeout,
            self.interpreter
                .execute(&skill.program, args, &table, budget, &context_map),
        )
        .await;

        let result = match outcome {
            Err(_) => ExecutionResult::failure(SkillError::Timeout, started.elapsed()),
            Ok(outcome) => {
                let duration = started.elapsed();
                let mut result = match outcome.error {
                    Some(error) => ExecutionResult::failure(error, duration),
                    None => ExecutionResult::success(outcome.value, outcome.fuel_used, duration),
                };
                result.fuel_used = outcome.fuel_used;
                result.warnings = outcome.warnings;
                if self.config.enable_trace {
                    result.trace = outcome.trace;
                }
                result
            }
        };

        observability::execution_completed(
            name,
            result.success,
            result.fuel_used,
            result.duration.as_millis() as u64,
        );
        if let Some(hook) = &self.hooks.after_execute {
            hook(name, &result);
        }
        result
    }
}
