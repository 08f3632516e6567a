//! LLM capability: token budgets, request caps, prompt screening.
//!
//! Wraps a host-injected client with session accounting. Budgets are
//! debited only on successful completion; a failed provider call rolls the
//! request count back so failures never consume quota. The blocked-prompt
//! patterns are a speed bump, not a guarantee; the real defense is that the
//! model sits behind the same capability boundary as every other effect.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;

use skillgate_core::error::{CapabilityDomain, SkillError};
use skillgate_core::llm_client::{LlmClient, PredictOptions, PredictResponse};
use skillgate_core::observability;

use crate::BlockedHook;

pub const DEFAULT_MAX_TOKENS_PER_REQUEST: u32 = 4096;
pub const DEFAULT_SESSION_TOKEN_BUDGET: u64 = 100_000;
pub const DEFAULT_SESSION_REQUEST_CAP: u32 = 100;

/// Common injection templates screened out of prompts.
const DEFAULT_BLOCKED_PROMPTS: &[&str] = &[
    r"(?i)ignore\s+(all\s+)?previous\s+instructions",
    r"(?i)disregard\s+(all\s+)?(prior|previous)\s+instructions",
    r"(?i)pretend\s+(that\s+)?you\s+are",
    r"(?i)reveal\s+(your\s+)?system\s+prompt",
    r"(?i)you\s+are\s+now\s+",
    r"(?i)act\s+as\s+if\s+you\s+have\s+no\s+restrictions",
];

lazy_static! {
    static ref BLOCKED_PROMPT_REGEXES: Vec<Regex> = DEFAULT_BLOCKED_PROMPTS
        .iter()
        .map(|p| Regex::new(p).expect("blocked prompt pattern is valid"))
        .collect();
}

/// ≈4 characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 + 3) / 4
}

pub type PromptFilter = Arc<dyn Fn(String) -> String + Send + Sync>;
pub type RequestHook = Arc<dyn Fn(&str) + Send + Sync>;
/// `(prompt, response, tokens_recorded)`.
pub type ResponseHook = Arc<dyn Fn(&str, &str, u64) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub max_tokens_per_request: u32,
    pub session_token_budget: u64,
    pub session_request_cap: u32,
    /// Extra blocked-prompt regexes layered over the built-in set.
    pub blocked_prompt_patterns: Vec<String>,
    /// When declared, the system prompt must match all of these.
    pub required_system_patterns: Vec<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_request: DEFAULT_MAX_TOKENS_PER_REQUEST,
            session_token_budget: DEFAULT_SESSION_TOKEN_BUDGET,
            session_request_cap: DEFAULT_SESSION_REQUEST_CAP,
            blocked_prompt_patterns: Vec::new(),
            required_system_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct LlmUsage {
    tokens_used: u64,
    requests_made: u32,
}

pub struct LlmCapability {
    client: Arc<dyn LlmClient>,
    config: LlmConfig,
    extra_blocked: Vec<Regex>,
    required_system: Vec<Regex>,
    usage: Mutex<LlmUsage>,
    prompt_filter: Option<PromptFilter>,
    response_filter: Option<PromptFilter>,
    on_request: Option<RequestHook>,
    on_response: Option<ResponseHook>,
    on_blocked: Option<BlockedHook>,
}

impl LlmCapability {
    pub fn new(client: Arc<dyn LlmClient>, config: LlmConfig) -> Result<Self> {
        let extra_blocked = config
            .blocked_prompt_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("invalid prompt pattern: {p}")))
            .collect::<Result<Vec<_>>>()?;
        let required_system = config
            .required_system_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("invalid system pattern: {p}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            client,
            config,
            extra_blocked,
            required_system,
            usage: Mutex::new(LlmUsage::default()),
            prompt_filter: None,
            response_filter: None,
            on_request: None,
            on_response: None,
            on_blocked: None,
        })
    }

    pub fn with_prompt_filter(mut self, filter: PromptFilter) -> Self {
        self.prompt_filter = Some(filter);
        self
    }

    pub fn with_response_filter(mut self, filter: PromptFilter) -> Self {
        self.response_filter = Some(filter);
        self
    }

    pub fn with_request_hook(mut self, hook: RequestHook) -> Self {
        self.on_request = Some(hook);
        self
    }

    pub fn with_response_hook(mut self, hook: ResponseHook) -> Self {
        self.on_response = Some(hook);
        self
    }

    pub fn with_blocked_hook(mut self, hook: BlockedHook) -> Self {
        self.on_blocked = Some(hook);
        self
    }

    fn deny(&self, op: &str, reason: &str) -> SkillError {
        observability::security_blocked("llm", op, "-", reason);
        if let Some(hook) = &self.on_blocked {
            hook(op, "-", reason);
        }
        SkillError::refused(CapabilityDomain::Llm)
    }

    fn prompt_is_blocked(&self, text: &str) -> bool {
        BLOCKED_PROMPT_REGEXES
            .iter()
            .chain(self.extra_blocked.iter())
            .any(|re| re.is_match(text))
    }

    pub fn remaining_tokens(&self) -> u64 {
        let usage = self.usage.lock().expect("llm usage lock");
        self.config.session_token_budget.saturating_sub(usage.tokens_used)
    }

    pub fn remaining_requests(&self) -> u32 {
        let usage = self.usage.lock().expect("llm usage lock");
        self.config.session_request_cap.saturating_sub(usage.requests_made)
    }

    /// Admit one request costing `estimate` tokens, pre-incrementing the
    /// request count. Callers roll back with `rollback_request` on failure.
    fn admit(&self, op: &str, estimate: u64) -> Result<(), SkillError> {
        let mut usage = self.usage.lock().expect("llm usage lock");
        if usage.tokens_used + estimate > self.config.session_token_budget {
            drop(usage);
            return Err(self.deny(op, "Token budget exceeded"));
        }
        if usage.requests_made >= self.config.session_request_cap {
            drop(usage);
            return Err(self.deny(op, "Session request cap reached"));
        }
        usage.requests_made += 1;
        Ok(())
    }

    fn rollback_request(&self) {
        let mut usage = self.usage.lock().expect("llm usage lock");
        usage.requests_made = usage.requests_made.saturating_sub(1);
    }

    fn record_tokens(&self, tokens: u64) {
        let mut usage = self.usage.lock().expect("llm usage lock");
        usage.tokens_used += tokens;
    }

    pub async fn predict(
        &self,
        prompt: &str,
        options: &PredictOptions,
    ) -> Result<PredictResponse, SkillError> {
        let prompt = match &self.prompt_filter {
            Some(filter) => filter(prompt.to_string()),
            None => prompt.to_string(),
        };

        if self.prompt_is_blocked(&prompt) {
            return Err(self.deny("predict", "Blocked prompt pattern"));
        }
        if let Some(system) = &options.system {
            if self.prompt_is_blocked(system) {
                return Err(self.deny("predict", "Blocked prompt pattern"));
            }
        }
        if !self.required_system.is_empty() {
            let Some(system) = &options.system else {
                return Err(self.deny("predict", "System prompt requirements not met"));
            };
            if !self.required_system.iter().all(|re| re.is_match(system)) {
                return Err(self.deny("predict", "System prompt requirements not met"));
            }
        }

        let reply_cap = options
            .max_tokens
            .unwrap_or(self.config.max_tokens_per_request);
        if reply_cap > self.config.max_tokens_per_request {
            return Err(self.deny("predict", "Reply cap exceeds per-request limit"));
        }
        let estimate = estimate_tokens(&prompt) + u64::from(reply_cap);
        self.admit("predict", estimate)?;

        if let Some(hook) = &self.on_request {
            hook(&prompt);
        }
        observability::capability_access("llm", "predict", "-");

        let response = match self.client.predict(&prompt, options).await {
            Ok(response) => response,
            Err(_) => {
                self.rollback_request();
                return Err(self.deny("predict", "Provider error"));
            }
        };

        let text = match &self.response_filter {
            Some(filter) => filter(response.text),
            None => response.text,
        };
        let tokens = response
            .tokens_used
            .unwrap_or_else(|| estimate_tokens(&prompt) + estimate_tokens(&text));
        self.record_tokens(tokens);

        if let Some(hook) = &self.on_response {
            hook(&prompt, &text, tokens);
        }
        Ok(PredictResponse {
            text,
            tokens_used: Some(tokens),
        })
    }

    /// One token-unit per input, same budget logic as `predict`.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, SkillError> {
        self.admit("embed", 1)?;
        match self.client.embed(text).await {
            Ok(embedding) => {
                self.record_tokens(1);
                Ok(embedding)
            }
            Err(_) => {
                self.rollback_request();
                Err(self.deny("embed", "Provider error"))
            }
        }
    }
}
