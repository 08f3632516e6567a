//! Host-injected language model client contract.
//!
//! The host supplies a `predict` implementation (and optionally `embed`);
//! the LLM capability wraps it with budget and prompt enforcement. The
//! contract is deliberately small so any provider client can adapt to it.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictOptions {
    /// Optional system prompt sent alongside the user prompt.
    #[serde(default)]
    pub system: Option<String>,
    /// Requested maximum reply length in tokens.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictResponse {
    pub text: String,
    /// Total tokens the provider reports for the call, when available.
    #[serde(default)]
    pub tokens_used: Option<u64>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn predict(&self, prompt: &str, options: &PredictOptions) -> Result<PredictResponse>;

    /// Optional embedding endpoint. Default implementation reports the
    /// operation as unsupported.
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        anyhow::bail!("embed not supported by this client")
    }
}
