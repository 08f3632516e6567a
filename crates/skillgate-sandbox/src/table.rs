//! Opcode-keyed capability table.
//!
//! The interpreter dispatches every effect a program attempts through this
//! table: a fixed set of opcode names mapped onto a tagged set of capability
//! kinds. A skill can reach nothing that was not bound here, by any means.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use skillgate_core::error::{CapabilityDomain, SkillError};
use skillgate_core::llm_client::PredictOptions;

use crate::fetch::FetchCapability;
use crate::fs::FsCapability;
use crate::llm::LlmCapability;
use crate::shell::ShellCapability;

const FS_OPS: &[&str] = &["read", "write", "exists", "list", "stat", "delete", "mkdir"];
const SHELL_OPS: &[&str] = &["run", "exec"];
const FETCH_OPS: &[&str] = &["fetch"];
const LLM_OPS: &[&str] = &["predict", "embed"];

/// Which domain an opcode belongs to, bound or not.
pub fn domain_of(op: &str) -> Option<CapabilityDomain> {
    if FS_OPS.contains(&op) {
        Some(CapabilityDomain::Fs)
    } else if SHELL_OPS.contains(&op) {
        Some(CapabilityDomain::Shell)
    } else if FETCH_OPS.contains(&op) {
        Some(CapabilityDomain::Fetch)
    } else if LLM_OPS.contains(&op) {
        Some(CapabilityDomain::Llm)
    } else {
        None
    }
}

#[derive(Default, Clone)]
pub struct CapabilityTable {
    fs: Option<Arc<FsCapability>>,
    shell: Option<Arc<ShellCapability>>,
    fetch: Option<Arc<FetchCapability>>,
    llm: Option<Arc<LlmCapability>>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fs(mut self, fs: Arc<FsCapability>) -> Self {
        self.fs = Some(fs);
        self
    }

    pub fn with_shell(mut self, shell: Arc<ShellCapability>) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn with_fetch(mut self, fetch: Arc<FetchCapability>) -> Self {
        self.fetch = Some(fetch);
        self
    }

    pub fn with_llm(mut self, llm: Arc<LlmCapability>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn remove_fs(&mut self) {
        self.fs = None;
    }

    pub fn remove_shell(&mut self) {
        self.shell = None;
    }

    pub fn remove_fetch(&mut self) {
        self.fetch = None;
    }

    pub fn remove_llm(&mut self) {
        self.llm = None;
    }

    pub fn fs(&self) -> Option<&Arc<FsCapability>> {
        self.fs.as_ref()
    }

    pub fn shell(&self) -> Option<&Arc<ShellCapability>> {
        self.shell.as_ref()
    }

    pub fn fetch(&self) -> Option<&Arc<FetchCapability>> {
        self.fetch.as_ref()
    }

    pub fn llm(&self) -> Option<&Arc<LlmCapability>> {
        self.llm.as_ref()
    }

    /// Opcodes reachable through this table.
    pub fn ops(&self) -> Vec<&'static str> {
        let mut ops = Vec::new();
        if self.fs.is_some() {
            ops.extend_from_slice(FS_OPS);
        }
        if self.shell.is_some() {
            ops.extend_from_slice(SHELL_OPS);
        }
        if self.fetch.is_some() {
            ops.extend_from_slice(FETCH_OPS);
        }
        if self.llm.is_some() {
            ops.extend_from_slice(LLM_OPS);
        }
        ops
    }

    fn str_field<'a>(
        payload: &'a Value,
        field: &str,
        domain: CapabilityDomain,
    ) -> Result<&'a str, SkillError> {
        payload
            .get(field)
            .and_then(Value::as_str)
            .ok_or(SkillError::CapabilityRefused { domain })
    }

    /// Dispatch one opcode with a JSON payload.
    pub async fn invoke(&self, op: &str, payload: Value) -> Result<Value, SkillError> {
        let Some(domain) = domain_of(op) else {
            return Err(SkillError::HostError(format!("unknown operation: {op}")));
        };
        match domain {
            CapabilityDomain::Fs => {
                let Some(fs) = &self.fs else {
                    return Err(SkillError::refused(domain));
                };
                let path = Self::str_field(&payload, "path", domain)?;
                match op {
                    "read" => Ok(json!({ "content": fs.read(path)? })),
                    "write" => {
                        let content = Self::str_field(&payload, "content", domain)?;
                        Ok(json!({ "bytes_written": fs.write(path, content)? }))
                    }
                    "exists" => Ok(json!(fs.exists(path))),
                    "list" => Ok(json!(fs.list(path)?)),
                    "stat" => Ok(serde_json::to_value(fs.stat(path)?)
                        .map_err(|e| SkillError::HostError(e.to_string()))?),
                    "delete" => {
                        fs.delete(path)?;
                        Ok(json!(true))
                    }
                    "mkdir" => {
                        fs.mkdir(path)?;
                        Ok(json!(true))
                    }
                    _ => unreachable!("fs opcode set is closed"),
                }
            }
            CapabilityDomain::Shell => {
                let Some(shell) = &self.shell else {
                    return Err(SkillError::refused(domain));
                };
                let result = match op {
                    "run" => {
                        let command = Self::str_field(&payload, "command", domain)?;
                        shell.run(command).await?
                    }
                    "exec" => {
                        let binary = Self::str_field(&payload, "binary", domain)?;
                        let args: Vec<String> = payload
                            .get("args")
                            .and_then(Value::as_array)
                            .map(|a| {
                                a.iter()
                                    .filter_map(Value::as_str)
                                    .map(str::to_string)
                                    .collect()
                            })
                            .unwrap_or_default();
                        shell.exec(binary, &args).await?
                    }
                    _ => unreachable!("shell opcode set is closed"),
                };
                serde_json::to_value(result).map_err(|e| SkillError::HostError(e.to_string()))
            }
            CapabilityDomain::Fetch => {
                let Some(fetch) = &self.fetch else {
                    return Err(SkillError::refused(domain));
                };
                let url = Self::str_field(&payload, "url", domain)?;
                let method = payload
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or("GET");
                let headers: BTreeMap<String, String> = payload
                    .get("headers")
                    .and_then(Value::as_object)
                    .map(|m| {
                        m.iter()
                            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();
                let body = payload
                    .get("body")
                    .and_then(Value::as_str)
                    .map(str::to_string);

                let response = fetch.request(method, url, &headers, body).await?;
                let status = response.status;
                let header_map = response.headers.clone();
                let text = response.text().await?;
                Ok(json!({ "status": status, "headers": header_map, "body": text }))
            }
            CapabilityDomain::Llm => {
                let Some(llm) = &self.llm else {
                    return Err(SkillError::refused(domain));
                };
                match op {
                    "predict" => {
                        let prompt = Self::str_field(&payload, "prompt", domain)?;
                        let options = PredictOptions {
                            system: payload
                                .get("system")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            max_tokens: payload
                                .get("max_tokens")
                                .and_then(Value::as_u64)
                                .map(|v| v as u32),
                            temperature: payload
                                .get("temperature")
                                .and_then(Value::as_f64)
                                .map(|v| v as f32),
                        };
                        let response = llm.predict(prompt, &options).await?;
                        Ok(json!({
                            "text": response.text,
                            "tokens_used": response.tokens_used,
                        }))
                    }
                    "embed" => {
                        let text = Self::str_field(&payload, "text", domain)?;
                        Ok(json!({ "embedding": llm.embed(text).await? }))
                    }
                    _ => unreachable!("llm opcode set is closed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FsConfig;

    #[tokio::test]
    async fn unknown_opcodes_are_host_errors() {
        let table = CapabilityTable::new();
        let err = table.invoke("teleport", json!({})).await.unwrap_err();
        assert!(matches!(err, SkillError::HostError(_)));
    }

    #[tokio::test]
    async fn unbound_domains_are_refused_opaquely() {
        let table = CapabilityTable::new();
        let err = table.invoke("read", json!({"path": "x"})).await.unwrap_err();
        assert_eq!(err, SkillError::refused(CapabilityDomain::Fs));
        let err = table.invoke("run", json!({"command": "ls"})).await.unwrap_err();
        assert_eq!(err, SkillError::refused(CapabilityDomain::Shell));
        let err = table.invoke("fetch", json!({"url": "https://x"})).await.unwrap_err();
        assert_eq!(err, SkillError::refused(CapabilityDomain::Fetch));
        let err = table.invoke("predict", json!({"prompt": "p"})).await.unwrap_err();
        assert_eq!(err, SkillError::refused(CapabilityDomain::Llm));
    }

    #[tokio::test]
    async fn fs_dispatch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hi").unwrap();
        let fs = Arc::new(FsCapability::new(FsConfig::read_only(dir.path())).unwrap());
        let table = CapabilityTable::new().with_fs(fs);

        let out = table
            .invoke("read", json!({"path": "hello.txt"}))
            .await
            .unwrap();
        assert_eq!(out["content"], "hi");
        let out = table
            .invoke("exists", json!({"path": "hello.txt"}))
            .await
            .unwrap();
        assert_eq!(out, json!(true));
    }

    #[tokio::test]
    async fn missing_payload_fields_are_refused_in_domain() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Arc::new(FsCapability::new(FsConfig::read_only(dir.path())).unwrap());
        let table = CapabilityTable::new().with_fs(fs);
        let err = table.invoke("read", json!({})).await.unwrap_err();
        assert_eq!(err, SkillError::refused(CapabilityDomain::Fs));
    }

    #[test]
    fn ops_reflect_bound_capabilities() {
        let table = CapabilityTable::new();
        assert!(table.ops().is_empty());
        assert_eq!(domain_of("read"), Some(CapabilityDomain::Fs));
        assert_eq!(domain_of("exec"), Some(CapabilityDomain::Shell));
        assert_eq!(domain_of("fetch"), Some(CapabilityDomain::Fetch));
        assert_eq!(domain_of("embed"), Some(CapabilityDomain::Llm));
        assert_eq!(domain_of("nope"), None);
    }
}
