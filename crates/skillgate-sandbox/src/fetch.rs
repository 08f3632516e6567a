//! Fetch capability: outbound HTTP scoped to an allowed-host set.
//!
//! Every request runs the admission gauntlet: URL parse, scheme membership,
//! host classification (blocked hostnames, private/CGNAT/link-local ranges,
//! cloud metadata endpoints, then the allowed-pattern set), a sliding
//! per-minute rate window, and header sanitization. Redirects are never
//! followed by the client; a 3xx re-enters admission with the resolved
//! target so a redirect cannot bounce to a private address, bounded by an
//! explicit hop limit. Response size is enforced twice: a `Content-Length`
//! pre-flight, and an authoritative streaming accumulator that aborts the
//! body mid-read on overflow.

use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use url::Url;

use skillgate_core::error::{CapabilityDomain, SkillError};
use skillgate_core::observability;

use crate::security;
use crate::{AccessHook, BlockedHook};

pub const DEFAULT_MAX_RESPONSE_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 60;
pub const DEFAULT_MAX_REDIRECTS: u32 = 5;

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Header names a skill may never set.
const DEFAULT_BLOCKED_HEADERS: &[&str] = &[
    "host",
    "authorization",
    "cookie",
    "x-forwarded-for",
    "x-real-ip",
];

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Host patterns the capability may reach. `*.example.com` matches any
    /// sub-domain and the apex; `10.*` matches the prefix. Empty allows
    /// nothing.
    pub allowed_hosts: Vec<String>,
    /// Extra blocked patterns layered over the built-in address tables.
    pub blocked_hosts: Vec<String>,
    pub allowed_schemes: Vec<String>,
    pub max_response_bytes: u64,
    pub timeout: Duration,
    pub max_requests_per_minute: u32,
    pub max_redirects: u32,
    pub default_headers: Vec<(String, String)>,
    pub blocked_headers: Vec<String>,
}

impl FetchConfig {
    pub fn new(allowed_hosts: Vec<String>) -> Self {
        Self {
            allowed_hosts,
            blocked_hosts: Vec::new(),
            allowed_schemes: vec!["https".to_string()],
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            timeout: DEFAULT_TIMEOUT,
            max_requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            default_headers: Vec::new(),
            blocked_headers: DEFAULT_BLOCKED_HEADERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// `*.example.com` matches sub-domains and the apex; a trailing `*` matches
/// the prefix; `*` alone matches everything; otherwise exact.
fn host_pattern_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim().to_ascii_lowercase();
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host == suffix || host.ends_with(&format!(".{suffix}"));
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return host.starts_with(prefix);
    }
    pattern == host
}

pub struct FetchCapability {
    config: FetchConfig,
    client: reqwest::Client,
    window: Mutex<VecDeque<Instant>>,
    on_request: Option<AccessHook>,
    on_blocked: Option<BlockedHook>,
}

impl FetchCapability {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            config,
            client,
            window: Mutex::new(VecDeque::new()),
            on_request: None,
            on_blocked: None,
        })
    }

    pub fn with_request_hook(mut self, hook: AccessHook) -> Self {
        self.on_request = Some(hook);
        self
    }

    pub fn with_blocked_hook(mut self, hook: BlockedHook) -> Self {
        self.on_blocked = Some(hook);
        self
    }

    fn deny(&self, target: &str, reason: &str) -> SkillError {
        observability::security_blocked("fetch", "fetch", target, reason);
        if let Some(hook) = &self.on_blocked {
            hook("fetch", target, reason);
        }
        SkillError::refused(CapabilityDomain::Fetch)
    }

    /// Scheme and host admission for one URL. Returns the detailed reason
    /// on refusal; callers surface it through the hook only.
    pub(crate) fn check_url(&self, url: &Url) -> Result<(), &'static str> {
        let scheme = url.scheme().to_ascii_lowercase();
        if !self
            .config
            .allowed_schemes
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&scheme))
        {
            return Err("Scheme not allowed");
        }

        let Some(host) = url.host_str() else {
            return Err("Host not allowed");
        };
        let host = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim_end_matches('.')
            .to_ascii_lowercase();

        if security::is_blocked_hostname(&host)
            || security::is_cloud_metadata_ip(&host)
            || security::is_private_ip(&host)
        {
            return Err("Host not allowed");
        }
        if self
            .config
            .blocked_hosts
            .iter()
            .any(|p| host_pattern_matches(p, &host))
        {
            return Err("Host not allowed");
        }
        if !self
            .config
            .allowed_hosts
            .iter()
            .any(|p| host_pattern_matches(p, &host))
        {
            return Err("Host not allowed");
        }
        Ok(())
    }

    /// Slide the one-minute window. Each admitted request (and each redirect
    /// hop) consumes one slot.
    pub(crate) fn admit_rate(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut window = self.window.lock().expect("rate window lock");
        while let Some(front) = window.front() {
            if now.duration_since(*front) >= RATE_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() as u32 >= self.config.max_requests_per_minute {
            let retry = window
                .front()
                .map(|f| RATE_WINDOW.saturating_sub(now.duration_since(*f)))
                .unwrap_or(RATE_WINDOW);
            return Err(retry);
        }
        window.push_back(now);
        Ok(())
    }

    /// Merge default headers with the caller's, dropping blocked names.
    pub(crate) fn sanitize_headers(
        &self,
        caller: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut out: BTreeMap<String, String> = self
            .config
            .default_headers
            .iter()
            .cloned()
            .collect();
        for (name, value) in caller {
            let lower = name.to_ascii_lowercase();
            if self
                .config
                .blocked_headers
                .iter()
                .any(|b| b.eq_ignore_ascii_case(&lower))
            {
                continue;
            }
            out.insert(name.clone(), value.clone());
        }
        out
    }

    /// Perform one request, chasing redirects through re-admission.
    pub async fn request(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<String>,
    ) -> Result<FetchResponse, SkillError> {
        let mut current = Url::parse(url).map_err(|_| self.deny(url, "Malformed URL"))?;
        if let Err(reason) = self.check_url(&current) {
            return Err(self.deny(url, reason));
        }
        if let Err(retry) = self.admit_rate() {
            let reason = format!("Rate limit exceeded, retry in {}s", retry.as_secs().max(1));
            return Err(self.deny(url, &reason));
        }

        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| self.deny(url, "Invalid method"))?;
        let headers = self.sanitize_headers(headers);

        if let Some(hook) = &self.on_request {
            hook(method.as_str(), current.as_str());
        }
        observability::capability_access("fetch", method.as_str(), current.as_str());

        let mut hops: u32 = 0;
        let response = loop {
            // first hop carries the caller's method and body; redirect hops
            // degrade to GET
            let mut builder = if hops == 0 {
                let mut b = self.client.request(method.clone(), current.clone());
                if let Some(ref body) = body {
                    b = b.body(body.clone());
                }
                b
            } else {
                self.client.get(current.clone())
            };
            for (name, value) in &headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            let response = builder
                .send()
                .await
                .map_err(|_| self.deny(current.as_str(), "Request failed"))?;

            if response.status().is_redirection() {
                let Some(location) = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    break response;
                };
                hops += 1;
                if hops > self.config.max_redirects {
                    return Err(self.deny(current.as_str(), "Too many redirects"));
                }
                let target = current
                    .join(location)
                    .map_err(|_| self.deny(location, "Malformed redirect"))?;
                if self.check_url(&target).is_err() {
                    return Err(self.deny(target.as_str(), "Blocked redirect"));
                }
                if self.admit_rate().is_err() {
                    return Err(self.deny(target.as_str(), "Rate limit exceeded"));
                }
                current = target;
                continue;
            }
            break response;
        };

        if let Some(length) = response.content_length() {
            if length > self.config.max_response_bytes {
                return Err(self.deny(current.as_str(), "Response too large"));
            }
        }

        let status = response.status().as_u16();
        let mut header_map = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                header_map.insert(name.as_str().to_string(), v.to_string());
            }
        }

        Ok(FetchResponse {
            status,
            headers: header_map,
            cap: self.config.max_response_bytes,
            inner: response,
        })
    }
}

/// A response whose body is re-wrapped so consumer reads are compared
/// against the size cap; on overflow the stream is aborted with an error.
#[derive(Debug)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    cap: u64,
    inner: reqwest::Response,
}

impl FetchResponse {
    pub fn bytes_stream(
        self,
    ) -> CappedStream<Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>> {
        CappedStream::new(Box::pin(self.inner.bytes_stream()), self.cap)
    }

    /// Accumulate the whole body, enforcing the cap during the read.
    pub async fn bytes(self) -> Result<Vec<u8>, SkillError> {
        let mut stream = self.bytes_stream();
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    pub async fn text(self) -> Result<String, SkillError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }
}

/// Stream adapter: counts accumulated bytes and aborts on overflow.
pub struct CappedStream<S> {
    inner: S,
    seen: u64,
    cap: u64,
    failed: bool,
}

impl<S> CappedStream<S> {
    pub fn new(inner: S, cap: u64) -> Self {
        Self {
            inner,
            seen: 0,
            cap,
            failed: false,
        }
    }
}

impl<S, E> Stream for CappedStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
{
    type Item = std::result::Result<Bytes, SkillError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.failed {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.seen += chunk.len() as u64;
                if this.seen > this.cap {
                    this.failed = true;
                    observability::security_blocked(
                        "fetch",
                        "stream",
                        "-",
                        "Response exceeded size cap during read",
                    );
                    Poll::Ready(Some(Err(SkillError::refused(CapabilityDomain::Fetch))))
                } else {
                    Poll::Ready(Some(Ok(chunk)))
                }
            }
            Poll::Ready(Some(Err(_))) => {
                this.failed = true;
                Poll::Ready(Some(Err(SkillError::refused(CapabilityDomain::Fetch))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
