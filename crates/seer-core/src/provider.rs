//! Completion providers: the trait the orchestrator calls, the blocking
//! HTTP implementation, and the retry/failover wrapper.
//!
//! Failover state is an injected service with an injected clock, so tests
//! drive the cooldown without waiting and nothing global survives a test.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ChatConfig;
use crate::error::{Result, SeerError};
use crate::models::{Phase, Turn, TurnRole};
use crate::persona::Persona;

/// One completion request: the scaffold prompt plus the reconciled recent
/// window, already truncated by the orchestrator.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub persona: Persona,
    pub phase: Phase,
    pub system_prompt: String,
    pub recent: Vec<Turn>,
}

/// Produces the agent's reply text for one turn.
pub trait CompletionProvider: Send + Sync {
    fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Millisecond clock seam for the failover cooldown.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

#[derive(Debug, Default)]
struct HealthInner {
    consecutive_failures: u32,
    cooldown_until_ms: Option<u64>,
}

/// Tracks consecutive primary failures and opens a cooldown window once the
/// threshold is crossed. Shared by reference, never a global.
pub struct ProviderHealth {
    inner: Mutex<HealthInner>,
    failure_threshold: u32,
    cooldown_ms: u64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ProviderHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHealth")
            .field("failure_threshold", &self.failure_threshold)
            .field("cooldown_ms", &self.cooldown_ms)
            .finish_non_exhaustive()
    }
}

impl ProviderHealth {
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(HealthInner::default()),
            failure_threshold,
            cooldown_ms,
            clock,
        }
    }

    #[must_use]
    pub fn from_config(config: &ChatConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config.provider_failure_threshold,
            config.provider_cooldown_ms,
            clock,
        )
    }

    /// Whether the primary is inside an open cooldown window.
    pub fn is_cooling(&self) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.cooldown_until_ms {
            Some(until) if self.clock.now_ms() < until => Ok(true),
            Some(_) => {
                // Window elapsed; the next request probes the primary again.
                inner.cooldown_until_ms = None;
                inner.consecutive_failures = 0;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    pub fn record_success(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.consecutive_failures = 0;
        inner.cooldown_until_ms = None;
        Ok(())
    }

    pub fn record_failure(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if inner.consecutive_failures >= self.failure_threshold && inner.cooldown_until_ms.is_none()
        {
            let until = self.clock.now_ms().saturating_add(self.cooldown_ms);
            inner.cooldown_until_ms = Some(until);
            warn!(
                failures = inner.consecutive_failures,
                cooldown_ms = self.cooldown_ms,
                "primary provider cooldown opened"
            );
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HealthInner>> {
        self.inner
            .lock()
            .map_err(|_| SeerError::mutex_poisoned("provider health"))
    }
}

/// Wraps a primary and an optional fallback provider with bounded retries
/// and threshold-based failover. Provider identity never reaches the caller;
/// both paths return plain reply text or a provider error.
pub struct FailoverProvider {
    primary: Arc<dyn CompletionProvider>,
    fallback: Option<Arc<dyn CompletionProvider>>,
    health: Arc<ProviderHealth>,
    max_retries: u32,
    backoff_ms: u64,
}

impl std::fmt::Debug for FailoverProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverProvider")
            .field("max_retries", &self.max_retries)
            .field("backoff_ms", &self.backoff_ms)
            .field("has_fallback", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}

impl FailoverProvider {
    #[must_use]
    pub fn new(
        primary: Arc<dyn CompletionProvider>,
        fallback: Option<Arc<dyn CompletionProvider>>,
        health: Arc<ProviderHealth>,
        config: &ChatConfig,
    ) -> Self {
        Self {
            primary,
            fallback,
            health,
            max_retries: config.provider_max_retries.max(1),
            backoff_ms: config.provider_backoff_ms,
        }
    }

    fn try_with_retries(&self, request: &CompletionRequest) -> Result<String> {
        let mut last_err = None;
        for attempt in 1..=self.max_retries {
            match self.primary.complete(request) {
                Ok(reply) => return Ok(reply),
                Err(err) if err.is_transient_provider() => {
                    debug!(attempt, error = %err, "transient provider failure");
                    if attempt < self.max_retries && self.backoff_ms > 0 {
                        let wait = self.backoff_ms * u64::from(attempt) * u64::from(attempt);
                        std::thread::sleep(Duration::from_millis(wait));
                    }
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| SeerError::provider_transient("provider exhausted retries")))
    }
}

impl CompletionProvider for FailoverProvider {
    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        if self.health.is_cooling()?
            && let Some(fallback) = &self.fallback
        {
            debug!("primary cooling; routing to fallback");
            return fallback.complete(request);
        }
        match self.try_with_retries(request) {
            Ok(reply) => {
                self.health.record_success()?;
                Ok(reply)
            }
            Err(primary_err) => {
                self.health.record_failure()?;
                if let Some(fallback) = &self.fallback {
                    warn!(error = %primary_err, "primary failed; trying fallback");
                    fallback.complete(request)
                } else {
                    Err(primary_err)
                }
            }
        }
    }
}

/// Blocking chat-completions client: POST one JSON payload, classify the
/// status, pull the reply text out of the response body.
pub struct HttpCompletionProvider {
    client: Client,
    endpoint: Url,
    model: String,
}

impl std::fmt::Debug for HttpCompletionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCompletionProvider")
            .field("endpoint", &self.endpoint.as_str())
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl HttpCompletionProvider {
    pub fn new(endpoint: &str, model: impl Into<String>, config: &ChatConfig) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|err| SeerError::Validation(format!("invalid provider endpoint: {err}")))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.provider_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            model: model.into(),
        })
    }

    fn payload(&self, request: &CompletionRequest) -> Value {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": request.system_prompt,
        })];
        for turn in &request.recent {
            let role = match turn.role {
                TurnRole::User => "user",
                TurnRole::Agent => "assistant",
            };
            messages.push(serde_json::json!({"role": role, "content": turn.text}));
        }
        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        })
    }

    fn extract_reply(value: &Value) -> Result<String> {
        let content = value
            .pointer("/choices/0/message/content")
            .or_else(|| value.pointer("/message/content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty());
        content.map(str::to_string).ok_or_else(|| {
            SeerError::provider_fatal("completion response carried no reply text")
        })
    }
}

impl CompletionProvider for HttpCompletionProvider {
    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&self.payload(request))
            .send()
            .map_err(|err| {
                if err.is_timeout() || err.is_connect() {
                    SeerError::provider_transient(format!("request failed: {err}"))
                } else {
                    SeerError::provider_fatal(format!("request failed: {err}"))
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            let err = if status.as_u16() == 429 || status.is_server_error() {
                SeerError::provider_transient(format!("non-success status: {status}"))
            } else {
                SeerError::provider_fatal(format!("non-success status: {status}"))
            };
            return Err(err);
        }
        let value = response.json::<Value>().map_err(|err| {
            SeerError::provider_fatal(format!("invalid json response: {err}"))
        })?;
        Self::extract_reply(&value)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};

    use chrono::Utc;

    use super::*;

    struct FakeClock {
        now_ms: AtomicU64,
    }

    impl FakeClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now_ms: AtomicU64::new(0),
            })
        }

        fn advance(&self, ms: u64) {
            self.now_ms.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for FakeClock {
        fn now_ms(&self) -> u64 {
            self.now_ms.load(Ordering::SeqCst)
        }
    }

    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<String>>>,
        calls: AtomicU64,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU64::new(0),
            })
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl CompletionProvider for ScriptedProvider {
        fn complete(&self, _request: &CompletionRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Err(SeerError::provider_transient("script exhausted")))
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            persona: Persona::Sable,
            phase: Phase::Orientation,
            system_prompt: "prompt".to_string(),
            recent: vec![Turn {
                role: TurnRole::User,
                text: "hello".to_string(),
                ordinal: 1,
                created_at: Utc::now(),
            }],
        }
    }

    fn test_config() -> ChatConfig {
        ChatConfig {
            provider_backoff_ms: 0,
            ..ChatConfig::default()
        }
    }

    #[test]
    fn retries_transient_failures_then_succeeds() {
        let primary = ScriptedProvider::new(vec![
            Err(SeerError::provider_transient("t1")),
            Err(SeerError::provider_transient("t2")),
            Ok("reply".to_string()),
        ]);
        let clock = FakeClock::new();
        let health = Arc::new(ProviderHealth::new(3, 300_000, clock));
        let provider = FailoverProvider::new(primary.clone(), None, health, &test_config());

        assert_eq!(provider.complete(&request()).expect("complete"), "reply");
        assert_eq!(primary.calls(), 3);
    }

    #[test]
    fn fatal_failure_skips_retries() {
        let primary = ScriptedProvider::new(vec![Err(SeerError::provider_fatal("bad request"))]);
        let clock = FakeClock::new();
        let health = Arc::new(ProviderHealth::new(3, 300_000, clock));
        let provider = FailoverProvider::new(primary.clone(), None, health, &test_config());

        assert!(provider.complete(&request()).is_err());
        assert_eq!(primary.calls(), 1);
    }

    #[test]
    fn cooldown_opens_after_threshold_and_routes_to_fallback() {
        let clock = FakeClock::new();
        let health = Arc::new(ProviderHealth::new(3, 300_000, clock.clone()));
        // Each call exhausts its retries, so three calls cross the threshold.
        let primary = ScriptedProvider::new(Vec::new());
        let fallback = ScriptedProvider::new(vec![
            Ok("f1".to_string()),
            Ok("f2".to_string()),
            Ok("f3".to_string()),
            Ok("f4".to_string()),
        ]);
        let provider = FailoverProvider::new(
            primary.clone(),
            Some(fallback.clone()),
            health.clone(),
            &test_config(),
        );

        for _ in 0..3 {
            provider.complete(&request()).expect("fallback reply");
        }
        assert!(health.is_cooling().expect("is_cooling"));
        let primary_calls_before = primary.calls();

        provider.complete(&request()).expect("cooled reply");
        // Primary untouched while the cooldown window is open.
        assert_eq!(primary.calls(), primary_calls_before);

        clock.advance(300_001);
        assert!(!health.is_cooling().expect("is_cooling"));
    }

    #[test]
    fn success_resets_failure_streak() {
        let clock = FakeClock::new();
        let health = Arc::new(ProviderHealth::new(3, 300_000, clock));
        health.record_failure().expect("failure");
        health.record_failure().expect("failure");
        health.record_success().expect("success");
        health.record_failure().expect("failure");
        health.record_failure().expect("failure");
        assert!(!health.is_cooling().expect("is_cooling"));
    }

    #[test]
    fn extract_reply_reads_chat_and_plain_shapes() {
        let chat = serde_json::json!({
            "choices": [{"message": {"content": " hi "}}]
        });
        assert_eq!(
            HttpCompletionProvider::extract_reply(&chat).expect("chat"),
            "hi"
        );
        let plain = serde_json::json!({"message": {"content": "yo"}});
        assert_eq!(
            HttpCompletionProvider::extract_reply(&plain).expect("plain"),
            "yo"
        );
        assert!(HttpCompletionProvider::extract_reply(&serde_json::json!({})).is_err());
    }
}
