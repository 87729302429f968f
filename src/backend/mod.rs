pub mod claude;
pub mod deepseek;
pub mod merlin;
pub mod mock;
pub mod ollama;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::{Config, ConfigError},
    pool::PoolError,
    prompt::Prompt,
    relay::StreamRelay,
    sse::SseError,
};

/// One upstream provider behind the router.
///
/// Implementations push content through the relay as it arrives and return
/// once the upstream signalled completion. Any error makes the router move on
/// to the next backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32;
    async fn generate(&self, prompt: &Prompt, relay: &mut StreamRelay) -> Result<Completion, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub finish_reason: String,
}

impl Completion {
    pub fn stop() -> Self {
        Self::with_reason("stop")
    }

    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            finish_reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
    #[error("unsupported request: {0}")]
    Unsupported(String),
    #[error("backend is busy with another request")]
    Busy,
    #[error("upstream rejected credentials: {0}")]
    Unauthenticated(String),
    #[error("no instance available")]
    PoolEmpty,
    #[error("request cancelled")]
    Cancelled,
    #[error("backend panicked: {0}")]
    Panicked(String),
}

impl BackendError {
    /// Stable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Status { .. } => "status",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Unsupported(_) => "unsupported",
            Self::Busy => "busy",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::PoolEmpty => "pool_empty",
            Self::Cancelled => "cancelled",
            Self::Panicked(_) => "panicked",
        }
    }

    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, Self::Unauthenticated(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            return Self::InvalidResponse(error.to_string());
        }
        if let Some(status) = error.status() {
            return map_http_error(status, error.to_string());
        }
        Self::Transport(error.to_string())
    }
}

impl From<SseError> for BackendError {
    fn from(error: SseError) -> Self {
        Self::Transport(error.to_string())
    }
}

impl From<PoolError> for BackendError {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::Empty | PoolError::Exhausted { .. } => Self::PoolEmpty,
            PoolError::Refresh(source) => source,
        }
    }
}

pub fn map_http_error(status: StatusCode, body: String) -> BackendError {
    let trimmed = body.chars().take(400).collect::<String>();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BackendError::Unauthenticated(format!("status {}: {trimmed}", status.as_u16()))
        }
        _ => BackendError::Status {
            status: status.as_u16(),
            body: trimmed,
        },
    }
}

/// Turns a non-2xx response into an error, consuming the body for context.
pub async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown backend error".to_owned());
    Err(map_http_error(status, body))
}

/// Non-blocking guard for backends that serve one call at a time.
#[derive(Debug, Default)]
pub struct AttemptLock<T> {
    inner: Mutex<T>,
}

impl<T> AttemptLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn try_acquire(&self) -> Result<MutexGuard<'_, T>, BackendError> {
        self.inner.try_lock().map_err(|_| BackendError::Busy)
    }
}

/// Builds every configured backend, sorted by descending priority.
///
/// A section that fails validation is logged and skipped, unless it is the
/// only backend section in the file.
pub fn build_backends(
    config: &Config,
    client: &reqwest::Client,
    shutdown: &CancellationToken,
) -> Result<Vec<Arc<dyn ChatBackend>>, ConfigError> {
    let total = config.backend_sections();
    if total == 0 {
        return Err(ConfigError::NoBackends);
    }

    let mut built: Vec<Result<Arc<dyn ChatBackend>, ConfigError>> = Vec::with_capacity(total);
    for section in &config.openai {
        built.push(openai::OpenAiBackend::from_config(section, client.clone()).map(into_dyn));
    }
    if let Some(section) = &config.merlin {
        built.push(merlin::MerlinBackend::from_config(section, client.clone(), shutdown).map(into_dyn));
    }
    if let Some(section) = &config.deepseek {
        built.push(deepseek::DeepseekBackend::from_config(section, client.clone()).map(into_dyn));
    }
    if let Some(section) = &config.claude {
        built.push(claude::ClaudeBackend::from_config(section, client.clone()).map(into_dyn));
    }
    if let Some(section) = &config.ollama {
        built.push(ollama::OllamaBackend::from_config(section, client.clone()).map(into_dyn));
    }
    for section in &config.mock {
        built.push(Ok(into_dyn(mock::MockBackend::from_config(section))));
    }

    let mut backends = Vec::with_capacity(total);
    for result in built {
        match result {
            Ok(backend) => {
                info!(backend = backend.name(), priority = backend.priority(), "backend configured");
                backends.push(backend);
            }
            Err(error) if total == 1 => return Err(error),
            Err(error) => warn!(error = %error, "skipping misconfigured backend"),
        }
    }

    if backends.is_empty() {
        return Err(ConfigError::NoUsableBackends);
    }
    sort_by_priority(&mut backends);
    Ok(backends)
}

/// Stable sort, so equal priorities keep their configuration order.
pub fn sort_by_priority(backends: &mut [Arc<dyn ChatBackend>]) {
    backends.sort_by_key(|backend| std::cmp::Reverse(backend.priority()));
}

fn into_dyn<B>(backend: B) -> Arc<dyn ChatBackend>
where
    B: ChatBackend + 'static,
{
    Arc::new(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(raw: &str) -> Config {
        Config::from_toml(raw).expect("test config parses")
    }

    fn build(raw: &str) -> Result<Vec<Arc<dyn ChatBackend>>, ConfigError> {
        build_backends(&config(raw), &reqwest::Client::new(), &CancellationToken::new())
    }

    #[test]
    fn status_mapping_flags_rejected_credentials() {
        assert!(map_http_error(StatusCode::UNAUTHORIZED, String::new()).is_unauthenticated());
        assert!(map_http_error(StatusCode::FORBIDDEN, String::new()).is_unauthenticated());
        let error = map_http_error(StatusCode::BAD_GATEWAY, "x".repeat(1000));
        match error {
            BackendError::Status { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body.len(), 400);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn attempt_lock_fails_fast_when_held() {
        let lock = AttemptLock::new(());
        let held = lock.try_acquire().expect("first acquire");
        assert!(matches!(lock.try_acquire(), Err(BackendError::Busy)));
        drop(held);
        assert!(lock.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn backends_are_sorted_by_descending_priority() {
        let backends = build(
            r#"
[[mock]]
name = "low"
priority = 1

[[mock]]
name = "high"
priority = 10

[[mock]]
name = "also-low"
priority = 1
"#,
        )
        .expect("backends");

        let names = backends.iter().map(|backend| backend.name()).collect::<Vec<_>>();
        assert_eq!(names, vec!["high", "low", "also-low"]);
    }

    #[tokio::test]
    async fn invalid_backend_is_omitted_when_others_remain() {
        let backends = build(
            r#"
[[openai]]
base_url = "http://"
api_key = "sk"
model = "m"

[[mock]]
name = "fallback"
"#,
        )
        .expect("mock backend survives");

        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].name(), "fallback");
    }

    #[tokio::test]
    async fn invalid_sole_backend_is_fatal() {
        let error = build(
            r#"
[ollama]
server = "127.0.0.1:11434"
model = ""
"#,
        )
        .err()
        .expect("sole invalid backend must fail");

        assert!(matches!(error, ConfigError::Invalid { .. }));
    }

    #[tokio::test]
    async fn empty_configuration_is_rejected() {
        assert!(matches!(build(""), Err(ConfigError::NoBackends)));
    }
}
