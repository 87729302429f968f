use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Instant};

use futures_util::FutureExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    backend::{sort_by_priority, BackendError, ChatBackend},
    metrics::AppMetrics,
    prompt::Prompt,
    relay::{StreamChunk, StreamRelay},
};

/// Result of a routed call that some backend completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub backend: String,
    pub content: String,
    pub finish_reason: String,
}

#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub backend: String,
    pub error: BackendError,
}

#[derive(Debug, Clone, Error)]
pub enum RouteError {
    #[error("request cancelled")]
    Cancelled,
    #[error("all {} backends failed: {}", .0.len(), summarize(.0))]
    Exhausted(Vec<AttemptFailure>),
}

fn summarize(failures: &[AttemptFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{}: {}", failure.backend, failure.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Tries backends one after another, highest priority first, until one
/// completes the prompt.
#[derive(Clone)]
pub struct FallbackRouter {
    backends: Arc<Vec<Arc<dyn ChatBackend>>>,
    metrics: Option<Arc<AppMetrics>>,
}

impl FallbackRouter {
    pub fn new(mut backends: Vec<Arc<dyn ChatBackend>>) -> Self {
        sort_by_priority(&mut backends);
        Self {
            backends: Arc::new(backends),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|backend| backend.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Routes one prompt. The relay always receives exactly one terminal
    /// chunk before this returns.
    pub async fn route(&self, prompt: &Prompt, relay: &mut StreamRelay) -> Result<RouteOutcome, RouteError> {
        let mut failures = Vec::new();

        for backend in self.backends.iter() {
            if relay.is_cancelled() {
                relay.finish(StreamChunk::Stop).await;
                return Err(RouteError::Cancelled);
            }

            relay.begin_attempt();
            let started = Instant::now();
            let result = AssertUnwindSafe(backend.generate(prompt, relay))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(BackendError::Panicked(panic_message(panic))));
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(completion) => {
                    self.observe(backend.name(), "success");
                    info!(
                        request_id = %prompt.request_id,
                        backend = backend.name(),
                        attempts = failures.len() + 1,
                        latency_ms,
                        "backend completed request"
                    );
                    relay.finish(StreamChunk::Stop).await;
                    return Ok(RouteOutcome {
                        backend: backend.name().to_owned(),
                        content: relay.take_content(),
                        finish_reason: completion.finish_reason,
                    });
                }
                Err(BackendError::Cancelled) => {
                    self.observe(backend.name(), "cancelled");
                    debug!(request_id = %prompt.request_id, backend = backend.name(), "request cancelled during attempt");
                    relay.finish(StreamChunk::Stop).await;
                    return Err(RouteError::Cancelled);
                }
                Err(error) => {
                    self.observe(backend.name(), error.kind());
                    warn!(
                        request_id = %prompt.request_id,
                        backend = backend.name(),
                        kind = error.kind(),
                        error = %error,
                        pushed = relay.pushed(),
                        latency_ms,
                        "backend attempt failed, trying next"
                    );
                    failures.push(AttemptFailure {
                        backend: backend.name().to_owned(),
                        error,
                    });
                }
            }
        }

        let error = RouteError::Exhausted(failures);
        warn!(request_id = %prompt.request_id, error = %error, "no backend could serve request");
        relay.finish(StreamChunk::Error(error.to_string())).await;
        Err(error)
    }

    fn observe(&self, backend: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_backend_attempt(backend, outcome);
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_owned();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_owned()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        backend::{mock::MockBackend, Completion},
        prompt::Role,
    };

    fn prompt() -> Prompt {
        Prompt::new("req-test", "gpt-test").with_message(Role::Human, "hello")
    }

    fn router(backends: &[Arc<MockBackend>]) -> FallbackRouter {
        FallbackRouter::new(
            backends
                .iter()
                .map(|backend| Arc::clone(backend) as Arc<dyn ChatBackend>)
                .collect(),
        )
    }

    async fn drain(mut rx: crate::relay::ChunkReceiver) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn stops_at_the_first_success_in_priority_order() {
        let low = Arc::new(MockBackend::replying("low", 1, ["ok"]));
        let high = Arc::new(MockBackend::failing("high", 10, BackendError::Transport("down".to_owned())));
        let mid = Arc::new(MockBackend::failing(
            "mid",
            5,
            BackendError::Status {
                status: 500,
                body: "boom".to_owned(),
            },
        ));
        let lowest = Arc::new(MockBackend::replying("lowest", 0, ["never"]));
        let router = router(&[low.clone(), lowest.clone(), high.clone(), mid.clone()]);
        assert_eq!(router.backend_names(), vec!["high", "mid", "low", "lowest"]);

        let mut relay = StreamRelay::buffered(CancellationToken::new());
        let outcome = router.route(&prompt(), &mut relay).await.expect("low succeeds");

        assert_eq!(outcome.backend, "low");
        assert_eq!(outcome.content, "ok");
        assert_eq!(outcome.finish_reason, "stop");
        assert_eq!((high.calls(), mid.calls(), low.calls(), lowest.calls()), (1, 1, 1, 0));
    }

    #[tokio::test]
    async fn busy_and_unsupported_backends_fall_through() {
        let busy = Arc::new(MockBackend::failing("busy", 3, BackendError::Busy));
        let text_only = Arc::new(MockBackend::failing(
            "text-only",
            2,
            BackendError::Unsupported("image".to_owned()),
        ));
        let fallback = Arc::new(MockBackend::replying("fallback", 1, ["done"]));
        let router = router(&[busy.clone(), text_only.clone(), fallback.clone()]);

        let mut relay = StreamRelay::buffered(CancellationToken::new());
        let outcome = router.route(&prompt(), &mut relay).await.expect("fallback succeeds");

        assert_eq!(outcome.backend, "fallback");
        assert_eq!((busy.calls(), text_only.calls(), fallback.calls()), (1, 1, 1));
    }

    #[tokio::test]
    async fn exhausted_fallback_reports_every_failure_and_terminates_the_stream() {
        let first = Arc::new(MockBackend::failing("first", 2, BackendError::Transport("reset".to_owned())));
        let second = Arc::new(MockBackend::failing("second", 1, BackendError::PoolEmpty));
        let router = router(&[first, second]);

        let (mut relay, rx) = StreamRelay::streaming(CancellationToken::new(), 8);
        let error = router.route(&prompt(), &mut relay).await.expect_err("all fail");
        drop(relay);

        let RouteError::Exhausted(failures) = error else {
            panic!("expected exhausted fallback");
        };
        let names = failures.iter().map(|failure| failure.backend.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["first", "second"]);

        let chunks = drain(rx).await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], StreamChunk::Error(message) if message.contains("reset")));
    }

    struct PanickingBackend;

    #[async_trait::async_trait]
    impl ChatBackend for PanickingBackend {
        fn name(&self) -> &str {
            "panics"
        }

        fn priority(&self) -> i32 {
            100
        }

        async fn generate(&self, _prompt: &Prompt, _relay: &mut StreamRelay) -> Result<Completion, BackendError> {
            panic!("upstream adapter bug");
        }
    }

    #[tokio::test]
    async fn a_panicking_backend_does_not_stop_fallback() {
        let healthy = Arc::new(MockBackend::replying("healthy", 1, ["fine"]));
        let router = FallbackRouter::new(vec![
            healthy.clone() as Arc<dyn ChatBackend>,
            Arc::new(PanickingBackend),
        ]);

        let mut relay = StreamRelay::buffered(CancellationToken::new());
        let outcome = router.route(&prompt(), &mut relay).await.expect("healthy serves");

        assert_eq!(outcome.backend, "healthy");
        assert_eq!(healthy.calls(), 1);
    }

    #[tokio::test]
    async fn streams_chunks_in_order_followed_by_one_stop() {
        let backend = Arc::new(MockBackend::replying("stream", 1, ["He", "llo"]));
        let router = router(&[backend]);

        let (mut relay, rx) = StreamRelay::streaming(CancellationToken::new(), 8);
        let outcome = router.route(&prompt(), &mut relay).await.expect("stream succeeds");
        drop(relay);

        assert_eq!(outcome.content, "Hello");
        assert_eq!(
            drain(rx).await,
            vec![
                StreamChunk::Content("He".to_owned()),
                StreamChunk::Content("llo".to_owned()),
                StreamChunk::Stop,
            ]
        );
    }

    #[tokio::test]
    async fn caller_cancellation_stops_the_stream_and_skips_remaining_backends() {
        let cancel = CancellationToken::new();
        let slow = Arc::new(
            MockBackend::replying("slow", 2, ["a", "b", "c", "d"]).with_delay(Duration::from_millis(50)),
        );
        let next = Arc::new(MockBackend::replying("next", 1, ["unused"]));
        let router = router(&[slow.clone(), next.clone()]);

        let (mut relay, mut rx) = StreamRelay::streaming(cancel.clone(), 8);
        let route = tokio::spawn({
            let prompt = prompt();
            async move { router.route(&prompt, &mut relay).await }
        });

        assert_eq!(rx.recv().await, Some(StreamChunk::Content("a".to_owned())));
        cancel.cancel();

        let result = route.await.expect("route task");
        assert!(matches!(result, Err(RouteError::Cancelled)));
        assert_eq!(next.calls(), 0);

        let rest = drain(rx).await;
        let terminals = rest.iter().filter(|chunk| chunk.is_terminal()).count();
        assert_eq!(terminals, 1);
        assert_eq!(rest.last(), Some(&StreamChunk::Stop));
    }
}
