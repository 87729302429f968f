use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::debug;

use crate::{
    backend::{AttemptLock, BackendError, ChatBackend, Completion},
    config::MockConfig,
    prompt::Prompt,
    relay::StreamRelay,
};

#[derive(Debug, Clone)]
enum Script {
    Reply(Vec<String>),
    Fail(BackendError),
}

/// Scripted backend: replies with fixed chunks or fails with a fixed error,
/// counting every invocation.
#[derive(Debug)]
pub struct MockBackend {
    name: String,
    priority: i32,
    script: Script,
    chunk_delay: Option<Duration>,
    gate: Option<AttemptLock<()>>,
    calls: AtomicUsize,
}

impl MockBackend {
    fn new(name: impl Into<String>, priority: i32, script: Script) -> Self {
        Self {
            name: name.into(),
            priority,
            script,
            chunk_delay: None,
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn replying<I, S>(name: impl Into<String>, priority: i32, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let chunks = chunks.into_iter().map(Into::into).collect();
        Self::new(name, priority, Script::Reply(chunks))
    }

    pub fn failing(name: impl Into<String>, priority: i32, error: BackendError) -> Self {
        Self::new(name, priority, Script::Fail(error))
    }

    pub fn from_config(config: &MockConfig) -> Self {
        Self::replying(&config.name, config.priority, split_for_stream(&config.reply))
    }

    /// Sleeps after every chunk; the sleep is interrupted by cancellation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Serves one call at a time; overlapping calls fail as busy.
    pub fn single_flight(mut self) -> Self {
        self.gate = Some(AttemptLock::new(()));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn generate(&self, prompt: &Prompt, relay: &mut StreamRelay) -> Result<Completion, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _turn = self.gate.as_ref().map(AttemptLock::try_acquire).transpose()?;
        debug!(backend = %self.name, request_id = %prompt.request_id, "mock invoked");

        let chunks = match &self.script {
            Script::Reply(chunks) => chunks,
            Script::Fail(error) => return Err(error.clone()),
        };
        for chunk in chunks {
            relay.push(chunk.as_str()).await?;
            if let Some(delay) = self.chunk_delay {
                relay.guard(sleep(delay)).await?;
            }
        }
        Ok(Completion::stop())
    }
}

fn split_for_stream(text: &str) -> Vec<String> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let len = tokens.len();

    tokens
        .into_iter()
        .enumerate()
        .map(|(index, token)| {
            if index + 1 == len {
                token.to_owned()
            } else {
                format!("{token} ")
            }
        })
        .collect()
}
