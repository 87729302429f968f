//! Hand-off between an upstream read loop and the caller's connection.
//!
//! Backends push content through a [`StreamRelay`]; the relay accumulates the
//! full text of the current attempt and, when the caller asked for a stream,
//! forwards every fragment over a bounded channel. Cancellation flows both
//! ways through one [`CancellationToken`]: a dropped receiver cancels the
//! token, and a cancelled token stops pushes immediately.

use std::future::Future;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::BackendError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Content(String),
    Stop,
    Error(String),
}

impl StreamChunk {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamChunk::Content(_))
    }
}

pub type ChunkReceiver = mpsc::Receiver<StreamChunk>;

#[derive(Debug)]
pub struct StreamRelay {
    sink: Option<mpsc::Sender<StreamChunk>>,
    cancel: CancellationToken,
    content: String,
    pushed: usize,
    terminated: bool,
}

impl StreamRelay {
    pub fn streaming(cancel: CancellationToken, capacity: usize) -> (Self, ChunkReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let relay = Self {
            sink: Some(tx),
            cancel,
            content: String::new(),
            pushed: 0,
            terminated: false,
        };
        (relay, rx)
    }

    /// A relay with no caller-facing channel; content is only accumulated.
    pub fn buffered(cancel: CancellationToken) -> Self {
        Self {
            sink: None,
            cancel,
            content: String::new(),
            pushed: 0,
            terminated: false,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.sink.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resets per-attempt bookkeeping before the next backend is tried.
    pub fn begin_attempt(&mut self) {
        self.content.clear();
        self.pushed = 0;
    }

    /// Number of fragments pushed during the current attempt.
    pub fn pushed(&self) -> usize {
        self.pushed
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn take_content(&mut self) -> String {
        std::mem::take(&mut self.content)
    }

    pub async fn push(&mut self, content: impl Into<String>) -> Result<(), BackendError> {
        if self.terminated || self.cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        let content = content.into();
        if content.is_empty() {
            return Ok(());
        }

        self.content.push_str(&content);
        self.pushed += 1;

        let Some(sink) = &self.sink else {
            return Ok(());
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BackendError::Cancelled),
            sent = sink.send(StreamChunk::Content(content)) => {
                if sent.is_err() {
                    // receiver gone: the caller hung up
                    self.cancel.cancel();
                    return Err(BackendError::Cancelled);
                }
                Ok(())
            }
        }
    }

    /// Runs an upstream future unless the relay is cancelled first.
    pub async fn guard<F>(&self, future: F) -> Result<F::Output, BackendError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BackendError::Cancelled),
            output = future => Ok(output),
        }
    }

    /// Emits the terminal chunk. Only the first call has any effect.
    pub async fn finish(&mut self, terminal: StreamChunk) {
        debug_assert!(terminal.is_terminal());
        if self.terminated {
            return;
        }
        self.terminated = true;
        if let Some(sink) = self.sink.take() {
            let _ = sink.send(terminal).await;
        }
    }
}

impl Drop for StreamRelay {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        if let Some(sink) = self.sink.take() {
            let _ = sink.try_send(StreamChunk::Stop);
        }
    }
}
