use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{
    backend::{ensure_success, AttemptLock, BackendError, ChatBackend, Completion},
    config::{endpoint, ConfigError, OllamaConfig},
    prompt::{Prompt, PromptKind},
    relay::StreamRelay,
};

/// Local inference server. It runs one generation at a time, so overlapping
/// calls fail fast as busy.
pub struct OllamaBackend {
    name: String,
    priority: i32,
    client: reqwest::Client,
    server: Url,
    model: String,
    gate: AttemptLock<()>,
}

impl OllamaBackend {
    pub fn from_config(config: &OllamaConfig, client: reqwest::Client) -> Result<Self, ConfigError> {
        let server = config.validate()?;
        Ok(Self {
            name: config.name.clone().unwrap_or_else(|| "ollama".to_owned()),
            priority: config.priority,
            client,
            server,
            model: config.model.clone(),
            gate: AttemptLock::new(()),
        })
    }
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn generate(&self, prompt: &Prompt, relay: &mut StreamRelay) -> Result<Completion, BackendError> {
        let _turn = self.gate.try_acquire()?;
        if prompt.kind() == PromptKind::Image {
            return Err(BackendError::Unsupported("image generation".to_owned()));
        }

        let mut options = serde_json::Map::new();
        if let Some(temperature) = prompt.generation.temperature {
            options.insert("temperature".to_owned(), json!(temperature));
        }
        if let Some(top_p) = prompt.generation.top_p {
            options.insert("top_p".to_owned(), json!(top_p));
        }
        if let Some(max_tokens) = prompt.generation.max_tokens {
            options.insert("num_predict".to_owned(), json!(max_tokens));
        }
        let payload = json!({
            "model": self.model,
            "messages": prompt
                .structured()
                .iter()
                .map(|message| json!({"role": message.role.as_openai(), "content": message.content}))
                .collect::<Vec<_>>(),
            "stream": true,
            "options": options,
        });

        let request = self
            .client
            .post(endpoint(&self.server, "/api/chat"))
            .json(&payload)
            .send();
        let response = ensure_success(relay.guard(request).await??).await?;

        let mut upstream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let next = relay.guard(upstream.next()).await?;
            let Some(bytes) = next.transpose()? else {
                break;
            };
            buffer.extend_from_slice(&bytes);

            while let Some(index) = buffer.iter().position(|byte| *byte == b'\n') {
                let line = buffer.drain(..=index).collect::<Vec<_>>();
                if let Some(reason) = self.handle_line(&line, relay).await? {
                    return Ok(Completion::with_reason(reason));
                }
            }
        }

        if let Some(reason) = self.handle_line(&buffer, relay).await? {
            return Ok(Completion::with_reason(reason));
        }
        Ok(Completion::stop())
    }
}

impl OllamaBackend {
    /// Forwards one NDJSON frame; returns the finish reason once `done` is set.
    async fn handle_line(&self, line: &[u8], relay: &mut StreamRelay) -> Result<Option<String>, BackendError> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let frame: ChatFrame =
            serde_json::from_str(line).map_err(|error| BackendError::InvalidResponse(error.to_string()))?;
        if let Some(error) = frame.error {
            return Err(BackendError::InvalidResponse(error));
        }
        if let Some(message) = frame.message {
            relay.push(message.content).await?;
        }
        if frame.done {
            debug!(backend = %self.name, "generation done");
            return Ok(Some(frame.done_reason.unwrap_or_else(|| "stop".to_owned())));
        }
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct ChatFrame {
    #[serde(default)]
    message: Option<FrameMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FrameMessage {
    #[serde(default)]
    content: String,
}
