use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{
    backend::{ensure_success, BackendError, ChatBackend, Completion},
    config::{endpoint, ConfigError, OpenAiConfig},
    prompt::{Prompt, PromptKind},
    relay::StreamRelay,
    sse,
};

/// Any upstream speaking the OpenAI streaming chat-completions protocol.
#[derive(Clone)]
pub struct OpenAiBackend {
    name: String,
    priority: i32,
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: Url,
}

impl OpenAiBackend {
    pub fn from_config(config: &OpenAiConfig, client: reqwest::Client) -> Result<Self, ConfigError> {
        let base_url = config.validate()?;
        Ok(Self {
            name: config
                .name
                .clone()
                .unwrap_or_else(|| format!("openai@{}", base_url.host_str().unwrap_or("upstream"))),
            priority: config.priority,
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url,
        })
    }

    fn url(&self, path: &str) -> String {
        endpoint(&self.base_url, path)
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn generate(&self, prompt: &Prompt, relay: &mut StreamRelay) -> Result<Completion, BackendError> {
        if prompt.kind() == PromptKind::Image {
            return Err(BackendError::Unsupported("image generation".to_owned()));
        }

        let payload = json!({
            "model": self.model,
            "messages": prompt
                .structured()
                .iter()
                .map(|message| json!({"role": message.role.as_openai(), "content": message.content}))
                .collect::<Vec<_>>(),
            "max_tokens": prompt.generation.max_tokens,
            "temperature": prompt.generation.temperature,
            "top_p": prompt.generation.top_p,
            "stream": true
        });

        let request = self
            .client
            .post(self.url("/v1/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send();
        let response = ensure_success(relay.guard(request).await??).await?;

        let mut events = sse::decode_stream(response.bytes_stream());
        while let Some(next) = relay.guard(events.next()).await? {
            let event = next?;
            if event.is_done_marker() {
                break;
            }
            if event.data.is_empty() {
                continue;
            }

            let parsed: StreamResponse = serde_json::from_str(&event.data)
                .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;
            if let Some(message) = parsed.error.and_then(|error| error.message) {
                return Err(BackendError::InvalidResponse(message));
            }
            let Some(choice) = parsed.choices.into_iter().next() else {
                continue;
            };
            if let Some(content) = choice.delta.content {
                relay.push(content).await?;
            }
            if let Some(reason) = choice.finish_reason {
                debug!(backend = %self.name, reason = %reason, "upstream finished");
                return Ok(Completion::with_reason(reason));
            }
        }

        Ok(Completion::stop())
    }
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(default)]
    message: Option<String>,
}
