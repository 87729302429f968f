use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::{
    backend::{ensure_success, AttemptLock, BackendError, ChatBackend, Completion},
    config::{endpoint, ConfigError, DeepseekConfig},
    prompt::{Prompt, PromptKind},
    relay::StreamRelay,
    sse,
};

const MODEL_CLASS: &str = "deepseek_chat";

/// Web chat session authenticated by email login. One call at a time; the
/// session token lives behind the attempt lock.
pub struct DeepseekBackend {
    name: String,
    priority: i32,
    client: reqwest::Client,
    base_url: Url,
    email: String,
    password: String,
    device_id: String,
    session: AttemptLock<String>,
}

impl DeepseekBackend {
    pub fn from_config(config: &DeepseekConfig, client: reqwest::Client) -> Result<Self, ConfigError> {
        let base_url = config.validate()?;
        Ok(Self {
            name: config.name.clone().unwrap_or_else(|| "deepseek".to_owned()),
            priority: config.priority,
            client,
            base_url,
            email: config.email.clone(),
            password: config.password.clone(),
            device_id: config.device_id.clone(),
            session: AttemptLock::new(String::new()),
        })
    }

    async fn login(&self) -> Result<String, BackendError> {
        let response = self
            .client
            .post(endpoint(&self.base_url, "/api/v0/users/login"))
            .json(&json!({
                "email": self.email,
                "password": self.password,
                "mobile": "",
                "area_code": "",
                "device_id": self.device_id,
                "os": "web",
            }))
            .send()
            .await?;
        let body: LoginResponse = ensure_success(response).await?.json().await?;
        body.data
            .and_then(|data| data.user)
            .and_then(|user| user.token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| BackendError::Unauthenticated("login returned no token".to_owned()))
    }

    /// Resets server-side history so every call starts a fresh conversation.
    async fn clear_context(&self, token: &str) -> Result<(), BackendError> {
        if token.is_empty() {
            return Err(BackendError::Unauthenticated("no session token".to_owned()));
        }
        let response = self
            .client
            .post(endpoint(&self.base_url, "/api/v0/chat/clear_context"))
            .bearer_auth(token)
            .json(&json!({
                "append_welcome_message": false,
                "model_class": MODEL_CLASS,
            }))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatBackend for DeepseekBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn generate(&self, prompt: &Prompt, relay: &mut StreamRelay) -> Result<Completion, BackendError> {
        let mut token = self.session.try_acquire()?;
        let flat = prompt
            .flatten()
            .ok_or_else(|| BackendError::Unsupported("prompt has no user message".to_owned()))?;
        if flat.kind == PromptKind::Image {
            return Err(BackendError::Unsupported("image generation".to_owned()));
        }

        if let Err(error) = relay.guard(self.clear_context(&token)).await? {
            debug!(backend = %self.name, error = %error, "clearing context failed, logging in");
            *token = relay.guard(self.login()).await??;
            info!(backend = %self.name, "session refreshed");
        }

        let request = self
            .client
            .post(endpoint(&self.base_url, "/api/v0/chat/completions"))
            .bearer_auth(token.as_str())
            .json(&json!({
                "message": flat.text,
                "stream": true,
                "model_class": MODEL_CLASS,
                "temperature": prompt.generation.temperature.unwrap_or(0.0),
            }))
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
            let chunk: ChatChunk = serde_json::from_str(&event.data)
                .map_err(|error| BackendError::InvalidResponse(error.to_string()))?;

            let mut finish = None;
            for choice in chunk.choices {
                if let Some(content) = choice.delta.and_then(|delta| delta.content) {
                    relay.push(content).await?;
                }
                if let Some(reason) = choice.finish_reason.filter(|reason| !reason.is_empty()) {
                    finish = Some(reason);
                }
            }
            if let Some(reason) = finish {
                return Ok(Completion::with_reason(reason));
            }
        }
        Ok(Completion::stop())
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    data: Option<LoginData>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    user: Option<LoginUser>,
}

#[derive(Debug, Deserialize)]
struct LoginUser {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}
