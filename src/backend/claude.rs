use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{
    header::{ACCEPT, COOKIE},
    Url,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    backend::{ensure_success, AttemptLock, BackendError, ChatBackend, Completion},
    config::{endpoint, ClaudeConfig, ConfigError},
    prompt::{Prompt, PromptKind},
    relay::StreamRelay,
    sse,
};

#[derive(Debug, Default)]
struct Session {
    organization: Option<String>,
    conversation: Option<String>,
}

/// Cookie-authenticated web chat with one long-lived conversation.
pub struct ClaudeBackend {
    name: String,
    priority: i32,
    client: reqwest::Client,
    base_url: Url,
    session_key: String,
    timezone: String,
    session: AttemptLock<Session>,
}

impl ClaudeBackend {
    pub fn from_config(config: &ClaudeConfig, client: reqwest::Client) -> Result<Self, ConfigError> {
        let base_url = config.validate()?;
        let non_blank = |value: &Option<String>| value.clone().filter(|value| !value.trim().is_empty());
        Ok(Self {
            name: config.name.clone().unwrap_or_else(|| "claude".to_owned()),
            priority: config.priority,
            client,
            base_url,
            session_key: config.session_key.clone(),
            timezone: config.timezone.clone(),
            session: AttemptLock::new(Session {
                organization: non_blank(&config.organization_id),
                conversation: non_blank(&config.conversation_id),
            }),
        })
    }

    fn cookie(&self) -> String {
        format!("sessionKey={}", self.session_key)
    }

    async fn resolve_organization(&self) -> Result<String, BackendError> {
        let response = self
            .client
            .get(endpoint(&self.base_url, "/api/auth/current_account"))
            .header(COOKIE, self.cookie())
            .send()
            .await?;
        let body: CurrentAccount = ensure_success(response).await?.json().await?;
        let account = body
            .account
            .ok_or_else(|| BackendError::InvalidResponse("current_account without account".to_owned()))?;

        let display_name = account.display_name.unwrap_or_default();
        let organization = account
            .memberships
            .iter()
            .find(|membership| membership.organization.name == display_name)
            .or_else(|| account.memberships.first())
            .map(|membership| membership.organization.uuid.clone())
            .filter(|uuid| !uuid.is_empty())
            .ok_or_else(|| BackendError::InvalidResponse("account has no organization".to_owned()))?;
        info!(backend = %self.name, organization = %organization, "organization resolved");
        Ok(organization)
    }

    async fn create_conversation(&self, organization: &str) -> Result<String, BackendError> {
        let id = Uuid::new_v4().to_string();
        let response = self
            .client
            .post(endpoint(
                &self.base_url,
                &format!("/api/organizations/{organization}/chat_conversations"),
            ))
            .header(COOKIE, self.cookie())
            .json(&json!({ "uuid": id, "name": "" }))
            .send()
            .await?;
        ensure_success(response).await?;
        info!(backend = %self.name, conversation = %id, "conversation created");
        Ok(id)
    }

    async fn prepare(&self, session: &mut Session) -> Result<(String, String), BackendError> {
        let organization = match session.organization.clone() {
            Some(organization) => organization,
            None => {
                let organization = self.resolve_organization().await?;
                session.organization = Some(organization.clone());
                organization
            }
        };
        let conversation = match session.conversation.clone() {
            Some(conversation) => conversation,
            None => {
                let conversation = self.create_conversation(&organization).await?;
                session.conversation = Some(conversation.clone());
                conversation
            }
        };
        Ok((organization, conversation))
    }
}

#[async_trait]
impl ChatBackend for ClaudeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn generate(&self, prompt: &Prompt, relay: &mut StreamRelay) -> Result<Completion, BackendError> {
        let mut session = self.session.try_acquire()?;
        let flat = prompt
            .flatten()
            .ok_or_else(|| BackendError::Unsupported("prompt has no user message".to_owned()))?;
        if flat.kind == PromptKind::Image {
            return Err(BackendError::Unsupported("image generation".to_owned()));
        }

        let prepared = relay.guard(self.prepare(&mut session)).await?;
        let (organization, conversation) = match prepared {
            Ok(ids) => ids,
            Err(error) => {
                if error.is_unauthenticated() {
                    session.organization = None;
                }
                return Err(error);
            }
        };

        let request = self
            .client
            .post(endpoint(
                &self.base_url,
                &format!("/api/organizations/{organization}/chat_conversations/{conversation}/completion"),
            ))
            .header(COOKIE, self.cookie())
            .header(ACCEPT, "text/event-stream")
            .json(&json!({ "prompt": flat.text, "timezone": self.timezone }))
            .send();
        let response = match ensure_success(relay.guard(request).await??).await {
            Ok(response) => response,
            Err(error) => {
                if error.is_unauthenticated() {
                    debug!(backend = %self.name, "session rejected, organization will be resolved again");
                    session.organization = None;
                }
                return Err(error);
            }
        };

        let mut events = sse::decode_stream(response.bytes_stream());
        while let Some(next) = relay.guard(events.next()).await? {
            let event = next?;
            if event.data.is_empty() {
                continue;
            }
            let completion: CompletionEvent = match serde_json::from_str(&event.data) {
                Ok(completion) => completion,
                Err(error) => {
                    debug!(backend = %self.name, error = %error, "skipping unparsable event");
                    continue;
                }
            };
            if completion.kind != "completion" {
                continue;
            }
            relay.push(completion.completion).await?;
            if completion.stop.is_some_and(|stop| !stop.is_empty()) {
                return Ok(Completion::stop());
            }
        }
        Ok(Completion::stop())
    }
}

#[derive(Debug, Deserialize)]
struct CurrentAccount {
    account: Option<Account>,
}

#[derive(Debug, Deserialize)]
struct Account {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    memberships: Vec<Membership>,
}

#[derive(Debug, Deserialize)]
struct Membership {
    organization: Organization,
}

#[derive(Debug, Deserialize)]
struct Organization {
    #[serde(default)]
    uuid: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct CompletionEvent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    completion: String,
    #[serde(default)]
    stop: Option<String>,
}
