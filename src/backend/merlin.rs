//! Account-pooled web backend.
//!
//! Every call checks out the least-used account from an [`InstancePool`].
//! Accounts authenticate in two legs: email and password against the identity
//! service for an id token, then the id token against the app for an access
//! token. The id token also authorizes the usage endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{header::ACCEPT, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::{ensure_success, BackendError, ChatBackend, Completion},
    config::{endpoint, ConfigError, MerlinConfig, MerlinModels},
    pool::{Account, InstanceAuthority, InstanceLease, InstancePool, Quota, Tokens},
    prompt::{FlatPrompt, Prompt, PromptKind},
    relay::StreamRelay,
    sse,
};

const EVENT_CHUNK: &str = "CHUNK";
const EVENT_SYSTEM: &str = "SYSTEM";
const EVENT_DONE: &str = "DONE";

pub struct MerlinAuthority {
    client: reqwest::Client,
    auth_url: Url,
    auth_key: String,
    app_url: Url,
}

impl MerlinAuthority {
    pub fn new(client: reqwest::Client, auth_url: Url, auth_key: impl Into<String>, app_url: Url) -> Self {
        Self {
            client,
            auth_url,
            auth_key: auth_key.into(),
            app_url,
        }
    }
}

#[async_trait]
impl InstanceAuthority for MerlinAuthority {
    async fn sign_in(&self, account: &Account) -> Result<String, BackendError> {
        let response = self
            .client
            .post(endpoint(&self.auth_url, "/v1/accounts:signInWithPassword"))
            .query(&[("key", self.auth_key.as_str())])
            .json(&json!({
                "email": account.user,
                "password": account.secret,
                "returnSecureToken": true,
                "clientType": "CLIENT_TYPE_WEB",
            }))
            .send()
            .await?;
        let body: SignInResponse = ensure_success(response).await?.json().await?;
        non_empty(body.id_token, "idToken")
    }

    async fn exchange(&self, id_token: &str) -> Result<String, BackendError> {
        let response = self
            .client
            .post(endpoint(&self.app_url, "/session/get"))
            .json(&json!({ "token": id_token }))
            .send()
            .await?;
        let body: SessionResponse = ensure_success(response).await?.json().await?;
        non_empty(body.data.and_then(|data| data.access_token), "data.accessToken")
    }

    async fn usage(&self, tokens: &Tokens) -> Result<Quota, BackendError> {
        let response = self
            .client
            .get(endpoint(&self.app_url, "/status"))
            .query(&[("firebaseToken", tokens.id_token.as_str()), ("from", "DASHBOARD")])
            .bearer_auth(&tokens.id_token)
            .send()
            .await?;
        let body: StatusResponse = ensure_success(response).await?.json().await?;
        let usage = body
            .data
            .and_then(|data| data.user)
            .ok_or_else(|| BackendError::InvalidResponse("status response without data.user".to_owned()))?;
        Ok(Quota {
            used: usage.used,
            limit: usage.limit,
        })
    }
}

fn non_empty(value: Option<String>, field: &str) -> Result<String, BackendError> {
    value
        .filter(|value| !value.is_empty())
        .ok_or_else(|| BackendError::InvalidResponse(format!("response is missing {field}")))
}

pub struct MerlinBackend {
    name: String,
    priority: i32,
    client: reqwest::Client,
    app_url: Url,
    models: MerlinModels,
    pool: Arc<InstancePool>,
}

impl MerlinBackend {
    /// Builds the backend and starts background revalidation of its accounts.
    pub fn from_config(
        config: &MerlinConfig,
        client: reqwest::Client,
        shutdown: &CancellationToken,
    ) -> Result<Self, ConfigError> {
        let (auth_url, app_url) = config.validate()?;
        let name = config.name.clone().unwrap_or_else(|| "merlin".to_owned());
        let authority = Arc::new(MerlinAuthority::new(
            client.clone(),
            auth_url,
            config.auth_key.clone(),
            app_url.clone(),
        ));
        let accounts = config.accounts.iter().map(|account| Account {
            user: account.user.clone(),
            secret: account.secret.clone(),
        });
        let pool = InstancePool::with_min_headroom(name.clone(), authority, accounts, config.min_headroom);
        pool.spawn_revalidation(config.revalidate_interval(), shutdown.child_token());
        info!(backend = %name, accounts = pool.len(), "account pool created");

        Ok(Self::with_pool(name, config.priority, client, app_url, config.models.clone(), pool))
    }

    pub fn with_pool(
        name: impl Into<String>,
        priority: i32,
        client: reqwest::Client,
        app_url: Url,
        models: MerlinModels,
        pool: Arc<InstancePool>,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            client,
            app_url,
            models,
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }

    fn request_body(&self, flat: &FlatPrompt) -> (String, Value) {
        let message = json!({
            "content": flat.text,
            "metadata": { "context": "" },
            "parentId": "root",
            "role": "user",
        });
        let chat_id = Uuid::new_v4().to_string();
        match flat.kind {
            PromptKind::Text => (
                endpoint(&self.app_url, "/thread?customJWT=true&version=1.1"),
                json!({
                    "action": { "message": message, "type": "NEW" },
                    "chatId": chat_id,
                    "mode": "VANILLA_CHAT",
                    "model": self.models.chat,
                }),
            ),
            PromptKind::Image => (
                endpoint(&self.app_url, "/thread/image-generation?customJWT=true"),
                json!({
                    "action": { "message": message, "type": "NEW" },
                    "metadata": { "aspectRatio": "1:1", "numImages": 1 },
                    "chatId": chat_id,
                    "mode": "IMAGE_CHAT",
                    "model": self.models.image,
                }),
            ),
        }
    }

    async fn converse(
        &self,
        flat: &FlatPrompt,
        lease: &InstanceLease,
        relay: &mut StreamRelay,
    ) -> Result<Completion, BackendError> {
        let (url, body) = self.request_body(flat);
        let request = self
            .client
            .post(url)
            .bearer_auth(&lease.tokens().access_token)
            .header(ACCEPT, "text/event-stream")
            .json(&body)
            .send();
        let response = ensure_success(relay.guard(request).await??).await?;

        let mut events = sse::decode_stream(response.bytes_stream());
        while let Some(next) = relay.guard(events.next()).await? {
            let event = next?;
            if event.data.is_empty() {
                continue;
            }
            let envelope: EventEnvelope = match serde_json::from_str(&event.data) {
                Ok(envelope) => envelope,
                Err(error) => {
                    warn!(backend = %self.name, error = %error, "skipping unparsable event");
                    continue;
                }
            };
            let Some(data) = envelope.data else {
                continue;
            };

            match data.event_type.as_str() {
                EVENT_CHUNK => relay.push(data.content).await?,
                EVENT_SYSTEM if flat.kind == PromptKind::Image => {
                    if let Some(url) = data
                        .attachments
                        .iter()
                        .map(|attachment| attachment.url.as_str())
                        .find(|url| !url.is_empty())
                    {
                        relay.push(format!("![]({url})")).await?;
                    }
                }
                EVENT_DONE => return Ok(Completion::stop()),
                _ => {}
            }
        }
        Ok(Completion::stop())
    }
}

#[async_trait]
impl ChatBackend for MerlinBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn generate(&self, prompt: &Prompt, relay: &mut StreamRelay) -> Result<Completion, BackendError> {
        let flat = prompt
            .flatten()
            .ok_or_else(|| BackendError::Unsupported("prompt has no user message".to_owned()))?;
        let mut lease = relay.guard(self.pool.checkout()).await??;
        debug!(backend = %self.name, instance = lease.id(), kind = flat.kind.as_str(), "instance acquired");

        let mut result = self.converse(&flat, &lease, relay).await;
        if matches!(&result, Err(error) if error.is_unauthenticated()) && relay.pushed() == 0 {
            info!(backend = %self.name, instance = lease.id(), "access token rejected, refreshing once");
            relay.guard(self.pool.refresh(&mut lease)).await??;
            result = self.converse(&flat, &lease, relay).await;
        }

        if !relay.is_cancelled() {
            self.pool.sync_usage(&mut lease).await;
        }
        result
    }
}

#[derive(Debug, Deserialize)]
struct SignInResponse {
    #[serde(rename = "idToken")]
    id_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    data: Option<SessionData>,
}

#[derive(Debug, Deserialize)]
struct SessionData {
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    data: Option<StatusData>,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    user: Option<StatusUsage>,
}

#[derive(Debug, Deserialize)]
struct StatusUsage {
    #[serde(default)]
    used: u64,
    #[serde(default)]
    limit: u64,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    data: Option<EventData>,
}

#[derive(Debug, Deserialize)]
struct EventData {
    #[serde(rename = "eventType", default)]
    event_type: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

#[derive(Debug, Deserialize)]
struct Attachment {
    #[serde(default)]
    url: String,
}
