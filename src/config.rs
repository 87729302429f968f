use std::{fs, net::SocketAddr, path::Path, time::Duration};

use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("[{section}] {message}")]
    Invalid { section: String, message: String },
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
    #[error("no backend configured")]
    NoBackends,
    #[error("every configured backend was rejected")]
    NoUsableBackends,
}

impl ConfigError {
    fn invalid(section: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            section: section.to_owned(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_address")]
    pub address: SocketAddr,
    #[serde(default = "default_relay_buffer")]
    pub relay_buffer: usize,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub openai: Vec<OpenAiConfig>,
    #[serde(default)]
    pub merlin: Option<MerlinConfig>,
    #[serde(default)]
    pub deepseek: Option<DeepseekConfig>,
    #[serde(default)]
    pub claude: Option<ClaudeConfig>,
    #[serde(default)]
    pub ollama: Option<OllamaConfig>,
    #[serde(default)]
    pub mock: Vec<MockConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn backend_sections(&self) -> usize {
        self.openai.len()
            + self.mock.len()
            + usize::from(self.merlin.is_some())
            + usize::from(self.deepseek.is_some())
            + usize::from(self.claude.is_some())
            + usize::from(self.ollama.is_some())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            proxy: None,
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    pub fn build_client(&self) -> Result<reqwest::Client, ConfigError> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .user_agent(self.user_agent.clone());
        if let Some(proxy) = self.proxy.as_deref().filter(|proxy| !proxy.trim().is_empty()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|error| ConfigError::HttpClient(format!("invalid proxy: {error}")))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|error| ConfigError::HttpClient(error.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub priority: i32,
}

impl OpenAiConfig {
    pub fn validate(&self) -> Result<Url, ConfigError> {
        let section = "openai";
        require(section, "api_key", &self.api_key)?;
        require(section, "model", &self.model)?;
        parse_base_url(section, "base_url", &self.base_url)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MerlinConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub auth_url: String,
    #[serde(default)]
    pub auth_key: String,
    pub app_url: String,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub models: MerlinModels,
    #[serde(default = "default_revalidate_interval_secs")]
    pub revalidate_interval_secs: u64,
    #[serde(default = "default_min_headroom")]
    pub min_headroom: u64,
    #[serde(default)]
    pub priority: i32,
}

impl MerlinConfig {
    pub fn validate(&self) -> Result<(Url, Url), ConfigError> {
        let section = "merlin";
        require(section, "auth_key", &self.auth_key)?;
        if self.accounts.is_empty() {
            return Err(ConfigError::invalid(section, "at least one account is required"));
        }
        if let Some(account) = self
            .accounts
            .iter()
            .find(|account| account.user.trim().is_empty() || account.secret.is_empty())
        {
            return Err(ConfigError::invalid(
                section,
                format!("account '{}' needs both user and secret", account.user),
            ));
        }
        Ok((
            parse_base_url(section, "auth_url", &self.auth_url)?,
            parse_base_url(section, "app_url", &self.app_url)?,
        ))
    }

    pub fn revalidate_interval(&self) -> Duration {
        Duration::from_secs(self.revalidate_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub user: String,
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MerlinModels {
    #[serde(default = "default_merlin_chat_model")]
    pub chat: String,
    #[serde(default = "default_merlin_image_model")]
    pub image: String,
}

impl Default for MerlinModels {
    fn default() -> Self {
        Self {
            chat: default_merlin_chat_model(),
            image: default_merlin_image_model(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeepseekConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default = "default_deepseek_url")]
    pub base_url: String,
    #[serde(default)]
    pub priority: i32,
}

impl DeepseekConfig {
    pub fn validate(&self) -> Result<Url, ConfigError> {
        let section = "deepseek";
        require(section, "email", &self.email)?;
        require(section, "password", &self.password)?;
        parse_base_url(section, "base_url", &self.base_url)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub session_key: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default = "default_claude_url")]
    pub base_url: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub priority: i32,
}

impl ClaudeConfig {
    pub fn validate(&self) -> Result<Url, ConfigError> {
        let section = "claude";
        require(section, "session_key", &self.session_key)?;
        parse_base_url(section, "base_url", &self.base_url)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub server: String,
    pub model: String,
    #[serde(default)]
    pub priority: i32,
}

impl OllamaConfig {
    pub fn validate(&self) -> Result<Url, ConfigError> {
        let section = "ollama";
        require(section, "model", &self.model)?;
        parse_base_url(section, "server", &self.server)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MockConfig {
    #[serde(default = "default_mock_name")]
    pub name: String,
    #[serde(default = "default_mock_reply")]
    pub reply: String,
    #[serde(default)]
    pub priority: i32,
}

fn require(section: &str, field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::invalid(section, format!("{field} is required")));
    }
    Ok(())
}

/// Accepts bare hosts (`api.example.com`) as well as full URLs and strips any
/// trailing slash.
pub fn parse_base_url(section: &str, field: &str, raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::invalid(section, format!("{field} is required")));
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_owned()
    } else {
        format!("https://{trimmed}")
    };
    let url = Url::parse(&candidate)
        .map_err(|error| ConfigError::invalid(section, format!("{field} '{raw}' is not a valid URL: {error}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ConfigError::invalid(
            section,
            format!("{field} '{raw}' must be an http(s) URL with a host"),
        ));
    }
    Ok(url)
}

/// Joins a path onto a base URL without dropping the base's own path.
pub fn endpoint(base: &Url, path: &str) -> String {
    format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn default_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_relay_buffer() -> usize {
    32
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_owned()
}

fn default_revalidate_interval_secs() -> u64 {
    55 * 60
}

fn default_min_headroom() -> u64 {
    10
}

fn default_merlin_chat_model() -> String {
    "claude-3-haiku".to_owned()
}

fn default_merlin_image_model() -> String {
    "Dreamshape v7".to_owned()
}

fn default_deepseek_url() -> String {
    "https://chat.deepseek.com".to_owned()
}

fn default_claude_url() -> String {
    "https://claude.ai".to_owned()
}

fn default_timezone() -> String {
    "Asia/Shanghai".to_owned()
}

fn default_mock_name() -> String {
    "mock".to_owned()
}

fn default_mock_reply() -> String {
    "Hello from chatmux".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
address = "127.0.0.1:9000"

[http]
timeout_secs = 30

[[openai]]
name = "deepseek-api"
base_url = "https://api.deepseek.com"
api_key = "sk-test"
model = "deepseek-chat"
priority = 5

[merlin]
auth_url = "identitytoolkit.googleapis.com"
auth_key = "key"
app_url = "https://arcane.getmerlin.in/"
priority = 9
accounts = [{ user = "a@example.com", secret = "pw" }]

[merlin.models]
chat = "gpt-4o-mini"

[[mock]]
reply = "ok"
"#;

    #[test]
    fn parses_sections_and_defaults() {
        let config = Config::from_toml(SAMPLE).expect("sample config parses");

        assert_eq!(config.address.port(), 9000);
        assert_eq!(config.relay_buffer, 32);
        assert_eq!(config.http.timeout_secs, 30);
        assert_eq!(config.http.connect_timeout_secs, 10);
        assert_eq!(config.backend_sections(), 3);

        let merlin = config.merlin.expect("merlin section");
        assert_eq!(merlin.models.chat, "gpt-4o-mini");
        assert_eq!(merlin.models.image, "Dreamshape v7");
        assert_eq!(merlin.revalidate_interval(), Duration::from_secs(3300));
        assert_eq!(merlin.min_headroom, 10);
        let (auth, app) = merlin.validate().expect("valid merlin section");
        assert_eq!(auth.as_str(), "https://identitytoolkit.googleapis.com/");
        assert_eq!(endpoint(&app, "/session/get"), "https://arcane.getmerlin.in/session/get");
    }

    #[test]
    fn rejects_missing_credentials() {
        let config = OpenAiConfig {
            name: None,
            base_url: "https://api.example.com".to_owned(),
            api_key: " ".to_owned(),
            model: "m".to_owned(),
            priority: 0,
        };
        let error = config.validate().expect_err("blank key must fail");
        assert_eq!(error.to_string(), "[openai] api_key is required");
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!(parse_base_url("ollama", "server", "http://").is_err());
        assert!(parse_base_url("ollama", "server", "ftp://host").is_err());
        assert!(parse_base_url("ollama", "server", "http://127.0.0.1:11434/").is_ok());
    }

    #[test]
    fn endpoint_keeps_base_path() {
        let base = parse_base_url("openai", "base_url", "https://gateway.example.com/proxy/")
            .expect("valid url");
        assert_eq!(
            endpoint(&base, "v1/chat/completions"),
            "https://gateway.example.com/proxy/v1/chat/completions"
        );
    }
}
