use tracing::debug;

const IMAGE_PREFIXES: [&str; 2] = ["画", "/image"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    Human,
    Assistant,
    Generic,
}

impl Role {
    /// Maps a caller-supplied role string onto a known role. Unknown roles
    /// yield `None` and are dropped by the caller.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "system" => Some(Self::System),
            "user" | "human" => Some(Self::Human),
            "assistant" | "ai" => Some(Self::Assistant),
            "generic" => Some(Self::Generic),
            _ => None,
        }
    }

    pub fn as_openai(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Human | Self::Generic => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Text,
    Image,
}

impl PromptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
        }
    }
}

/// Single-turn rendering for backends without structured history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatPrompt {
    pub text: String,
    pub kind: PromptKind,
}

/// Backend-agnostic request produced once per inbound call.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub request_id: String,
    pub model: String,
    pub messages: Vec<PromptMessage>,
    pub generation: GenerationParams,
    pub stream: bool,
}

impl Prompt {
    pub fn new(request_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            model: model.into(),
            messages: Vec::new(),
            generation: GenerationParams::default(),
            stream: false,
        }
    }

    /// Appends a message, dropping roles that do not map onto [`Role`].
    pub fn push_raw(&mut self, role: &str, content: impl Into<String>) {
        match Role::parse(role) {
            Some(role) => self.messages.push(PromptMessage {
                role,
                content: content.into(),
            }),
            None => debug!(request_id = %self.request_id, role, "dropping message with unknown role"),
        }
    }

    pub fn with_message(mut self, role: Role, content: impl Into<String>) -> Self {
        self.messages.push(PromptMessage {
            role,
            content: content.into(),
        });
        self
    }

    pub fn last_user_turn(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::Human)
            .map(|message| message.content.as_str())
    }

    pub fn kind(&self) -> PromptKind {
        match self.last_user_turn() {
            Some(text) if IMAGE_PREFIXES.iter().any(|prefix| text.trim_start().starts_with(prefix)) => {
                PromptKind::Image
            }
            _ => PromptKind::Text,
        }
    }

    /// Last system message, a newline, then the most recent user turn.
    pub fn flatten(&self) -> Option<FlatPrompt> {
        let user = self.last_user_turn().filter(|text| !text.trim().is_empty())?;
        let system = self
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::System && !message.content.trim().is_empty());

        let text = match system {
            Some(system) => format!("{}\n{}", system.content, user),
            None => user.to_owned(),
        };
        Some(FlatPrompt {
            text,
            kind: self.kind(),
        })
    }

    /// System messages merged into one leading turn, followed by the rest of
    /// the conversation in order.
    pub fn structured(&self) -> Vec<PromptMessage> {
        let system = self
            .messages
            .iter()
            .filter(|message| message.role == Role::System)
            .map(|message| message.content.as_str())
            .filter(|content| !content.trim().is_empty())
            .collect::<Vec<_>>();

        let mut turns = Vec::with_capacity(self.messages.len());
        if !system.is_empty() {
            turns.push(PromptMessage {
                role: Role::System,
                content: system.join("\n"),
            });
        }
        turns.extend(
            self.messages
                .iter()
                .filter(|message| message.role != Role::System)
                .cloned(),
        );
        turns
    }
}
