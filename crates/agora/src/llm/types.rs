use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Sampling options shared by chat and completion calls. Unset fields use
/// the configured temperature or the service default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop: Option<Vec<String>>,
}

impl CompletionOptions {
    #[must_use]
    pub const fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub const fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    #[must_use]
    pub fn stop(mut self, stop: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.stop = Some(stop.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub options: CompletionOptions,
}

impl ChatRequest {
    #[must_use]
    pub fn new(messages: impl IntoIterator<Item = ChatMessage>) -> Self {
        Self {
            messages: messages.into_iter().collect(),
            options: CompletionOptions::default(),
        }
    }

    #[must_use]
    pub fn options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }
}

/// One increment of a streamed chat reply. Services send either a bare
/// string or a partial message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Delta {
    Text(String),
    Message {
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        content: Option<String>,
    },
}

impl Delta {
    /// The text carried by this increment, if any.
    #[must_use]
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Message { content, .. } => content.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub owned_by: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct ModelList {
    #[serde(default)]
    pub data: Vec<ModelInfo>,
}

#[derive(Serialize)]
pub(super) struct CompletionBody<'a> {
    pub model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<&'a [ChatMessage]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<&'a str>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<&'a [String]>,
    #[serde(skip_serializing_if = "core::ops::Not::not")]
    pub stream: bool,
}

#[derive(Serialize)]
pub(super) struct PullBody<'a> {
    pub name: &'a str,
}

#[derive(Deserialize)]
pub(super) struct Completion<C> {
    #[serde(default = "Vec::new")]
    pub choices: Vec<C>,
}

impl<C> Completion<C> {
    pub fn first(self) -> Option<C> {
        self.choices.into_iter().next()
    }
}

#[derive(Deserialize)]
pub(super) struct MessageChoice {
    pub message: ChatMessage,
}

#[derive(Deserialize)]
pub(super) struct TextChoice {
    #[serde(default)]
    pub text: String,
}

#[derive(Deserialize)]
pub(super) struct DeltaChoice {
    #[serde(default = "empty_delta")]
    pub delta: Delta,
}

const fn empty_delta() -> Delta {
    Delta::Message {
        role: None,
        content: None,
    }
}
