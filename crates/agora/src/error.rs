use std::sync::Arc;

use http::StatusCode;
use thiserror::Error;

use crate::host::BoxError;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Registration,
    Routing,
    Transport,
    Evaluation,
    Lifecycle,
    Llm,
}

#[derive(Error, Debug)]
pub enum Error {
    /// A scheme slot is already taken by a direct, lazy or alias entry.
    #[error("protocol scheme already registered: {scheme}")]
    DuplicateScheme { scheme: String },

    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unknown protocol scheme: {scheme}")]
    UnknownScheme { scheme: String },

    /// A lazy protocol backend failed to start. Memoised for the slot.
    #[error("failed to initialize protocol {scheme}: {source}")]
    HandlerInit {
        scheme: String,
        #[source]
        source: BoxError,
    },

    /// Module source responded with a non-success status.
    #[error("unable to download module source {url} ({status}): {reason}")]
    SourceFetchFailed {
        url: String,
        status: StatusCode,
        reason: String,
    },

    /// Protocol handler or body stream failure.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    /// Failure raised by the evaluator, kept as-is for downcasting.
    #[error("evaluation failed: {0}")]
    Evaluation(#[source] BoxError),

    #[error("runtime is already closed")]
    AlreadyClosed,

    #[error("LLM API is disabled")]
    LlmDisabled,

    #[error("LLM service at {base_url} is unreachable, is it installed and running?")]
    ServiceUnreachable {
        base_url: String,
        #[source]
        source: Box<Error>,
    },

    #[error("model {model} is not installed and automatic pull is disabled")]
    AutoPullDisabled { model: String },

    #[error("{context}: {status}: {body}")]
    RequestFailed {
        context: String,
        status: StatusCode,
        body: String,
    },

    #[error("response did not contain any choices")]
    EmptyChoices,

    #[error("malformed {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// One failure observed by every waiter of a single-flight operation.
    #[error(transparent)]
    Shared(Arc<Error>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid_url(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// The underlying error, with any [`Error::Shared`] wrappers removed.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Shared(inner) => inner.root(),
            other => other,
        }
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self.root() {
            Self::DuplicateScheme { .. } => ErrorCategory::Registration,
            Self::InvalidUrl { .. } | Self::UnknownScheme { .. } => ErrorCategory::Routing,
            Self::HandlerInit { .. }
            | Self::SourceFetchFailed { .. }
            | Self::Transport(_)
            | Self::Io(_) => ErrorCategory::Transport,
            Self::Evaluation(_) => ErrorCategory::Evaluation,
            Self::AlreadyClosed => ErrorCategory::Lifecycle,
            Self::LlmDisabled
            | Self::ServiceUnreachable { .. }
            | Self::AutoPullDisabled { .. }
            | Self::RequestFailed { .. }
            | Self::EmptyChoices
            | Self::Decode { .. } => ErrorCategory::Llm,
            Self::Shared(inner) => inner.category(),
        }
    }

    /// The evaluator's own error, if this failure came from evaluation.
    #[must_use]
    pub fn evaluation_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self.root() {
            Self::Evaluation(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
