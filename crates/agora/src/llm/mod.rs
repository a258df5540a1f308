//! OpenAI-compatible client for a local or remote language model service.
//!
//! Requests go through a [`Fetch`] capability, so the client works over any
//! registered transport. Before the first generation the client checks that
//! a local service is running and has the configured model, pulling it when
//! the [`PullPolicy`] allows.

pub mod frame;
mod types;

use std::sync::Arc;

use futures::{StreamExt, future};
use http::{
    HeaderValue, Method,
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::OnceCell;
use tracing::{Instrument, debug, info, info_span, warn};

pub use frame::{FrameDecoder, FrameStream};
pub use types::{ChatMessage, ChatRequest, CompletionOptions, Delta, ModelInfo};
use types::{
    Completion, CompletionBody, DeltaChoice, MessageChoice, ModelList, PullBody, TextChoice,
};

use crate::{
    BoxedStream, Error, Fetch, LlmConfig, RequestInit, Response, Result, TRACE_TARGET_LLM,
};

const GENERATE_FAILED: &str = "Unable to generate completion";

/// Where the client is in its startup sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Uninitialized,
    Checking,
    NeedsPull,
    PullConfirmed,
    Pulling,
    Ready,
    Disabled,
    /// The last startup attempt failed. The next call tries again.
    Unavailable,
}

/// Decides whether a missing model may be downloaded.
#[async_trait::async_trait]
pub trait PullPolicy: Send + Sync + 'static {
    async fn confirm_pull(&self, model: &str) -> bool;
}

/// Allows pulling exactly when the `autopull` setting is on.
#[derive(Debug, Clone, Copy)]
pub struct AutoPull(pub bool);

#[async_trait::async_trait]
impl PullPolicy for AutoPull {
    async fn confirm_pull(&self, _model: &str) -> bool {
        self.0
    }
}

pub struct LlmClient {
    config: LlmConfig,
    fetch: Arc<dyn Fetch>,
    policy: Arc<dyn PullPolicy>,
    ready: OnceCell<()>,
    readiness: Mutex<Readiness>,
}

impl LlmClient {
    pub fn new(config: LlmConfig, fetch: Arc<dyn Fetch>) -> Self {
        let policy = Arc::new(AutoPull(config.autopull));
        Self {
            config,
            fetch,
            policy,
            ready: OnceCell::new(),
            readiness: Mutex::new(Readiness::Uninitialized),
        }
    }

    #[must_use]
    pub fn with_pull_policy(mut self, policy: impl PullPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &LlmConfig {
        &self.config
    }

    #[must_use]
    pub fn readiness(&self) -> Readiness {
        *self.readiness.lock()
    }

    /// Whether generation can work, without starting or pulling anything.
    pub async fn is_supported(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        if self.has_model().await {
            return true;
        }
        self.config.is_local_service()
    }

    /// # Errors
    /// Returns [`Error::RequestFailed`] on a non-success status, or the
    /// transport failure.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let response = self
            .send(Method::GET, "./models", None, "Unable to list models")
            .await?;
        let list: ModelList = response.json().await?;
        Ok(list.data)
    }

    /// Whether the configured model is listed. Failures count as absent.
    pub async fn has_model(&self) -> bool {
        match self.list_models().await {
            Ok(models) => models.iter().any(|m| m.id == self.config.model),
            Err(err) => {
                warn!(target: TRACE_TARGET_LLM, error = %err, "Unable to check for model");
                false
            }
        }
    }

    /// # Errors
    /// Startup failures ([`Error::LlmDisabled`], [`Error::ServiceUnreachable`],
    /// [`Error::AutoPullDisabled`]), [`Error::RequestFailed`], or
    /// [`Error::EmptyChoices`] when the reply has no choices.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatMessage> {
        self.ensure_ready().await?;
        let body = self.chat_body(&request, false);
        let completion: Completion<MessageChoice> = self
            .post("./chat/completions", &body, GENERATE_FAILED)
            .await?
            .json()
            .await?;
        completion
            .first()
            .map(|choice| choice.message)
            .ok_or(Error::EmptyChoices)
    }

    /// # Errors
    /// See [`LlmClient::chat`].
    pub async fn complete(&self, prompt: &str, options: CompletionOptions) -> Result<String> {
        self.ensure_ready().await?;
        let body = self.completion_body(prompt, &options, false);
        let completion: Completion<TextChoice> = self
            .post("./completions", &body, GENERATE_FAILED)
            .await?
            .json()
            .await?;
        completion
            .first()
            .map(|choice| choice.text)
            .ok_or(Error::EmptyChoices)
    }

    /// Stream the reply as it is generated. Frames without choices are
    /// skipped.
    ///
    /// # Errors
    /// See [`LlmClient::chat`]. Items fail with [`Error::Decode`] for
    /// malformed frames or [`Error::Transport`] if the body breaks off.
    pub async fn chat_stream(&self, request: ChatRequest) -> Result<BoxedStream<Result<Delta>>> {
        self.ensure_ready().await?;
        let body = self.chat_body(&request, true);
        let response = self.post("./chat/completions", &body, GENERATE_FAILED).await?;
        Ok(first_choices(response, |choice: DeltaChoice| choice.delta))
    }

    /// # Errors
    /// See [`LlmClient::chat_stream`].
    pub async fn complete_stream(
        &self,
        prompt: &str,
        options: CompletionOptions,
    ) -> Result<BoxedStream<Result<String>>> {
        self.ensure_ready().await?;
        let body = self.completion_body(prompt, &options, true);
        let response = self.post("./completions", &body, GENERATE_FAILED).await?;
        Ok(first_choices(response, |choice: TextChoice| choice.text))
    }

    async fn ensure_ready(&self) -> Result<()> {
        if !self.config.enabled {
            self.set_readiness(Readiness::Disabled);
            return Err(Error::LlmDisabled);
        }
        self.ready
            .get_or_try_init(|| self.initialize())
            .await
            .map(|_| ())
    }

    async fn initialize(&self) -> Result<()> {
        if !self.config.is_local_service() {
            self.set_readiness(Readiness::Ready);
            return Ok(());
        }
        let span = info_span!(target: TRACE_TARGET_LLM, "llm.init", llm.model = %self.config.model);
        let result = self.check_local_service().instrument(span).await;
        match &result {
            Ok(()) => self.set_readiness(Readiness::Ready),
            Err(Error::AutoPullDisabled { .. }) => {}
            Err(err) if matches!(err.root(), Error::AlreadyClosed) => {
                self.set_readiness(Readiness::Uninitialized);
            }
            Err(_) => self.set_readiness(Readiness::Unavailable),
        }
        result
    }

    async fn check_local_service(&self) -> Result<()> {
        self.set_readiness(Readiness::Checking);
        let models = self.list_models().await.map_err(|source| {
            if matches!(source.root(), Error::AlreadyClosed) {
                return source;
            }
            Error::ServiceUnreachable {
                base_url: self.config.base_url.clone(),
                source: Box::new(source),
            }
        })?;
        if models.iter().any(|m| m.id == self.config.model) {
            return Ok(());
        }

        self.set_readiness(Readiness::NeedsPull);
        if !self.policy.confirm_pull(&self.config.model).await {
            return Err(Error::AutoPullDisabled {
                model: self.config.model.clone(),
            });
        }
        self.set_readiness(Readiness::PullConfirmed);

        info!(target: TRACE_TARGET_LLM, model = %self.config.model, "Pulling model");
        self.set_readiness(Readiness::Pulling);
        let body = PullBody {
            name: &self.config.model,
        };
        let context = format!("Unable to pull model {}", self.config.model);
        self.post("/api/pull", &body, &context).await?.bytes().await?;
        Ok(())
    }

    fn set_readiness(&self, readiness: Readiness) {
        let mut current = self.readiness.lock();
        if *current != readiness {
            debug!(target: TRACE_TARGET_LLM, from = ?*current, to = ?readiness, "LLM readiness changed");
            *current = readiness;
        }
    }

    fn chat_body<'a>(&'a self, request: &'a ChatRequest, stream: bool) -> CompletionBody<'a> {
        let options = &request.options;
        CompletionBody {
            model: &self.config.model,
            messages: Some(&request.messages),
            prompt: None,
            temperature: options.temperature.unwrap_or(self.config.temperature),
            max_tokens: options.max_tokens,
            stop: options.stop.as_deref(),
            stream,
        }
    }

    fn completion_body<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a CompletionOptions,
        stream: bool,
    ) -> CompletionBody<'a> {
        CompletionBody {
            model: &self.config.model,
            messages: None,
            prompt: Some(prompt),
            temperature: options.temperature.unwrap_or(self.config.temperature),
            max_tokens: options.max_tokens,
            stop: options.stop.as_deref(),
            stream,
        }
    }

    async fn post(&self, path: &str, body: &impl Serialize, context: &str) -> Result<Response> {
        let body = serde_json::to_vec(body).map_err(|source| Error::Decode {
            what: "request body",
            source,
        })?;
        self.send(Method::POST, path, Some(body), context).await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        context: &str,
    ) -> Result<Response> {
        let url = self
            .config
            .base()?
            .join(path)
            .map_err(|e| Error::invalid_url(path, e))?;
        let mut authorization = HeaderValue::try_from(format!("Bearer {}", self.config.api_key))
            .map_err(|e| Error::Transport(e.into()))?;
        authorization.set_sensitive(true);

        let mut init = RequestInit::new()
            .method(method.clone())
            .header(AUTHORIZATION, authorization);
        if let Some(body) = body {
            init = init
                .header(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/json; charset=utf-8"),
                )
                .body(body);
        }

        let span = info_span!(
            target: TRACE_TARGET_LLM,
            "llm.request",
            http.request.method = %method,
            url.path = url.path(),
            llm.model = %self.config.model,
        );
        let response = self.fetch.fetch(url.as_str(), init).instrument(span).await?;
        if !response.ok() {
            let status = response.status();
            let body = response.text().await?;
            return Err(Error::RequestFailed {
                context: context.to_string(),
                status,
                body,
            });
        }
        Ok(response)
    }
}

/// Decode a streaming body and map the first choice of each frame.
fn first_choices<C, T>(response: Response, pick: fn(C) -> T) -> BoxedStream<Result<T>>
where
    C: DeserializeOwned + Send + 'static,
    T: Send + 'static,
{
    FrameStream::<_, Completion<C>>::new(response.into_body())
        .filter_map(move |frame| {
            future::ready(match frame {
                Ok(completion) => completion.first().map(|choice| Ok(pick(choice))),
                Err(err) => Some(Err(err)),
            })
        })
        .boxed()
}
