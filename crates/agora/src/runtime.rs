use std::sync::Arc;

use tracing::{Instrument, info, info_span};
use url::Url;

use crate::{
    BoxError, Config, Error, Evaluator, Fetch, FetchTarget, LlmClient, ModuleLoader, ModuleRecord,
    Namespace, Protocol, ProtocolRegistry, RequestInit, Response, Result, TRACE_TARGET_MODULE,
    module::Unsupported,
    protocol::FileProtocol,
    teardown::Teardown,
};

type Registration = Box<dyn FnOnce(&ProtocolRegistry) -> Result<()> + Send>;

/// Assembles a [`Runtime`]: configuration, evaluator and extra protocols.
#[derive(Default)]
pub struct RuntimeBuilder {
    config: Config,
    root: Option<Url>,
    evaluator: Option<Arc<dyn Evaluator>>,
    registrations: Vec<Registration>,
}

impl RuntimeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Base for relative URLs, overriding `Config::root`.
    #[must_use]
    pub fn root(mut self, root: Url) -> Self {
        self.root = Some(root);
        self
    }

    #[must_use]
    pub fn evaluator(mut self, evaluator: impl Evaluator) -> Self {
        self.evaluator = Some(Arc::new(evaluator));
        self
    }

    #[must_use]
    pub fn protocol(mut self, scheme: impl Into<String>, handler: impl Protocol) -> Self {
        let scheme = scheme.into();
        self.registrations.push(Box::new(move |registry: &ProtocolRegistry| {
            registry.register(&scheme, handler)
        }));
        self
    }

    /// See [`ProtocolRegistry::register_lazy`].
    #[must_use]
    pub fn lazy_protocol<F, Fut, P>(mut self, scheme: impl Into<String>, init: F) -> Self
    where
        F: Fn(Teardown) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = core::result::Result<P, BoxError>> + Send + 'static,
        P: Protocol,
    {
        let scheme = scheme.into();
        self.registrations.push(Box::new(move |registry: &ProtocolRegistry| {
            registry.register_lazy(&scheme, init)
        }));
        self
    }

    #[must_use]
    pub fn alias(mut self, existing: impl Into<String>, new: impl Into<String>) -> Self {
        let (existing, new) = (existing.into(), new.into());
        self.registrations.push(Box::new(move |registry: &ProtocolRegistry| {
            registry.alias(&existing, &new)
        }));
        self
    }

    /// # Errors
    /// - [`Error::DuplicateScheme`] if two protocols claim one scheme.
    /// - [`Error::InvalidUrl`] if the root cannot be turned into a URL.
    /// - [`Error::HandlerInit`] if the HTTP client cannot be created.
    pub fn build(self) -> Result<Runtime> {
        let Self {
            config,
            root,
            evaluator,
            registrations,
        } = self;
        let root = match root {
            Some(root) => root,
            None => config.root_url()?,
        };

        let teardown = Teardown::new();
        let protocols = Arc::new(ProtocolRegistry::new(teardown.clone()));
        register_builtin(&protocols, &config)?;
        for registration in registrations {
            registration(&protocols)?;
        }

        let evaluator = evaluator.unwrap_or_else(|| Arc::new(Unsupported));
        let modules = ModuleLoader::new(protocols.clone(), evaluator, teardown.clone());
        let llm = LlmClient::new(config.llm, protocols.clone());

        info!(
            root = %root,
            schemes = ?protocols.schemes(),
            "Runtime ready"
        );
        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                root,
                protocols,
                modules,
                llm,
                teardown,
            }),
        })
    }
}

#[cfg(feature = "request")]
fn register_builtin(protocols: &ProtocolRegistry, config: &Config) -> Result<()> {
    use crate::request::{HttpClient, RequestConfig};

    let enabled = config.protocols;
    if enabled.http || enabled.https {
        let mut request = RequestConfig::default();
        if let Some(proxy) = &config.proxy {
            request = request.with_proxy(proxy);
        }
        let client = Arc::new(HttpClient::new(&request).map_err(|e| Error::HandlerInit {
            scheme: "http".to_string(),
            source: Box::new(e),
        })?);
        if enabled.http {
            protocols.register_shared("http", client.clone())?;
        }
        if enabled.https {
            protocols.register_shared("https", client)?;
        }
    }
    if enabled.file {
        protocols.register("file", FileProtocol)?;
    }
    Ok(())
}

#[cfg(not(feature = "request"))]
fn register_builtin(protocols: &ProtocolRegistry, config: &Config) -> Result<()> {
    if config.protocols.file {
        protocols.register("file", FileProtocol)?;
    }
    Ok(())
}

struct RuntimeInner {
    root: Url,
    protocols: Arc<ProtocolRegistry>,
    modules: ModuleLoader,
    llm: LlmClient,
    teardown: Teardown,
}

/// One session: a protocol registry, a module cache and an LLM client that
/// share a root URL and a lifecycle.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    #[must_use]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    #[must_use]
    pub fn root(&self) -> &Url {
        &self.inner.root
    }

    /// The registry, for registering protocols after construction.
    #[must_use]
    pub fn protocols(&self) -> &Arc<ProtocolRegistry> {
        &self.inner.protocols
    }

    #[must_use]
    pub fn modules(&self) -> &ModuleLoader {
        &self.inner.modules
    }

    #[must_use]
    pub fn llm(&self) -> &LlmClient {
        &self.inner.llm
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.teardown.is_closed()
    }

    /// Fetch a URL or request descriptor. Fields set in `init` override the
    /// descriptor's; relative URLs resolve against the root.
    ///
    /// # Errors
    /// See [`ProtocolRegistry::dispatch`].
    pub async fn fetch(
        &self,
        target: impl Into<FetchTarget>,
        init: RequestInit,
    ) -> Result<Response> {
        let (url, init) = target.into().into_parts(init);
        let url = self.resolve_url(&url)?;
        self.inner.protocols.dispatch(url.as_str(), init).await
    }

    /// Load a module and return its exports.
    ///
    /// # Errors
    /// See [`ModuleLoader::load`].
    pub async fn import(&self, specifier: &str) -> Result<Namespace> {
        let record = self.import_module(specifier).await?;
        Ok(record.namespace().cloned().unwrap_or_default())
    }

    /// # Errors
    /// See [`ModuleLoader::load`].
    pub async fn import_module(&self, specifier: &str) -> Result<Arc<ModuleRecord>> {
        let url = self.resolve_url(specifier)?;
        self.inner.modules.load(url.as_str()).await
    }

    /// Run inline code. Its imports resolve against the root.
    ///
    /// # Errors
    /// [`Error::AlreadyClosed`] after close, or [`Error::Evaluation`] with the
    /// evaluator's own error.
    pub async fn eval(&self, code: &str) -> Result<serde_json::Value> {
        self.inner.teardown.ensure_open()?;
        let mut base = self.inner.root.clone();
        base.set_fragment(Some("eval"));
        let span = info_span!(target: TRACE_TARGET_MODULE, "runtime.eval", url = %base);
        let imports = self.inner.modules.script_resolver(base);
        self.inner
            .modules
            .evaluator()
            .eval_script(code, imports)
            .instrument(span)
            .await
            .map_err(Error::Evaluation)
    }

    /// Stop accepting work and run teardown actions, newest first. Only the
    /// first call does anything; it returns `true`.
    pub async fn close(&self) -> bool {
        let closed = self.inner.teardown.close().await;
        if closed {
            info!("Runtime closed");
        }
        closed
    }

    fn resolve_url(&self, url: &str) -> Result<Url> {
        self.inner.teardown.ensure_open()?;
        if url.trim().is_empty() {
            return Err(Error::invalid_url(url, "empty URL"));
        }
        self.inner
            .root
            .join(url)
            .map_err(|e| Error::invalid_url(url, e))
    }
}

#[async_trait::async_trait]
impl Fetch for Runtime {
    async fn fetch(&self, url: &str, init: RequestInit) -> Result<Response> {
        Self::fetch(self, url, init).await
    }
}
