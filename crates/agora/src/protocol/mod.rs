//! Scheme-keyed routing for every outbound request.
//!
//! Each scheme slot holds one of three entries:
//!
//! - a direct handler, used as-is;
//! - a lazy handler, whose initializer runs on the first dispatch and whose
//!   result (success or failure) is shared by every caller from then on;
//! - an alias, resolved against the target scheme at dispatch time, so an
//!   alias of a lazy scheme follows it once it has started.

mod file;

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};

use futures::{FutureExt, TryFutureExt, future::BoxFuture};
use parking_lot::RwLock;
use tracing::{Instrument, debug, info, info_span};
use url::Url;

pub use file::FileProtocol;

use crate::{
    BoxError, Error, Fetch, RequestInit, Response, Result, TRACE_TARGET_PROTOCOL,
    flight::{Flight, flight},
    teardown::Teardown,
};

/// Alias chains longer than this are treated as unresolvable.
const MAX_ALIAS_DEPTH: usize = 16;

#[async_trait::async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// Answer one fetch-shaped request. `url` always has this protocol's scheme.
    async fn fetch(&self, url: Url, init: RequestInit) -> core::result::Result<Response, BoxError>;
}

#[async_trait::async_trait]
impl<T: Protocol + ?Sized> Protocol for Arc<T> {
    async fn fetch(&self, url: Url, init: RequestInit) -> core::result::Result<Response, BoxError> {
        (**self).fetch(url, init).await
    }
}

pub struct FnProtocol<F>(F);

/// Wrap an async closure as a [`Protocol`].
pub const fn protocol_fn<F, Fut>(f: F) -> FnProtocol<F>
where
    F: Fn(Url, RequestInit) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = core::result::Result<Response, BoxError>> + Send + 'static,
{
    FnProtocol(f)
}

#[async_trait::async_trait]
impl<F, Fut> Protocol for FnProtocol<F>
where
    F: Fn(Url, RequestInit) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = core::result::Result<Response, BoxError>> + Send + 'static,
{
    async fn fetch(&self, url: Url, init: RequestInit) -> core::result::Result<Response, BoxError> {
        (self.0)(url, init).await
    }
}

type Handler = Arc<dyn Protocol>;

type Initializer =
    Box<dyn Fn(Teardown) -> BoxFuture<'static, core::result::Result<Handler, BoxError>> + Send + Sync>;

struct LazySlot {
    init: Initializer,
    handler: OnceLock<Flight<Handler>>,
}

impl LazySlot {
    async fn resolve(&self, scheme: &str, teardown: &Teardown) -> Result<Handler> {
        let handler = self
            .handler
            .get_or_init(|| {
                info!(target: TRACE_TARGET_PROTOCOL, scheme, "initializing lazy protocol");
                let scheme = scheme.to_owned();
                let work = (self.init)(teardown.clone());
                flight(work.map_err(move |source| Error::HandlerInit { scheme, source }))
            })
            .clone();
        handler.await.map_err(Error::Shared)
    }
}

enum Entry {
    Direct(Handler),
    Lazy(Arc<LazySlot>),
    Alias(String),
}

enum Step {
    Ready(Handler),
    Lazy(Arc<LazySlot>),
    Follow(String),
}

pub struct ProtocolRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    teardown: Teardown,
}

impl ProtocolRegistry {
    /// Create an empty registry. Lazy initializers receive `teardown` to
    /// register cleanup for whatever state they allocate.
    #[must_use]
    pub fn new(teardown: Teardown) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            teardown,
        }
    }

    fn insert(&self, scheme: &str, entry: Entry) -> Result<()> {
        let scheme = normalize_scheme(scheme);
        let mut entries = self.entries.write();
        if entries.contains_key(&scheme) {
            return Err(Error::DuplicateScheme { scheme });
        }
        debug!(target: TRACE_TARGET_PROTOCOL, %scheme, "registered protocol");
        entries.insert(scheme, entry);
        Ok(())
    }

    /// # Errors
    /// Returns [`Error::DuplicateScheme`] if `scheme` is taken.
    pub fn register(&self, scheme: &str, handler: impl Protocol) -> Result<()> {
        self.insert(scheme, Entry::Direct(Arc::new(handler)))
    }

    /// # Errors
    /// Returns [`Error::DuplicateScheme`] if `scheme` is taken.
    pub fn register_shared(&self, scheme: &str, handler: Arc<dyn Protocol>) -> Result<()> {
        self.insert(scheme, Entry::Direct(handler))
    }

    /// Register a handler built on first use. `init` runs at most once.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateScheme`] if `scheme` is taken.
    pub fn register_lazy<F, Fut, P>(&self, scheme: &str, init: F) -> Result<()>
    where
        F: Fn(Teardown) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = core::result::Result<P, BoxError>> + Send + 'static,
        P: Protocol,
    {
        let init: Initializer = Box::new(move |teardown| {
            init(teardown)
                .map_ok(|handler| Arc::new(handler) as Handler)
                .boxed()
        });
        self.insert(
            scheme,
            Entry::Lazy(Arc::new(LazySlot {
                init,
                handler: OnceLock::new(),
            })),
        )
    }

    /// Make `new` answer with whatever `existing` resolves to at dispatch time.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateScheme`] if `new` is taken.
    pub fn alias(&self, existing: &str, new: &str) -> Result<()> {
        self.insert(new, Entry::Alias(normalize_scheme(existing)))
    }

    #[must_use]
    pub fn contains(&self, scheme: &str) -> bool {
        self.entries.read().contains_key(&normalize_scheme(scheme))
    }

    #[must_use]
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<_> = self.entries.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }

    async fn resolve(&self, scheme: &str) -> Result<Handler> {
        let requested = normalize_scheme(scheme);
        let mut current = requested.clone();
        for _ in 0..=MAX_ALIAS_DEPTH {
            let step = match self.entries.read().get(&current) {
                Some(Entry::Direct(handler)) => Step::Ready(handler.clone()),
                Some(Entry::Lazy(slot)) => Step::Lazy(slot.clone()),
                Some(Entry::Alias(target)) => Step::Follow(target.clone()),
                None => break,
            };
            match step {
                Step::Ready(handler) => return Ok(handler),
                Step::Lazy(slot) => return slot.resolve(&current, &self.teardown).await,
                Step::Follow(target) => current = target,
            }
        }
        Err(Error::UnknownScheme { scheme: requested })
    }

    /// Route `url` to the handler registered for its scheme.
    ///
    /// # Errors
    /// - [`Error::AlreadyClosed`] after the owning runtime closed.
    /// - [`Error::InvalidUrl`] if `url` is not an absolute URL.
    /// - [`Error::UnknownScheme`] if nothing answers for the scheme.
    /// - [`Error::HandlerInit`] if a lazy handler failed to start.
    /// - [`Error::Transport`] for handler failures.
    pub async fn dispatch(&self, url: &str, init: RequestInit) -> Result<Response> {
        self.teardown.ensure_open()?;
        let parsed = Url::parse(url).map_err(|e| Error::invalid_url(url, e))?;
        let handler = self.resolve(parsed.scheme()).await?;

        let span = info_span!(
            target: TRACE_TARGET_PROTOCOL,
            "protocol.dispatch",
            url.scheme = parsed.scheme(),
            http.request.method = %init.method_or_default(),
        );
        handler
            .fetch(parsed, init)
            .instrument(span)
            .await
            .map_err(Error::Transport)
    }
}

#[async_trait::async_trait]
impl Fetch for ProtocolRegistry {
    async fn fetch(&self, url: &str, init: RequestInit) -> Result<Response> {
        self.dispatch(url, init).await
    }
}

fn normalize_scheme(scheme: &str) -> String {
    scheme.trim_end_matches(':').to_ascii_lowercase()
}
