//! Module loading and caching.
//!
//! Every module is keyed by its normalized URL. A load is registered in the
//! in-flight table in the same critical section that found it missing, so
//! concurrent requests for one URL share a single fetch and evaluation.
//!
//! Import cycles are broken with a wait-for graph: before a module waits on
//! an in-flight dependency, the loader checks whether that dependency is
//! (transitively) waiting on the importer. If so the importer receives the
//! dependency's record as-is, before its namespace is populated.

mod record;
mod resolve;

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, OnceLock},
};

use parking_lot::Mutex;
use tracing::{Instrument, debug, info_span};
use url::Url;

pub use record::{ModuleRecord, Namespace};
pub use resolve::resolve;

use crate::{
    BoxError, Error, Fetch, RequestInit, Result, TRACE_TARGET_MODULE,
    flight::{Flight, flight},
    teardown::Teardown,
};

/// The execution environment that turns source text into a namespace.
#[async_trait::async_trait]
pub trait Evaluator: Send + Sync + 'static {
    /// Parse, link and evaluate `module`, loading its imports through
    /// `imports`. For cyclic graphs `imports` may return a record whose
    /// namespace is not populated yet.
    async fn evaluate(
        &self,
        module: Arc<ModuleRecord>,
        imports: ImportResolver,
    ) -> core::result::Result<Namespace, BoxError>;

    /// Run inline script code whose imports resolve against `imports.base()`.
    async fn eval_script(
        &self,
        code: &str,
        imports: ImportResolver,
    ) -> core::result::Result<serde_json::Value, BoxError> {
        let _ = (code, imports);
        Err("this evaluator does not run inline scripts".into())
    }
}

/// Evaluator used when the embedder does not provide one.
pub(crate) struct Unsupported;

#[async_trait::async_trait]
impl Evaluator for Unsupported {
    async fn evaluate(
        &self,
        module: Arc<ModuleRecord>,
        _imports: ImportResolver,
    ) -> core::result::Result<Namespace, BoxError> {
        Err(format!("no evaluator configured to run {}", module.url()).into())
    }
}

/// Import capability handed to the evaluator for one module or script.
#[derive(Clone)]
pub struct ImportResolver {
    loader: ModuleLoader,
    referrer: Option<Arc<ModuleRecord>>,
    base: Url,
}

impl ImportResolver {
    #[must_use]
    pub const fn base(&self) -> &Url {
        &self.base
    }

    /// # Errors
    /// Returns [`Error::InvalidUrl`] if `specifier` cannot be resolved.
    pub fn resolve(&self, specifier: &str) -> Result<Url> {
        resolve(specifier, Some(&self.base))
    }

    /// Load `specifier` relative to the importing module and record it as a
    /// dependency.
    ///
    /// # Errors
    /// Propagates the dependency's load failure.
    pub async fn import(&self, specifier: &str) -> Result<Arc<ModuleRecord>> {
        let url = self.resolve(specifier)?;
        let waiter = self.referrer.as_ref().map(|r| r.url());
        let record = self.loader.load_url(url, waiter).await?;
        if let Some(referrer) = &self.referrer {
            referrer.add_dependency(record.clone());
        }
        Ok(record)
    }
}

struct InFlight {
    flight: Flight<Arc<ModuleRecord>>,
    record: Arc<OnceLock<Arc<ModuleRecord>>>,
}

#[derive(Default)]
struct LoaderState {
    modules: HashMap<Url, Arc<ModuleRecord>>,
    loading: HashMap<Url, InFlight>,
    /// Importer to the in-flight modules it is currently awaiting.
    waits: HashMap<Url, Vec<Url>>,
    /// In-flight module to the modules handed its unevaluated record.
    borrowed: HashMap<Url, HashSet<Url>>,
    /// In-flight modules that must not be cached when they finish.
    stale: HashSet<Url>,
}

impl LoaderState {
    /// Whether `from` is `to`, or is waiting on it through in-flight loads.
    fn waits_on(&self, from: &Url, to: &Url) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(url) = stack.pop() {
            if url == to {
                return true;
            }
            if seen.insert(url) {
                if let Some(targets) = self.waits.get(url) {
                    stack.extend(targets);
                }
            }
        }
        false
    }

    /// Settle the borrowers of `url` once its load finished.
    ///
    /// On success, modules holding `url`'s record now depend on whatever
    /// `url` itself borrowed. On failure they are evicted (or marked stale
    /// while still loading), transitively.
    fn release(&mut self, url: &Url, succeeded: bool) {
        let borrowers = self.borrowed.remove(url).unwrap_or_default();
        if borrowers.is_empty() {
            return;
        }
        if succeeded {
            for holders in self.borrowed.values_mut() {
                if holders.contains(url) {
                    holders.extend(borrowers.iter().cloned());
                }
            }
            return;
        }

        let mut pending: Vec<Url> = borrowers.into_iter().collect();
        while let Some(borrower) = pending.pop() {
            if self.modules.remove(&borrower).is_some() {
                debug!(
                    target: TRACE_TARGET_MODULE,
                    url = %borrower,
                    "evicted module of a failed cycle"
                );
            } else if self.loading.contains_key(&borrower) {
                self.stale.insert(borrower.clone());
            }
            if let Some(more) = self.borrowed.remove(&borrower) {
                pending.extend(more);
            }
        }
    }

    fn remove_wait(&mut self, waiter: &Url, target: &Url) {
        if let Some(targets) = self.waits.get_mut(waiter) {
            if let Some(pos) = targets.iter().position(|t| t == target) {
                targets.swap_remove(pos);
            }
            if targets.is_empty() {
                self.waits.remove(waiter);
            }
        }
    }
}

/// Removes a wait-for edge when the waiting future finishes or is dropped.
struct WaitEdge {
    state: Arc<Mutex<LoaderState>>,
    waiter: Url,
    target: Url,
}

impl Drop for WaitEdge {
    fn drop(&mut self) {
        self.state.lock().remove_wait(&self.waiter, &self.target);
    }
}

enum Lookup {
    Ready(Arc<ModuleRecord>),
    Wait(Flight<Arc<ModuleRecord>>, Option<WaitEdge>),
}

struct LoaderInner {
    fetch: Arc<dyn Fetch>,
    evaluator: Arc<dyn Evaluator>,
    lifecycle: Teardown,
    state: Arc<Mutex<LoaderState>>,
}

#[derive(Clone)]
pub struct ModuleLoader {
    inner: Arc<LoaderInner>,
}

impl ModuleLoader {
    #[must_use]
    pub fn new(fetch: Arc<dyn Fetch>, evaluator: Arc<dyn Evaluator>, lifecycle: Teardown) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                fetch,
                evaluator,
                lifecycle,
                state: Arc::default(),
            }),
        }
    }

    /// Load an absolute module URL, returning the cached record when present.
    ///
    /// # Errors
    /// - [`Error::InvalidUrl`] if `url` is not absolute.
    /// - [`Error::SourceFetchFailed`] on a non-success response.
    /// - [`Error::Evaluation`] if the evaluator fails.
    /// - [`Error::AlreadyClosed`] after the runtime closed.
    ///
    /// Failures reaching several waiters are wrapped in [`Error::Shared`].
    pub async fn load(&self, url: &str) -> Result<Arc<ModuleRecord>> {
        self.load_url(resolve(url, None)?, None).await
    }

    /// Load `url` and return a snapshot of its exports.
    ///
    /// # Errors
    /// See [`ModuleLoader::load`].
    pub async fn import_top_level(&self, url: &str) -> Result<Namespace> {
        let record = self.load(url).await?;
        Ok(record.namespace().cloned().unwrap_or_default())
    }

    /// Resolver for inline scripts, whose imports resolve against `base`.
    #[must_use]
    pub fn script_resolver(&self, base: Url) -> ImportResolver {
        ImportResolver {
            loader: self.clone(),
            referrer: None,
            base,
        }
    }

    #[must_use]
    pub fn evaluator(&self) -> &Arc<dyn Evaluator> {
        &self.inner.evaluator
    }

    /// Whether a completed record exists for `url` (fragment ignored).
    #[must_use]
    pub fn is_cached(&self, url: &str) -> bool {
        resolve(url, None).is_ok_and(|url| self.inner.state.lock().modules.contains_key(&url))
    }

    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.inner.state.lock().modules.len()
    }

    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.inner.state.lock().loading.len()
    }

    async fn load_url(&self, url: Url, waiter: Option<&Url>) -> Result<Arc<ModuleRecord>> {
        self.inner.lifecycle.ensure_open()?;
        let lookup = {
            let mut state = self.inner.state.lock();
            if let Some(record) = state.modules.get(&url) {
                debug!(target: TRACE_TARGET_MODULE, %url, "module cache hit");
                Lookup::Ready(record.clone())
            } else {
                let existing = state
                    .loading
                    .get(&url)
                    .map(|in_flight| (in_flight.flight.clone(), in_flight.record.get().cloned()));
                let flight = match existing {
                    Some((flight, partial)) => {
                        let cyclic = waiter.filter(|w| state.waits_on(&url, w));
                        if let (Some(waiter), Some(record)) = (cyclic, partial) {
                            state
                                .borrowed
                                .entry(url.clone())
                                .or_default()
                                .insert(waiter.clone());
                            debug!(
                                target: TRACE_TARGET_MODULE,
                                %url,
                                "import cycle, using partial module"
                            );
                            return Ok(record);
                        }
                        flight
                    }
                    None => {
                        let record = Arc::new(OnceLock::new());
                        let work = self.clone().fetch_and_evaluate(url.clone(), record.clone());
                        let flight = flight(work);
                        state.loading.insert(
                            url.clone(),
                            InFlight {
                                flight: flight.clone(),
                                record,
                            },
                        );
                        flight
                    }
                };
                let edge = waiter.map(|waiter| {
                    state
                        .waits
                        .entry(waiter.clone())
                        .or_default()
                        .push(url.clone());
                    WaitEdge {
                        state: self.inner.state.clone(),
                        waiter: waiter.clone(),
                        target: url.clone(),
                    }
                });
                Lookup::Wait(flight, edge)
            }
        };

        match lookup {
            Lookup::Ready(record) => Ok(record),
            Lookup::Wait(flight, edge) => {
                let result = flight.await.map_err(Error::Shared);
                drop(edge);
                result
            }
        }
    }

    async fn fetch_and_evaluate(
        self,
        url: Url,
        slot: Arc<OnceLock<Arc<ModuleRecord>>>,
    ) -> Result<Arc<ModuleRecord>> {
        let span = info_span!(target: TRACE_TARGET_MODULE, "module.load", url = %url);
        let result = self.load_source(&url, &slot).instrument(span).await;

        let mut state = self.inner.state.lock();
        state.loading.remove(&url);
        let stale = state.stale.remove(&url);
        state.release(&url, result.is_ok() && !stale);
        if let (Ok(record), false) = (&result, stale) {
            state.modules.insert(url, record.clone());
        }
        result
    }

    async fn load_source(
        &self,
        url: &Url,
        slot: &OnceLock<Arc<ModuleRecord>>,
    ) -> Result<Arc<ModuleRecord>> {
        self.inner.lifecycle.ensure_open()?;
        let response = self
            .inner
            .fetch
            .fetch(url.as_str(), RequestInit::default())
            .await?;
        if !response.ok() {
            let status = response.status();
            let reason = response.text().await?;
            return Err(Error::SourceFetchFailed {
                url: url.to_string(),
                status,
                reason,
            });
        }
        let source = response.text().await?;

        let record = Arc::new(ModuleRecord::new(url.clone(), source));
        let _ = slot.set(record.clone());
        let imports = ImportResolver {
            loader: self.clone(),
            referrer: Some(record.clone()),
            base: url.clone(),
        };
        let namespace = self
            .inner
            .evaluator
            .evaluate(record.clone(), imports)
            .await
            .map_err(Error::Evaluation)?;
        record.set_namespace(namespace);
        debug!(target: TRACE_TARGET_MODULE, %url, "module evaluated");
        Ok(record)
    }
}
