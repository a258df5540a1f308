use std::sync::Arc;

use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{BoxError, Error, Result};

type Action = Box<dyn FnOnce() -> BoxFuture<'static, core::result::Result<(), BoxError>> + Send>;

#[derive(Default)]
struct State {
    closed: bool,
    actions: Vec<(String, Action)>,
}

/// Shutdown bookkeeping shared by a runtime and its lazy backends.
///
/// Actions run once, newest first, on the first [`Teardown::close`].
#[derive(Clone, Default)]
pub struct Teardown {
    state: Arc<Mutex<State>>,
}

impl Teardown {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup action.
    ///
    /// After [`Teardown::close`] has started the action is not queued.
    /// It is spawned on the current tokio runtime right away instead, so a
    /// backend that finishes starting during shutdown still releases what it
    /// acquired. Without a runtime it is dropped with a warning.
    ///
    /// # Errors
    /// Returns [`Error::AlreadyClosed`] once [`Teardown::close`] has started.
    pub fn defer<F, Fut>(&self, name: impl Into<String>, action: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = core::result::Result<(), BoxError>> + Send + 'static,
    {
        let name = name.into();
        {
            let mut state = self.state.lock();
            if !state.closed {
                state.actions.push((name, Box::new(move || action().boxed())));
                return Ok(());
            }
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(action = %name, "running teardown action registered after close");
                handle.spawn(async move {
                    if let Err(err) = action().await {
                        warn!(action = %name, error = %err, "teardown action failed");
                    }
                });
            }
            Err(_) => warn!(action = %name, "dropping teardown action registered after close"),
        }
        Err(Error::AlreadyClosed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// # Errors
    /// Returns [`Error::AlreadyClosed`] after close.
    pub fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::AlreadyClosed)
        } else {
            Ok(())
        }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().actions.len()
    }

    /// Mark closed and run the registered actions in reverse order.
    ///
    /// Returns `false` without doing anything if already closed. A failing
    /// action is logged and does not stop the ones registered before it.
    pub async fn close(&self) -> bool {
        let actions = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            std::mem::take(&mut state.actions)
        };

        for (name, action) in actions.into_iter().rev() {
            debug!(action = %name, "running teardown action");
            if let Err(err) = action().await {
                warn!(action = %name, error = %err, "teardown action failed");
            }
        }
        true
    }
}
