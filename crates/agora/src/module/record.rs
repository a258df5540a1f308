use std::{
    collections::BTreeMap,
    sync::{Arc, OnceLock},
};

use parking_lot::Mutex;
use url::Url;

/// Export name to exported value.
pub type Namespace = BTreeMap<String, serde_json::Value>;

/// One loaded module. Shared between the cache and every importer.
pub struct ModuleRecord {
    url: Url,
    source: String,
    namespace: OnceLock<Namespace>,
    dependencies: Mutex<Vec<Arc<ModuleRecord>>>,
}

impl ModuleRecord {
    pub(super) fn new(url: Url, source: String) -> Self {
        Self {
            url,
            source,
            namespace: OnceLock::new(),
            dependencies: Mutex::new(Vec::new()),
        }
    }

    /// Normalized URL, the cache key.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Exports, or `None` while the module is still evaluating (only
    /// observable from inside an import cycle).
    #[must_use]
    pub fn namespace(&self) -> Option<&Namespace> {
        self.namespace.get()
    }

    #[must_use]
    pub fn export(&self, name: &str) -> Option<&serde_json::Value> {
        self.namespace()?.get(name)
    }

    #[must_use]
    pub fn is_evaluated(&self) -> bool {
        self.namespace.get().is_some()
    }

    /// Modules imported by this one, in first-import order.
    #[must_use]
    pub fn dependencies(&self) -> Vec<Arc<Self>> {
        self.dependencies.lock().clone()
    }

    pub(super) fn set_namespace(&self, namespace: Namespace) {
        let _ = self.namespace.set(namespace);
    }

    pub(super) fn add_dependency(&self, dependency: Arc<Self>) {
        let mut dependencies = self.dependencies.lock();
        if !dependencies.iter().any(|d| Arc::ptr_eq(d, &dependency)) {
            dependencies.push(dependency);
        }
    }
}

impl core::fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("url", &self.url.as_str())
            .field("evaluated", &self.is_evaluated())
            .field(
                "dependencies",
                &self
                    .dependencies
                    .lock()
                    .iter()
                    .map(|d| d.url.as_str().to_owned())
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}
