use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use agora::{
    BoxError, Config, Evaluator, ImportResolver, ModuleRecord, Namespace, Protocol,
    ProtocolsConfig, RequestInit, Response, Runtime,
};
use async_trait::async_trait;
use http::StatusCode;
use url::Url;

pub(crate) const ROOT: &str = "mem://site/";

/// Failure raised by a `throw` line.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub(crate) struct ScriptError(pub String);

/// Line-oriented toy language:
///
/// ```text
/// import <specifier>
/// export <name> = <json>
/// export <name> from <specifier>
/// sleep <millis>
/// throw <message>
/// ```
///
/// Inline scripts accept `import <specifier>` (result: that module's exports)
/// and bare JSON (result: the value).
#[derive(Clone, Default)]
pub(crate) struct TestEvaluator {
    evaluations: Arc<Mutex<HashMap<String, usize>>>,
}

impl TestEvaluator {
    pub(crate) fn evaluations(&self, url: &str) -> usize {
        self.evaluations
            .lock()
            .expect("evaluation counter poisoned")
            .get(url)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Evaluator for TestEvaluator {
    async fn evaluate(
        &self,
        module: Arc<ModuleRecord>,
        imports: ImportResolver,
    ) -> std::result::Result<Namespace, BoxError> {
        *self
            .evaluations
            .lock()
            .expect("evaluation counter poisoned")
            .entry(module.url().to_string())
            .or_default() += 1;

        let mut namespace = Namespace::new();
        for line in module.source().lines().map(str::trim) {
            if let Some(specifier) = line.strip_prefix("import ") {
                imports.import(specifier).await?;
            } else if let Some(millis) = line.strip_prefix("sleep ") {
                tokio::time::sleep(Duration::from_millis(millis.parse()?)).await;
            } else if let Some(message) = line.strip_prefix("throw ") {
                return Err(ScriptError(message.to_string()).into());
            } else if let Some(rest) = line.strip_prefix("export ") {
                if let Some((name, json)) = rest.split_once(" = ") {
                    namespace.insert(name.to_string(), serde_json::from_str(json)?);
                } else if let Some((name, specifier)) = rest.split_once(" from ") {
                    let dependency = imports.import(specifier).await?;
                    let value = dependency.export(name).cloned().unwrap_or_default();
                    namespace.insert(name.to_string(), value);
                }
            }
        }
        Ok(namespace)
    }

    async fn eval_script(
        &self,
        code: &str,
        imports: ImportResolver,
    ) -> std::result::Result<serde_json::Value, BoxError> {
        let mut result = serde_json::Value::Null;
        for line in code.lines().map(str::trim).filter(|l| !l.is_empty()) {
            result = match line.strip_prefix("import ") {
                Some(specifier) => {
                    let module = imports.import(specifier).await?;
                    serde_json::to_value(module.namespace().cloned().unwrap_or_default())?
                }
                None => serde_json::from_str(line)?,
            };
        }
        Ok(result)
    }
}

#[derive(Default)]
struct Files {
    bodies: HashMap<String, (StatusCode, String)>,
    fetches: HashMap<String, usize>,
}

/// In-memory `mem:` transport with per-URL fetch counters.
#[derive(Clone, Default)]
pub(crate) struct MemoryProtocol {
    files: Arc<Mutex<Files>>,
}

impl MemoryProtocol {
    pub(crate) fn with(self, path: &str, source: &str) -> Self {
        self.set(path, StatusCode::OK, source);
        self
    }

    pub(crate) fn set(&self, path: &str, status: StatusCode, body: &str) {
        self.files
            .lock()
            .expect("memory files poisoned")
            .bodies
            .insert(url(path), (status, body.to_string()));
    }

    pub(crate) fn fetches(&self, path: &str) -> usize {
        self.files
            .lock()
            .expect("memory files poisoned")
            .fetches
            .get(&url(path))
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Protocol for MemoryProtocol {
    async fn fetch(
        &self,
        url: Url,
        _init: RequestInit,
    ) -> std::result::Result<Response, BoxError> {
        let entry = {
            let mut files = self.files.lock().expect("memory files poisoned");
            *files.fetches.entry(url.to_string()).or_default() += 1;
            files.bodies.get(url.as_str()).cloned()
        };
        tokio::task::yield_now().await;
        let (status, body) =
            entry.unwrap_or_else(|| (StatusCode::NOT_FOUND, format!("{url} not found")));
        Ok(Response::from_bytes(status, body))
    }
}

/// Absolute `mem:` URL for a path relative to [`ROOT`].
pub(crate) fn url(path: &str) -> String {
    format!("{ROOT}{}", path.trim_start_matches('/'))
}

/// Config with every built-in transport turned off.
pub(crate) fn offline_config() -> Config {
    Config {
        protocols: ProtocolsConfig {
            http: false,
            https: false,
            file: false,
        },
        ..Config::default()
    }
}

pub(crate) fn memory_runtime(files: &MemoryProtocol, evaluator: &TestEvaluator) -> Runtime {
    Runtime::builder()
        .config(offline_config())
        .root(Url::parse(ROOT).expect("valid root"))
        .protocol("mem", files.clone())
        .evaluator(evaluator.clone())
        .build()
        .expect("failed to build runtime")
}
