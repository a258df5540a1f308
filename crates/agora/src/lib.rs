mod flight;

pub mod config;
pub mod error;
pub mod host;
pub mod llm;
pub mod module;
pub mod protocol;
#[cfg(feature = "request")]
pub mod request;
pub mod runtime;
pub mod teardown;

pub const TRACE_TARGET_PROTOCOL: &str = "agora::protocol";
pub const TRACE_TARGET_MODULE: &str = "agora::module";
pub const TRACE_TARGET_LLM: &str = "agora::llm";

pub use config::{Config, LlmConfig, ProtocolsConfig};
pub use error::{Error, ErrorCategory, Result};
pub use host::{
    BodyStream, BoxError, BoxedStream, Fetch, FetchTarget, Request, RequestInit, Response,
};
pub use llm::{ChatMessage, ChatRequest, CompletionOptions, Delta, LlmClient, Readiness};
pub use module::{Evaluator, ImportResolver, ModuleLoader, ModuleRecord, Namespace};
pub use protocol::{Protocol, ProtocolRegistry, protocol_fn};
pub use runtime::{Runtime, RuntimeBuilder};
pub use teardown::Teardown;
