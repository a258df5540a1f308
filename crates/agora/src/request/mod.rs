//! `http:` and `https:` transport backed by `reqwest`.

mod config;
mod error;
mod http;

use tracing::{Instrument, field::Empty, info_span};
use url::Url;

pub use config::RequestConfig;
pub use error::Error;

use crate::{BoxError, RequestInit, Response, TRACE_TARGET_PROTOCOL, protocol::Protocol};

#[derive(Clone)]
pub struct HttpClient {
    http: reqwest::Client,
}

impl HttpClient {
    /// # Errors
    /// Returns an error if the proxy setting is invalid or the TLS backend
    /// cannot be initialised.
    pub fn new(config: &RequestConfig) -> Result<Self, Error> {
        Ok(Self {
            http: config.build_client()?,
        })
    }
}

#[async_trait::async_trait]
impl Protocol for HttpClient {
    async fn fetch(&self, url: Url, init: RequestInit) -> Result<Response, BoxError> {
        let span = info_span!(
            target: TRACE_TARGET_PROTOCOL,
            "http.request",
            http.request.method = %init.method_or_default(),
            url.full = %url,
            http.response.status_code = Empty,
            http.response.body.size = Empty,
            otel.status_code = Empty,
        );
        http::http_impl(&self.http, url, init)
            .instrument(span)
            .await
            .map_err(Into::into)
    }
}
