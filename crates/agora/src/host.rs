use std::{pin::Pin, sync::Arc};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, stream};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use crate::{Error, Result};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type BoxedStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

pub type BodyStream = BoxedStream<core::result::Result<Bytes, BoxError>>;

/// Options of a fetch-shaped request. Unset fields fall back to the
/// transport's defaults (`GET`, no headers, empty body).
#[derive(Debug, Clone, Default)]
pub struct RequestInit {
    pub method: Option<Method>,
    pub headers: Option<HeaderMap>,
    pub body: Option<Bytes>,
}

impl RequestInit {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers
            .get_or_insert_with(HeaderMap::new)
            .insert(name, value);
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Combine with `overrides`; every field set there wins.
    #[must_use]
    pub fn merge(self, overrides: Self) -> Self {
        Self {
            method: overrides.method.or(self.method),
            headers: overrides.headers.or(self.headers),
            body: overrides.body.or(self.body),
        }
    }

    #[must_use]
    pub fn method_or_default(&self) -> Method {
        self.method.clone().unwrap_or(Method::GET)
    }
}

/// A request descriptor: a URL plus its own options.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: String,
    pub init: RequestInit,
}

impl Request {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            init: RequestInit::default(),
        }
    }

    #[must_use]
    pub fn with_init(mut self, init: RequestInit) -> Self {
        self.init = init;
        self
    }
}

#[derive(Debug, Clone)]
pub enum FetchTarget {
    Url(String),
    Request(Request),
}

impl FetchTarget {
    /// Split into a URL and the effective options, with `init` taking
    /// precedence over the descriptor's own fields.
    #[must_use]
    pub fn into_parts(self, init: RequestInit) -> (String, RequestInit) {
        match self {
            Self::Url(url) => (url, init),
            Self::Request(request) => (request.url, request.init.merge(init)),
        }
    }
}

impl From<&str> for FetchTarget {
    fn from(value: &str) -> Self {
        Self::Url(value.to_owned())
    }
}

impl From<String> for FetchTarget {
    fn from(value: String) -> Self {
        Self::Url(value)
    }
}

impl From<&Url> for FetchTarget {
    fn from(value: &Url) -> Self {
        Self::Url(value.as_str().to_owned())
    }
}

impl From<Url> for FetchTarget {
    fn from(value: Url) -> Self {
        Self::Url(value.into())
    }
}

impl From<Request> for FetchTarget {
    fn from(value: Request) -> Self {
        Self::Request(value)
    }
}

pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: BodyStream,
}

impl Response {
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// A response with a fully buffered body.
    #[must_use]
    pub fn from_bytes(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let stream = stream::once(async move { Ok::<_, BoxError>(body) });
        Self::new(status, HeaderMap::new(), Box::pin(stream))
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn into_body(self) -> BodyStream {
        self.body
    }

    /// Read the whole body.
    ///
    /// # Errors
    /// Returns [`Error::Transport`] if the body stream fails.
    pub async fn bytes(self) -> Result<Bytes> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk.map_err(Error::Transport)?);
        }
        Ok(buf.freeze())
    }

    /// Read the whole body as text, replacing invalid UTF-8.
    ///
    /// # Errors
    /// Returns [`Error::Transport`] if the body stream fails.
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// # Errors
    /// Returns [`Error::Decode`] if the body is not valid JSON for `T`.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|source| Error::Decode {
            what: "response body",
            source,
        })
    }
}

impl core::fmt::Debug for Response {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &"<stream>")
            .finish()
    }
}

/// The `fetch` capability handed to scripts and clients.
#[async_trait::async_trait]
pub trait Fetch: Send + Sync + 'static {
    async fn fetch(&self, url: &str, init: RequestInit) -> Result<Response>;
}

#[async_trait::async_trait]
impl<T: Fetch + ?Sized> Fetch for Arc<T> {
    async fn fetch(&self, url: &str, init: RequestInit) -> Result<Response> {
        (**self).fetch(url, init).await
    }
}
