use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use http::{Method, header::HOST};
use opentelemetry_semantic_conventions::attribute as trace;
use pin_project_lite::pin_project;
use tracing::Span;
use url::Url;

use super::Error;
use crate::{BoxError, RequestInit, Response};

pub async fn http_impl(
    client: &reqwest::Client,
    url: Url,
    init: RequestInit,
) -> Result<Response, Error> {
    let RequestInit {
        method,
        headers,
        body,
    } = init;
    // Drop caller-supplied `Host` and let the HTTP client set it.
    let mut headers = headers.unwrap_or_default();
    headers.remove(HOST);

    let mut r = client
        .request(method.unwrap_or(Method::GET), url)
        .headers(headers);
    if let Some(body) = body {
        r = r.body(body);
    }

    let span = Span::current();
    let mut resp = match r.send().await {
        Ok(r) => {
            let status = r.status();
            span.record(trace::HTTP_RESPONSE_STATUS_CODE, status.as_u16());
            if status.is_server_error() || status.is_client_error() {
                span.record(trace::OTEL_STATUS_CODE, "ERROR");
            }
            r
        }
        Err(e) => {
            span.record(trace::OTEL_STATUS_CODE, "ERROR");
            return Err(Error::Http(e));
        }
    };

    let status = resp.status();
    let headers = std::mem::take(resp.headers_mut());
    let body = InstrumentStream::new(
        span,
        resp.bytes_stream().map_err(|e| -> BoxError { Box::new(e) }),
    );
    Ok(Response::new(status, headers, Box::pin(body)))
}

pin_project! {
    struct InstrumentStream<S> {
        #[pin]
        stream: S,
        span: tracing::Span,
        size: usize,
    }
}

impl<S> InstrumentStream<S> {
    const fn new(span: Span, stream: S) -> Self {
        Self {
            stream,
            span,
            size: 0,
        }
    }
}

impl<S: Stream<Item = Result<Bytes, E>>, E> Stream for InstrumentStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let span = &this.span;
        let enter = span.enter();
        match this.stream.poll_next(cx) {
            Poll::Ready(None) => {
                span.record(trace::OTEL_STATUS_CODE, "OK");
                span.record(trace::HTTP_RESPONSE_BODY_SIZE, *this.size as u64);
                drop(enter);
                *this.span = tracing::Span::none();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(d))) => {
                *this.size += d.len();
                Poll::Ready(Some(Ok(d)))
            }
            Poll::Ready(Some(Err(e))) => {
                span.record(trace::OTEL_STATUS_CODE, "ERROR");
                drop(enter);
                *this.span = tracing::Span::none();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
