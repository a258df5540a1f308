use std::io::ErrorKind;

use http::{HeaderValue, Method, StatusCode, header::CONTENT_TYPE};
use url::Url;

use super::Protocol;
use crate::{BoxError, RequestInit, Response};

/// Read-only access to the local filesystem through `file:` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileProtocol;

#[async_trait::async_trait]
impl Protocol for FileProtocol {
    async fn fetch(&self, url: Url, init: RequestInit) -> Result<Response, BoxError> {
        let method = init.method_or_default();
        if method != Method::GET && method != Method::HEAD {
            return Ok(Response::from_bytes(
                StatusCode::METHOD_NOT_ALLOWED,
                format!("{method} is not supported for file URLs"),
            ));
        }

        let Ok(path) = url.to_file_path() else {
            return Ok(Response::from_bytes(
                StatusCode::BAD_REQUEST,
                format!("not a local file URL: {url}"),
            ));
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let body = if method == Method::HEAD { Vec::new() } else { bytes };
                Ok(Response::from_bytes(StatusCode::OK, body)
                    .with_header(CONTENT_TYPE, content_type(&url)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Response::from_bytes(
                StatusCode::NOT_FOUND,
                format!("file not found: {}", path.display()),
            )),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Ok(Response::from_bytes(
                StatusCode::FORBIDDEN,
                format!("permission denied: {}", path.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

fn content_type(url: &Url) -> HeaderValue {
    let ext = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    HeaderValue::from_static(match ext.as_deref() {
        Some("js" | "mjs") => "application/javascript",
        Some("json") => "application/json",
        Some("html" | "htm") => "text/html",
        Some("txt" | "md") => "text/plain",
        _ => "application/octet-stream",
    })
}
