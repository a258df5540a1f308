use std::sync::{Arc, Mutex};

use agora::{BoxError, Error, Request, RequestInit, Response, Runtime, Teardown, protocol_fn};
use anyhow::{Context, Result};
use bytes::Bytes;
use http::{Method, StatusCode};
use url::Url;

use super::common::{MemoryProtocol, TestEvaluator, memory_runtime, offline_config};

#[tokio::test]
async fn close_runs_teardown_once_in_reverse_order() -> Result<()> {
    let order = Arc::new(Mutex::new(Vec::new()));
    let handle = Arc::new(Mutex::new(None::<Teardown>));

    let runtime = {
        let (order, handle) = (order.clone(), handle.clone());
        Runtime::builder()
            .config(offline_config())
            .lazy_protocol("hyper", move |teardown: Teardown| {
                let (order, handle) = (order.clone(), handle.clone());
                async move {
                    for step in ["swarm", "daemon", "storage"] {
                        let order = order.clone();
                        teardown.defer(step, move || async move {
                            order.lock().expect("order lock poisoned").push(step);
                            Ok(())
                        })?;
                    }
                    *handle.lock().expect("handle lock poisoned") = Some(teardown);
                    Ok::<_, BoxError>(protocol_fn(|_url: Url, _init| async {
                        Ok(Response::from_bytes(StatusCode::OK, "peer"))
                    }))
                }
            })
            .build()?
    };

    runtime.fetch("hyper://site/", RequestInit::default()).await?;

    assert!(runtime.close().await);
    assert!(!runtime.close().await);
    assert!(runtime.is_closed());
    assert_eq!(
        *order.lock().expect("order lock poisoned"),
        vec!["storage", "daemon", "swarm"]
    );

    let err = runtime
        .fetch("hyper://site/", RequestInit::default())
        .await
        .expect_err("closed runtime");
    assert!(matches!(err, Error::AlreadyClosed));
    assert!(matches!(runtime.eval("1").await, Err(Error::AlreadyClosed)));
    assert!(matches!(
        runtime.protocols().dispatch("hyper://site/", RequestInit::default()).await,
        Err(Error::AlreadyClosed)
    ));

    let teardown = handle
        .lock()
        .expect("handle lock poisoned")
        .clone()
        .context("initializer ran")?;
    assert!(matches!(
        teardown.defer("late", || async { Ok(()) }),
        Err(Error::AlreadyClosed)
    ));
    Ok(())
}

#[tokio::test]
async fn descriptor_fields_merge_with_init() -> Result<()> {
    let runtime = Runtime::builder()
        .config(offline_config())
        .root(Url::parse("echo://host/base/")?)
        .protocol(
            "echo",
            protocol_fn(|url: Url, init: RequestInit| async move {
                let body = init.body.clone().unwrap_or_else(Bytes::new);
                Ok(Response::from_bytes(
                    StatusCode::OK,
                    format!(
                        "{} {url} {}",
                        init.method_or_default(),
                        String::from_utf8_lossy(&body)
                    ),
                ))
            }),
        )
        .build()?;

    let descriptor = Request::new("item").with_init(
        RequestInit::new()
            .method(Method::PUT)
            .body("from descriptor"),
    );
    let text = runtime
        .fetch(descriptor.clone(), RequestInit::new().method(Method::DELETE))
        .await?
        .text()
        .await?;
    assert_eq!(text, "DELETE echo://host/base/item from descriptor");

    let text = runtime
        .fetch(descriptor, RequestInit::new().body("override"))
        .await?
        .text()
        .await?;
    assert_eq!(text, "PUT echo://host/base/item override");
    Ok(())
}

#[tokio::test]
async fn runtime_is_a_fetch_capability() -> Result<()> {
    use agora::Fetch;

    let files = MemoryProtocol::default().with("data.txt", "hello");
    let runtime = memory_runtime(&files, &TestEvaluator::default());
    let fetch: Arc<dyn Fetch> = Arc::new(runtime.clone());

    let text = fetch
        .fetch("data.txt", RequestInit::default())
        .await?
        .text()
        .await?;
    assert_eq!(text, "hello");
    Ok(())
}
