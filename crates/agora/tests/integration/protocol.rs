use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use agora::{
    BoxError, Error, ErrorCategory, Protocol, ProtocolRegistry, Request, RequestInit, Response,
    Runtime, Teardown, protocol_fn,
};
use anyhow::{Context, Result};
use futures::future::join_all;
use http::{
    HeaderValue, Method, StatusCode,
    header::{CONTENT_TYPE, HOST},
};
use url::Url;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_string, header, method, path},
};

use super::common::offline_config;

fn tagged(tag: &'static str) -> impl Protocol {
    protocol_fn(move |url: Url, _init| async move {
        Ok(Response::from_bytes(
            StatusCode::OK,
            format!("{tag}:{}", url.path()),
        ))
    })
}

async fn body(registry: &ProtocolRegistry, url: &str) -> Result<String> {
    Ok(registry
        .dispatch(url, RequestInit::default())
        .await
        .with_context(|| format!("dispatch {url}"))?
        .text()
        .await?)
}

#[tokio::test]
async fn duplicate_registration_keeps_the_first_handler() -> Result<()> {
    let registry = ProtocolRegistry::new(Teardown::new());
    registry.register("hyper", tagged("first"))?;

    let err = registry
        .register("hyper", tagged("second"))
        .expect_err("second registration must fail");
    assert!(matches!(&err, Error::DuplicateScheme { scheme } if scheme == "hyper"));
    assert_eq!(err.category(), ErrorCategory::Registration);

    assert_eq!(body(&registry, "hyper://blog/post").await?, "first:/post");
    Ok(())
}

#[tokio::test]
async fn alias_answers_like_its_target() -> Result<()> {
    let registry = ProtocolRegistry::new(Teardown::new());
    registry.register("ipfs", tagged("ipfs"))?;
    registry.alias("ipfs", "ipns")?;

    assert_eq!(
        body(&registry, "ipns://key/file.txt").await?,
        body(&registry, "ipfs://key/file.txt").await?
    );
    Ok(())
}

#[tokio::test]
async fn alias_follows_a_lazy_handler_registered_later() -> Result<()> {
    let registry = ProtocolRegistry::new(Teardown::new());
    registry.alias("hyper", "dat")?;
    registry.register_lazy("hyper", |_teardown| async {
        Ok::<_, BoxError>(tagged("hyper"))
    })?;

    assert_eq!(
        body(&registry, "dat://site/index.html").await?,
        "hyper:/index.html"
    );
    Ok(())
}

#[tokio::test]
async fn unknown_scheme_is_a_routing_error() -> Result<()> {
    let registry = ProtocolRegistry::new(Teardown::new());
    registry.alias("hyper", "dat")?;

    for url in ["gopher://host/", "dat://site/"] {
        let err = registry
            .dispatch(url, RequestInit::default())
            .await
            .expect_err("nothing answers");
        assert!(matches!(err, Error::UnknownScheme { .. }), "{url}: {err}");
        assert_eq!(err.category(), ErrorCategory::Routing);
    }
    Ok(())
}

#[tokio::test]
async fn lazy_initializer_runs_once_for_concurrent_callers() -> Result<()> {
    let registry = ProtocolRegistry::new(Teardown::new());
    let starts = Arc::new(AtomicUsize::new(0));
    {
        let starts = starts.clone();
        registry.register_lazy("hyper", move |_teardown| {
            let starts = starts.clone();
            async move {
                starts.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, BoxError>(tagged("hyper"))
            }
        })?;
    }
    assert_eq!(starts.load(Ordering::SeqCst), 0, "initializer must wait for use");

    let results = join_all((0..8).map(|i| {
        let registry = &registry;
        async move { body(registry, &format!("hyper://site/{i}")).await }
    }))
    .await;

    assert_eq!(starts.load(Ordering::SeqCst), 1);
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result?, format!("hyper:/{i}"));
    }
    Ok(())
}

#[tokio::test]
async fn lazy_failure_is_shared_and_not_retried() -> Result<()> {
    let registry = ProtocolRegistry::new(Teardown::new());
    let starts = Arc::new(AtomicUsize::new(0));
    {
        let starts = starts.clone();
        registry.register_lazy("ipfs", move |_teardown| {
            starts.fetch_add(1, Ordering::SeqCst);
            async { Err::<Arc<dyn Protocol>, _>("daemon failed to start".into()) }
        })?;
    }

    for _ in 0..2 {
        let err = registry
            .dispatch("ipfs://cid/", RequestInit::default())
            .await
            .expect_err("initializer fails");
        assert!(
            matches!(err.root(), Error::HandlerInit { scheme, .. } if scheme == "ipfs"),
            "{err}"
        );
    }
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn only_started_backends_register_teardown() -> Result<()> {
    let order = Arc::new(Mutex::new(Vec::new()));
    let lazy = |name: &'static str, order: Arc<Mutex<Vec<&'static str>>>| {
        move |teardown: Teardown| {
            let order = order.clone();
            async move {
                teardown.defer(name, move || async move {
                    order.lock().expect("order lock poisoned").push(name);
                    Ok(())
                })?;
                Ok::<_, BoxError>(tagged(name))
            }
        }
    };

    let runtime = Runtime::builder()
        .config(offline_config())
        .lazy_protocol("hyper", lazy("hyper", order.clone()))
        .lazy_protocol("ipfs", lazy("ipfs", order.clone()))
        .build()?;

    runtime
        .fetch("hyper://site/", RequestInit::default())
        .await?;
    assert!(runtime.close().await);
    assert_eq!(*order.lock().expect("order lock poisoned"), vec!["hyper"]);
    Ok(())
}

#[tokio::test]
async fn https_can_be_enabled_after_start() -> Result<()> {
    let mut config = offline_config();
    config.protocols.http = true;
    let runtime = Runtime::builder().config(config).build()?;

    let err = runtime
        .fetch("https://example.com/x", RequestInit::default())
        .await
        .expect_err("https is disabled");
    assert!(matches!(&err, Error::UnknownScheme { scheme } if scheme == "https"));

    runtime.protocols().register("https", tagged("https"))?;
    let response = runtime
        .fetch("https://example.com/x", RequestInit::default())
        .await?;
    assert!(response.ok());
    assert_eq!(response.text().await?, "https:/x");
    Ok(())
}

#[tokio::test]
async fn http_requests_go_through_reqwest() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/echo"))
        .and(header("content-type", "text/plain"))
        .and(header("user-agent", "Agora/1.0"))
        .and(body_string("ping"))
        .respond_with(ResponseTemplate::new(201).set_body_string("pong"))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = offline_config();
    config.protocols.http = true;
    let runtime = Runtime::builder().config(config).build()?;

    let descriptor = Request::new(format!("{}/echo", server.uri())).with_init(
        RequestInit::new()
            .method(Method::PUT)
            .body("ping")
            .header(HOST, HeaderValue::from_static("spoofed.example")),
    );
    let init = RequestInit::new()
        .method(Method::POST)
        .header(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    let response = runtime.fetch(descriptor, init).await?;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.text().await?, "pong");
    Ok(())
}

#[tokio::test]
async fn http_error_status_is_a_response() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
        .mount(&server)
        .await;

    let mut config = offline_config();
    config.protocols.http = true;
    let runtime = Runtime::builder().config(config).build()?;

    let response = runtime
        .fetch(format!("{}/missing", server.uri()), RequestInit::default())
        .await?;
    assert!(!response.ok());
    assert_eq!(response.text().await?, "nope");
    Ok(())
}

#[tokio::test]
async fn file_urls_resolve_against_the_root() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::create_dir(dir.path().join("lib"))?;
    std::fs::write(dir.path().join("lib").join("data.json"), r#"{"n":1}"#)?;

    let mut config = offline_config();
    config.protocols.file = true;
    config.root = Some(dir.path().display().to_string());
    let runtime = Runtime::builder().config(config).build()?;

    let response = runtime
        .fetch("lib/data.json", RequestInit::default())
        .await?;
    assert_eq!(
        response.headers().get(CONTENT_TYPE),
        Some(&HeaderValue::from_static("application/json"))
    );
    let value: serde_json::Value = response.json().await?;
    assert_eq!(value, serde_json::json!({"n": 1}));

    let missing = runtime
        .fetch("lib/none.json", RequestInit::default())
        .await?;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    Ok(())
}
