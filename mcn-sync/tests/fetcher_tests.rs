//! Remote dataset fetcher against a local HTTP server

use axum::{http::StatusCode, routing::get, Router};
use mcn_common::store::{read_cached_data, MemoryStore};
use mcn_common::PersistentStore;
use mcn_sync::fetcher::{DatasetSource, RemoteDatasetFetcher};
use mcn_sync::{FetchError, ReconciliationEngine, RefreshOutcome};
use std::sync::Arc;
use std::time::Duration;

/// Test helper: serve `router` on an ephemeral port, return its base URL
async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn dataset_router() -> Router {
    Router::new()
        .route(
            "/mcn-data.json",
            get(|| async { r#"{"zhang-san": "星光传媒", "li-si": "青藤文化"}"# }),
        )
        .route("/broken.json", get(|| async { "{not json" }))
        .route("/array.json", get(|| async { "[\"zhang-san\"]" }))
        .route(
            "/unavailable.json",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "try later") }),
        )
}

#[tokio::test]
async fn test_fetch_parses_object_of_strings() {
    let base = serve(dataset_router()).await;
    let fetcher = RemoteDatasetFetcher::new(format!("{base}/mcn-data.json")).unwrap();

    let data = fetcher.fetch().await.unwrap();

    assert_eq!(data.len(), 2);
    assert_eq!(data["zhang-san"], "星光传媒");
}

#[tokio::test]
async fn test_invalid_json_is_parse_error() {
    let base = serve(dataset_router()).await;
    let fetcher = RemoteDatasetFetcher::new(format!("{base}/broken.json")).unwrap();

    assert!(matches!(fetcher.fetch().await, Err(FetchError::Parse(_))));
}

#[tokio::test]
async fn test_wrong_shape_is_parse_error() {
    let base = serve(dataset_router()).await;
    let fetcher = RemoteDatasetFetcher::new(format!("{base}/array.json")).unwrap();

    assert!(matches!(fetcher.fetch().await, Err(FetchError::Parse(_))));
}

#[tokio::test]
async fn test_non_success_status_is_network_error() {
    let base = serve(dataset_router()).await;

    for path in ["unavailable.json", "missing.json"] {
        let fetcher = RemoteDatasetFetcher::new(format!("{base}/{path}")).unwrap();
        match fetcher.fetch().await {
            Err(FetchError::Network(msg)) => assert!(msg.starts_with("HTTP "), "{msg}"),
            other => panic!("expected network error for {path}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_engine_refresh_over_http() {
    let base = serve(dataset_router()).await;
    let store = MemoryStore::new();
    store.set("zhang-san", "本地记录").await.unwrap();

    let engine = ReconciliationEngine::new(
        Arc::new(store.clone()),
        Arc::new(RemoteDatasetFetcher::new(format!("{base}/mcn-data.json")).unwrap()),
        Duration::from_secs(60),
    );

    assert!(matches!(engine.refresh().await, RefreshOutcome::Updated { entries: 2 }));
    assert_eq!(read_cached_data(&store).await.unwrap()["zhang-san"], "星光传媒");
    assert_eq!(engine.lookup("zhang-san").await, Some("本地记录".to_string()));
    assert_eq!(engine.lookup("li-si").await, Some("青藤文化".to_string()));
}
