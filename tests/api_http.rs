// tests/api_http.rs
// In-process router checks: the HTTP adapter validates input and delegates,
// nothing more.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::Router;
use http::{Request, StatusCode};
use chrono::Utc;
use healthfeed::api::AppState;
use healthfeed::classify::{Category, ClassifierEngine, ClassifierHandle};
use healthfeed::ingest::fetch::{Fetcher, RetryPolicy};
use healthfeed::ingest::scheduler::ScrapeScheduler;
use healthfeed::ingest::Pipeline;
use healthfeed::search::SearchEngine;
use healthfeed::store::{NewArticle, Store};
use healthfeed::registry::SourceRegistry;
use tower::util::ServiceExt;

async fn app() -> (Arc<Store>, Router) {
    let store = Arc::new(Store::new("sqlite::memory:").await.unwrap());
    store.initialize().await.unwrap();
    let registry = Arc::new(SourceRegistry::new(&store, 5));
    let classifier = ClassifierHandle::new(ClassifierEngine::from_toml().unwrap());
    let fetcher = Fetcher::new(RetryPolicy {
        max_attempts: 1,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
    })
    .unwrap();
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        registry.clone(),
        classifier.clone(),
        fetcher,
        5,
    ));
    let stats = pipeline.stats().clone();
    let scheduler = ScrapeScheduler::new(pipeline);
    let search = Arc::new(SearchEngine::new(store.clone(), classifier.clone()));

    let state = AppState {
        store: store.clone(),
        registry,
        search,
        scheduler,
        classifier,
        stats,
    };
    (store, healthfeed::create_router(state))
}

async fn get_json(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value)
}

fn seeded_article(i: usize, category: Category) -> NewArticle {
    NewArticle {
        title: format!("Vitamin guidance {i}"),
        summary: String::new(),
        url: format!("https://example.com/{i}"),
        source: "Test".to_string(),
        published: Utc::now(),
        category,
        subcategory: None,
        tags: vec!["prevention".to_string()],
        content_hash: format!("api-{i}"),
    }
}

#[tokio::test]
async fn health_reports_counts() {
    let (store, router) = app().await;
    store.insert(&seeded_article(1, Category::Nutrition)).await.unwrap();

    let (status, body) = get_json(&router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["article_count"], 1);
    assert_eq!(body["recent_count"], 1);
    assert_eq!(body["duplicate_count"], 0);
    assert_eq!(body["uncategorized_count"], 0);
}

#[tokio::test]
async fn search_returns_a_page_envelope() {
    let (store, router) = app().await;
    store.insert(&seeded_article(1, Category::Nutrition)).await.unwrap();
    store.insert(&seeded_article(2, Category::Nutrition)).await.unwrap();

    let (status, body) = get_json(&router, "/search?q=vitamin&limit=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["total_pages"], 2);
    assert_eq!(body["has_next"], true);
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn category_browse_rejects_unknown_categories() {
    let (_store, router) = app().await;

    let (status, _) = get_json(&router, "/category/nutrition").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = get_json(&router, "/category/astrology").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("astrology"));
}

#[tokio::test]
async fn invalid_sort_and_date_params_are_rejected() {
    let (_store, router) = app().await;

    let (status, _) = get_json(&router, "/search?q=x&sort=upwards").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get_json(&router, "/search?q=x&start_date=yesterday").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn tag_browse_filters_by_tag() {
    let (store, router) = app().await;
    store.insert(&seeded_article(1, Category::Nutrition)).await.unwrap();
    let mut untagged = seeded_article(2, Category::News);
    untagged.tags = Vec::new();
    store.insert(&untagged).await.unwrap();

    let (status, body) = get_json(&router, "/tag/prevention").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
}

#[tokio::test]
async fn categories_listing_is_the_fixed_set() {
    let (_store, router) = app().await;
    let (status, body) = get_json(&router, "/categories").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 10);
    let names: Vec<&str> = body["categories"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(names.contains(&"diseases"));
    assert!(names.contains(&"mental_health"));
}

#[tokio::test(flavor = "multi_thread")]
async fn trigger_accepts_when_idle() {
    let (_store, router) = app().await;
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/scheduler/trigger?kind=full")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let (status, body) = get_json(&router, "/scheduler/status").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["state"] == "running" || body["state"] == "idle");
}
