// src/api.rs
//! Thin HTTP adapter over the core: parameter validation and delegation
//! only. Pipeline logic lives in `ingest`, ranking in `search`.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::classify::{Category, ClassifierHandle};
use crate::ingest::scheduler::{CycleKind, ScrapeScheduler, TriggerOutcome};
use crate::ingest::PipelineStats;
use crate::registry::SourceRegistry;
use crate::search::{SearchEngine, SearchRequest};
use crate::store::{ArticleFilter, PageRequest, SortOrder, Store, StoreError};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub registry: Arc<SourceRegistry>,
    pub search: Arc<SearchEngine>,
    pub scheduler: Arc<ScrapeScheduler>,
    pub classifier: ClassifierHandle,
    pub stats: Arc<PipelineStats>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/search", get(search))
        .route("/category/{category}", get(by_category))
        .route("/tag/{tag}", get(by_tag))
        .route("/categories", get(categories))
        .route("/tags", get(tags))
        .route("/stats", get(stats))
        .route("/scheduler/trigger", post(trigger))
        .route("/scheduler/status", get(scheduler_status))
        .route("/admin/reload-rules", post(reload_rules))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        // Browse/search never fail because of ingestion problems; reaching
        // this means the store itself is unavailable.
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: format!("store unavailable: {e}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

fn parse_category(raw: &str) -> Result<Category, ApiError> {
    Category::parse(raw)
        .ok_or_else(|| ApiError::bad_request(format!("unknown category '{raw}'")))
}

fn parse_date(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>, ApiError> {
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request(format!("invalid date '{raw}', expected YYYY-MM-DD")))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    Ok(DateTime::from_naive_utc_and_offset(
        time.expect("valid wall-clock time"),
        Utc,
    ))
}

fn page_request(
    page: Option<i64>,
    limit: Option<i64>,
    sort: Option<&str>,
) -> Result<PageRequest, ApiError> {
    let sort = match sort {
        None | Some("desc") => SortOrder::Desc,
        Some("asc") => SortOrder::Asc,
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "invalid sort '{other}', expected asc|desc"
            )))
        }
    };
    Ok(PageRequest {
        page: page.unwrap_or(1).max(1),
        limit: limit.unwrap_or(20).clamp(1, 100),
        sort,
    })
}

#[derive(Debug, Deserialize)]
struct ListParams {
    page: Option<i64>,
    limit: Option<i64>,
    sort: Option<String>,
}

impl ListParams {
    fn page_request(&self) -> Result<PageRequest, ApiError> {
        page_request(self.page, self.limit, self.sort.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
    category: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    page: Option<i64>,
    limit: Option<i64>,
    sort: Option<String>,
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let category = params
        .category
        .as_deref()
        .map(parse_category)
        .transpose()?;
    let start_date = params
        .start_date
        .as_deref()
        .map(|d| parse_date(d, false))
        .transpose()?;
    let end_date = params
        .end_date
        .as_deref()
        .map(|d| parse_date(d, true))
        .transpose()?;

    let req = SearchRequest {
        query: params.q.unwrap_or_default(),
        category,
        start_date,
        end_date,
        page: page_request(params.page, params.limit, params.sort.as_deref())?,
    };
    let page = state.search.search(&req).await?;
    Ok(Json(page))
}

async fn by_category(
    State(state): State<AppState>,
    Path(category): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = ArticleFilter {
        category: Some(parse_category(&category)?),
        ..Default::default()
    };
    let page = state.store.query(&filter, params.page_request()?).await?;
    Ok(Json(page))
}

async fn by_tag(
    State(state): State<AppState>,
    Path(tag): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = ArticleFilter {
        tag: Some(tag),
        ..Default::default()
    };
    let page = state.store.query(&filter, params.page_request()?).await?;
    Ok(Json(page))
}

async fn categories() -> impl IntoResponse {
    let names: Vec<&'static str> = Category::ALL.iter().map(|c| c.as_str()).collect();
    Json(serde_json::json!({ "categories": names, "total": names.len() }))
}

async fn tags(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let tags = state.store.distinct_tags().await?;
    Ok(Json(serde_json::json!({ "total": tags.len(), "tags": tags })))
}

async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let store_stats = state.store.stats().await?;
    let sources = state.registry.all_sources().await?;
    Ok(Json(serde_json::json!({
        "articles": store_stats,
        "sources": sources,
    })))
}

#[derive(Debug, serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    article_count: i64,
    duplicate_count: u64,
    uncategorized_count: u64,
    recent_count: i64,
}

async fn health(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let article_count = state.store.count().await?;
    let recent_count = state
        .store
        .count_since(Utc::now() - chrono::Duration::hours(24))
        .await?;
    Ok(Json(HealthResponse {
        status: "healthy",
        article_count,
        duplicate_count: state.stats.duplicates(),
        uncategorized_count: state.stats.uncategorized(),
        recent_count,
    }))
}

#[derive(Debug, Deserialize)]
struct TriggerParams {
    kind: Option<CycleKind>,
}

async fn trigger(
    State(state): State<AppState>,
    Query(params): Query<TriggerParams>,
) -> impl IntoResponse {
    let kind = params.kind.unwrap_or(CycleKind::Quick);
    match state.scheduler.trigger(kind) {
        TriggerOutcome::Accepted => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "accepted", "kind": kind.as_str() })),
        ),
        TriggerOutcome::Busy => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "status": "busy" })),
        ),
    }
}

async fn scheduler_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.status())
}

async fn reload_rules(State(state): State<AppState>) -> Response {
    match state.classifier.reload() {
        Ok(()) => "reloaded".into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("reload failed: {e}"),
        )
            .into_response(),
    }
}
