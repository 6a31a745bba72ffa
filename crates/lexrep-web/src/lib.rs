//! Axum JSON front end over the replica, with the background download worker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use lexrep_adapters::{HtmlFetcher, PageSource};
use lexrep_core::Period;
use lexrep_storage::{
    Catalog, DocumentCriteria, Store, DEFAULT_PREVIEW_CHARS, DEFAULT_PREVIEW_FRAGMENTS,
};
use lexrep_sync::{select_enricher, ContentEnricher, DownloadJob, JobMonitor, SyncConfig, TagIndexer};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "lexrep-web";

const DEFAULT_SEARCH_LIMIT: u32 = 10;

#[derive(Clone)]
pub struct AppState {
    pub db_path: PathBuf,
    pub pages: Arc<dyn PageSource>,
    pub enricher: Arc<dyn ContentEnricher>,
    pub tags: Arc<TagIndexer>,
    pub pause: Duration,
    pub attachment_dir: Option<PathBuf>,
    pub monitor: JobMonitor,
}

impl AppState {
    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let pages = HtmlFetcher::new(config.html_fetcher_config()).context("building html fetcher")?;
        Ok(Self {
            db_path: config.db_path.clone(),
            pages: Arc::new(pages),
            enricher: Arc::from(select_enricher(config.enricher, config)),
            tags: Arc::new(config.tag_indexer()?),
            pause: config.page_pacing,
            attachment_dir: Some(config.attachment_dir.clone()),
            monitor: JobMonitor::new(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    #[serde(default)]
    query: String,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PeriodQuery {
    doc_type: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/api/search", post(search_handler))
        .route("/api/periods/{period}", get(period_handler))
        .route("/api/document/{code}", get(document_handler))
        .route("/api/download/start", post(download_start_handler))
        .route("/api/download/stop", post(download_stop_handler))
        .route("/api/download/status", get(download_status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &SyncConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(config)?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, db = %config.db_path.display(), "web front end listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err}"))
}

/// Each request gets its own connection pool; nothing spans requests.
async fn open_catalog(state: &AppState) -> Result<Catalog, Response> {
    Catalog::open(&state.db_path).await.map_err(server_error)
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    let catalog = match open_catalog(&state).await {
        Ok(catalog) => catalog,
        Err(resp) => return resp,
    };
    let result = catalog.statistics().await;
    catalog.close().await;
    match result {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error(err),
    }
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SearchRequest>,
) -> Response {
    let query = req.query.trim();
    if query.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "empty query");
    }
    let catalog = match open_catalog(&state).await {
        Ok(catalog) => catalog,
        Err(resp) => return resp,
    };
    let result = catalog
        .search_by_title(query, req.limit.unwrap_or(DEFAULT_SEARCH_LIMIT))
        .await;
    catalog.close().await;
    match result {
        Ok(documents) => Json(json!({
            "query": query,
            "count": documents.len(),
            "documents": documents,
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn period_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(period): AxumPath<Period>,
    Query(params): Query<PeriodQuery>,
) -> Response {
    let catalog = match open_catalog(&state).await {
        Ok(catalog) => catalog,
        Err(resp) => return resp,
    };
    let result = catalog
        .list_by_period(period, params.doc_type.as_deref())
        .await;
    catalog.close().await;
    match result {
        Ok(documents) => Json(documents).into_response(),
        Err(err) => server_error(err),
    }
}

async fn document_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(code): AxumPath<String>,
) -> Response {
    let catalog = match open_catalog(&state).await {
        Ok(catalog) => catalog,
        Err(resp) => return resp,
    };
    let result = catalog
        .document_detail(&code, DEFAULT_PREVIEW_FRAGMENTS, DEFAULT_PREVIEW_CHARS)
        .await;
    catalog.close().await;
    match result {
        Ok(Some(detail)) => {
            let rendered = state.enricher.is_done(&code).await;
            Json(json!({ "detail": detail, "rendered": rendered })).into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("document {code} not found")),
        Err(err) => server_error(err),
    }
}

async fn download_start_handler(
    State(state): State<Arc<AppState>>,
    Json(criteria): Json<DocumentCriteria>,
) -> Response {
    if let Err(err) = DownloadJob::validate(&criteria) {
        return error_response(StatusCode::BAD_REQUEST, err.to_string());
    }
    let Some(run_id) = state.monitor.try_begin().await else {
        return error_response(StatusCode::BAD_REQUEST, "download already running");
    };

    let store = match Store::open(&state.db_path).await {
        Ok(store) => store,
        Err(err) => {
            state.monitor.finish(run_id).await;
            return server_error(err);
        }
    };
    let mut job = DownloadJob::new(
        store.clone(),
        Arc::clone(&state.pages),
        Arc::clone(&state.enricher),
        Arc::clone(&state.tags),
        state.pause,
    );
    if let Some(dir) = &state.attachment_dir {
        job = job.with_attachment_dir(dir);
    }
    let monitor = state.monitor.clone();
    tokio::spawn(async move {
        match job.run(run_id, &criteria, &monitor).await {
            Ok(done) => info!(
                completed = done.completed,
                errors = done.errors.len(),
                "download job finished"
            ),
            Err(err) => error!(error = %format!("{err:#}"), "download job aborted"),
        }
        store.close().await;
    });

    Json(json!({ "status": "started", "run_id": run_id })).into_response()
}

/// The worker exits before its next document; until then status reports
/// `running` and `stopping`.
async fn download_stop_handler(State(state): State<Arc<AppState>>) -> Response {
    state.monitor.request_stop().await;
    Json(json!({ "status": "stopping" })).into_response()
}

async fn download_status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.monitor.snapshot().await).into_response()
}
