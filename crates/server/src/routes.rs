use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use salesrag_core::{ChannelId, EntityKind, SkipReason, StatusSummary};
use salesrag_db::repositories::ChannelRepository;
use salesrag_index::{IndexError, IndexingRun, RunRequest, RunSummary};
use salesrag_vector::{Embedder, SearchFilter, SearchHit, Source, VectorIndex};

use crate::bootstrap::Application;

#[derive(Clone)]
pub struct AppState {
    pub run: Arc<IndexingRun>,
    pub channels: Arc<dyn ChannelRepository>,
    pub vector: Arc<dyn VectorIndex>,
    pub embedder: Arc<dyn Embedder>,
}

impl AppState {
    pub fn from_application(app: &Application) -> Self {
        Self {
            run: app.run.clone(),
            channels: app.channels.clone(),
            vector: app.vector.clone(),
            embedder: app.embedder.clone(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/index/run", post(run_index))
        .route("/index/status", get(index_status))
        .route("/search", post(search))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct RunParams {
    pub max_channels: Option<u32>,
    pub page_budget: Option<u32>,
    pub lookback_days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ApiFailure {
    pub error: String,
}

pub async fn run_index(
    State(state): State<AppState>,
    Json(params): Json<RunParams>,
) -> Result<Json<RunSummary>, (StatusCode, Json<ApiFailure>)> {
    let request = RunRequest {
        max_channels: params.max_channels,
        page_budget: params.page_budget,
        lookback_days: params.lookback_days,
    };

    state.run.execute(request).await.map(Json).map_err(|failure| {
        error!(event_name = "api.run_failed", error = %failure, "indexing run failed");
        failure_response(failure)
    })
}

#[derive(Debug, Serialize)]
pub struct ChannelStatusRow {
    pub channel_id: String,
    pub name: String,
    pub status: String,
    pub skip_reason: Option<SkipReason>,
    pub oldest_indexed_ts: Option<String>,
    pub last_indexed_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub summary: StatusSummary,
    pub channels: Vec<ChannelStatusRow>,
}

pub async fn index_status(
    State(state): State<AppState>,
) -> Result<Json<StatusResponse>, (StatusCode, Json<ApiFailure>)> {
    let summary = state.channels.status_summary().await.map_err(internal)?;
    let channels = state
        .channels
        .list_all()
        .await
        .map_err(internal)?
        .into_iter()
        .map(|record| ChannelStatusRow {
            channel_id: record.id.0,
            name: record.name,
            status: record.state.as_str().to_string(),
            skip_reason: record.skip_reason,
            oldest_indexed_ts: record.oldest_indexed_ts,
            last_indexed_at: record.last_indexed_at.map(|value| value.to_rfc3339()),
        })
        .collect();

    Ok(Json(StatusResponse { summary, channels }))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub query: String,
    pub top_k: Option<usize>,
    pub source: Option<String>,
    pub channel_id: Option<String>,
    pub entity: Option<String>,
    pub kind: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
}

pub async fn search(
    State(state): State<AppState>,
    Json(params): Json<SearchParams>,
) -> Result<Json<SearchResponse>, (StatusCode, Json<ApiFailure>)> {
    let mut filter = SearchFilter::new();
    if let Some(raw) = &params.source {
        let source = Source::parse(raw).ok_or_else(|| bad_request(format!(
            "unknown source `{raw}` (expected slack|salesforce)"
        )))?;
        filter = filter.with_source(source);
    }
    if let Some(raw) = &params.kind {
        let kind = EntityKind::parse(raw).ok_or_else(|| bad_request(format!(
            "unknown entity kind `{raw}` (expected company|contact|opportunity)"
        )))?;
        filter = filter.with_kind(kind);
    }
    if let Some(channel_id) = &params.channel_id {
        filter = filter.with_channel(ChannelId(channel_id.clone()));
    }
    if let Some(entity) = &params.entity {
        filter = filter.with_entity(entity.clone());
    }

    let embedding = state
        .embedder
        .embed(&params.query)
        .await
        .map_err(|failure| upstream(failure.to_string()))?;
    let results = state
        .vector
        .search(&embedding, &filter, params.top_k.unwrap_or(5))
        .await
        .map_err(internal)?;

    Ok(Json(SearchResponse { results }))
}

fn failure_response(failure: IndexError) -> (StatusCode, Json<ApiFailure>) {
    let status = match &failure {
        IndexError::Access(_) => StatusCode::FORBIDDEN,
        IndexError::RateLimited { .. } | IndexError::Embedding(_) | IndexError::Fatal(_) => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiFailure { error: failure.to_string() }))
}

fn internal(failure: impl std::fmt::Display) -> (StatusCode, Json<ApiFailure>) {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiFailure { error: failure.to_string() }))
}

fn upstream(message: String) -> (StatusCode, Json<ApiFailure>) {
    (StatusCode::BAD_GATEWAY, Json(ApiFailure { error: message }))
}

fn bad_request(message: String) -> (StatusCode, Json<ApiFailure>) {
    (StatusCode::BAD_REQUEST, Json(ApiFailure { error: message }))
}

#[cfg(test)]
mod tests {
    use axum::extract::State;
    use axum::Json;

    use salesrag_core::config::{ConfigOverrides, LoadOptions};

    use crate::bootstrap::bootstrap;
    use crate::routes::{index_status, search, AppState, SearchParams};

    async fn state() -> (AppState, salesrag_db::DbPool) {
        let app = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:?cache=shared".to_string()),
                slack_bot_token: Some("xoxb-test".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await
        .expect("bootstrap");
        (AppState::from_application(&app), app.db_pool)
    }

    #[tokio::test]
    async fn status_starts_empty() {
        let (state, pool) = state().await;

        let Json(payload) = index_status(State(state)).await.expect("status");
        assert_eq!(payload.summary.remaining(), 0);
        assert!(payload.channels.is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn search_rejects_unknown_entity_kind() {
        let (state, pool) = state().await;

        let result = search(
            State(state),
            Json(SearchParams {
                query: "renewal risk".to_string(),
                top_k: None,
                source: None,
                channel_id: None,
                entity: None,
                kind: Some("franchise".to_string()),
            }),
        )
        .await;

        let (status, _) = result.err().expect("bad request");
        assert_eq!(status, axum::http::StatusCode::BAD_REQUEST);

        pool.close().await;
    }

    #[tokio::test]
    async fn search_over_empty_store_returns_no_results() {
        let (state, pool) = state().await;

        let Json(payload) = search(
            State(state),
            Json(SearchParams {
                query: "Zillow renewal".to_string(),
                top_k: Some(3),
                source: None,
                channel_id: None,
                entity: None,
                kind: None,
            }),
        )
        .await
        .expect("search");

        assert!(payload.results.is_empty());

        pool.close().await;
    }
}
