//! System statistics endpoint

use axum::{Json, extract::State};
use futures::future::join_all;
use tracing::warn;

use crate::api::{error::ApiResult, state::ApiState, types::StatsResponse};

/// GET /api/v1/stats
///
/// Pipeline counters plus whatever the running actors report. An actor
/// that does not answer is left out instead of failing the request.
pub async fn get_stats(State(state): State<ApiState>) -> ApiResult<Json<StatsResponse>> {
    let persistence = match state.persistence.stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!("persistence stats unavailable: {e:#}");
            None
        }
    };

    let sources = join_all(state.sources.iter().map(|source| source.stats()))
        .await
        .into_iter()
        .filter_map(Result::ok)
        .collect();

    let scheduler = match &state.scheduler {
        Some(handle) => handle.stats().await.ok(),
        None => None,
    };

    Ok(Json(StatsResponse {
        timestamp: chrono::Utc::now().to_rfc3339(),
        pipeline: state.counters.snapshot(),
        persistence,
        sources,
        scheduler,
    }))
}
