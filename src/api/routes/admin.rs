//! Administrative endpoints of the rollup pipeline

use axum::{
    Json,
    extract::{Path, State},
};
use tracing::info;

use crate::MetricKey;
use crate::api::{
    error::ApiResult,
    state::ApiState,
    types::{ClearRequest, ClearResponse, CountResponse, SetStateRequest, StateResponse},
};

/// POST /api/v1/admin/clear
pub async fn clear(
    State(state): State<ApiState>,
    Json(request): Json<ClearRequest>,
) -> ApiResult<Json<ClearResponse>> {
    let key = request.key();
    let emitted = state.admin.clear(key.clone()).await?;
    info!("admin cleared {key} ({emitted} buckets emitted)");
    Ok(Json(ClearResponse { emitted }))
}

/// POST /api/v1/admin/clear-all
pub async fn clear_all(State(state): State<ApiState>) -> ApiResult<Json<ClearResponse>> {
    let emitted = state.admin.clear_all().await?;
    info!("admin cleared all keys ({emitted} buckets emitted)");
    Ok(Json(ClearResponse { emitted }))
}

/// GET /api/v1/admin/state/{account}/{metric}
pub async fn dump_state(
    State(state): State<ApiState>,
    Path((account, metric)): Path<(String, String)>,
) -> ApiResult<Json<StateResponse>> {
    let key = MetricKey::new(account, metric);
    let states = state.admin.dump_state(key.clone()).await?;
    Ok(Json(StateResponse { key, states }))
}

/// GET /api/v1/admin/states/count
pub async fn count_states(State(state): State<ApiState>) -> ApiResult<Json<CountResponse>> {
    let counts = state.admin.count_states().await?;
    Ok(Json(CountResponse { counts }))
}

/// PUT /api/v1/admin/state
///
/// Unknown keys answer 404, rejected fields or values 400.
pub async fn set_state(
    State(state): State<ApiState>,
    Json(request): Json<SetStateRequest>,
) -> ApiResult<Json<StateResponse>> {
    let key = MetricKey::new(request.account_id, request.metric);
    state
        .admin
        .set_state(key.clone(), request.granularity, request.field, request.value)
        .await?;

    let states = state.admin.dump_state(key.clone()).await?;
    Ok(Json(StateResponse { key, states }))
}
