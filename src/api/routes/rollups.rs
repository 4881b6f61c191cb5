//! Stored rollup queries

use axum::{
    Json,
    extract::{Path, Query, State},
};
use chrono::{Duration, Utc};

use crate::MetricKey;
use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
    types::{RollupRangeQuery, RollupsResponse},
};
use crate::storage::RollupQuery;

const DEFAULT_LIMIT: usize = 1000;

/// GET /api/v1/rollups/{account}/{metric}?granularity=&start=&end=&limit=
pub async fn get_rollups(
    State(state): State<ApiState>,
    Path((account, metric)): Path<(String, String)>,
    Query(params): Query<RollupRangeQuery>,
) -> ApiResult<Json<RollupsResponse>> {
    let end = params.end.unwrap_or_else(Utc::now);
    let start = params.start.unwrap_or(end - Duration::days(1));
    if start > end {
        return Err(ApiError::InvalidRequest(format!(
            "start {start} is after end {end}"
        )));
    }

    let key = MetricKey::new(account, metric);
    let query = RollupQuery {
        key: key.clone(),
        granularity: params.granularity,
        start,
        end,
        limit: Some(params.limit.unwrap_or(DEFAULT_LIMIT)),
    };
    let rollups = state.persistence.query_range(query).await?;

    Ok(Json(RollupsResponse {
        key,
        granularity: params.granularity,
        start,
        end,
        count: rollups.len(),
        rollups,
    }))
}
