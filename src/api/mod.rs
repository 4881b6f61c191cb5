//! Admin and ops HTTP API of the hub
//!
//! ## Architecture
//!
//! - **Axum** web framework with Tower middleware
//! - **Actor handles** only: the admin channel of the pipeline, the
//!   persistence actor for stored rollups and the stats of every actor
//!
//! ## Endpoints
//!
//! - `GET /api/v1/health` - Health check (never requires a token)
//! - `GET /api/v1/stats` - Pipeline, source and scheduler statistics
//! - `POST /api/v1/admin/clear` - Emit and forget one key
//! - `POST /api/v1/admin/clear-all` - Emit and forget every key
//! - `GET /api/v1/admin/state/{account}/{metric}` - Dump one key
//! - `GET /api/v1/admin/states/count` - Keys holding state per granularity
//! - `PUT /api/v1/admin/state` - Overwrite one field of an open bucket
//! - `GET /api/v1/rollups/{account}/{metric}` - Stored rollups of one key

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod types;

pub use error::{ApiError, ApiResult};
pub use state::ApiState;

use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post, put},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the API router; every route but the health check requires `token` when set
pub fn build_router(state: ApiState, token: Option<String>) -> Router {
    let mut protected: Router<ApiState> = Router::new()
        .route("/api/v1/stats", get(routes::stats::get_stats))
        .route("/api/v1/admin/clear", post(routes::admin::clear))
        .route("/api/v1/admin/clear-all", post(routes::admin::clear_all))
        .route(
            "/api/v1/admin/state/:account/:metric",
            get(routes::admin::dump_state),
        )
        .route(
            "/api/v1/admin/states/count",
            get(routes::admin::count_states),
        )
        .route("/api/v1/admin/state", put(routes::admin::set_state))
        .route(
            "/api/v1/rollups/:account/:metric",
            get(routes::rollups::get_rollups),
        );

    if let Some(token) = token {
        protected = protected.route_layer(axum::middleware::from_fn_with_state(
            token,
            middleware::auth::auth_middleware,
        ));
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Spawn the API server
///
/// This starts an Axum HTTP server in a background task.
/// Returns the server's local address.
pub async fn spawn_api_server(
    addr: SocketAddr,
    token: Option<String>,
    state: ApiState,
) -> anyhow::Result<SocketAddr> {
    info!("starting API server on {addr}");

    let app = build_router(state, token);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;

    info!("API server listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(addr)
}
