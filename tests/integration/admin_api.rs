//! Admin API over the real router and a live pipeline

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use chrono::Duration;
use rollwatch::{MetricKey, MetricSample};
use rollwatch::actors::messenger::LogMessageSink;
use rollwatch::api::{ApiState, build_router};
use rollwatch::config::PipelineConfig;
use rollwatch::pipeline::{Pipeline, PipelineHandle, admin_channel};
use rollwatch::rollup::{Granularity, Observation};
use rollwatch::storage::MemoryStore;
use rollwatch::util::ManualClock;
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::helpers::*;

const TOKEN: &str = "s3cret";

struct Api {
    router: Router,
    pipeline: PipelineHandle,
    clock: Arc<ManualClock>,
}

fn api() -> Api {
    let clock = Arc::new(ManualClock::new(t0()));
    let (admin, admin_rx) = admin_channel(8);
    let config = PipelineConfig {
        partitions: 2,
        flush_interval_ms: 3_600_000,
        persistence_flush_secs: 3600,
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::spawn(
        &config,
        clock.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(LogMessageSink),
        admin_rx,
    );
    let state = ApiState::new(admin, pipeline.persistence(), pipeline.counters());
    Api {
        router: build_router(state, Some(TOKEN.to_string())),
        pipeline,
        clock,
    }
}

async fn observe(pipeline: &PipelineHandle, key: &MetricKey, offset_secs: i64, value: f64) {
    pipeline
        .router(Granularity::Second)
        .unwrap()
        .observe(Observation::from(MetricSample {
            key: key.clone(),
            timestamp: t0() + Duration::seconds(offset_secs),
            value,
        }))
        .await
        .unwrap();
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"));
    let body = match body {
        Some(json) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = router.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_health_is_open_and_everything_else_needs_the_token() {
    let api = api();

    let health = Request::get("/api/v1/health").body(Body::empty()).unwrap();
    let response = api.router.clone().oneshot(health).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let anonymous = Request::get("/api/v1/stats").body(Body::empty()).unwrap();
    let response = api.router.clone().oneshot(anonymous).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let wrong = Request::get("/api/v1/stats")
        .header(header::AUTHORIZATION, "Bearer guess")
        .body(Body::empty())
        .unwrap();
    let response = api.router.clone().oneshot(wrong).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let (status, stats) = send(&api.router, "GET", "/api/v1/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["pipeline"]["late"], 0);
    assert_eq!(stats["sources"], json!([]));

    api.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dump_count_and_clear_one_key() {
    let api = api();
    let key = MetricKey::new("acct", "usage.events");
    observe(&api.pipeline, &key, 0, 1.0).await;
    observe(&api.pipeline, &key, 0, 2.0).await;
    observe(&api.pipeline, &MetricKey::new("other", "usage.events"), 0, 1.0).await;

    let (status, dump) = send(&api.router, "GET", "/api/v1/admin/state/acct/usage.events", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dump["states"][0]["granularity"], "second");
    assert_eq!(dump["states"][0]["stats"]["count"], 2);

    let (_, counts) = send(&api.router, "GET", "/api/v1/admin/states/count", None).await;
    assert_eq!(counts["per_granularity"]["second"], 2);

    let (status, cleared) = send(
        &api.router,
        "POST",
        "/api/v1/admin/clear",
        Some(json!({ "account_id": "acct", "metric": "usage.events" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // the open second bucket plus one cascaded bucket per coarser level
    assert_eq!(cleared["emitted"], Granularity::ALL.len());

    let (_, dump) = send(&api.router, "GET", "/api/v1/admin/state/acct/usage.events", None).await;
    assert_eq!(dump["states"], json!([]));

    let (_, cleared) = send(&api.router, "POST", "/api/v1/admin/clear-all", None).await;
    assert_eq!(cleared["emitted"], Granularity::ALL.len());

    api.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_set_state_errors_map_to_status_codes() {
    let api = api();
    let key = MetricKey::new("acct", "usage.events");
    observe(&api.pipeline, &key, 0, 1.0).await;

    let (status, body) = send(
        &api.router,
        "PUT",
        "/api/v1/admin/state",
        Some(json!({
            "account_id": "acct",
            "metric": "usage.events",
            "granularity": "second",
            "field": "sum",
            "value": 7.5
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["states"][0]["stats"]["sum"], 7.5);

    let (status, _) = send(
        &api.router,
        "PUT",
        "/api/v1/admin/state",
        Some(json!({
            "account_id": "nobody",
            "metric": "usage.events",
            "granularity": "second",
            "field": "sum",
            "value": 1.0
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &api.router,
        "PUT",
        "/api/v1/admin/state",
        Some(json!({
            "account_id": "acct",
            "metric": "usage.events",
            "granularity": "second",
            "field": "median",
            "value": 1.0
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("median"));

    api.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rollups_are_served_from_the_sink() {
    let api = api();
    let key = MetricKey::new("acct", "usage.bytes");
    observe(&api.pipeline, &key, 0, 100.0).await;
    observe(&api.pipeline, &key, 1, 50.0).await;

    api.clock.advance(Duration::minutes(2));
    send(&api.router, "POST", "/api/v1/admin/clear-all", None).await;
    api.pipeline.persistence().flush().await.unwrap();

    let uri = "/api/v1/rollups/acct/usage.bytes?granularity=second\
               &start=2024-05-06T09:00:00Z&end=2024-05-06T09:10:00Z";
    let (status, body) = send(&api.router, "GET", uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["rollups"][0]["stats"]["sum"], 100.0);
    assert_eq!(body["rollups"][1]["stats"]["sum"], 50.0);

    let uri = "/api/v1/rollups/acct/usage.bytes?granularity=minute\
               &start=2024-05-06T09:00:00Z&end=2024-05-06T09:10:00Z";
    let (_, body) = send(&api.router, "GET", uri, None).await;
    assert_eq!(body["rollups"][0]["stats"]["count"], 2);

    let backwards = "/api/v1/rollups/acct/usage.bytes?granularity=second\
                     &start=2024-05-06T10:00:00Z&end=2024-05-06T09:00:00Z";
    let (status, _) = send(&api.router, "GET", backwards, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    api.pipeline.shutdown().await.unwrap();
}
