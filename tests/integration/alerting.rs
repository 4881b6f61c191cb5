//! Broken-resource alerts end to end over HTTP
//!
//! The provider rejects the credentials, the resource is marked broken and
//! the webhook receives exactly one alert.

use std::sync::Arc;

use chrono::Duration;
use rollwatch::ManagedResource;
use rollwatch::alerts::WebhookNotifier;
use rollwatch::scheduler::{HttpRefreshExecutor, PollPolicy};
use rollwatch::storage::{MemoryStore, ResourceStore};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_rejected_credentials_send_one_webhook_alert() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/connections/m1"))
        .and(header("Authorization", "Bearer provider-token"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&provider)
        .await;

    let webhook = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alerts"))
        .and(body_partial_json(serde_json::json!({
            "resource": "m1",
            "resource_type": "mail",
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&webhook)
        .await;

    let store = Arc::new(MemoryStore::with_resources(vec![ManagedResource::new("m1", "mail")]));
    let executor = HttpRefreshExecutor::new(
        format!("{}/connections", provider.uri()),
        Some("provider-token".to_string()),
        std::time::Duration::from_secs(5),
    )
    .unwrap();
    let notifier = WebhookNotifier::new(format!("{}/alerts", webhook.uri()));
    let mut scheduler = build_scheduler(
        store.clone(),
        Arc::new(executor),
        Arc::new(notifier),
        PollPolicy::default(),
    );

    assert_eq!(tick_and_wait(&mut scheduler, t0()).await, vec!["m1"]);
    assert!(tick_and_wait(&mut scheduler, t0() + Duration::days(1)).await.is_empty());

    let resource = store.get_resource("m1").await.unwrap().unwrap();
    assert!(resource.broken);
    assert!(resource.last_error.unwrap().contains("401"));
    assert_eq!(scheduler.stats().refresh.alert_failures, 0);
}

#[tokio::test]
async fn test_server_errors_only_count_as_failures() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&provider)
        .await;

    let webhook = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&webhook)
        .await;

    let store = Arc::new(MemoryStore::with_resources(vec![ManagedResource::new("m1", "mail")]));
    let executor = HttpRefreshExecutor::new(provider.uri(), None, std::time::Duration::from_secs(5))
        .unwrap();
    let mut scheduler = build_scheduler(
        store.clone(),
        Arc::new(executor),
        Arc::new(WebhookNotifier::new(webhook.uri())),
        PollPolicy::default(),
    );

    assert_eq!(tick_and_wait(&mut scheduler, t0()).await, vec!["m1"]);

    let resource = store.get_resource("m1").await.unwrap().unwrap();
    assert!(!resource.broken);
    assert_eq!(resource.failed_count, 1);
}

#[tokio::test]
async fn test_webhook_outage_is_counted() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&provider)
        .await;

    let webhook = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&webhook)
        .await;

    let store = Arc::new(MemoryStore::with_resources(vec![ManagedResource::new("m1", "mail")]));
    let executor = HttpRefreshExecutor::new(provider.uri(), None, std::time::Duration::from_secs(5))
        .unwrap();
    let mut scheduler = build_scheduler(
        store.clone(),
        Arc::new(executor),
        Arc::new(WebhookNotifier::new(webhook.uri())),
        PollPolicy::default(),
    );

    tick_and_wait(&mut scheduler, t0()).await;

    // the resource is broken even though nobody was told
    assert!(store.get_resource("m1").await.unwrap().unwrap().broken);
    assert_eq!(scheduler.stats().refresh.alert_failures, 1);
}
