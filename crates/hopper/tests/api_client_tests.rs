//! Ingest API client tests against a mock HTTP server.

use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hopper::api::{ApiConfig, IngestClient, Outcome, ReindexProgress};

fn client_for(server: &MockServer) -> IngestClient {
    IngestClient::new(ApiConfig::for_base_url(server.uri())).unwrap()
}

#[tokio::test]
async fn test_created_resource_yields_assigned_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/Patient"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("Location", "https://host/base/Patient/17/_history/1"),
        )
        .mount(&server)
        .await;

    let client = client_for(&server);
    let result = client
        .send("Patient", &json!({"resourceType": "Patient"}))
        .await;

    assert_eq!(result.outcome, Outcome::Created);
    assert_eq!(result.assigned_id.as_deref(), Some("17"));
}

#[tokio::test]
async fn test_bundle_posts_to_service_root() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let bundle = json!({"resourceType": "Bundle", "entry": [{"resource": {}}]});
    let result = client.send("Bundle", &bundle).await;

    assert_eq!(result.outcome, Outcome::Updated);
}

#[tokio::test]
async fn test_client_error_is_permanent_with_no_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let result = client.send("Patient", &json!({})).await;

    assert_eq!(result.outcome, Outcome::ClientError);
    assert!(result.assigned_id.is_none());
    assert!(!result.outcome.is_transient());
}

#[tokio::test]
async fn test_unavailable_and_server_error_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/Observation"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let result = client.send("Observation", &json!({})).await;
    assert_eq!(result.outcome, Outcome::Unavailable);
    assert!(result.outcome.is_transient());

    // A server nobody is listening on is also just unavailable
    let dead = IngestClient::new(ApiConfig::for_base_url("http://127.0.0.1:1")).unwrap();
    let result = dead.send("Observation", &json!({})).await;
    assert_eq!(result.outcome, Outcome::Unavailable);
}

#[tokio::test]
async fn test_read_classifies_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Patient/17"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "17"})))
        .mount(&server)
        .await;

    let client = client_for(&server);
    assert!(client.read("Patient", "17").await.is_success());
    assert_eq!(client.read("Patient", "does-not-exist").await, Outcome::ClientError);
}

#[tokio::test]
async fn test_reindex_reports_done_on_no_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/$reindex"))
        .and(body_json(json!({"tstamp": "2026-08-01", "resourceCount": 10})))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let progress = client.trigger_reindex("2026-08-01", 10).await.unwrap();
    assert_eq!(progress, ReindexProgress::Done);
}

#[tokio::test]
async fn test_reindex_reports_more_work_on_ok() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/$reindex"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"indexed": 10})))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let progress = client.trigger_reindex("2026-08-01", 10).await.unwrap();
    assert_eq!(progress, ReindexProgress::MoreWork);

    // A failing call surfaces as an error, not an outcome
    server.reset().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    assert!(client.trigger_reindex("2026-08-01", 10).await.is_err());
}
