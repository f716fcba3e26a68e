// HTTP print queue client against a mock server

use print_queue_relay::errors::DaemonError;
use print_queue_relay::remote::{HttpQueueClient, RemoteJobId, RemoteQueueClient};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> HttpQueueClient {
    HttpQueueClient::new(&format!("{}/", server.uri()), Duration::from_secs(2))
}

#[tokio::test]
async fn test_fetch_empty_queue() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/printQueue"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let job = client(&server).fetch_next(None).await.unwrap();
    assert!(job.is_none());
}

#[tokio::test]
async fn test_fetch_not_found_means_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/printQueue"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    assert!(client(&server).fetch_next(None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_fetch_job_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/printQueue"))
        .and(header("authorization", "Bearer secret"))
        .and(header("accept", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "s3_url": "https://bucket.example.com/label.pdf?sig=x",
            "id": 42,
            "filename": "label.pdf"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let job = client(&server)
        .fetch_next(Some("secret".to_string()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(job.url, "https://bucket.example.com/label.pdf?sig=x");
    assert_eq!(job.id, Some(RemoteJobId::Number(42)));
    assert_eq!(job.label(), "label.pdf");
}

#[tokio::test]
async fn test_fetch_server_error_is_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/printQueue"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let err = client(&server).fetch_next(None).await.unwrap_err();
    match err {
        DaemonError::Api { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_fetch_non_json_is_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/printQueue"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    assert!(client(&server).fetch_next(None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_report_printed_posts_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/updatePdfStatus"))
        .and(body_json(json!({ "id": 42, "status": "printed" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .report_printed(&RemoteJobId::Number(42), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_report_rejection_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/updatePdfStatus"))
        .respond_with(ResponseTemplate::new(400).set_body_string("unknown id"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server)
        .report_printed(&RemoteJobId::Text("abc".to_string()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::Api { status: 400, .. }));
}
