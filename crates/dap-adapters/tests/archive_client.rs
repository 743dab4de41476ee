use std::time::Duration;

use dap_adapters::{ArchiveClient, ArchiveClientConfig, ArchiveError, HttpArchiveClient};
use dap_core::{ArchiveOutcome, RecordId};
use serde_json::json;
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn client_for(server: &MockServer, timeout: Duration) -> HttpArchiveClient {
    HttpArchiveClient::new(ArchiveClientConfig {
        archive_url: format!("{}/archive", server.uri()),
        timeout,
        user_agent: Some("dap-test".into()),
        ..Default::default()
    })
    .expect("client")
}

#[tokio::test]
async fn passes_record_id_as_query_parameter_and_reads_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/archive"))
        .and(query_param("deal", "d1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "result": {"result": "done", "file": "d1.zip"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = client_for(&server, Duration::from_secs(5))
        .archive(&RecordId::from("d1"))
        .await
        .expect("archive");
    assert_eq!(outcome, ArchiveOutcome::archived("d1.zip"));
}

#[tokio::test]
async fn record_ids_are_url_encoded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/archive"))
        .and(query_param("deal", "a&b=c"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "result": {"file": "x.zip"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = client_for(&server, Duration::from_secs(5))
        .archive(&RecordId::from("a&b=c"))
        .await
        .expect("archive");
    assert_eq!(outcome.file, "x.zip");
}

#[tokio::test]
async fn reported_failure_is_an_outcome_even_on_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/archive"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "success": false,
            "result": {"result": "storage full", "file": ""}
        })))
        .mount(&server)
        .await;

    let outcome = client_for(&server, Duration::from_secs(5))
        .archive(&RecordId::from("d3"))
        .await
        .expect("decoded failure outcome");
    assert!(!outcome.success);
    assert_eq!(outcome.detail, "archive failed: storage full");
}

#[tokio::test]
async fn undecodable_body_on_success_status_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/archive"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let err = client_for(&server, Duration::from_secs(5))
        .archive(&RecordId::from("d4"))
        .await
        .expect_err("decode failure");
    assert!(matches!(err, ArchiveError::Decode { status: 200, .. }));
    assert!(err.to_string().starts_with("failed to decode response: "));
}

#[tokio::test]
async fn undecodable_body_on_error_status_is_a_decode_error_with_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/archive"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let err = client_for(&server, Duration::from_secs(5))
        .archive(&RecordId::from("d5"))
        .await
        .expect_err("decode failure");
    assert!(matches!(err, ArchiveError::Decode { status: 502, .. }));
    assert!(err.to_string().starts_with("failed to decode response: "));
}

#[tokio::test]
async fn slow_endpoint_hits_request_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/archive"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(3))
                .set_body_json(json!({"success": true, "result": {"file": "late.zip"}})),
        )
        .mount(&server)
        .await;

    let err = client_for(&server, Duration::from_millis(200))
        .archive(&RecordId::from("d6"))
        .await
        .expect_err("timeout");
    match err {
        ArchiveError::Request(inner) => assert!(inner.is_timeout()),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unreachable_endpoint_is_a_request_error() {
    let client = HttpArchiveClient::new(ArchiveClientConfig {
        archive_url: "http://127.0.0.1:1/archive".into(),
        timeout: Duration::from_secs(2),
        ..Default::default()
    })
    .expect("client");

    let err = client
        .archive(&RecordId::from("d2"))
        .await
        .expect_err("unreachable");
    assert!(matches!(err, ArchiveError::Request(_)));
    assert!(err.to_string().starts_with("archive request failed: "));
}
