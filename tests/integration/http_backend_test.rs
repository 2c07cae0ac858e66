//! JSON-over-HTTPS CA client against a mock CA service

use std::str::FromStr;
use std::time::Duration;

use base64::prelude::*;
use der::{Decode, Encode};
use usg_ca_gateway::backend::{BackendError, CaClient, CaClientConfig, HttpCaClient};
use usg_ca_gateway::types::{
    CertReference, EnrollmentRequest, ErrorCode, Outcome, RevocationReason,
};
use wiremock::matchers::{basic_auth, body_partial_json, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;

use crate::integration::TestCa;

const SUBMIT_PATH: &str = "/gw/issuing/requests";

fn client(server: &MockServer) -> HttpCaClient {
    let config = CaClientConfig::builder()
        .url(format!("{}/gw", server.uri()))
        .unwrap()
        .ca_name("issuing")
        .timeout(Duration::from_millis(500))
        .build()
        .unwrap();
    HttpCaClient::new(config).unwrap()
}

fn prior() -> CertReference {
    CertReference::new(
        Name::from_str("CN=X").unwrap(),
        SerialNumber::new(&[123]).unwrap(),
    )
}

#[tokio::test]
async fn test_submit_issues_and_revokes() {
    let server = MockServer::start().await;
    let ca = TestCa::new("X");
    let (leaf, _) = ca.issue("host.example", &[7]);

    Mock::given(method("POST"))
        .and(path(SUBMIT_PATH))
        .and(header_exists("user-agent"))
        .and(body_partial_json(serde_json::json!({
            "requests": [
                { "id": "a", "operation": "enroll", "profile": "tls", "caGeneratesKeypair": true },
                { "id": "b", "operation": "revoke", "reason": "keyCompromise",
                  "oldCertId": { "serialNumber": "7b" } }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [
                { "id": "a",
                  "certificate": BASE64_STANDARD.encode(leaf.to_der().unwrap()),
                  "privateKey": BASE64_STANDARD.encode([1u8, 2, 3]) },
                { "id": "b", "revoked": true }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let requests = vec![
        EnrollmentRequest::enroll_with_ca_key("a", "tls", Name::from_str("CN=host.example").unwrap()),
        EnrollmentRequest::revoke("b", "tls", prior(), Some(RevocationReason::KeyCompromise)),
    ];
    let result = client(&server).submit(&requests).await.unwrap();

    match result.get("a").unwrap() {
        Outcome::Certified(issued) => {
            assert_eq!(issued.certificate, leaf);
            assert_eq!(issued.private_key.as_deref(), Some(&[1u8, 2, 3][..]));
        }
        other => panic!("expected certificate, got {other:?}"),
    }
    assert!(matches!(result.get("b"), Some(Outcome::Revoked)));
}

#[tokio::test]
async fn test_submit_sends_der_fields() {
    let server = MockServer::start().await;
    let ca = TestCa::new("X");
    let (leaf, _) = ca.issue("host.example", &[8]);
    let key_der = crate::integration::spki_der();

    Mock::given(method("POST"))
        .and(path(SUBMIT_PATH))
        .and(body_partial_json(serde_json::json!({
            "requests": [{
                "id": "k",
                "operation": "keyUpdate",
                "publicKey": BASE64_STANDARD.encode(&key_der),
                "oldCertId": {
                    "issuer": BASE64_STANDARD.encode(Name::from_str("CN=X").unwrap().to_der().unwrap()),
                    "serialNumber": "7b"
                }
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [{ "id": "k", "certificate": BASE64_STANDARD.encode(leaf.to_der().unwrap()) }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let request = EnrollmentRequest::key_update(
        "k",
        "tls",
        Name::from_str("CN=host.example").unwrap(),
        Some(spki::SubjectPublicKeyInfoOwned::from_der(&key_der).unwrap()),
        prior(),
    );
    let result = client(&server).submit(&[request]).await.unwrap();
    assert!(matches!(result.get("k"), Some(Outcome::Certified(_))));
}

#[tokio::test]
async fn test_basic_auth_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SUBMIT_PATH))
        .and(basic_auth("gw", "s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "results": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let config = CaClientConfig::builder()
        .url(format!("{}/gw", server.uri()))
        .unwrap()
        .ca_name("issuing")
        .http_auth("gw", "s3cret")
        .build()
        .unwrap();
    let result = HttpCaClient::new(config).unwrap().submit(&[]).await.unwrap();
    assert!(result.is_empty());
}

#[tokio::test]
async fn test_per_entry_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SUBMIT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [{ "id": "r", "error": { "code": "badCertId", "message": "unknown serial" } }]
        })))
        .mount(&server)
        .await;

    let request = EnrollmentRequest::revoke("r", "tls", prior(), None);
    let result = client(&server).submit(&[request]).await.unwrap();
    let error = result.get("r").unwrap().error().unwrap();
    assert_eq!(error.code, ErrorCode::BadCertId);
    assert_eq!(error.message, "unknown serial");
}

#[tokio::test]
async fn test_policy_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SUBMIT_PATH))
        .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
            "code": "notAuthorized", "message": "profile not allowed"
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .submit(&[EnrollmentRequest::revoke("r", "tls", prior(), None)])
        .await
        .unwrap_err();
    match err {
        BackendError::Rejected { code, message } => {
            assert_eq!(code, ErrorCode::NotAuthorized);
            assert_eq!(message, "profile not allowed");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_server_error_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SUBMIT_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = client(&server).submit(&[]).await.unwrap_err();
    assert!(matches!(err, BackendError::Unavailable(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_slow_ca_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SUBMIT_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "results": [] }))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let err = client(&server).submit(&[]).await.unwrap_err();
    assert!(matches!(err, BackendError::Timeout(_)));
}

#[tokio::test]
async fn test_garbage_answer_is_unexpected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SUBMIT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;

    let err = client(&server).submit(&[]).await.unwrap_err();
    assert!(matches!(err, BackendError::Unexpected(_)));
}

#[tokio::test]
async fn test_unreachable_ca() {
    let config = CaClientConfig::builder()
        .url("http://127.0.0.1:9")
        .unwrap()
        .ca_name("issuing")
        .timeout(Duration::from_millis(500))
        .build()
        .unwrap();
    let err = HttpCaClient::new(config)
        .unwrap()
        .submit(&[])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BackendError::Unavailable(_) | BackendError::Timeout(_)
    ));
}
