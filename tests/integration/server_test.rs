//! HTTP listener routing through the axum router

use std::sync::Arc;

use axum::body::Body;
use base64::prelude::*;
use der::Encode;
use http::{Request, StatusCode};
use tower::ServiceExt;
use usg_ca_gateway::audit::{AuditLevel, AuditStatus, MemoryAuditSink};
use usg_ca_gateway::server::{CLIENT_CERT_HEADER, router};
use usg_ca_gateway::types::Operation;
use usg_ca_gateway::types::pkcs7::parse_certs_only;

use crate::integration::{Behavior, EST_MOUNT, FakeCa, TestCa, csr_der, responder, signer_pool};

struct Fixture {
    ca: TestCa,
    backend: Arc<FakeCa>,
    sink: Arc<MemoryAuditSink>,
    app: axum::Router,
}

fn fixture() -> Fixture {
    let ca = TestCa::new("X");
    let backend = Arc::new(FakeCa::new(&ca, Behavior::Issue));
    let sink = Arc::new(MemoryAuditSink::new());
    let responder = responder(
        &ca,
        backend.clone(),
        Arc::new(signer_pool(1)),
        sink.clone(),
    );
    Fixture {
        ca,
        backend,
        sink,
        app: router(Arc::new(responder)),
    }
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn test_health() {
    let f = fixture();
    let response = f
        .app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], usg_ca_gateway::VERSION);
    assert!(f.sink.is_empty());
}

#[tokio::test]
async fn test_cacerts_over_http() {
    let f = fixture();
    let response = f
        .app
        .oneshot(
            Request::get(format!("{EST_MOUNT}/cacerts"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/pkcs7-mime; smime-type=certs-only"
    );

    let certs = parse_certs_only(&body_bytes(response).await).unwrap();
    assert_eq!(certs, vec![f.ca.certificate.clone()]);
}

#[tokio::test]
async fn test_reenroll_with_forwarded_client_certificate() {
    let f = fixture();
    let (current, _) = f.ca.issue("device.example", &[0x11]);

    let request = Request::post(format!("{EST_MOUNT}/simplereenroll"))
        .header("content-type", "application/pkcs10")
        .header(
            CLIENT_CERT_HEADER,
            BASE64_STANDARD.encode(current.to_der().unwrap()),
        )
        .body(Body::from(BASE64_STANDARD.encode(csr_der("device.example"))))
        .unwrap();
    let response = f.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let submitted = &f.backend.submissions()[0][0];
    assert_eq!(submitted.operation, Operation::KeyUpdate);
    assert_eq!(
        submitted.prior_certificate.as_ref().unwrap().serial.as_bytes(),
        &[0x11]
    );
    assert_eq!(f.sink.len(), 1);
}

#[tokio::test]
async fn test_unmounted_path_is_404() {
    let f = fixture();
    let response = f
        .app
        .oneshot(Request::get("/nothing/here").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(f.backend.calls(), 0);
}

#[tokio::test]
async fn test_oversized_body_rejected() {
    let f = fixture();
    let request = Request::post(format!("{EST_MOUNT}/simpleenroll"))
        .header("content-type", "application/pkcs10")
        .body(Body::from(vec![b'A'; usg_ca_gateway::server::MAX_BODY_BYTES + 1]))
        .unwrap();
    let response = f.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(f.backend.calls(), 0);

    assert_eq!(f.sink.len(), 1);
    let event = &f.sink.events()[0];
    assert_eq!(event.application_name(), "est-gw");
    assert_eq!(event.status(), Some(AuditStatus::Failed));
    assert_eq!(event.level(), AuditLevel::Warn);
    assert_eq!(event.attribute("httpStatus"), Some("413"));
}
