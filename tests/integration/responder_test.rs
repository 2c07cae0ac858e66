//! End-to-end request handling through the responder

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use der::{Decode, Encode};
use http::StatusCode;
use usg_ca_gateway::audit::{AuditLevel, AuditStatus, MemoryAuditSink};
use usg_ca_gateway::backend::BackendError;
use usg_ca_gateway::protocol::InboundRequest;
use usg_ca_gateway::types::pkcs7::parse_certs_only;
use usg_ca_gateway::types::{ErrorCode, Operation};
use x509_cert::name::Name;

use crate::integration::{
    ACME_BASE_URL, ACME_MOUNT, Behavior, CMP_MOUNT, EST_MOUNT, FakeCa, TestCa, csr_der, responder,
    signer_pool, spki_der,
};

struct Harness {
    ca: TestCa,
    backend: Arc<FakeCa>,
    pool: Arc<usg_ca_gateway::security::SignerPool>,
    sink: Arc<MemoryAuditSink>,
    responder: Arc<usg_ca_gateway::Responder>,
}

fn harness(behavior: Behavior, pool_size: usize) -> Harness {
    let ca = TestCa::new("X");
    let backend = Arc::new(FakeCa::new(&ca, behavior));
    let pool = Arc::new(signer_pool(pool_size));
    let sink = Arc::new(MemoryAuditSink::new());
    let responder = Arc::new(responder(&ca, backend.clone(), pool.clone(), sink.clone()));
    Harness {
        ca,
        backend,
        pool,
        sink,
        responder,
    }
}

fn key_update_body() -> serde_json::Value {
    serde_json::json!({
        "transactionId": "tx-42",
        "entries": [{
            "id": "ku-1",
            "operation": "keyUpdate",
            "subject": "CN=host.example",
            "publicKey": BASE64_STANDARD.encode(spki_der()),
            "oldCertId": { "issuer": "CN=X", "serialNumber": "7b" }
        }]
    })
}

fn cmp_post(body: &serde_json::Value) -> InboundRequest {
    InboundRequest::post(
        format!("{CMP_MOUNT}/tls"),
        "application/json",
        body.to_string(),
    )
}

fn json(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn test_key_update_success() {
    let h = harness(Behavior::Issue, 2);

    let resp = h.responder.service(cmp_post(&key_update_body())).await;
    assert_eq!(resp.status, StatusCode::OK);

    let body = json(&resp.body);
    assert_eq!(body["transactionId"], "tx-42");
    let entry = &body["entries"][0];
    assert_eq!(entry["id"], "ku-1");
    let cert_der = BASE64_STANDARD
        .decode(entry["certificate"].as_str().unwrap())
        .unwrap();
    assert_eq!(cert_der, h.backend.leaf().to_der().unwrap());
    assert!(entry.get("error").is_none());

    // What reached the CA
    let submissions = h.backend.submissions();
    assert_eq!(submissions.len(), 1);
    let req = &submissions[0][0];
    assert_eq!(req.operation, Operation::KeyUpdate);
    assert_eq!(req.profile, "tls");
    let prior = req.prior_certificate.as_ref().unwrap();
    assert_eq!(prior.issuer, Name::from_str("CN=X").unwrap());
    assert_eq!(prior.serial.as_bytes(), &[123]);
    assert!(req.proof_of_possession.is_some());
    req.validate().unwrap();

    // Audit
    let events = h.sink.events();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.application_name(), "cmp-gw");
    assert_eq!(event.status(), Some(AuditStatus::Successful));
    assert_eq!(event.operation_ids(), ["ku-1"]);
    assert_eq!(event.protocol(), Some("CMP"));
    assert!(event.finished_at().is_some());

    assert_eq!(h.pool.available(), 2);
}

#[tokio::test]
async fn test_ca_generated_keypair() {
    let h = harness(Behavior::Issue, 1);
    let body = serde_json::json!({
        "keystorePassword": "changeit",
        "entries": [{
            "id": "kg-1",
            "operation": "enroll",
            "subject": "CN=device.example",
            "caGeneratesKeypair": true
        }]
    });

    let resp = h.responder.service(cmp_post(&body)).await;
    assert_eq!(resp.status, StatusCode::OK);

    let entry = &json(&resp.body)["entries"][0];
    let keystore = BASE64_STANDARD
        .decode(entry["keystore"].as_str().unwrap())
        .unwrap();
    let pfx = p12::PFX::parse(&keystore).unwrap();
    assert!(pfx.verify_mac("changeit"));
    assert!(!pfx.verify_mac("wrong"));

    let req = &h.backend.submissions()[0][0];
    assert!(req.ca_generates_keypair);
    assert!(req.public_key.is_none());
    assert!(req.proof_of_possession.is_none());

    let event = &h.sink.events()[0];
    assert_eq!(event.status(), Some(AuditStatus::Successful));
    // No POP needed, so no signer was leased
    assert_eq!(event.attribute("signer"), None);
}

#[tokio::test]
async fn test_malformed_body_never_reaches_backend() {
    let h = harness(Behavior::Issue, 1);

    let resp = h
        .responder
        .service(InboundRequest::post(
            CMP_MOUNT,
            "application/json",
            "{\"entries\": [ not json",
        ))
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(json(&resp.body)["error"]["code"], "badRequest");
    assert_eq!(h.backend.calls(), 0);

    let event = &h.sink.events()[0];
    assert_eq!(event.status(), Some(AuditStatus::Failed));
    assert_eq!(event.level(), AuditLevel::Warn);
    assert_eq!(event.attribute("errorKind"), Some("MALFORMED_REQUEST"));
    assert_eq!(event.attribute("state"), Some("RECEIVED"));
}

#[tokio::test]
async fn test_malformed_csr_never_reaches_backend() {
    let h = harness(Behavior::Issue, 1);

    let resp = h
        .responder
        .service(InboundRequest::post(
            format!("{EST_MOUNT}/simpleenroll"),
            "application/pkcs10",
            BASE64_STANDARD.encode(b"definitely not a CSR"),
        ))
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(h.backend.calls(), 0);
    assert_eq!(h.sink.events()[0].level(), AuditLevel::Warn);
}

#[tokio::test]
async fn test_tampered_csr_signature_is_bad_pop() {
    let h = harness(Behavior::Issue, 1);
    let mut csr = csr_der("device.example");
    let last = csr.len() - 1;
    csr[last] ^= 0x01;

    let resp = h
        .responder
        .service(InboundRequest::post(
            format!("{EST_MOUNT}/simpleenroll"),
            "application/pkcs10",
            BASE64_STANDARD.encode(csr),
        ))
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(h.backend.calls(), 0);
    assert_eq!(h.pool.available(), 1);

    let event = &h.sink.events()[0];
    assert_eq!(event.status(), Some(AuditStatus::Failed));
    assert_eq!(event.level(), AuditLevel::Warn);
    assert!(event.attribute("error").unwrap().contains("Proof of possession"));
}

#[tokio::test]
async fn test_backend_panic_is_contained() {
    let h = harness(Behavior::Panic, 1);

    let resp = h.responder.service(cmp_post(&key_update_body())).await;
    assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.body, b"Internal Server Error");

    let event = &h.sink.events()[0];
    assert_eq!(event.status(), Some(AuditStatus::Failed));
    assert_eq!(event.level(), AuditLevel::Error);
    assert_eq!(event.attribute("errorKind"), Some("INTERNAL_FAULT"));
    assert_eq!(event.attribute("state"), Some("SUBMITTED"));
    assert_eq!(h.pool.available(), 1);

    // The responder keeps serving
    let resp = h
        .responder
        .service(InboundRequest::get(format!("{EST_MOUNT}/cacerts")))
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(h.sink.len(), 2);
}

#[tokio::test]
async fn test_backend_unexpected_error_is_generic_500() {
    let h = harness(
        Behavior::Fail(BackendError::Unexpected("stack trace from CA".into())),
        1,
    );

    let resp = h.responder.service(cmp_post(&key_update_body())).await;
    assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!String::from_utf8_lossy(&resp.body).contains("stack trace"));

    let event = &h.sink.events()[0];
    assert_eq!(event.level(), AuditLevel::Error);
    assert!(event.attribute("error").unwrap().contains("stack trace"));
}

#[tokio::test]
async fn test_backend_policy_rejection_is_warn() {
    let h = harness(Behavior::RejectEntries(ErrorCode::BadCertId), 1);

    let resp = h.responder.service(cmp_post(&key_update_body())).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(json(&resp.body)["entries"][0]["error"]["code"], "badCertId");

    let event = &h.sink.events()[0];
    assert_eq!(event.status(), Some(AuditStatus::Failed));
    assert_eq!(event.level(), AuditLevel::Warn);
    assert!(event.attribute("entry.ku-1.error").is_some());
}

#[tokio::test]
async fn test_missing_result_is_reported_per_entry() {
    let h = harness(Behavior::Omit, 1);

    let resp = h.responder.service(cmp_post(&key_update_body())).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(
        json(&resp.body)["entries"][0]["error"]["code"],
        "systemFailure"
    );
    assert_eq!(h.sink.events()[0].level(), AuditLevel::Error);
}

#[tokio::test]
async fn test_backend_timeout_reaches_audit() {
    let ca = TestCa::new("X");
    let backend = Arc::new(FakeCa::new(&ca, Behavior::Issue).with_delay(Duration::from_secs(5)));
    let sink = Arc::new(MemoryAuditSink::new());
    let responder = usg_ca_gateway::Responder::builder()
        .mount(
            CMP_MOUNT,
            usg_ca_gateway::protocol::ProtocolAdapter::CmpUpdate(
                usg_ca_gateway::protocol::CmpAdapter::new("tls"),
            ),
        )
        .signer_pool(Arc::new(signer_pool(1)))
        .backend(backend)
        .audit_sink(sink.clone())
        .backend_timeout(Duration::from_millis(50))
        .build()
        .unwrap();

    let resp = responder.service(cmp_post(&key_update_body())).await;
    assert_eq!(resp.status, StatusCode::OK);
    let body = json(&resp.body);
    assert_eq!(body["entries"][0]["error"]["code"], "systemUnavailable");

    let event = &sink.events()[0];
    assert_eq!(event.level(), AuditLevel::Error);
    assert!(event.attribute("backendError").is_some());
}

#[tokio::test]
async fn test_pool_exhaustion_is_retryable_503() {
    let h = harness(Behavior::Issue, 1);
    let held = h.pool.borrow(Duration::from_secs(1)).await.unwrap();

    let resp = h.responder.service(cmp_post(&key_update_body())).await;
    assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(resp.header("Retry-After"), Some("5"));
    assert_eq!(h.backend.calls(), 0);

    let event = &h.sink.events()[0];
    assert_eq!(event.level(), AuditLevel::Warn);
    assert_eq!(event.attribute("errorKind"), Some("RESOURCE_EXHAUSTED"));

    held.requite();
    let resp = h.responder.service(cmp_post(&key_update_body())).await;
    assert_eq!(resp.status, StatusCode::OK);
}

#[tokio::test]
async fn test_est_simpleenroll() {
    let h = harness(Behavior::Issue, 1);

    let resp = h
        .responder
        .service(InboundRequest::post(
            format!("{EST_MOUNT}/simpleenroll"),
            "application/pkcs10",
            BASE64_STANDARD.encode(csr_der("device.example")),
        ))
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.header("Content-Transfer-Encoding"), Some("base64"));

    let certs = parse_certs_only(&resp.body).unwrap();
    assert_eq!(certs.len(), 1);
    assert_eq!(&certs[0], h.backend.leaf());

    let req = &h.backend.submissions()[0][0];
    assert_eq!(req.operation, Operation::Enroll);
    assert_eq!(
        req.subject.as_ref().unwrap().to_string(),
        "CN=device.example"
    );
    assert!(req.proof_of_possession.is_some());
}

#[tokio::test]
async fn test_est_reenroll_uses_client_certificate() {
    let h = harness(Behavior::Issue, 1);
    let (current, _) = h.ca.issue("device.example", &[0x2a]);

    let resp = h
        .responder
        .service(
            InboundRequest::post(
                format!("{EST_MOUNT}/simplereenroll"),
                "application/pkcs10",
                BASE64_STANDARD.encode(csr_der("device.example")),
            )
            .with_client_certificate(current.to_der().unwrap()),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let req = &h.backend.submissions()[0][0];
    assert_eq!(req.operation, Operation::KeyUpdate);
    let prior = req.prior_certificate.as_ref().unwrap();
    assert_eq!(prior.serial.as_bytes(), &[0x2a]);
    assert_eq!(prior.issuer, h.ca.certificate.tbs_certificate.subject);
}

#[tokio::test]
async fn test_method_not_allowed() {
    let h = harness(Behavior::Issue, 1);
    let resp = h
        .responder
        .service(InboundRequest::get(format!("{EST_MOUNT}/simpleenroll")))
        .await;
    assert_eq!(resp.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(h.sink.events()[0].level(), AuditLevel::Warn);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_audit_totality_under_concurrency() {
    let h = harness(Behavior::Issue, 2);

    let mut handles = Vec::new();
    for i in 0..40 {
        let responder = Arc::clone(&h.responder);
        handles.push(tokio::spawn(async move {
            let request = match i % 5 {
                0 => cmp_post(&key_update_body()),
                1 => InboundRequest::get(format!("{EST_MOUNT}/cacerts")),
                2 => InboundRequest::post(CMP_MOUNT, "application/json", "garbage"),
                3 => InboundRequest::get("/not-mounted"),
                _ => InboundRequest::post(
                    format!("{EST_MOUNT}/simpleenroll"),
                    "application/pkcs10",
                    BASE64_STANDARD.encode(csr_der("c.example")),
                ),
            };
            responder.service(request).await.status
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let events = h.sink.events();
    assert_eq!(events.len(), 40);
    assert!(events.iter().all(|e| e.status().is_some()));
    assert!(events.iter().all(|e| e.finished_at().is_some()));
    assert_eq!(
        events
            .iter()
            .filter(|e| e.status() == Some(AuditStatus::Failed))
            .count(),
        16
    );
    assert_eq!(h.pool.available(), 2);
}

#[tokio::test]
async fn test_cacerts_served_locally() {
    let h = harness(Behavior::Issue, 1);
    let resp = h
        .responder
        .service(InboundRequest::get(format!("{EST_MOUNT}/cacerts")))
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    let certs = parse_certs_only(&resp.body).unwrap();
    assert_eq!(certs, vec![h.ca.certificate.clone()]);
    assert_eq!(h.backend.calls(), 0);

    // Decoding the CA certificate back is stable
    let der = certs[0].to_der().unwrap();
    assert_eq!(x509_cert::Certificate::from_der(&der).unwrap(), certs[0]);
}

fn acme_post(operation: &str, payload: serde_json::Value) -> InboundRequest {
    let header = serde_json::json!({
        "alg": "ES256",
        "nonce": "bm9uY2U",
        "url": format!("{ACME_BASE_URL}/{operation}"),
        "kid": format!("{ACME_BASE_URL}/acct/1"),
    });
    let body = serde_json::json!({
        "protected": BASE64_URL_SAFE_NO_PAD.encode(header.to_string()),
        "payload": BASE64_URL_SAFE_NO_PAD.encode(payload.to_string()),
        "signature": BASE64_URL_SAFE_NO_PAD.encode([7u8; 64]),
    });
    InboundRequest::post(
        format!("{ACME_MOUNT}/{operation}"),
        "application/jose+json",
        body.to_string(),
    )
}

#[tokio::test]
async fn test_acme_finalize_returns_pem_chain() {
    let h = harness(Behavior::Issue, 1);
    let csr = BASE64_URL_SAFE_NO_PAD.encode(csr_der("www.example"));

    let resp = h
        .responder
        .service(acme_post("finalize", serde_json::json!({ "csr": csr })))
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(
        resp.content_type.as_deref(),
        Some("application/pem-certificate-chain")
    );
    assert!(resp.header("Replay-Nonce").is_some());

    let chain = x509_cert::Certificate::load_pem_chain(&resp.body).unwrap();
    assert_eq!(chain, vec![h.backend.leaf().clone(), h.ca.certificate.clone()]);

    let req = &h.backend.submissions()[0][0];
    assert_eq!(req.operation, Operation::Enroll);
    assert!(req.proof_of_possession.is_some());
    assert_eq!(h.sink.events()[0].application_name(), "acme-gw");
}

#[tokio::test]
async fn test_acme_revoke_skips_signer() {
    let h = harness(Behavior::Issue, 1);
    let (victim, _) = h.ca.issue("old.example", &[0x33]);
    let _held = h.pool.borrow(Duration::from_secs(1)).await.unwrap();

    let resp = h
        .responder
        .service(acme_post(
            "revoke-cert",
            serde_json::json!({
                "certificate": BASE64_URL_SAFE_NO_PAD.encode(victim.to_der().unwrap()),
                "reason": 1
            }),
        ))
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let req = &h.backend.submissions()[0][0];
    assert_eq!(req.operation, Operation::Revoke);
    assert_eq!(
        req.prior_certificate.as_ref().unwrap().serial.as_bytes(),
        &[0x33]
    );
    assert!(req.proof_of_possession.is_none());
}

/// A revoke-cert request signed by `signer` with its key embedded as `jwk`.
fn acme_jwk_revocation(
    victim: &x509_cert::Certificate,
    signer: &p256::ecdsa::SigningKey,
) -> InboundRequest {
    use p256::ecdsa::signature::Signer;

    let point = signer.verifying_key().to_encoded_point(false);
    let header = serde_json::json!({
        "alg": "ES256",
        "nonce": "bm9uY2U",
        "url": format!("{ACME_BASE_URL}/revoke-cert"),
        "jwk": {
            "kty": "EC",
            "crv": "P-256",
            "x": BASE64_URL_SAFE_NO_PAD.encode(point.x().unwrap()),
            "y": BASE64_URL_SAFE_NO_PAD.encode(point.y().unwrap()),
        },
    });
    let payload = serde_json::json!({
        "certificate": BASE64_URL_SAFE_NO_PAD.encode(victim.to_der().unwrap()),
    });
    let protected = BASE64_URL_SAFE_NO_PAD.encode(header.to_string());
    let payload = BASE64_URL_SAFE_NO_PAD.encode(payload.to_string());
    let signature: p256::ecdsa::Signature = signer.sign(format!("{protected}.{payload}").as_bytes());
    let body = serde_json::json!({
        "protected": protected,
        "payload": payload,
        "signature": BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes()),
    });
    InboundRequest::post(
        format!("{ACME_MOUNT}/revoke-cert"),
        "application/jose+json",
        body.to_string(),
    )
}

#[tokio::test]
async fn test_acme_revoke_with_certificate_key() {
    use p256::pkcs8::DecodePrivateKey;

    let h = harness(Behavior::Issue, 1);
    let (victim, key_der) = h.ca.issue("old.example", &[0x34]);
    let owner = p256::ecdsa::SigningKey::from_pkcs8_der(&key_der).unwrap();

    let resp = h.responder.service(acme_jwk_revocation(&victim, &owner)).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(h.backend.submissions()[0][0].operation, Operation::Revoke);
}

#[tokio::test]
async fn test_acme_revoke_with_foreign_key_is_forbidden() {
    let h = harness(Behavior::Issue, 1);
    let (victim, _) = h.ca.issue("old.example", &[0x35]);
    let stranger = p256::ecdsa::SigningKey::random(&mut rand_core::OsRng);

    let resp = h
        .responder
        .service(acme_jwk_revocation(&victim, &stranger))
        .await;
    assert_eq!(resp.status, StatusCode::FORBIDDEN);
    assert_eq!(
        json(&resp.body)["type"],
        "urn:ietf:params:acme:error:unauthorized"
    );
    assert_eq!(h.backend.calls(), 0);

    let event = &h.sink.events()[0];
    assert_eq!(event.status(), Some(AuditStatus::Failed));
    assert_eq!(event.level(), AuditLevel::Warn);
}

#[tokio::test]
async fn test_acme_rejection_is_problem_document() {
    let h = harness(Behavior::RejectEntries(ErrorCode::BadCertTemplate), 1);
    let csr = BASE64_URL_SAFE_NO_PAD.encode(csr_der("www.example"));

    let resp = h
        .responder
        .service(acme_post("finalize", serde_json::json!({ "csr": csr })))
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        resp.content_type.as_deref(),
        Some("application/problem+json")
    );
    assert_eq!(json(&resp.body)["type"], "urn:ietf:params:acme:error:badCSR");
    assert_eq!(h.sink.events()[0].level(), AuditLevel::Warn);
}
