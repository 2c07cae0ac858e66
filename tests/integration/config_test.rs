//! Configuration file to running responder

use std::path::Path;

use base64::prelude::*;
use der::Encode;
use http::StatusCode;
use usg_ca_gateway::ConfigLoader;
use usg_ca_gateway::protocol::InboundRequest;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::integration::{CMP_MOUNT, EST_MOUNT, TestCa, spki_der};

/// Write a PKCS#8 signer key and the CA chain into `dir` and return a config
/// pointing at them and at `backend_url`.
fn write_fixture(dir: &Path, ca: &TestCa, backend_url: &str, audit: bool) -> String {
    let key = rcgen::KeyPair::generate().unwrap();
    let key_path = dir.join("pop.pem");
    std::fs::write(&key_path, key.serialize_pem()).unwrap();

    let chain_path = dir.join("chain.pem");
    std::fs::write(&chain_path, ca.pem()).unwrap();

    let mut config = format!(
        r#"
[backend]
url = "{backend_url}"
ca_name = "issuing"
timeout_seconds = 5

[pool]
borrow_timeout_ms = 500

[[signers]]
name = "pop"
key_path = "{key}"
parallelism = 2

[ca]
chain_path = "{chain}"

[est]
default_profile = "tls"

[cmp]
default_profile = "tls"
"#,
        key = key_path.display(),
        chain = chain_path.display(),
    );
    if audit {
        config.push_str(&format!(
            "\n[audit]\npath = \"{}\"\n",
            dir.join("audit/audit.jsonl").display()
        ));
    }
    config
}

#[tokio::test]
async fn test_config_to_responder_end_to_end() {
    let server = MockServer::start().await;
    let ca = TestCa::new("X");
    let (leaf, _) = ca.issue("host.example", &[9]);

    Mock::given(method("POST"))
        .and(path("/gw/issuing/requests"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [{ "id": "ku-1", "certificate": BASE64_STANDARD.encode(leaf.to_der().unwrap()) }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let toml = write_fixture(dir.path(), &ca, &format!("{}/gw", server.uri()), true);
    let config = ConfigLoader::new().load_from_str(&toml).unwrap();

    let responder = config.build_responder().unwrap();
    assert_eq!(responder.signer_pool().size(), 2);
    let mounts: Vec<&str> = responder.mounts().map(|(path, _)| path).collect();
    assert_eq!(mounts, vec![EST_MOUNT, CMP_MOUNT]);

    let body = serde_json::json!({
        "entries": [{
            "id": "ku-1",
            "operation": "keyUpdate",
            "subject": "CN=host.example",
            "publicKey": BASE64_STANDARD.encode(spki_der()),
            "oldCertId": { "issuer": "CN=X", "serialNumber": "7b" }
        }]
    });
    let resp = responder
        .service(InboundRequest::post(
            CMP_MOUNT,
            "application/json",
            body.to_string(),
        ))
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    let answer: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(
        answer["entries"][0]["certificate"],
        BASE64_STANDARD.encode(leaf.to_der().unwrap())
    );

    // The wire request carried a POP from the configured signer
    let received = &server.received_requests().await.unwrap()[0];
    let sent: serde_json::Value = serde_json::from_slice(&received.body).unwrap();
    assert!(sent["requests"][0]["pop"]["signature"].is_string());

    let cacerts = responder
        .service(InboundRequest::get(format!("{EST_MOUNT}/cacerts")))
        .await;
    assert_eq!(cacerts.status, StatusCode::OK);

    let audit = std::fs::read_to_string(dir.path().join("audit/audit.jsonl")).unwrap();
    let records: Vec<serde_json::Value> = audit
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["applicationName"], "cmp-gw");
    assert_eq!(records[0]["status"], "SUCCESSFUL");
    assert_eq!(records[0]["operationIds"][0], "ku-1");
    assert_eq!(records[1]["applicationName"], "est-gw");
}

#[tokio::test]
async fn test_unreachable_ca_is_audited_as_error() {
    let ca = TestCa::new("X");
    let dir = tempfile::tempdir().unwrap();
    let toml = write_fixture(dir.path(), &ca, "http://127.0.0.1:9/gw", true);
    let responder = ConfigLoader::new()
        .load_from_str(&toml)
        .unwrap()
        .build_responder()
        .unwrap();

    let body = serde_json::json!({
        "entries": [{ "id": "r-1", "operation": "revoke",
                      "oldCertId": { "issuer": "CN=X", "serialNumber": "7b" } }]
    });
    let resp = responder
        .service(InboundRequest::post(
            CMP_MOUNT,
            "application/json",
            body.to_string(),
        ))
        .await;
    let answer: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(answer["entries"][0]["error"]["code"], "systemUnavailable");

    let audit = std::fs::read_to_string(dir.path().join("audit/audit.jsonl")).unwrap();
    let record: serde_json::Value = serde_json::from_str(audit.lines().next().unwrap()).unwrap();
    assert_eq!(record["status"], "FAILED");
    assert_eq!(record["level"], "ERROR");
}

#[test]
fn test_missing_key_file_fails_startup() {
    let ca = TestCa::new("X");
    let dir = tempfile::tempdir().unwrap();
    let toml = write_fixture(dir.path(), &ca, "https://ca.example.com/gw", false);
    std::fs::remove_file(dir.path().join("pop.pem")).unwrap();

    let config = ConfigLoader::new().load_from_str(&toml).unwrap();
    let err = config.build_responder().unwrap_err();
    assert!(err.to_string().contains("pop.pem"));
}

#[test]
fn test_loader_reads_file_from_env_var() {
    let ca = TestCa::new("X");
    let dir = tempfile::tempdir().unwrap();
    let toml = write_fixture(dir.path(), &ca, "https://ca.example.com/gw", false);
    let config_path = dir.path().join("gateway.toml");
    std::fs::write(&config_path, toml).unwrap();

    let var = "CA_GATEWAY_CONFIG_INTEGRATION_TEST";
    // SAFETY: the variable name is private to this test
    unsafe { std::env::set_var(var, &config_path) };
    let config = ConfigLoader::new().with_env_var(var).load().unwrap();
    unsafe { std::env::remove_var(var) };

    assert_eq!(config.backend.ca_name, "issuing");
    assert_eq!(config.signers[0].parallelism, 2);
    assert!(config.scep.is_none());
}

#[test]
fn test_written_default_config_loads_after_edit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("etc/ca-gateway.toml");
    usg_ca_gateway::config::write_default_config(&path).unwrap();

    let config = ConfigLoader::new()
        .with_path(&path)
        .with_validate(false)
        .load()
        .unwrap();
    assert!(!config.signers.is_empty());
}
