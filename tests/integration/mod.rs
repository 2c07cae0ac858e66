//! Integration test utilities and helpers
//!
//! Shared fixtures for the gateway integration tests: rcgen-generated CA,
//! certificates and CSRs, a scriptable in-process CA backend, and signer
//! pool helpers.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use der::Decode;
use usg_ca_gateway::audit::MemoryAuditSink;
use usg_ca_gateway::backend::{BackendError, CaClient};
use usg_ca_gateway::protocol::{
    AcmeAdapter, CmpAdapter, EstAdapter, ProtocolAdapter, ScepAdapter,
};
use usg_ca_gateway::security::{HashAlgo, KeyAlgorithm, SignerPool, SoftwareSigner};
use usg_ca_gateway::types::{
    CertifiedOutcome, EnrollmentRequest, EnrollmentResult, ErrorCode, ErrorOutcome, Operation,
    Outcome,
};
use usg_ca_gateway::{Certificate, Responder};

/// Mount paths used by [`responder`].
pub const EST_MOUNT: &str = "/.well-known/est";
pub const SCEP_MOUNT: &str = "/scep";
pub const CMP_MOUNT: &str = "/cmp";
pub const ACME_MOUNT: &str = "/acme";

/// Externally visible ACME URL used by [`responder`].
pub const ACME_BASE_URL: &str = "https://gw.example.com/acme";

/// A self-signed CA able to issue leaf certificates.
pub struct TestCa {
    pub certificate: Certificate,
    rc_cert: rcgen::Certificate,
    key: rcgen::KeyPair,
}

impl TestCa {
    /// Create a CA whose subject is `CN={common_name}`.
    pub fn new(common_name: &str) -> Self {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let rc_cert = params.self_signed(&key).unwrap();
        let certificate = Certificate::from_der(rc_cert.der()).unwrap();
        Self {
            certificate,
            rc_cert,
            key,
        }
    }

    /// Issue a leaf for `common_name` with the given serial. Returns the
    /// certificate and the PKCS#8 DER of its key.
    pub fn issue(&self, common_name: &str, serial: &[u8]) -> (Certificate, Vec<u8>) {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec![common_name.to_string()]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);
        params.serial_number = Some(rcgen::SerialNumber::from_slice(serial));
        let cert = params.signed_by(&key, &self.rc_cert, &self.key).unwrap();
        (
            Certificate::from_der(cert.der()).unwrap(),
            key.serialize_der(),
        )
    }

    /// PEM of the CA certificate.
    pub fn pem(&self) -> String {
        self.rc_cert.pem()
    }
}

/// DER PKCS#10 request for `CN={common_name}`.
pub fn csr_der(common_name: &str) -> Vec<u8> {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(vec![common_name.to_string()]).unwrap();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);
    params.serialize_request(&key).unwrap().der().to_vec()
}

/// DER SubjectPublicKeyInfo of a fresh P-256 key.
pub fn spki_der() -> Vec<u8> {
    rcgen::KeyPair::generate().unwrap().public_key_der()
}

/// A pool of `size` handles sharing one generated P-256 key.
pub fn signer_pool(size: usize) -> SignerPool {
    let signer = SoftwareSigner::generate("pop", KeyAlgorithm::EcdsaP256, HashAlgo::Sha256).unwrap();
    SignerPool::replicate("pop", &signer, size).unwrap()
}

/// What the fake CA does with a batch.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Issue (or revoke) every entry.
    Issue,
    /// Fail every entry with a policy code.
    RejectEntries(ErrorCode),
    /// Fail the whole submission.
    Fail(BackendError),
    /// Answer for no entry at all.
    Omit,
    /// Panic inside the client.
    Panic,
}

/// In-process CA backend that records every submission.
pub struct FakeCa {
    behavior: Behavior,
    delay: Option<Duration>,
    leaf: Certificate,
    leaf_key: Vec<u8>,
    submissions: Mutex<Vec<Vec<EnrollmentRequest>>>,
}

impl FakeCa {
    /// A fake CA answering with certificates issued by `ca`.
    pub fn new(ca: &TestCa, behavior: Behavior) -> Self {
        let (leaf, leaf_key) = ca.issue("issued.example", &[0x01, 0x02]);
        Self {
            behavior,
            delay: None,
            leaf,
            leaf_key,
            submissions: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Certificate returned for every issued entry.
    pub fn leaf(&self) -> &Certificate {
        &self.leaf
    }

    /// All batches received so far.
    pub fn submissions(&self) -> Vec<Vec<EnrollmentRequest>> {
        self.submissions.lock().unwrap().clone()
    }

    /// Number of batches received so far.
    pub fn calls(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }
}

#[async_trait]
impl CaClient for FakeCa {
    async fn submit(
        &self,
        requests: &[EnrollmentRequest],
    ) -> Result<EnrollmentResult, BackendError> {
        self.submissions.lock().unwrap().push(requests.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut result = EnrollmentResult::new();
        match &self.behavior {
            Behavior::Issue => {
                for req in requests {
                    let outcome = match req.operation {
                        Operation::Revoke => Outcome::Revoked,
                        _ => Outcome::Certified(CertifiedOutcome {
                            certificate: self.leaf.clone(),
                            private_key: req
                                .ca_generates_keypair
                                .then(|| self.leaf_key.clone()),
                        }),
                    };
                    result.insert(&req.id, outcome);
                }
            }
            Behavior::RejectEntries(code) => {
                for req in requests {
                    result.insert(
                        &req.id,
                        Outcome::Error(ErrorOutcome::new(*code, "rejected by policy")),
                    );
                }
            }
            Behavior::Fail(err) => return Err(err.clone()),
            Behavior::Omit => {}
            Behavior::Panic => panic!("CA client bug"),
        }
        Ok(result)
    }
}

/// A responder with every protocol mounted, backed by `backend`.
pub fn responder(
    ca: &TestCa,
    backend: Arc<FakeCa>,
    pool: Arc<SignerPool>,
    sink: Arc<MemoryAuditSink>,
) -> Responder {
    let chain = vec![ca.certificate.clone()];
    Responder::builder()
        .mount(EST_MOUNT, ProtocolAdapter::Est(EstAdapter::new("tls", chain.clone())))
        .mount(
            SCEP_MOUNT,
            ProtocolAdapter::Scep(ScepAdapter::new("tls", chain.clone())),
        )
        .mount(CMP_MOUNT, ProtocolAdapter::CmpUpdate(CmpAdapter::new("tls")))
        .mount(
            ACME_MOUNT,
            ProtocolAdapter::Acme(AcmeAdapter::new(ACME_BASE_URL, "tls", chain).unwrap()),
        )
        .signer_pool(pool)
        .backend(backend)
        .audit_sink(sink)
        .borrow_timeout(Duration::from_millis(200))
        .backend_timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ca_issues_with_serial() {
        let ca = TestCa::new("X");
        let (leaf, key) = ca.issue("host.example", &[123]);
        assert_eq!(leaf.tbs_certificate.serial_number.as_bytes(), &[123]);
        assert_eq!(
            leaf.tbs_certificate.issuer,
            ca.certificate.tbs_certificate.subject
        );
        assert!(!key.is_empty());
    }

    #[tokio::test]
    async fn test_fake_ca_records_submissions() {
        let ca = TestCa::new("X");
        let fake = FakeCa::new(&ca, Behavior::Omit);
        let result = fake.submit(&[]).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(fake.calls(), 1);
    }
}
