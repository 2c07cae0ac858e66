//! JSON-over-HTTPS CA client.
//!
//! A batch is POSTed to `{url}/{ca_name}/requests`:
//!
//! ```json
//! {"requests":[{"id":"id-1","operation":"keyUpdate","profile":"tls",
//!   "subject":"<b64 DER Name>","publicKey":"<b64 DER SPKI>",
//!   "pop":{"algorithm":"<b64 DER>","signature":"<b64>"},
//!   "oldCertId":{"issuer":"<b64 DER Name>","serialNumber":"7b"}}]}
//! ```
//!
//! and answered with one result per id:
//!
//! ```json
//! {"results":[{"id":"id-1","certificate":"<b64 DER>"},
//!             {"id":"id-2","error":{"code":"badPOP","message":"..."}}]}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use der::{Decode, Encode};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use url::Url;
use x509_cert::Certificate;

use super::{BackendError, CaClient};
use crate::error::{GatewayError, Result};
use crate::types::{
    CertifiedOutcome, EnrollmentRequest, EnrollmentResult, ErrorCode, ErrorOutcome, Operation,
    Outcome, RevocationReason,
};

/// Connection settings for [`HttpCaClient`].
#[derive(Clone)]
pub struct CaClientConfig {
    /// CA service base URL (e.g., "https://ca.example.com/gw").
    pub url: Url,

    /// Name of the CA addressed on the service.
    pub ca_name: String,

    /// Client identity for TLS client certificate authentication.
    pub client_identity: Option<ClientIdentity>,

    /// HTTP Basic authentication credentials.
    pub http_auth: Option<HttpAuth>,

    /// Trust anchors for verifying the CA service.
    pub trust_anchors: TrustAnchors,

    /// Request timeout.
    pub timeout: Duration,

    /// Additional HTTP headers sent with every request.
    pub additional_headers: Vec<(String, String)>,
}

impl std::fmt::Debug for CaClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaClientConfig")
            .field("url", &self.url)
            .field("ca_name", &self.ca_name)
            .field("client_identity", &self.client_identity.is_some())
            .field("http_auth", &self.http_auth.is_some())
            .field("trust_anchors", &self.trust_anchors)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CaClientConfig {
    /// Create a new configuration builder.
    pub fn builder() -> CaClientConfigBuilder {
        CaClientConfigBuilder::new()
    }

    /// URL batches are posted to.
    pub fn submit_url(&self) -> Url {
        let mut url = self.url.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}/{}/requests", base, self.ca_name));
        url
    }
}

/// Builder for [`CaClientConfig`].
#[derive(Default)]
pub struct CaClientConfigBuilder {
    url: Option<Url>,
    ca_name: Option<String>,
    client_identity: Option<ClientIdentity>,
    http_auth: Option<HttpAuth>,
    trust_anchors: Option<TrustAnchors>,
    timeout: Option<Duration>,
    additional_headers: Vec<(String, String)>,
}

impl CaClientConfigBuilder {
    /// Create a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the CA service URL.
    pub fn url(mut self, url: impl AsRef<str>) -> std::result::Result<Self, url::ParseError> {
        self.url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Set the CA name.
    pub fn ca_name(mut self, name: impl Into<String>) -> Self {
        self.ca_name = Some(name.into());
        self
    }

    /// Set the client identity for TLS client authentication.
    pub fn client_identity(mut self, identity: ClientIdentity) -> Self {
        self.client_identity = Some(identity);
        self
    }

    /// Set HTTP Basic authentication credentials.
    pub fn http_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.http_auth = Some(HttpAuth::new(username, password));
        self
    }

    /// Use explicit CA certificates (PEM) for server verification.
    pub fn trust_explicit(mut self, ca_certs: Vec<Vec<u8>>) -> Self {
        self.trust_anchors = Some(TrustAnchors::Explicit(ca_certs));
        self
    }

    /// Set the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add an HTTP header to all requests.
    pub fn add_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_headers.push((name.into(), value.into()));
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL or CA name is not set.
    pub fn build(self) -> std::result::Result<CaClientConfig, &'static str> {
        let url = self.url.ok_or("url is required")?;
        let ca_name = self.ca_name.ok_or("ca_name is required")?;
        if ca_name.is_empty() || ca_name.contains('/') {
            return Err("ca_name must be a single path segment");
        }

        Ok(CaClientConfig {
            url,
            ca_name,
            client_identity: self.client_identity,
            http_auth: self.http_auth,
            trust_anchors: self.trust_anchors.unwrap_or(TrustAnchors::WebPki),
            timeout: self.timeout.unwrap_or(Duration::from_secs(30)),
            additional_headers: self.additional_headers,
        })
    }
}

/// Client identity for TLS client certificate authentication.
#[derive(Clone)]
pub struct ClientIdentity {
    /// PEM-encoded certificate chain, leaf first.
    pub cert_pem: Vec<u8>,

    /// PEM-encoded private key.
    pub key_pem: Vec<u8>,
}

impl ClientIdentity {
    /// Create a new client identity from PEM-encoded data.
    pub fn new(cert_pem: impl Into<Vec<u8>>, key_pem: impl Into<Vec<u8>>) -> Self {
        Self {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    /// Create a client identity from file paths.
    pub fn from_files(
        cert_path: impl AsRef<std::path::Path>,
        key_path: impl AsRef<std::path::Path>,
    ) -> std::io::Result<Self> {
        let cert_pem = std::fs::read(cert_path)?;
        let key_pem = std::fs::read(key_path)?;
        Ok(Self { cert_pem, key_pem })
    }
}

/// HTTP Basic authentication credentials.
#[derive(Clone)]
pub struct HttpAuth {
    /// Username.
    pub username: String,

    /// Password.
    pub password: String,
}

impl HttpAuth {
    /// Create new HTTP auth credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Trust anchors for verifying the CA service certificate.
#[derive(Clone)]
pub enum TrustAnchors {
    /// Built-in web PKI roots.
    WebPki,

    /// Explicit CA certificates (PEM-encoded).
    Explicit(Vec<Vec<u8>>),
}

impl std::fmt::Debug for TrustAnchors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WebPki => write!(f, "WebPki"),
            Self::Explicit(certs) => write!(f, "Explicit({} certs)", certs.len()),
        }
    }
}

/// Build a reqwest Client for the CA service.
fn build_http_client(config: &CaClientConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.timeout)
        .use_rustls_tls()
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .user_agent(crate::USER_AGENT);

    match &config.trust_anchors {
        TrustAnchors::WebPki => {
            builder = builder.tls_built_in_root_certs(true);
        }
        TrustAnchors::Explicit(ca_certs) => {
            builder = builder.tls_built_in_root_certs(false);
            for ca_pem in ca_certs {
                let cert = reqwest::Certificate::from_pem(ca_pem).map_err(|e| {
                    GatewayError::config(format!("Failed to parse CA service trust anchor: {e}"))
                })?;
                builder = builder.add_root_certificate(cert);
            }
        }
    }

    if let Some(identity) = &config.client_identity {
        let mut pem_data = identity.cert_pem.clone();
        pem_data.extend_from_slice(b"\n");
        pem_data.extend_from_slice(&identity.key_pem);
        let identity = reqwest::Identity::from_pem(&pem_data)
            .map_err(|e| GatewayError::config(format!("Failed to create client identity: {e}")))?;
        builder = builder.identity(identity);
    }

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in &config.additional_headers {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::try_from(name.as_str()),
            reqwest::header::HeaderValue::try_from(value.as_str()),
        ) {
            headers.insert(name, value);
        }
    }
    builder = builder.default_headers(headers);

    builder
        .build()
        .map_err(|e| GatewayError::config(format!("Failed to build HTTP client: {e}")))
}

/// CA client speaking JSON over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpCaClient {
    config: CaClientConfig,
    http: reqwest::Client,
}

impl HttpCaClient {
    /// Create a client from the given configuration.
    pub fn new(config: CaClientConfig) -> Result<Self> {
        let http = build_http_client(&config)?;
        Ok(Self { config, http })
    }

    /// Client configuration.
    pub fn config(&self) -> &CaClientConfig {
        &self.config
    }

    fn classify_transport(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout(self.config.timeout)
        } else if err.is_connect() || err.is_request() {
            BackendError::Unavailable(err.to_string())
        } else {
            BackendError::Unexpected(err.to_string())
        }
    }

    /// Map a non-success HTTP answer to a backend error.
    async fn handle_error_response(&self, response: reqwest::Response) -> BackendError {
        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        if status.is_server_error() {
            return BackendError::Unavailable(format!("HTTP {}: {}", status.as_u16(), text));
        }

        if let Ok(body) = serde_json::from_str::<WireError>(&text) {
            return BackendError::rejected(body.code, body.message);
        }

        let code = match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorCode::NotAuthorized,
            StatusCode::NOT_FOUND => ErrorCode::BadCertId,
            _ => ErrorCode::BadRequest,
        };
        BackendError::rejected(code, text)
    }
}

#[async_trait]
impl CaClient for HttpCaClient {
    async fn submit(
        &self,
        requests: &[EnrollmentRequest],
    ) -> std::result::Result<EnrollmentResult, BackendError> {
        let body = WireBatch {
            requests: requests
                .iter()
                .map(WireRequest::from_request)
                .collect::<std::result::Result<_, _>>()?,
        };

        let url = self.config.submit_url();
        tracing::debug!("POST {} ({} entries)", url, requests.len());

        let mut request = self.http.post(url).json(&body);
        if let Some(auth) = &self.config.http_auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;

        if !response.status().is_success() {
            return Err(self.handle_error_response(response).await);
        }

        let answer: WireAnswer = response
            .json()
            .await
            .map_err(|e| BackendError::Unexpected(format!("undecodable CA answer: {e}")))?;

        answer.into_result()
    }
}

#[derive(Debug, Serialize)]
struct WireBatch {
    requests: Vec<WireRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    id: String,
    operation: Operation,
    profile: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    public_key: Option<String>,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    not_before: Option<OffsetDateTime>,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    not_after: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    extensions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pop: Option<WirePop>,
    ca_generates_keypair: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_cert_id: Option<WireCertId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<RevocationReason>,
}

#[derive(Debug, Serialize)]
struct WirePop {
    algorithm: String,
    signature: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireCertId {
    issuer: String,
    serial_number: String,
}

fn b64_der(value: &impl Encode, what: &str) -> std::result::Result<String, BackendError> {
    value
        .to_der()
        .map(|der| BASE64_STANDARD.encode(der))
        .map_err(|e| BackendError::Unexpected(format!("cannot encode {what}: {e}")))
}

impl WireRequest {
    fn from_request(req: &EnrollmentRequest) -> std::result::Result<Self, BackendError> {
        Ok(Self {
            id: req.id.clone(),
            operation: req.operation,
            profile: req.profile.clone(),
            subject: req
                .subject
                .as_ref()
                .map(|s| b64_der(s, "subject"))
                .transpose()?,
            public_key: req
                .public_key
                .as_ref()
                .map(|k| b64_der(k, "public key"))
                .transpose()?,
            not_before: req.validity.not_before,
            not_after: req.validity.not_after,
            extensions: if req.extension_requests.is_empty() {
                None
            } else {
                Some(b64_der(&req.extension_requests, "extensions")?)
            },
            pop: req
                .proof_of_possession
                .as_ref()
                .map(|pop| {
                    Ok::<_, BackendError>(WirePop {
                        algorithm: b64_der(&pop.algorithm, "POP algorithm")?,
                        signature: BASE64_STANDARD.encode(&pop.signature),
                    })
                })
                .transpose()?,
            ca_generates_keypair: req.ca_generates_keypair,
            old_cert_id: req
                .prior_certificate
                .as_ref()
                .map(|r| {
                    Ok::<_, BackendError>(WireCertId {
                        issuer: b64_der(&r.issuer, "issuer")?,
                        serial_number: r.serial_hex(),
                    })
                })
                .transpose()?,
            reason: req.revocation_reason,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireAnswer {
    results: Vec<WireResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResult {
    id: String,
    #[serde(default)]
    certificate: Option<String>,
    #[serde(default)]
    private_key: Option<String>,
    #[serde(default)]
    revoked: bool,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    code: ErrorCode,
    #[serde(default)]
    message: String,
}

impl WireAnswer {
    fn into_result(self) -> std::result::Result<EnrollmentResult, BackendError> {
        let mut result = EnrollmentResult::new();
        for entry in self.results {
            let outcome = if let Some(error) = entry.error {
                Outcome::Error(ErrorOutcome::new(error.code, error.message))
            } else if let Some(cert_b64) = entry.certificate {
                let der = BASE64_STANDARD.decode(cert_b64).map_err(|e| {
                    BackendError::Unexpected(format!("{}: bad certificate base64: {e}", entry.id))
                })?;
                let certificate = Certificate::from_der(&der).map_err(|e| {
                    BackendError::Unexpected(format!("{}: bad certificate: {e}", entry.id))
                })?;
                let private_key = entry
                    .private_key
                    .map(|k| BASE64_STANDARD.decode(k))
                    .transpose()
                    .map_err(|e| {
                        BackendError::Unexpected(format!("{}: bad private key: {e}", entry.id))
                    })?;
                Outcome::Certified(CertifiedOutcome {
                    certificate,
                    private_key,
                })
            } else if entry.revoked {
                Outcome::Revoked
            } else {
                return Err(BackendError::Unexpected(format!(
                    "{}: result carries neither certificate nor error",
                    entry.id
                )));
            };
            result.insert(entry.id, outcome);
        }
        Ok(result)
    }
}
