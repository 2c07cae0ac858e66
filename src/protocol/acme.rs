// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! ACME-style enrollment (a stateless subset of RFC 8555).
//!
//! Account and order management live in front of the gateway. The adapter
//! serves the directory and nonces locally and turns `finalize` and
//! `revoke-cert` into CA requests. Nonces are fresh random values; replay
//! tracking belongs to the account layer.
//!
//! Requests signed with a `kid` are authenticated by the account layer that
//! owns the account keys. A `revoke-cert` signed with an embedded `jwk` is
//! authenticated here: the JWS must verify under that key, and the key must
//! be the one certified in the certificate being revoked.

use std::sync::Arc;

use base64::prelude::*;
use der::{Decode, EncodePem};
use http::{Method, StatusCode};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use url::Url;
use x509_cert::Certificate;

use super::{
    Batch, BatchContext, Decoded, InboundRequest, WireResponse, client_message, new_request_id,
    profile_and_operation, require_method, status_for_code, status_for_error,
};
use crate::error::{DEFAULT_RETRY_AFTER_SECS, GatewayError, Result};
use crate::security::EcVerifier;
use crate::types::pkcs10::parse_csr;
use crate::types::{
    CertReference, EnrollmentRequest, EnrollmentResult, ErrorCode, Outcome, RevocationReason,
    content_types,
};

const NONCE_LEN: usize = 16;

/// ACME operations that reach the CA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmeOperation {
    /// Order finalization with a CSR.
    Finalize,
    /// Certificate revocation.
    RevokeCert,
}

impl AcmeOperation {
    /// Path segment of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finalize => "finalize",
            Self::RevokeCert => "revoke-cert",
        }
    }
}

/// An RFC 7807 problem document with an ACME error type.
#[derive(Debug)]
pub struct AcmeProblem {
    status: StatusCode,
    problem_type: &'static str,
    detail: String,
}

impl AcmeProblem {
    fn new(status: StatusCode, problem_type: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            problem_type,
            detail: detail.into(),
        }
    }

    fn from_code(code: ErrorCode, detail: impl Into<String>) -> Self {
        let problem_type = match code {
            ErrorCode::BadRequest | ErrorCode::BadCertId => "urn:ietf:params:acme:error:malformed",
            ErrorCode::BadCertTemplate | ErrorCode::BadPop => "urn:ietf:params:acme:error:badCSR",
            ErrorCode::NotAuthorized => "urn:ietf:params:acme:error:unauthorized",
            ErrorCode::SystemUnavailable | ErrorCode::SystemFailure => {
                "urn:ietf:params:acme:error:serverInternal"
            }
        };
        Self::new(status_for_code(code), problem_type, detail)
    }

    /// HTTP status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Problem type URN.
    pub fn problem_type(&self) -> &'static str {
        self.problem_type
    }

    fn body(&self) -> ProblemBody<'_> {
        ProblemBody {
            problem_type: self.problem_type,
            detail: &self.detail,
            status: self.status.as_u16(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ProblemBody<'a> {
    #[serde(rename = "type")]
    problem_type: &'static str,
    detail: &'a str,
    status: u16,
}

#[derive(Debug, Deserialize)]
struct FlattenedJws {
    protected: String,
    payload: String,
    signature: String,
}

#[derive(Debug, Deserialize)]
struct ProtectedHeader {
    alg: String,
    nonce: String,
    url: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    jwk: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct EcJwk {
    kty: String,
    #[serde(default)]
    crv: String,
    #[serde(default)]
    x: String,
    #[serde(default)]
    y: String,
}

impl EcJwk {
    fn verifier(&self) -> Result<EcVerifier> {
        if self.kty != "EC" {
            return Err(GatewayError::malformed(format!(
                "Unsupported JWK key type '{}'",
                self.kty
            )));
        }
        EcVerifier::from_coordinates(
            &self.crv,
            &decode_b64url(&self.x, "jwk x")?,
            &decode_b64url(&self.y, "jwk y")?,
        )
    }
}

/// A JWS whose envelope passed all checks.
#[derive(Debug)]
struct VerifiedJws {
    payload: Vec<u8>,
    /// Embedded key the signature verified under, if the JWS carried one.
    jwk: Option<EcVerifier>,
}

#[derive(Debug, Deserialize)]
struct FinalizePayload {
    csr: String,
}

#[derive(Debug, Deserialize)]
struct RevokePayload {
    certificate: String,
    #[serde(default)]
    reason: Option<u64>,
}

/// ACME adapter.
#[derive(Debug, Clone)]
pub struct AcmeAdapter {
    base_url: String,
    default_profile: String,
    ca_certs: Arc<Vec<Certificate>>,
}

impl AcmeAdapter {
    /// Create an adapter. `base_url` is the externally visible URL of the
    /// mount point; it prefixes directory entries and must match the `url`
    /// header of signed requests.
    pub fn new(
        base_url: &str,
        default_profile: impl Into<String>,
        ca_certs: Vec<Certificate>,
    ) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| GatewayError::config(format!("Invalid ACME base URL '{base_url}': {e}")))?;
        if !matches!(parsed.scheme(), "https" | "http") {
            return Err(GatewayError::config(format!(
                "ACME base URL must be http(s): {base_url}"
            )));
        }
        Ok(Self {
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            default_profile: default_profile.into(),
            ca_certs: Arc::new(ca_certs),
        })
    }

    pub(crate) fn decode(&self, sub_path: &str, request: &InboundRequest) -> Result<Decoded> {
        let (profile, op) = profile_and_operation(sub_path, &self.default_profile)?;

        let operation = match op {
            "directory" => {
                require_method(request, &[Method::GET], op)?;
                return self.directory(profile).map(Decoded::Respond);
            }
            "new-nonce" => {
                require_method(request, &[Method::HEAD, Method::GET], op)?;
                let status = if request.method == Method::HEAD {
                    StatusCode::OK
                } else {
                    StatusCode::NO_CONTENT
                };
                return Ok(Decoded::Respond(self.stamp(WireResponse::new(status))));
            }
            "finalize" => AcmeOperation::Finalize,
            "revoke-cert" => AcmeOperation::RevokeCert,
            _ => return Err(GatewayError::unknown_path(sub_path)),
        };
        require_method(request, &[Method::POST], op)?;
        if !request.content_type_is(content_types::JOSE_JSON) {
            return Err(GatewayError::malformed(format!(
                "Expected {} body",
                content_types::JOSE_JSON
            )));
        }

        let expected_url = format!("{}{}", self.base_url, normalize(sub_path));
        let jws = verify_envelope(&request.body, &expected_url, operation)?;
        let id = new_request_id();

        let enrollment = match operation {
            AcmeOperation::Finalize => {
                let payload: FinalizePayload = parse_json(&jws.payload, "finalize payload")?;
                let csr = parse_csr(&decode_b64url(&payload.csr, "csr")?)?;
                EnrollmentRequest::enroll(id, profile, csr.subject, csr.public_key)
                    .with_extensions(csr.extensions)
            }
            AcmeOperation::RevokeCert => {
                let payload: RevokePayload = parse_json(&jws.payload, "revocation payload")?;
                let der = decode_b64url(&payload.certificate, "certificate")?;
                let cert = Certificate::from_der(&der)
                    .map_err(|e| GatewayError::malformed(format!("Bad certificate: {e}")))?;
                if let Some(key) = &jws.jwk {
                    require_certified_key(key, &cert)?;
                }
                let reason = payload
                    .reason
                    .map(|code| {
                        RevocationReason::from_code(code).ok_or_else(|| {
                            GatewayError::malformed(format!("Unknown revocation reason {code}"))
                        })
                    })
                    .transpose()?;
                EnrollmentRequest::revoke(
                    id,
                    profile,
                    CertReference::from_certificate(&cert),
                    reason,
                )
            }
        };

        Ok(Decoded::Submit(Batch {
            requests: vec![enrollment],
            context: BatchContext::Acme(operation),
        }))
    }

    pub(crate) fn encode(&self, batch: &Batch, result: &EnrollmentResult) -> Result<WireResponse> {
        let BatchContext::Acme(operation) = batch.context else {
            return Err(GatewayError::internal("ACME adapter given a foreign batch"));
        };
        let request = batch
            .requests
            .first()
            .ok_or_else(|| GatewayError::internal("ACME batch without request"))?;

        let response = match (operation, result.outcome_or_missing(&request.id)) {
            (AcmeOperation::Finalize, Outcome::Certified(issued)) => {
                let mut chain = String::new();
                for cert in std::iter::once(&issued.certificate).chain(self.ca_certs.iter()) {
                    let pem = cert
                        .to_pem(der::pem::LineEnding::LF)
                        .map_err(|e| GatewayError::internal(format!("PEM encoding: {e}")))?;
                    chain.push_str(&pem);
                }
                WireResponse::ok(content_types::PEM_CERT_CHAIN, chain)
            }
            (AcmeOperation::RevokeCert, Outcome::Revoked) => WireResponse::new(StatusCode::OK),
            (_, Outcome::Error(error)) => {
                problem_response(&AcmeProblem::from_code(error.code, error.message))
            }
            (op, _) => {
                return Err(GatewayError::internal(format!(
                    "CA answer does not fit ACME {}",
                    op.as_str()
                )));
            }
        };
        Ok(self.stamp(response))
    }

    pub(crate) fn encode_error(&self, error: &GatewayError) -> WireResponse {
        let mut problem =
            AcmeProblem::from_code(super::code_for_error(error), client_message(error));
        problem.status = status_for_error(error);
        self.stamp(problem_response(&problem))
    }

    fn directory(&self, profile: &str) -> Result<WireResponse> {
        let prefix = if profile == self.default_profile {
            self.base_url.clone()
        } else {
            format!("{}/{profile}", self.base_url)
        };
        let body = serde_json::json!({
            "newNonce": format!("{prefix}/new-nonce"),
            "revokeCert": format!("{prefix}/revoke-cert"),
            "finalize": format!("{prefix}/finalize"),
            "meta": { "externalAccountRequired": false },
        });
        let body = serde_json::to_vec(&body)
            .map_err(|e| GatewayError::internal(format!("directory encoding: {e}")))?;
        Ok(WireResponse::ok(content_types::JSON, body))
    }

    /// Add the headers every ACME response carries.
    fn stamp(&self, response: WireResponse) -> WireResponse {
        response
            .with_header("Replay-Nonce", new_nonce())
            .with_header("Cache-Control", "no-store")
            .with_header(
                "Link",
                format!("<{}/directory>;rel=\"index\"", self.base_url),
            )
    }
}

fn problem_response(problem: &AcmeProblem) -> WireResponse {
    let body = serde_json::to_vec(&problem.body()).unwrap_or_default();
    let response = WireResponse::new(problem.status).with_body(content_types::PROBLEM_JSON, body);
    if problem.status == StatusCode::SERVICE_UNAVAILABLE && response.header("Retry-After").is_none()
    {
        response.with_header("Retry-After", DEFAULT_RETRY_AFTER_SECS.to_string())
    } else {
        response
    }
}

/// Check the JWS envelope and return the decoded payload.
///
/// A `kid`-signed request is checked for structure and binding to the
/// request URL only. A `jwk`-signed request must also verify under the
/// embedded key.
fn verify_envelope(body: &[u8], expected_url: &str, operation: AcmeOperation) -> Result<VerifiedJws> {
    let jws: FlattenedJws = parse_json(body, "JWS")?;
    let header: ProtectedHeader = parse_json(
        &decode_b64url(&jws.protected, "protected")?,
        "protected header",
    )?;

    if header.alg.is_empty() || header.alg == "none" || header.alg.starts_with("HS") {
        return Err(GatewayError::malformed(format!(
            "Unacceptable JWS algorithm '{}'",
            header.alg
        )));
    }
    if decode_b64url(&header.nonce, "nonce")?.is_empty() {
        return Err(GatewayError::malformed("Empty nonce"));
    }
    if header.url != expected_url {
        return Err(GatewayError::malformed(format!(
            "JWS url '{}' does not match request URL",
            header.url
        )));
    }
    let jwk = match (header.kid, header.jwk) {
        (Some(_), None) => None,
        (None, Some(jwk)) if operation == AcmeOperation::RevokeCert => {
            let jwk: EcJwk = serde_json::from_value(jwk)
                .map_err(|e| GatewayError::malformed(format!("Invalid jwk: {e}")))?;
            Some(jwk.verifier()?)
        }
        (None, Some(_)) => {
            return Err(GatewayError::malformed(format!(
                "{} must be signed with an account key id",
                operation.as_str()
            )));
        }
        _ => {
            return Err(GatewayError::malformed(
                "Exactly one of 'kid' and 'jwk' is required",
            ));
        }
    };
    let signature = decode_b64url(&jws.signature, "signature")?;
    if signature.is_empty() {
        return Err(GatewayError::malformed("Empty JWS signature"));
    }
    if let Some(key) = &jwk {
        let signing_input = format!("{}.{}", jws.protected, jws.payload);
        key.verify_jws(&header.alg, signing_input.as_bytes(), &signature)
            .map_err(|_| GatewayError::unauthorized("JWS signature does not verify under its jwk"))?;
    }

    Ok(VerifiedJws {
        payload: decode_b64url(&jws.payload, "payload")?,
        jwk,
    })
}

/// A `jwk`-signed revocation must come from the certified key itself.
fn require_certified_key(key: &EcVerifier, cert: &Certificate) -> Result<()> {
    let certified = EcVerifier::from_spki(&cert.tbs_certificate.subject_public_key_info)
        .map_err(|_| GatewayError::unauthorized("certificate key cannot sign a revocation"))?;
    if certified.sec1_bytes() != key.sec1_bytes() {
        return Err(GatewayError::unauthorized(
            "JWS key is not the key of the certificate being revoked",
        ));
    }
    Ok(())
}

fn normalize(sub_path: &str) -> String {
    let trimmed = sub_path.trim_matches('/');
    format!("/{trimmed}")
}

fn decode_b64url(value: &str, what: &str) -> Result<Vec<u8>> {
    BASE64_URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| GatewayError::malformed(format!("Bad base64url in {what}: {e}")))
}

fn parse_json<T: serde::de::DeserializeOwned>(data: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| GatewayError::malformed(format!("Invalid {what}: {e}")))
}

fn new_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut bytes);
    BASE64_URL_SAFE_NO_PAD.encode(bytes)
}
