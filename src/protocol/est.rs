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

//! EST server side (RFC 7030).
//!
//! Paths below the mount are `/{operation}` or `/{label}/{operation}`, the
//! label selecting the certificate profile:
//!
//! - `GET cacerts`: CA certificates as base64 certs-only PKCS#7
//! - `GET csrattrs`: no attributes are required (204)
//! - `POST simpleenroll`: base64 PKCS#10, answered with base64 PKCS#7
//! - `POST simplereenroll`: same, keyed by the TLS client certificate
//! - `POST serverkeygen`: CA generates the key; `multipart/mixed` answer
//!   carrying the PKCS#8 key and the certificate

use std::sync::Arc;

use der::Decode;
use http::{Method, StatusCode};
use x509_cert::Certificate;

use super::{
    Batch, BatchContext, Decoded, InboundRequest, WireResponse, client_message, new_request_id,
    profile_and_operation, require_method, status_for_code, status_for_error,
    with_code_retry_hint, with_retry_hint,
};
use crate::error::{GatewayError, Result};
use crate::security::HashAlgo;
use crate::types::pkcs7::{build_certs_only, decode_base64, encode_base64_wrapped};
use crate::types::pkcs10::parse_csr;
use crate::types::{
    CertReference, CertifiedOutcome, EnrollmentRequest, EnrollmentResult, Outcome, content_types,
};

/// Line length of base64 bodies.
const BASE64_LINE: usize = 64;

/// EST operations that reach the CA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstOperation {
    /// `/simpleenroll`
    SimpleEnroll,
    /// `/simplereenroll`
    SimpleReenroll,
    /// `/serverkeygen`
    ServerKeygen,
}

impl EstOperation {
    /// Path segment of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SimpleEnroll => "simpleenroll",
            Self::SimpleReenroll => "simplereenroll",
            Self::ServerKeygen => "serverkeygen",
        }
    }
}

/// EST adapter.
#[derive(Debug, Clone)]
pub struct EstAdapter {
    default_profile: String,
    ca_certs: Arc<Vec<Certificate>>,
}

impl EstAdapter {
    /// Create an adapter answering `cacerts` with `ca_certs`.
    pub fn new(default_profile: impl Into<String>, ca_certs: Vec<Certificate>) -> Self {
        Self {
            default_profile: default_profile.into(),
            ca_certs: Arc::new(ca_certs),
        }
    }

    /// Profile used when the path carries no label.
    pub fn default_profile(&self) -> &str {
        &self.default_profile
    }

    pub(crate) fn decode(&self, sub_path: &str, request: &InboundRequest) -> Result<Decoded> {
        let (profile, op) = profile_and_operation(sub_path, &self.default_profile)?;

        let operation = match op {
            "cacerts" => {
                require_method(request, &[Method::GET], op)?;
                return self.cacerts().map(Decoded::Respond);
            }
            "csrattrs" => {
                require_method(request, &[Method::GET], op)?;
                return Ok(Decoded::Respond(WireResponse::new(StatusCode::NO_CONTENT)));
            }
            "simpleenroll" => EstOperation::SimpleEnroll,
            "simplereenroll" => EstOperation::SimpleReenroll,
            "serverkeygen" => EstOperation::ServerKeygen,
            _ => return Err(GatewayError::unknown_path(sub_path)),
        };
        require_method(request, &[Method::POST], op)?;

        if !request.content_type_is(content_types::PKCS10) {
            return Err(GatewayError::malformed(format!(
                "Expected {} body, got {}",
                content_types::PKCS10,
                request.content_type.as_deref().unwrap_or_default()
            )));
        }
        if request.body.is_empty() {
            return Err(GatewayError::malformed("Empty request body"));
        }

        let csr_der = decode_base64(&request.body)?;
        let csr = parse_csr(&csr_der)?;
        let id = new_request_id();

        let enrollment = match operation {
            EstOperation::SimpleEnroll => {
                EnrollmentRequest::enroll(id, profile, csr.subject, csr.public_key)
            }
            EstOperation::SimpleReenroll => {
                let der = request.client_certificate.as_deref().ok_or_else(|| {
                    GatewayError::malformed("Re-enrollment requires a client certificate")
                })?;
                let current = Certificate::from_der(der).map_err(|e| {
                    GatewayError::malformed(format!("Bad client certificate: {e}"))
                })?;
                tracing::debug!(
                    "Re-enrollment of certificate sha256:{}",
                    HashAlgo::Sha256.hex_hash(der)
                );
                EnrollmentRequest::key_update(
                    id,
                    profile,
                    csr.subject,
                    Some(csr.public_key),
                    CertReference::from_certificate(&current),
                )
            }
            EstOperation::ServerKeygen => {
                EnrollmentRequest::enroll_with_ca_key(id, profile, csr.subject)
            }
        }
        .with_extensions(csr.extensions);

        Ok(Decoded::Submit(Batch {
            requests: vec![enrollment],
            context: BatchContext::Est(operation),
        }))
    }

    pub(crate) fn encode(&self, batch: &Batch, result: &EnrollmentResult) -> Result<WireResponse> {
        let BatchContext::Est(operation) = batch.context else {
            return Err(GatewayError::internal("EST adapter given a foreign batch"));
        };
        let request = batch
            .requests
            .first()
            .ok_or_else(|| GatewayError::internal("EST batch without request"))?;

        match result.outcome_or_missing(&request.id) {
            Outcome::Certified(issued) if operation == EstOperation::ServerKeygen => {
                server_keygen_response(&issued)
            }
            Outcome::Certified(issued) => {
                let p7 = build_certs_only(std::slice::from_ref(&issued.certificate))?;
                Ok(base64_response(content_types::PKCS7_CERTS_ONLY, &p7))
            }
            Outcome::Revoked => Err(GatewayError::internal(
                "CA answered an EST enrollment with a revocation",
            )),
            Outcome::Error(error) => {
                let response = WireResponse::text(status_for_code(error.code), error.message);
                Ok(with_code_retry_hint(response, error.code))
            }
        }
    }

    pub(crate) fn encode_error(&self, error: &GatewayError) -> WireResponse {
        let response = WireResponse::text(status_for_error(error), client_message(error));
        with_retry_hint(response, error)
    }

    fn cacerts(&self) -> Result<WireResponse> {
        if self.ca_certs.is_empty() {
            return Err(GatewayError::internal("no CA certificates configured"));
        }
        let p7 = build_certs_only(&self.ca_certs)?;
        Ok(base64_response(content_types::PKCS7_CERTS_ONLY, &p7))
    }
}

fn base64_response(content_type: &str, der: &[u8]) -> WireResponse {
    WireResponse::ok(content_type, encode_base64_wrapped(der, BASE64_LINE))
        .with_header("Content-Transfer-Encoding", "base64")
}

fn server_keygen_response(issued: &CertifiedOutcome) -> Result<WireResponse> {
    let key = issued
        .private_key
        .as_deref()
        .ok_or_else(|| GatewayError::internal("CA returned no private key for serverkeygen"))?;
    let p7 = build_certs_only(std::slice::from_ref(&issued.certificate))?;

    let boundary = format!("est-{}", uuid::Uuid::new_v4().simple());
    let mut body = String::new();
    for (content_type, der) in [
        (content_types::PKCS8, key),
        (content_types::PKCS7_CERTS_ONLY, p7.as_slice()),
    ] {
        body.push_str(&format!(
            "--{boundary}\r\nContent-Type: {content_type}\r\n\
             Content-Transfer-Encoding: base64\r\n\r\n{}\r\n",
            encode_base64_wrapped(der, BASE64_LINE)
        ));
    }
    body.push_str(&format!("--{boundary}--\r\n"));

    Ok(WireResponse::ok(
        format!("{}; boundary={boundary}", content_types::MULTIPART_MIXED),
        body,
    ))
}
