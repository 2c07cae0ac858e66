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

//! Protocol adapters.
//!
//! Each adapter turns one wire protocol into canonical
//! [`EnrollmentRequest`](crate::types::EnrollmentRequest)s and turns the
//! canonical [`EnrollmentResult`] back into protocol bytes. The set of
//! protocols is closed; [`ProtocolAdapter`] dispatches by `match`.
//!
//! | Protocol | Default mount | Module |
//! |----------|---------------|--------|
//! | EST (RFC 7030) | `/.well-known/est` | [`est`] |
//! | SCEP (RFC 8894) | `/scep` | [`scep`] |
//! | CMP-style update (JSON) | `/cmp` | [`cmp`] |
//! | ACME (RFC 8555 subset) | `/acme` | [`acme`] |

pub mod acme;
pub mod cmp;
pub mod est;
pub mod scep;

use std::fmt;

use bytes::Bytes;
use http::{Method, StatusCode};

use crate::error::{GatewayError, Result};
use crate::types::{EnrollmentRequest, EnrollmentResult, ErrorCode};

pub use acme::AcmeAdapter;
pub use cmp::CmpAdapter;
pub use est::EstAdapter;
pub use scep::ScepAdapter;

/// An HTTP request as seen by the responder.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// HTTP method.
    pub method: Method,
    /// Request path, without query.
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: Option<String>,
    /// `Content-Type` header value.
    pub content_type: Option<String>,
    /// Request body.
    pub body: Bytes,
    /// DER client certificate presented to the TLS terminator, if any.
    pub client_certificate: Option<Vec<u8>>,
}

impl InboundRequest {
    /// Create a request with an empty body.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            content_type: None,
            body: Bytes::new(),
            client_certificate: None,
        }
    }

    /// Shortcut for a GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Shortcut for a POST request with a body.
    pub fn post(
        path: impl Into<String>,
        content_type: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self::new(Method::POST, path).with_body(content_type, body)
    }

    /// Set the body and its content type.
    pub fn with_body(mut self, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.content_type = Some(content_type.into());
        self.body = body.into();
        self
    }

    /// Set the raw query string.
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Set the TLS client certificate (DER).
    pub fn with_client_certificate(mut self, der: impl Into<Vec<u8>>) -> Self {
        self.client_certificate = Some(der.into());
        self
    }

    /// First value of the query parameter `name`, percent-decoded.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Returns true if the declared content type matches `expected`,
    /// ignoring parameters and case. A missing header matches.
    pub fn content_type_is(&self, expected: &str) -> bool {
        match &self.content_type {
            None => true,
            Some(ct) => ct
                .split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(expected)),
        }
    }
}

/// A protocol response ready to be written to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// `Content-Type` header, if there is a body.
    pub content_type: Option<String>,
    /// Additional headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

impl WireResponse {
    /// Empty response with the given status.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            content_type: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// 200 response with a body.
    pub fn ok(content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new(StatusCode::OK).with_body(content_type, body)
    }

    /// Plain text response.
    pub fn text(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(status).with_body(crate::types::content_types::TEXT_PLAIN, message.into())
    }

    /// The protocol-agnostic answer to an internal fault. Carries no detail.
    pub fn internal_error() -> Self {
        Self::text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
    }

    /// Set the body.
    pub fn with_body(mut self, content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.content_type = Some(content_type.into());
        self.body = body.into();
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First value of header `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Mounted protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Enrollment over Secure Transport.
    Est,
    /// Simple Certificate Enrollment Protocol.
    Scep,
    /// CMP-style certificate update.
    CmpUpdate,
    /// ACME-style enrollment.
    Acme,
}

impl Protocol {
    /// Protocol name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Est => "EST",
            Self::Scep => "SCEP",
            Self::CmpUpdate => "CMP",
            Self::Acme => "ACME",
        }
    }

    /// Application name stamped on audit events.
    pub fn application_name(&self) -> &'static str {
        match self {
            Self::Est => "est-gw",
            Self::Scep => "scep-gw",
            Self::CmpUpdate => "cmp-gw",
            Self::Acme => "acme-gw",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adapter-specific data carried from decode to encode.
#[derive(Debug, Clone)]
pub enum BatchContext {
    /// EST operation.
    Est(est::EstOperation),
    /// SCEP transaction.
    Scep(scep::ScepTransaction),
    /// CMP-style transaction.
    Cmp(cmp::CmpTransaction),
    /// ACME operation.
    Acme(acme::AcmeOperation),
}

impl BatchContext {
    /// Protocol operation name for logs and audit.
    pub fn operation_name(&self) -> &'static str {
        match self {
            Self::Est(op) => op.as_str(),
            Self::Scep(tx) => tx.message_type.as_str(),
            Self::Cmp(_) => "update",
            Self::Acme(op) => op.as_str(),
        }
    }
}

/// Decoded requests of one HTTP request, plus what encode needs to know.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Canonical requests, in wire order.
    pub requests: Vec<EnrollmentRequest>,
    /// Adapter context.
    pub context: BatchContext,
}

impl Batch {
    /// Request ids in wire order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.requests.iter().map(|r| r.id.as_str())
    }
}

/// Result of decoding.
#[derive(Debug, Clone)]
pub enum Decoded {
    /// The adapter answered on its own (capabilities, CA certs, nonces).
    Respond(WireResponse),
    /// Requests for the CA.
    Submit(Batch),
}

/// The closed set of protocol adapters.
#[derive(Debug, Clone)]
pub enum ProtocolAdapter {
    /// EST
    Est(EstAdapter),
    /// SCEP
    Scep(ScepAdapter),
    /// CMP-style update
    CmpUpdate(CmpAdapter),
    /// ACME
    Acme(AcmeAdapter),
}

impl ProtocolAdapter {
    /// Protocol implemented by this adapter.
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Est(_) => Protocol::Est,
            Self::Scep(_) => Protocol::Scep,
            Self::CmpUpdate(_) => Protocol::CmpUpdate,
            Self::Acme(_) => Protocol::Acme,
        }
    }

    /// Decode `request`; `sub_path` is the request path below the mount.
    pub fn decode(&self, sub_path: &str, request: &InboundRequest) -> Result<Decoded> {
        match self {
            Self::Est(a) => a.decode(sub_path, request),
            Self::Scep(a) => a.decode(sub_path, request),
            Self::CmpUpdate(a) => a.decode(sub_path, request),
            Self::Acme(a) => a.decode(sub_path, request),
        }
    }

    /// Encode the backend result for `batch`.
    pub fn encode(&self, batch: &Batch, result: &EnrollmentResult) -> Result<WireResponse> {
        match self {
            Self::Est(a) => a.encode(batch, result),
            Self::Scep(a) => a.encode(batch, result),
            Self::CmpUpdate(a) => a.encode(batch, result),
            Self::Acme(a) => a.encode(batch, result),
        }
    }

    /// Protocol-specific answer to a request-level failure.
    pub fn encode_error(&self, error: &GatewayError) -> WireResponse {
        match self {
            Self::Est(a) => a.encode_error(error),
            Self::Scep(a) => a.encode_error(error),
            Self::CmpUpdate(a) => a.encode_error(error),
            Self::Acme(a) => a.encode_error(error),
        }
    }
}

/// HTTP status for a canonical error code.
pub(crate) fn status_for_code(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::BadRequest | ErrorCode::BadCertTemplate | ErrorCode::BadPop => {
            StatusCode::BAD_REQUEST
        }
        ErrorCode::BadCertId => StatusCode::NOT_FOUND,
        ErrorCode::NotAuthorized => StatusCode::FORBIDDEN,
        ErrorCode::SystemUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::SystemFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// HTTP status for a request-level failure.
pub(crate) fn status_for_error(error: &GatewayError) -> StatusCode {
    match error {
        GatewayError::MalformedRequest(_) | GatewayError::BadPop(_) => StatusCode::BAD_REQUEST,
        GatewayError::Unauthorized(_) => StatusCode::FORBIDDEN,
        GatewayError::UnknownPath(_) => StatusCode::NOT_FOUND,
        GatewayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
        GatewayError::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Backend(err) => status_for_code(err.to_error_outcome().code),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Canonical error code for a request-level failure.
pub(crate) fn code_for_error(error: &GatewayError) -> ErrorCode {
    match error {
        GatewayError::MalformedRequest(_)
        | GatewayError::UnknownPath(_)
        | GatewayError::MethodNotAllowed { .. } => ErrorCode::BadRequest,
        GatewayError::BadPop(_) => ErrorCode::BadPop,
        GatewayError::Unauthorized(_) => ErrorCode::NotAuthorized,
        GatewayError::ResourceExhausted { .. } => ErrorCode::SystemUnavailable,
        GatewayError::Backend(err) => err.to_error_outcome().code,
        _ => ErrorCode::SystemFailure,
    }
}

/// Message safe to show to the client for a request-level failure.
pub(crate) fn client_message(error: &GatewayError) -> String {
    match error {
        GatewayError::MalformedRequest(_)
        | GatewayError::UnknownPath(_)
        | GatewayError::MethodNotAllowed { .. }
        | GatewayError::BadPop(_)
        | GatewayError::Unauthorized(_) => error.to_string(),
        GatewayError::ResourceExhausted { .. } => "Service busy, retry later".to_string(),
        GatewayError::Signing(_) => "Request could not be signed".to_string(),
        GatewayError::Backend(err) => err.to_error_outcome().message,
        _ => "Internal error".to_string(),
    }
}

/// Add `Retry-After` when the failure is worth retrying.
pub(crate) fn with_retry_hint(response: WireResponse, error: &GatewayError) -> WireResponse {
    match error.retry_after() {
        Some(secs) => response.with_header("Retry-After", secs.to_string()),
        None => response,
    }
}

/// Add `Retry-After` to answers reporting a temporarily unavailable CA.
pub(crate) fn with_code_retry_hint(response: WireResponse, code: ErrorCode) -> WireResponse {
    if code == ErrorCode::SystemUnavailable {
        response.with_header(
            "Retry-After",
            crate::error::DEFAULT_RETRY_AFTER_SECS.to_string(),
        )
    } else {
        response
    }
}

/// Split `sub_path` into an optional profile and the operation segment.
///
/// `/op` and `/profile/op` are accepted.
pub(crate) fn profile_and_operation<'a>(
    sub_path: &'a str,
    default_profile: &'a str,
) -> Result<(&'a str, &'a str)> {
    let segments: Vec<&str> = sub_path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [op] => Ok((default_profile, *op)),
        [profile, op] => Ok((*profile, *op)),
        _ => Err(GatewayError::unknown_path(sub_path)),
    }
}

/// Fail with 405 unless `request` uses one of `allowed`.
pub(crate) fn require_method(
    request: &InboundRequest,
    allowed: &[Method],
    operation: &str,
) -> Result<()> {
    if allowed.contains(&request.method) {
        Ok(())
    } else {
        Err(GatewayError::method_not_allowed(
            request.method.as_str(),
            operation,
        ))
    }
}

/// Fresh request id for protocols that do not carry one.
pub(crate) fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use std::time::Duration;

    #[test]
    fn test_query_param_decoding() {
        let req = InboundRequest::get("/scep/pkiclient.exe")
            .with_query("operation=PKIOperation&message=ab%2Bcd%3D");
        assert_eq!(req.query_param("operation").as_deref(), Some("PKIOperation"));
        assert_eq!(req.query_param("message").as_deref(), Some("ab+cd="));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn test_content_type_matching() {
        let req = InboundRequest::post("/x", "Application/PKCS10; charset=binary", "x");
        assert!(req.content_type_is("application/pkcs10"));
        assert!(!req.content_type_is("application/json"));
        assert!(InboundRequest::get("/x").content_type_is("application/json"));
    }

    #[test]
    fn test_profile_and_operation() {
        assert_eq!(
            profile_and_operation("/simpleenroll", "tls").unwrap(),
            ("tls", "simpleenroll")
        );
        assert_eq!(
            profile_and_operation("/smime/simpleenroll/", "tls").unwrap(),
            ("smime", "simpleenroll")
        );
        assert!(profile_and_operation("", "tls").is_err());
        assert!(profile_and_operation("/a/b/c", "tls").is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for_error(&GatewayError::malformed("x")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for_error(&GatewayError::resource_exhausted("ra", Duration::ZERO)),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for_error(&GatewayError::Backend(BackendError::rejected(
                ErrorCode::NotAuthorized,
                "no"
            ))),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for_error(&GatewayError::signing("x")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for_error(&GatewayError::bad_pop("csr")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            code_for_error(&GatewayError::bad_pop("csr")),
            ErrorCode::BadPop
        );
        assert_eq!(
            status_for_error(&GatewayError::unauthorized("jwk")),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            code_for_error(&GatewayError::unauthorized("jwk")),
            ErrorCode::NotAuthorized
        );
    }

    #[test]
    fn test_client_message_hides_internals() {
        let msg = client_message(&GatewayError::signing("PKCS#11 slot 3 CKR_DEVICE_ERROR"));
        assert!(!msg.contains("slot"));
        let msg = client_message(&GatewayError::internal("db password wrong"));
        assert!(!msg.contains("password"));
    }

    #[test]
    fn test_wire_response_headers() {
        let resp = WireResponse::new(StatusCode::NO_CONTENT).with_header("Replay-Nonce", "abc");
        assert_eq!(resp.header("replay-nonce"), Some("abc"));
        assert!(resp.is_success());
    }
}
