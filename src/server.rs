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

//! HTTP listener.
//!
//! A thin axum layer: every request other than `/health` is converted into
//! an [`InboundRequest`], handed to the [`Responder`], and its
//! [`WireResponse`] written back unchanged. TLS is terminated in front of
//! the gateway; the terminator forwards the verified client certificate as
//! base64 DER in the `X-Client-Cert` header.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use base64::prelude::*;

use crate::protocol::{InboundRequest, WireResponse};
use crate::responder::Responder;

/// Header carrying the TLS client certificate (base64 DER).
pub const CLIENT_CERT_HEADER: &str = "x-client-cert";

/// Largest request body accepted.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the gateway router.
pub fn router(responder: Arc<Responder>) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(dispatch)
        .with_state(responder)
}

async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
    }))
}

async fn dispatch(State(responder): State<Arc<Responder>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!("Cannot read request body for {}: {e}", parts.uri.path());
            return into_response(responder.reject(
                &parts.method,
                parts.uri.path(),
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
            ));
        }
    };

    let mut inbound = InboundRequest::new(parts.method, parts.uri.path());
    inbound.query = parts.uri.query().map(str::to_string);
    inbound.content_type = header_str(&parts.headers, header::CONTENT_TYPE.as_str());
    inbound.body = body;
    inbound.client_certificate = client_certificate(&parts.headers);

    into_response(responder.service(inbound).await)
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Decode the forwarded client certificate. A malformed header is treated as
/// no certificate.
fn client_certificate(headers: &HeaderMap) -> Option<Vec<u8>> {
    let value = header_str(headers, CLIENT_CERT_HEADER)?;
    match BASE64_STANDARD.decode(value.trim()) {
        Ok(der) if !der.is_empty() => Some(der),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!("Ignoring malformed {CLIENT_CERT_HEADER} header: {e}");
            None
        }
    }
}

fn into_response(wire: WireResponse) -> Response {
    let mut headers = HeaderMap::new();
    if let Some(content_type) = &wire.content_type
        && let Ok(value) = HeaderValue::try_from(content_type.as_str())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    for (name, value) in &wire.headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::warn!("Dropping unrepresentable response header '{name}'"),
        }
    }

    (wire.status, headers, Body::from(wire.body)).into_response()
}
