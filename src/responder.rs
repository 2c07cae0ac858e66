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

//! Request pipeline shared by all protocols.
//!
//! Each inbound request walks
//! `RECEIVED -> DECODED -> [LEASED] -> SUBMITTED -> ENCODED -> AUDITED`.
//! Local answers (capabilities, CA certificates, nonces) skip straight from
//! RECEIVED to ENCODED. Whatever happens on the way, exactly one audit event
//! is appended and a protocol response is returned; panics below the
//! responder become a generic 500.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use usg_ca_gateway::backend::CaClient;
//! use usg_ca_gateway::protocol::{EstAdapter, InboundRequest, ProtocolAdapter};
//! use usg_ca_gateway::responder::Responder;
//! use usg_ca_gateway::security::SignerPool;
//!
//! # async fn example(pool: SignerPool, backend: Arc<dyn CaClient>) -> usg_ca_gateway::Result<()> {
//! let responder = Responder::builder()
//!     .mount("/.well-known/est", ProtocolAdapter::Est(EstAdapter::new("tls", Vec::new())))
//!     .signer_pool(Arc::new(pool))
//!     .backend(backend)
//!     .build()?;
//!
//! let response = responder.service(InboundRequest::get("/.well-known/est/csrattrs")).await;
//! assert_eq!(response.status.as_u16(), 204);
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use futures::FutureExt;
use http::{Method, StatusCode};

use crate::audit::{AuditEvent, AuditLevel, AuditScope, AuditSink, LogAuditSink};
use crate::backend::{BackendError, CaClient};
use crate::error::{ErrorKind, GatewayError, Result};
use crate::protocol::{Batch, Decoded, InboundRequest, ProtocolAdapter, WireResponse};
use crate::security::{SignerPool, pop};
use crate::types::{EnrollmentRequest, EnrollmentResult, Outcome};

/// Default time a request waits for a free signer.
pub const DEFAULT_BORROW_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time the CA gets to answer a batch.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Application name used when no protocol is mounted at the request path.
const UNROUTED_APPLICATION: &str = "ca-gw";

/// Pipeline state, recorded on the audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequestState {
    /// Request accepted.
    Received,
    /// Protocol bytes decoded into canonical requests.
    Decoded,
    /// A signer is on loan.
    Leased,
    /// Requests handed to the CA.
    Submitted,
    /// Protocol response built.
    Encoded,
    /// Audit event appended.
    Audited,
}

impl RequestState {
    /// State name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Decoded => "DECODED",
            Self::Leased => "LEASED",
            Self::Submitted => "SUBMITTED",
            Self::Encoded => "ENCODED",
            Self::Audited => "AUDITED",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct Mount {
    prefix: String,
    adapter: ProtocolAdapter,
}

/// The gateway's request handler.
pub struct Responder {
    mounts: Vec<Mount>,
    signer_pool: Arc<SignerPool>,
    backend: Arc<dyn CaClient>,
    audit_sink: Arc<dyn AuditSink>,
    borrow_timeout: Duration,
    backend_timeout: Duration,
    log_bodies: bool,
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field(
                "mounts",
                &self.mounts.iter().map(|m| &m.prefix).collect::<Vec<_>>(),
            )
            .field("signer_pool", &self.signer_pool)
            .field("borrow_timeout", &self.borrow_timeout)
            .field("backend_timeout", &self.backend_timeout)
            .finish_non_exhaustive()
    }
}

impl Responder {
    /// Start building a responder.
    pub fn builder() -> ResponderBuilder {
        ResponderBuilder::default()
    }

    /// Mounted path prefixes and the protocol served under each.
    pub fn mounts(&self) -> impl Iterator<Item = (&str, &ProtocolAdapter)> {
        self.mounts.iter().map(|m| (m.prefix.as_str(), &m.adapter))
    }

    /// The signer pool.
    pub fn signer_pool(&self) -> &SignerPool {
        &self.signer_pool
    }

    /// Serve one request. Never fails: every failure is turned into a
    /// protocol response.
    pub async fn service(&self, request: InboundRequest) -> WireResponse {
        let route = self.route(&request.path);
        let mut audit = self.open_audit(route, &request.method, &request.path);
        let event = audit.event_mut();

        let Some((mount, sub_path)) = route else {
            tracing::debug!("No protocol mounted at {}", request.path);
            let response = WireResponse::text(StatusCode::NOT_FOUND, "Not Found");
            refused(event, "unknown path", &response);
            audit.finish();
            return response;
        };

        let mut state = RequestState::Received;
        let outcome = AssertUnwindSafe(self.process(mount, sub_path, &request, event, &mut state))
            .catch_unwind()
            .await;

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => self.fail(mount, &err, event),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    "Request {} {} panicked in state {}: {}",
                    request.method,
                    request.path,
                    state,
                    message
                );
                event.mark_failed(AuditLevel::Error);
                event.set_attribute("errorKind", ErrorKind::InternalFault.as_str());
                event.set_attribute("error", format!("panic: {message}"));
                WireResponse::internal_error()
            }
        };

        event.set_attribute("state", state.as_str());
        event.set_attribute("httpStatus", response.status.as_str());
        audit.finish();

        self.log_exchange(&request, &response);
        response
    }

    /// Refuse a request the HTTP layer could not hand to [`service`](Self::service),
    /// such as one whose body exceeds the size limit. The refusal is audited
    /// as a failed request of the protocol mounted at `path`.
    pub fn reject(&self, method: &Method, path: &str, status: StatusCode, reason: &str) -> WireResponse {
        let route = self.route(path);
        let mut audit = self.open_audit(route, method, path);
        tracing::warn!("Rejecting {method} {path}: {reason}");
        let response = WireResponse::text(status, reason);
        refused(audit.event_mut(), reason, &response);
        audit.finish();
        response
    }

    fn open_audit(&self, route: Option<(&Mount, &str)>, method: &Method, path: &str) -> AuditScope {
        let application = route.map_or(UNROUTED_APPLICATION, |(m, _)| {
            m.adapter.protocol().application_name()
        });
        let mut audit = AuditScope::open(application, Arc::clone(&self.audit_sink));
        let event = audit.event_mut();
        event.set_path(path);
        event.set_attribute("method", method.as_str());
        if let Some((mount, _)) = route {
            event.set_protocol(mount.adapter.protocol().as_str());
        }
        audit
    }

    fn route<'a, 'p>(&'a self, path: &'p str) -> Option<(&'a Mount, &'p str)> {
        self.mounts
            .iter()
            .filter_map(|m| mount_suffix(&m.prefix, path).map(|rest| (m, rest)))
            .max_by_key(|(m, _)| m.prefix.len())
    }

    async fn process(
        &self,
        mount: &Mount,
        sub_path: &str,
        request: &InboundRequest,
        event: &mut AuditEvent,
        state: &mut RequestState,
    ) -> Result<WireResponse> {
        let mut batch = match mount.adapter.decode(sub_path, request)? {
            Decoded::Respond(response) => {
                *state = RequestState::Encoded;
                return Ok(response);
            }
            Decoded::Submit(batch) => batch,
        };
        *state = RequestState::Decoded;
        event.set_attribute("operation", batch.context.operation_name());

        for req in &batch.requests {
            event.add_operation_id(&req.id);
        }
        for req in &batch.requests {
            req.validate_shape()?;
        }

        if batch.requests.iter().any(EnrollmentRequest::requires_pop) {
            let mut lease = self.signer_pool.borrow(self.borrow_timeout).await?;
            *state = RequestState::Leased;
            event.set_attribute("signer", format!("{}#{}", lease.pool_name(), lease.slot()));

            for req in batch.requests.iter_mut().filter(|r| r.requires_pop()) {
                let info = req.cert_request_info()?;
                req.proof_of_possession = Some(pop::build(&info, &mut lease)?);
            }
            lease.requite();
        }

        for req in &batch.requests {
            req.validate()?;
        }

        *state = RequestState::Submitted;
        let result = self.submit(&batch, event).await?;
        record_outcomes(&batch, &result, event);

        let response = mount.adapter.encode(&batch, &result)?;
        *state = RequestState::Encoded;
        Ok(response)
    }

    /// Hand the batch to the CA. CA-side failures become per-entry errors;
    /// only a backend that broke its own contract fails the request.
    async fn submit(&self, batch: &Batch, event: &mut AuditEvent) -> Result<EnrollmentResult> {
        let submitted =
            tokio::time::timeout(self.backend_timeout, self.backend.submit(&batch.requests)).await;

        let err = match submitted {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(err @ BackendError::Unexpected(_))) => return Err(err.into()),
            Ok(Err(err)) => err,
            Err(_) => BackendError::Timeout(self.backend_timeout),
        };

        match err.audit_level() {
            AuditLevel::Error => tracing::error!("CA submission failed: {}", err),
            _ => tracing::warn!("CA rejected batch: {}", err),
        }
        event.set_attribute("backendError", err.to_string());
        Ok(EnrollmentResult::failed_all(
            batch.ids(),
            err.to_error_outcome(),
        ))
    }

    fn fail(&self, mount: &Mount, err: &GatewayError, event: &mut AuditEvent) -> WireResponse {
        let level = err.audit_level();
        match level {
            AuditLevel::Error => tracing::error!("{} request failed: {}", mount.prefix, err),
            _ => tracing::warn!("{} request failed: {}", mount.prefix, err),
        }
        event.mark_failed(level);
        event.set_attribute("errorKind", err.kind().as_str());
        event.set_attribute("error", err.to_string());

        if err.kind() == ErrorKind::InternalFault {
            WireResponse::internal_error()
        } else {
            mount.adapter.encode_error(err)
        }
    }

    fn log_exchange(&self, request: &InboundRequest, response: &WireResponse) {
        if !self.log_bodies || !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        tracing::debug!(
            "{} {} request body: {}",
            request.method,
            request.path,
            BASE64_STANDARD.encode(&request.body)
        );
        tracing::debug!(
            "{} {} response {} body: {}",
            request.method,
            request.path,
            response.status.as_u16(),
            BASE64_STANDARD.encode(&response.body)
        );
    }
}

/// Mark the event for every entry the CA failed.
fn record_outcomes(batch: &Batch, result: &EnrollmentResult, event: &mut AuditEvent) {
    for req in &batch.requests {
        if let Outcome::Error(error) = result.outcome_or_missing(&req.id) {
            let level = if error.code.is_infrastructure() {
                AuditLevel::Error
            } else {
                AuditLevel::Warn
            };
            event.mark_failed(level);
            event.set_attribute(
                format!("entry.{}.error", req.id),
                format!("{}: {}", error.code, error.message),
            );
        }
    }
}

/// Path below `prefix`, if `path` lies under it.
fn mount_suffix<'p>(prefix: &str, path: &'p str) -> Option<&'p str> {
    if prefix == "/" {
        return Some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

/// Record a request refused before any protocol work started.
fn refused(event: &mut AuditEvent, reason: &str, response: &WireResponse) {
    event.mark_failed(AuditLevel::Warn);
    event.set_attribute("error", reason);
    event.set_attribute("state", RequestState::Received.as_str());
    event.set_attribute("httpStatus", response.status.as_str());
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Responder`].
#[derive(Default)]
pub struct ResponderBuilder {
    mounts: Vec<Mount>,
    signer_pool: Option<Arc<SignerPool>>,
    backend: Option<Arc<dyn CaClient>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    borrow_timeout: Option<Duration>,
    backend_timeout: Option<Duration>,
    log_bodies: bool,
}

impl ResponderBuilder {
    /// Serve `adapter` below `prefix` (e.g. `/.well-known/est`).
    pub fn mount(mut self, prefix: impl Into<String>, adapter: ProtocolAdapter) -> Self {
        self.mounts.push(Mount {
            prefix: prefix.into(),
            adapter,
        });
        self
    }

    /// Signer pool used for proof-of-possession.
    pub fn signer_pool(mut self, pool: Arc<SignerPool>) -> Self {
        self.signer_pool = Some(pool);
        self
    }

    /// CA backend.
    pub fn backend(mut self, backend: Arc<dyn CaClient>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Audit sink. Defaults to [`LogAuditSink`].
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Maximum wait for a free signer.
    pub fn borrow_timeout(mut self, timeout: Duration) -> Self {
        self.borrow_timeout = Some(timeout);
        self
    }

    /// Maximum wait for the CA.
    pub fn backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = Some(timeout);
        self
    }

    /// Log request and response bodies (base64) at DEBUG level.
    pub fn log_bodies(mut self, enabled: bool) -> Self {
        self.log_bodies = enabled;
        self
    }

    /// Build the responder.
    pub fn build(self) -> Result<Responder> {
        if self.mounts.is_empty() {
            return Err(GatewayError::config("no protocol mounted"));
        }

        let mut mounts = Vec::with_capacity(self.mounts.len());
        for mut mount in self.mounts {
            if !mount.prefix.starts_with('/') {
                return Err(GatewayError::config(format!(
                    "mount path '{}' must start with '/'",
                    mount.prefix
                )));
            }
            if mount.prefix.len() > 1 {
                mount.prefix = mount.prefix.trim_end_matches('/').to_string();
            }
            if mounts.iter().any(|m: &Mount| m.prefix == mount.prefix) {
                return Err(GatewayError::config(format!(
                    "mount path '{}' used twice",
                    mount.prefix
                )));
            }
            tracing::debug!("Mounting {} at {}", mount.adapter.protocol(), mount.prefix);
            mounts.push(mount);
        }

        let signer_pool = self
            .signer_pool
            .ok_or_else(|| GatewayError::config("signer pool is required"))?;
        let backend = self
            .backend
            .ok_or_else(|| GatewayError::config("CA backend is required"))?;

        let borrow_timeout = self.borrow_timeout.unwrap_or(DEFAULT_BORROW_TIMEOUT);
        let backend_timeout = self.backend_timeout.unwrap_or(DEFAULT_BACKEND_TIMEOUT);
        if borrow_timeout.is_zero() || backend_timeout.is_zero() {
            return Err(GatewayError::config("timeouts must be positive"));
        }

        Ok(Responder {
            mounts,
            signer_pool,
            backend,
            audit_sink: self
                .audit_sink
                .unwrap_or_else(|| Arc::new(LogAuditSink)),
            borrow_timeout,
            backend_timeout,
            log_bodies: self.log_bodies,
        })
    }
}
