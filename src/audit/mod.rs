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

//! Audit events and sinks.
//!
//! Every inbound request produces exactly one [`AuditEvent`]. The responder
//! opens an [`AuditScope`] when a request arrives; the scope appends the
//! event to the process-wide [`AuditSink`] when it is finished, or when it is
//! dropped because the request was abandoned half-way.
//!
//! # Record shape
//!
//! ```json
//! {"applicationName":"est-gw","path":"/.well-known/est/simpleenroll",
//!  "protocol":"EST","operationIds":["3f0c..."],"status":"SUCCESSFUL",
//!  "level":"INFO","startedAt":"2025-03-01T10:00:00Z",
//!  "finishedAt":"2025-03-01T10:00:00.120Z","attributes":{"state":"AUDITED"}}
//! ```

mod sinks;

pub use sinks::{FileAuditSink, LogAuditSink, MemoryAuditSink, MultiAuditSink};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

/// Final status of an audited request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditStatus {
    /// The request was served without error.
    Successful,
    /// The request failed.
    Failed,
}

/// Severity of an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditLevel {
    /// Normal operation.
    #[default]
    Info,
    /// Client-caused or capacity failure.
    Warn,
    /// Gateway or infrastructure failure.
    Error,
}

impl AuditLevel {
    /// Get the level name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record per inbound request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    application_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    protocol: Option<String>,
    operation_ids: Vec<String>,
    status: Option<AuditStatus>,
    level: AuditLevel,
    #[serde(with = "time::serde::rfc3339")]
    started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    finished_at: Option<OffsetDateTime>,
    attributes: BTreeMap<String, String>,
}

impl AuditEvent {
    /// Start a new event now.
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            path: None,
            protocol: None,
            operation_ids: Vec::new(),
            status: None,
            level: AuditLevel::Info,
            started_at: OffsetDateTime::now_utc(),
            finished_at: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Application name, e.g. `est-gw`.
    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    /// Replace the application name once the protocol is known.
    pub fn set_application_name(&mut self, name: impl Into<String>) {
        self.application_name = name.into();
    }

    /// Request path.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Record the request path.
    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = Some(path.into());
    }

    /// Protocol name.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Record the protocol.
    pub fn set_protocol(&mut self, protocol: impl Into<String>) {
        self.protocol = Some(protocol.into());
    }

    /// Correlation ids of the request entries.
    pub fn operation_ids(&self) -> &[String] {
        &self.operation_ids
    }

    /// Record one correlation id.
    pub fn add_operation_id(&mut self, id: impl Into<String>) {
        self.operation_ids.push(id.into());
    }

    /// Final status; `None` until the event is finished.
    pub fn status(&self) -> Option<AuditStatus> {
        self.status
    }

    /// Severity.
    pub fn level(&self) -> AuditLevel {
        self.level
    }

    /// Mark the request as failed. The level only ever goes up.
    pub fn mark_failed(&mut self, level: AuditLevel) {
        self.status = Some(AuditStatus::Failed);
        self.level = self.level.max(level);
    }

    /// Set an attribute, replacing an earlier value.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Attribute value.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Start timestamp.
    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    /// Finish timestamp; `None` until finished.
    pub fn finished_at(&self) -> Option<OffsetDateTime> {
        self.finished_at
    }

    /// Time between start and finish.
    pub fn duration(&self) -> Option<time::Duration> {
        self.finished_at.map(|f| f - self.started_at)
    }

    /// Serialize as a single JSON line.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!("{{\"applicationName\":\"{}\",\"error\":\"{e}\"}}", self.application_name)
        })
    }

    fn finish(&mut self) {
        if self.status.is_none() {
            self.status = Some(AuditStatus::Successful);
        }
        self.finished_at = Some(OffsetDateTime::now_utc());
    }
}

/// Append-only destination for audit events, shared by all requests.
pub trait AuditSink: Send + Sync {
    /// Append `event`. Sinks report their own failures; they never fail the
    /// request.
    fn log_event(&self, event: &AuditEvent);
}

/// Scoped owner of a request's audit event.
///
/// The event reaches the sink exactly once: through [`finish`](Self::finish)
/// or, if the request is abandoned first, when the scope is dropped.
pub struct AuditScope {
    event: AuditEvent,
    sink: Arc<dyn AuditSink>,
    finalized: bool,
}

impl AuditScope {
    /// Open a scope with a fresh event.
    pub fn open(application_name: impl Into<String>, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            event: AuditEvent::new(application_name),
            sink,
            finalized: false,
        }
    }

    /// The event being built.
    pub fn event(&self) -> &AuditEvent {
        &self.event
    }

    /// Mutable access to the event being built.
    pub fn event_mut(&mut self) -> &mut AuditEvent {
        &mut self.event
    }

    /// Stamp and append the event. A request that recorded no failure is
    /// SUCCESSFUL.
    pub fn finish(mut self) {
        self.finalize();
    }

    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.event.finish();
        self.sink.log_event(&self.event);
    }
}

impl Drop for AuditScope {
    fn drop(&mut self) {
        if !self.finalized && self.event.status.is_none() {
            // Dropped before the responder decided: the client went away or
            // the task was cancelled.
            self.event.mark_failed(AuditLevel::Warn);
            self.event.set_attribute("aborted", "true");
        }
        self.finalize();
    }
}
