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

//! CA backend abstraction.
//!
//! The responder hands each decoded batch to a [`CaClient`] and gets one
//! outcome per request id back. How the CA is reached is up to the
//! implementation; [`HttpCaClient`] talks JSON over HTTPS.

mod http;

pub use http::{
    CaClientConfig, CaClientConfigBuilder, ClientIdentity, HttpAuth, HttpCaClient, TrustAnchors,
};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::audit::AuditLevel;
use crate::types::{EnrollmentRequest, EnrollmentResult, ErrorCode, ErrorOutcome};

/// Failure of a whole backend submission.
///
/// Per-entry failures travel inside the [`EnrollmentResult`] instead.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The CA refused the batch as a matter of policy.
    #[error("CA rejected request ({code}): {message}")]
    Rejected {
        /// Failure code reported by the CA.
        code: ErrorCode,
        /// Message reported by the CA.
        message: String,
    },

    /// The CA could not be reached or reported an internal problem.
    #[error("CA unavailable: {0}")]
    Unavailable(String),

    /// The CA did not answer in time.
    #[error("CA did not answer within {0:?}")]
    Timeout(Duration),

    /// The CA answered with something the gateway does not understand, or
    /// the client failed in an unclassified way.
    #[error("Unexpected CA failure: {0}")]
    Unexpected(String),
}

impl BackendError {
    /// Create a policy rejection.
    pub fn rejected(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }

    /// Policy rejections are WARN; infrastructure trouble is ERROR.
    pub fn audit_level(&self) -> AuditLevel {
        match self {
            Self::Rejected { code, .. } if !code.is_infrastructure() => AuditLevel::Warn,
            _ => AuditLevel::Error,
        }
    }

    /// Returns true if the same batch may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
            || matches!(
                self,
                Self::Rejected {
                    code: ErrorCode::SystemUnavailable,
                    ..
                }
            )
    }

    /// The per-entry outcome reported to clients for this failure.
    ///
    /// Infrastructure details stay in the logs.
    pub fn to_error_outcome(&self) -> ErrorOutcome {
        match self {
            Self::Rejected { code, message } => ErrorOutcome::new(*code, message.clone()),
            Self::Unavailable(_) | Self::Timeout(_) => ErrorOutcome::new(
                ErrorCode::SystemUnavailable,
                "CA temporarily unavailable",
            ),
            Self::Unexpected(_) => ErrorOutcome::new(ErrorCode::SystemFailure, "internal error"),
        }
    }
}

/// Client of the CA engine.
#[async_trait]
pub trait CaClient: Send + Sync {
    /// Execute a batch. The result should hold one outcome per request id.
    async fn submit(
        &self,
        requests: &[EnrollmentRequest],
    ) -> Result<EnrollmentResult, BackendError>;
}
