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

//! CMP-style certificate update over JSON.
//!
//! One POST carries any number of entries; the answer lists one result per
//! entry id, in request order.
//!
//! ```json
//! {
//!   "transactionId": "tx-1",
//!   "entries": [
//!     { "id": "1", "operation": "keyUpdate", "subject": "CN=host",
//!       "publicKey": "MFkw...", "oldCertId": { "issuer": "CN=X", "serialNumber": "7b" } }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use base64::prelude::*;
use const_oid::ObjectIdentifier;
use der::asn1::OctetString;
use der::{Decode, Encode};
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use spki::SubjectPublicKeyInfoOwned;
use time::OffsetDateTime;
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;

use super::{
    Batch, BatchContext, Decoded, InboundRequest, WireResponse, code_for_error, new_request_id,
    require_method, status_for_error, with_retry_hint,
};
use crate::error::{GatewayError, Result};
use crate::types::{
    CertReference, EnrollmentRequest, EnrollmentResult, ErrorOutcome, Operation, Outcome,
    RevocationReason, Validity, content_types,
};

/// Friendly name of the key bag in generated keystores.
const KEYSTORE_ALIAS: &str = "main";

/// What encode needs from a decoded update request.
#[derive(Clone)]
pub struct CmpTransaction {
    /// Transaction id, echoed in the answer.
    pub transaction_id: String,
    /// Password protecting CA-generated keys.
    pub keystore_password: Option<String>,
}

impl fmt::Debug for CmpTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmpTransaction")
            .field("transaction_id", &self.transaction_id)
            .field(
                "keystore_password",
                &self.keystore_password.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateRequestBody {
    #[serde(default)]
    transaction_id: Option<String>,
    entries: Vec<EntryBody>,
    #[serde(default)]
    keystore_password: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryBody {
    id: String,
    #[serde(default = "default_operation")]
    operation: Operation,
    #[serde(default)]
    profile: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    public_key: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    not_before: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    not_after: Option<OffsetDateTime>,
    #[serde(default)]
    extensions: Vec<ExtensionBody>,
    #[serde(default)]
    ca_generates_keypair: bool,
    #[serde(default)]
    old_cert_id: Option<CertIdBody>,
    #[serde(default)]
    reason: Option<RevocationReason>,
}

fn default_operation() -> Operation {
    Operation::KeyUpdate
}

#[derive(Debug, Deserialize)]
struct ExtensionBody {
    oid: String,
    #[serde(default)]
    critical: bool,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertIdBody {
    issuer: String,
    serial_number: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateResponseBody<'a> {
    transaction_id: &'a str,
    entries: Vec<EntryResultBody<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EntryResultBody<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keystore: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    revoked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl From<&ErrorOutcome> for ErrorBody {
    fn from(e: &ErrorOutcome) -> Self {
        Self {
            code: e.code.as_str().to_string(),
            message: e.message.clone(),
        }
    }
}

/// CMP-style update adapter.
#[derive(Debug, Clone)]
pub struct CmpAdapter {
    default_profile: String,
}

impl CmpAdapter {
    /// Create an adapter.
    pub fn new(default_profile: impl Into<String>) -> Self {
        Self {
            default_profile: default_profile.into(),
        }
    }

    pub(crate) fn decode(&self, sub_path: &str, request: &InboundRequest) -> Result<Decoded> {
        let segments: Vec<&str> = sub_path.split('/').filter(|s| !s.is_empty()).collect();
        let profile = match segments.as_slice() {
            [] => self.default_profile.as_str(),
            [profile] => *profile,
            _ => return Err(GatewayError::unknown_path(sub_path)),
        };
        require_method(request, &[Method::POST], "update")?;
        if !request.content_type_is(content_types::JSON) {
            return Err(GatewayError::malformed("Expected a JSON body"));
        }

        let body: UpdateRequestBody = serde_json::from_slice(&request.body)
            .map_err(|e| GatewayError::malformed(format!("Invalid update request: {e}")))?;
        if body.entries.is_empty() {
            return Err(GatewayError::malformed("Update request has no entries"));
        }

        let mut seen = HashSet::new();
        let mut requests = Vec::with_capacity(body.entries.len());
        for entry in body.entries {
            if !seen.insert(entry.id.clone()) {
                return Err(GatewayError::malformed(format!(
                    "Duplicate entry id '{}'",
                    entry.id
                )));
            }
            requests.push(entry.into_request(profile)?);
        }

        if requests.iter().any(|r| r.ca_generates_keypair)
            && body.keystore_password.as_deref().is_none_or(str::is_empty)
        {
            return Err(GatewayError::malformed(
                "keystorePassword is required when the CA generates keys",
            ));
        }

        Ok(Decoded::Submit(Batch {
            requests,
            context: BatchContext::Cmp(CmpTransaction {
                transaction_id: body.transaction_id.unwrap_or_else(new_request_id),
                keystore_password: body.keystore_password,
            }),
        }))
    }

    pub(crate) fn encode(&self, batch: &Batch, result: &EnrollmentResult) -> Result<WireResponse> {
        let BatchContext::Cmp(tx) = &batch.context else {
            return Err(GatewayError::internal("CMP adapter given a foreign batch"));
        };

        let mut entries = Vec::with_capacity(batch.requests.len());
        for request in &batch.requests {
            let mut entry = EntryResultBody {
                id: &request.id,
                certificate: None,
                keystore: None,
                revoked: false,
                error: None,
            };
            match result.outcome_or_missing(&request.id) {
                Outcome::Certified(issued) => {
                    let cert_der = issued
                        .certificate
                        .to_der()
                        .map_err(|e| GatewayError::internal(format!("certificate: {e}")))?;
                    if let Some(key_der) = &issued.private_key {
                        let password = tx.keystore_password.as_deref().ok_or_else(|| {
                            GatewayError::internal("CA key without keystore password")
                        })?;
                        let pfx =
                            p12::PFX::new(&cert_der, key_der, None, password, KEYSTORE_ALIAS)
                                .ok_or_else(|| {
                                    GatewayError::internal("cannot build PKCS#12 keystore")
                                })?;
                        entry.keystore = Some(BASE64_STANDARD.encode(pfx.to_der()));
                    }
                    entry.certificate = Some(BASE64_STANDARD.encode(cert_der));
                }
                Outcome::Revoked => entry.revoked = true,
                Outcome::Error(error) => entry.error = Some(ErrorBody::from(&error)),
            }
            entries.push(entry);
        }

        let body = serde_json::to_vec(&UpdateResponseBody {
            transaction_id: &tx.transaction_id,
            entries,
        })
        .map_err(|e| GatewayError::internal(format!("cannot encode update response: {e}")))?;
        Ok(WireResponse::ok(content_types::JSON, body))
    }

    pub(crate) fn encode_error(&self, error: &GatewayError) -> WireResponse {
        let body = serde_json::json!({
            "error": {
                "code": code_for_error(error).as_str(),
                "message": super::client_message(error),
            }
        });
        let response = WireResponse::new(status_for_error(error))
            .with_body(content_types::JSON, body.to_string());
        with_retry_hint(response, error)
    }
}

impl EntryBody {
    fn into_request(self, default_profile: &str) -> Result<EnrollmentRequest> {
        let id = self.id;
        if id.is_empty() {
            return Err(GatewayError::malformed("Entry id must not be empty"));
        }
        let profile = self.profile.unwrap_or_else(|| default_profile.to_string());
        let subject = self.subject.as_deref().map(parse_name).transpose()?;
        let public_key = self.public_key.as_deref().map(parse_public_key).transpose()?;
        let prior = self.old_cert_id.map(CertIdBody::into_reference).transpose()?;

        let missing = |field: &str| GatewayError::malformed(format!("{id}: {field} is required"));

        let request = match self.operation {
            Operation::Revoke => {
                let prior = prior.ok_or_else(|| missing("oldCertId"))?;
                return Ok(EnrollmentRequest::revoke(&id, profile, prior, self.reason));
            }
            Operation::Enroll => {
                let subject = subject.ok_or_else(|| missing("subject"))?;
                match (self.ca_generates_keypair, public_key) {
                    (true, None) => EnrollmentRequest::enroll_with_ca_key(&id, profile, subject),
                    (false, Some(key)) => EnrollmentRequest::enroll(&id, profile, subject, key),
                    (true, Some(_)) => return Err(key_conflict(&id)),
                    (false, None) => return Err(missing("publicKey")),
                }
            }
            Operation::KeyUpdate => {
                let subject = subject.ok_or_else(|| missing("subject"))?;
                let prior = prior.ok_or_else(|| missing("oldCertId"))?;
                match (self.ca_generates_keypair, public_key) {
                    (true, Some(_)) => return Err(key_conflict(&id)),
                    (false, None) => return Err(missing("publicKey")),
                    (_, key) => EnrollmentRequest::key_update(&id, profile, subject, key, prior),
                }
            }
        };

        let extensions = self
            .extensions
            .into_iter()
            .map(ExtensionBody::into_extension)
            .collect::<Result<Vec<_>>>()?;

        Ok(request
            .with_validity(Validity {
                not_before: self.not_before,
                not_after: self.not_after,
            })
            .with_extensions(extensions))
    }
}

impl ExtensionBody {
    fn into_extension(self) -> Result<Extension> {
        let extn_id = ObjectIdentifier::new(&self.oid)
            .map_err(|e| GatewayError::malformed(format!("Bad extension OID '{}': {e}", self.oid)))?;
        let value = BASE64_STANDARD
            .decode(&self.value)
            .map_err(|e| GatewayError::malformed(format!("Bad extension {extn_id} value: {e}")))?;
        let extn_value = OctetString::new(value)
            .map_err(|e| GatewayError::malformed(format!("Bad extension {extn_id} value: {e}")))?;
        Ok(Extension {
            extn_id,
            critical: self.critical,
            extn_value,
        })
    }
}

impl CertIdBody {
    fn into_reference(self) -> Result<CertReference> {
        let issuer = parse_name(&self.issuer)?;
        let serial = hex::decode(self.serial_number.trim_start_matches("0x"))
            .map_err(|e| GatewayError::malformed(format!("Bad serial number: {e}")))?;
        if serial.is_empty() {
            return Err(GatewayError::malformed("Serial number must not be empty"));
        }
        let serial = SerialNumber::new(&serial)
            .map_err(|e| GatewayError::malformed(format!("Bad serial number: {e}")))?;
        Ok(CertReference::new(issuer, serial))
    }
}

fn key_conflict(id: &str) -> GatewayError {
    GatewayError::malformed(format!(
        "{id}: publicKey and caGeneratesKeypair are mutually exclusive"
    ))
}

fn parse_name(value: &str) -> Result<Name> {
    Name::from_str(value)
        .map_err(|e| GatewayError::malformed(format!("Bad distinguished name '{value}': {e}")))
}

fn parse_public_key(value: &str) -> Result<SubjectPublicKeyInfoOwned> {
    let der = BASE64_STANDARD
        .decode(value)
        .map_err(|e| GatewayError::malformed(format!("Bad publicKey encoding: {e}")))?;
    SubjectPublicKeyInfoOwned::from_der(&der)
        .map_err(|e| GatewayError::malformed(format!("Bad publicKey: {e}")))
}
