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

//! Canonical enrollment model shared by every protocol adapter.
//!
//! Adapters decode their wire format into [`EnrollmentRequest`]s, the CA
//! backend answers with an [`EnrollmentResult`], and adapters encode that
//! result back into their wire format. Nothing in here knows about any
//! particular protocol.

pub mod pkcs10;
pub mod pkcs7;

use std::collections::HashMap;
use std::fmt;

use const_oid::ObjectIdentifier;
use der::asn1::{Any, SetOfVec};
use der::Encode;
use serde::{Deserialize, Serialize};
use spki::SubjectPublicKeyInfoOwned;
use time::OffsetDateTime;
use x509_cert::attr::Attribute;
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::request::{CertReqInfo, Version};
use x509_cert::serial_number::SerialNumber;
use x509_cert::Certificate;

use crate::error::{GatewayError, Result};
use crate::security::PopSignature;

/// PKCS#9 extensionRequest attribute (1.2.840.113549.1.9.14).
pub const EXTENSION_REQUEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");

/// Canonical operation requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    /// Issue a new certificate.
    Enroll,
    /// Re-key or renew an existing certificate.
    KeyUpdate,
    /// Revoke an existing certificate.
    Revoke,
}

impl Operation {
    /// Returns the operation name as used in logs and audit records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enroll => "ENROLL",
            Self::KeyUpdate => "KEY_UPDATE",
            Self::Revoke => "REVOKE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a previously issued certificate by issuer and serial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertReference {
    /// Issuer distinguished name.
    pub issuer: Name,
    /// Certificate serial number.
    pub serial: SerialNumber,
}

impl CertReference {
    /// Create a reference from its parts.
    pub fn new(issuer: Name, serial: SerialNumber) -> Self {
        Self { issuer, serial }
    }

    /// Reference the given certificate.
    pub fn from_certificate(cert: &Certificate) -> Self {
        Self {
            issuer: cert.tbs_certificate.issuer.clone(),
            serial: cert.tbs_certificate.serial_number.clone(),
        }
    }

    /// Serial number as lower-case hex.
    pub fn serial_hex(&self) -> String {
        hex::encode(self.serial.as_bytes())
    }
}

impl fmt::Display for CertReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "issuer='{}', serial=0x{}", self.issuer, self.serial_hex())
    }
}

/// Requested certificate validity window. Either bound may be left to the CA.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Validity {
    /// Requested notBefore.
    pub not_before: Option<OffsetDateTime>,
    /// Requested notAfter.
    pub not_after: Option<OffsetDateTime>,
}

impl Validity {
    /// Returns true when neither bound is set.
    pub fn is_empty(&self) -> bool {
        self.not_before.is_none() && self.not_after.is_none()
    }
}

/// RFC 5280 CRLReason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RevocationReason {
    /// unspecified (0)
    Unspecified,
    /// keyCompromise (1)
    KeyCompromise,
    /// cACompromise (2)
    #[serde(rename = "cACompromise")]
    CaCompromise,
    /// affiliationChanged (3)
    AffiliationChanged,
    /// superseded (4)
    Superseded,
    /// cessationOfOperation (5)
    CessationOfOperation,
    /// certificateHold (6)
    CertificateHold,
    /// removeFromCRL (8)
    #[serde(rename = "removeFromCRL")]
    RemoveFromCrl,
    /// privilegeWithdrawn (9)
    PrivilegeWithdrawn,
    /// aACompromise (10)
    #[serde(rename = "aACompromise")]
    AaCompromise,
}

impl RevocationReason {
    /// Numeric CRLReason code.
    pub fn code(&self) -> u8 {
        match self {
            Self::Unspecified => 0,
            Self::KeyCompromise => 1,
            Self::CaCompromise => 2,
            Self::AffiliationChanged => 3,
            Self::Superseded => 4,
            Self::CessationOfOperation => 5,
            Self::CertificateHold => 6,
            Self::RemoveFromCrl => 8,
            Self::PrivilegeWithdrawn => 9,
            Self::AaCompromise => 10,
        }
    }

    /// Look up a reason by numeric code. Code 7 is unassigned.
    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => Self::Unspecified,
            1 => Self::KeyCompromise,
            2 => Self::CaCompromise,
            3 => Self::AffiliationChanged,
            4 => Self::Superseded,
            5 => Self::CessationOfOperation,
            6 => Self::CertificateHold,
            8 => Self::RemoveFromCrl,
            9 => Self::PrivilegeWithdrawn,
            10 => Self::AaCompromise,
            _ => return None,
        })
    }
}

/// A protocol-neutral certificate operation.
#[derive(Debug, Clone)]
pub struct EnrollmentRequest {
    /// Correlation id, unique within a batch.
    pub id: String,
    /// Requested operation.
    pub operation: Operation,
    /// Certificate profile name, forwarded to the CA untouched.
    pub profile: String,
    /// Requested subject.
    pub subject: Option<Name>,
    /// Subject public key. Absent when the CA generates the key pair.
    pub public_key: Option<SubjectPublicKeyInfoOwned>,
    /// Requested validity.
    pub validity: Validity,
    /// Requested extensions, in request order.
    pub extension_requests: Vec<Extension>,
    /// Gateway proof-of-possession over the certificate request.
    pub proof_of_possession: Option<PopSignature>,
    /// The CA generates the key pair and returns the private key.
    pub ca_generates_keypair: bool,
    /// Certificate being updated or revoked.
    pub prior_certificate: Option<CertReference>,
    /// Revocation reason for REVOKE.
    pub revocation_reason: Option<RevocationReason>,
}

impl EnrollmentRequest {
    fn blank(id: impl Into<String>, operation: Operation, profile: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operation,
            profile: profile.into(),
            subject: None,
            public_key: None,
            validity: Validity::default(),
            extension_requests: Vec::new(),
            proof_of_possession: None,
            ca_generates_keypair: false,
            prior_certificate: None,
            revocation_reason: None,
        }
    }

    /// New-certificate request for a client-supplied key.
    pub fn enroll(
        id: impl Into<String>,
        profile: impl Into<String>,
        subject: Name,
        public_key: SubjectPublicKeyInfoOwned,
    ) -> Self {
        let mut req = Self::blank(id, Operation::Enroll, profile);
        req.subject = Some(subject);
        req.public_key = Some(public_key);
        req
    }

    /// New-certificate request where the CA generates the key pair.
    pub fn enroll_with_ca_key(
        id: impl Into<String>,
        profile: impl Into<String>,
        subject: Name,
    ) -> Self {
        let mut req = Self::blank(id, Operation::Enroll, profile);
        req.subject = Some(subject);
        req.ca_generates_keypair = true;
        req
    }

    /// Key update of an existing certificate.
    pub fn key_update(
        id: impl Into<String>,
        profile: impl Into<String>,
        subject: Name,
        public_key: Option<SubjectPublicKeyInfoOwned>,
        prior: CertReference,
    ) -> Self {
        let mut req = Self::blank(id, Operation::KeyUpdate, profile);
        req.subject = Some(subject);
        req.ca_generates_keypair = public_key.is_none();
        req.public_key = public_key;
        req.prior_certificate = Some(prior);
        req
    }

    /// Revocation of an existing certificate.
    pub fn revoke(
        id: impl Into<String>,
        profile: impl Into<String>,
        prior: CertReference,
        reason: Option<RevocationReason>,
    ) -> Self {
        let mut req = Self::blank(id, Operation::Revoke, profile);
        req.prior_certificate = Some(prior);
        req.revocation_reason = reason;
        req
    }

    /// Set the requested validity.
    pub fn with_validity(mut self, validity: Validity) -> Self {
        self.validity = validity;
        self
    }

    /// Set the requested extensions.
    pub fn with_extensions(mut self, extensions: Vec<Extension>) -> Self {
        self.extension_requests = extensions;
        self
    }

    /// Returns true if the gateway must attach a proof-of-possession.
    pub fn requires_pop(&self) -> bool {
        self.operation != Operation::Revoke && !self.ca_generates_keypair
    }

    /// Check the shape invariants that do not depend on the POP.
    pub fn validate_shape(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(GatewayError::malformed("request id must not be empty"));
        }

        match self.operation {
            Operation::Revoke => {
                if self.prior_certificate.is_none() {
                    return Err(GatewayError::malformed(format!(
                        "{}: REVOKE requires a prior certificate reference",
                        self.id
                    )));
                }
                return Ok(());
            }
            Operation::KeyUpdate if self.prior_certificate.is_none() => {
                return Err(GatewayError::malformed(format!(
                    "{}: KEY_UPDATE requires a prior certificate reference",
                    self.id
                )));
            }
            _ => {}
        }

        if self.subject.is_none() {
            return Err(GatewayError::malformed(format!(
                "{}: subject is required",
                self.id
            )));
        }

        if self.ca_generates_keypair {
            if self.public_key.is_some() || self.proof_of_possession.is_some() {
                return Err(GatewayError::malformed(format!(
                    "{}: CA-generated key pair excludes public key and POP",
                    self.id
                )));
            }
        } else if self.public_key.is_none() {
            return Err(GatewayError::malformed(format!(
                "{}: public key is required",
                self.id
            )));
        }

        if let (Some(nb), Some(na)) = (self.validity.not_before, self.validity.not_after)
            && nb >= na
        {
            return Err(GatewayError::malformed(format!(
                "{}: notBefore must precede notAfter",
                self.id
            )));
        }

        Ok(())
    }

    /// Full check performed right before submission.
    pub fn validate(&self) -> Result<()> {
        self.validate_shape()?;
        if self.requires_pop() && self.proof_of_possession.is_none() {
            return Err(GatewayError::malformed(format!(
                "{}: proof-of-possession missing",
                self.id
            )));
        }
        Ok(())
    }

    /// Build the PKCS#10 `CertificationRequestInfo` covered by the POP.
    ///
    /// Requested extensions travel in a single extensionRequest attribute.
    pub fn cert_request_info(&self) -> Result<CertReqInfo> {
        let subject = self
            .subject
            .clone()
            .ok_or_else(|| GatewayError::malformed(format!("{}: subject is required", self.id)))?;
        let public_key = self.public_key.clone().ok_or_else(|| {
            GatewayError::malformed(format!("{}: public key is required", self.id))
        })?;

        let mut attributes = Vec::new();
        if !self.extension_requests.is_empty() {
            let value = Any::encode_from(&self.extension_requests)
                .map_err(|e| GatewayError::malformed(format!("bad extension request: {e}")))?;
            let values = SetOfVec::try_from(vec![value])
                .map_err(|e| GatewayError::internal(format!("attribute set: {e}")))?;
            attributes.push(Attribute {
                oid: EXTENSION_REQUEST,
                values,
            });
        }
        let attributes = SetOfVec::try_from(attributes)
            .map_err(|e| GatewayError::internal(format!("attribute set: {e}")))?;

        Ok(CertReqInfo {
            version: Version::V1,
            subject,
            public_key,
            attributes,
        })
    }

    /// DER of the subject public key, if present.
    pub fn public_key_der(&self) -> Option<Vec<u8>> {
        self.public_key.as_ref().and_then(|k| k.to_der().ok())
    }
}

/// Canonical failure codes, named after the CMP PKIFailureInfo bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The request could not be processed as sent.
    #[serde(rename = "badRequest")]
    BadRequest,
    /// The requested certificate content is not acceptable.
    #[serde(rename = "badCertTemplate")]
    BadCertTemplate,
    /// Proof-of-possession verification failed.
    #[serde(rename = "badPOP")]
    BadPop,
    /// The referenced certificate is unknown.
    #[serde(rename = "badCertId")]
    BadCertId,
    /// The requester is not allowed to perform this operation.
    #[serde(rename = "notAuthorized")]
    NotAuthorized,
    /// The CA is temporarily unable to serve the request.
    #[serde(rename = "systemUnavailable")]
    SystemUnavailable,
    /// The CA failed while serving the request.
    #[serde(rename = "systemFailure")]
    SystemFailure,
}

impl ErrorCode {
    /// Wire name of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "badRequest",
            Self::BadCertTemplate => "badCertTemplate",
            Self::BadPop => "badPOP",
            Self::BadCertId => "badCertId",
            Self::NotAuthorized => "notAuthorized",
            Self::SystemUnavailable => "systemUnavailable",
            Self::SystemFailure => "systemFailure",
        }
    }

    /// Returns true if the code points at CA infrastructure, not at the
    /// request.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::SystemUnavailable | Self::SystemFailure)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful issuance.
#[derive(Debug, Clone)]
pub struct CertifiedOutcome {
    /// Issued certificate.
    pub certificate: Certificate,
    /// DER-encoded PKCS#8 private key when the CA generated the key pair.
    pub private_key: Option<Vec<u8>>,
}

/// Failed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorOutcome {
    /// Failure code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ErrorOutcome {
    /// Create an error outcome.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Outcome of one request entry.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// A certificate was issued.
    Certified(CertifiedOutcome),
    /// The referenced certificate was revoked.
    Revoked,
    /// The entry failed.
    Error(ErrorOutcome),
}

impl Outcome {
    /// Returns the error outcome, if any.
    pub fn error(&self) -> Option<&ErrorOutcome> {
        match self {
            Self::Error(e) => Some(e),
            _ => None,
        }
    }
}

/// Backend answer to a batch, keyed by request id.
#[derive(Debug, Clone, Default)]
pub struct EnrollmentResult {
    outcomes: HashMap<String, Outcome>,
}

impl EnrollmentResult {
    /// Create an empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Result that fails every listed id with the same error.
    pub fn failed_all<'a>(ids: impl IntoIterator<Item = &'a str>, error: ErrorOutcome) -> Self {
        let mut result = Self::new();
        for id in ids {
            result.insert(id, Outcome::Error(error.clone()));
        }
        result
    }

    /// Record the outcome for `id`, replacing any earlier one.
    pub fn insert(&mut self, id: impl Into<String>, outcome: Outcome) {
        self.outcomes.insert(id.into(), outcome);
    }

    /// Outcome for `id`.
    pub fn get(&self, id: &str) -> Option<&Outcome> {
        self.outcomes.get(id)
    }

    /// Number of outcomes.
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Returns true if there are no outcomes.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Iterate over all outcomes in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Outcome)> {
        self.outcomes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Outcome for `id`, or an error outcome when the backend omitted it.
    pub fn outcome_or_missing(&self, id: &str) -> Outcome {
        self.outcomes.get(id).cloned().unwrap_or_else(|| {
            Outcome::Error(ErrorOutcome::new(
                ErrorCode::SystemFailure,
                format!("no result for request '{id}'"),
            ))
        })
    }
}

/// Content types used by the mounted protocols.
pub mod content_types {
    /// PKCS#10 CSR content type.
    pub const PKCS10: &str = "application/pkcs10";

    /// PKCS#7 certs-only content type with smime-type parameter.
    pub const PKCS7_CERTS_ONLY: &str = "application/pkcs7-mime; smime-type=certs-only";

    /// PKCS#8 private key content type.
    pub const PKCS8: &str = "application/pkcs8";

    /// Multipart mixed content type (for server keygen).
    pub const MULTIPART_MIXED: &str = "multipart/mixed";

    /// SCEP single CA certificate.
    pub const X509_CA_CERT: &str = "application/x-x509-ca-cert";

    /// SCEP CA and RA certificate chain.
    pub const X509_CA_RA_CERT: &str = "application/x-x509-ca-ra-cert";

    /// SCEP pkiMessage.
    pub const PKI_MESSAGE: &str = "application/x-pki-message";

    /// JSON.
    pub const JSON: &str = "application/json";

    /// JOSE JSON serialization (ACME request bodies).
    pub const JOSE_JSON: &str = "application/jose+json";

    /// RFC 7807 problem document.
    pub const PROBLEM_JSON: &str = "application/problem+json";

    /// PEM certificate chain (ACME certificate download).
    pub const PEM_CERT_CHAIN: &str = "application/pem-certificate-chain";

    /// Plain text.
    pub const TEXT_PLAIN: &str = "text/plain";
}
