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

//! SCEP server side (RFC 8894).
//!
//! The TLS terminator in front of the gateway opens the SCEP envelope;
//! `PKIOperation` bodies reaching this adapter are CMS SignedData whose
//! encapsulated content is the PKCS#10 request.
//!
//! A `RenewalReq` names the certificate being renewed through its signer.
//! That certificate is taken from the SignerInfo's `sid`, and the SignerInfo
//! signature must verify under it before the renewal reaches the CA.

use std::sync::Arc;

use cms::signed_data::{SignedData, SignerIdentifier, SignerInfo};
use const_oid::ObjectIdentifier;
use der::asn1::{OctetStringRef, PrintableStringRef};
use der::{Decode, Encode, Tag, Tagged};
use http::{Method, StatusCode};
use x509_cert::Certificate;

use super::{
    Batch, BatchContext, Decoded, InboundRequest, WireResponse, code_for_error, status_for_code,
    status_for_error, with_code_retry_hint, with_retry_hint,
};
use crate::error::{GatewayError, Result};
use crate::security::verify::ecdsa_signature_hash;
use crate::security::{EcVerifier, HashAlgo};
use crate::types::pkcs7::{build_certs_only, decode_base64, extract_certificates, parse_signed_data};
use crate::types::pkcs10::parse_csr;
use crate::types::{
    CertReference, EnrollmentRequest, EnrollmentResult, ErrorCode, Outcome, content_types,
};

/// id-messageType (2.16.840.1.113733.1.9.2)
pub const MESSAGE_TYPE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.113733.1.9.2");

/// id-transactionID (2.16.840.1.113733.1.9.7)
pub const TRANSACTION_ID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.16.840.1.113733.1.9.7");

/// id-messageDigest (1.2.840.113549.1.9.4)
const MESSAGE_DIGEST: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");

/// id-ce-subjectKeyIdentifier (2.5.29.14)
const SUBJECT_KEY_IDENTIFIER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.14");

/// Capabilities advertised by `GetCACaps`.
const CAPABILITIES: &[&str] = &[
    "POSTPKIOperation",
    "Renewal",
    "SHA-256",
    "SHA-512",
    "AES",
    "SCEPStandard",
];

const CGI_NAME: &str = "pkiclient.exe";

/// SCEP request message types the gateway serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScepMessageType {
    /// PKCSReq (19)
    PkcsReq,
    /// RenewalReq (17)
    RenewalReq,
}

impl ScepMessageType {
    /// Message type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PkcsReq => "PKCSReq",
            Self::RenewalReq => "RenewalReq",
        }
    }

    fn from_wire(value: &str) -> Result<Self> {
        match value.trim() {
            "19" => Ok(Self::PkcsReq),
            "17" => Ok(Self::RenewalReq),
            "20" => Err(GatewayError::malformed("CertPoll is not supported")),
            "21" | "22" => Err(GatewayError::malformed("GetCert and GetCRL are not supported")),
            other => Err(GatewayError::malformed(format!(
                "Unknown SCEP messageType '{other}'"
            ))),
        }
    }
}

/// What encode needs from a decoded PKIOperation.
#[derive(Debug, Clone)]
pub struct ScepTransaction {
    /// transactionID attribute, or a digest of the public key.
    pub transaction_id: String,
    /// Request message type.
    pub message_type: ScepMessageType,
}

/// SCEP adapter.
#[derive(Debug, Clone)]
pub struct ScepAdapter {
    default_profile: String,
    ca_certs: Arc<Vec<Certificate>>,
}

impl ScepAdapter {
    /// Create an adapter answering `GetCACert` with `ca_certs`.
    pub fn new(default_profile: impl Into<String>, ca_certs: Vec<Certificate>) -> Self {
        Self {
            default_profile: default_profile.into(),
            ca_certs: Arc::new(ca_certs),
        }
    }

    pub(crate) fn decode(&self, sub_path: &str, request: &InboundRequest) -> Result<Decoded> {
        let profile = self.profile_for(sub_path)?;
        let operation = request
            .query_param("operation")
            .ok_or_else(|| GatewayError::malformed("Missing 'operation' parameter"))?;

        match operation.as_str() {
            "GetCACaps" => {
                super::require_method(request, &[Method::GET], &operation)?;
                Ok(Decoded::Respond(WireResponse::text(
                    StatusCode::OK,
                    CAPABILITIES.join("\n"),
                )))
            }
            "GetCACert" => {
                super::require_method(request, &[Method::GET], &operation)?;
                self.ca_cert_response().map(Decoded::Respond)
            }
            "PKIOperation" => {
                super::require_method(request, &[Method::GET, Method::POST], &operation)?;
                let message = if request.method == Method::GET {
                    // form decoding turns an unescaped '+' into a space
                    let encoded = request
                        .query_param("message")
                        .ok_or_else(|| GatewayError::malformed("Missing 'message' parameter"))?
                        .replace(' ', "+");
                    decode_base64(encoded.as_bytes())?
                } else {
                    request.body.to_vec()
                };
                decode_pki_operation(profile, &message).map(Decoded::Submit)
            }
            other => Err(GatewayError::malformed(format!(
                "Unknown SCEP operation '{other}'"
            ))),
        }
    }

    pub(crate) fn encode(&self, batch: &Batch, result: &EnrollmentResult) -> Result<WireResponse> {
        let BatchContext::Scep(tx) = &batch.context else {
            return Err(GatewayError::internal("SCEP adapter given a foreign batch"));
        };

        match result.outcome_or_missing(&tx.transaction_id) {
            Outcome::Certified(issued) => {
                let p7 = build_certs_only(std::slice::from_ref(&issued.certificate))?;
                Ok(WireResponse::ok(content_types::PKI_MESSAGE, p7))
            }
            Outcome::Revoked => Err(GatewayError::internal(
                "CA answered a SCEP request with a revocation",
            )),
            Outcome::Error(error) => {
                let response =
                    fail_info_response(status_for_code(error.code), error.code, &error.message);
                Ok(with_code_retry_hint(response, error.code))
            }
        }
    }

    pub(crate) fn encode_error(&self, error: &GatewayError) -> WireResponse {
        let code = code_for_error(error);
        let response =
            fail_info_response(status_for_error(error), code, &super::client_message(error));
        with_retry_hint(response, error)
    }

    fn profile_for<'a>(&'a self, sub_path: &'a str) -> Result<&'a str> {
        let mut segments: Vec<&str> = sub_path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.last() == Some(&CGI_NAME) {
            segments.pop();
        }
        match segments.as_slice() {
            [] => Ok(&self.default_profile),
            [profile] => Ok(*profile),
            _ => Err(GatewayError::unknown_path(sub_path)),
        }
    }

    fn ca_cert_response(&self) -> Result<WireResponse> {
        match self.ca_certs.as_slice() {
            [] => Err(GatewayError::internal("no CA certificates configured")),
            [single] => {
                let der = single
                    .to_der()
                    .map_err(|e| GatewayError::internal(format!("CA certificate: {e}")))?;
                Ok(WireResponse::ok(content_types::X509_CA_CERT, der))
            }
            chain => Ok(WireResponse::ok(
                content_types::X509_CA_RA_CERT,
                build_certs_only(chain)?,
            )),
        }
    }
}

fn decode_pki_operation(profile: &str, message: &[u8]) -> Result<Batch> {
    if message.is_empty() {
        return Err(GatewayError::malformed("Empty PKIOperation message"));
    }
    let signed_data = parse_signed_data(message)?;

    let content = signed_data
        .encap_content_info
        .econtent
        .as_ref()
        .ok_or_else(|| GatewayError::malformed("PKIOperation carries no content"))?;
    if content.tag() != Tag::OctetString {
        return Err(GatewayError::malformed(format!(
            "PKIOperation content must be an OCTET STRING, found {}",
            content.tag()
        )));
    }
    let csr = parse_csr(content.value())?;

    let message_type = signed_attribute(&signed_data, MESSAGE_TYPE)?
        .ok_or_else(|| GatewayError::malformed("PKIOperation without messageType"))?;
    let message_type = ScepMessageType::from_wire(&message_type)?;

    let transaction_id = match signed_attribute(&signed_data, TRANSACTION_ID)? {
        Some(id) if !id.is_empty() => id,
        _ => {
            let spki = csr
                .public_key
                .to_der()
                .map_err(|e| GatewayError::malformed(format!("Bad public key: {e}")))?;
            tracing::debug!("SCEP request without transactionID, deriving one from the key");
            HashAlgo::Sha256.hex_hash(&spki)
        }
    };

    let request = match message_type {
        ScepMessageType::PkcsReq => {
            EnrollmentRequest::enroll(&transaction_id, profile, csr.subject, csr.public_key)
        }
        ScepMessageType::RenewalReq => {
            let signer = authenticated_signer(&signed_data, content.value())?;
            EnrollmentRequest::key_update(
                &transaction_id,
                profile,
                csr.subject,
                Some(csr.public_key),
                CertReference::from_certificate(&signer),
            )
        }
    }
    .with_extensions(csr.extensions);

    Ok(Batch {
        requests: vec![request],
        context: BatchContext::Scep(ScepTransaction {
            transaction_id,
            message_type,
        }),
    })
}

/// The certificate that signed `signed_data`, after checking the signature.
///
/// The certificate is the one the single SignerInfo names in its `sid`. The
/// signed attributes must carry the digest of `content` and verify under the
/// certificate's key.
fn authenticated_signer(signed_data: &SignedData, content: &[u8]) -> Result<Certificate> {
    let mut signer_infos = signed_data.signer_infos.0.iter();
    let signer_info = match (signer_infos.next(), signer_infos.next()) {
        (Some(single), None) => single,
        (None, _) => return Err(GatewayError::malformed("RenewalReq without SignerInfo")),
        (Some(_), Some(_)) => {
            return Err(GatewayError::malformed("RenewalReq with several SignerInfos"));
        }
    };
    let certificate = extract_certificates(signed_data)?
        .into_iter()
        .find(|cert| signer_matches(&signer_info.sid, cert))
        .ok_or_else(|| GatewayError::bad_pop("no enclosed certificate matches the signer"))?;

    verify_signer_info(signer_info, &certificate, content)?;
    Ok(certificate)
}

fn signer_matches(sid: &SignerIdentifier, cert: &Certificate) -> bool {
    let tbs = &cert.tbs_certificate;
    match sid {
        SignerIdentifier::IssuerAndSerialNumber(id) => {
            id.issuer == tbs.issuer && id.serial_number == tbs.serial_number
        }
        SignerIdentifier::SubjectKeyIdentifier(ski) => tbs
            .extensions
            .iter()
            .flatten()
            .filter(|ext| ext.extn_id == SUBJECT_KEY_IDENTIFIER)
            .filter_map(|ext| OctetStringRef::from_der(ext.extn_value.as_bytes()).ok())
            .any(|id| id.as_bytes() == ski.0.as_bytes()),
    }
}

fn verify_signer_info(signer_info: &SignerInfo, cert: &Certificate, content: &[u8]) -> Result<()> {
    let attrs = signer_info
        .signed_attrs
        .as_ref()
        .ok_or_else(|| GatewayError::bad_pop("SignerInfo without signed attributes"))?;
    let digest_alg = HashAlgo::from_algorithm_identifier(&signer_info.digest_alg)
        .map_err(|e| GatewayError::bad_pop(e.to_string()))?;

    let digest = attrs
        .iter()
        .find(|attr| attr.oid == MESSAGE_DIGEST)
        .and_then(|attr| attr.values.iter().next())
        .and_then(|value| value.decode_as::<OctetStringRef<'_>>().ok())
        .ok_or_else(|| GatewayError::bad_pop("SignerInfo without messageDigest"))?;
    if digest.as_bytes() != digest_alg.hash(content).as_slice() {
        return Err(GatewayError::bad_pop("messageDigest does not match the content"));
    }

    // Signed attributes are signed as a SET OF, not with their [0] tag
    let tbs = attrs
        .to_der()
        .map_err(|e| GatewayError::malformed(format!("Bad signed attributes: {e}")))?;
    let hash = ecdsa_signature_hash(&signer_info.signature_algorithm.oid, Some(digest_alg))?;
    EcVerifier::from_spki(&cert.tbs_certificate.subject_public_key_info)?
        .verify_der(hash, &tbs, signer_info.signature.as_bytes())
        .map_err(|_| GatewayError::bad_pop("SignerInfo signature does not verify"))
}

/// First PrintableString value of the signed attribute `oid`.
fn signed_attribute(signed_data: &SignedData, oid: ObjectIdentifier) -> Result<Option<String>> {
    for signer in signed_data.signer_infos.0.iter() {
        let Some(attrs) = &signer.signed_attrs else {
            continue;
        };
        for attr in attrs.iter().filter(|a| a.oid == oid) {
            let Some(value) = attr.values.iter().next() else {
                continue;
            };
            let encoded = value
                .to_der()
                .map_err(|e| GatewayError::malformed(format!("Bad attribute {oid}: {e}")))?;
            let text = PrintableStringRef::from_der(&encoded)
                .map_err(|e| GatewayError::malformed(format!("Bad attribute {oid}: {e}")))?;
            return Ok(Some(text.as_str().to_string()));
        }
    }
    Ok(None)
}

fn fail_info(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::BadPop => "badMessageCheck",
        ErrorCode::BadCertId => "badCertId",
        _ => "badRequest",
    }
}

fn fail_info_response(status: StatusCode, code: ErrorCode, message: &str) -> WireResponse {
    WireResponse::text(status, format!("failInfo={}\n{message}\n", fail_info(code)))
}
