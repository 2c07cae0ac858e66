//! PKCS#7/CMS utilities.
//!
//! The gateway answers EST and SCEP requests with the degenerate
//! "certs-only" SignedData form and reads SCEP pkiMessages, which are
//! SignedData structures wrapping a PKCS#10 request.

use base64::prelude::*;
use cms::cert::CertificateChoices;
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{CertificateSet, EncapsulatedContentInfo, SignedData, SignerInfos};
use const_oid::db::rfc5911::{ID_DATA, ID_SIGNED_DATA};
use der::asn1::{Any, SetOfVec};
use der::{Decode, Encode};
use x509_cert::Certificate;

use crate::error::{GatewayError, Result};

/// Build a DER-encoded certs-only SignedData holding `certs`.
pub fn build_certs_only(certs: &[Certificate]) -> Result<Vec<u8>> {
    let choices: Vec<CertificateChoices> = certs
        .iter()
        .cloned()
        .map(CertificateChoices::Certificate)
        .collect();
    let cert_set = SetOfVec::try_from(choices)
        .map_err(|e| GatewayError::internal(format!("Failed to build certificate set: {e}")))?;

    let signed_data = SignedData {
        version: CmsVersion::V1,
        digest_algorithms: SetOfVec::new(),
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: ID_DATA,
            econtent: None,
        },
        certificates: Some(CertificateSet(cert_set)),
        crls: None,
        signer_infos: SignerInfos(SetOfVec::new()),
    };

    let content = Any::encode_from(&signed_data)
        .map_err(|e| GatewayError::internal(format!("Failed to encode SignedData: {e}")))?;

    ContentInfo {
        content_type: ID_SIGNED_DATA,
        content,
    }
    .to_der()
    .map_err(|e| GatewayError::internal(format!("Failed to encode ContentInfo: {e}")))
}

/// Parse a base64-encoded certs-only SignedData.
pub fn parse_certs_only(body: &[u8]) -> Result<Vec<Certificate>> {
    let der_bytes = decode_base64(body)?;
    parse_certs_only_der(&der_bytes)
}

/// Parse a DER-encoded certs-only SignedData.
pub fn parse_certs_only_der(der_bytes: &[u8]) -> Result<Vec<Certificate>> {
    let signed_data = parse_signed_data(der_bytes)?;
    extract_certificates(&signed_data)
}

/// Parse a ContentInfo and return its SignedData content.
pub fn parse_signed_data(der_bytes: &[u8]) -> Result<SignedData> {
    let content_info = ContentInfo::from_der(der_bytes)
        .map_err(|e| GatewayError::malformed(format!("Failed to parse ContentInfo: {e}")))?;

    if content_info.content_type != ID_SIGNED_DATA {
        return Err(GatewayError::malformed(format!(
            "Expected SignedData OID, got {}",
            content_info.content_type
        )));
    }

    let content = content_info
        .content
        .to_der()
        .map_err(|e| GatewayError::malformed(format!("Failed to encode content: {e}")))?;

    SignedData::from_der(&content)
        .map_err(|e| GatewayError::malformed(format!("Failed to parse SignedData: {e}")))
}

/// Extract the X.509 certificates carried by a SignedData.
pub fn extract_certificates(signed_data: &SignedData) -> Result<Vec<Certificate>> {
    let Some(cert_set) = &signed_data.certificates else {
        return Ok(Vec::new());
    };

    let mut certificates = Vec::new();
    for cert_choice in cert_set.0.iter() {
        // Only plain X.509 certificates are of interest here
        if let CertificateChoices::Certificate(cert) = cert_choice {
            certificates.push(cert.clone());
        } else {
            tracing::warn!("Skipping non-X.509 certificate choice");
        }
    }

    Ok(certificates)
}

/// Decode base64 data, handling various line ending formats.
pub fn decode_base64(data: &[u8]) -> Result<Vec<u8>> {
    let cleaned: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    BASE64_STANDARD
        .decode(&cleaned)
        .map_err(|e| GatewayError::malformed(format!("Base64 decode error: {e}")))
}

/// Encode DER data to base64 with CRLF line wrapping.
pub fn encode_base64_wrapped(data: &[u8], line_length: usize) -> String {
    let encoded = BASE64_STANDARD.encode(data);
    if line_length == 0 {
        return encoded;
    }

    encoded
        .as_bytes()
        .chunks(line_length)
        .map(|chunk| chunk.iter().map(|&b| b as char).collect::<String>())
        .collect::<Vec<_>>()
        .join("\r\n")
}
