// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)

//! Proof-of-possession construction.
//!
//! The gateway vouches for a request it forwards by signing the request's
//! PKCS#10 `CertificationRequestInfo` with a pooled RA key. The CA checks the
//! signature against the RA certificate it trusts for this gateway.

use der::Encode;
use spki::AlgorithmIdentifierOwned;
use x509_cert::request::CertReqInfo;

use super::pool::SignerLease;
use crate::error::{GatewayError, Result};

/// Signature produced by [`build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopSignature {
    /// Signature algorithm.
    pub algorithm: AlgorithmIdentifierOwned,
    /// DER signature value.
    pub signature: Vec<u8>,
}

/// Sign the canonical DER encoding of `request_info` with the leased handle.
///
/// Exactly one signing operation is performed. The lease is left untouched
/// and stays with the caller, so it is returned on every path.
pub fn build(request_info: &CertReqInfo, lease: &mut SignerLease<'_>) -> Result<PopSignature> {
    let tbs = request_info
        .to_der()
        .map_err(|e| GatewayError::signing(format!("cannot encode request for POP: {e}")))?;

    let signer = lease.signer();
    let signature = signer.sign(&tbs).map_err(|e| match e {
        GatewayError::Signing(_) => e,
        other => GatewayError::signing(other.to_string()),
    })?;

    Ok(PopSignature {
        algorithm: signer.algorithm_identifier(),
        signature,
    })
}
