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

//! PKCS#10 certification request parsing.
//!
//! EST, SCEP and ACME all carry the client's key and requested subject in a
//! PKCS#10 request. The request's self-signature is the client's proof of
//! possession and is checked here, before any signer is leased or the CA is
//! contacted. A request that fails the check is answered with `badPOP`.

use der::{Decode, Encode};
use spki::SubjectPublicKeyInfoOwned;
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::request::CertReq;

use super::EXTENSION_REQUEST;
use crate::error::{GatewayError, Result};
use crate::security::EcVerifier;
use crate::security::verify::ecdsa_signature_hash;

/// The parts of a PKCS#10 request the gateway forwards.
#[derive(Debug, Clone)]
pub struct ParsedCsr {
    /// Requested subject.
    pub subject: Name,
    /// Subject public key.
    pub public_key: SubjectPublicKeyInfoOwned,
    /// Extensions from the extensionRequest attribute.
    pub extensions: Vec<Extension>,
}

/// Parse a DER-encoded PKCS#10 request and verify its self-signature.
pub fn parse_csr(der_bytes: &[u8]) -> Result<ParsedCsr> {
    let csr = CertReq::from_der(der_bytes)
        .map_err(|e| GatewayError::malformed(format!("Failed to parse PKCS#10 request: {e}")))?;
    verify_self_signature(&csr)?;

    let mut extensions = Vec::new();
    for attr in csr.info.attributes.iter() {
        if attr.oid != EXTENSION_REQUEST {
            continue;
        }
        for value in attr.values.iter() {
            let encoded = value
                .to_der()
                .map_err(|e| GatewayError::malformed(format!("Bad extensionRequest: {e}")))?;
            let exts = Vec::<Extension>::from_der(&encoded)
                .map_err(|e| GatewayError::malformed(format!("Bad extensionRequest: {e}")))?;
            extensions.extend(exts);
        }
    }

    Ok(ParsedCsr {
        subject: csr.info.subject,
        public_key: csr.info.public_key,
        extensions,
    })
}

fn verify_self_signature(csr: &CertReq) -> Result<()> {
    let tbs = csr
        .info
        .to_der()
        .map_err(|e| GatewayError::malformed(format!("Failed to encode PKCS#10 request: {e}")))?;
    let signature = csr
        .signature
        .as_bytes()
        .ok_or_else(|| GatewayError::bad_pop("PKCS#10 signature has unused bits"))?;

    let hash = ecdsa_signature_hash(&csr.algorithm.oid, None)?;
    EcVerifier::from_spki(&csr.info.public_key)?
        .verify_der(hash, &tbs, signature)
        .map_err(|_| GatewayError::bad_pop("PKCS#10 self-signature does not verify"))
}
