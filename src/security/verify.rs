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

//! Verification of client signatures.
//!
//! Clients prove possession of their key by signing their own request: the
//! PKCS#10 self-signature, the SCEP SignerInfo and the ACME JWS. Only ECDSA
//! over P-256 and P-384 is accepted. Any other key or signature algorithm is
//! refused rather than passed on unchecked.

use const_oid::ObjectIdentifier;
use const_oid::db::rfc5912::{
    ECDSA_WITH_SHA_224, ECDSA_WITH_SHA_256, ECDSA_WITH_SHA_384, ECDSA_WITH_SHA_512,
};
use der::Encode;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::pkcs8::DecodePublicKey;
use spki::SubjectPublicKeyInfoOwned;

use super::HashAlgo;
use super::signer::{
    ECDSA_WITH_SHA3_224, ECDSA_WITH_SHA3_256, ECDSA_WITH_SHA3_384, ECDSA_WITH_SHA3_512,
};
use crate::error::{GatewayError, Result};

/// id-ecPublicKey, accepted by some CMS producers as a bare signature algorithm
const ID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");

const SIGNATURE_HASHES: [(ObjectIdentifier, HashAlgo); 8] = [
    (ECDSA_WITH_SHA_224, HashAlgo::Sha224),
    (ECDSA_WITH_SHA_256, HashAlgo::Sha256),
    (ECDSA_WITH_SHA_384, HashAlgo::Sha384),
    (ECDSA_WITH_SHA_512, HashAlgo::Sha512),
    (ECDSA_WITH_SHA3_224, HashAlgo::Sha3_224),
    (ECDSA_WITH_SHA3_256, HashAlgo::Sha3_256),
    (ECDSA_WITH_SHA3_384, HashAlgo::Sha3_384),
    (ECDSA_WITH_SHA3_512, HashAlgo::Sha3_512),
];

/// Public half of a client's ECDSA key.
#[derive(Debug, Clone)]
pub enum EcVerifier {
    /// P-256 (secp256r1)
    P256(p256::ecdsa::VerifyingKey),
    /// P-384 (secp384r1)
    P384(p384::ecdsa::VerifyingKey),
}

impl EcVerifier {
    /// Load the key carried in a SubjectPublicKeyInfo.
    pub fn from_spki(spki: &SubjectPublicKeyInfoOwned) -> Result<Self> {
        let der = spki
            .to_der()
            .map_err(|e| GatewayError::malformed(format!("cannot encode public key: {e}")))?;
        if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_der(&der) {
            Ok(Self::P256(key))
        } else if let Ok(key) = p384::ecdsa::VerifyingKey::from_public_key_der(&der) {
            Ok(Self::P384(key))
        } else {
            Err(GatewayError::bad_pop(format!(
                "unsupported public key algorithm {}",
                spki.algorithm.oid
            )))
        }
    }

    /// Load a JWK-style EC public key from its curve name and coordinates.
    pub fn from_coordinates(curve: &str, x: &[u8], y: &[u8]) -> Result<Self> {
        let mut point = Vec::with_capacity(1 + x.len() + y.len());
        point.push(0x04);
        point.extend_from_slice(x);
        point.extend_from_slice(y);

        let invalid = |e: p256::ecdsa::Error| {
            GatewayError::malformed(format!("invalid {curve} public key: {e}"))
        };
        match (curve, x.len(), y.len()) {
            ("P-256", 32, 32) => Ok(Self::P256(
                p256::ecdsa::VerifyingKey::from_sec1_bytes(&point).map_err(invalid)?,
            )),
            ("P-384", 48, 48) => Ok(Self::P384(
                p384::ecdsa::VerifyingKey::from_sec1_bytes(&point).map_err(invalid)?,
            )),
            ("P-256" | "P-384", _, _) => Err(GatewayError::malformed(format!(
                "{curve} coordinates have the wrong length"
            ))),
            _ => Err(GatewayError::malformed(format!("unsupported curve {curve}"))),
        }
    }

    /// Uncompressed SEC1 encoding of the point.
    pub fn sec1_bytes(&self) -> Vec<u8> {
        match self {
            Self::P256(key) => key.to_encoded_point(false).as_bytes().to_vec(),
            Self::P384(key) => key.to_encoded_point(false).as_bytes().to_vec(),
        }
    }

    /// Check a DER ECDSA signature over `message` hashed with `hash`.
    pub fn verify_der(&self, hash: HashAlgo, message: &[u8], signature: &[u8]) -> Result<()> {
        let digest = hash.hash(message);
        let verified = match self {
            Self::P256(key) => p256::ecdsa::Signature::from_der(signature)
                .and_then(|sig| key.verify_prehash(&digest, &sig)),
            Self::P384(key) => p384::ecdsa::Signature::from_der(signature)
                .and_then(|sig| key.verify_prehash(&digest, &sig)),
        };
        verified.map_err(|_| GatewayError::bad_pop("signature does not verify"))
    }

    /// Check a JWS signature (fixed-width `r || s`) for `alg` over `message`.
    pub fn verify_jws(&self, alg: &str, message: &[u8], signature: &[u8]) -> Result<()> {
        let verified = match (alg, self) {
            ("ES256", Self::P256(key)) => p256::ecdsa::Signature::from_slice(signature)
                .and_then(|sig| key.verify(message, &sig)),
            ("ES384", Self::P384(key)) => p384::ecdsa::Signature::from_slice(signature)
                .and_then(|sig| key.verify(message, &sig)),
            _ => {
                return Err(GatewayError::bad_pop(format!(
                    "JWS algorithm {alg} does not match the key"
                )));
            }
        };
        verified.map_err(|_| GatewayError::bad_pop("JWS signature does not verify"))
    }
}

/// Digest named by an ECDSA signature algorithm OID.
///
/// `id-ecPublicKey` carries no digest of its own; `fallback` is the digest
/// algorithm declared next to it.
pub fn ecdsa_signature_hash(oid: &ObjectIdentifier, fallback: Option<HashAlgo>) -> Result<HashAlgo> {
    let hash = if *oid == ID_EC_PUBLIC_KEY {
        fallback.filter(|h| !matches!(h, HashAlgo::Sha1))
    } else {
        SIGNATURE_HASHES
            .iter()
            .find(|(known, _)| known == oid)
            .map(|(_, hash)| *hash)
    };
    hash.ok_or_else(|| GatewayError::bad_pop(format!("unsupported signature algorithm {oid}")))
}
