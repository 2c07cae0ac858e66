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

//! Signing handles held by the signer pool.
//!
//! A [`ContentSigner`] is one exclusive-use signing handle. Handles are not
//! required to be thread-safe for concurrent use; the pool guarantees that a
//! handle is only ever driven by the task holding its lease.
//!
//! [`SoftwareSigner`] keeps an ECDSA key in process memory. It is the only
//! handle type shipped with the gateway; hardware-backed handles plug in by
//! implementing the same trait.
//!
//! # Security Considerations
//!
//! Software keys are not protected by a hardware boundary and may be swapped
//! to disk. Protect the key file with file system permissions.

use std::fmt;
use std::path::Path;

use const_oid::ObjectIdentifier;
use const_oid::db::rfc5912::{
    ECDSA_WITH_SHA_224, ECDSA_WITH_SHA_256, ECDSA_WITH_SHA_384, ECDSA_WITH_SHA_512,
};
use der::Decode;
use p256::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rand_core::OsRng;
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};

use super::HashAlgo;
use crate::error::{GatewayError, Result};

/// id-ecdsa-with-sha3-224 .. 512 (NIST CSOR)
pub(super) const ECDSA_WITH_SHA3_224: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.3.9");
pub(super) const ECDSA_WITH_SHA3_256: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.3.10");
pub(super) const ECDSA_WITH_SHA3_384: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.3.11");
pub(super) const ECDSA_WITH_SHA3_512: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.3.12");

/// A single-use-at-a-time signing handle.
pub trait ContentSigner: Send {
    /// Signature algorithm produced by [`sign`](Self::sign).
    fn algorithm_identifier(&self) -> AlgorithmIdentifierOwned;

    /// Sign `message` and return the DER-encoded signature value.
    fn sign(&mut self, message: &[u8]) -> Result<Vec<u8>>;
}

/// Curves supported by [`SoftwareSigner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// ECDSA with P-256 curve (secp256r1)
    EcdsaP256,
    /// ECDSA with P-384 curve (secp384r1)
    EcdsaP384,
}

impl KeyAlgorithm {
    /// Get the algorithm name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EcdsaP256 => "ECDSA-P256",
            Self::EcdsaP384 => "ECDSA-P384",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
enum EcKey {
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
}

/// ECDSA signer with an in-memory key.
#[derive(Clone)]
pub struct SoftwareSigner {
    label: String,
    key: EcKey,
    hash: HashAlgo,
    signature_oid: ObjectIdentifier,
}

impl fmt::Debug for SoftwareSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareSigner")
            .field("label", &self.label)
            .field("algorithm", &self.key_algorithm())
            .field("hash", &self.hash)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl SoftwareSigner {
    fn with_key(label: impl Into<String>, key: EcKey, hash: HashAlgo) -> Result<Self> {
        let signature_oid = ecdsa_signature_oid(hash).ok_or_else(|| {
            GatewayError::config(format!("hash algorithm {hash} cannot be used with ECDSA"))
        })?;
        Ok(Self {
            label: label.into(),
            key,
            hash,
            signature_oid,
        })
    }

    /// Generate a fresh key.
    pub fn generate(label: impl Into<String>, algorithm: KeyAlgorithm, hash: HashAlgo) -> Result<Self> {
        let key = match algorithm {
            KeyAlgorithm::EcdsaP256 => EcKey::P256(p256::ecdsa::SigningKey::random(&mut OsRng)),
            KeyAlgorithm::EcdsaP384 => EcKey::P384(p384::ecdsa::SigningKey::random(&mut OsRng)),
        };
        Self::with_key(label, key, hash)
    }

    /// Load a P-256 or P-384 key from PKCS#8 PEM.
    pub fn from_pkcs8_pem(label: impl Into<String>, pem: &str, hash: HashAlgo) -> Result<Self> {
        let key = if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_pem(pem) {
            EcKey::P256(key)
        } else if let Ok(key) = p384::ecdsa::SigningKey::from_pkcs8_pem(pem) {
            EcKey::P384(key)
        } else {
            return Err(GatewayError::config(
                "signer key is not a PKCS#8 P-256 or P-384 private key",
            ));
        };
        Self::with_key(label, key, hash)
    }

    /// Load a key from a PKCS#8 PEM file.
    pub fn from_pkcs8_file(
        label: impl Into<String>,
        path: impl AsRef<Path>,
        hash: HashAlgo,
    ) -> Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("cannot read signer key {}: {e}", path.display()))
        })?;
        Self::from_pkcs8_pem(label, &pem, hash)
    }

    /// Signer label from configuration.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Curve of the key.
    pub fn key_algorithm(&self) -> KeyAlgorithm {
        match self.key {
            EcKey::P256(_) => KeyAlgorithm::EcdsaP256,
            EcKey::P384(_) => KeyAlgorithm::EcdsaP384,
        }
    }

    /// Digest applied before signing.
    pub fn hash_algo(&self) -> HashAlgo {
        self.hash
    }

    /// SubjectPublicKeyInfo of the signing key.
    pub fn public_key(&self) -> Result<SubjectPublicKeyInfoOwned> {
        let der = match &self.key {
            EcKey::P256(k) => k.verifying_key().to_public_key_der(),
            EcKey::P384(k) => k.verifying_key().to_public_key_der(),
        }
        .map_err(|e| GatewayError::internal(format!("cannot encode public key: {e}")))?;

        SubjectPublicKeyInfoOwned::from_der(der.as_bytes())
            .map_err(|e| GatewayError::internal(format!("cannot decode public key: {e}")))
    }
}

impl ContentSigner for SoftwareSigner {
    fn algorithm_identifier(&self) -> AlgorithmIdentifierOwned {
        AlgorithmIdentifierOwned {
            oid: self.signature_oid,
            parameters: None,
        }
    }

    fn sign(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        use p256::ecdsa::signature::hazmat::PrehashSigner;

        let digest = self.hash.hash(message);
        let signature = match &self.key {
            EcKey::P256(k) => {
                let sig: p256::ecdsa::Signature = k
                    .sign_prehash(&digest)
                    .map_err(|e| GatewayError::signing(format!("{}: {e}", self.label)))?;
                sig.to_der().as_bytes().to_vec()
            }
            EcKey::P384(k) => {
                let sig: p384::ecdsa::Signature = k
                    .sign_prehash(&digest)
                    .map_err(|e| GatewayError::signing(format!("{}: {e}", self.label)))?;
                sig.to_der().as_bytes().to_vec()
            }
        };
        Ok(signature)
    }
}

/// ECDSA signature OID for the given digest, if the pairing is allowed.
fn ecdsa_signature_oid(hash: HashAlgo) -> Option<ObjectIdentifier> {
    Some(match hash {
        HashAlgo::Sha224 => ECDSA_WITH_SHA_224,
        HashAlgo::Sha256 => ECDSA_WITH_SHA_256,
        HashAlgo::Sha384 => ECDSA_WITH_SHA_384,
        HashAlgo::Sha512 => ECDSA_WITH_SHA_512,
        HashAlgo::Sha3_224 => ECDSA_WITH_SHA3_224,
        HashAlgo::Sha3_256 => ECDSA_WITH_SHA3_256,
        HashAlgo::Sha3_384 => ECDSA_WITH_SHA3_384,
        HashAlgo::Sha3_512 => ECDSA_WITH_SHA3_512,
        // SHA-1 is deprecated for signatures; SM3 and SHAKE pair with other
        // signature schemes
        HashAlgo::Sha1 | HashAlgo::Sm3 | HashAlgo::Shake128 | HashAlgo::Shake256 => return None,
    })
}
