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

//! Hash algorithm catalog.
//!
//! Every hash algorithm the gateway can name in configuration or meet on the
//! wire is a [`HashAlgo`] variant. Names, aliases and OIDs all resolve through
//! one lookup table built on first use; lookups by name are case-insensitive.
//!
//! | Variant | Length | OID |
//! |---------|--------|-----|
//! | SHA1 | 20 | 1.3.14.3.2.26 |
//! | SHA224 | 28 | 2.16.840.1.101.3.4.2.4 |
//! | SHA256 | 32 | 2.16.840.1.101.3.4.2.1 |
//! | SHA384 | 48 | 2.16.840.1.101.3.4.2.2 |
//! | SHA512 | 64 | 2.16.840.1.101.3.4.2.3 |
//! | SHA3-224 .. SHA3-512 | 28 .. 64 | 2.16.840.1.101.3.4.2.7 .. 10 |
//! | SM3 | 32 | 1.2.156.10197.1.401 |
//! | SHAKE128 | 32 | 2.16.840.1.101.3.4.2.11 |
//! | SHAKE256 | 64 | 2.16.840.1.101.3.4.2.12 |

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use base64::prelude::*;
use const_oid::ObjectIdentifier;
use der::asn1::AnyRef;
use der::{Any, Decode, Tag, Tagged};
use sha2::Digest;
use sha3::digest::{ExtendableOutput, Update};
use spki::AlgorithmIdentifierOwned;

use crate::error::{GatewayError, Result};

/// Supported hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgo {
    /// SHA-1. Kept for fingerprints and legacy SCEP clients only.
    Sha1,
    /// SHA-224
    Sha224,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
    /// SHA3-224
    Sha3_224,
    /// SHA3-256
    Sha3_256,
    /// SHA3-384
    Sha3_384,
    /// SHA3-512
    Sha3_512,
    /// SM3
    Sm3,
    /// SHAKE128 with 256-bit output
    Shake128,
    /// SHAKE256 with 512-bit output
    Shake256,
}

const ALL: [HashAlgo; 12] = [
    HashAlgo::Sha1,
    HashAlgo::Sha224,
    HashAlgo::Sha256,
    HashAlgo::Sha384,
    HashAlgo::Sha512,
    HashAlgo::Sha3_224,
    HashAlgo::Sha3_256,
    HashAlgo::Sha3_384,
    HashAlgo::Sha3_512,
    HashAlgo::Sm3,
    HashAlgo::Shake128,
    HashAlgo::Shake256,
];

/// name / alias / dotted OID (upper-cased) -> algorithm
static BY_NAME: LazyLock<HashMap<String, HashAlgo>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    for algo in ALL {
        map.insert(algo.name().to_string(), algo);
        map.insert(algo.oid().to_string(), algo);
        for alias in algo.aliases() {
            map.insert(alias.to_string(), algo);
        }
    }
    map
});

static BY_OID: LazyLock<HashMap<ObjectIdentifier, HashAlgo>> =
    LazyLock::new(|| ALL.iter().map(|a| (a.oid(), *a)).collect());

impl HashAlgo {
    /// Canonical name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha224 => "SHA224",
            Self::Sha256 => "SHA256",
            Self::Sha384 => "SHA384",
            Self::Sha512 => "SHA512",
            Self::Sha3_224 => "SHA3-224",
            Self::Sha3_256 => "SHA3-256",
            Self::Sha3_384 => "SHA3-384",
            Self::Sha3_512 => "SHA3-512",
            Self::Sm3 => "SM3",
            Self::Shake128 => "SHAKE128",
            Self::Shake256 => "SHAKE256",
        }
    }

    fn aliases(&self) -> &'static [&'static str] {
        match self {
            Self::Sha1 => &["SHA-1"],
            Self::Sha224 => &["SHA-224"],
            Self::Sha256 => &["SHA-256"],
            Self::Sha384 => &["SHA-384"],
            Self::Sha512 => &["SHA-512"],
            Self::Sha3_224 => &["SHA3224"],
            Self::Sha3_256 => &["SHA3256"],
            Self::Sha3_384 => &["SHA3384"],
            Self::Sha3_512 => &["SHA3512"],
            Self::Sm3 => &[],
            Self::Shake128 => &["SHAKE-128"],
            Self::Shake256 => &["SHAKE-256"],
        }
    }

    /// Digest length in bytes.
    pub fn length(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 | Self::Sha3_224 => 28,
            Self::Sha256 | Self::Sha3_256 | Self::Sm3 | Self::Shake128 => 32,
            Self::Sha384 | Self::Sha3_384 => 48,
            Self::Sha512 | Self::Sha3_512 | Self::Shake256 => 64,
        }
    }

    /// Algorithm OID.
    pub fn oid(&self) -> ObjectIdentifier {
        ObjectIdentifier::new_unwrap(match self {
            Self::Sha1 => "1.3.14.3.2.26",
            Self::Sha224 => "2.16.840.1.101.3.4.2.4",
            Self::Sha256 => "2.16.840.1.101.3.4.2.1",
            Self::Sha384 => "2.16.840.1.101.3.4.2.2",
            Self::Sha512 => "2.16.840.1.101.3.4.2.3",
            Self::Sha3_224 => "2.16.840.1.101.3.4.2.7",
            Self::Sha3_256 => "2.16.840.1.101.3.4.2.8",
            Self::Sha3_384 => "2.16.840.1.101.3.4.2.9",
            Self::Sha3_512 => "2.16.840.1.101.3.4.2.10",
            Self::Sm3 => "1.2.156.10197.1.401",
            Self::Shake128 => "2.16.840.1.101.3.4.2.11",
            Self::Shake256 => "2.16.840.1.101.3.4.2.12",
        })
    }

    /// Look up an algorithm by name, alias or dotted OID, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        BY_NAME.get(&name.trim().to_ascii_uppercase()).copied()
    }

    /// Look up an algorithm by OID.
    pub fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        BY_OID.get(oid).copied()
    }

    /// Look up an algorithm from a DER-encoded OID.
    pub fn from_encoded_oid(der_bytes: &[u8]) -> Option<Self> {
        ObjectIdentifier::from_der(der_bytes)
            .ok()
            .and_then(|oid| Self::from_oid(&oid))
    }

    /// Look up an algorithm from an AlgorithmIdentifier.
    ///
    /// Parameters must be absent or NULL.
    pub fn from_algorithm_identifier(alg: &AlgorithmIdentifierOwned) -> Result<Self> {
        if let Some(params) = &alg.parameters
            && params.tag() != Tag::Null
        {
            return Err(GatewayError::malformed(format!(
                "hash algorithm {} must not carry parameters",
                alg.oid
            )));
        }
        Self::from_oid(&alg.oid)
            .ok_or_else(|| GatewayError::malformed(format!("unknown hash algorithm {}", alg.oid)))
    }

    /// AlgorithmIdentifier with absent parameters.
    pub fn algorithm_identifier(&self) -> AlgorithmIdentifierOwned {
        AlgorithmIdentifierOwned {
            oid: self.oid(),
            parameters: None,
        }
    }

    /// AlgorithmIdentifier with explicit NULL parameters, for peers that
    /// insist on them.
    pub fn algorithm_identifier_with_null(&self) -> AlgorithmIdentifierOwned {
        AlgorithmIdentifierOwned {
            oid: self.oid(),
            parameters: Some(Any::from(AnyRef::NULL)),
        }
    }

    /// Hash `data`.
    pub fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => sha1::Sha1::digest(data).to_vec(),
            Self::Sha224 => sha2::Sha224::digest(data).to_vec(),
            Self::Sha256 => sha2::Sha256::digest(data).to_vec(),
            Self::Sha384 => sha2::Sha384::digest(data).to_vec(),
            Self::Sha512 => sha2::Sha512::digest(data).to_vec(),
            Self::Sha3_224 => sha3::Sha3_224::digest(data).to_vec(),
            Self::Sha3_256 => sha3::Sha3_256::digest(data).to_vec(),
            Self::Sha3_384 => sha3::Sha3_384::digest(data).to_vec(),
            Self::Sha3_512 => sha3::Sha3_512::digest(data).to_vec(),
            Self::Sm3 => sm3::Sm3::digest(data).to_vec(),
            Self::Shake128 => {
                let mut out = vec![0u8; self.length()];
                let mut xof = sha3::Shake128::default();
                xof.update(data);
                xof.finalize_xof_into(&mut out);
                out
            }
            Self::Shake256 => {
                let mut out = vec![0u8; self.length()];
                let mut xof = sha3::Shake256::default();
                xof.update(data);
                xof.finalize_xof_into(&mut out);
                out
            }
        }
    }

    /// Hash `data` and return lower-case hex.
    pub fn hex_hash(&self, data: &[u8]) -> String {
        hex::encode(self.hash(data))
    }

    /// Hash `data` and return standard base64.
    pub fn base64_hash(&self, data: &[u8]) -> String {
        BASE64_STANDARD.encode(self.hash(data))
    }

    /// Returns true for the SHA-3 family, SHAKE included.
    pub fn is_sha3(&self) -> bool {
        matches!(
            self,
            Self::Sha3_224
                | Self::Sha3_256
                | Self::Sha3_384
                | Self::Sha3_512
                | Self::Shake128
                | Self::Shake256
        )
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for HashAlgo {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| GatewayError::config(format!("unknown hash algorithm '{s}'")))
    }
}
