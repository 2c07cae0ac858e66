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

//! Signing resources: hash catalog, signing handles, the signer pool,
//! proof-of-possession construction and client signature checks.

mod hash;
pub mod pool;
pub mod pop;
mod signer;
pub mod verify;

pub use hash::HashAlgo;
pub use pool::{SignerLease, SignerPool};
pub use pop::PopSignature;
pub use signer::{ContentSigner, KeyAlgorithm, SoftwareSigner};
pub use verify::EcVerifier;
