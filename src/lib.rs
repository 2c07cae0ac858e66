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

//! # usg-ca-gateway
//!
//! A protocol gateway in front of a certificate authority. Clients speak
//! EST (RFC 7030), SCEP (RFC 8894), a CMP-style key update exchange or the
//! certificate subset of ACME (RFC 8555); the gateway turns each of them into
//! one canonical batch of enrollment requests, adds a proof-of-possession
//! signature where the CA requires one, submits the batch to the CA and
//! answers in the client's protocol.
//!
//! ## Components
//!
//! - [`security::SignerPool`]: bounded set of signing handles, leased one at
//!   a time for proof-of-possession signatures.
//! - [`protocol::ProtocolAdapter`]: decode protocol bytes into
//!   [`types::EnrollmentRequest`]s and encode the
//!   [`types::EnrollmentResult`] back.
//! - [`backend::CaClient`]: submits batches to the CA.
//! - [`Responder`]: drives one request through decode, lease, submit and
//!   encode, and audits it.
//! - [`audit::AuditSink`]: append-only record of every request.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use usg_ca_gateway::backend::{CaClientConfig, HttpCaClient};
//! use usg_ca_gateway::protocol::{CmpAdapter, InboundRequest, ProtocolAdapter};
//! use usg_ca_gateway::security::{HashAlgo, SignerPool, SoftwareSigner};
//! use usg_ca_gateway::Responder;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let signer = SoftwareSigner::from_pkcs8_file("pop", "/etc/ca-gateway/pop.pem", HashAlgo::Sha256)?;
//! let pool = SignerPool::replicate("pop", &signer, 4)?;
//!
//! let backend = HttpCaClient::new(
//!     CaClientConfig::builder()
//!         .url("https://ca.example.com/gw")?
//!         .ca_name("issuing")
//!         .build()?,
//! )?;
//!
//! let responder = Responder::builder()
//!     .mount("/cmp", ProtocolAdapter::CmpUpdate(CmpAdapter::new("tls")))
//!     .signer_pool(Arc::new(pool))
//!     .backend(Arc::new(backend))
//!     .build()?;
//!
//! let response = responder
//!     .service(InboundRequest::post("/cmp/update", "application/json", "{}"))
//!     .await;
//! println!("{}", response.status);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod audit;
pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod responder;
pub mod security;
pub mod types;

#[cfg(feature = "server")]
pub mod server;

pub use config::{ConfigLoader, GatewayConf};
pub use error::{ErrorKind, GatewayError, Result};
pub use responder::{Responder, ResponderBuilder};
pub use types::{EnrollmentRequest, EnrollmentResult, Operation, Outcome};

pub use x509_cert::Certificate;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User-Agent sent to the CA service.
pub const USER_AGENT: &str = concat!("usg-ca-gateway/", env!("CARGO_PKG_VERSION"));
