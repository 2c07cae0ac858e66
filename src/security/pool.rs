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

//! Bounded pool of exclusive-use signing handles.
//!
//! The pool owns a fixed set of [`ContentSigner`]s for its whole lifetime.
//! [`SignerPool::borrow`] hands one out as a [`SignerLease`]; dropping the
//! lease (or calling [`SignerLease::requite`]) puts the handle back. A lease
//! cannot be requited twice and cannot be forgotten short of leaking it.
//!
//! Waiters are served through a [`tokio::sync::Semaphore`], which is fair:
//! borrowers acquire handles in the order they started waiting.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use usg_ca_gateway::security::{HashAlgo, KeyAlgorithm, SignerPool, SoftwareSigner};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let signer = SoftwareSigner::generate("ra", KeyAlgorithm::EcdsaP256, HashAlgo::Sha256)?;
//! let pool = SignerPool::replicate("ra", &signer, 4)?;
//!
//! let mut lease = pool.borrow(Duration::from_secs(5)).await?;
//! let signature = lease.signer().sign(b"data")?;
//! lease.requite();
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, SemaphorePermit};

use super::signer::ContentSigner;
use crate::error::{GatewayError, Result};

struct Slot {
    index: usize,
    signer: Box<dyn ContentSigner>,
}

/// Fixed-size pool of signing handles.
pub struct SignerPool {
    name: String,
    size: usize,
    idle: Mutex<Vec<Slot>>,
    permits: Semaphore,
}

impl fmt::Debug for SignerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("available", &self.available())
            .finish()
    }
}

impl SignerPool {
    /// Create a pool owning `signers`. The pool size is fixed at the number
    /// of handles given.
    pub fn new(name: impl Into<String>, signers: Vec<Box<dyn ContentSigner>>) -> Result<Self> {
        let name = name.into();
        if signers.is_empty() {
            return Err(GatewayError::config(format!(
                "signer pool '{name}' needs at least one handle"
            )));
        }

        let size = signers.len();
        let idle = signers
            .into_iter()
            .enumerate()
            .map(|(index, signer)| Slot { index, signer })
            .collect();

        tracing::debug!("Signer pool '{}' created with {} handles", name, size);

        Ok(Self {
            name,
            size,
            idle: Mutex::new(idle),
            permits: Semaphore::new(size),
        })
    }

    /// Create a pool of `parallelism` clones of `signer`.
    pub fn replicate<S>(name: impl Into<String>, signer: &S, parallelism: usize) -> Result<Self>
    where
        S: ContentSigner + Clone + 'static,
    {
        let signers = (0..parallelism)
            .map(|_| Box::new(signer.clone()) as Box<dyn ContentSigner>)
            .collect();
        Self::new(name, signers)
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total number of handles.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of handles not currently on loan.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Borrow a handle, waiting at most `timeout` for one to become free.
    ///
    /// Fails with [`GatewayError::ResourceExhausted`] when the timeout
    /// elapses first.
    pub async fn borrow(&self, timeout: Duration) -> Result<SignerLease<'_>> {
        let started = Instant::now();
        let permit = match tokio::time::timeout(timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(GatewayError::signing(format!(
                    "signer pool '{}' is closed",
                    self.name
                )));
            }
            Err(_) => {
                tracing::warn!(
                    "Signer pool '{}' exhausted: no handle free within {:?}",
                    self.name,
                    timeout
                );
                return Err(GatewayError::resource_exhausted(
                    &self.name,
                    started.elapsed(),
                ));
            }
        };

        // A permit guarantees an idle slot
        let slot = self.lock_idle().pop().ok_or_else(|| {
            GatewayError::internal(format!(
                "signer pool '{}' bookkeeping out of sync",
                self.name
            ))
        })?;

        tracing::trace!(
            "Signer pool '{}': lent handle #{} after {:?}",
            self.name,
            slot.index,
            started.elapsed()
        );

        Ok(SignerLease {
            pool: self,
            slot: Some(slot),
            _permit: permit,
        })
    }

    /// Borrow a handle, run `f` with it and return the handle.
    pub async fn with_signer<T>(
        &self,
        timeout: Duration,
        f: impl FnOnce(&mut dyn ContentSigner) -> Result<T>,
    ) -> Result<T> {
        let mut lease = self.borrow(timeout).await?;
        f(lease.signer())
    }

    /// Stop lending. Current leases may still be returned; pending and
    /// future borrowers fail.
    pub fn close(&self) {
        self.permits.close();
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<Slot>> {
        // The free list stays consistent even if a holder panicked
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn give_back(&self, slot: Slot) {
        tracing::trace!("Signer pool '{}': handle #{} returned", self.name, slot.index);
        self.lock_idle().push(slot);
    }
}

/// Exclusive loan of one pooled handle.
///
/// The handle goes back to the pool when the lease is dropped, on success and
/// failure paths alike.
pub struct SignerLease<'a> {
    pool: &'a SignerPool,
    slot: Option<Slot>,
    // Declared last: the handle is back in the free list before the permit
    // lets the next borrower in.
    _permit: SemaphorePermit<'a>,
}

impl SignerLease<'_> {
    /// The leased handle.
    pub fn signer(&mut self) -> &mut dyn ContentSigner {
        match self.slot.as_mut() {
            Some(slot) => slot.signer.as_mut(),
            // slot is only taken in Drop
            None => unreachable!("lease used after return"),
        }
    }

    /// Pool slot of the leased handle.
    pub fn slot(&self) -> usize {
        self.slot.as_ref().map_or(usize::MAX, |s| s.index)
    }

    /// Name of the owning pool.
    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    /// Return the handle to the pool now.
    pub fn requite(self) {
        drop(self);
    }
}

impl fmt::Debug for SignerLease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerLease")
            .field("pool", &self.pool.name)
            .field("slot", &self.slot())
            .finish()
    }
}

impl Drop for SignerLease<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.give_back(slot);
        }
    }
}
