// Copyright 2021 Datafuse Labs
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

//! Leased mutual exclusion built from the backend's conditional set.
//!
//! A lock is an entry whose value is the owner's random token. It is taken with
//! [`Backend::set_lock`] and released with the compare-and-delete
//! [`Backend::unlock`], so a caller can never release a lease it does not hold,
//! e.g., after its own lease expired and someone else took the lock.
//!
//! Leases are bounded by a ttl: a holder that crashes or stalls longer than the
//! ttl implicitly hands the lock to the next acquirer. The ttl must cover the
//! worst-case critical section.
//!
//! Dropping an [`acquire`] future while it waits abandons the attempt: no lease is
//! taken on the caller's behalf afterwards.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use log::warn;
use serde::Deserialize;
use serde::Serialize;
use tokio::time::Instant;

use crate::backend::Backend;
use crate::errors::CacheError;

/// How to take a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    /// Lease duration.
    pub ttl: Duration,

    /// How long to wait for a held lock. `None` fails immediately.
    pub wait: Option<Duration>,

    /// Polling interval while waiting.
    pub step: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            wait: None,
            step: Duration::from_millis(100),
        }
    }
}

impl LockOptions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }
}

/// A held lease. Release it with [`LockGuard::release`].
///
/// A guard dropped without release schedules a best-effort release on the current
/// tokio runtime; without a runtime the lease simply expires.
pub struct LockGuard {
    backend: Arc<dyn Backend>,
    key: String,
    token: String,
    acquired_at: Instant,
    ttl: Duration,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("acquired_at", &self.acquired_at)
            .field("ttl", &self.ttl)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether the lease ttl has run out, i.e., the lock may be held by someone else.
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.ttl
    }

    /// Release the lease.
    ///
    /// Returns `false` if the lease was no longer held, e.g., it expired: that is not
    /// an error.
    pub async fn release(mut self) -> Result<bool, CacheError> {
        self.released = true;
        let released = self.backend.unlock(&self.key, &self.token).await?;
        debug!("release lock {:?}: {}", self.key, released);
        Ok(released)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("lock {:?} dropped outside of a runtime, left to expire", self.key);
            return;
        };

        let backend = self.backend.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);

        handle.spawn(async move {
            if let Err(e) = backend.unlock(&key, &token).await {
                warn!("release dropped lock {:?} failed: {}", key, e);
            }
        });
    }
}

/// Take the lock `key`.
///
/// Without `options.wait`, or with a zero wait, a held lock fails immediately
/// with [`CacheError::Locked`]. With a wait budget, poll until the lock is taken or the
/// budget elapsed, then fail with [`CacheError::LockTimeout`].
pub async fn acquire(
    backend: Arc<dyn Backend>,
    key: impl Into<String>,
    options: &LockOptions,
) -> Result<LockGuard, CacheError> {
    let key = key.into();
    let token = uuid::Uuid::new_v4().to_string();
    let start = Instant::now();

    loop {
        if backend.set_lock(&key, &token, options.ttl).await? {
            debug!("acquired lock {:?} after {:?}", key, start.elapsed());
            return Ok(LockGuard {
                backend,
                key,
                token,
                acquired_at: Instant::now(),
                ttl: options.ttl,
                released: false,
            });
        }

        // A zero budget fails fast like no budget at all.
        let Some(wait) = options.wait.filter(|w| !w.is_zero()) else {
            return Err(CacheError::Locked { key });
        };

        let waited = start.elapsed();
        if waited >= wait {
            return Err(CacheError::LockTimeout { key, waited });
        }

        backend
            .is_locked(&key, Some(wait - waited), options.step)
            .await?;
    }
}
