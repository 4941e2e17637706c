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

//! Multi-key transactions over a backend without native transaction support.
//!
//! A [`Transaction`] buffers every write in a [`WriteSet`] and serves its own reads
//! from it. Nothing reaches the backend until [`Transaction::commit`] replays the
//! buffer; [`Transaction::rollback`] or dropping the transaction discards it.
//!
//! Isolation between concurrent transactions depends on [`TransactionMode`]:
//!
//! - `Fast`: no locking. Commits race, the last writer of a key wins, and
//!   increments are written back as absolute values, so concurrent increments can
//!   be lost.
//! - `Locked`: at commit, every buffered key is locked in key order before replay.
//!   Increments are replayed as deltas.
//! - `Serializable`: one lock is held from begin to commit or rollback, so at most
//!   one serializable transaction is open at a time. Keys are also locked at commit.
//!
//! Locks are leases: a transaction holding them longer than `lock_ttl` loses its
//! isolation guarantees.

mod commit;
mod match_view;
#[allow(clippy::module_inception)]
mod transaction;
mod write_set;


use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

pub use self::commit::Commit;
pub use self::commit::IncrReplay;
pub use self::match_view::MatchView;
pub use self::transaction::Transaction;
pub use self::write_set::Change;
pub use self::write_set::WriteSet;
use crate::lock::LockOptions;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionMode {
    #[default]
    Fast,
    Locked,
    Serializable,
}

impl TransactionMode {
    /// How buffered increments are written back in this mode.
    pub fn incr_replay(&self) -> IncrReplay {
        match self {
            TransactionMode::Fast => IncrReplay::Absolute,
            TransactionMode::Locked | TransactionMode::Serializable => IncrReplay::Delta,
        }
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionMode::Fast => write!(f, "fast"),
            TransactionMode::Locked => write!(f, "locked"),
            TransactionMode::Serializable => write!(f, "serializable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Open => write!(f, "open"),
            TransactionState::Committed => write!(f, "committed"),
            TransactionState::RolledBack => write!(f, "rolled back"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionOptions {
    pub mode: TransactionMode,

    /// Longest time to wait for the transaction's locks. Defaults to `lock_ttl`.
    pub timeout: Option<Duration>,

    /// Lease of every lock the transaction takes.
    pub lock_ttl: Duration,

    /// Polling interval while waiting for a lock.
    pub step: Duration,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            mode: TransactionMode::Fast,
            timeout: None,
            lock_ttl: Duration::from_secs(10),
            step: Duration::from_millis(10),
        }
    }
}

impl TransactionOptions {
    pub fn new(mode: TransactionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    pub(crate) fn lock_options(&self) -> LockOptions {
        LockOptions::new(self.lock_ttl)
            .with_wait(self.timeout.unwrap_or(self.lock_ttl))
            .with_step(self.step)
    }
}
