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

//! Errors raised above the storage seam.
//!
//! Storage operations report failures as [`io::Error`]; everything built on top of
//! them (locks, decorators, transactions) reports a [`CacheError`].

use std::io;
use std::time::Duration;

use crate::transaction::TransactionState;

/// Errors that can occur while coordinating cache access.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A key template references an argument the function does not declare.
    ///
    /// Raised when the template is registered, never at call time.
    #[error("key template {template:?} references unknown argument {arg:?}")]
    KeyTemplate { template: String, arg: String },

    /// The lock is held by someone else and the caller asked not to wait.
    #[error("lock {key:?} is already held")]
    Locked { key: String },

    /// Waiting for a lock exceeded its budget.
    #[error("timed out after {waited:?} waiting for lock {key:?}")]
    LockTimeout { key: String, waited: Duration },

    /// A `Locked` or `Serializable` transaction could not take its locks in time.
    ///
    /// The transaction never opened, or never committed: nothing was written.
    #[error("transaction timed out after {waited:?} acquiring lock {key:?}")]
    TransactionTimeout { key: String, waited: Duration },

    /// The transaction is already committed or rolled back.
    #[error("transaction is already {state}")]
    TransactionClosed { state: TransactionState },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(#[from] io::Error),
}

impl CacheError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CacheError::Locked { .. }
                | CacheError::LockTimeout { .. }
                | CacheError::TransactionTimeout { .. }
        )
    }

    /// Convert into an [`io::Error`] so that it can cross the storage seam.
    pub fn into_io(self) -> io::Error {
        match self {
            CacheError::Backend(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}
