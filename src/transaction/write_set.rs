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

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::io;
use std::time::Duration;

use tokio::time::Instant;

use crate::backend::parse_int;
use crate::backend::Expiry;

/// A buffered mutation of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Write `value`. `expire_at: None` makes it persistent.
    Set {
        value: Vec<u8>,
        expire_at: Option<Instant>,
    },

    Delete,

    /// Add `delta` to the stored integer.
    ///
    /// `baseline` is the backend value read when the key was first incremented in
    /// this transaction. `expire_at` is the buffered deadline, or the key's own
    /// deadline read together with the baseline. `None` means persistent.
    Incr {
        baseline: i64,
        delta: i64,
        expire_at: Option<Instant>,
    },

    /// Move the deadline of a key that is otherwise untouched.
    Expire { expire_at: Instant },
}

fn is_expired(expire_at: Option<Instant>, now: Instant) -> bool {
    matches!(expire_at, Some(t) if t <= now)
}

fn remaining(expire_at: Instant, now: Instant) -> Expiry {
    if expire_at <= now {
        Expiry::NotFound
    } else {
        Expiry::Remaining(expire_at - now)
    }
}

pub(crate) fn add(key: &str, a: i64, b: i64) -> Result<i64, io::Error> {
    a.checked_add(b).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("increment of {:?} overflows", key),
        )
    })
}

impl Change {
    /// The value a read inside the transaction observes.
    ///
    /// `None` means the buffer does not decide and the read falls through to the
    /// backend. `Some(None)` means the key is absent regardless of the backend.
    pub fn read(&self, now: Instant) -> Option<Option<Vec<u8>>> {
        match self {
            Change::Set { value, expire_at } => {
                if is_expired(*expire_at, now) {
                    Some(None)
                } else {
                    Some(Some(value.clone()))
                }
            }
            Change::Delete => Some(None),
            Change::Incr {
                baseline,
                delta,
                expire_at,
            } => {
                if is_expired(*expire_at, now) {
                    Some(None)
                } else {
                    // `delta` was range checked when it was buffered.
                    let v = baseline.saturating_add(*delta);
                    Some(Some(v.to_string().into_bytes()))
                }
            }
            Change::Expire { expire_at } => {
                if *expire_at <= now {
                    Some(None)
                } else {
                    None
                }
            }
        }
    }

    /// Whether this change hides the backend entry of the key from a pattern view.
    pub fn masks_backend(&self, now: Instant) -> bool {
        self.read(now).is_some()
    }

    /// The deadline a read inside the transaction observes, `None` if it falls through.
    pub fn expiry(&self, now: Instant) -> Option<Expiry> {
        match self {
            Change::Set { expire_at, .. } => Some(match expire_at {
                None => Expiry::Persistent,
                Some(t) => remaining(*t, now),
            }),
            Change::Delete => Some(Expiry::NotFound),
            Change::Incr {
                expire_at: Some(t), ..
            } => Some(remaining(*t, now)),
            Change::Incr { expire_at: None, .. } => None,
            Change::Expire { expire_at } => Some(remaining(*expire_at, now)),
        }
    }

    /// Apply an increment on top of this change.
    ///
    /// Returns `None` if the backend baseline is needed, i.e. the buffer alone does
    /// not know the current value.
    pub fn incr(&self, key: &str, by: i64, now: Instant) -> Result<Option<(Change, i64)>, io::Error> {
        // The key is absent in the transaction: start from zero, persistent.
        let fresh = || {
            let change = Change::Set {
                value: by.to_string().into_bytes(),
                expire_at: None,
            };
            Ok::<_, io::Error>(Some((change, by)))
        };

        match self {
            Change::Set { value, expire_at } => {
                if is_expired(*expire_at, now) {
                    return fresh();
                }
                let n = add(key, parse_int(key, value)?, by)?;
                let change = Change::Set {
                    value: n.to_string().into_bytes(),
                    expire_at: *expire_at,
                };
                Ok(Some((change, n)))
            }
            Change::Delete => fresh(),
            Change::Incr {
                baseline,
                delta,
                expire_at,
            } => {
                if is_expired(*expire_at, now) {
                    return fresh();
                }
                let delta = add(key, *delta, by)?;
                let n = add(key, *baseline, delta)?;
                let change = Change::Incr {
                    baseline: *baseline,
                    delta,
                    expire_at: *expire_at,
                };
                Ok(Some((change, n)))
            }
            Change::Expire { expire_at } => {
                if *expire_at <= now {
                    fresh()
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Move the deadline of a buffered key. Returns `None` if the key is absent.
    pub fn expire(&self, ttl: Duration, now: Instant) -> Option<Change> {
        let deadline = Some(now + ttl);
        match self {
            Change::Set { value, expire_at } if !is_expired(*expire_at, now) => Some(Change::Set {
                value: value.clone(),
                expire_at: deadline,
            }),
            Change::Incr {
                baseline,
                delta,
                expire_at,
            } if !is_expired(*expire_at, now) => Some(Change::Incr {
                baseline: *baseline,
                delta: *delta,
                expire_at: deadline,
            }),
            Change::Expire { expire_at } if *expire_at > now => Some(Change::Expire {
                expire_at: now + ttl,
            }),
            _ => None,
        }
    }
}

/// The buffered mutations of one transaction, ordered by key.
///
/// The ordering is also the order in which keys are locked and replayed at commit.
#[derive(Debug, Default)]
pub struct WriteSet {
    changes: BTreeMap<String, Change>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Change> {
        self.changes.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, change: Change) {
        self.changes.insert(key.into(), change);
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Change> {
        self.changes.iter()
    }

    /// Remove every change, e.g. on rollback.
    pub fn clear(&mut self) {
        self.changes.clear();
    }

    /// Take the changes out for replay, leaving the buffer empty.
    pub fn take(&mut self) -> BTreeMap<String, Change> {
        std::mem::take(&mut self.changes)
    }
}
