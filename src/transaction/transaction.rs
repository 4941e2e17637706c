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

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use log::info;
use log::warn;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::backend::collect_keys;
use crate::backend::parse_int;
use crate::backend::Backend;
use crate::backend::Expiry;
use crate::errors::CacheError;
use crate::lock;
use crate::lock::LockGuard;
use crate::match_exist::MatchExist;
use crate::transaction::commit::as_transaction_timeout;
use crate::transaction::commit::lock_keys;
use crate::transaction::commit::release_all;
use crate::transaction::commit::Commit;
use crate::transaction::match_view::MatchView;
use crate::transaction::write_set::add;
use crate::transaction::write_set::Change;
use crate::transaction::write_set::WriteSet;
use crate::transaction::TransactionMode;
use crate::transaction::TransactionOptions;
use crate::transaction::TransactionState;
use crate::IOResultStream;

/// The lock held by an open `Serializable` transaction.
pub(crate) const SERIALIZABLE_LOCK: &str = "transaction:serializable:lock";

#[derive(Debug)]
struct Inner {
    state: TransactionState,
    changes: WriteSet,
}

/// A write-buffering overlay on a backend.
///
/// It implements [`Backend`] itself: every operation issued through it sees the
/// transaction's own writes, and no write reaches the target before
/// [`commit`](Self::commit).
///
/// One transaction has a single logical owner. Operations must not be issued from
/// several tasks at once.
pub struct Transaction {
    target: Arc<dyn Backend>,
    options: TransactionOptions,
    inner: Mutex<Inner>,

    /// The whole-lifetime lock of a `Serializable` transaction.
    held: Mutex<Vec<LockGuard>>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("options", &self.options)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl Transaction {
    /// Open a transaction on `target`.
    ///
    /// A `Serializable` transaction waits here for its lock, and fails with
    /// [`CacheError::TransactionTimeout`] if it does not get it in time.
    pub async fn begin(
        target: Arc<dyn Backend>,
        options: TransactionOptions,
    ) -> Result<Self, CacheError> {
        let mut held = vec![];

        if options.mode == TransactionMode::Serializable {
            let start = Instant::now();
            let guard = lock::acquire(target.clone(), SERIALIZABLE_LOCK, &options.lock_options())
                .await
                .map_err(|e| as_transaction_timeout(e, start))?;
            held.push(guard);
        }

        debug!("transaction begin: {:?}", options);

        Ok(Self {
            target,
            options,
            inner: Mutex::new(Inner {
                state: TransactionState::Open,
                changes: WriteSet::new(),
            }),
            held: Mutex::new(held),
        })
    }

    pub fn mode(&self) -> TransactionMode {
        self.options.mode
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Number of keys with a buffered change.
    pub fn pending(&self) -> usize {
        self.inner.lock().changes.len()
    }

    /// Replay the buffered changes on the target.
    ///
    /// `Locked` and `Serializable` transactions lock every buffered key first. If
    /// the keys can not be locked in time, nothing is written, the transaction is
    /// rolled back and [`CacheError::TransactionTimeout`] is returned.
    ///
    /// A backend failure during replay leaves the changes before it applied; the
    /// transaction ends up rolled back and the error is returned.
    ///
    /// Committing a closed transaction does nothing.
    pub async fn commit(&self) -> Result<(), CacheError> {
        let changes = {
            let mut inner = self.inner.lock();
            if inner.state != TransactionState::Open {
                debug!("commit: transaction already {}", inner.state);
                return Ok(());
            }
            inner.state = TransactionState::Committed;
            inner.changes.take()
        };

        let key_locks = if self.mode() == TransactionMode::Fast {
            vec![]
        } else {
            match lock_keys(&self.target, changes.keys(), &self.options.lock_options()).await {
                Ok(guards) => guards,
                Err(e) => {
                    warn!("transaction commit gave up: {}", e);
                    self.inner.lock().state = TransactionState::RolledBack;
                    self.release_held().await;
                    return Err(e);
                }
            }
        };

        let n = changes.len();
        let res = self.target.commit(changes, self.mode().incr_replay()).await;

        release_all(key_locks).await;
        self.release_held().await;

        match res {
            Ok(()) => {
                info!("transaction committed: mode={}, keys={}", self.mode(), n);
                Ok(())
            }
            Err(e) => {
                warn!("transaction replay failed, partially applied: {}", e);
                self.inner.lock().state = TransactionState::RolledBack;
                Err(e.into())
            }
        }
    }

    /// Discard the buffered changes and release the transaction's locks.
    pub async fn rollback(&self) -> Result<(), CacheError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != TransactionState::Open {
                return Ok(());
            }
            inner.state = TransactionState::RolledBack;
            let n = inner.changes.len();
            inner.changes.clear();
            info!("transaction rolled back: mode={}, keys={}", self.options.mode, n);
        }

        self.release_held().await;
        Ok(())
    }

    async fn release_held(&self) {
        let held = std::mem::take(&mut *self.held.lock());
        release_all(held).await;
    }

    fn ensure_open(&self) -> Result<(), io::Error> {
        let state = self.state();
        if state == TransactionState::Open {
            Ok(())
        } else {
            Err(CacheError::TransactionClosed { state }.into_io())
        }
    }

    fn buffered(&self, key: &str) -> Option<Change> {
        self.inner.lock().changes.get(key).cloned()
    }

    fn buffer(&self, key: &str, change: Change) {
        self.inner.lock().changes.insert(key, change);
    }

    /// The view of `pattern` inside this transaction.
    ///
    /// The locks the transaction holds are not part of its data.
    fn match_view(&self, pattern: &str) -> MatchView {
        let held: Vec<String> = self.held.lock().iter().map(|g| g.key().to_string()).collect();
        let inner = self.inner.lock();
        MatchView::new(pattern, &inner.changes, Instant::now()).hide(held)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.state == TransactionState::Open {
            info!(
                "transaction dropped while open, discard {} changes",
                inner.changes.len()
            );
        }
        // Held locks are released by the guards' own drop.
    }
}

#[async_trait::async_trait]
impl Backend for Transaction {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, io::Error> {
        if let Some(change) = self.buffered(key) {
            if let Some(read) = change.read(Instant::now()) {
                return Ok(read);
            }
        }
        self.target.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        exist: MatchExist,
    ) -> Result<bool, io::Error> {
        self.ensure_open()?;

        if exist.is_conditional() {
            let exists = self.exists(key).await?;
            if let Err(e) = exist.match_exist(exists) {
                debug!("transaction set {:?} skipped: {}", key, e);
                return Ok(false);
            }
        }

        let expire_at = ttl.map(|t| Instant::now() + t);
        self.buffer(key, Change::Set { value, expire_at });
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, io::Error> {
        self.ensure_open()?;

        if !self.exists(key).await? {
            return Ok(false);
        }
        self.buffer(key, Change::Delete);
        Ok(true)
    }

    async fn delete_match(&self, pattern: &str) -> Result<u64, io::Error> {
        self.ensure_open()?;

        let keys = collect_keys(self.scan(pattern).await?).await?;
        for key in keys.iter() {
            self.buffer(key, Change::Delete);
        }
        Ok(keys.len() as u64)
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, io::Error> {
        self.ensure_open()?;

        let now = Instant::now();
        let buffered = self.buffered(key);

        let applied = match &buffered {
            Some(change) => change.incr(key, by, now)?,
            None => None,
        };

        let (change, n) = match applied {
            Some(x) => x,
            None => {
                let baseline = match self.target.get(key).await? {
                    Some(v) => parse_int(key, &v)?,
                    None => 0,
                };
                let n = add(key, baseline, by)?;
                // Carry the key's deadline along, so an absolute replay keeps it.
                let expire_at = match buffered {
                    Some(Change::Expire { expire_at }) => Some(expire_at),
                    _ => match self.target.get_expire(key).await? {
                        Expiry::Remaining(d) => Some(now + d),
                        _ => None,
                    },
                };
                let change = Change::Incr {
                    baseline,
                    delta: by,
                    expire_at,
                };
                (change, n)
            }
        };

        self.buffer(key, change);
        Ok(n)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, io::Error> {
        self.ensure_open()?;

        let now = Instant::now();
        match self.buffered(key) {
            Some(change) => match change.expire(ttl, now) {
                Some(c) => {
                    self.buffer(key, c);
                    Ok(true)
                }
                None => Ok(false),
            },
            None => {
                if !self.target.exists(key).await? {
                    return Ok(false);
                }
                self.buffer(key, Change::Expire {
                    expire_at: now + ttl,
                });
                Ok(true)
            }
        }
    }

    async fn get_expire(&self, key: &str) -> Result<Expiry, io::Error> {
        let buffered = self.buffered(key);

        if let Some(expiry) = buffered.as_ref().and_then(|c| c.expiry(Instant::now())) {
            return Ok(expiry);
        }

        let expiry = self.target.get_expire(key).await?;

        // An increment creates the key if the target does not have it.
        if expiry == Expiry::NotFound && matches!(buffered, Some(Change::Incr { .. })) {
            return Ok(Expiry::Persistent);
        }
        Ok(expiry)
    }

    async fn scan(&self, pattern: &str) -> Result<IOResultStream<String>, io::Error> {
        let view = self.match_view(pattern);
        let strm = self.target.scan(pattern).await?;
        Ok(view.keys(strm))
    }

    async fn get_match(
        &self,
        pattern: &str,
    ) -> Result<IOResultStream<(String, Vec<u8>)>, io::Error> {
        let view = self.match_view(pattern);
        let strm = self.target.get_match(pattern).await?;
        Ok(view.entries(strm))
    }

    async fn set_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, io::Error> {
        self.target.set_lock(key, token, ttl).await
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, io::Error> {
        self.target.unlock(key, token).await
    }

    async fn is_locked(
        &self,
        key: &str,
        wait: Option<Duration>,
        step: Duration,
    ) -> Result<bool, io::Error> {
        self.target.is_locked(key, wait, step).await
    }

    async fn ping(&self) -> Result<Vec<u8>, io::Error> {
        self.target.ping().await
    }

    async fn clear(&self) -> Result<(), io::Error> {
        self.delete_match("*").await?;
        Ok(())
    }
}
