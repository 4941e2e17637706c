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

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use log::debug;
use log::warn;
use tokio::time::Instant;

use crate::backend::Backend;
use crate::errors::CacheError;
use crate::lock;
use crate::lock::LockGuard;
use crate::lock::LockOptions;
use crate::match_exist::MatchExist;
use crate::transaction::write_set::Change;

/// How a buffered increment is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrReplay {
    /// Write `baseline + delta` as a plain value.
    ///
    /// Increments committed by others since the baseline was read are lost.
    Absolute,

    /// Call the backend's atomic `incr` with the buffered delta.
    Delta,
}

/// Applies buffered changes to the underlying storage.
#[async_trait::async_trait]
pub trait Commit {
    /// Replay `changes` in key order.
    ///
    /// Each change is a separate backend operation; a failure stops the replay and
    /// leaves the changes before it applied.
    async fn commit(
        &self,
        changes: BTreeMap<String, Change>,
        incr: IncrReplay,
    ) -> Result<(), io::Error>;
}

#[async_trait::async_trait]
impl<B> Commit for B
where B: Backend + ?Sized
{
    async fn commit(
        &self,
        changes: BTreeMap<String, Change>,
        incr: IncrReplay,
    ) -> Result<(), io::Error> {
        for (key, change) in changes {
            let now = Instant::now();
            debug!("commit: {:?} {:?}", key, change);

            match change {
                Change::Set { value, expire_at } => match expire_at {
                    None => {
                        self.set(&key, value, None, MatchExist::Any).await?;
                    }
                    Some(t) if t > now => {
                        self.set(&key, value, Some(t - now), MatchExist::Any).await?;
                    }
                    Some(_) => {
                        self.delete(&key).await?;
                    }
                },
                Change::Delete => {
                    self.delete(&key).await?;
                }
                Change::Incr {
                    baseline,
                    delta,
                    expire_at,
                } => {
                    if matches!(expire_at, Some(t) if t <= now) {
                        self.delete(&key).await?;
                        continue;
                    }

                    let ttl = expire_at.map(|t| t - now);
                    match incr {
                        IncrReplay::Absolute => {
                            let v = baseline.saturating_add(delta).to_string().into_bytes();
                            self.set(&key, v, ttl, MatchExist::Any).await?;
                        }
                        IncrReplay::Delta => {
                            self.incr(&key, delta).await?;
                            if let Some(ttl) = ttl {
                                self.expire(&key, ttl).await?;
                            }
                        }
                    }
                }
                Change::Expire { expire_at } => {
                    if expire_at > now {
                        self.expire(&key, expire_at - now).await?;
                    } else {
                        self.delete(&key).await?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// The lock guarding writes to `key` by committing transactions.
pub(crate) fn key_lock(key: &str) -> String {
    format!("{}:lock", key)
}

/// Lock every key in order, sharing one wait budget across all of them.
///
/// On failure the locks taken so far are released and the timeout is reported as
/// [`CacheError::TransactionTimeout`].
pub(crate) async fn lock_keys<'a>(
    target: &Arc<dyn Backend>,
    keys: impl IntoIterator<Item = &'a String>,
    options: &LockOptions,
) -> Result<Vec<LockGuard>, CacheError> {
    let start = Instant::now();
    let budget = options.wait.unwrap_or_default();
    let mut guards = vec![];

    for key in keys {
        let left = budget.saturating_sub(start.elapsed());
        let opts = options.with_wait(left);

        match lock::acquire(target.clone(), key_lock(key), &opts).await {
            Ok(g) => guards.push(g),
            Err(e) => {
                release_all(guards).await;
                return Err(as_transaction_timeout(e, start));
            }
        }
    }

    Ok(guards)
}

/// Lock timeouts on behalf of a transaction report the transaction's total wait.
pub(crate) fn as_transaction_timeout(e: CacheError, start: Instant) -> CacheError {
    match e {
        CacheError::LockTimeout { key, .. } | CacheError::Locked { key } => {
            CacheError::TransactionTimeout {
                key,
                waited: start.elapsed(),
            }
        }
        other => other,
    }
}

pub(crate) async fn release_all(guards: Vec<LockGuard>) {
    for g in guards.into_iter().rev() {
        let key = g.key().to_string();
        if let Err(e) = g.release().await {
            warn!("release transaction lock {:?} failed: {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backend::Expiry;
    use crate::impls::memory::MemoryBackend;

    fn changes(items: Vec<(&str, Change)>) -> BTreeMap<String, Change> {
        items.into_iter().map(|(k, c)| (k.to_string(), c)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay() -> anyhow::Result<()> {
        let b = MemoryBackend::new();
        b.set("gone", b"x".to_vec(), None, MatchExist::Any).await?;
        b.set("ttl", b"x".to_vec(), None, MatchExist::Any).await?;
        b.set("n", b"10".to_vec(), None, MatchExist::Any).await?;

        let now = Instant::now();
        let cs = changes(vec![
            ("a", Change::Set {
                value: b"1".to_vec(),
                expire_at: Some(now + Duration::from_secs(5)),
            }),
            ("gone", Change::Delete),
            ("ttl", Change::Expire {
                expire_at: now + Duration::from_secs(3),
            }),
            ("n", Change::Incr {
                baseline: 10,
                delta: 2,
                expire_at: None,
            }),
        ]);

        // Someone else bumps `n` after the baseline was read.
        b.incr("n", 100).await?;

        b.commit(cs, IncrReplay::Delta).await?;

        assert_eq!(b.get("a").await?, Some(b"1".to_vec()));
        assert_eq!(b.get_expire("a").await?, Expiry::Remaining(Duration::from_secs(5)));
        assert_eq!(b.get("gone").await?, None);
        assert_eq!(b.get_expire("ttl").await?, Expiry::Remaining(Duration::from_secs(3)));
        assert_eq!(b.get("n").await?, Some(b"112".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn test_absolute_incr_loses_updates() -> anyhow::Result<()> {
        let b = MemoryBackend::new();
        b.set("n", b"10".to_vec(), None, MatchExist::Any).await?;

        let cs = changes(vec![("n", Change::Incr {
            baseline: 10,
            delta: 2,
            expire_at: None,
        })]);

        b.incr("n", 100).await?;
        b.commit(cs, IncrReplay::Absolute).await?;

        assert_eq!(b.get("n").await?, Some(b"12".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_keys_timeout_releases() -> anyhow::Result<()> {
        let b: Arc<dyn Backend> = Arc::new(MemoryBackend::new());

        let held = lock::acquire(b.clone(), key_lock("b"), &LockOptions::default()).await?;

        let opts = LockOptions::new(Duration::from_secs(10))
            .with_wait(Duration::from_millis(30))
            .with_step(Duration::from_millis(5));
        let keys = vec!["a".to_string(), "b".to_string()];

        let res = lock_keys(&b, &keys, &opts).await;
        assert!(matches!(res, Err(CacheError::TransactionTimeout { ref key, .. }) if key == "b:lock"));
        assert!(!b.exists("a:lock").await?, "partial locks are released");

        held.release().await?;
        let guards = lock_keys(&b, &keys, &opts).await?;
        assert_eq!(guards.len(), 2);
        release_all(guards).await;
        assert!(!b.exists("b:lock").await?);
        Ok(())
    }
}
