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

//! Defines the capability contract every cache backend implements.
//!
//! The [`Backend`] trait is the only interface the lock primitive, the stampede
//! decorators and the transaction engine require from a store. Any store that
//! provides these per-key operations, an in-process map or a remote cache client,
//! can be plugged in without touching the layers above.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::TryStreamExt;
use log::debug;

use crate::match_exist::MatchExist;
use crate::IOResultStream;

/// Remaining lifetime of a key, as reported by [`Backend::get_expire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// The key does not exist.
    NotFound,
    /// The key exists and never expires.
    Persistent,
    /// The key exists and expires after this duration.
    Remaining(Duration),
}

impl Expiry {
    /// Seconds remaining, `-1` for a key without ttl, `-2` for an absent key.
    ///
    /// A partial second is rounded up so that a live key never reports `0`.
    pub fn as_secs(&self) -> i64 {
        match self {
            Expiry::NotFound => -2,
            Expiry::Persistent => -1,
            Expiry::Remaining(d) => {
                let secs = d.as_secs() as i64;
                if d.subsec_nanos() > 0 {
                    secs + 1
                } else {
                    secs
                }
            }
        }
    }

    pub fn exists(&self) -> bool {
        !matches!(self, Expiry::NotFound)
    }
}

/// The operation set every backend must provide.
///
/// All operations may suspend. Pattern operations use the glob syntax of
/// [`Glob`](crate::glob::Glob). The streams returned by [`scan`](Self::scan) and
/// [`get_match`](Self::get_match) read live state while being polled: they do not
/// provide a snapshot.
///
/// Several methods have a default implementation expressed in terms of the
/// required ones; a backend with native support should override them.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Get the value of a key, `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, io::Error>;

    /// Get several keys at once; the result is aligned with `keys`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, io::Error> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Write a value, optionally with a ttl and an existence condition.
    ///
    /// Returns whether the write took effect.
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        exist: MatchExist,
    ) -> Result<bool, io::Error>;

    /// Unconditionally write several values sharing one ttl.
    async fn set_many(
        &self,
        pairs: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> Result<(), io::Error> {
        for (key, value) in pairs {
            self.set(&key, value, ttl, MatchExist::Any).await?;
        }
        Ok(())
    }

    /// Delete a key; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, io::Error>;

    /// Delete several keys; returns the number of keys that existed.
    async fn delete_many(&self, keys: &[String]) -> Result<u64, io::Error> {
        let mut n = 0;
        for key in keys {
            if self.delete(key).await? {
                n += 1;
            }
        }
        Ok(n)
    }

    /// Delete every key matching `pattern`; returns the number of deleted keys.
    async fn delete_match(&self, pattern: &str) -> Result<u64, io::Error> {
        let keys: Vec<String> = self.scan(pattern).await?.try_collect().await?;
        self.delete_many(&keys).await
    }

    /// Atomically add `by` to an integer counter, creating it at `by` if absent.
    ///
    /// An existing ttl is kept.
    async fn incr(&self, key: &str, by: i64) -> Result<i64, io::Error>;

    /// Set the ttl of an existing key; returns whether the key exists.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, io::Error>;

    async fn get_expire(&self, key: &str) -> Result<Expiry, io::Error>;

    async fn exists(&self, key: &str) -> Result<bool, io::Error> {
        Ok(self.get(key).await?.is_some())
    }

    /// Stream the keys matching `pattern`.
    async fn scan(&self, pattern: &str) -> Result<IOResultStream<String>, io::Error>;

    /// Stream the key-value pairs matching `pattern`.
    async fn get_match(
        &self,
        pattern: &str,
    ) -> Result<IOResultStream<(String, Vec<u8>)>, io::Error>;

    /// Take a lease on `key` for `ttl` if nobody holds it.
    async fn set_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, io::Error> {
        self.set(key, token.as_bytes().to_vec(), Some(ttl), MatchExist::Absent)
            .await
    }

    /// Release the lease on `key` only if it is held with `token`.
    ///
    /// Returns whether a lease was released.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool, io::Error>;

    /// Check whether `key` is locked.
    ///
    /// With `wait`, poll every `step` until the lock is gone or `wait` elapsed, and
    /// report the state observed last.
    async fn is_locked(
        &self,
        key: &str,
        wait: Option<Duration>,
        step: Duration,
    ) -> Result<bool, io::Error> {
        let Some(wait) = wait else {
            return self.exists(key).await;
        };

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if !self.exists(key).await? {
                return Ok(false);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(true);
            }

            let nap = step.min(deadline - now);
            debug!("is_locked: {} still locked, sleep {:?}", key, nap);
            tokio::time::sleep(nap).await;
        }
    }

    async fn ping(&self) -> Result<Vec<u8>, io::Error>;

    /// Remove every key.
    async fn clear(&self) -> Result<(), io::Error>;

    /// Size in bytes of the value stored at `key`, `0` if absent.
    async fn get_size(&self, key: &str) -> Result<u64, io::Error> {
        Ok(self.get(key).await?.map(|v| v.len() as u64).unwrap_or(0))
    }

    /// Total size in bytes of the values whose keys match `pattern`.
    async fn get_size_match(&self, pattern: &str) -> Result<u64, io::Error> {
        let strm = self.get_match(pattern).await?;
        strm.try_fold(0u64, |acc, (_k, v)| async move {
            Ok::<_, io::Error>(acc + v.len() as u64)
        })
            .await
    }
}

/// Generates a [`Backend`] impl for a pointer type that forwards every call to the
/// pointee, so that `&B`, `Arc<B>` and `Arc<dyn Backend>` are backends too.
macro_rules! forward_backend {
    ($ptr:ty) => {
        #[async_trait::async_trait]
        impl<T> Backend for $ptr
        where T: Backend + ?Sized
        {
            async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, io::Error> {
                (**self).get(key).await
            }

            async fn get_many(
                &self,
                keys: &[String],
            ) -> Result<Vec<Option<Vec<u8>>>, io::Error> {
                (**self).get_many(keys).await
            }

            async fn set(
                &self,
                key: &str,
                value: Vec<u8>,
                ttl: Option<Duration>,
                exist: MatchExist,
            ) -> Result<bool, io::Error> {
                (**self).set(key, value, ttl, exist).await
            }

            async fn set_many(
                &self,
                pairs: Vec<(String, Vec<u8>)>,
                ttl: Option<Duration>,
            ) -> Result<(), io::Error> {
                (**self).set_many(pairs, ttl).await
            }

            async fn delete(&self, key: &str) -> Result<bool, io::Error> {
                (**self).delete(key).await
            }

            async fn delete_many(&self, keys: &[String]) -> Result<u64, io::Error> {
                (**self).delete_many(keys).await
            }

            async fn delete_match(&self, pattern: &str) -> Result<u64, io::Error> {
                (**self).delete_match(pattern).await
            }

            async fn incr(&self, key: &str, by: i64) -> Result<i64, io::Error> {
                (**self).incr(key, by).await
            }

            async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, io::Error> {
                (**self).expire(key, ttl).await
            }

            async fn get_expire(&self, key: &str) -> Result<Expiry, io::Error> {
                (**self).get_expire(key).await
            }

            async fn exists(&self, key: &str) -> Result<bool, io::Error> {
                (**self).exists(key).await
            }

            async fn scan(&self, pattern: &str) -> Result<IOResultStream<String>, io::Error> {
                (**self).scan(pattern).await
            }

            async fn get_match(
                &self,
                pattern: &str,
            ) -> Result<IOResultStream<(String, Vec<u8>)>, io::Error> {
                (**self).get_match(pattern).await
            }

            async fn set_lock(
                &self,
                key: &str,
                token: &str,
                ttl: Duration,
            ) -> Result<bool, io::Error> {
                (**self).set_lock(key, token, ttl).await
            }

            async fn unlock(&self, key: &str, token: &str) -> Result<bool, io::Error> {
                (**self).unlock(key, token).await
            }

            async fn is_locked(
                &self,
                key: &str,
                wait: Option<Duration>,
                step: Duration,
            ) -> Result<bool, io::Error> {
                (**self).is_locked(key, wait, step).await
            }

            async fn ping(&self) -> Result<Vec<u8>, io::Error> {
                (**self).ping().await
            }

            async fn clear(&self) -> Result<(), io::Error> {
                (**self).clear().await
            }

            async fn get_size(&self, key: &str) -> Result<u64, io::Error> {
                (**self).get_size(key).await
            }

            async fn get_size_match(&self, pattern: &str) -> Result<u64, io::Error> {
                (**self).get_size_match(pattern).await
            }
        }
    };
}

forward_backend!(&T);
forward_backend!(Arc<T>);

/// Collect a key stream, e.g., for tests and for eager pattern expansion.
pub async fn collect_keys(strm: IOResultStream<String>) -> Result<Vec<String>, io::Error> {
    strm.try_collect().await
}

/// Collect a key-value stream sorted by key.
pub async fn collect_sorted(
    strm: IOResultStream<(String, Vec<u8>)>,
) -> Result<Vec<(String, Vec<u8>)>, io::Error> {
    let mut items: Vec<_> = strm.try_collect().await?;
    items.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(items)
}

/// Parse a stored counter. Surrounding whitespace is ignored.
pub(crate) fn parse_int(key: &str, value: &[u8]) -> Result<i64, io::Error> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("value of {:?} is not an integer", key),
            )
        })
}

/// Box a vector of items as a ready stream.
pub(crate) fn iter_stream<T>(items: Vec<T>) -> IOResultStream<T>
where T: Send + 'static {
    futures::stream::iter(items).map(Ok).boxed()
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use super::parse_int;
    use super::Expiry;

    #[test]
    fn test_expiry_as_secs() {
        assert_eq!(Expiry::NotFound.as_secs(), -2);
        assert_eq!(Expiry::Persistent.as_secs(), -1);
        assert_eq!(Expiry::Remaining(Duration::from_secs(10)).as_secs(), 10);
        assert_eq!(Expiry::Remaining(Duration::from_millis(10_500)).as_secs(), 11);
        assert_eq!(Expiry::Remaining(Duration::from_millis(1)).as_secs(), 1);
    }

    #[test]
    fn test_expiry_exists() {
        assert!(!Expiry::NotFound.exists());
        assert!(Expiry::Persistent.exists());
        assert!(Expiry::Remaining(Duration::ZERO).exists());
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int("k", b"42").unwrap(), 42);
        assert_eq!(parse_int("k", b" 5").unwrap(), 5);
        assert_eq!(parse_int("k", b"-3\n").unwrap(), -3);

        assert_eq!(parse_int("k", b"abc").unwrap_err().kind(), io::ErrorKind::InvalidData);
        assert_eq!(parse_int("k", b"").unwrap_err().kind(), io::ErrorKind::InvalidData);
        assert_eq!(parse_int("k", &[0xff]).unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
