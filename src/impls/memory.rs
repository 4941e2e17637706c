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

//! Provides the in-process reference implementation of the [`Backend`] contract.
//!
//! [`MemoryBackend`] stores entries in a [`BTreeMap`] behind a mutex. Expired
//! entries are treated as absent on every read and removed lazily.

use std::collections::BTreeMap;
use std::collections::Bound;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::debug;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::backend::parse_int;
use crate::backend::Backend;
use crate::backend::Expiry;
use crate::glob::Glob;
use crate::match_exist::MatchExist;
use crate::IOResultStream;

/// Max number of keys examined while holding the lock for one step of a pattern stream.
const SCAN_BATCH: usize = 128;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expire_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expire_at.map(|at| at <= now).unwrap_or(false)
    }
}

type Store = Arc<Mutex<BTreeMap<String, Entry>>>;

/// An in-memory backend.
///
/// Cloning a `MemoryBackend` yields another handle to the same store.
///
/// # Examples
///
/// ```
/// use cache_api::impls::memory::MemoryBackend;
/// use cache_api::Backend;
/// use cache_api::MatchExist;
///
/// #[tokio::main]
/// async fn main() -> std::io::Result<()> {
///     let backend = MemoryBackend::new();
///
///     backend.set("key1", b"value1".to_vec(), None, MatchExist::Any).await?;
///     assert_eq!(backend.get("key1").await?, Some(b"value1".to_vec()));
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: Store,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live entry of `key`, dropping it if it has expired.
    fn live<'a>(data: &'a mut BTreeMap<String, Entry>, key: &str, now: Instant) -> Option<&'a mut Entry> {
        let expired = data.get(key)?.is_expired(now);
        if expired {
            data.remove(key);
            return None;
        }
        data.get_mut(key)
    }

    /// Build a lazy stream over the live entries matching `pattern`.
    ///
    /// Every step takes the lock once and examines at most [`SCAN_BATCH`] keys,
    /// resuming after the last examined key, so concurrent writers interleave
    /// with a long scan.
    fn match_stream<T, F>(&self, pattern: &str, project: F) -> IOResultStream<T>
    where
        T: Send + 'static,
        F: Fn(&String, &Entry) -> T + Send + Sync + 'static,
    {
        let glob = Glob::new(pattern);
        let prefix = glob.literal_prefix();
        let cursor = MatchCursor {
            data: self.data.clone(),
            from: Bound::Included(prefix.clone()),
            prefix,
            glob,
            done: false,
        };

        let project = Arc::new(project);

        futures::stream::unfold(
            (cursor, VecDeque::new()),
            move |(mut cursor, mut ready)| {
                let project = project.clone();
                async move {
                    loop {
                        if let Some(item) = ready.pop_front() {
                            return Some((Ok(item), (cursor, ready)));
                        }
                        if cursor.done {
                            return None;
                        }
                        cursor.next_batch(&*project, &mut ready);
                    }
                }
            },
        )
        .boxed()
    }
}

struct MatchCursor {
    data: Store,
    glob: Glob,
    prefix: String,
    from: Bound<String>,
    done: bool,
}

impl MatchCursor {
    fn next_batch<T, F>(&mut self, project: &F, out: &mut VecDeque<T>)
    where F: Fn(&String, &Entry) -> T {
        let now = Instant::now();
        let data = self.data.lock();

        let mut examined = 0;
        let mut last = None;

        for (k, e) in data.range::<String, _>((self.from.clone(), Bound::Unbounded)) {
            if !k.starts_with(&self.prefix) {
                self.done = true;
                break;
            }

            examined += 1;
            if !e.is_expired(now) && self.glob.matches(k) {
                out.push_back(project(k, e));
            }
            last = Some(k.clone());

            if examined >= SCAN_BATCH {
                break;
            }
        }

        match last {
            Some(k) if examined >= SCAN_BATCH && !self.done => {
                self.from = Bound::Excluded(k);
            }
            _ => {
                self.done = true;
            }
        }
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, io::Error> {
        let mut data = self.data.lock();
        let got = Self::live(&mut data, key, Instant::now()).map(|e| e.value.clone());
        Ok(got)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        exist: MatchExist,
    ) -> Result<bool, io::Error> {
        let now = Instant::now();
        let mut data = self.data.lock();

        let exists = Self::live(&mut data, key, now).is_some();
        if let Err(conflict) = exist.match_exist(exists) {
            debug!("MemoryBackend::set: key: {:?}: {}", key, conflict);
            return Ok(false);
        }

        data.insert(key.to_string(), Entry {
            value,
            expire_at: ttl.map(|t| now + t),
        });
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, io::Error> {
        let now = Instant::now();
        let mut data = self.data.lock();
        let removed = data.remove(key);
        Ok(removed.map(|e| !e.is_expired(now)).unwrap_or(false))
    }

    async fn delete_match(&self, pattern: &str) -> Result<u64, io::Error> {
        let now = Instant::now();
        let glob = Glob::new(pattern);
        let mut data = self.data.lock();

        let mut n = 0;
        data.retain(|k, e| {
            if !glob.matches(k) {
                return true;
            }
            if !e.is_expired(now) {
                n += 1;
            }
            false
        });

        debug!("MemoryBackend::delete_match: {:?} removed {}", pattern, n);
        Ok(n)
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, io::Error> {
        let now = Instant::now();
        let mut data = self.data.lock();

        let (current, expire_at) = match Self::live(&mut data, key, now) {
            Some(e) => (parse_int(key, &e.value)?, e.expire_at),
            None => (0, None),
        };

        let next = current.checked_add(by).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("incr of {:?} overflows", key),
            )
        })?;

        data.insert(key.to_string(), Entry {
            value: next.to_string().into_bytes(),
            expire_at,
        });
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, io::Error> {
        let now = Instant::now();
        let mut data = self.data.lock();
        match Self::live(&mut data, key, now) {
            Some(e) => {
                e.expire_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_expire(&self, key: &str) -> Result<Expiry, io::Error> {
        let now = Instant::now();
        let mut data = self.data.lock();
        let expiry = match Self::live(&mut data, key, now) {
            None => Expiry::NotFound,
            Some(Entry {
                expire_at: None, ..
            }) => Expiry::Persistent,
            Some(Entry {
                expire_at: Some(at),
                ..
            }) => Expiry::Remaining(at.saturating_duration_since(now)),
        };
        Ok(expiry)
    }

    async fn scan(&self, pattern: &str) -> Result<IOResultStream<String>, io::Error> {
        Ok(self.match_stream(pattern, |k, _e| k.clone()))
    }

    async fn get_match(
        &self,
        pattern: &str,
    ) -> Result<IOResultStream<(String, Vec<u8>)>, io::Error> {
        Ok(self.match_stream(pattern, |k, e| (k.clone(), e.value.clone())))
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, io::Error> {
        let now = Instant::now();
        let mut data = self.data.lock();

        let owned = Self::live(&mut data, key, now)
            .map(|e| e.value == token.as_bytes())
            .unwrap_or(false);

        if owned {
            data.remove(key);
        }
        Ok(owned)
    }

    async fn ping(&self) -> Result<Vec<u8>, io::Error> {
        Ok(b"PONG".to_vec())
    }

    async fn clear(&self) -> Result<(), io::Error> {
        self.data.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backend::collect_keys;
    use crate::backend::collect_sorted;

    fn b(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    #[tokio::test]
    async fn test_set_get() -> anyhow::Result<()> {
        let cache = MemoryBackend::new();
        cache.set("key", b("value"), None, MatchExist::Any).await?;
        assert_eq!(cache.get("key").await?, Some(b("value")));
        assert_eq!(cache.get("key2").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_get_many() -> anyhow::Result<()> {
        let cache = MemoryBackend::new();
        cache.set("key", b("value"), None, MatchExist::Any).await?;
        let got = cache
            .get_many(&["key".to_string(), "no_exists".to_string()])
            .await?;
        assert_eq!(got, vec![Some(b("value")), None]);
        Ok(())
    }

    #[tokio::test]
    async fn test_set_exist() -> anyhow::Result<()> {
        let cache = MemoryBackend::new();
        assert!(cache.set("key", b("value"), None, MatchExist::Any).await?);
        assert!(cache.set("key", b("value"), None, MatchExist::Exists).await?);
        assert!(!cache.set("key2", b("value"), None, MatchExist::Exists).await?);

        assert!(cache.set("key2", b("value"), None, MatchExist::Absent).await?);
        assert!(!cache.set("key2", b("value"), None, MatchExist::Absent).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_incr() -> anyhow::Result<()> {
        let cache = MemoryBackend::new();
        assert_eq!(cache.incr("incr", 1).await?, 1);
        assert_eq!(cache.incr("incr", 1).await?, 2);
        assert_eq!(cache.incr("incr", 5).await?, 7);
        assert_eq!(cache.get("incr").await?, Some(b("7")));

        cache.set("text", b("abc"), None, MatchExist::Any).await?;
        let err = cache.incr("text", 1).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        Ok(())
    }

    #[tokio::test]
    async fn test_incr_keeps_ttl() -> anyhow::Result<()> {
        let cache = MemoryBackend::new();
        cache
            .set("n", b("1"), Some(Duration::from_secs(100)), MatchExist::Any)
            .await?;
        cache.incr("n", 1).await?;
        assert!(matches!(cache.get_expire("n").await?, Expiry::Remaining(_)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire() -> anyhow::Result<()> {
        let cache = MemoryBackend::new();
        cache
            .set("key", b("value"), Some(Duration::from_millis(10)), MatchExist::Any)
            .await?;
        assert_eq!(cache.get("key").await?, Some(b("value")));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.get("key").await?, None);
        assert!(!cache.exists("key").await?);

        // An expired key can be created with put-if-absent.
        assert!(cache.set("key", b("v2"), None, MatchExist::Absent).await?);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_expire() -> anyhow::Result<()> {
        let cache = MemoryBackend::new();
        cache.set("persistent", b("v"), None, MatchExist::Any).await?;
        cache
            .set("ttl", b("v"), Some(Duration::from_secs(10)), MatchExist::Any)
            .await?;

        assert_eq!(cache.get_expire("persistent").await?, Expiry::Persistent);
        assert_eq!(
            cache.get_expire("ttl").await?,
            Expiry::Remaining(Duration::from_secs(10))
        );
        assert_eq!(cache.get_expire("absent").await?, Expiry::NotFound);

        assert!(cache.expire("persistent", Duration::from_secs(3)).await?);
        assert_eq!(cache.get_expire("persistent").await?.as_secs(), 3);
        assert!(!cache.expire("absent", Duration::from_secs(3)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_ping() -> anyhow::Result<()> {
        let cache = MemoryBackend::new();
        assert_eq!(cache.ping().await?, b("PONG"));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_match() -> anyhow::Result<()> {
        let cache = MemoryBackend::new();
        cache.set("pref:test:test", b("value"), None, MatchExist::Any).await?;
        cache.set("pref:value:test", b("value2"), None, MatchExist::Any).await?;
        cache.set("pref:-:test", b("-"), None, MatchExist::Any).await?;
        cache.set("pref:*:test", b("*"), None, MatchExist::Any).await?;

        cache.set("ppref:test:test", b("value3"), None, MatchExist::Any).await?;
        cache.set("pref:test:tests", b("value3"), None, MatchExist::Any).await?;

        assert_eq!(cache.delete_match("pref:*:test").await?, 4);

        assert_eq!(cache.get("pref:test:test").await?, None);
        assert_eq!(cache.get("pref:value:test").await?, None);
        assert_eq!(cache.get("pref:-:test").await?, None);
        assert_eq!(cache.get("pref:*:test").await?, None);

        assert!(cache.get("ppref:test:test").await?.is_some());
        assert!(cache.get("pref:test:tests").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_scan_and_get_match() -> anyhow::Result<()> {
        let cache = MemoryBackend::new();
        cache.set("key1", b("v1"), None, MatchExist::Any).await?;
        cache.set("key2", b("v2"), None, MatchExist::Any).await?;
        cache.set("other", b("o"), None, MatchExist::Any).await?;

        let keys = collect_keys(cache.scan("key*").await?).await?;
        assert_eq!(keys, vec!["key1".to_string(), "key2".to_string()]);

        let got = collect_sorted(cache.get_match("*").await?).await?;
        assert_eq!(got, vec![
            ("key1".to_string(), b("v1")),
            ("key2".to_string(), b("v2")),
            ("other".to_string(), b("o")),
        ]);
        Ok(())
    }

    #[tokio::test]
    async fn test_scan_spans_batches_and_reads_live_state() -> anyhow::Result<()> {
        let cache = MemoryBackend::new();
        for i in 0..(SCAN_BATCH * 2 + 10) {
            cache
                .set(&format!("k:{:05}", i), b("v"), None, MatchExist::Any)
                .await?;
        }

        let mut strm = cache.scan("k:*").await?;
        let first = strm.next().await.unwrap()?;
        assert_eq!(first, "k:00000");

        // Written after the stream started, but ahead of the cursor.
        cache.set("k:99999", b("v"), None, MatchExist::Any).await?;

        let mut n = 1;
        let mut last = first;
        while let Some(k) = strm.next().await {
            last = k?;
            n += 1;
        }
        assert_eq!(n, SCAN_BATCH * 2 + 11);
        assert_eq!(last, "k:99999");
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_unlock() -> anyhow::Result<()> {
        let cache = MemoryBackend::new();
        let ttl = Duration::from_secs(10);

        assert!(cache.set_lock("lock", "token-a", ttl).await?);
        assert!(!cache.set_lock("lock", "token-b", ttl).await?);
        assert!(cache.is_locked("lock", None, Duration::from_millis(1)).await?);

        // Not the owner: nothing happens.
        assert!(!cache.unlock("lock", "token-b").await?);
        assert!(cache.is_locked("lock", None, Duration::from_millis(1)).await?);

        assert!(cache.unlock("lock", "token-a").await?);
        assert!(!cache.is_locked("lock", None, Duration::from_millis(1)).await?);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_locked_wait() -> anyhow::Result<()> {
        let cache = MemoryBackend::new();
        cache
            .set_lock("lock", "t", Duration::from_millis(50))
            .await?;

        let step = Duration::from_millis(10);
        assert!(
            cache
                .is_locked("lock", Some(Duration::from_millis(20)), step)
                .await?
        );
        assert!(
            !cache
                .is_locked("lock", Some(Duration::from_millis(100)), step)
                .await?
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_size() -> anyhow::Result<()> {
        let cache = MemoryBackend::new();
        cache.set("target:test", b("1"), None, MatchExist::Any).await?;
        cache.set("no:test", b("12"), None, MatchExist::Any).await?;

        assert_eq!(cache.get_size("target:test").await?, 1);
        assert_eq!(cache.get_size("absent").await?, 0);
        assert_eq!(cache.get_size_match("target:*").await?, 1);
        assert_eq!(cache.get_size_match("*").await?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_clear() -> anyhow::Result<()> {
        let cache = MemoryBackend::new();
        cache.set("a", b("1"), None, MatchExist::Any).await?;
        let shared = cache.clone();
        shared.clear().await?;
        assert_eq!(cache.get("a").await?, None);
        Ok(())
    }
}
