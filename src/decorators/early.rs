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
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use log::debug;
use log::info;
use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::backend::Backend;
use crate::background::BackgroundTasks;
use crate::codec;
use crate::decorators::always;
use crate::decorators::Compute;
use crate::decorators::Stage;
use crate::decorators::StoreCondition;
use crate::errors::CacheError;
use crate::key_template::CallArgs;
use crate::key_template::KeyTemplate;
use crate::match_exist::MatchExist;

/// Lower bound of the ttl of the "recompute started" marker.
const MIN_MARKER_TTL: Duration = Duration::from_millis(100);

/// Options of the early-refresh stage.
pub struct EarlyOptions<T> {
    /// How long a computed result is kept.
    pub ttl: Duration,

    /// How long after a store the result is served without a refresh.
    ///
    /// After that, until the hard expiry at `ttl`, a hit also starts a background
    /// recompute. `None` derives it from the observed compute latency:
    /// `ttl - 3 * latency`, leaving three computations' worth of time to refresh.
    pub early_ttl: Option<Duration>,

    /// Custom key template; defaults to `{prefix}:{func}:{arg}:{{arg}}...`.
    pub key: Option<String>,

    pub prefix: String,

    pub store: StoreCondition<T>,
}

impl<T> EarlyOptions<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            early_ttl: None,
            key: None,
            prefix: "early".to_string(),
            store: always(),
        }
    }

    pub fn with_early_ttl(mut self, early_ttl: Duration) -> Self {
        self.early_ttl = Some(early_ttl);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_store(mut self, store: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.store = Arc::new(store);
        self
    }
}

/// What is stored under an early-refresh key.
///
/// `early_at_ms` is wall-clock unix time, so that other processes sharing the
/// backend agree on when the soft window opens. `fresh_ms` is how long the
/// entry stayed fresh after it was stored.
#[derive(Debug, Serialize, Deserialize)]
struct EarlyEntry<T> {
    early_at_ms: u64,
    fresh_ms: u64,
    result: T,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Serves a cached result, and once its soft window opens, recomputes it in the
/// background so callers never block on an expired key.
pub struct EarlyStage<T> {
    background: Arc<BackgroundTasks>,
    template: KeyTemplate,
    ttl: Duration,
    early_ttl: Option<Duration>,
    store: StoreCondition<T>,
}

impl<T> EarlyStage<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(background: Arc<BackgroundTasks>, template: KeyTemplate, options: EarlyOptions<T>) -> Self {
        Self {
            background,
            template,
            ttl: options.ttl,
            early_ttl: options.early_ttl,
            store: options.store,
        }
    }

    /// How long a result that took `latency` to compute stays fresh.
    ///
    /// The soft window is the rest of the ttl.
    pub fn fresh_for(ttl: Duration, early_ttl: Option<Duration>, latency: Duration) -> Duration {
        match early_ttl {
            Some(w) => w.min(ttl),
            None => ttl.saturating_sub(latency.saturating_mul(3)),
        }
    }

    async fn lookup(backend: &dyn Backend, key: &str) -> Result<Option<EarlyEntry<T>>, CacheError> {
        let Some(bytes) = backend.get(key).await? else {
            return Ok(None);
        };

        match codec::decode::<EarlyEntry<T>>(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!("early: undecodable entry at {:?}, treat as miss: {}", key, e);
                Ok(None)
            }
        }
    }

    /// Run the body and store its result with a fresh soft window.
    async fn compute_and_store<E>(
        backend: Arc<dyn Backend>,
        key: String,
        ttl: Duration,
        early_ttl: Option<Duration>,
        store: StoreCondition<T>,
        next: Compute<T, E>,
    ) -> Result<T, E>
    where
        E: From<CacheError>,
    {
        let start = tokio::time::Instant::now();
        let result = next().await?;
        let latency = start.elapsed();

        if !store(&result) {
            return Ok(result);
        }

        let fresh = Self::fresh_for(ttl, early_ttl, latency);
        let entry = EarlyEntry {
            early_at_ms: now_ms() + fresh.as_millis() as u64,
            fresh_ms: fresh.as_millis() as u64,
            result: &result,
        };
        let bytes = codec::encode(&entry)?;

        backend
            .set(&key, bytes, Some(ttl), MatchExist::Any)
            .await
            .map_err(CacheError::from)?;

        debug!(
            "early: stored {:?} ttl={:?} fresh={:?} latency={:?}",
            key, ttl, fresh, latency
        );
        Ok(result)
    }

    /// Start a background recompute of `key` unless one is already running.
    ///
    /// The `:hit` marker lets a single caller among all processes sharing the
    /// backend win the right to recompute. It lives as long as the entry stayed
    /// fresh, unless the local queue refuses the task.
    async fn trigger<E>(
        &self,
        backend: Arc<dyn Backend>,
        key: &str,
        fresh: Duration,
        next: Compute<T, E>,
    ) -> Result<(), CacheError>
    where
        E: From<CacheError> + fmt::Display + Send + 'static,
    {
        if self.background.is_in_flight(key) {
            return Ok(());
        }

        let marker = format!("{}:hit", key);
        let marker_ttl = fresh.max(MIN_MARKER_TTL);
        let won = backend
            .set(&marker, b"1".to_vec(), Some(marker_ttl), MatchExist::Absent)
            .await?;
        if !won {
            return Ok(());
        }

        info!("early: recompute {:?} in background", key);

        let fut = {
            let backend = backend.clone();
            let key = key.to_string();
            let ttl = self.ttl;
            let early_ttl = self.early_ttl;
            let store = self.store.clone();
            async move {
                let res = Self::compute_and_store(backend, key.clone(), ttl, early_ttl, store, next).await;
                if let Err(e) = res {
                    warn!("early: background recompute of {:?} failed: {}", key, e);
                }
            }
        };

        if self.background.spawn(key, fut).is_none() {
            debug!("early: background queue refused {:?}, drop marker", key);
            backend.delete(&marker).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<T, E> Stage<T, E> for EarlyStage<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    E: From<CacheError> + fmt::Display + Send + 'static,
{
    fn name(&self) -> &'static str {
        "early"
    }

    fn template(&self) -> &KeyTemplate {
        &self.template
    }

    async fn call(
        &self,
        backend: Arc<dyn Backend>,
        args: &CallArgs,
        next: Compute<T, E>,
    ) -> Result<T, E> {
        let key = self.template.render(args);

        if let Some(entry) = Self::lookup(backend.as_ref(), &key).await? {
            if now_ms() >= entry.early_at_ms {
                let fresh = Duration::from_millis(entry.fresh_ms);
                self.trigger(backend, &key, fresh, next).await?;
            }
            return Ok(entry.result);
        }

        Self::compute_and_store(
            backend,
            key,
            self.ttl,
            self.early_ttl,
            self.store.clone(),
            next,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use futures::future::join_all;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cache::Cache;
    use crate::cache::CacheConfig;
    use crate::decorators::Decorated;
    use crate::impls::memory::MemoryBackend;

    #[test]
    fn test_fresh_for() {
        let s = Duration::from_secs;
        assert_eq!(EarlyStage::<u64>::fresh_for(s(10), None, s(1)), s(7));
        assert_eq!(EarlyStage::<u64>::fresh_for(s(10), None, s(4)), s(0));
        assert_eq!(EarlyStage::<u64>::fresh_for(s(10), Some(s(5)), s(4)), s(5));
        assert_eq!(EarlyStage::<u64>::fresh_for(s(10), Some(s(50)), s(0)), s(10));
        assert_eq!(EarlyStage::<u64>::fresh_for(s(10), Some(s(0)), s(0)), s(0));
    }

    type Body = futures::future::BoxFuture<'static, Result<u64, CacheError>>;

    fn counting(calls: &Arc<AtomicU64>) -> impl Fn() -> Body + Send + Sync + 'static {
        let calls = calls.clone();
        move || -> Body {
            let calls = calls.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
            })
        }
    }

    fn decorated(
        cache: &Cache,
        options: EarlyOptions<u64>,
    ) -> anyhow::Result<Decorated<u64, CacheError>> {
        let builder = cache.decorate::<u64, CacheError>("load", &["id"]);
        Ok(builder.early(options)?.build())
    }

    #[tokio::test]
    async fn test_hit_within_ttl() -> anyhow::Result<()> {
        let cache = Cache::memory();
        let calls = Arc::new(AtomicU64::new(0));
        let opts = EarlyOptions::new(Duration::from_secs(60)).with_early_ttl(Duration::from_secs(1));
        let f = decorated(&cache, opts)?;

        let args = || CallArgs::new().arg("id", 1);
        assert_eq!(f.call(args(), counting(&calls)).await?, 1);
        assert_eq!(f.call(args(), counting(&calls)).await?, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Another argument is another key.
        assert_eq!(f.call(CallArgs::new().arg("id", 2), counting(&calls)).await?, 2);
        assert!(cache.exists("early:load:id:1").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_single_background_recompute() -> anyhow::Result<()> {
        let cache = Cache::memory();
        let calls = Arc::new(AtomicU64::new(0));

        // Never fresh: the soft window opens right after the first store.
        let opts = EarlyOptions::new(Duration::from_secs(60)).with_early_ttl(Duration::ZERO);
        let f = Arc::new(decorated(&cache, opts)?);

        let args = || CallArgs::new().arg("id", 1);
        assert_eq!(f.call(args(), counting(&calls)).await?, 1);

        let results = join_all((0..10).map(|_| {
            let f = f.clone();
            let calls = calls.clone();
            async move { f.call(args(), counting(&calls)).await }
        }))
        .await;

        for r in results {
            assert_eq!(r?, 1, "stale value is served while recomputing");
        }

        cache.background().wait_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.call(args(), counting(&calls)).await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_fresh_entry_not_recomputed() -> anyhow::Result<()> {
        let cache = Cache::memory();
        let calls = Arc::new(AtomicU64::new(0));
        let f = decorated(&cache, EarlyOptions::new(Duration::from_secs(60)))?;

        let instant = {
            let calls = calls.clone();
            move || {
                let calls = calls.clone();
                async move { Ok::<_, CacheError>(calls.fetch_add(1, Ordering::SeqCst) + 1) }
            }
        };

        let args = || CallArgs::new().arg("id", 1);
        assert_eq!(f.call(args(), instant.clone()).await?, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.call(args(), instant.clone()).await?, 1);

        cache.background().wait_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.exists("early:load:id:1:hit").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_refused_recompute_drops_marker() -> anyhow::Result<()> {
        let cache = Cache::with_config(Arc::new(MemoryBackend::new()), CacheConfig {
            background_capacity: 1,
        });
        let calls = Arc::new(AtomicU64::new(0));
        let opts = EarlyOptions::new(Duration::from_secs(60)).with_early_ttl(Duration::ZERO);
        let f = decorated(&cache, opts)?;

        let args = || CallArgs::new().arg("id", 1);
        assert_eq!(f.call(args(), counting(&calls)).await?, 1);

        // Occupy the only background slot.
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let busy = cache.background().spawn("busy", async move {
            let _ = rx.await;
        });
        assert!(busy.is_some());

        assert_eq!(f.call(args(), counting(&calls)).await?, 1);
        assert!(!cache.exists("early:load:id:1:hit").await?);

        // Once the queue has room the next hit recomputes.
        let _ = tx.send(());
        cache.background().wait_idle().await;
        assert_eq!(f.call(args(), counting(&calls)).await?, 1);
        cache.background().wait_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_store_condition() -> anyhow::Result<()> {
        let cache = Cache::memory();
        let calls = Arc::new(AtomicU64::new(0));
        let opts = EarlyOptions::new(Duration::from_secs(60))
            .with_early_ttl(Duration::from_secs(1))
            .with_store(|v: &u64| *v > 1);
        let f = decorated(&cache, opts)?;

        let args = || CallArgs::new().arg("id", 1);
        assert_eq!(f.call(args(), counting(&calls)).await?, 1);
        assert_eq!(f.call(args(), counting(&calls)).await?, 2);
        assert_eq!(f.call(args(), counting(&calls)).await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_undecodable_is_miss() -> anyhow::Result<()> {
        let cache = Cache::memory();
        let calls = Arc::new(AtomicU64::new(0));
        let f = decorated(&cache, EarlyOptions::new(Duration::from_secs(60)))?;

        cache
            .set("early:load:id:1", b"garbage".to_vec(), None, MatchExist::Any)
            .await?;

        assert_eq!(f.call(CallArgs::new().arg("id", 1), counting(&calls)).await?, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_custom_key_and_invalid_key() -> anyhow::Result<()> {
        let cache = Cache::memory();
        let calls = Arc::new(AtomicU64::new(0));

        let opts = EarlyOptions::new(Duration::from_secs(60)).with_key("user:{id}");
        let f = decorated(&cache, opts)?;
        f.call(CallArgs::new().arg("id", 7), counting(&calls)).await?;
        assert!(cache.exists("user:7").await?);

        let bad = EarlyOptions::<u64>::new(Duration::from_secs(60)).with_key("user:{nope}");
        let res = cache.decorate::<u64, CacheError>("load", &["id"]).early(bad);
        assert!(matches!(res, Err(CacheError::KeyTemplate { .. })));
        Ok(())
    }
}
