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

use log::debug;
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::Backend;
use crate::codec;
use crate::decorators::always;
use crate::decorators::Compute;
use crate::decorators::Stage;
use crate::decorators::StoreCondition;
use crate::errors::CacheError;
use crate::key_template::CallArgs;
use crate::key_template::KeyTemplate;
use crate::lock;
use crate::lock::LockOptions;
use crate::match_exist::MatchExist;

/// Options of the locked stage.
pub struct LockedOptions<T> {
    /// Memoize results for this long. `None` only serializes the calls.
    pub ttl: Option<Duration>,

    /// Lease of the per-key lock, and the longest a caller waits for it.
    pub lock_ttl: Duration,

    /// Wait for a held lock; otherwise fail fast with [`CacheError::Locked`].
    pub wait: bool,

    /// Polling interval while waiting.
    pub step: Duration,

    pub key: Option<String>,

    pub prefix: String,

    pub store: StoreCondition<T>,
}

impl<T> LockedOptions<T> {
    /// Locked memoization: concurrent misses of one key run the body once.
    pub fn memoize(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::mutex()
        }
    }

    /// Mutual exclusion only: calls with the same key run one at a time.
    pub fn mutex() -> Self {
        Self {
            ttl: None,
            lock_ttl: Duration::from_secs(10),
            wait: true,
            step: Duration::from_millis(10),
            key: None,
            prefix: "lock".to_string(),
            store: always(),
        }
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
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

/// Lets one caller per key run the body while the others wait for its result.
pub struct LockedStage<T> {
    template: KeyTemplate,
    ttl: Option<Duration>,
    lock: LockOptions,
    store: StoreCondition<T>,
}

impl<T> LockedStage<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(template: KeyTemplate, options: LockedOptions<T>) -> Self {
        let mut lock = LockOptions::new(options.lock_ttl).with_step(options.step);
        if options.wait {
            lock = lock.with_wait(options.lock_ttl);
        }

        Self {
            template,
            ttl: options.ttl,
            lock,
            store: options.store,
        }
    }

    async fn lookup(&self, backend: &dyn Backend, key: &str) -> Result<Option<T>, CacheError> {
        if self.ttl.is_none() {
            return Ok(None);
        }

        let Some(bytes) = backend.get(key).await? else {
            return Ok(None);
        };

        match codec::decode(&bytes) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                warn!("locked: undecodable entry at {:?}, treat as miss: {}", key, e);
                Ok(None)
            }
        }
    }

    async fn save(&self, backend: &dyn Backend, key: &str, value: &T) -> Result<(), CacheError> {
        let Some(ttl) = self.ttl else {
            return Ok(());
        };
        if !(self.store)(value) {
            return Ok(());
        }

        let bytes = codec::encode(value)?;
        backend.set(key, bytes, Some(ttl), MatchExist::Any).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<T, E> Stage<T, E> for LockedStage<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    E: From<CacheError> + fmt::Display + Send + 'static,
{
    fn name(&self) -> &'static str {
        "locked"
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

        if let Some(v) = self.lookup(backend.as_ref(), &key).await? {
            return Ok(v);
        }

        let lock_key = format!("{}:lock", key);
        let guard = match lock::acquire(backend.clone(), lock_key, &self.lock).await {
            Ok(guard) => guard,
            Err(CacheError::LockTimeout { key: lock_key, waited }) => {
                warn!(
                    "locked: gave up on {:?} after {:?}, computing unprotected",
                    lock_key, waited
                );

                if let Some(v) = self.lookup(backend.as_ref(), &key).await? {
                    return Ok(v);
                }
                let v = next().await?;
                self.save(backend.as_ref(), &key, &v).await?;
                return Ok(v);
            }
            Err(e) => return Err(e.into()),
        };

        // Whoever held the lock before may have stored the result.
        if let Some(v) = self.lookup(backend.as_ref(), &key).await? {
            debug!("locked: {:?} filled while waiting", key);
            if let Err(e) = guard.release().await {
                warn!("locked: release {:?} failed: {}", key, e);
            }
            return Ok(v);
        }

        let res = next().await;
        let saved = match &res {
            Ok(v) => self.save(backend.as_ref(), &key, v).await,
            Err(_) => Ok(()),
        };

        if let Err(e) = guard.release().await {
            warn!("locked: release {:?} failed: {}", key, e);
        }

        saved?;
        res
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use futures::future::join_all;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cache::Cache;
    use crate::decorators::Decorated;

    #[derive(Default)]
    struct Worker {
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl Worker {
        async fn run(&self) -> Result<usize, CacheError> {
            let n = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(n, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(self.calls.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    fn decorated(
        cache: &Cache,
        options: LockedOptions<usize>,
    ) -> anyhow::Result<Arc<Decorated<usize, CacheError>>> {
        let builder = cache.decorate::<usize, CacheError>("load", &["id"]);
        Ok(Arc::new(builder.locked(options)?.build()))
    }

    async fn call_many(
        f: &Arc<Decorated<usize, CacheError>>,
        worker: &Arc<Worker>,
        n: usize,
    ) -> Vec<Result<usize, CacheError>> {
        join_all((0..n).map(|_| {
            let worker = worker.clone();
            f.call(CallArgs::new().arg("id", 1), move || {
                let worker = worker.clone();
                async move { worker.run().await }
            })
        }))
        .await
    }

    #[tokio::test]
    async fn test_memoize_concurrent_misses() -> anyhow::Result<()> {
        let cache = Cache::memory();
        let worker = Arc::new(Worker::default());
        let opts = LockedOptions::memoize(Duration::from_secs(60)).with_step(Duration::from_millis(5));
        let f = decorated(&cache, opts)?;

        for r in call_many(&f, &worker, 10).await {
            assert_eq!(r?, 1);
        }
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);

        // The result is memoized and the lock is gone.
        for r in call_many(&f, &worker, 10).await {
            assert_eq!(r?, 1);
        }
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
        assert!(!cache.exists("lock:load:id:1:lock").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_mutex_serializes() -> anyhow::Result<()> {
        let cache = Cache::memory();
        let worker = Arc::new(Worker::default());
        let f = decorated(&cache, LockedOptions::mutex().with_step(Duration::from_millis(5)))?;

        let mut got = vec![];
        for r in call_many(&f, &worker, 5).await {
            got.push(r?);
        }
        got.sort();

        assert_eq!(got, vec![1, 2, 3, 4, 5]);
        assert_eq!(worker.max_active.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_fail_fast() -> anyhow::Result<()> {
        let cache = Cache::memory();
        let worker = Arc::new(Worker::default());
        let f = decorated(&cache, LockedOptions::mutex().with_wait(false))?;

        let held = lock::acquire(cache.as_backend(), "lock:load:id:1:lock", &LockOptions::default()).await?;

        let res = call_many(&f, &worker, 1).await.remove(0);
        assert!(matches!(res, Err(CacheError::Locked { .. })));
        assert_eq!(worker.calls.load(Ordering::SeqCst), 0);

        held.release().await?;
        assert_eq!(call_many(&f, &worker, 1).await.remove(0)?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_timeout_computes_unprotected() -> anyhow::Result<()> {
        let cache = Cache::memory();
        let worker = Arc::new(Worker::default());
        let opts = LockedOptions::memoize(Duration::from_secs(60))
            .with_lock_ttl(Duration::from_millis(30))
            .with_step(Duration::from_millis(5));
        let f = decorated(&cache, opts)?;

        let _held = lock::acquire(
            cache.as_backend(),
            "lock:load:id:1:lock",
            &LockOptions::new(Duration::from_secs(10)),
        )
        .await?;

        assert_eq!(call_many(&f, &worker, 1).await.remove(0)?, 1);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
