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

use log::info;
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
use crate::match_exist::MatchExist;

/// Decides which errors of the body are answered from the cache.
pub type FallbackOn<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Options of the failover stage.
pub struct FailoverOptions<T, E> {
    /// How long the last good result is kept for failover.
    pub ttl: Duration,

    pub key: Option<String>,

    pub prefix: String,

    /// Errors that fall back to the cached result. Defaults to every error.
    pub fallback_on: FallbackOn<E>,

    pub store: StoreCondition<T>,
}

impl<T, E> FailoverOptions<T, E> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            key: None,
            prefix: "fail".to_string(),
            fallback_on: Arc::new(|_| true),
            store: always(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_fallback_on(mut self, f: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.fallback_on = Arc::new(f);
        self
    }

    pub fn with_store(mut self, store: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.store = Arc::new(store);
        self
    }
}

/// Always calls the body; remembers its last good result and serves it when the
/// body fails with a matching error.
pub struct FailoverStage<T, E> {
    template: KeyTemplate,
    ttl: Duration,
    fallback_on: FallbackOn<E>,
    store: StoreCondition<T>,
}

impl<T, E> FailoverStage<T, E>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    E: From<CacheError> + fmt::Display + Send + 'static,
{
    pub fn new(template: KeyTemplate, options: FailoverOptions<T, E>) -> Self {
        Self {
            template,
            ttl: options.ttl,
            fallback_on: options.fallback_on,
            store: options.store,
        }
    }

    async fn save(&self, backend: &dyn Backend, key: &str, value: &T) -> Result<(), CacheError> {
        if !(self.store)(value) {
            return Ok(());
        }

        let bytes = codec::encode(value)?;
        backend.set(key, bytes, Some(self.ttl), MatchExist::Any).await?;
        Ok(())
    }

    /// The remembered result, if any. Any failure to read it counts as absent.
    async fn remembered(&self, backend: &dyn Backend, key: &str) -> Option<T> {
        let bytes = match backend.get(key).await {
            Ok(bytes) => bytes?,
            Err(e) => {
                warn!("failover: read {:?} failed: {}", key, e);
                return None;
            }
        };

        match codec::decode(&bytes) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("failover: undecodable entry at {:?}: {}", key, e);
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl<T, E> Stage<T, E> for FailoverStage<T, E>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    E: From<CacheError> + fmt::Display + Send + 'static,
{
    fn name(&self) -> &'static str {
        "failover"
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

        let err = match next().await {
            Ok(v) => {
                self.save(backend.as_ref(), &key, &v).await?;
                return Ok(v);
            }
            Err(err) => err,
        };

        if !(self.fallback_on)(&err) {
            return Err(err);
        }

        match self.remembered(backend.as_ref(), &key).await {
            Some(v) => {
                info!("failover: serve {:?} from cache after: {}", key, err);
                Ok(v)
            }
            None => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cache::Cache;
    use crate::decorators::Decorated;

    #[derive(Debug, thiserror::Error)]
    enum AppError {
        #[error("upstream unavailable")]
        Upstream,

        #[error("bad request")]
        BadRequest,

        #[error(transparent)]
        Cache(#[from] CacheError),
    }

    struct Upstream {
        fail: AtomicBool,
        bad: AtomicBool,
    }

    impl Upstream {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(false),
                bad: AtomicBool::new(false),
            })
        }

        async fn fetch(&self, v: u64) -> Result<u64, AppError> {
            if self.bad.load(Ordering::SeqCst) {
                return Err(AppError::BadRequest);
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::Upstream);
            }
            Ok(v)
        }
    }

    async fn call(f: &Decorated<u64, AppError>, up: &Arc<Upstream>, v: u64) -> Result<u64, AppError> {
        let up = up.clone();
        f.call(CallArgs::new().arg("id", 1), move || {
            let up = up.clone();
            async move { up.fetch(v).await }
        })
        .await
    }

    fn decorated(cache: &Cache) -> anyhow::Result<Decorated<u64, AppError>> {
        let opts = FailoverOptions::new(Duration::from_secs(60))
            .with_fallback_on(|e: &AppError| matches!(e, AppError::Upstream));
        let builder = cache.decorate::<u64, AppError>("fetch", &["id"]);
        Ok(builder.failover(opts)?.build())
    }

    #[tokio::test]
    async fn test_serve_last_good_result() -> anyhow::Result<()> {
        let cache = Cache::memory();
        let up = Upstream::new();
        let f = decorated(&cache)?;

        assert_eq!(call(&f, &up, 1).await?, 1);
        assert_eq!(call(&f, &up, 2).await?, 2, "the body always runs on success");

        up.fail.store(true, Ordering::SeqCst);
        assert_eq!(call(&f, &up, 3).await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_unmatched_error_propagates() -> anyhow::Result<()> {
        let cache = Cache::memory();
        let up = Upstream::new();
        let f = decorated(&cache)?;

        call(&f, &up, 1).await?;

        up.bad.store(true, Ordering::SeqCst);
        let res = call(&f, &up, 2).await;
        assert!(matches!(res, Err(AppError::BadRequest)));
        Ok(())
    }

    #[tokio::test]
    async fn test_nothing_remembered() -> anyhow::Result<()> {
        let cache = Cache::memory();
        let up = Upstream::new();
        let f = decorated(&cache)?;

        up.fail.store(true, Ordering::SeqCst);
        let res = call(&f, &up, 1).await;
        assert!(matches!(res, Err(AppError::Upstream)));
        Ok(())
    }

    #[tokio::test]
    async fn test_broken_cache_keeps_original_error() -> anyhow::Result<()> {
        use crate::impls::safe::tests::BrokenBackend;

        let cache = Cache::new(Arc::new(BrokenBackend));
        let up = Upstream::new();
        let f = decorated(&cache)?;

        up.fail.store(true, Ordering::SeqCst);
        let res = call(&f, &up, 1).await;
        assert!(matches!(res, Err(AppError::Upstream)));
        Ok(())
    }
}
