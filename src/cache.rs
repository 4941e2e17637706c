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

use futures::future::BoxFuture;
use log::debug;
use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::backend::Backend;
use crate::backend::Expiry;
use crate::background::BackgroundTasks;
use crate::decorators::DecoratorBuilder;
use crate::errors::CacheError;
use crate::glob::Glob;
use crate::impls::memory::MemoryBackend;
use crate::key_template::KeyTemplate;
use crate::key_template::TemplateRegistry;
use crate::lock;
use crate::lock::LockGuard;
use crate::lock::LockOptions;
use crate::match_exist::MatchExist;
use crate::transaction::Transaction;
use crate::transaction::TransactionOptions;
use crate::IOResultStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Most background recomputations running at once.
    pub background_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            background_capacity: 64,
        }
    }
}

struct Inner {
    default: Arc<dyn Backend>,

    /// Backends for key prefixes, longest prefix first.
    routes: Vec<(String, Arc<dyn Backend>)>,

    templates: Arc<TemplateRegistry>,
    background: Arc<BackgroundTasks>,
    config: CacheConfig,
}

/// The entry point for application code.
///
/// A `Cache` routes every key to a backend by key prefix and is itself a
/// [`Backend`]. On top of that it opens transactions, takes locks and builds
/// decorated functions whose key templates it keeps track of.
///
/// Clones share the same backends, templates and background queue.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefixes: Vec<_> = self.inner.routes.iter().map(|(p, _)| p).collect();
        f.debug_struct("Cache")
            .field("routes", &prefixes)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Cache {
    pub fn new(default: Arc<dyn Backend>) -> Self {
        Self::with_config(default, CacheConfig::default())
    }

    pub fn with_config(default: Arc<dyn Backend>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                default,
                routes: vec![],
                templates: Arc::new(TemplateRegistry::new()),
                background: Arc::new(BackgroundTasks::new(config.background_capacity)),
                config,
            }),
        }
    }

    /// A cache over a fresh in-memory backend.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Route keys starting with `prefix` to `backend`.
    ///
    /// The longest matching prefix wins; keys matching no prefix go to the default
    /// backend.
    pub fn with_backend(self, prefix: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        let inner = &self.inner;

        let mut routes = inner.routes.clone();
        routes.push((prefix.into(), backend));
        routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Self {
            inner: Arc::new(Inner {
                default: inner.default.clone(),
                routes,
                templates: inner.templates.clone(),
                background: inner.background.clone(),
                config: inner.config,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn background(&self) -> &Arc<BackgroundTasks> {
        &self.inner.background
    }

    /// This cache as a shareable backend handle.
    pub fn as_backend(&self) -> Arc<dyn Backend> {
        Arc::new(self.clone())
    }

    /// The backend serving `key`.
    pub fn backend_for(&self, key: &str) -> &Arc<dyn Backend> {
        for (prefix, backend) in self.inner.routes.iter() {
            if key.starts_with(prefix.as_str()) {
                return backend;
            }
        }
        &self.inner.default
    }

    /// The backend serving `pattern`, chosen by the pattern's literal prefix.
    fn backend_for_pattern(&self, pattern: &str) -> &Arc<dyn Backend> {
        let prefix = Glob::new(pattern).literal_prefix();
        debug!("route pattern {:?} by prefix {:?}", pattern, prefix);
        self.backend_for(&prefix)
    }

    fn all_backends(&self) -> impl Iterator<Item = &Arc<dyn Backend>> {
        std::iter::once(&self.inner.default).chain(self.inner.routes.iter().map(|(_, b)| b))
    }

    pub(crate) fn register_template(&self, func: &str, template: KeyTemplate) {
        debug!("register template {:?} for {:?}", template.as_str(), func);
        self.inner.templates.register(func, template);
    }

    /// The function id and template that could have produced `key`.
    pub fn template_for_key(&self, key: &str) -> Option<(String, KeyTemplate)> {
        self.inner.templates.find(key)
    }

    /// Delete every key any template of `func` can render.
    pub async fn invalidate_func(&self, func: &str) -> Result<u64, CacheError> {
        let mut n = 0;
        for template in self.inner.templates.templates(func) {
            n += self.delete_match(template.pattern().as_str()).await?;
        }
        debug!("invalidated {} keys of {:?}", n, func);
        Ok(n)
    }

    /// Start building a decorated function `func` declaring the arguments `args`.
    pub fn decorate<T, E>(&self, func: &str, args: &[&str]) -> DecoratorBuilder<T, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        E: From<CacheError> + fmt::Display + Send + 'static,
    {
        DecoratorBuilder::new(self.clone(), func, args)
    }

    pub async fn lock(
        &self,
        key: impl Into<String>,
        options: &LockOptions,
    ) -> Result<LockGuard, CacheError> {
        lock::acquire(self.as_backend(), key, options).await
    }

    /// Open a transaction. The caller commits or rolls it back; dropping it discards it.
    pub async fn transaction(&self, options: TransactionOptions) -> Result<Transaction, CacheError> {
        Transaction::begin(self.as_backend(), options).await
    }

    /// Run `body` in a transaction: commit if it returns `Ok`, roll back otherwise.
    ///
    /// The body's error is returned unchanged after the rollback.
    pub async fn transaction_scope<T, E, F>(
        &self,
        options: TransactionOptions,
        body: F,
    ) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t Transaction) -> BoxFuture<'t, Result<T, E>>,
        E: From<CacheError>,
    {
        let tx = self.transaction(options).await?;

        match body(&tx).await {
            Ok(v) => {
                tx.commit().await?;
                Ok(v)
            }
            Err(e) => {
                if let Err(re) = tx.rollback().await {
                    warn!("rollback after failed transaction body: {}", re);
                }
                Err(e)
            }
        }
    }
}

#[async_trait::async_trait]
impl Backend for Cache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, io::Error> {
        self.backend_for(key).get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        exist: MatchExist,
    ) -> Result<bool, io::Error> {
        self.backend_for(key).set(key, value, ttl, exist).await
    }

    async fn delete(&self, key: &str) -> Result<bool, io::Error> {
        self.backend_for(key).delete(key).await
    }

    async fn delete_match(&self, pattern: &str) -> Result<u64, io::Error> {
        self.backend_for_pattern(pattern).delete_match(pattern).await
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, io::Error> {
        self.backend_for(key).incr(key, by).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, io::Error> {
        self.backend_for(key).expire(key, ttl).await
    }

    async fn get_expire(&self, key: &str) -> Result<Expiry, io::Error> {
        self.backend_for(key).get_expire(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, io::Error> {
        self.backend_for(key).exists(key).await
    }

    async fn scan(&self, pattern: &str) -> Result<IOResultStream<String>, io::Error> {
        self.backend_for_pattern(pattern).scan(pattern).await
    }

    async fn get_match(
        &self,
        pattern: &str,
    ) -> Result<IOResultStream<(String, Vec<u8>)>, io::Error> {
        self.backend_for_pattern(pattern).get_match(pattern).await
    }

    async fn set_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, io::Error> {
        self.backend_for(key).set_lock(key, token, ttl).await
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, io::Error> {
        self.backend_for(key).unlock(key, token).await
    }

    async fn is_locked(
        &self,
        key: &str,
        wait: Option<Duration>,
        step: Duration,
    ) -> Result<bool, io::Error> {
        self.backend_for(key).is_locked(key, wait, step).await
    }

    async fn ping(&self) -> Result<Vec<u8>, io::Error> {
        self.inner.default.ping().await
    }

    async fn clear(&self) -> Result<(), io::Error> {
        for backend in self.all_backends() {
            backend.clear().await?;
        }
        Ok(())
    }

    async fn get_size(&self, key: &str) -> Result<u64, io::Error> {
        self.backend_for(key).get_size(key).await
    }

    async fn get_size_match(&self, pattern: &str) -> Result<u64, io::Error> {
        self.backend_for_pattern(pattern).get_size_match(pattern).await
    }
}
