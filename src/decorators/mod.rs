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

//! Cross-cutting wrappers around a cacheable async function.
//!
//! A [`Decorated`] function is an ordered pipeline of [`Stage`]s around the
//! function body. The first stage is the outermost one: it sees the call first and
//! its `next` runs the remaining stages and finally the body.
//!
//! Each stage renders its own cache key from its [`KeyTemplate`] and the call's
//! [`CallArgs`], and talks to the backend through the same primitives
//! (get/set/lock) as any other cache user. The backend is handed to the stages
//! per call, so [`Decorated::call_in`] can run a function inside a
//! [`Transaction`](crate::transaction::Transaction).

pub mod early;
pub mod failover;
pub mod locked;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use self::early::EarlyOptions;
pub use self::early::EarlyStage;
pub use self::failover::FailoverOptions;
pub use self::failover::FailoverStage;
pub use self::locked::LockedOptions;
pub use self::locked::LockedStage;
use crate::backend::Backend;
use crate::cache::Cache;
use crate::errors::CacheError;
use crate::key_template::CallArgs;
use crate::key_template::KeyTemplate;

/// The rest of the pipeline, callable any number of times.
pub type Compute<T, E> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// Decides whether a successful result is written to the cache.
pub type StoreCondition<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

pub(crate) fn always<T>() -> StoreCondition<T> {
    Arc::new(|_| true)
}

/// One middleware stage of a [`Decorated`] function.
#[async_trait::async_trait]
pub trait Stage<T, E>: Send + Sync
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn name(&self) -> &'static str;

    /// The template this stage renders its cache key from.
    fn template(&self) -> &KeyTemplate;

    /// Handle one call against `backend`; `next` runs the inner stages and the
    /// function body.
    async fn call(
        &self,
        backend: Arc<dyn Backend>,
        args: &CallArgs,
        next: Compute<T, E>,
    ) -> Result<T, E>;
}

/// A function id together with the stages wrapped around it.
pub struct Decorated<T, E> {
    func: String,
    stages: Vec<Arc<dyn Stage<T, E>>>,

    /// Where [`Decorated::call`] reads and writes.
    backend: Arc<dyn Backend>,
}

impl<T, E> fmt::Debug for Decorated<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<_> = self.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("Decorated")
            .field("func", &self.func)
            .field("stages", &stages)
            .finish()
    }
}

impl<T, E> Decorated<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new(func: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            func: func.into(),
            stages: vec![],
            backend,
        }
    }

    /// Append a stage inside the ones already added.
    pub fn with_stage(mut self, stage: Arc<dyn Stage<T, E>>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn func(&self) -> &str {
        &self.func
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run the function body `f` through the pipeline.
    ///
    /// `f` may be called zero, one or more times, e.g. again later by a background
    /// recompute, so it produces a fresh future on every call.
    pub async fn call<F, Fut>(&self, args: CallArgs, f: F) -> Result<T, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.call_in(self.backend.clone(), args, f).await
    }

    /// Like [`Decorated::call`], but every stage reads and writes `backend`.
    ///
    /// Passing a transaction buffers the stages' writes in it: they become visible
    /// on commit and are discarded on rollback. A background recompute started by
    /// the call writes to the same transaction and fails once it is closed.
    pub async fn call_in<F, Fut>(
        &self,
        backend: Arc<dyn Backend>,
        args: CallArgs,
        f: F,
    ) -> Result<T, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut next: Compute<T, E> = Arc::new(move || f().boxed());
        let args = Arc::new(args);

        for stage in self.stages.iter().rev() {
            let stage = stage.clone();
            let inner = next;
            let args = args.clone();
            let backend = backend.clone();

            next = Arc::new(move || {
                let stage = stage.clone();
                let inner = inner.clone();
                let args = args.clone();
                let backend = backend.clone();
                async move { stage.call(backend, &args, inner).await }.boxed()
            });
        }

        next().await
    }
}

/// Builds a [`Decorated`] function whose templates are registered in a [`Cache`].
///
/// Stages are added outermost first, in the order a reader sees stacked wrappers.
pub struct DecoratorBuilder<T, E> {
    cache: Cache,
    func: String,
    args: Vec<String>,
    decorated: Decorated<T, E>,
}

impl<T, E> DecoratorBuilder<T, E>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    E: From<CacheError> + fmt::Display + Send + 'static,
{
    pub(crate) fn new(cache: Cache, func: &str, args: &[&str]) -> Self {
        Self {
            decorated: Decorated::new(func, cache.as_backend()),
            cache,
            func: func.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Validate a custom key, or derive the default one, and register it.
    fn template(&self, prefix: &str, key: Option<&str>) -> Result<KeyTemplate, CacheError> {
        let args: Vec<&str> = self.args.iter().map(|s| s.as_str()).collect();
        let template = match key {
            Some(k) => KeyTemplate::parse(k, &args)?,
            None => KeyTemplate::default_for(prefix, &self.func, &args),
        };
        self.cache.register_template(&self.func, template.clone());
        Ok(template)
    }

    pub fn early(mut self, options: EarlyOptions<T>) -> Result<Self, CacheError> {
        let template = self.template(&options.prefix, options.key.as_deref())?;
        let stage = EarlyStage::new(self.cache.background().clone(), template, options);
        self.decorated = self.decorated.with_stage(Arc::new(stage));
        Ok(self)
    }

    pub fn locked(mut self, options: LockedOptions<T>) -> Result<Self, CacheError> {
        let template = self.template(&options.prefix, options.key.as_deref())?;
        let stage = LockedStage::new(template, options);
        self.decorated = self.decorated.with_stage(Arc::new(stage));
        Ok(self)
    }

    pub fn failover(mut self, options: FailoverOptions<T, E>) -> Result<Self, CacheError> {
        let template = self.template(&options.prefix, options.key.as_deref())?;
        let stage = FailoverStage::new(template, options);
        self.decorated = self.decorated.with_stage(Arc::new(stage));
        Ok(self)
    }

    /// Add a custom stage; its template is registered for the function too.
    pub fn stage(mut self, stage: Arc<dyn Stage<T, E>>) -> Self {
        self.cache
            .register_template(&self.func, stage.template().clone());
        self.decorated = self.decorated.with_stage(stage);
        self
    }

    pub fn build(self) -> Decorated<T, E> {
        self.decorated
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::impls::memory::MemoryBackend;
    use crate::match_exist::MatchExist;

    /// Records the order in which stages see a call.
    struct Trace {
        name: &'static str,
        template: KeyTemplate,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Stage<u64, CacheError> for Trace {
        fn name(&self) -> &'static str {
            self.name
        }

        fn template(&self) -> &KeyTemplate {
            &self.template
        }

        async fn call(
            &self,
            backend: Arc<dyn Backend>,
            args: &CallArgs,
            next: Compute<u64, CacheError>,
        ) -> Result<u64, CacheError> {
            let key = self.template.render(args);
            backend.set(&key, b"seen".to_vec(), None, MatchExist::Any).await?;

            self.log.lock().push(format!("before {} {}", self.name, key));
            let res = next().await;
            self.log.lock().push(format!("after {}", self.name));
            res.map(|v| v + 1)
        }
    }

    #[tokio::test]
    async fn test_pipeline_order() -> anyhow::Result<()> {
        let log = Arc::new(Mutex::new(vec![]));
        let stage = |name| {
            Arc::new(Trace {
                name,
                template: KeyTemplate::default_for(name, "f", &["a"]),
                log: log.clone(),
            })
        };

        let backend = Arc::new(MemoryBackend::new());
        let decorated = Decorated::<u64, CacheError>::new("f", backend.clone())
            .with_stage(stage("outer"))
            .with_stage(stage("inner"));
        assert_eq!(decorated.stage_names(), vec!["outer", "inner"]);
        assert_eq!(
            format!("{:?}", decorated),
            r#"Decorated { func: "f", stages: ["outer", "inner"] }"#
        );

        let body_log = log.clone();
        let got = decorated
            .call(CallArgs::new().arg("a", 1), move || {
                let body_log = body_log.clone();
                async move {
                    body_log.lock().push("body".to_string());
                    Ok(10)
                }
            })
            .await?;

        assert_eq!(got, 12);
        assert_eq!(*log.lock(), vec![
            "before outer outer:f:a:1".to_string(),
            "before inner inner:f:a:1".to_string(),
            "body".to_string(),
            "after inner".to_string(),
            "after outer".to_string(),
        ]);
        assert!(backend.exists("outer:f:a:1").await?);
        assert!(backend.exists("inner:f:a:1").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_no_stage_runs_body() -> anyhow::Result<()> {
        let decorated = Decorated::<u64, CacheError>::new("f", Arc::new(MemoryBackend::new()));
        let got = decorated.call(CallArgs::new(), || async { Ok(3) }).await?;
        assert_eq!(got, 3);
        Ok(())
    }
}
