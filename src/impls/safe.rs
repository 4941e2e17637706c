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

//! The "safe" failure policy, as a wrapper around any backend.
//!
//! A [`SafeBackend`] swallows every backend failure: the failure is logged and the
//! operation degrades to an absent/false/no-op result. Callers that need strict
//! failure must check return values instead of relying on errors.

use std::io;
use std::time::Duration;

use log::warn;

use crate::backend::iter_stream;
use crate::backend::Backend;
use crate::backend::Expiry;
use crate::match_exist::MatchExist;
use crate::IOResultStream;

/// Wraps a backend and turns its failures into degraded results.
#[derive(Debug, Clone, Default)]
pub struct SafeBackend<B> {
    inner: B,
}

impl<B> SafeBackend<B>
where B: Backend
{
    pub fn new(inner: B) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn degrade<T>(op: &str, key: &str, res: Result<T, io::Error>, fallback: T) -> T {
        match res {
            Ok(v) => v,
            Err(e) => {
                warn!("SafeBackend: {} {:?} failed, degraded: {}", op, key, e);
                fallback
            }
        }
    }
}

#[async_trait::async_trait]
impl<B> Backend for SafeBackend<B>
where B: Backend
{
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, io::Error> {
        Ok(Self::degrade("get", key, self.inner.get(key).await, None))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, io::Error> {
        let res = self.inner.get_many(keys).await;
        Ok(Self::degrade("get_many", "", res, vec![None; keys.len()]))
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        exist: MatchExist,
    ) -> Result<bool, io::Error> {
        let res = self.inner.set(key, value, ttl, exist).await;
        Ok(Self::degrade("set", key, res, false))
    }

    async fn set_many(
        &self,
        pairs: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> Result<(), io::Error> {
        let res = self.inner.set_many(pairs, ttl).await;
        Ok(Self::degrade("set_many", "", res, ()))
    }

    async fn delete(&self, key: &str) -> Result<bool, io::Error> {
        Ok(Self::degrade("delete", key, self.inner.delete(key).await, false))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, io::Error> {
        let res = self.inner.delete_many(keys).await;
        Ok(Self::degrade("delete_many", "", res, 0))
    }

    async fn delete_match(&self, pattern: &str) -> Result<u64, io::Error> {
        let res = self.inner.delete_match(pattern).await;
        Ok(Self::degrade("delete_match", pattern, res, 0))
    }

    /// A failed increment reports `0`: no counter value is known.
    async fn incr(&self, key: &str, by: i64) -> Result<i64, io::Error> {
        Ok(Self::degrade("incr", key, self.inner.incr(key, by).await, 0))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, io::Error> {
        let res = self.inner.expire(key, ttl).await;
        Ok(Self::degrade("expire", key, res, false))
    }

    async fn get_expire(&self, key: &str) -> Result<Expiry, io::Error> {
        let res = self.inner.get_expire(key).await;
        Ok(Self::degrade("get_expire", key, res, Expiry::NotFound))
    }

    async fn exists(&self, key: &str) -> Result<bool, io::Error> {
        Ok(Self::degrade("exists", key, self.inner.exists(key).await, false))
    }

    /// Failures while opening the stream yield an empty stream; failures of
    /// single items end the stream early.
    async fn scan(&self, pattern: &str) -> Result<IOResultStream<String>, io::Error> {
        match self.inner.scan(pattern).await {
            Ok(strm) => Ok(safe_stream(strm)),
            Err(e) => {
                warn!("SafeBackend: scan {:?} failed, degraded: {}", pattern, e);
                Ok(iter_stream(vec![]))
            }
        }
    }

    async fn get_match(
        &self,
        pattern: &str,
    ) -> Result<IOResultStream<(String, Vec<u8>)>, io::Error> {
        match self.inner.get_match(pattern).await {
            Ok(strm) => Ok(safe_stream(strm)),
            Err(e) => {
                warn!("SafeBackend: get_match {:?} failed, degraded: {}", pattern, e);
                Ok(iter_stream(vec![]))
            }
        }
    }

    async fn set_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, io::Error> {
        let res = self.inner.set_lock(key, token, ttl).await;
        Ok(Self::degrade("set_lock", key, res, false))
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, io::Error> {
        let res = self.inner.unlock(key, token).await;
        Ok(Self::degrade("unlock", key, res, false))
    }

    async fn is_locked(
        &self,
        key: &str,
        wait: Option<Duration>,
        step: Duration,
    ) -> Result<bool, io::Error> {
        let res = self.inner.is_locked(key, wait, step).await;
        Ok(Self::degrade("is_locked", key, res, false))
    }

    async fn ping(&self) -> Result<Vec<u8>, io::Error> {
        Ok(Self::degrade("ping", "", self.inner.ping().await, vec![]))
    }

    async fn clear(&self) -> Result<(), io::Error> {
        Ok(Self::degrade("clear", "", self.inner.clear().await, ()))
    }

    async fn get_size(&self, key: &str) -> Result<u64, io::Error> {
        Ok(Self::degrade("get_size", key, self.inner.get_size(key).await, 0))
    }

    async fn get_size_match(&self, pattern: &str) -> Result<u64, io::Error> {
        let res = self.inner.get_size_match(pattern).await;
        Ok(Self::degrade("get_size_match", pattern, res, 0))
    }
}

/// End a stream at its first error instead of yielding the error.
fn safe_stream<T>(strm: IOResultStream<T>) -> IOResultStream<T>
where T: Send + 'static {
    use futures_util::StreamExt;

    strm.take_while(|item| {
        let ok = match item {
            Ok(_) => true,
            Err(e) => {
                warn!("SafeBackend: stream item failed, stream ended: {}", e);
                false
            }
        };
        futures::future::ready(ok)
    })
    .boxed()
}
