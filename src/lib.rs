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

//! # Cache API
//!
//! Cache middleware over pluggable key-value backends: stampede-protected
//! recomputation, leased locks, failover caching and multi-key transactions.
//!
//! A backend only has to offer simple per-key operations, see [`Backend`].
//! Everything else is built on top of them.
//!
//! ## Core Components
//!
//! - [`Backend`]: the operations every store provides
//! - [`Cache`]: routes keys to backends, opens transactions, builds decorated functions
//! - [`Transaction`]: buffers writes and replays them on commit, in one of three
//!   [`TransactionMode`]s
//! - [`lock::acquire`]: a leased lock made of a conditional set and polling
//! - [`decorators`]: early refresh, locked memoization and failover stages
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use cache_api::decorators::EarlyOptions;
//! use cache_api::key_template::CallArgs;
//! use cache_api::Backend;
//! use cache_api::Cache;
//! use cache_api::CacheError;
//! use cache_api::MatchExist;
//! use cache_api::TransactionMode;
//! use cache_api::TransactionOptions;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), CacheError> {
//!     let cache = Cache::memory();
//!
//!     // A function whose result is refreshed in the background before it expires.
//!     let load = cache
//!         .decorate::<String, CacheError>("load_user", &["id"])
//!         .early(EarlyOptions::new(Duration::from_secs(60)))?
//!         .build();
//!
//!     let user = load
//!         .call(CallArgs::new().arg("id", 42), || async { Ok("alice".to_string()) })
//!         .await?;
//!     assert_eq!(user, "alice");
//!
//!     // Multi-key writes that become visible together.
//!     let tx = cache
//!         .transaction(TransactionOptions::new(TransactionMode::Locked))
//!         .await?;
//!     tx.set("a", b"1".to_vec(), None, MatchExist::Any).await?;
//!     tx.incr("visits", 1).await?;
//!     tx.commit().await?;
//!
//!     Ok(())
//! }
//! ```

use std::io;

use futures_util::stream::BoxStream;

pub mod backend;
pub mod background;
pub mod cache;
pub mod codec;
pub mod decorators;
pub mod errors;
pub mod glob;
pub mod impls;
pub mod key_template;
pub mod lock;
pub mod match_exist;
pub mod transaction;

pub use crate::backend::Backend;
pub use crate::backend::Expiry;
pub use crate::cache::Cache;
pub use crate::cache::CacheConfig;
pub use crate::errors::CacheError;
pub use crate::glob::Glob;
pub use crate::lock::LockGuard;
pub use crate::lock::LockOptions;
pub use crate::match_exist::MatchExist;
pub use crate::transaction::Transaction;
pub use crate::transaction::TransactionMode;
pub use crate::transaction::TransactionOptions;
pub use crate::transaction::TransactionState;

/// A boxed stream that yields `Result` of items or an `io::Error`.
/// The stream is 'static so that it can outlive the backend call that created it.
pub type IOResultStream<T> = BoxStream<'static, Result<T, io::Error>>;
