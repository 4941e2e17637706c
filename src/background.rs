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

//! Fire-and-forget work owned by the cache facade.
//!
//! Background recomputations are detached: the triggering call never awaits them.
//! The queue is bounded and de-duplicates by key, so concurrent triggers for the
//! same key start at most one task.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct BackgroundTasks {
    in_flight: Mutex<HashSet<String>>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl BackgroundTasks {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            in_flight: Mutex::new(HashSet::new()),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Spawn `fut` for `key` unless a task for `key` is running or the queue is full.
    ///
    /// Returns the handle of the spawned task.
    pub fn spawn<F>(self: &Arc<Self>, key: &str, fut: F) -> Option<JoinHandle<()>>
    where F: Future<Output = ()> + Send + 'static {
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains(key) {
            debug!("background task for {:?} already in flight", key);
            return None;
        }

        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            debug!("background queue full, skip task for {:?}", key);
            return None;
        };

        in_flight.insert(key.to_string());
        drop(in_flight);

        let done = InFlight {
            tasks: self.clone(),
            key: key.to_string(),
        };

        let handle = tokio::spawn(async move {
            let _permit = permit;
            let _done = done;
            fut.await;
        });
        Some(handle)
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.lock().contains(key)
    }

    /// Number of running tasks.
    pub fn len(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every running task finished.
    pub async fn wait_idle(&self) {
        if let Ok(all) = self.permits.acquire_many(self.capacity as u32).await {
            drop(all);
        }
    }
}

/// Removes the key from the in-flight set when the task ends, even by panic.
struct InFlight {
    tasks: Arc<BackgroundTasks>,
    key: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.tasks.in_flight.lock().remove(&self.key);
    }
}
