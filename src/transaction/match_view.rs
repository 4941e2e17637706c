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

use std::collections::BTreeSet;

use futures_util::future;
use futures_util::StreamExt;
use tokio::time::Instant;

use crate::backend::iter_stream;
use crate::glob::Glob;
use crate::transaction::write_set::WriteSet;
use crate::IOResultStream;

/// The union of backend entries and buffered changes that match one pattern.
///
/// Built from a point-in-time copy of the buffered changes: the backend side is
/// streamed lazily, the buffered side is yielded after it.
/// A key decided by the buffer is never taken from the backend, so every key
/// appears at most once.
#[derive(Debug)]
pub struct MatchView {
    masked: BTreeSet<String>,
    buffered: Vec<(String, Vec<u8>)>,
}

impl MatchView {
    pub fn new(pattern: &str, changes: &WriteSet, now: Instant) -> Self {
        let glob = Glob::new(pattern);

        let mut masked = BTreeSet::new();
        let mut buffered = vec![];

        for (key, change) in changes.iter() {
            if !glob.matches(key) {
                continue;
            }

            if let Some(read) = change.read(now) {
                masked.insert(key.clone());
                if let Some(value) = read {
                    buffered.push((key.clone(), value));
                }
            }
        }

        Self { masked, buffered }
    }

    /// Leave `keys` out of the backend side as well.
    pub fn hide(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.masked.extend(keys);
        self
    }

    pub fn keys(self, backend: IOResultStream<String>) -> IOResultStream<String> {
        let masked = self.masked;
        let buffered = self.buffered.into_iter().map(|(k, _)| k).collect();

        backend
            .filter(move |res| {
                let keep = match res {
                    Ok(key) => !masked.contains(key),
                    Err(_) => true,
                };
                future::ready(keep)
            })
            .chain(iter_stream(buffered))
            .boxed()
    }

    pub fn entries(
        self,
        backend: IOResultStream<(String, Vec<u8>)>,
    ) -> IOResultStream<(String, Vec<u8>)> {
        let masked = self.masked;

        backend
            .filter(move |res| {
                let keep = match res {
                    Ok((key, _)) => !masked.contains(key),
                    Err(_) => true,
                };
                future::ready(keep)
            })
            .chain(iter_stream(self.buffered))
            .boxed()
    }
}
