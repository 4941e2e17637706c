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

//! Encoding of decorated results stored in the cache.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::CacheError;

pub fn encode<T>(value: &T) -> Result<Vec<u8>, CacheError>
where T: Serialize + ?Sized {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode<T>(bytes: &[u8]) -> Result<T, CacheError>
where T: DeserializeOwned {
    Ok(serde_json::from_slice(bytes)?)
}
