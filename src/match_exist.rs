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

use serde::Deserialize;
use serde::Serialize;

/// Specifies the existence condition that a `set` must satisfy to take effect.
///
/// - Match anything (unconditional write)
/// - Match an existing key (compare-and-set update)
/// - Match an absent key (compare-and-set create, the building block of locks)
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum MatchExist {
    /// Any state is acceptable, i.e. does not check existence at all.
    #[default]
    Any,

    /// The key must be present, e.g. refresh a value without resurrecting it.
    Exists,

    /// The key must be absent, e.g. put-if-absent.
    Absent,
}

/// The existence condition of a write does not hold.
#[derive(Clone, Copy, PartialEq, Eq, thiserror::Error, Debug)]
#[error("ConflictExist: want: {want}, got: exists={exists}")]
pub struct ConflictExist {
    pub want: MatchExist,
    pub exists: bool,
}

impl MatchExist {
    /// Check the condition against whether the key currently exists.
    pub fn match_exist(&self, exists: bool) -> Result<(), ConflictExist> {
        let ok = match self {
            MatchExist::Any => true,
            MatchExist::Exists => exists,
            MatchExist::Absent => !exists,
        };

        if ok {
            Ok(())
        } else {
            Err(ConflictExist { want: *self, exists })
        }
    }

    /// Whether evaluating this condition requires knowing the current state.
    pub fn is_conditional(&self) -> bool {
        !matches!(self, MatchExist::Any)
    }
}

impl From<Option<bool>> for MatchExist {
    /// `Some(true)`: must exist, `Some(false)`: must be absent, `None`: unconditional.
    fn from(exist: Option<bool>) -> Self {
        match exist {
            None => MatchExist::Any,
            Some(true) => MatchExist::Exists,
            Some(false) => MatchExist::Absent,
        }
    }
}

impl fmt::Display for MatchExist {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MatchExist::Any => {
                write!(f, "is any state")
            }
            MatchExist::Exists => {
                write!(f, "exists")
            }
            MatchExist::Absent => {
                write!(f, "absent")
            }
        }
    }
}
