/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

use crate::common::Result;
use crate::hash::{Hash, HashValue};
use crate::message::Message;

/// Arguments of a successful reply.
///
/// Peers reply with zero or more positional values. A single value is the
/// common case and is reached with [`single`](Self::single).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply(Vec<HashValue>);

impl Reply {
    /// Wraps reply values.
    pub fn new(values: Vec<HashValue>) -> Self {
        Self(values)
    }

    /// Reads a reply message, turning `error=true` into [`KaraboError::Remote`](crate::common::KaraboError::Remote).
    pub fn from_message(message: &Message) -> Result<Self> {
        if message.is_error() {
            return Err(message.to_remote_error());
        }
        Ok(Self(message.args()))
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the peer replied without values.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The value if exactly one was sent.
    pub fn single(&self) -> Option<&HashValue> {
        match self.0.as_slice() {
            [value] => Some(value),
            _ => None,
        }
    }

    /// Value `index`.
    pub fn get(&self, index: usize) -> Option<&HashValue> {
        self.0.get(index)
    }

    /// Value `index` as a Hash.
    pub fn hash(&self, index: usize) -> Option<&Hash> {
        self.0.get(index).and_then(HashValue::as_hash)
    }

    /// Consumes the reply, returning the first value or `None`.
    pub fn into_first(self) -> HashValue {
        self.0.into_iter().next().unwrap_or_default()
    }

    /// Consumes the reply into its values.
    pub fn into_vec(self) -> Vec<HashValue> {
        self.0
    }
}
