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

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::hash::{Hash, HashValue, Schema};
use crate::message::Message;
use crate::signalslot::SignalSlotable;

/// Synchronous slot body.
pub type SyncSlotFn = Arc<dyn Fn(SlotCall) -> anyhow::Result<SlotReply> + Send + Sync>;

/// Cooperative slot body.
pub type CooperativeSlotFn =
    Arc<dyn Fn(SlotCall) -> BoxFuture<'static, anyhow::Result<SlotReply>> + Send + Sync>;

/// What a slot sends back.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SlotReply {
    /// No reply at all.
    Silent,
    /// A reply without values.
    #[default]
    Empty,
    /// A reply with positional values.
    Values(Vec<HashValue>),
}

impl SlotReply {
    /// A reply carrying one value.
    pub fn value(value: impl Into<HashValue>) -> Self {
        Self::Values(vec![value.into()])
    }

    /// A reply carrying several values.
    pub fn values(values: Vec<HashValue>) -> Self {
        Self::Values(values)
    }

    pub(crate) fn into_values(self) -> Option<Vec<HashValue>> {
        match self {
            Self::Silent => None,
            Self::Empty => Some(Vec::new()),
            Self::Values(values) => Some(values),
        }
    }
}

impl From<()> for SlotReply {
    fn from((): ()) -> Self {
        Self::Empty
    }
}

impl From<HashValue> for SlotReply {
    fn from(value: HashValue) -> Self {
        Self::value(value)
    }
}

impl From<Hash> for SlotReply {
    fn from(value: Hash) -> Self {
        Self::value(value)
    }
}

impl From<bool> for SlotReply {
    fn from(value: bool) -> Self {
        Self::value(value)
    }
}

/// One invocation of a slot.
#[derive(Clone)]
pub struct SlotCall {
    /// The instance the slot belongs to.
    pub instance: SignalSlotable,
    /// Registered slot name.
    pub slot: String,
    /// The inbound message.
    pub message: Arc<Message>,
    /// Positional arguments.
    pub args: Vec<HashValue>,
}

impl fmt::Debug for SlotCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotCall")
            .field("instance", &self.instance.instance_id())
            .field("slot", &self.slot)
            .field("caller", &self.caller())
            .field("args", &self.args.len())
            .finish()
    }
}

impl SlotCall {
    /// Instance id of the caller.
    pub fn caller(&self) -> &str {
        self.message.sender()
    }

    /// Argument `index`.
    pub fn arg(&self, index: usize) -> anyhow::Result<&HashValue> {
        self.args
            .get(index)
            .ok_or_else(|| anyhow!("slot '{}' expects argument {}", self.slot, index + 1))
    }

    /// Argument `index` as a string.
    pub fn str_arg(&self, index: usize) -> anyhow::Result<&str> {
        let value = self.arg(index)?;
        value
            .as_str()
            .ok_or_else(|| anyhow!("argument {} of '{}' is {}, not a string", index + 1, self.slot, value.type_code()))
    }

    /// Argument `index` as a Hash.
    pub fn hash_arg(&self, index: usize) -> anyhow::Result<&Hash> {
        let value = self.arg(index)?;
        value
            .as_hash()
            .ok_or_else(|| anyhow!("argument {} of '{}' is {}, not a Hash", index + 1, self.slot, value.type_code()))
    }

    /// Argument `index` as a Schema.
    pub fn schema_arg(&self, index: usize) -> anyhow::Result<&Schema> {
        let value = self.arg(index)?;
        value
            .as_schema()
            .ok_or_else(|| anyhow!("argument {} of '{}' is {}, not a Schema", index + 1, self.slot, value.type_code()))
    }

    /// Argument `index` as a bool, `default` when absent.
    pub fn bool_arg_or(&self, index: usize, default: bool) -> bool {
        self.args
            .get(index)
            .and_then(HashValue::as_bool)
            .unwrap_or(default)
    }
}

/// A registered slot body with its calling convention.
#[derive(Clone)]
pub enum SlotHandler {
    /// Runs inline on the delivery path; the return value is the reply.
    Sync(SyncSlotFn),
    /// Runs as a task owned by the instance; its result is the reply.
    Cooperative(CooperativeSlotFn),
}

impl fmt::Debug for SlotHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("SlotHandler::Sync"),
            Self::Cooperative(_) => f.write_str("SlotHandler::Cooperative"),
        }
    }
}

impl SlotHandler {
    /// Wraps a synchronous slot body.
    pub fn sync<F, R>(f: F) -> Self
    where
        F: Fn(SlotCall) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Into<SlotReply>,
    {
        Self::Sync(Arc::new(move |call| f(call).map(Into::into)))
    }

    /// Wraps a cooperative slot body.
    pub fn cooperative<F, Fut, R>(f: F) -> Self
    where
        F: Fn(SlotCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<SlotReply>,
    {
        Self::Cooperative(Arc::new(move |call| f(call).map(|r| r.map(Into::into)).boxed()))
    }

    /// Whether the slot runs as its own task.
    pub fn is_cooperative(&self) -> bool {
        matches!(self, Self::Cooperative(_))
    }
}

/// A slot table entry.
#[derive(Debug, Clone)]
pub(crate) struct SlotEntry {
    pub(crate) handler: SlotHandler,
    /// Rejected while another instance holds the lock.
    pub(crate) lockable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_shapes() {
        assert_eq!(SlotReply::from(()).into_values(), Some(Vec::new()));
        assert_eq!(SlotReply::Silent.into_values(), None);
        assert_eq!(
            SlotReply::from(true).into_values(),
            Some(vec![HashValue::Bool(true)])
        );
    }

    #[test]
    fn handler_kinds() {
        let sync = SlotHandler::sync(|_call| Ok(()));
        let coop = SlotHandler::cooperative(|_call| async { Ok(SlotReply::Empty) });
        assert!(!sync.is_cooperative());
        assert!(coop.is_cooperative());
    }
}
