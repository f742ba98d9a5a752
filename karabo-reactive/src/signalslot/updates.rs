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

//! Staging of property changes for bulk `signalChanged` emission.

use std::collections::BTreeMap;

use crate::hash::{Hash, HashValue, Node};
use crate::signalslot::SignalSlotable;

/// Property changes waiting to be emitted.
///
/// Entries keep the order of their first mutation; setting a path again
/// replaces the staged node in place.
#[derive(Debug, Default)]
pub(crate) struct UpdateBuffer {
    entries: Vec<(String, Node)>,
}

impl UpdateBuffer {
    pub(crate) fn stage(&mut self, path: &str, node: Node) {
        match self.entries.iter_mut().find(|(p, _)| p == path) {
            Some(entry) => entry.1 = node,
            None => self.entries.push((path.to_string(), node)),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drains the buffer into one Hash per train id, ascending by train id.
    /// Nodes without a `tid` attribute land in bucket `0`.
    pub(crate) fn take_buckets(&mut self) -> Vec<(u64, Hash)> {
        let mut buckets: BTreeMap<u64, Hash> = BTreeMap::new();
        for (path, node) in self.entries.drain(..) {
            let tid = node
                .attrs
                .get("tid")
                .and_then(HashValue::as_u64)
                .unwrap_or(0);
            buckets.entry(tid).or_default().set_node(&path, node);
        }
        buckets.into_iter().collect()
    }
}

/// Scope in which property changes are collected and emitted together.
///
/// While at least one `BulkUpdate` of an instance is alive, setters only
/// stage their changes. Dropping the last one (or calling
/// [`commit`](Self::commit)) emits one `signalChanged` per train id.
///
/// ```rust,ignore
/// let batch = device.batch();
/// device.set_with_timestamp("x", 1, Timestamp::now().with_tid(10));
/// device.set_with_timestamp("y", 2, Timestamp::now().with_tid(11));
/// batch.commit();
/// ```
#[must_use = "changes are emitted when the guard goes out of scope"]
#[derive(Debug)]
pub struct BulkUpdate {
    instance: SignalSlotable,
}

impl BulkUpdate {
    pub(crate) fn new(instance: SignalSlotable) -> Self {
        instance.enter_batch();
        Self { instance }
    }

    /// Ends the scope now.
    pub fn commit(self) {}
}

impl Drop for BulkUpdate {
    fn drop(&mut self) {
        self.instance.leave_batch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{Attributes, Timestamp};

    fn node(value: i32, tid: u64) -> Node {
        let mut attrs = Attributes::new();
        Timestamp::now().with_tid(tid).apply_to(&mut attrs);
        Node::with_attrs(value, attrs)
    }

    #[test]
    fn buckets_follow_train_ids() {
        let mut buffer = UpdateBuffer::default();
        buffer.stage("x", node(1, 10));
        buffer.stage("y", node(2, 11));
        buffer.stage("z", node(3, 10));
        assert_eq!(buffer.len(), 3);

        let buckets = buffer.take_buckets();
        assert!(buffer.is_empty());
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].0, 10);
        assert_eq!(buckets[0].1.paths(), vec!["x", "z"]);
        assert_eq!(buckets[1].0, 11);
        assert_eq!(buckets[1].1.paths(), vec!["y"]);
    }

    #[test]
    fn restaging_keeps_first_position() {
        let mut buffer = UpdateBuffer::default();
        buffer.stage("a", Node::new(1));
        buffer.stage("b", Node::new(2));
        buffer.stage("a", Node::new(3));
        let buckets = buffer.take_buckets();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].1.paths(), vec!["a", "b"]);
        assert_eq!(buckets[0].1.get("a"), Some(&HashValue::Int32(3)));
    }
}
