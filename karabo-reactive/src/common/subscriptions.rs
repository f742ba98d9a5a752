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

//! Book-keeping of broker bindings and signal-to-slot connections.
//!
//! The table is only mutated while the owning session holds its subscribe
//! lock; readers on the delivery path take a short read lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Statistics of a subscription table.
#[derive(Debug, Default)]
pub struct SubscriptionStats {
    /// Signal connections added.
    connects: AtomicUsize,
    /// Signal connections removed.
    disconnects: AtomicUsize,
    /// Broker bindings added.
    bindings_added: AtomicUsize,
    /// Broker bindings removed.
    bindings_removed: AtomicUsize,
}

impl SubscriptionStats {
    /// Get the number of signal connections added.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }

    /// Get the number of signal connections removed.
    #[must_use]
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::Relaxed)
    }

    /// Get the number of broker bindings added.
    #[must_use]
    pub fn bindings_added(&self) -> usize {
        self.bindings_added.load(Ordering::Relaxed)
    }

    /// Get the number of broker bindings removed.
    #[must_use]
    pub fn bindings_removed(&self) -> usize {
        self.bindings_removed.load(Ordering::Relaxed)
    }
}

/// `(exchange, routing key)` of a broker binding.
pub type BindingKey = (String, String);

/// Bindings of one queue and the local slots connected to remote signals.
#[derive(Default)]
pub struct SubscriptionTable {
    bindings: HashSet<BindingKey>,
    /// `(peer id, signal)` to local slots, in connection order.
    slots: HashMap<(String, String), Vec<String>>,
    stats: SubscriptionStats,
}

impl std::fmt::Debug for SubscriptionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionTable")
            .field("binding_count", &self.bindings.len())
            .field("connection_count", &self.slots.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl SubscriptionTable {
    /// Records a binding. Returns `true` if it was not known yet.
    pub fn add_binding(&mut self, exchange: &str, key: &str) -> bool {
        let added = self
            .bindings
            .insert((exchange.to_string(), key.to_string()));
        if added {
            self.stats.bindings_added.fetch_add(1, Ordering::Relaxed);
        }
        added
    }

    /// Forgets a binding. Returns `true` if it was known.
    pub fn remove_binding(&mut self, exchange: &str, key: &str) -> bool {
        let removed = self
            .bindings
            .remove(&(exchange.to_string(), key.to_string()));
        if removed {
            self.stats.bindings_removed.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Whether the binding is recorded.
    pub fn has_binding(&self, exchange: &str, key: &str) -> bool {
        self.bindings
            .contains(&(exchange.to_string(), key.to_string()))
    }

    /// Takes every recorded binding and connection.
    pub fn drain(&mut self) -> Vec<BindingKey> {
        self.slots.clear();
        let drained: Vec<BindingKey> = self.bindings.drain().collect();
        self.stats
            .bindings_removed
            .fetch_add(drained.len(), Ordering::Relaxed);
        drained
    }

    /// Connects `slot` to the signal. Idempotent.
    pub fn connect(&mut self, peer: &str, signal: &str, slot: &str) {
        let slots = self
            .slots
            .entry((peer.to_string(), signal.to_string()))
            .or_default();
        if !slots.iter().any(|s| s == slot) {
            slots.push(slot.to_string());
            self.stats.connects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Disconnects `slot`. Returns `true` if no slot is left for the signal.
    pub fn disconnect(&mut self, peer: &str, signal: &str, slot: &str) -> bool {
        let key = (peer.to_string(), signal.to_string());
        let Some(slots) = self.slots.get_mut(&key) else {
            return true;
        };
        let before = slots.len();
        slots.retain(|s| s != slot);
        if slots.len() < before {
            self.stats.disconnects.fetch_add(1, Ordering::Relaxed);
        }
        if slots.is_empty() {
            self.slots.remove(&key);
            true
        } else {
            false
        }
    }

    /// Local slots connected to the signal.
    pub fn slots_for(&self, peer: &str, signal: &str) -> Vec<String> {
        self.slots
            .get(&(peer.to_string(), signal.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of recorded bindings.
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Returns a reference to the statistics.
    #[must_use]
    pub const fn stats(&self) -> &SubscriptionStats {
        &self.stats
    }
}
