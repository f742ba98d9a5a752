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

use crate::common::{KaraboError, Result};
use crate::hash::Hash;

/// `signalFunction` of slot calls and broadcasts.
pub const CALL_FUNCTION: &str = "call";
/// `signalFunction` of replies.
pub const REPLY_FUNCTION: &str = "__reply__";
/// Target id addressing every instance listening to broadcasts.
pub const BROADCAST_TARGET: &str = "*";

/// Slots addressed by one message, per target instance.
///
/// Wire form of `slotFunctions` is `|id1:slotA,slotB||id2:slotC|`, and of
/// `slotInstanceIds` is `|id1||id2|`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotTargets(Vec<(String, Vec<String>)>);

impl SlotTargets {
    /// Targets for a single instance.
    pub fn single(instance_id: &str, slots: &[&str]) -> Self {
        let mut targets = Self::default();
        targets.add(instance_id, slots);
        targets
    }

    /// Adds slots for `instance_id`, merging with earlier entries.
    pub fn add(&mut self, instance_id: &str, slots: &[&str]) {
        let slots = slots.iter().map(|s| (*s).to_string());
        match self.0.iter_mut().find(|(id, _)| id == instance_id) {
            Some((_, existing)) => existing.extend(slots),
            None => self.0.push((instance_id.to_string(), slots.collect())),
        }
    }

    /// Slots addressed to `instance_id`.
    pub fn slots_for(&self, instance_id: &str) -> &[String] {
        self.0
            .iter()
            .find(|(id, _)| id == instance_id)
            .map(|(_, slots)| slots.as_slice())
            .unwrap_or_default()
    }

    /// Addressed instance ids.
    pub fn instance_ids(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(id, _)| id.as_str())
    }

    /// Whether nothing is addressed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The `slotInstanceIds` header value.
    pub fn instance_ids_field(&self) -> String {
        let ids: Vec<&str> = self.instance_ids().collect();
        format!("|{}|", ids.join("||"))
    }

    /// The `slotFunctions` header value.
    pub fn functions_field(&self) -> String {
        let entries: Vec<String> = self
            .0
            .iter()
            .map(|(id, slots)| format!("{id}:{}", slots.join(",")))
            .collect();
        format!("|{}|", entries.join("||"))
    }

    /// Parses a `slotFunctions` header value.
    pub fn parse(field: &str) -> Result<Self> {
        let inner = field
            .strip_prefix('|')
            .and_then(|f| f.strip_suffix('|'))
            .ok_or_else(|| KaraboError::Codec(format!("malformed slotFunctions '{field}'")))?;
        let mut targets = Self::default();
        for entry in inner.split("||").filter(|e| !e.is_empty()) {
            let (id, slots) = entry
                .split_once(':')
                .ok_or_else(|| KaraboError::Codec(format!("malformed slotFunctions '{field}'")))?;
            let slots: Vec<&str> = slots.split(',').filter(|s| !s.is_empty()).collect();
            targets.add(id, &slots);
        }
        Ok(targets)
    }
}

/// Header of a slot call or broadcast.
pub fn call_header(targets: &SlotTargets, hostname: &str, class_id: &str) -> Hash {
    Hash::new()
        .with("signalFunction", CALL_FUNCTION)
        .with("slotInstanceIds", targets.instance_ids_field())
        .with("slotFunctions", targets.functions_field())
        .with("hostname", hostname)
        .with("classId", class_id)
}

/// Header of a reply to the message that carried `reply_to`.
pub fn reply_header(reply_to: &str, receiver: &str, error: bool) -> Hash {
    Hash::new()
        .with("replyFrom", reply_to)
        .with("signalFunction", REPLY_FUNCTION)
        .with("slotInstanceIds", format!("|{receiver}|"))
        .with("error", error)
}

/// Header of a signal emission.
pub fn signal_header(signal: &str, hostname: &str, class_id: &str) -> Hash {
    Hash::new()
        .with("signalFunction", signal)
        .with("slotInstanceIds", "|*|")
        .with("hostname", hostname)
        .with("classId", class_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_functions_wire_form() {
        let mut targets = SlotTargets::single("alpha", &["slotA", "slotB"]);
        targets.add("beta", &["slotC"]);
        assert_eq!(targets.functions_field(), "|alpha:slotA,slotB||beta:slotC|");
        assert_eq!(targets.instance_ids_field(), "|alpha||beta|");
        let parsed = SlotTargets::parse(&targets.functions_field()).unwrap();
        assert_eq!(parsed, targets);
        assert_eq!(parsed.slots_for("beta"), ["slotC".to_string()]);
        assert!(parsed.slots_for("gamma").is_empty());
    }

    #[test]
    fn malformed_slot_functions() {
        assert!(SlotTargets::parse("alpha:slotA").is_err());
        assert!(SlotTargets::parse("|alpha|").is_err());
        assert!(SlotTargets::parse("||").unwrap().is_empty());
    }
}
