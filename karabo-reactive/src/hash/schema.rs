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

//! Self-describing interface descriptions.

use super::{Attributes, Hash, HashValue, TypeCode};
use crate::common::KaraboError;

/// Structural kind of a schema element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// A property holding a value.
    Leaf,
    /// A container of further elements.
    Node,
    /// An invocable slot.
    Slot,
}

/// Who may write a property and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Set once at instantiation.
    InitOnly = 1,
    /// Never written from outside.
    ReadOnly = 2,
    /// Writable at runtime through `slotReconfigure`.
    Reconfigurable = 4,
}

impl AccessMode {
    fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(Self::InitOnly),
            2 => Some(Self::ReadOnly),
            4 => Some(Self::Reconfigurable),
            _ => None,
        }
    }
}

/// Whether a property has to be supplied at instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// May be omitted.
    Optional = 0,
    /// Must be supplied.
    Mandatory = 1,
    /// Managed by the instance itself.
    Internal = 2,
}

const NODE_TYPE: &str = "nodeType";
const VALUE_TYPE: &str = "valueType";
const ACCESS_MODE: &str = "accessMode";
const ASSIGNMENT: &str = "assignment";
const DEFAULT_VALUE: &str = "defaultValue";
const DISPLAY_TYPE: &str = "displayType";
const CLASS_ID: &str = "classId";
const ALLOWED_STATES: &str = "allowedStates";

/// The named description of an instance's interface.
///
/// The description is a [`Hash`] whose attributes at every path carry the
/// element metadata (`nodeType`, `valueType`, `accessMode`, ...). A schema
/// never holds live values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    name: String,
    hash: Hash,
}

impl Schema {
    /// Wraps an existing description.
    pub fn new(name: impl Into<String>, hash: Hash) -> Self {
        Self {
            name: name.into(),
            hash,
        }
    }

    /// Starts building a schema for class `name`.
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            schema: Self::new(name, Hash::new()),
        }
    }

    /// The class name the schema describes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw description.
    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Whether nothing is described.
    pub fn is_empty(&self) -> bool {
        self.hash.is_empty()
    }

    /// Kind of the element at `path`.
    pub fn node_type(&self, path: &str) -> Option<NodeType> {
        let attrs = self.hash.get_attributes(path)?;
        match attrs.get(NODE_TYPE).and_then(HashValue::as_i64)? {
            0 => Some(NodeType::Leaf),
            1 if attrs.get(DISPLAY_TYPE).and_then(HashValue::as_str) == Some("Slot") => {
                Some(NodeType::Slot)
            }
            1 => Some(NodeType::Node),
            _ => None,
        }
    }

    /// Access mode of the leaf at `path`.
    pub fn access_mode(&self, path: &str) -> Option<AccessMode> {
        self.hash
            .get_attribute(path, ACCESS_MODE)
            .and_then(HashValue::as_i64)
            .and_then(AccessMode::from_i64)
    }

    /// Declared value type of the leaf at `path`.
    pub fn value_type(&self, path: &str) -> Option<TypeCode> {
        self.hash
            .get_attribute(path, VALUE_TYPE)
            .and_then(HashValue::as_str)
            .and_then(TypeCode::from_name)
    }

    /// Default value of the leaf at `path`.
    pub fn default_value(&self, path: &str) -> Option<&HashValue> {
        self.hash.get_attribute(path, DEFAULT_VALUE)
    }

    fn walk(&self, prefix: &str, level: &Hash, out: &mut Vec<(String, NodeType)>) {
        for (key, node) in level.iter() {
            let path = if prefix.is_empty() {
                key.to_string()
            } else {
                format!("{prefix}.{key}")
            };
            let Some(kind) = self.node_type(&path) else {
                continue;
            };
            out.push((path.clone(), kind));
            if kind == NodeType::Node {
                if let HashValue::Hash(inner) = &node.value {
                    self.walk(&path, inner, out);
                }
            }
        }
    }

    /// Every element path with its kind, depth first.
    pub fn elements(&self) -> Vec<(String, NodeType)> {
        let mut out = Vec::new();
        self.walk("", &self.hash, &mut out);
        out
    }

    /// Paths of all leaves.
    pub fn leaves(&self) -> Vec<String> {
        self.elements()
            .into_iter()
            .filter(|(_, k)| *k == NodeType::Leaf)
            .map(|(p, _)| p)
            .collect()
    }

    /// Paths of all slots.
    pub fn slots(&self) -> Vec<String> {
        self.elements()
            .into_iter()
            .filter(|(_, k)| *k == NodeType::Slot)
            .map(|(p, _)| p)
            .collect()
    }

    /// A configuration holding every declared default value.
    pub fn default_configuration(&self) -> Hash {
        let mut out = Hash::new();
        for path in self.leaves() {
            if let Some(value) = self.default_value(&path) {
                out.set(&path, value.clone());
            }
        }
        out
    }

    /// Checks that every path of `changes` names a reconfigurable leaf.
    ///
    /// The error lists each offending path with the reason it was refused.
    pub fn validate_reconfiguration(&self, changes: &Hash) -> Result<(), KaraboError> {
        let mut bad = Vec::new();
        for path in changes.paths() {
            match self.node_type(&path) {
                None | Some(NodeType::Node) => bad.push(format!("{path} (unknown property)")),
                Some(NodeType::Slot) => bad.push(format!("{path} (is a slot)")),
                Some(NodeType::Leaf) => match self.access_mode(&path) {
                    Some(AccessMode::Reconfigurable) => {}
                    Some(AccessMode::InitOnly) => bad.push(format!("{path} (init-only)")),
                    _ => bad.push(format!("{path} (read-only)")),
                },
            }
        }
        if bad.is_empty() {
            Ok(())
        } else {
            Err(KaraboError::Validation(format!(
                "Reconfiguration rejected for: {}",
                bad.join(", ")
            )))
        }
    }

    /// The schema restricted to elements allowed in `state`.
    ///
    /// Elements without an `allowedStates` attribute are always kept.
    pub fn for_state(&self, state: &str) -> Schema {
        fn filter(level: &Hash, state: &str) -> Hash {
            let mut out = Hash::new();
            for (key, node) in level.iter() {
                let allowed = node
                    .attrs
                    .get(ALLOWED_STATES)
                    .and_then(HashValue::as_vec_string)
                    .map_or(true, |states| states.iter().any(|s| s == state));
                if !allowed {
                    continue;
                }
                let mut copy = node.clone();
                if let HashValue::Hash(inner) = &node.value {
                    copy.value = HashValue::Hash(filter(inner, state));
                }
                out.set_node(key, copy);
            }
            out
        }
        Schema::new(self.name.clone(), filter(&self.hash, state))
    }

    /// Adds or replaces the elements of `other`, keeping the name.
    pub fn merge(&mut self, other: &Schema) {
        self.hash.merge(&other.hash);
    }
}

/// One element to be added with [`SchemaBuilder::element`].
#[derive(Debug, Clone)]
pub struct Element {
    path: String,
    attrs: Attributes,
    container: bool,
}

impl Element {
    /// A leaf of the given type, read-only unless changed.
    pub fn leaf(path: impl Into<String>, value_type: TypeCode) -> Self {
        Self {
            path: path.into(),
            attrs: Attributes::new()
                .with(NODE_TYPE, 0i32)
                .with(VALUE_TYPE, value_type.name())
                .with(ACCESS_MODE, AccessMode::ReadOnly as i32)
                .with(ASSIGNMENT, Assignment::Optional as i32)
                .with("requiredAccessLevel", 0i32),
            container: false,
        }
    }

    /// A node grouping further elements.
    pub fn node(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            attrs: Attributes::new().with(NODE_TYPE, 1i32),
            container: true,
        }
    }

    /// A slot.
    pub fn slot(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            attrs: Attributes::new()
                .with(NODE_TYPE, 1i32)
                .with(DISPLAY_TYPE, "Slot")
                .with(CLASS_ID, "Slot")
                .with("requiredAccessLevel", 1i32),
            container: true,
        }
    }

    fn attr(mut self, key: &str, value: impl Into<HashValue>) -> Self {
        self.attrs.set(key, value);
        self
    }

    /// Marks the leaf writable at runtime.
    #[must_use]
    pub fn reconfigurable(self) -> Self {
        self.attr(ACCESS_MODE, AccessMode::Reconfigurable as i32)
    }

    /// Marks the leaf read-only.
    #[must_use]
    pub fn read_only(self) -> Self {
        self.attr(ACCESS_MODE, AccessMode::ReadOnly as i32)
    }

    /// Marks the leaf init-only.
    #[must_use]
    pub fn init_only(self) -> Self {
        self.attr(ACCESS_MODE, AccessMode::InitOnly as i32)
    }

    /// Sets the assignment policy.
    #[must_use]
    pub fn assignment(self, assignment: Assignment) -> Self {
        self.attr(ASSIGNMENT, assignment as i32)
    }

    /// Sets the default value.
    #[must_use]
    pub fn default_value(self, value: impl Into<HashValue>) -> Self {
        self.attr(DEFAULT_VALUE, value)
    }

    /// Restricts the accepted values.
    #[must_use]
    pub fn options(self, options: impl Into<HashValue>) -> Self {
        self.attr("options", options)
    }

    /// Physical unit symbol, e.g. `"mm"`.
    #[must_use]
    pub fn unit(self, symbol: &str) -> Self {
        self.attr("unitSymbol", symbol)
    }

    /// Access level needed to see or use the element.
    #[must_use]
    pub fn required_access_level(self, level: i32) -> Self {
        self.attr("requiredAccessLevel", level)
    }

    /// Human readable description.
    #[must_use]
    pub fn description(self, text: &str) -> Self {
        self.attr("description", text)
    }

    /// States in which the element is available.
    #[must_use]
    pub fn allowed_states(self, states: &[&str]) -> Self {
        self.attr(ALLOWED_STATES, states.to_vec())
    }
}

/// Incremental construction of a [`Schema`].
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    schema: Schema,
}

impl SchemaBuilder {
    /// Adds an element. Parents of a dotted path must have been added before.
    #[must_use]
    pub fn element(mut self, element: Element) -> Self {
        let value = if element.container {
            HashValue::Hash(Hash::new())
        } else {
            HashValue::None
        };
        self.schema.hash.set_element(&element.path, value, element.attrs);
        self
    }

    /// Adds several elements.
    #[must_use]
    pub fn elements(self, elements: impl IntoIterator<Item = Element>) -> Self {
        elements.into_iter().fold(self, Self::element)
    }

    /// Finishes the schema.
    pub fn build(self) -> Schema {
        self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn motor() -> Schema {
        Schema::builder("Motor")
            .element(Element::leaf("state", TypeCode::String).default_value("ON"))
            .element(Element::leaf("speed", TypeCode::Double).reconfigurable().default_value(1.0))
            .element(Element::node("limits"))
            .element(
                Element::leaf("limits.high", TypeCode::Double)
                    .reconfigurable()
                    .allowed_states(&["OFF"]),
            )
            .element(Element::leaf("serial", TypeCode::String).init_only())
            .element(Element::slot("start"))
            .build()
    }

    #[test]
    fn element_kinds_are_reported() {
        let s = motor();
        assert_eq!(s.node_type("limits"), Some(NodeType::Node));
        assert_eq!(s.node_type("start"), Some(NodeType::Slot));
        assert_eq!(s.node_type("limits.high"), Some(NodeType::Leaf));
        assert_eq!(s.leaves(), vec!["state", "speed", "limits.high", "serial"]);
        assert_eq!(s.slots(), vec!["start"]);
        assert_eq!(s.value_type("speed"), Some(TypeCode::Double));
    }

    #[test]
    fn default_configuration_collects_defaults() {
        let cfg = motor().default_configuration();
        assert_eq!(cfg.paths(), vec!["state", "speed"]);
    }

    #[test]
    fn validation_names_each_bad_path() {
        let s = motor();
        assert!(s.validate_reconfiguration(&Hash::new().with("speed", 2.0)).is_ok());
        let err = s
            .validate_reconfiguration(
                &Hash::new()
                    .with("state", "OFF")
                    .with("serial", "x")
                    .with("nope", 1i32)
                    .with("start", true),
            )
            .unwrap_err()
            .to_string();
        assert!(err.contains("state (read-only)"));
        assert!(err.contains("serial (init-only)"));
        assert!(err.contains("nope (unknown property)"));
        assert!(err.contains("start (is a slot)"));
    }

    #[test]
    fn state_filter_drops_disallowed_elements() {
        let s = motor();
        assert!(s.for_state("ON").node_type("limits.high").is_none());
        assert!(s.for_state("OFF").node_type("limits.high").is_some());
    }
}
