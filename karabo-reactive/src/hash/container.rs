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

use super::HashValue;

/// Separator between the levels of a long key.
pub const PATH_SEPARATOR: char = '.';

/// Ordered per-node metadata. Values are never nested Hashes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    entries: Vec<(String, HashValue)>,
}

impl Attributes {
    /// Creates an empty attribute map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<HashValue>) -> Self {
        self.set(key, value);
        self
    }

    /// Inserts or replaces an attribute, keeping the position of an existing key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<HashValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Looks an attribute up.
    pub fn get(&self, key: &str) -> Option<&HashValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Removes an attribute.
    pub fn remove(&mut self, key: &str) -> Option<HashValue> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HashValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copies every attribute of `other` into `self`, overwriting equal keys.
    pub fn merge(&mut self, other: &Attributes) {
        for (k, v) in other.iter() {
            self.set(k, v.clone());
        }
    }
}

/// A value together with its attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    /// The stored value.
    pub value: HashValue,
    /// Metadata such as timestamps.
    pub attrs: Attributes,
}

impl Node {
    /// A node without attributes.
    pub fn new(value: impl Into<HashValue>) -> Self {
        Self {
            value: value.into(),
            attrs: Attributes::new(),
        }
    }

    /// A node with attributes.
    pub fn with_attrs(value: impl Into<HashValue>, attrs: Attributes) -> Self {
        Self {
            value: value.into(),
            attrs,
        }
    }
}

/// Hierarchical, ordered, attributed dictionary.
///
/// `Hash` is the universal value exchanged on the network: message headers
/// and bodies, configurations, schemas and pipeline data are all Hashes.
/// Keys keep their insertion order, and long keys such as `"a.b.c"` address
/// nested Hashes, creating intermediate levels on write.
///
/// ```rust
/// use karabo_reactive::prelude::*;
///
/// let mut h = Hash::new();
/// h.set("motor.position", 3.5);
/// h.set("motor.state", "ON");
/// assert_eq!(h.get("motor.position").and_then(HashValue::as_f64), Some(3.5));
/// assert_eq!(h.paths(), vec!["motor.position", "motor.state"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Hash {
    entries: Vec<(String, Node)>,
}

impl Hash {
    /// Creates an empty Hash.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Hash::set`].
    #[must_use]
    pub fn with(mut self, path: &str, value: impl Into<HashValue>) -> Self {
        self.set(path, value);
        self
    }

    /// Number of top level entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    /// Top level lookup without path splitting.
    fn child(&self, key: &str) -> Option<&Node> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, n)| n)
    }

    fn child_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.entries.iter_mut().find(|(k, _)| k == key).map(|(_, n)| n)
    }

    /// Returns the node at `path`, walking nested Hashes.
    pub fn get_node(&self, path: &str) -> Option<&Node> {
        match path.split_once(PATH_SEPARATOR) {
            None => self.child(path),
            Some((head, rest)) => self.child(head)?.value.as_hash()?.get_node(rest),
        }
    }

    /// Mutable access to the node at `path`.
    pub fn get_node_mut(&mut self, path: &str) -> Option<&mut Node> {
        match path.split_once(PATH_SEPARATOR) {
            None => self.child_mut(path),
            Some((head, rest)) => self.child_mut(head)?.value.as_hash_mut()?.get_node_mut(rest),
        }
    }

    /// Returns the value at `path`.
    pub fn get(&self, path: &str) -> Option<&HashValue> {
        self.get_node(path).map(|n| &n.value)
    }

    /// Returns the nested Hash at `path`.
    pub fn get_hash(&self, path: &str) -> Option<&Hash> {
        self.get(path).and_then(HashValue::as_hash)
    }

    /// Returns the string at `path`.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(HashValue::as_str)
    }

    /// Whether `path` exists.
    pub fn contains(&self, path: &str) -> bool {
        self.get_node(path).is_some()
    }

    /// Attributes of the node at `path`.
    pub fn get_attributes(&self, path: &str) -> Option<&Attributes> {
        self.get_node(path).map(|n| &n.attrs)
    }

    /// A single attribute of the node at `path`.
    pub fn get_attribute(&self, path: &str, key: &str) -> Option<&HashValue> {
        self.get_attributes(path)?.get(key)
    }

    /// Sets one attribute on an existing node. Returns `false` if `path` is absent.
    pub fn set_attribute(&mut self, path: &str, key: &str, value: impl Into<HashValue>) -> bool {
        match self.get_node_mut(path) {
            Some(node) => {
                node.attrs.set(key, value);
                true
            }
            None => false,
        }
    }

    /// Stores `value` at `path`, keeping attributes of an existing node.
    ///
    /// Intermediate levels are created as needed; a non-Hash value standing
    /// in the way is replaced by an empty Hash.
    pub fn set(&mut self, path: &str, value: impl Into<HashValue>) {
        let value = value.into();
        let node = self.node_entry(path);
        node.value = value;
    }

    /// Stores `value` at `path` and replaces its attributes.
    pub fn set_element(&mut self, path: &str, value: impl Into<HashValue>, attrs: Attributes) {
        let value = value.into();
        let node = self.node_entry(path);
        node.value = value;
        node.attrs = attrs;
    }

    /// Stores a complete node at `path`.
    pub fn set_node(&mut self, path: &str, node: Node) {
        *self.node_entry(path) = node;
    }

    fn node_entry(&mut self, path: &str) -> &mut Node {
        let (head, rest) = match path.split_once(PATH_SEPARATOR) {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let idx = match self.position(head) {
            Some(idx) => idx,
            None => {
                let initial = if rest.is_some() {
                    HashValue::Hash(Hash::new())
                } else {
                    HashValue::None
                };
                self.entries.push((head.to_string(), Node::new(initial)));
                self.entries.len() - 1
            }
        };
        let node = &mut self.entries[idx].1;
        match rest {
            None => node,
            Some(rest) => {
                if node.value.as_hash().is_none() {
                    node.value = HashValue::Hash(Hash::new());
                }
                match &mut node.value {
                    HashValue::Hash(inner) => inner.node_entry(rest),
                    _ => unreachable!("value was replaced by a Hash above"),
                }
            }
        }
    }

    /// Removes and returns the node at `path`.
    pub fn remove(&mut self, path: &str) -> Option<Node> {
        match path.split_once(PATH_SEPARATOR) {
            None => {
                let pos = self.position(path)?;
                Some(self.entries.remove(pos).1)
            }
            Some((head, rest)) => self.child_mut(head)?.value.as_hash_mut()?.remove(rest),
        }
    }

    /// Top level keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Top level `(key, node)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.entries.iter().map(|(k, n)| (k.as_str(), n))
    }

    /// Leaf long keys in depth-first insertion order.
    ///
    /// Empty nested Hashes count as leaves.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths("", &mut out);
        out
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<String>) {
        for (key, node) in &self.entries {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}{PATH_SEPARATOR}{key}")
            };
            match &node.value {
                HashValue::Hash(inner) if !inner.is_empty() => inner.collect_paths(&path, out),
                _ => out.push(path),
            }
        }
    }

    /// Deep merge: nested Hashes are merged recursively, everything else is
    /// overwritten; attributes of `other` are merged onto existing nodes.
    pub fn merge(&mut self, other: &Hash) {
        for (key, node) in &other.entries {
            match self.child_mut(key) {
                Some(mine) => {
                    mine.attrs.merge(&node.attrs);
                    match (&mut mine.value, &node.value) {
                        (HashValue::Hash(a), HashValue::Hash(b)) => a.merge(b),
                        (slot, value) => *slot = value.clone(),
                    }
                }
                None => self.entries.push((key.clone(), node.clone())),
            }
        }
    }

    /// A flat Hash holding only the given leaf paths that exist.
    pub fn slice(&self, paths: &[String]) -> Hash {
        let mut out = Hash::new();
        for path in paths {
            if let Some(node) = self.get_node(path) {
                out.set_node(path, node.clone());
            }
        }
        out
    }
}

impl<'a> IntoIterator for &'a Hash {
    type Item = &'a (String, Node);
    type IntoIter = std::slice::Iter<'a, (String, Node)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_level(h: &Hash, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
            for (key, node) in &h.entries {
                write!(f, "{:indent$}{key}", "", indent = depth * 2)?;
                for (k, v) in node.attrs.iter() {
                    write!(f, " {k}=\"{v}\"")?;
                }
                match &node.value {
                    HashValue::Hash(inner) => {
                        writeln!(f, " +")?;
                        write_level(inner, f, depth + 1)?;
                    }
                    value => writeln!(f, " => {value}")?,
                }
            }
            Ok(())
        }
        write_level(self, f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_paths_create_levels_in_order() {
        let mut h = Hash::new();
        h.set("b", 1i32);
        h.set("a.x", "one");
        h.set("a.y", 2.0f64);
        assert_eq!(h.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(h.paths(), vec!["b", "a.x", "a.y"]);
        assert_eq!(h.get_str("a.x"), Some("one"));
    }

    #[test]
    fn set_keeps_attributes_and_position() {
        let mut h = Hash::new().with("x", 1i32).with("y", 2i32);
        h.set_attribute("x", "tid", 10u64);
        h.set("x", 5i32);
        assert_eq!(h.keys().collect::<Vec<_>>(), vec!["x", "y"]);
        assert_eq!(h.get_attribute("x", "tid"), Some(&HashValue::UInt64(10)));
        assert_eq!(h.get("x"), Some(&HashValue::Int32(5)));
    }

    #[test]
    fn merge_is_deep() {
        let mut a = Hash::new().with("n.a", 1i32).with("n.b", 2i32);
        let b = Hash::new().with("n.b", 3i32).with("n.c", 4i32).with("z", true);
        a.merge(&b);
        assert_eq!(a.paths(), vec!["n.a", "n.b", "n.c", "z"]);
        assert_eq!(a.get("n.b"), Some(&HashValue::Int32(3)));
    }

    #[test]
    fn remove_nested() {
        let mut h = Hash::new().with("a.b", 1i32).with("a.c", 2i32);
        assert!(h.remove("a.b").is_some());
        assert!(h.remove("a.b").is_none());
        assert_eq!(h.paths(), vec!["a.c"]);
    }

    #[test]
    fn slice_keeps_requested_paths() {
        let h = Hash::new().with("a.b", 1i32).with("c", 2i32).with("d", 3i32);
        let s = h.slice(&["a.b".to_string(), "d".to_string(), "missing".to_string()]);
        assert_eq!(s.paths(), vec!["a.b", "d"]);
    }
}
