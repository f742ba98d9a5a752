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

//! Start-up configuration handed to a process as JSON.
//!
//! The document maps device ids to their class and initial properties:
//!
//! ```json
//! { "motor1": { "classId": "Motor", "speed": 2.5, "limits": { "high": 10 } } }
//! ```

use derive_new::new;
use serde_json::{Map, Value};

use crate::common::{KaraboError, Result};
use crate::hash::{Hash, HashValue};

/// One device to start.
#[derive(new, Debug, Clone, PartialEq)]
pub struct InitEntry {
    /// Id the device will register under.
    pub device_id: String,
    /// Class to instantiate.
    pub class_id: String,
    /// Initial configuration without `classId`.
    pub configuration: Hash,
}

/// Every device listed in an init document, in document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitConfiguration {
    entries: Vec<InitEntry>,
}

impl InitConfiguration {
    /// Parses the JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        let root: Map<String, Value> = serde_json::from_str(text)
            .map_err(|e| KaraboError::Config(format!("init configuration: {e}")))?;
        let mut entries = Vec::with_capacity(root.len());
        for (device_id, value) in root {
            let Value::Object(mut properties) = value else {
                return Err(KaraboError::Config(format!(
                    "init configuration of '{device_id}' is not an object"
                )));
            };
            let class_id = match properties.remove("classId") {
                Some(Value::String(class_id)) => class_id,
                _ => {
                    return Err(KaraboError::Config(format!(
                        "init configuration of '{device_id}' has no classId"
                    )))
                }
            };
            let configuration = object_to_hash(&properties)?;
            entries.push(InitEntry::new(device_id, class_id, configuration));
        }
        Ok(Self { entries })
    }

    /// The parsed entries.
    pub fn entries(&self) -> &[InitEntry] {
        &self.entries
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the document listed no device.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for InitConfiguration {
    type Item = InitEntry;
    type IntoIter = std::vec::IntoIter<InitEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

fn object_to_hash(object: &Map<String, Value>) -> Result<Hash> {
    let mut hash = Hash::new();
    for (key, value) in object {
        hash.set(key, json_to_value(key, value)?);
    }
    Ok(hash)
}

fn json_to_value(key: &str, value: &Value) -> Result<HashValue> {
    Ok(match value {
        Value::Null => HashValue::None,
        Value::Bool(b) => HashValue::Bool(*b),
        Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => match i32::try_from(i) {
                Ok(small) => HashValue::Int32(small),
                Err(_) => HashValue::Int64(i),
            },
            (None, Some(u), _) => HashValue::UInt64(u),
            (_, _, Some(f)) => HashValue::Double(f),
            _ => return Err(KaraboError::Config(format!("unsupported number at '{key}'"))),
        },
        Value::String(s) => HashValue::String(s.clone()),
        Value::Object(object) => HashValue::Hash(object_to_hash(object)?),
        Value::Array(items) => array_to_value(key, items)?,
    })
}

fn array_to_value(key: &str, items: &[Value]) -> Result<HashValue> {
    if items.iter().all(Value::is_string) {
        return Ok(HashValue::VectorString(
            items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        ));
    }
    if items.iter().all(Value::is_boolean) {
        return Ok(HashValue::VectorBool(items.iter().filter_map(Value::as_bool).collect()));
    }
    if items.iter().all(Value::is_i64) {
        return Ok(HashValue::VectorInt64(items.iter().filter_map(Value::as_i64).collect()));
    }
    if items.iter().all(Value::is_number) {
        return Ok(HashValue::VectorDouble(items.iter().filter_map(Value::as_f64).collect()));
    }
    if items.iter().all(Value::is_object) {
        let hashes = items
            .iter()
            .filter_map(Value::as_object)
            .map(object_to_hash)
            .collect::<Result<Vec<_>>>()?;
        return Ok(HashValue::VectorHash(hashes));
    }
    Err(KaraboError::Config(format!("mixed array at '{key}'")))
}
