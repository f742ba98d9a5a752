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

use super::{Attributes, Hash, HashValue, TypeCode};
use crate::common::KaraboError;

const CLASS_ID: &str = "__classId";
const NDARRAY: &str = "NDArray";

/// An n-dimensional array of fixed width elements.
///
/// On the wire the array travels as a Hash node tagged with
/// `__classId = "NDArray"` and the children `data`, `shape`, `type` and
/// `isBigEndian`.
#[derive(Debug, Clone, PartialEq)]
pub struct NDArray {
    /// Raw element bytes in row-major order.
    pub data: Vec<u8>,
    /// Extent of every dimension.
    pub shape: Vec<u64>,
    /// Element type.
    pub element_type: TypeCode,
    /// Byte order of `data`.
    pub big_endian: bool,
}

impl NDArray {
    /// Builds a little-endian array of `f64`.
    pub fn from_f64(values: &[f64], shape: Vec<u64>) -> Self {
        Self {
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            shape,
            element_type: TypeCode::Double,
            big_endian: false,
        }
    }

    /// Number of elements according to the shape.
    pub fn len(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Whether the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes the elements of a little-endian `f64` array.
    pub fn to_f64(&self) -> Option<Vec<f64>> {
        if self.element_type != TypeCode::Double || self.big_endian {
            return None;
        }
        Some(
            self.data
                .chunks_exact(8)
                .map(|c| {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(c);
                    f64::from_le_bytes(buf)
                })
                .collect(),
        )
    }

    /// Stores the array at `path` of `hash`.
    pub fn store(&self, hash: &mut Hash, path: &str) {
        let node = Hash::new()
            .with("data", HashValue::ByteArray(self.data.clone()))
            .with("shape", self.shape.clone())
            .with("type", self.element_type as i32)
            .with("isBigEndian", self.big_endian);
        hash.set_element(path, node, Attributes::new().with(CLASS_ID, NDARRAY));
    }

    /// Reads an array stored with [`NDArray::store`].
    pub fn load(hash: &Hash, path: &str) -> Result<Self, KaraboError> {
        let node = hash
            .get_node(path)
            .ok_or_else(|| KaraboError::NotFound(path.to_string()))?;
        if node.attrs.get(CLASS_ID).and_then(HashValue::as_str) != Some(NDARRAY) {
            return Err(KaraboError::Codec(format!("'{path}' is not an NDArray")));
        }
        let inner = node
            .value
            .as_hash()
            .ok_or_else(|| KaraboError::Codec(format!("'{path}' is not a node")))?;
        let field = |key: &str| {
            inner
                .get(key)
                .ok_or_else(|| KaraboError::Codec(format!("NDArray '{path}' lacks '{key}'")))
        };
        let data = field("data")?
            .as_bytes()
            .ok_or_else(|| KaraboError::Codec("NDArray data must be bytes".into()))?
            .to_vec();
        let shape = match field("shape")? {
            HashValue::VectorUInt64(v) => v.clone(),
            other => {
                return Err(KaraboError::Codec(format!(
                    "NDArray shape has type {}",
                    other.type_code()
                )))
            }
        };
        let element_type = field("type")?
            .as_i64()
            .and_then(|c| u32::try_from(c).ok())
            .and_then(TypeCode::from_u32)
            .ok_or_else(|| KaraboError::Codec("NDArray type is not a type code".into()))?;
        let big_endian = field("isBigEndian")?.as_bool().unwrap_or(false);
        Ok(Self {
            data,
            shape,
            element_type,
            big_endian,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::codec;

    #[test]
    fn array_survives_the_wire() {
        let arr = NDArray::from_f64(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
        let mut h = Hash::new();
        arr.store(&mut h, "image");
        let back = NDArray::load(&codec::decode(&codec::encode(&h)).unwrap(), "image").unwrap();
        assert_eq!(back, arr);
        assert_eq!(back.len(), 6);
        assert_eq!(back.to_f64().unwrap()[5], 6.0);
    }

    #[test]
    fn plain_hash_is_not_an_array() {
        let h = Hash::new().with("image.data", 1i32);
        assert!(NDArray::load(&h, "image").is_err());
    }
}
