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

//! Binary Hash serialization.
//!
//! ```text
//! hash      := u32 count, entry*
//! entry     := u32 keyLen, key, u32 typeCode, attrs, value
//! attrs     := u32 count, (u32 keyLen, key, u32 typeCode, value)*
//! value     := fixed width scalar | u32 length-prefixed string / vector / bytes
//!            | hash | u32 count, hash* | schema | u32 0 (None)
//! schema    := u32 totalLen, u32 nameLen, name, hash
//! ```
//!
//! Every integer is little-endian.

use super::{Attributes, Hash, HashValue, Node, Schema, TypeCode};
use crate::common::KaraboError;

/// Serializes a Hash.
pub fn encode(hash: &Hash) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    write_hash(&mut out, hash);
    out
}

/// Appends the serialization of `hash` to `out`.
pub fn encode_into(out: &mut Vec<u8>, hash: &Hash) {
    write_hash(out, hash);
}

/// Deserializes a Hash that must span all of `data`.
pub fn decode(data: &[u8]) -> Result<Hash, KaraboError> {
    let (hash, pos) = decode_pos(data)?;
    if pos != data.len() {
        return Err(KaraboError::Codec(format!(
            "{} trailing bytes after Hash",
            data.len() - pos
        )));
    }
    Ok(hash)
}

/// Deserializes the leading Hash of `data`, returning it with the number of bytes consumed.
pub fn decode_pos(data: &[u8]) -> Result<(Hash, usize), KaraboError> {
    let mut reader = Reader { data, pos: 0, depth: 0 };
    let hash = reader.hash()?;
    Ok((hash, reader.pos))
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

#[allow(clippy::cast_possible_truncation)]
fn put_len(out: &mut Vec<u8>, len: usize) {
    put_u32(out, len as u32);
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_len(out, s.len());
    out.extend_from_slice(s.as_bytes());
}

fn write_hash(out: &mut Vec<u8>, hash: &Hash) {
    put_len(out, hash.len());
    for (key, node) in hash.iter() {
        put_str(out, key);
        put_u32(out, node.value.type_code() as u32);
        write_attributes(out, &node.attrs);
        write_value(out, &node.value);
    }
}

fn write_attributes(out: &mut Vec<u8>, attrs: &Attributes) {
    let usable: Vec<_> = attrs
        .iter()
        .filter(|(_, v)| v.is_attribute_compatible())
        .collect();
    put_len(out, usable.len());
    for (key, value) in usable {
        put_str(out, key);
        put_u32(out, value.type_code() as u32);
        write_value(out, value);
    }
}

macro_rules! put_vec {
    ($out:expr, $v:expr) => {{
        put_len($out, $v.len());
        for x in $v {
            $out.extend_from_slice(&x.to_le_bytes());
        }
    }};
}

fn write_value(out: &mut Vec<u8>, value: &HashValue) {
    match value {
        HashValue::Bool(v) => out.push(u8::from(*v)),
        HashValue::VectorBool(v) => {
            put_len(out, v.len());
            out.extend(v.iter().map(|b| u8::from(*b)));
        }
        HashValue::Char(v) | HashValue::UInt8(v) => out.push(*v),
        HashValue::VectorChar(v) | HashValue::VectorUInt8(v) | HashValue::ByteArray(v) => {
            put_len(out, v.len());
            out.extend_from_slice(v);
        }
        HashValue::Int8(v) => out.extend_from_slice(&v.to_le_bytes()),
        HashValue::VectorInt8(v) => put_vec!(out, v),
        HashValue::Int16(v) => out.extend_from_slice(&v.to_le_bytes()),
        HashValue::VectorInt16(v) => put_vec!(out, v),
        HashValue::UInt16(v) => out.extend_from_slice(&v.to_le_bytes()),
        HashValue::VectorUInt16(v) => put_vec!(out, v),
        HashValue::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
        HashValue::VectorInt32(v) => put_vec!(out, v),
        HashValue::UInt32(v) => out.extend_from_slice(&v.to_le_bytes()),
        HashValue::VectorUInt32(v) => put_vec!(out, v),
        HashValue::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
        HashValue::VectorInt64(v) => put_vec!(out, v),
        HashValue::UInt64(v) => out.extend_from_slice(&v.to_le_bytes()),
        HashValue::VectorUInt64(v) => put_vec!(out, v),
        HashValue::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
        HashValue::VectorFloat(v) => put_vec!(out, v),
        HashValue::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
        HashValue::VectorDouble(v) => put_vec!(out, v),
        HashValue::ComplexFloat((re, im)) => {
            out.extend_from_slice(&re.to_le_bytes());
            out.extend_from_slice(&im.to_le_bytes());
        }
        HashValue::VectorComplexFloat(v) => {
            put_len(out, v.len());
            for (re, im) in v {
                out.extend_from_slice(&re.to_le_bytes());
                out.extend_from_slice(&im.to_le_bytes());
            }
        }
        HashValue::ComplexDouble((re, im)) => {
            out.extend_from_slice(&re.to_le_bytes());
            out.extend_from_slice(&im.to_le_bytes());
        }
        HashValue::VectorComplexDouble(v) => {
            put_len(out, v.len());
            for (re, im) in v {
                out.extend_from_slice(&re.to_le_bytes());
                out.extend_from_slice(&im.to_le_bytes());
            }
        }
        HashValue::String(s) => put_str(out, s),
        HashValue::VectorString(v) => {
            put_len(out, v.len());
            for s in v {
                put_str(out, s);
            }
        }
        HashValue::Hash(h) => write_hash(out, h),
        HashValue::VectorHash(v) => {
            put_len(out, v.len());
            for h in v {
                write_hash(out, h);
            }
        }
        HashValue::Schema(schema) => {
            let mut body = Vec::new();
            put_str(&mut body, schema.name());
            write_hash(&mut body, schema.hash());
            put_len(out, body.len());
            out.extend_from_slice(&body);
        }
        HashValue::None => put_u32(out, 0),
    }
}

/// Deepest Hash nesting the decoder accepts.
pub const MAX_DEPTH: usize = 256;

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

macro_rules! read_scalar {
    ($self:ident, $ty:ty) => {{
        const N: usize = std::mem::size_of::<$ty>();
        let bytes = $self.take(N)?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(bytes);
        <$ty>::from_le_bytes(buf)
    }};
}

macro_rules! read_vec {
    ($self:ident, $ty:ty) => {{
        let n = $self.len()?;
        $self.check_available(n, std::mem::size_of::<$ty>())?;
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            v.push(read_scalar!($self, $ty));
        }
        v
    }};
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], KaraboError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                KaraboError::Codec(format!(
                    "truncated input: need {n} bytes at offset {}, have {}",
                    self.pos,
                    self.data.len().saturating_sub(self.pos)
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn check_available(&self, count: usize, width: usize) -> Result<(), KaraboError> {
        let need = count.saturating_mul(width);
        if need > self.data.len().saturating_sub(self.pos) {
            return Err(KaraboError::Codec(format!(
                "declared {count} elements exceed the remaining input"
            )));
        }
        Ok(())
    }

    fn u32(&mut self) -> Result<u32, KaraboError> {
        Ok(read_scalar!(self, u32))
    }

    fn len(&mut self) -> Result<usize, KaraboError> {
        Ok(self.u32()? as usize)
    }

    fn string(&mut self) -> Result<String, KaraboError> {
        let n = self.len()?;
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| KaraboError::Codec(format!("invalid UTF-8: {e}")))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, KaraboError> {
        let n = self.len()?;
        Ok(self.take(n)?.to_vec())
    }

    fn type_code(&mut self) -> Result<TypeCode, KaraboError> {
        let code = self.u32()?;
        TypeCode::from_u32(code).ok_or_else(|| KaraboError::Codec(format!("unknown type code {code}")))
    }

    fn hash(&mut self) -> Result<Hash, KaraboError> {
        if self.depth >= MAX_DEPTH {
            return Err(KaraboError::Codec(format!("Hash nesting exceeds {MAX_DEPTH}")));
        }
        self.depth += 1;
        let hash = self.entries();
        self.depth -= 1;
        hash
    }

    fn entries(&mut self) -> Result<Hash, KaraboError> {
        let count = self.len()?;
        let mut hash = Hash::new();
        for _ in 0..count {
            let key = self.string()?;
            let ty = self.type_code()?;
            let attrs = self.attributes()?;
            let value = self.value(ty)?;
            hash.set_node(&key, Node::with_attrs(value, attrs));
        }
        Ok(hash)
    }

    fn attributes(&mut self) -> Result<Attributes, KaraboError> {
        let count = self.len()?;
        let mut attrs = Attributes::new();
        for _ in 0..count {
            let key = self.string()?;
            let ty = self.type_code()?;
            if matches!(ty, TypeCode::Hash | TypeCode::VectorHash | TypeCode::Schema) {
                return Err(KaraboError::Codec(format!(
                    "attribute '{key}' has container type {ty}"
                )));
            }
            let value = self.value(ty)?;
            attrs.set(key, value);
        }
        Ok(attrs)
    }

    fn value(&mut self, ty: TypeCode) -> Result<HashValue, KaraboError> {
        let value = match ty {
            TypeCode::Bool => HashValue::Bool(self.take(1)?[0] != 0),
            TypeCode::VectorBool => {
                let bytes = self.bytes()?;
                HashValue::VectorBool(bytes.into_iter().map(|b| b != 0).collect())
            }
            TypeCode::Char => HashValue::Char(self.take(1)?[0]),
            TypeCode::VectorChar => HashValue::VectorChar(self.bytes()?),
            TypeCode::Int8 => HashValue::Int8(read_scalar!(self, i8)),
            TypeCode::VectorInt8 => HashValue::VectorInt8(read_vec!(self, i8)),
            TypeCode::UInt8 => HashValue::UInt8(self.take(1)?[0]),
            TypeCode::VectorUInt8 => HashValue::VectorUInt8(self.bytes()?),
            TypeCode::Int16 => HashValue::Int16(read_scalar!(self, i16)),
            TypeCode::VectorInt16 => HashValue::VectorInt16(read_vec!(self, i16)),
            TypeCode::UInt16 => HashValue::UInt16(read_scalar!(self, u16)),
            TypeCode::VectorUInt16 => HashValue::VectorUInt16(read_vec!(self, u16)),
            TypeCode::Int32 => HashValue::Int32(read_scalar!(self, i32)),
            TypeCode::VectorInt32 => HashValue::VectorInt32(read_vec!(self, i32)),
            TypeCode::UInt32 => HashValue::UInt32(read_scalar!(self, u32)),
            TypeCode::VectorUInt32 => HashValue::VectorUInt32(read_vec!(self, u32)),
            TypeCode::Int64 => HashValue::Int64(read_scalar!(self, i64)),
            TypeCode::VectorInt64 => HashValue::VectorInt64(read_vec!(self, i64)),
            TypeCode::UInt64 => HashValue::UInt64(read_scalar!(self, u64)),
            TypeCode::VectorUInt64 => HashValue::VectorUInt64(read_vec!(self, u64)),
            TypeCode::Float => HashValue::Float(read_scalar!(self, f32)),
            TypeCode::VectorFloat => HashValue::VectorFloat(read_vec!(self, f32)),
            TypeCode::Double => HashValue::Double(read_scalar!(self, f64)),
            TypeCode::VectorDouble => HashValue::VectorDouble(read_vec!(self, f64)),
            TypeCode::ComplexFloat => {
                HashValue::ComplexFloat((read_scalar!(self, f32), read_scalar!(self, f32)))
            }
            TypeCode::VectorComplexFloat => {
                let n = self.len()?;
                self.check_available(n, 8)?;
                let mut v = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push((read_scalar!(self, f32), read_scalar!(self, f32)));
                }
                HashValue::VectorComplexFloat(v)
            }
            TypeCode::ComplexDouble => {
                HashValue::ComplexDouble((read_scalar!(self, f64), read_scalar!(self, f64)))
            }
            TypeCode::VectorComplexDouble => {
                let n = self.len()?;
                self.check_available(n, 16)?;
                let mut v = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push((read_scalar!(self, f64), read_scalar!(self, f64)));
                }
                HashValue::VectorComplexDouble(v)
            }
            TypeCode::String => HashValue::String(self.string()?),
            TypeCode::VectorString => {
                let n = self.len()?;
                self.check_available(n, 4)?;
                let mut v = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push(self.string()?);
                }
                HashValue::VectorString(v)
            }
            TypeCode::Hash => HashValue::Hash(self.hash()?),
            TypeCode::VectorHash => {
                let n = self.len()?;
                self.check_available(n, 4)?;
                let mut v = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push(self.hash()?);
                }
                HashValue::VectorHash(v)
            }
            TypeCode::Schema => {
                let total = self.len()?;
                let start = self.pos;
                let name = self.string()?;
                let hash = self.hash()?;
                if self.pos - start != total {
                    return Err(KaraboError::Codec(format!(
                        "schema '{name}' declared {total} bytes but used {}",
                        self.pos - start
                    )));
                }
                HashValue::Schema(Schema::new(name, hash))
            }
            TypeCode::None => {
                self.u32()?;
                HashValue::None
            }
            TypeCode::ByteArray => HashValue::ByteArray(self.bytes()?),
        };
        Ok(value)
    }
}
