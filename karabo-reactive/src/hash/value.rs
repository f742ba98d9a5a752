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

use super::{Hash, Schema};

/// Numeric code identifying the type of a value on the wire.
///
/// The numbering is shared with every other implementation speaking the
/// binary Hash format and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TypeCode {
    /// `bool`
    Bool = 0,
    /// `Vec<bool>`
    VectorBool = 1,
    /// A single byte character.
    Char = 2,
    /// A byte string.
    VectorChar = 3,
    /// `i8`
    Int8 = 4,
    /// `Vec<i8>`
    VectorInt8 = 5,
    /// `u8`
    UInt8 = 6,
    /// `Vec<u8>`
    VectorUInt8 = 7,
    /// `i16`
    Int16 = 8,
    /// `Vec<i16>`
    VectorInt16 = 9,
    /// `u16`
    UInt16 = 10,
    /// `Vec<u16>`
    VectorUInt16 = 11,
    /// `i32`
    Int32 = 12,
    /// `Vec<i32>`
    VectorInt32 = 13,
    /// `u32`
    UInt32 = 14,
    /// `Vec<u32>`
    VectorUInt32 = 15,
    /// `i64`
    Int64 = 16,
    /// `Vec<i64>`
    VectorInt64 = 17,
    /// `u64`
    UInt64 = 18,
    /// `Vec<u64>`
    VectorUInt64 = 19,
    /// `f32`
    Float = 20,
    /// `Vec<f32>`
    VectorFloat = 21,
    /// `f64`
    Double = 22,
    /// `Vec<f64>`
    VectorDouble = 23,
    /// Complex number of two `f32`.
    ComplexFloat = 24,
    /// Vector of complex `f32` numbers.
    VectorComplexFloat = 25,
    /// Complex number of two `f64`.
    ComplexDouble = 26,
    /// Vector of complex `f64` numbers.
    VectorComplexDouble = 27,
    /// UTF-8 string.
    String = 28,
    /// Vector of strings.
    VectorString = 29,
    /// Nested [`Hash`].
    Hash = 30,
    /// Vector of [`Hash`]es.
    VectorHash = 31,
    /// A [`Schema`].
    Schema = 32,
    /// The absence of a value.
    None = 35,
    /// Raw bytes.
    ByteArray = 37,
}

impl TypeCode {
    /// Maps a wire number back to its type, if it is known.
    pub fn from_u32(code: u32) -> Option<Self> {
        use TypeCode::*;
        let ty = match code {
            0 => Bool,
            1 => VectorBool,
            2 => Char,
            3 => VectorChar,
            4 => Int8,
            5 => VectorInt8,
            6 => UInt8,
            7 => VectorUInt8,
            8 => Int16,
            9 => VectorInt16,
            10 => UInt16,
            11 => VectorUInt16,
            12 => Int32,
            13 => VectorInt32,
            14 => UInt32,
            15 => VectorUInt32,
            16 => Int64,
            17 => VectorInt64,
            18 => UInt64,
            19 => VectorUInt64,
            20 => Float,
            21 => VectorFloat,
            22 => Double,
            23 => VectorDouble,
            24 => ComplexFloat,
            25 => VectorComplexFloat,
            26 => ComplexDouble,
            27 => VectorComplexDouble,
            28 => String,
            29 => VectorString,
            30 => Hash,
            31 => VectorHash,
            32 => Schema,
            35 => None,
            37 => ByteArray,
            _ => return Option::None,
        };
        Some(ty)
    }

    /// The name used in schemas for the `valueType` attribute.
    pub fn name(self) -> &'static str {
        use TypeCode::*;
        match self {
            Bool => "BOOL",
            VectorBool => "VECTOR_BOOL",
            Char => "CHAR",
            VectorChar => "VECTOR_CHAR",
            Int8 => "INT8",
            VectorInt8 => "VECTOR_INT8",
            UInt8 => "UINT8",
            VectorUInt8 => "VECTOR_UINT8",
            Int16 => "INT16",
            VectorInt16 => "VECTOR_INT16",
            UInt16 => "UINT16",
            VectorUInt16 => "VECTOR_UINT16",
            Int32 => "INT32",
            VectorInt32 => "VECTOR_INT32",
            UInt32 => "UINT32",
            VectorUInt32 => "VECTOR_UINT32",
            Int64 => "INT64",
            VectorInt64 => "VECTOR_INT64",
            UInt64 => "UINT64",
            VectorUInt64 => "VECTOR_UINT64",
            Float => "FLOAT",
            VectorFloat => "VECTOR_FLOAT",
            Double => "DOUBLE",
            VectorDouble => "VECTOR_DOUBLE",
            ComplexFloat => "COMPLEX_FLOAT",
            VectorComplexFloat => "VECTOR_COMPLEX_FLOAT",
            ComplexDouble => "COMPLEX_DOUBLE",
            VectorComplexDouble => "VECTOR_COMPLEX_DOUBLE",
            String => "STRING",
            VectorString => "VECTOR_STRING",
            Hash => "HASH",
            VectorHash => "VECTOR_HASH",
            Schema => "SCHEMA",
            None => "NONE",
            ByteArray => "BYTE_ARRAY",
        }
    }

    /// Inverse of [`TypeCode::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        (0..=37).filter_map(Self::from_u32).find(|ty| ty.name() == name)
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed value stored in a [`Hash`] node or attribute.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum HashValue {
    Bool(bool),
    VectorBool(Vec<bool>),
    Char(u8),
    VectorChar(Vec<u8>),
    Int8(i8),
    VectorInt8(Vec<i8>),
    UInt8(u8),
    VectorUInt8(Vec<u8>),
    Int16(i16),
    VectorInt16(Vec<i16>),
    UInt16(u16),
    VectorUInt16(Vec<u16>),
    Int32(i32),
    VectorInt32(Vec<i32>),
    UInt32(u32),
    VectorUInt32(Vec<u32>),
    Int64(i64),
    VectorInt64(Vec<i64>),
    UInt64(u64),
    VectorUInt64(Vec<u64>),
    Float(f32),
    VectorFloat(Vec<f32>),
    Double(f64),
    VectorDouble(Vec<f64>),
    /// Real and imaginary part.
    ComplexFloat((f32, f32)),
    VectorComplexFloat(Vec<(f32, f32)>),
    /// Real and imaginary part.
    ComplexDouble((f64, f64)),
    VectorComplexDouble(Vec<(f64, f64)>),
    String(String),
    VectorString(Vec<String>),
    Hash(Hash),
    VectorHash(Vec<Hash>),
    Schema(Schema),
    None,
    ByteArray(Vec<u8>),
}

impl HashValue {
    /// The wire type of this value.
    pub fn type_code(&self) -> TypeCode {
        match self {
            Self::Bool(_) => TypeCode::Bool,
            Self::VectorBool(_) => TypeCode::VectorBool,
            Self::Char(_) => TypeCode::Char,
            Self::VectorChar(_) => TypeCode::VectorChar,
            Self::Int8(_) => TypeCode::Int8,
            Self::VectorInt8(_) => TypeCode::VectorInt8,
            Self::UInt8(_) => TypeCode::UInt8,
            Self::VectorUInt8(_) => TypeCode::VectorUInt8,
            Self::Int16(_) => TypeCode::Int16,
            Self::VectorInt16(_) => TypeCode::VectorInt16,
            Self::UInt16(_) => TypeCode::UInt16,
            Self::VectorUInt16(_) => TypeCode::VectorUInt16,
            Self::Int32(_) => TypeCode::Int32,
            Self::VectorInt32(_) => TypeCode::VectorInt32,
            Self::UInt32(_) => TypeCode::UInt32,
            Self::VectorUInt32(_) => TypeCode::VectorUInt32,
            Self::Int64(_) => TypeCode::Int64,
            Self::VectorInt64(_) => TypeCode::VectorInt64,
            Self::UInt64(_) => TypeCode::UInt64,
            Self::VectorUInt64(_) => TypeCode::VectorUInt64,
            Self::Float(_) => TypeCode::Float,
            Self::VectorFloat(_) => TypeCode::VectorFloat,
            Self::Double(_) => TypeCode::Double,
            Self::VectorDouble(_) => TypeCode::VectorDouble,
            Self::ComplexFloat(_) => TypeCode::ComplexFloat,
            Self::VectorComplexFloat(_) => TypeCode::VectorComplexFloat,
            Self::ComplexDouble(_) => TypeCode::ComplexDouble,
            Self::VectorComplexDouble(_) => TypeCode::VectorComplexDouble,
            Self::String(_) => TypeCode::String,
            Self::VectorString(_) => TypeCode::VectorString,
            Self::Hash(_) => TypeCode::Hash,
            Self::VectorHash(_) => TypeCode::VectorHash,
            Self::Schema(_) => TypeCode::Schema,
            Self::None => TypeCode::None,
            Self::ByteArray(_) => TypeCode::ByteArray,
        }
    }

    /// Whether this value may be stored as an attribute.
    pub fn is_attribute_compatible(&self) -> bool {
        !matches!(self, Self::Hash(_) | Self::VectorHash(_) | Self::Schema(_))
    }

    /// Returns `true` for [`HashValue::None`].
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Returns the boolean, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the string slice, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Any integer scalar widened to `i64`. Unsigned values above `i64::MAX` yield `None`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Char(v) | Self::UInt8(v) => Some(i64::from(v)),
            Self::Int8(v) => Some(i64::from(v)),
            Self::Int16(v) => Some(i64::from(v)),
            Self::UInt16(v) => Some(i64::from(v)),
            Self::Int32(v) => Some(i64::from(v)),
            Self::UInt32(v) => Some(i64::from(v)),
            Self::Int64(v) => Some(v),
            Self::UInt64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Any non-negative integer scalar widened to `u64`.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::UInt64(v) => Some(v),
            _ => self.as_i64().and_then(|v| u64::try_from(v).ok()),
        }
    }

    /// Any numeric scalar as `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Float(v) => Some(f64::from(v)),
            Self::Double(v) => Some(v),
            #[allow(clippy::cast_precision_loss)]
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    /// Returns the nested Hash, if this is one.
    pub fn as_hash(&self) -> Option<&Hash> {
        match self {
            Self::Hash(h) => Some(h),
            _ => None,
        }
    }

    /// Mutable access to a nested Hash.
    pub fn as_hash_mut(&mut self) -> Option<&mut Hash> {
        match self {
            Self::Hash(h) => Some(h),
            _ => None,
        }
    }

    /// Returns the vector of Hashes, if this is one.
    pub fn as_vec_hash(&self) -> Option<&[Hash]> {
        match self {
            Self::VectorHash(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the vector of strings, if this is one.
    pub fn as_vec_string(&self) -> Option<&[String]> {
        match self {
            Self::VectorString(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the vector of `u32`, if this is one.
    pub fn as_vec_u32(&self) -> Option<&[u32]> {
        match self {
            Self::VectorUInt32(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the schema, if this is one.
    pub fn as_schema(&self) -> Option<&Schema> {
        match self {
            Self::Schema(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the raw bytes of a `ByteArray` or `VectorChar`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::ByteArray(b) | Self::VectorChar(b) => Some(b),
            _ => None,
        }
    }
}

impl Default for HashValue {
    fn default() -> Self {
        Self::None
    }
}

impl fmt::Display for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Char(v) => write!(f, "{}", char::from(*v)),
            Self::Int8(v) => write!(f, "{v}"),
            Self::UInt8(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::UInt16(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::UInt32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
            Self::VectorString(v) => write!(f, "{}", v.join(",")),
            Self::None => f.write_str(""),
            Self::Schema(s) => write!(f, "Schema({})", s.name()),
            other => write!(f, "{other:?}"),
        }
    }
}

macro_rules! impl_from_scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for HashValue {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

impl_from_scalar! {
    bool => Bool,
    Vec<bool> => VectorBool,
    i8 => Int8,
    Vec<i8> => VectorInt8,
    u8 => UInt8,
    Vec<u8> => VectorUInt8,
    i16 => Int16,
    Vec<i16> => VectorInt16,
    u16 => UInt16,
    Vec<u16> => VectorUInt16,
    i32 => Int32,
    Vec<i32> => VectorInt32,
    u32 => UInt32,
    Vec<u32> => VectorUInt32,
    i64 => Int64,
    Vec<i64> => VectorInt64,
    u64 => UInt64,
    Vec<u64> => VectorUInt64,
    f32 => Float,
    Vec<f32> => VectorFloat,
    f64 => Double,
    Vec<f64> => VectorDouble,
    String => String,
    Vec<String> => VectorString,
    Hash => Hash,
    Vec<Hash> => VectorHash,
    Schema => Schema,
}

impl From<&str> for HashValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<&String> for HashValue {
    fn from(v: &String) -> Self {
        Self::String(v.clone())
    }
}

impl From<Vec<&str>> for HashValue {
    fn from(v: Vec<&str>) -> Self {
        Self::VectorString(v.into_iter().map(str::to_string).collect())
    }
}

impl From<()> for HashValue {
    fn from((): ()) -> Self {
        Self::None
    }
}

impl<T: Into<HashValue>> From<Option<T>> for HashValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::None, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes_round_trip_through_numbers_and_names() {
        for code in 0..40 {
            if let Some(ty) = TypeCode::from_u32(code) {
                assert_eq!(ty as u32, code);
                assert_eq!(TypeCode::from_name(ty.name()), Some(ty));
            }
        }
        assert_eq!(TypeCode::from_u32(33), None);
        assert_eq!(TypeCode::from_u32(36), None);
    }

    #[test]
    fn numeric_accessors_widen() {
        assert_eq!(HashValue::UInt16(7).as_i64(), Some(7));
        assert_eq!(HashValue::Int32(-3).as_u64(), None);
        assert_eq!(HashValue::UInt64(u64::MAX).as_i64(), None);
        assert_eq!(HashValue::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(HashValue::from("x").as_i64(), None);
    }

    #[test]
    fn attributes_reject_containers() {
        assert!(HashValue::Int32(1).is_attribute_compatible());
        assert!(!HashValue::Hash(Hash::new()).is_attribute_compatible());
        assert!(!HashValue::VectorHash(vec![]).is_attribute_compatible());
    }
}
