//! # Value Tree
//!
//! Self-describing data model for everything that crosses the wire: request
//! arguments, reply payloads and notice bodies. The primitive set covers
//! null, booleans, integers, floats, strings, binary blobs, ordered lists and
//! string-keyed maps. Three tagged records extend it:
//!
//! - [`Value::ObjectRef`] carries a proxy descriptor so remote handles travel
//!   by identity instead of by copy
//! - [`Value::Opaque`] is the fallback for typed data outside the primitive
//!   set; it is purely value-copying and survives any number of round trips
//! - [`Value::Array`] is the packed numeric array representation negotiated
//!   by the array-aware serializer
//!
//! Frames embed values directly, so the enum layout is part of the wire
//! contract between peers sharing a library version.

use crate::proxy::ProxyDescriptor;
use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::wire::CmpOp;

/// A tree of wire-transportable data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Reference to an object owned by some server. Decoding resolves it to
    /// the owned value in its home process and to a proxy everywhere else.
    ObjectRef(ProxyDescriptor),
    /// Typed data outside the primitive set, preserved byte-for-byte.
    Opaque { type_name: String, bytes: Vec<u8> },
    /// Packed numeric array produced by the array-aware serializer.
    Array(PackedArray),
}

/// Element type of a packed array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    Bool,
    U8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl Dtype {
    /// Size of one element in bytes.
    pub fn elem_size(&self) -> usize {
        match self {
            Dtype::Bool | Dtype::U8 => 1,
            Dtype::I16 => 2,
            Dtype::I32 | Dtype::F32 => 4,
            Dtype::I64 | Dtype::F64 => 8,
        }
    }
}

/// Compact representation of an n-dimensional numeric array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedArray {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    /// Byte strides per dimension; empty means C-contiguous.
    pub strides: Vec<isize>,
    pub bytes: Vec<u8>,
}

impl PackedArray {
    /// Build a C-contiguous array, validating that the byte length matches
    /// the shape.
    pub fn contiguous(dtype: Dtype, shape: Vec<usize>, bytes: Vec<u8>) -> Result<Self> {
        let expected: usize = shape.iter().product::<usize>() * dtype.elem_size();
        if bytes.len() != expected {
            return Err(anyhow!(
                "array byte length {} does not match shape {:?} of {:?}",
                bytes.len(),
                shape,
                dtype
            ));
        }
        Ok(Self {
            dtype,
            shape,
            strides: Vec::new(),
            bytes,
        })
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }
}

impl Value {
    /// Short name of the variant, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::ObjectRef(_) => "object-ref",
            Value::Opaque { .. } => "opaque",
            Value::Array(_) => "array",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view; integers widen to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object_ref(&self) -> Option<&ProxyDescriptor> {
        match self {
            Value::ObjectRef(desc) => Some(desc),
            _ => None,
        }
    }

    /// Wrap typed data as an opaque blob.
    ///
    /// The blob round-trips byte-for-byte; the receiving side recovers the
    /// original with [`Value::opaque_as`] when it knows the type.
    pub fn opaque_from<T: Serialize>(type_name: &str, value: &T) -> Result<Value> {
        let bytes = bincode::serialize(value)
            .with_context(|| format!("encoding opaque value of type {type_name}"))?;
        Ok(Value::Opaque {
            type_name: type_name.to_string(),
            bytes,
        })
    }

    /// Best-effort typed extraction from an opaque blob.
    pub fn opaque_as<T: DeserializeOwned>(&self) -> Option<T> {
        match self {
            Value::Opaque { bytes, .. } => bincode::deserialize(bytes).ok(),
            _ => None,
        }
    }

    /// Container lookup by key: string keys index maps, integer keys index
    /// lists.
    pub fn item(&self, key: &Value) -> Option<&Value> {
        match (self, key) {
            (Value::Map(map), Value::Str(k)) => map.get(k),
            (Value::List(items), Value::Int(i)) if *i >= 0 => items.get(*i as usize),
            _ => None,
        }
    }

    /// Length of a sized value.
    pub fn len_of(&self) -> Option<usize> {
        match self {
            Value::Str(s) => Some(s.chars().count()),
            Value::Bytes(b) => Some(b.len()),
            Value::List(items) => Some(items.len()),
            Value::Map(map) => Some(map.len()),
            Value::Array(arr) => Some(arr.elem_count()),
            _ => None,
        }
    }

    /// Whether any node in this tree is an object reference.
    pub fn contains_object_ref(&self) -> bool {
        match self {
            Value::ObjectRef(_) => true,
            Value::List(items) => items.iter().any(Value::contains_object_ref),
            Value::Map(map) => map.values().any(Value::contains_object_ref),
            _ => false,
        }
    }

    /// Structural comparison between two values.
    ///
    /// Equality is defined for every pair of variants; ordering only for
    /// numbers, strings and byte strings. `None` means the comparison is not
    /// defined for the operand types.
    pub fn compare(&self, op: CmpOp, other: &Value) -> Option<bool> {
        use std::cmp::Ordering;

        match op {
            CmpOp::Eq => return Some(self.loose_eq(other)),
            CmpOp::Ne => return Some(!self.loose_eq(other)),
            _ => {}
        }

        let ordering: Ordering = match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (a, b) => {
                let (x, y) = (a.as_f64()?, b.as_f64()?);
                x.partial_cmp(&y)?
            }
        };

        Some(match op {
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::Le => ordering != Ordering::Greater,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Ge => ordering != Ordering::Less,
            CmpOp::Eq | CmpOp::Ne => unreachable!(),
        })
    }

    /// Equality with numeric widening, so `Int(1)` equals `Float(1.0)`.
    fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (a, b) => a == b,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl From<ProxyDescriptor> for Value {
    fn from(desc: ProxyDescriptor) -> Self {
        Value::ObjectRef(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), Value::from("objlink"));
        map.insert("count".to_string(), Value::Int(3));
        let original = Value::List(vec![
            Value::Null,
            Value::Bool(true),
            Value::Float(2.5),
            Value::Bytes(vec![1, 2, 3]),
            Value::Map(map),
        ]);

        let bytes = bincode::serialize(&original).unwrap();
        let decoded: Value = bincode::deserialize(&bytes).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn opaque_round_trip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Sensor {
            id: u32,
            reading: f64,
        }

        let sensor = Sensor {
            id: 7,
            reading: 21.5,
        };
        let value = Value::opaque_from("Sensor", &sensor).unwrap();

        // A second round trip through the wire format must not disturb the
        // blob.
        let bytes = bincode::serialize(&value).unwrap();
        let decoded: Value = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.opaque_as::<Sensor>(), Some(sensor));
    }

    #[test]
    fn item_lookup() {
        let mut inner = BTreeMap::new();
        inner.insert("k2".to_string(), Value::Int(99));
        let mut outer = BTreeMap::new();
        outer.insert("k".to_string(), Value::Map(inner));
        let value = Value::Map(outer);

        let level1 = value.item(&Value::from("k")).unwrap();
        assert_eq!(level1.item(&Value::from("k2")), Some(&Value::Int(99)));

        let list = Value::List(vec![Value::Int(10), Value::Int(20)]);
        assert_eq!(list.item(&Value::Int(1)), Some(&Value::Int(20)));
        assert_eq!(list.item(&Value::Int(5)), None);
    }

    #[test]
    fn comparisons() {
        assert_eq!(
            Value::Int(1).compare(CmpOp::Eq, &Value::Float(1.0)),
            Some(true)
        );
        assert_eq!(
            Value::Int(2).compare(CmpOp::Lt, &Value::Int(3)),
            Some(true)
        );
        assert_eq!(
            Value::from("abc").compare(CmpOp::Ge, &Value::from("abd")),
            Some(false)
        );
        assert_eq!(Value::Null.compare(CmpOp::Lt, &Value::Int(1)), None);
        assert_eq!(
            Value::Null.compare(CmpOp::Ne, &Value::Int(1)),
            Some(true)
        );
    }

    #[test]
    fn packed_array_validates_length() {
        let ok = PackedArray::contiguous(Dtype::I32, vec![2, 3], vec![0u8; 24]);
        assert!(ok.is_ok());
        assert_eq!(ok.unwrap().elem_count(), 6);

        let bad = PackedArray::contiguous(Dtype::F64, vec![4], vec![0u8; 7]);
        assert!(bad.is_err());
    }
}
