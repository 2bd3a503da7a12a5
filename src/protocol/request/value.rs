//! A request-bound value: already-encoded bytes plus the null/unset
//! sentinel (§4.1, `bytes`). Turning a typed value into these bytes is the
//! external `Encoder` collaborator's job (§6) — this layer only carries
//! and serializes the result.

use bytes::Bytes;

use crate::protocol::primitive::{write_bytes, BytesValue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Unset,
    Bytes(Bytes),
}

impl Value {
    pub fn write(&self, out: &mut Vec<u8>) {
        let as_write_value = match self {
            Value::Null => BytesValue::Null,
            Value::Unset => BytesValue::Unset,
            Value::Bytes(bytes) => BytesValue::Value(bytes),
        };
        write_bytes(out, as_write_value);
    }
}

/// Positional or named bound values — `WITH_NAMES_FOR_VALUES` switches the
/// wire representation from a bare count+value list to count+(name,value)
/// pairs (§4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundValues {
    Positional(Vec<Value>),
    Named(Vec<(String, Value)>),
}

impl BoundValues {
    pub fn is_empty(&self) -> bool {
        match self {
            BoundValues::Positional(v) => v.is_empty(),
            BoundValues::Named(v) => v.is_empty(),
        }
    }

    pub fn has_names(&self) -> bool {
        matches!(self, BoundValues::Named(_))
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        use crate::protocol::primitive::{write_short, write_string};
        match self {
            BoundValues::Positional(values) => {
                write_short(out, values.len() as u16);
                for value in values {
                    value.write(out);
                }
            }
            BoundValues::Named(values) => {
                write_short(out, values.len() as u16);
                for (name, value) in values {
                    write_string(out, name);
                    value.write(out);
                }
            }
        }
    }
}
