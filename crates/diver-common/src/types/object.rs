//! Values crossing the controller/agent boundary
//!
//! Primitives travel inline, encoded as text tagged with their runtime type name. Everything
//! else travels by reference.

use crate::error::{Error, Result};
use crate::types::heap::RemoteAddress;
use serde::{Deserialize, Serialize};

/// Exactly one of: null, a type reference, a remote object, or an encoded primitive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectOrRemoteAddress {
    Null,
    Type {
        type_name: String,
        /// Owning module, when the caller knows it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        module: Option<String>,
    },
    Remote {
        address: RemoteAddress,
        /// Last-known type, used to revalidate the address after a collection
        type_name: String,
    },
    Encoded {
        type_name: String,
        encoded: String,
    },
}

impl ObjectOrRemoteAddress {
    pub fn remote(address: RemoteAddress, type_name: impl Into<String>) -> Self {
        Self::Remote {
            address,
            type_name: type_name.into(),
        }
    }

    pub fn type_ref(type_name: impl Into<String>, module: Option<String>) -> Self {
        Self::Type {
            type_name: type_name.into(),
            module,
        }
    }

    pub fn primitive(value: &PrimitiveValue) -> Self {
        Self::Encoded {
            type_name: value.type_name(),
            encoded: value.encode(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Runtime type name carried by this value; `None` for null
    pub fn type_name(&self) -> Option<&str> {
        match self {
            Self::Null => None,
            Self::Type { type_name, .. }
            | Self::Remote { type_name, .. }
            | Self::Encoded { type_name, .. } => Some(type_name),
        }
    }

    /// Decode an inlined primitive
    pub fn to_primitive(&self) -> Result<PrimitiveValue> {
        match self {
            Self::Encoded { type_name, encoded } => PrimitiveValue::decode(type_name, encoded),
            other => Err(Error::Protocol(format!(
                "expected an encoded primitive, got {:?}",
                other
            ))),
        }
    }
}

/// Kinds of value that may be inlined instead of passed by reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    Bool,
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    String,
}

impl PrimitiveKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            PrimitiveKind::Bool => "System.Boolean",
            PrimitiveKind::Char => "System.Char",
            PrimitiveKind::I8 => "System.SByte",
            PrimitiveKind::U8 => "System.Byte",
            PrimitiveKind::I16 => "System.Int16",
            PrimitiveKind::U16 => "System.UInt16",
            PrimitiveKind::I32 => "System.Int32",
            PrimitiveKind::U32 => "System.UInt32",
            PrimitiveKind::I64 => "System.Int64",
            PrimitiveKind::U64 => "System.UInt64",
            PrimitiveKind::F32 => "System.Single",
            PrimitiveKind::F64 => "System.Double",
            PrimitiveKind::String => "System.String",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        let kind = match name {
            "System.Boolean" => PrimitiveKind::Bool,
            "System.Char" => PrimitiveKind::Char,
            "System.SByte" => PrimitiveKind::I8,
            "System.Byte" => PrimitiveKind::U8,
            "System.Int16" => PrimitiveKind::I16,
            "System.UInt16" => PrimitiveKind::U16,
            "System.Int32" => PrimitiveKind::I32,
            "System.UInt32" => PrimitiveKind::U32,
            "System.Int64" => PrimitiveKind::I64,
            "System.UInt64" => PrimitiveKind::U64,
            "System.Single" => PrimitiveKind::F32,
            "System.Double" => PrimitiveKind::F64,
            "System.String" => PrimitiveKind::String,
            _ => return None,
        };
        Some(kind)
    }
}

/// A primitive value, or a one-dimensional array of one primitive kind
#[derive(Debug, Clone, PartialEq)]
pub enum PrimitiveValue {
    Bool(bool),
    Char(char),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Array(PrimitiveKind, Vec<PrimitiveValue>),
}

fn invalid(type_name: &str, message: impl Into<String>) -> Error {
    Error::InvalidPrimitive {
        type_name: type_name.to_string(),
        message: message.into(),
    }
}

fn parse<T: std::str::FromStr>(type_name: &str, text: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    text.parse::<T>()
        .map_err(|e| invalid(type_name, format!("'{}': {}", text, e)))
}

impl PrimitiveValue {
    pub fn kind(&self) -> Option<PrimitiveKind> {
        let kind = match self {
            PrimitiveValue::Bool(_) => PrimitiveKind::Bool,
            PrimitiveValue::Char(_) => PrimitiveKind::Char,
            PrimitiveValue::I8(_) => PrimitiveKind::I8,
            PrimitiveValue::U8(_) => PrimitiveKind::U8,
            PrimitiveValue::I16(_) => PrimitiveKind::I16,
            PrimitiveValue::U16(_) => PrimitiveKind::U16,
            PrimitiveValue::I32(_) => PrimitiveKind::I32,
            PrimitiveValue::U32(_) => PrimitiveKind::U32,
            PrimitiveValue::I64(_) => PrimitiveKind::I64,
            PrimitiveValue::U64(_) => PrimitiveKind::U64,
            PrimitiveValue::F32(_) => PrimitiveKind::F32,
            PrimitiveValue::F64(_) => PrimitiveKind::F64,
            PrimitiveValue::String(_) => PrimitiveKind::String,
            PrimitiveValue::Array(..) => return None,
        };
        Some(kind)
    }

    /// Runtime type name; arrays get a `[]` suffix
    pub fn type_name(&self) -> String {
        match self {
            PrimitiveValue::Array(element, _) => format!("{}[]", element.type_name()),
            scalar => scalar
                .kind()
                .map(|k| k.type_name().to_string())
                .unwrap_or_default(),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            PrimitiveValue::Bool(v) => v.to_string(),
            PrimitiveValue::Char(v) => v.to_string(),
            PrimitiveValue::I8(v) => v.to_string(),
            PrimitiveValue::U8(v) => v.to_string(),
            PrimitiveValue::I16(v) => v.to_string(),
            PrimitiveValue::U16(v) => v.to_string(),
            PrimitiveValue::I32(v) => v.to_string(),
            PrimitiveValue::U32(v) => v.to_string(),
            PrimitiveValue::I64(v) => v.to_string(),
            PrimitiveValue::U64(v) => v.to_string(),
            // Debug formatting keeps enough digits to round-trip
            PrimitiveValue::F32(v) => format!("{:?}", v),
            PrimitiveValue::F64(v) => format!("{:?}", v),
            PrimitiveValue::String(v) => v.clone(),
            PrimitiveValue::Array(_, items) => {
                let encoded: Vec<String> = items.iter().map(|item| item.encode()).collect();
                serde_json::Value::from(encoded).to_string()
            }
        }
    }

    pub fn decode(type_name: &str, encoded: &str) -> Result<Self> {
        if let Some(element) = type_name.strip_suffix("[]") {
            let kind = PrimitiveKind::from_type_name(element)
                .ok_or_else(|| invalid(type_name, "not a primitive array type"))?;
            let items: Vec<String> = serde_json::from_str(encoded)
                .map_err(|e| invalid(type_name, format!("bad array encoding: {}", e)))?;
            let values = items
                .iter()
                .map(|item| Self::decode(element, item))
                .collect::<Result<Vec<_>>>()?;
            return Ok(PrimitiveValue::Array(kind, values));
        }

        let kind = PrimitiveKind::from_type_name(type_name)
            .ok_or_else(|| invalid(type_name, "not a primitive type"))?;
        let value = match kind {
            PrimitiveKind::Bool => PrimitiveValue::Bool(parse(type_name, encoded)?),
            PrimitiveKind::Char => {
                let mut chars = encoded.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => PrimitiveValue::Char(c),
                    _ => return Err(invalid(type_name, "expected exactly one character")),
                }
            }
            PrimitiveKind::I8 => PrimitiveValue::I8(parse(type_name, encoded)?),
            PrimitiveKind::U8 => PrimitiveValue::U8(parse(type_name, encoded)?),
            PrimitiveKind::I16 => PrimitiveValue::I16(parse(type_name, encoded)?),
            PrimitiveKind::U16 => PrimitiveValue::U16(parse(type_name, encoded)?),
            PrimitiveKind::I32 => PrimitiveValue::I32(parse(type_name, encoded)?),
            PrimitiveKind::U32 => PrimitiveValue::U32(parse(type_name, encoded)?),
            PrimitiveKind::I64 => PrimitiveValue::I64(parse(type_name, encoded)?),
            PrimitiveKind::U64 => PrimitiveValue::U64(parse(type_name, encoded)?),
            PrimitiveKind::F32 => PrimitiveValue::F32(parse(type_name, encoded)?),
            PrimitiveKind::F64 => PrimitiveValue::F64(parse(type_name, encoded)?),
            PrimitiveKind::String => PrimitiveValue::String(encoded.to_string()),
        };
        Ok(value)
    }
}
