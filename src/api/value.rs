//! Type-directed decoding of property values.
//!
//! The gateway ships every value as untyped JSON next to a type tag.
//! [`decode`] is the one place where raw bytes become a [`PropertyValue`].

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::ser::Error as _;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;

use super::types::ValueType;
use super::CodecError;

pub const DURATION_SECONDS: &str = "seconds";
pub const DURATION_MINUTES: &str = "minutes";
const DURATION_DEFAULT: &str = "default";

/// A decoded property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Integer(i64),
    Boolean(bool),
    /// `string` and `color` values.
    Text(String),
    IntegerList(Vec<i64>),
    BooleanList(Vec<bool>),
    TextList(Vec<String>),
    /// Only ever one second, one minute or zero.
    Duration(Duration),
    /// Raw JSON of an `any` value, untouched.
    Opaque(String),
}

#[derive(Deserialize, Default)]
struct DurationUnit {
    #[serde(default)]
    unit: Option<String>,
}

/// Decodes `raw` according to `value_type`.
///
/// Numeric, boolean and list types treat an absent or `null` value as their
/// zero value. Strings and durations must be present.
pub fn decode(value_type: &ValueType, raw: Option<&RawValue>) -> Result<PropertyValue, CodecError> {
    let mismatch = |reason: String| CodecError::TypeMismatch {
        value_type: value_type.to_string(),
        reason,
    };

    match value_type {
        ValueType::Number => or_zero(raw)
            .map(PropertyValue::Integer)
            .map_err(|e| mismatch(e.to_string())),
        ValueType::Boolean => or_zero(raw)
            .map(PropertyValue::Boolean)
            .map_err(|e| mismatch(e.to_string())),
        ValueType::String | ValueType::Color => {
            let raw = raw.ok_or_else(|| mismatch("missing string value".to_string()))?;
            serde_json::from_str::<String>(raw.get())
                .map(PropertyValue::Text)
                .map_err(|e| mismatch(e.to_string()))
        }
        ValueType::NumberList => or_zero(raw)
            .map(PropertyValue::IntegerList)
            .map_err(|e| mismatch(e.to_string())),
        ValueType::BooleanList => or_zero(raw)
            .map(PropertyValue::BooleanList)
            .map_err(|e| mismatch(e.to_string())),
        ValueType::StringList => or_zero(raw)
            .map(PropertyValue::TextList)
            .map_err(|e| mismatch(e.to_string())),
        ValueType::Duration => {
            let raw = raw.ok_or_else(|| mismatch("missing duration value".to_string()))?;
            let unit = serde_json::from_str::<Option<DurationUnit>>(raw.get())
                .map_err(|e| mismatch(e.to_string()))?
                .unwrap_or_default();
            let duration = match unit.unit.as_deref() {
                Some(DURATION_SECONDS) => Duration::from_secs(1),
                Some(DURATION_MINUTES) => Duration::from_secs(60),
                _ => Duration::ZERO,
            };
            Ok(PropertyValue::Duration(duration))
        }
        ValueType::Any => Ok(PropertyValue::Opaque(
            raw.map(|r| r.get().to_string())
                .unwrap_or_else(|| "null".to_string()),
        )),
        ValueType::Unknown(tag) => Err(CodecError::UnknownType(tag.clone())),
    }
}

fn or_zero<T: DeserializeOwned + Default>(raw: Option<&RawValue>) -> Result<T, serde_json::Error> {
    match raw {
        None => Ok(T::default()),
        Some(raw) => Ok(serde_json::from_str::<Option<T>>(raw.get())?.unwrap_or_default()),
    }
}

impl PropertyValue {
    /// Encodes the value back into the gateway's JSON form.
    pub fn to_raw(&self) -> Result<Box<RawValue>, serde_json::Error> {
        match self {
            PropertyValue::Opaque(raw) => RawValue::from_string(raw.clone()),
            other => serde_json::value::to_raw_value(other),
        }
    }
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PropertyValue::Integer(v) => v.serialize(serializer),
            PropertyValue::Boolean(v) => v.serialize(serializer),
            PropertyValue::Text(v) => v.serialize(serializer),
            PropertyValue::IntegerList(v) => v.serialize(serializer),
            PropertyValue::BooleanList(v) => v.serialize(serializer),
            PropertyValue::TextList(v) => v.serialize(serializer),
            PropertyValue::Duration(d) => {
                let unit = match d.as_secs() {
                    1 => DURATION_SECONDS,
                    60 => DURATION_MINUTES,
                    _ => DURATION_DEFAULT,
                };
                serde_json::json!({ "unit": unit }).serialize(serializer)
            }
            PropertyValue::Opaque(raw) => RawValue::from_string(raw.clone())
                .map_err(S::Error::custom)?
                .serialize(serializer),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Integer(v) => write!(f, "{}", v),
            PropertyValue::Boolean(v) => write!(f, "{}", v),
            PropertyValue::Text(v) => write!(f, "{}", v),
            PropertyValue::IntegerList(v) => write!(f, "{:?}", v),
            PropertyValue::BooleanList(v) => write!(f, "{:?}", v),
            PropertyValue::TextList(v) => write!(f, "{:?}", v),
            PropertyValue::Duration(d) => write!(f, "{}s", d.as_secs()),
            PropertyValue::Opaque(raw) => f.write_str(raw),
        }
    }
}
