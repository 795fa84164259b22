//! Records of the gateway's JSON API.
//!
//! Field names follow the gateway's camelCase wire layout. Every field is
//! optional on the wire; absent fields take their `Default`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;

use super::value::{self, PropertyValue};
use super::CodecError;

pub const TYPE_NUMBER: &str = "number";
pub const TYPE_BOOL: &str = "boolean";
pub const TYPE_STRING: &str = "string";
pub const TYPE_LIST_NUMBER: &str = "number[]";
pub const TYPE_LIST_BOOL: &str = "boolean[]";
pub const TYPE_LIST_STRING: &str = "string[]";
pub const TYPE_DURATION: &str = "duration";
pub const TYPE_COLOR: &str = "color";
pub const TYPE_ANY: &str = "any";

/// A device as reported by the gateway's directory listing.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Node {
    pub id: u32,
    pub name: String,
    pub loc: String,
    pub manufacturer: String,
    pub product_label: String,
    pub product_description: String,
    pub ready: bool,
    pub available: bool,
    pub failed: bool,
    pub status: String,
    /// Properties keyed by their opaque id (`"38-0-currentValue"`).
    pub values: BTreeMap<String, Value>,
}

/// A single addressable property of a [`Node`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Value {
    pub id: String,
    pub node_id: u32,
    pub command_class: u32,
    pub command_class_name: String,
    pub endpoint: u32,
    #[serde(deserialize_with = "string_or_int")]
    pub property: String,
    pub property_name: String,
    #[serde(
        deserialize_with = "opt_string_or_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub property_key: Option<String>,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub readable: bool,
    pub writeable: bool,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    pub list: bool,
    #[serde(rename = "value", skip_serializing_if = "Option::is_none")]
    pub raw: Option<Box<RawValue>>,
}

impl Value {
    /// Decodes the raw `value` field according to the declared type.
    pub fn decode(&self) -> Result<PropertyValue, CodecError> {
        value::decode(&self.value_type, self.raw.as_deref())
    }

    /// Composite identifier used to address this property in requests.
    pub fn value_id(&self, node_id: u32) -> ValueId {
        ValueId {
            node_id,
            command_class: self.command_class,
            endpoint: self.endpoint,
            property: self.property.clone(),
        }
    }
}

/// Declared type of a property value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ValueType {
    Number,
    Boolean,
    String,
    Color,
    Duration,
    Any,
    NumberList,
    BooleanList,
    StringList,
    Unknown(String),
}

impl Default for ValueType {
    fn default() -> Self {
        ValueType::Unknown(String::new())
    }
}

impl From<String> for ValueType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            TYPE_NUMBER => ValueType::Number,
            TYPE_BOOL => ValueType::Boolean,
            TYPE_STRING => ValueType::String,
            TYPE_COLOR => ValueType::Color,
            TYPE_DURATION => ValueType::Duration,
            TYPE_ANY => ValueType::Any,
            TYPE_LIST_NUMBER => ValueType::NumberList,
            TYPE_LIST_BOOL => ValueType::BooleanList,
            TYPE_LIST_STRING => ValueType::StringList,
            _ => ValueType::Unknown(tag),
        }
    }
}

impl From<ValueType> for String {
    fn from(value_type: ValueType) -> Self {
        value_type.as_str().to_string()
    }
}

impl ValueType {
    pub fn as_str(&self) -> &str {
        match self {
            ValueType::Number => TYPE_NUMBER,
            ValueType::Boolean => TYPE_BOOL,
            ValueType::String => TYPE_STRING,
            ValueType::Color => TYPE_COLOR,
            ValueType::Duration => TYPE_DURATION,
            ValueType::Any => TYPE_ANY,
            ValueType::NumberList => TYPE_LIST_NUMBER,
            ValueType::BooleanList => TYPE_LIST_BOOL,
            ValueType::StringList => TYPE_LIST_STRING,
            ValueType::Unknown(tag) => tag,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite property identifier: the routing key for writes and watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueId {
    pub node_id: u32,
    pub command_class: u32,
    pub endpoint: u32,
    #[serde(deserialize_with = "string_or_int")]
    pub property: String,
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}-{}",
            self.node_id, self.command_class, self.endpoint, self.property
        )
    }
}

/// Delta descriptor of a change notification.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValueDelta {
    pub command_class: u32,
    pub endpoint: u32,
    #[serde(deserialize_with = "string_or_int")]
    pub property: String,
    #[serde(deserialize_with = "opt_string_or_int")]
    pub property_key: Option<String>,
    pub new_value: Option<Box<RawValue>>,
    pub prev_value: Option<Box<RawValue>>,
}

impl ValueDelta {
    /// Opaque property id this delta refers to inside the node snapshot.
    pub fn value_key(&self) -> String {
        let mut id = format!("{}-{}-{}", self.command_class, self.endpoint, self.property);
        if let Some(key) = &self.property_key {
            id.push('-');
            id.push_str(key);
        }
        id
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrInt {
    Str(String),
    Int(i64),
}

impl StringOrInt {
    fn into_string(self) -> String {
        match self {
            StringOrInt::Str(s) => s,
            StringOrInt::Int(i) => i.to_string(),
        }
    }
}

fn string_or_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Option::<StringOrInt>::deserialize(deserializer)?;
    Ok(value.map(StringOrInt::into_string).unwrap_or_default())
}

fn opt_string_or_int<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let value = Option::<StringOrInt>::deserialize(deserializer)?;
    Ok(value
        .map(StringOrInt::into_string)
        .filter(|key| !key.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_accepts_string_or_integer() {
        let named: Value =
            serde_json::from_str(r#"{"commandClass":38,"property":"currentValue"}"#).unwrap();
        assert_eq!(named.property, "currentValue");

        let numbered: Value = serde_json::from_str(r#"{"commandClass":112,"property":7}"#).unwrap();
        assert_eq!(numbered.property, "7");
    }

    #[test]
    fn empty_property_key_is_none() {
        let delta: ValueDelta =
            serde_json::from_str(r#"{"commandClass":50,"endpoint":0,"property":"value","propertyKey":""}"#)
                .unwrap();
        assert_eq!(delta.property_key, None);
        assert_eq!(delta.value_key(), "50-0-value");

        let keyed: ValueDelta =
            serde_json::from_str(r#"{"commandClass":50,"endpoint":0,"property":"value","propertyKey":66049}"#)
                .unwrap();
        assert_eq!(keyed.value_key(), "50-0-value-66049");
    }

    #[test]
    fn unknown_type_tag_is_preserved() {
        let value: Value = serde_json::from_str(r#"{"type":"buffer"}"#).unwrap();
        assert_eq!(value.value_type, ValueType::Unknown("buffer".to_string()));
        assert_eq!(value.value_type.to_string(), "buffer");
    }

    #[test]
    fn value_id_serializes_camel_case() {
        let id = ValueId {
            node_id: 4,
            command_class: 38,
            endpoint: 0,
            property: "currentValue".to_string(),
        };
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"nodeId":4,"commandClass":38,"endpoint":0,"property":"currentValue"})
        );
    }
}
