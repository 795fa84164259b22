//! # Gateway API codec
//!
//! Typed views of the JSON envelopes exchanged with the Z-Wave gateway over
//! MQTT. Everything here is pure: bytes in, records out (and back).
//!
//! ```text
//! api/
//! ├── types.rs  - Node, Value, ValueId and the change delta
//! └── value.rs  - type-directed decoding into PropertyValue
//! ```
//!
//! ## Envelopes
//!
//! | Direction | Envelope                | Shape                                   |
//! |-----------|-------------------------|-----------------------------------------|
//! | out       | directory request       | empty payload                           |
//! | out       | write request           | `{"args": [ValueId, value]}`            |
//! | in        | directory response      | `{"success", "message", "result": [..]}`|
//! | in        | write acknowledgement   | `{"success", "message", "args": [id, v]}` |
//! | in        | change notification     | `{"data": [Node, ValueDelta]}`          |

pub mod types;
pub mod value;

pub use types::{Node, Value, ValueDelta, ValueId, ValueType};
pub use value::PropertyValue;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

// The gateway documents these under <prefix>/_CLIENTS/ZWAVE_GATEWAY-<name>/api/...
// but answers without the <name> suffix as well.
pub const TOPIC_GET_NODES_REQ: &str = "_CLIENTS/ZWAVE_GATEWAY/api/getNodes/set";
pub const TOPIC_GET_NODES_RESP: &str = "_CLIENTS/ZWAVE_GATEWAY/api/getNodes";
pub const TOPIC_WRITE_VALUE_REQ: &str = "_CLIENTS/ZWAVE_GATEWAY/api/writeValue/set";
pub const TOPIC_WRITE_VALUE_RESP: &str = "_CLIENTS/ZWAVE_GATEWAY/api/writeValue";
pub const TOPIC_NODE_VALUE_UPDATED: &str = "_EVENTS/+/node/node_value_updated";

/// Errors raised while decoding or encoding gateway envelopes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Envelope field `{field}` has {found} elements; expected {expected}")]
    Arity {
        field: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Unknown value type {0:?}")]
    UnknownType(String),

    #[error("Cannot decode value of type {value_type:?}: {reason}")]
    TypeMismatch { value_type: String, reason: String },
}

/// Response to the directory request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GetNodesResponse {
    pub success: bool,
    pub message: String,
    pub result: Vec<Node>,
}

impl GetNodesResponse {
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Outbound write request: `{"args": [id, value]}`.
#[derive(Debug, Serialize)]
pub struct WriteValueRequest<'a, V: Serialize + ?Sized> {
    args: (&'a ValueId, &'a V),
}

impl<'a, V: Serialize + ?Sized> WriteValueRequest<'a, V> {
    pub fn new(id: &'a ValueId, value: &'a V) -> Self {
        Self { args: (id, value) }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Acknowledgement of a write request.
#[derive(Debug, Clone)]
pub struct WriteValueResponse {
    pub success: bool,
    pub message: String,
    pub value_id: ValueId,
    pub value: Box<RawValue>,
}

#[derive(Deserialize)]
struct RawWriteAck {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    args: Vec<Box<RawValue>>,
}

impl WriteValueResponse {
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let ack: RawWriteAck = serde_json::from_slice(payload)?;
        let [id, value]: [Box<RawValue>; 2] =
            ack.args
                .try_into()
                .map_err(|args: Vec<Box<RawValue>>| CodecError::Arity {
                    field: "args",
                    expected: 2,
                    found: args.len(),
                })?;

        Ok(Self {
            success: ack.success,
            message: ack.message,
            value_id: serde_json::from_str(id.get())?,
            value,
        })
    }
}

/// Unsolicited change notification for one property of one node.
#[derive(Debug, Clone)]
pub struct NodeValueUpdate {
    pub node: Node,
    pub delta: ValueDelta,
}

#[derive(Deserialize)]
struct RawNodeEvent {
    #[serde(default)]
    data: Vec<Box<RawValue>>,
}

impl NodeValueUpdate {
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let event: RawNodeEvent = serde_json::from_slice(payload)?;
        let [node, delta]: [Box<RawValue>; 2] =
            event
                .data
                .try_into()
                .map_err(|data: Vec<Box<RawValue>>| CodecError::Arity {
                    field: "data",
                    expected: 2,
                    found: data.len(),
                })?;

        Ok(Self {
            node: serde_json::from_str(node.get())?,
            delta: serde_json::from_str(delta.get())?,
        })
    }

    /// The snapshot entry the delta refers to, if the snapshot carries it.
    pub fn value(&self) -> Option<&Value> {
        self.node.values.get(&self.delta.value_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_request_has_two_args() {
        let id = ValueId {
            node_id: 4,
            command_class: 38,
            endpoint: 0,
            property: "currentValue".to_string(),
        };
        let payload = WriteValueRequest::new(&id, &50).encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "args": [{"nodeId":4,"commandClass":38,"endpoint":0,"property":"currentValue"}, 50]
            })
        );
    }

    #[test]
    fn write_ack_decodes() {
        let payload = br#"{"success":true,"message":"Success zwave api call","args":[{"nodeId":4,"commandClass":38,"endpoint":0,"property":"targetValue"},93]}"#;
        let ack = WriteValueResponse::decode(payload).unwrap();
        assert!(ack.success);
        assert_eq!(ack.value_id.node_id, 4);
        assert_eq!(ack.value_id.property, "targetValue");
        assert_eq!(ack.value.get(), "93");
    }

    #[test]
    fn write_ack_with_wrong_arity_is_malformed() {
        let payload = br#"{"success":true,"args":[{"nodeId":4,"commandClass":38,"endpoint":0,"property":"x"}]}"#;
        let err = WriteValueResponse::decode(payload).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Arity {
                field: "args",
                found: 1,
                ..
            }
        ));
    }

    #[test]
    fn node_event_finds_snapshot_value() {
        let payload = br#"{"data":[
            {"id":4,"name":"kitchen-light","values":{
                "38-0-currentValue":{"id":"38-0-currentValue","nodeId":4,"commandClass":38,"endpoint":0,"property":"currentValue","type":"number","value":3}
            }},
            {"commandClassName":"Multilevel Switch","commandClass":38,"endpoint":0,"property":"currentValue","newValue":3,"prevValue":99,"propertyName":"currentValue"}
        ]}"#;
        let update = NodeValueUpdate::decode(payload).unwrap();
        assert_eq!(update.node.id, 4);
        let value = update.value().unwrap();
        assert_eq!(value.decode().unwrap(), PropertyValue::Integer(3));
        assert_eq!(update.delta.new_value.as_ref().unwrap().get(), "3");
    }

    #[test]
    fn node_event_with_wrong_arity_is_malformed() {
        let err = NodeValueUpdate::decode(br#"{"data":[{}]}"#).unwrap_err();
        assert!(matches!(err, CodecError::Arity { field: "data", .. }));
    }
}
