//! # MQTT transport
//!
//! Everything that knows about MQTT lives here. The broker itself only sees
//! the [`Publisher`](crate::publisher::Publisher) port and raw payloads.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - broker connection settings
//! ├── message_manager.rs  - topic joining, filter matching, inbound routing
//! └── mqtt_handler.rs     - rumqttc publisher and the session state machine
//! ```
//!
//! ## Topics
//!
//! All gateway topics sit below a deployment prefix (`zwave` by default):
//!
//! | Kind                  | Topic below the prefix                          |
//! |-----------------------|-------------------------------------------------|
//! | directory request     | `_CLIENTS/ZWAVE_GATEWAY/api/getNodes/set`       |
//! | directory response    | `_CLIENTS/ZWAVE_GATEWAY/api/getNodes`           |
//! | write request         | `_CLIENTS/ZWAVE_GATEWAY/api/writeValue/set`     |
//! | write acknowledgement | `_CLIENTS/ZWAVE_GATEWAY/api/writeValue`         |
//! | change notification   | `_EVENTS/+/node/node_value_updated`             |
//!
//! Requests go out at QoS 0. Subscriptions use QoS 1 and are renewed on
//! every reconnect.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
