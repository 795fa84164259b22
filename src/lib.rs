//! Client-side adapter for a Z-Wave gateway's MQTT JSON API.
//!
//! [`Broker`] keeps the device directory, correlates write acknowledgements
//! with the calls waiting on them, and fans change notifications out to
//! watchers. [`GatewaySession`] wires it to a real MQTT connection.

pub mod api;
pub mod broker;
pub mod config;
pub mod mqtt;
pub mod publisher;

pub use api::PropertyValue;
pub use broker::{
    Broker, BrokerError, DeviceSelector, DeviceSummary, ErrorKind, PropertyUpdate, WatchHandle,
};
pub use config::AppConfig;
pub use mqtt::mqtt_handler::{GatewaySession, MqttPublisher, SessionError};
pub use publisher::{PrefixPublisher, Publisher, PublisherFn, TransportError};
