//! Error taxonomy of the correlation engine

use std::time::Duration;

use thiserror::Error;

use super::directory::DeviceSelector;
use crate::api::{CodecError, ValueId};
use crate::publisher::TransportError;

/// Coarse classification of a [`BrokerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Malformed,
    TypeMismatch,
    Duplicate,
    Timeout,
    Cancelled,
    RemoteFailure,
    Transport,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Device {0} not found")]
    DeviceNotFound(DeviceSelector),

    #[error("Property {property:?} not found on device {device}")]
    PropertyNotFound { device: String, property: String },

    /// The notification's delta names a property missing from its own snapshot.
    #[error("Value {0:?} not present in notification snapshot")]
    SnapshotValueNotFound(String),

    /// Notification for a device the live directory does not know.
    #[error("Notification for unknown node {0}")]
    UnknownNode(u32),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Duplicate device name {0:?} in directory response")]
    DuplicateName(String),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    /// A later write to the same property replaced this call's completion slot.
    #[error("Write to {0} superseded by a later write")]
    Superseded(ValueId),

    #[error("Gateway reported failure: {0}")]
    RemoteFailure(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The broker was dropped while a call was waiting.
    #[error("Broker shut down")]
    Shutdown,
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::DeviceNotFound(_)
            | BrokerError::PropertyNotFound { .. }
            | BrokerError::SnapshotValueNotFound(_)
            | BrokerError::UnknownNode(_) => ErrorKind::NotFound,
            BrokerError::Codec(CodecError::Json(_) | CodecError::Arity { .. }) => {
                ErrorKind::Malformed
            }
            BrokerError::Codec(CodecError::UnknownType(_) | CodecError::TypeMismatch { .. }) => {
                ErrorKind::TypeMismatch
            }
            BrokerError::DuplicateName(_) => ErrorKind::Duplicate,
            BrokerError::Timeout(_) => ErrorKind::Timeout,
            BrokerError::Cancelled | BrokerError::Superseded(_) | BrokerError::Shutdown => {
                ErrorKind::Cancelled
            }
            BrokerError::RemoteFailure(_) => ErrorKind::RemoteFailure,
            BrokerError::Transport(_) => ErrorKind::Transport,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_errors_are_classified() {
        let json = serde_json::from_str::<u32>("nope").unwrap_err();
        assert_eq!(BrokerError::from(CodecError::from(json)).kind(), ErrorKind::Malformed);

        let unknown = CodecError::UnknownType("buffer".to_string());
        assert_eq!(BrokerError::from(unknown).kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn lookup_failures_are_not_found() {
        assert!(BrokerError::DeviceNotFound("porch".into()).is_not_found());
        assert!(BrokerError::UnknownNode(9).is_not_found());
        assert!(!BrokerError::Cancelled.is_not_found());
    }

    #[test]
    fn messages_carry_context() {
        let err = BrokerError::RemoteFailure("Node is dead".to_string());
        assert_eq!(err.to_string(), "Gateway reported failure: Node is dead");

        let err = BrokerError::PropertyNotFound {
            device: "\"kitchen-light\"".to_string(),
            property: "level".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Property \"level\" not found on device \"kitchen-light\""
        );
    }
}
