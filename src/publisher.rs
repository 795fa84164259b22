//! Outbound transport port.
//!
//! The broker never talks to an MQTT client directly. It hands finished
//! payloads to a [`Publisher`], which the embedding application supplies.
//! Delivery is fire-and-forget from the broker's point of view: a publisher
//! only reports whether the payload was accepted for sending.

use std::fmt;
use std::sync::Arc;

use crate::mqtt::message_manager::join_topic;

/// Errors reported by a [`Publisher`] when a payload cannot be handed off.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The underlying client refused the request (queue full, disconnected).
    #[error("Publish to {topic} rejected: {reason}")]
    Rejected { topic: String, reason: String },

    /// The transport has been shut down.
    #[error("Transport closed")]
    Closed,
}

/// Capability to publish a payload to a named topic.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        (**self).publish(topic, payload)
    }
}

/// Adapts a closure into a [`Publisher`].
pub struct PublisherFn<F>(F);

impl<F> PublisherFn<F>
where
    F: Fn(&str, Vec<u8>) -> Result<(), TransportError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Publisher for PublisherFn<F>
where
    F: Fn(&str, Vec<u8>) -> Result<(), TransportError> + Send + Sync,
{
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        (self.0)(topic, payload)
    }
}

impl<F> fmt::Debug for PublisherFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PublisherFn")
    }
}

/// Joins a deployment prefix onto every topic before delegating.
#[derive(Debug, Clone)]
pub struct PrefixPublisher<P> {
    prefix: String,
    inner: P,
}

impl<P: Publisher> PrefixPublisher<P> {
    pub fn new(prefix: impl Into<String>, inner: P) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl<P: Publisher> Publisher for PrefixPublisher<P> {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let topic = join_topic(&self.prefix, topic);
        self.inner.publish(&topic, payload)
    }
}
