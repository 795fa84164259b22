use chrono::NaiveDateTime;
use std::fmt;

use crate::api;

/// The three inbound message kinds the broker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    DirectoryResponse,
    WriteAck,
    ValueUpdated,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            MessageKind::DirectoryResponse => "directory response",
            MessageKind::WriteAck => "write acknowledgement",
            MessageKind::ValueUpdated => "value update",
        };
        f.write_str(name)
    }
}

/// A topic filter and the kind of message arriving on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub filter: String,
    pub kind: MessageKind,
}

/// Maps concrete inbound topics to [`MessageKind`]s for one deployment prefix.
#[derive(Debug, Clone)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new(topic_prefix: &str) -> Self {
        let routes = [
            (api::TOPIC_GET_NODES_RESP, MessageKind::DirectoryResponse),
            (api::TOPIC_WRITE_VALUE_RESP, MessageKind::WriteAck),
            (api::TOPIC_NODE_VALUE_UPDATED, MessageKind::ValueUpdated),
        ]
        .into_iter()
        .map(|(topic, kind)| Route {
            filter: join_topic(topic_prefix, topic),
            kind,
        })
        .collect();

        Router { routes }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn route(&self, topic: &str) -> Option<MessageKind> {
        self.routes
            .iter()
            .find(|route| topic_matches(&route.filter, topic))
            .map(|route| route.kind)
    }
}

/// Joins topic segments the way `path.Join` would: empty segments and
/// repeated separators collapse.
pub fn join_topic(prefix: &str, topic: &str) -> String {
    prefix
        .split('/')
        .chain(topic.split('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// MQTT filter matching with `+` (one level) and `#` (remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// An inbound publish as handed from the event loop to the router.
#[derive(Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub timestamp: NaiveDateTime,
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let content = String::from_utf8_lossy(&self.payload);
        let preview: String = content.chars().take(64).collect();
        write!(f, "{} - {}: {}", self.timestamp, self.topic, preview)
    }
}

impl fmt::Debug for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MqttMessage")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

impl MqttMessage {
    pub fn from_topic(topic: String, payload: Vec<u8>) -> Self {
        MqttMessage {
            topic,
            payload,
            timestamp: chrono::Local::now().naive_local(),
        }
    }
}
