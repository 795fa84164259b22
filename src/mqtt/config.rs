use std::fmt;
use std::time::Duration;

use rumqttc::MqttOptions;
use serde::{Deserialize, Serialize};

/// Connection settings for the MQTT broker the gateway publishes on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// Capacity of the client's request queue.
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "zwave-bridge".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            channel_capacity: 64,
        }
    }
}

impl fmt::Display for MqttConfig {
    /// `user@host:port`, never the password.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.username {
            Some(user) => write!(f, "{}@{}:{}", user, self.host, self.port),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl MqttConfig {
    pub fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(5)));
        if let Some(user) = &self.username {
            options.set_credentials(user.clone(), self.password.clone().unwrap_or_default());
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config: MqttConfig = toml::from_str(r#"host = "hub.local""#).unwrap();
        assert_eq!(config.host, "hub.local");
        assert_eq!(config.port, 1883);
        assert_eq!(config.client_id, "zwave-bridge");
        assert_eq!(config.to_string(), "hub.local:1883");
    }

    #[test]
    fn options_carry_endpoint_and_keep_alive() {
        let config = MqttConfig {
            username: Some("zwave".to_string()),
            keep_alive_secs: 1,
            ..MqttConfig::default()
        };
        let options = config.options();
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(5));
        assert_eq!(options.client_id(), "zwave-bridge");
        assert_eq!(config.to_string(), "zwave@localhost:1883");
    }
}
