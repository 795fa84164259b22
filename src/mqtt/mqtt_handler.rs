//! MQTT session driving a [`Broker`] with statum state safety
//!
//! ```text
//! Disconnected ──connect──► Subscribed ──bootstrap──► Ready
//!       │                        │                      │
//!       └────────────────────────┴───────shutdown───────┘
//! ```
//!
//! The event-loop task polls rumqttc, re-subscribes after every ConnAck and
//! routes inbound publishes to [`Broker::dispatch`]. Outbound requests go
//! through [`MqttPublisher`] with the gateway prefix joined on.

use std::time::Duration;

use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Outgoing, Packet, Publish, QoS};
use serde::Serialize;
use statum::{machine, state};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::message_manager::{MessageKind, MqttMessage, Router};
use crate::broker::{
    Broker, BrokerError, DeviceSelector, DeviceSummary, PropertyUpdate, WatchHandle,
};
use crate::config::AppConfig;
use crate::publisher::{PrefixPublisher, Publisher, TransportError};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No connection to {0} within {1:?}")]
    ConnectTimeout(String, Duration),

    #[error("Event loop already started")]
    AlreadyStarted,

    #[error("Event loop stopped")]
    EventLoopStopped,

    #[error("Failed to queue subscription to {filter}: {source}")]
    Subscribe {
        filter: String,
        #[source]
        source: ClientError,
    },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Hands payloads to an rumqttc client without waiting on the network.
#[derive(Debug, Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl Publisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| TransportError::Rejected {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Disconnected, // client built, event loop not polled yet
    Subscribed,   // connected and subscribed, directory unknown
    Ready,        // directory installed
}

#[machine]
pub struct GatewaySession<S: SessionState> {
    config: AppConfig,
    client: AsyncClient,
    event_loop: Option<EventLoop>,
    broker: Broker,
    cancel: CancellationToken,
    event_task: Option<JoinHandle<()>>,
}

impl<S: SessionState> GatewaySession<S> {
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Token cancelled on shutdown; pending calls made through the session
    /// observe it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Disconnects from the MQTT broker and stops the event-loop task.
    pub async fn shutdown(mut self) {
        info!("Shutting down gateway session");
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect not queued: {}", e);
        }

        if let Some(mut task) = self.event_task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("Event loop did not stop within {:?}", SHUTDOWN_GRACE);
                self.cancel.cancel();
                if let Err(e) = task.await {
                    error!("Event loop task failed: {}", e);
                }
            }
        }
        self.cancel.cancel();
    }
}

impl GatewaySession<Disconnected> {
    pub fn create(config: AppConfig) -> Self {
        let (client, event_loop) =
            AsyncClient::new(config.mqtt.options(), config.mqtt.channel_capacity);
        let publisher = PrefixPublisher::new(
            config.gateway.topic_prefix.clone(),
            MqttPublisher::new(client.clone()),
        );
        let broker = Broker::new(publisher);

        Self::new(
            config,
            client,
            Some(event_loop),
            broker,
            CancellationToken::new(),
            None, // event_task
        )
    }

    /// Starts the event loop and waits for the first successful connection.
    pub async fn connect(mut self) -> Result<GatewaySession<Subscribed>, SessionError> {
        let event_loop = self.event_loop.take().ok_or(SessionError::AlreadyStarted)?;
        let router = Router::new(&self.config.gateway.topic_prefix);
        let (connected_tx, connected_rx) = oneshot::channel();

        info!("Connecting to MQTT broker {}", self.config.mqtt);
        self.event_task = Some(tokio::spawn(run_event_loop(
            event_loop,
            self.client.clone(),
            router,
            self.broker.clone(),
            self.cancel.clone(),
            connected_tx,
        )));

        let timeout = self.config.gateway.request_timeout();
        match tokio::time::timeout(timeout, connected_rx).await {
            Ok(Ok(Ok(()))) => Ok(self.transition()),
            Ok(Ok(Err(e))) => {
                self.cancel.cancel();
                Err(e)
            }
            Ok(Err(_)) => {
                self.cancel.cancel();
                Err(SessionError::EventLoopStopped)
            }
            Err(_) => {
                self.cancel.cancel();
                Err(SessionError::ConnectTimeout(self.config.mqtt.to_string(), timeout))
            }
        }
    }
}

impl GatewaySession<Subscribed> {
    /// Loads the device directory.
    pub async fn bootstrap(self) -> Result<GatewaySession<Ready>, SessionError> {
        let timeout = self.config.gateway.request_timeout();
        if let Err(e) = self.broker.bootstrap(timeout, &self.cancel).await {
            error!("Failed to load device directory: {}", e);
            self.cancel.cancel();
            return Err(e.into());
        }
        Ok(self.transition())
    }
}

impl GatewaySession<Ready> {
    pub fn devices(&self) -> Vec<DeviceSummary> {
        self.broker.devices()
    }

    /// Reloads the device directory.
    pub async fn refresh(&self) -> Result<(), SessionError> {
        let timeout = self.config.gateway.request_timeout();
        Ok(self.broker.bootstrap(timeout, &self.cancel).await?)
    }

    pub async fn write_property<V>(
        &self,
        selector: impl Into<DeviceSelector>,
        property: &str,
        value: &V,
    ) -> Result<(), SessionError>
    where
        V: Serialize + ?Sized,
    {
        let timeout = self.config.gateway.request_timeout();
        self.broker
            .write_property(selector, property, value, timeout, &self.cancel)
            .await?;
        Ok(())
    }

    /// Watches one property through a fresh channel sized by the config.
    pub fn watch(
        &self,
        selector: impl Into<DeviceSelector>,
        property: &str,
    ) -> Result<(WatchHandle, mpsc::Receiver<PropertyUpdate>), SessionError> {
        let (tx, rx) = mpsc::channel(self.config.gateway.watch_buffer.max(1));
        let handle = self.broker.watch(selector, property, tx)?;
        Ok((handle, rx))
    }
}

fn subscribe_all(client: &AsyncClient, router: &Router) -> Result<(), SessionError> {
    for route in router.routes() {
        client
            .try_subscribe(route.filter.clone(), QoS::AtLeastOnce)
            .map_err(|source| SessionError::Subscribe {
                filter: route.filter.clone(),
                source,
            })?;
        debug!("Subscribed to {} ({})", route.filter, route.kind);
    }
    Ok(())
}

/// Hands one inbound publish to the broker. Returns the kind it was routed
/// as, or `None` for topics outside the gateway API.
fn route_publish(router: &Router, broker: &Broker, publish: &Publish) -> Option<MessageKind> {
    let Some(kind) = router.route(&publish.topic) else {
        debug!("Ignoring message on {}", publish.topic);
        return None;
    };
    if tracing::enabled!(tracing::Level::DEBUG) {
        let message = MqttMessage::from_topic(publish.topic.clone(), publish.payload.to_vec());
        debug!("Received {}", message);
    }
    // errors are logged by dispatch
    let _ = broker.dispatch(kind, &publish.payload);
    Some(kind)
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    router: Router,
    broker: Broker,
    shutdown: CancellationToken,
    connected: oneshot::Sender<Result<(), SessionError>>,
) {
    let mut connected = Some(connected);

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker");
                let subscribed = subscribe_all(&client, &router);
                if let Err(e) = &subscribed {
                    error!("{}", e);
                }
                if let Some(tx) = connected.take() {
                    let _ = tx.send(subscribed);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                route_publish(&router, &broker, &publish);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("Disconnected from MQTT broker");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                }
            }
        }
    }

    info!("MQTT event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::mqtt::config::MqttConfig;

    fn unreachable_config() -> AppConfig {
        AppConfig {
            mqtt: MqttConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
                ..MqttConfig::default()
            },
            gateway: GatewayConfig {
                request_timeout_secs: 1,
                ..GatewayConfig::default()
            },
        }
    }

    #[tokio::test]
    async fn publisher_queues_without_network() {
        let (client, _event_loop) = AsyncClient::new(MqttConfig::default().options(), 4);
        let publisher = MqttPublisher::new(client);
        publisher.publish("zwave/a", b"{}".to_vec()).unwrap();
    }

    #[tokio::test]
    async fn publisher_reports_full_queue() {
        let (client, _event_loop) = AsyncClient::new(MqttConfig::default().options(), 1);
        let publisher = MqttPublisher::new(client);
        publisher.publish("zwave/a", Vec::new()).unwrap();
        let err = publisher.publish("zwave/b", Vec::new()).unwrap_err();
        assert!(matches!(err, TransportError::Rejected { topic, .. } if topic == "zwave/b"));
    }

    #[test]
    fn inbound_publishes_route_by_topic() {
        let router = Router::new("zwave");
        let broker = Broker::new(crate::publisher::PublisherFn::new(|_: &str, _: Vec<u8>| Ok(())));
        let listing = br#"{"success":true,"result":[{"id":4,"name":"kitchen-light","values":{}}]}"#;

        let publish = Publish::new(
            "zwave/_CLIENTS/ZWAVE_GATEWAY/api/getNodes",
            QoS::AtLeastOnce,
            listing.to_vec(),
        );
        assert_eq!(
            route_publish(&router, &broker, &publish),
            Some(MessageKind::DirectoryResponse)
        );
        assert_eq!(broker.devices().len(), 1);

        let stray = Publish::new("zwave/other/topic", QoS::AtMostOnce, listing.to_vec());
        assert_eq!(route_publish(&router, &broker, &stray), None);
    }

    #[tokio::test]
    async fn connect_times_out_without_broker() {
        let session = GatewaySession::<Disconnected>::create(unreachable_config());
        let token = session.cancel_token();
        let err = match session.connect().await {
            Ok(_) => panic!("connected to a closed port"),
            Err(e) => e,
        };
        assert!(matches!(err, SessionError::ConnectTimeout(..)));
        assert!(token.is_cancelled());
    }
}
