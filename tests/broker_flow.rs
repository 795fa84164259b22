use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use zwave_bridge::api;
use zwave_bridge::mqtt::message_manager::{MessageKind, Router};
use zwave_bridge::{
    Broker, BrokerError, ErrorKind, PrefixPublisher, PropertyValue, PublisherFn, TransportError,
};

const LISTING: &str = r#"{"success":true,"result":[{"id":4,"name":"kitchen-light","failed":false,"values":{"38-0-currentValue":{"id":"38-0-currentValue","nodeId":4,"commandClass":38,"endpoint":0,"property":"currentValue","type":"number"}}}]}"#;

type Outbox = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

/// A broker publishing below `zwave/` into a shared outbox, plus a channel
/// that wakes the test whenever something was published.
fn recording_broker() -> (Broker, Outbox, mpsc::UnboundedReceiver<()>) {
    let outbox: Outbox = Arc::new(Mutex::new(Vec::new()));
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();

    let sink = outbox.clone();
    let publisher = PublisherFn::new(move |topic: &str, payload: Vec<u8>| {
        sink.lock().unwrap().push((topic.to_string(), payload));
        notify_tx.send(()).map_err(|_| TransportError::Closed)
    });

    let broker = Broker::new(PrefixPublisher::new("zwave", publisher));
    (broker, outbox, notify_rx)
}

/// Feeds a payload through the same routing the MQTT event loop uses.
fn deliver(broker: &Broker, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
    let kind = Router::new("zwave")
        .route(topic)
        .expect("topic should be routed");
    broker.dispatch(kind, payload)
}

#[tokio::test]
async fn bootstrap_then_write_kitchen_light() {
    let (broker, outbox, mut published) = recording_broker();

    let bootstrap = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .bootstrap(Duration::from_secs(5), &CancellationToken::new())
                .await
        })
    };
    published.recv().await.unwrap();
    assert_eq!(
        outbox.lock().unwrap()[0].0,
        "zwave/_CLIENTS/ZWAVE_GATEWAY/api/getNodes/set"
    );

    deliver(
        &broker,
        "zwave/_CLIENTS/ZWAVE_GATEWAY/api/getNodes",
        LISTING.as_bytes(),
    )
    .unwrap();
    bootstrap.await.unwrap().unwrap();

    let devices = broker.devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name.as_deref(), Some("kitchen-light"));

    let write = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .write_property(
                    "kitchen-light",
                    "currentValue",
                    &50,
                    Duration::from_secs(5),
                    &CancellationToken::new(),
                )
                .await
        })
    };
    published.recv().await.unwrap();

    let (topic, payload) = outbox.lock().unwrap()[1].clone();
    assert_eq!(topic, "zwave/_CLIENTS/ZWAVE_GATEWAY/api/writeValue/set");
    let body: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(
        body,
        serde_json::json!({
            "args": [{"nodeId":4,"commandClass":38,"endpoint":0,"property":"currentValue"}, 50]
        })
    );

    deliver(
        &broker,
        "zwave/_CLIENTS/ZWAVE_GATEWAY/api/writeValue",
        br#"{"success":true,"message":"Success zwave api call","args":[{"nodeId":4,"commandClass":38,"endpoint":0,"property":"currentValue"},50]}"#,
    )
    .unwrap();
    write.await.unwrap().unwrap();
    assert_eq!(broker.pending_writes(), 0);
}

#[tokio::test]
async fn watchers_see_notifications_from_any_gateway_instance() {
    let (broker, _outbox, _published) = recording_broker();
    broker.handle_directory_response(LISTING.as_bytes()).unwrap();

    let (tx, mut rx) = mpsc::channel(4);
    let handle = broker.watch("kitchen-light", "currentValue", tx).unwrap();

    let event = br#"{"data":[
        {"id":4,"name":"kitchen-light","values":{"38-0-currentValue":{"id":"38-0-currentValue","nodeId":4,"commandClass":38,"endpoint":0,"property":"currentValue","type":"number","value":75}}},
        {"commandClass":38,"endpoint":0,"property":"currentValue","newValue":75,"prevValue":50}
    ]}"#;
    deliver(
        &broker,
        "zwave/_EVENTS/ZWAVE_GATEWAY-upstairs/node/node_value_updated",
        event,
    )
    .unwrap();

    let update = rx.recv().await.unwrap();
    assert_eq!(update.device_id, 4);
    assert_eq!(update.property, "currentValue");
    assert_eq!(update.value, PropertyValue::Integer(75));

    handle.cancel();
    deliver(
        &broker,
        "zwave/_EVENTS/ZWAVE_GATEWAY-upstairs/node/node_value_updated",
        event,
    )
    .unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn rebootstrap_replaces_directory_wholesale() {
    let (broker, _outbox, _published) = recording_broker();
    broker.handle_directory_response(LISTING.as_bytes()).unwrap();

    let replacement = br#"{"success":true,"result":[
        {"id":5,"name":"hall","values":{}},
        {"id":6,"name":"cellar","failed":true,"values":{}}
    ]}"#;
    broker.handle_directory_response(replacement).unwrap();

    assert!(broker.device("kitchen-light").is_none());
    assert!(broker.device(4u32).is_none());
    assert!(broker.device("hall").is_some());
    assert!(broker.device("cellar").is_none());

    let duplicate = br#"{"success":true,"result":[{"id":1,"name":"hall"},{"id":2,"name":"hall"}]}"#;
    let err = broker.handle_directory_response(duplicate).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Duplicate);
    let ids: Vec<u32> = broker.devices().iter().map(|d| d.id).collect();
    assert_eq!(ids, vec![5]);
}

#[tokio::test]
async fn unknown_targets_never_reach_the_transport() {
    let (broker, outbox, _published) = recording_broker();
    broker.handle_directory_response(LISTING.as_bytes()).unwrap();

    let err = broker
        .write_property(
            "garage",
            "currentValue",
            &1,
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(outbox.lock().unwrap().is_empty());
}

#[test]
fn subscriptions_cover_every_message_kind() {
    let routes = Broker::subscriptions("zwave");
    let kinds: Vec<MessageKind> = routes.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![
            MessageKind::DirectoryResponse,
            MessageKind::WriteAck,
            MessageKind::ValueUpdated
        ]
    );
    assert!(routes
        .iter()
        .all(|r| r.filter.starts_with("zwave/") && !r.filter.contains(api::TOPIC_GET_NODES_REQ)));
}
