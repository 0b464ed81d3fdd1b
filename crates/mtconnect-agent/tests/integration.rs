use mtconnect_core::{Asset, DataItemCategory, Observation};
use mtconnect_core::value_keys;
use mtconnect_mqtt::{MessageRouter, MqttClient, MqttClientConfig};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

fn integration_broker() -> Option<String> {
    if std::env::var("MTCONNECT_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set MTCONNECT_INTEGRATION=1 to run");
        return None;
    }
    Some(
        std::env::var("MTCONNECT_MQTT_BROKER")
            .unwrap_or_else(|_| "tcp://localhost:1883".to_string()),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mqtt_observation_roundtrip() {
    let Some(broker) = integration_broker() else {
        return;
    };

    let device_uuid = format!("it-{}", Uuid::new_v4());
    let router = Arc::new(MessageRouter::default());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let observations = tx.clone();
    let _obs = router.on_observation(move |uuid, observation| {
        let _ = observations.send(("observation", uuid.to_string(), observation.clone()));
    });
    let conditions = tx.clone();
    let _cond = router.on_condition(move |uuid, condition| {
        let _ = conditions.send(("condition", uuid.to_string(), condition.clone()));
    });

    let (assets_tx, mut assets) = mpsc::unbounded_channel();
    let _asset = router.on_asset(move |uuid, asset| {
        let _ = assets_tx.send((uuid.to_string(), asset.asset_id.clone()));
    });

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let _conn = router.on_connection(move |event| {
        let _ = events_tx.send(format!("{event:?}"));
    });

    let config = MqttClientConfig {
        broker,
        client_id: format!("it-{}", Uuid::new_v4()),
        topics: vec![router.scheme().device_wildcard(&device_uuid)],
        ..MqttClientConfig::default()
    };
    let client = MqttClient::connect(config, Arc::clone(&router))
        .await
        .expect("connect to broker");
    assert!(client.is_connected());
    assert_eq!(events.recv().await.as_deref(), Some("Connected"));

    // Let the subscription settle before publishing to ourselves.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sample = Observation::new(&device_uuid, "xpos", DataItemCategory::Sample, "POSITION")
        .with_result("12.5");
    let condition = Observation::new(&device_uuid, "logic", DataItemCategory::Condition, "LOGIC_PROGRAM")
        .with_value(value_keys::LEVEL, "FAULT");
    client.publish_observation(&sample).await.unwrap();
    client.publish_observation(&condition).await.unwrap();

    let mut asset = Asset::new("T1", "CuttingTool");
    asset.device_uuid = Some(device_uuid.clone());
    client.publish_asset(&asset).await.unwrap();

    let mut received = Vec::new();
    while received.len() < 2 {
        let item = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout waiting for MQTT message")
            .expect("router dropped");
        received.push(item);
    }
    received.sort_by_key(|(kind, _, _)| *kind);

    assert_eq!(received[0].0, "condition");
    assert_eq!(received[0].1, device_uuid);
    assert_eq!(received[0].2.data_item_id, "logic");
    assert_eq!(received[1].0, "observation");
    assert_eq!(received[1].2.result(), Some("12.5"));

    let (owner, asset_id) = timeout(Duration::from_secs(5), assets.recv())
        .await
        .expect("timeout waiting for asset")
        .expect("router dropped");
    assert_eq!(owner, device_uuid);
    assert_eq!(asset_id, "T1");

    client.disconnect().await;
    client.disconnect().await;
    assert!(!client.is_connected());
    assert_eq!(events.recv().await.as_deref(), Some("Disconnected"));
    assert_eq!(router.stats().snapshot().decode_failures, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_payload_is_counted_not_fatal() {
    let Some(broker) = integration_broker() else {
        return;
    };

    let device_uuid = format!("it-{}", Uuid::new_v4());
    let router = Arc::new(MessageRouter::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _assets = router.on_asset(move |_, asset: &Asset| {
        let _ = tx.send(asset.asset_id.clone());
    });

    let config = MqttClientConfig {
        broker: broker.clone(),
        client_id: format!("it-{}", Uuid::new_v4()),
        topics: vec![router.scheme().device_wildcard(&device_uuid)],
        ..MqttClientConfig::default()
    };
    let client = MqttClient::connect(config, Arc::clone(&router))
        .await
        .expect("connect to broker");
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Raw publisher for a payload the client would never produce.
    let address = mtconnect_mqtt::parse_mqtt_url(&broker).unwrap();
    let mut opts = MqttOptions::new(format!("raw-{}", Uuid::new_v4()), address.host, address.port);
    opts.set_keep_alive(Duration::from_secs(5));
    let (raw, mut raw_loop) = AsyncClient::new(opts, 10);
    tokio::spawn(async move {
        loop {
            match raw_loop.poll().await {
                Ok(Event::Incoming(Packet::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });
    let topic = router.scheme().assets(&device_uuid);
    raw.publish(&topic, QoS::AtLeastOnce, false, b"{ not json".to_vec())
        .await
        .unwrap();
    raw.publish(
        &topic,
        QoS::AtLeastOnce,
        false,
        br#"{"assetId": "T1", "type": "CuttingTool"}"#.to_vec(),
    )
    .await
    .unwrap();

    let asset_id = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timeout waiting for asset")
        .expect("router dropped");
    assert_eq!(asset_id, "T1");

    // Same publisher and topic, so the malformed payload arrived first.
    assert_eq!(router.stats().snapshot().decode_failures, 1);
    assert!(client.is_connected());

    client.disconnect().await;
    let _ = raw.disconnect().await;
}
