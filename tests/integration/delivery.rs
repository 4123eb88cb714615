use crate::*;

use dgbus_core::message::encode_properties;
use dgbus_core::wire::split_message;
use dgbus_core::Packet;
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn test_single_packet_delivery() -> Result<()> {
    let mut bus = start_bus(&["events"]).await?;
    let sender = client().await?;

    let properties = props(json!({ "kind": "ping", "seq": 1 }));
    let packets = split_message(Uuid::new_v4(), "events", &encode_properties(&properties), 1400)?;
    assert_eq!(packets.len(), 1);
    send_all(&sender, bus.addr, &packets).await?;

    let message = next_message(&mut bus).await.context("no delivery")?;
    assert_eq!(message.topic, "events");
    assert_eq!(message.properties, properties);
    assert_quiet(&mut bus).await;

    bus.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_multi_packet_reversed_delivery() -> Result<()> {
    let mut config = loopback_config();
    config.listener.packet_size = 96;
    let mut bus = start_bus_with(config, &["events"]).await?;
    let sender = client().await?;

    let text: String = (0..1500).map(|i| char::from(b'A' + (i % 26) as u8)).collect();
    let properties = props(json!({ "text": text, "n": 1500 }));
    let payload = encode_properties(&properties);
    let mut packets = split_message(Uuid::new_v4(), "events", &payload, 96)?;
    assert!(packets.len() > 10);

    // Everything after the START, last chunk first.
    packets[1..].reverse();
    send_all(&sender, bus.addr, &packets).await?;

    let message = next_message(&mut bus).await.context("no delivery")?;
    assert_eq!(message.payload.as_ref(), payload.as_slice());
    assert_eq!(message.properties, properties);
    assert_quiet(&mut bus).await;
    assert_eq!(bus.server.ledger().in_flight(), 0);

    bus.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_data_before_start_completes() -> Result<()> {
    let mut bus = start_bus(&["events"]).await?;
    let sender = client().await?;

    let id = Uuid::new_v4();
    let start = Packet::start(id, "events", Bytes::from_static(b"{\"a\":"), true).encode()?;
    let end = Packet::data(id, 2, Bytes::from_static(b"1}"), false).encode()?;

    send_all(&sender, bus.addr, &[end]).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bus.delivered.try_recv().is_err());
    send_all(&sender, bus.addr, &[start]).await?;

    let message = next_message(&mut bus).await.context("no delivery")?;
    assert_eq!(message.properties, props(json!({ "a": 1 })));
    assert_eq!(bus.server.ledger().pending_slots(), 0);

    bus.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_same_id_from_two_origins() -> Result<()> {
    let mut bus = start_bus(&["events"]).await?;
    let first = client().await?;
    let second = client().await?;

    let id = Uuid::new_v4();
    let start_a = Packet::start(id, "events", Bytes::from_static(b"{\"from\":"), true).encode()?;
    let end_a = Packet::data(id, 2, Bytes::from_static(b"\"a\"}"), false).encode()?;
    let start_b = Packet::start(id, "events", Bytes::from_static(b"{\"from\":"), true).encode()?;
    let end_b = Packet::data(id, 2, Bytes::from_static(b"\"b\"}"), false).encode()?;

    send_all(&first, bus.addr, &[start_a]).await?;
    send_all(&second, bus.addr, &[start_b]).await?;
    send_all(&second, bus.addr, &[end_b]).await?;
    send_all(&first, bus.addr, &[end_a]).await?;

    let mut origins = Vec::new();
    for _ in 0..2 {
        let message = next_message(&mut bus).await.context("missing delivery")?;
        origins.push(message.get("from").and_then(|v| v.as_str()).map(String::from));
    }
    origins.sort();
    assert_eq!(origins, vec![Some("a".to_string()), Some("b".to_string())]);

    bus.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_topic_with_non_ascii_characters() -> Result<()> {
    let topic = "m\u{e9}t\u{e9}o=fr";
    let mut bus = start_bus(&[topic]).await?;
    let sender = client().await?;

    let packets = split_message(Uuid::new_v4(), topic, b"{}", 1400)?;
    send_all(&sender, bus.addr, &packets).await?;

    let message = next_message(&mut bus).await.context("no delivery")?;
    assert_eq!(message.topic, topic);

    bus.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_unsubscribed_topics_are_discarded() -> Result<()> {
    let mut bus = start_bus(&["events"]).await?;
    let sender = client().await?;

    let stray = split_message(Uuid::new_v4(), "other", b"{}", 1400)?;
    send_all(&sender, bus.addr, &stray).await?;
    let wanted = split_message(Uuid::new_v4(), "events", b"{\"ok\":true}", 1400)?;
    send_all(&sender, bus.addr, &wanted).await?;

    let message = next_message(&mut bus).await.context("no delivery")?;
    assert_eq!(message.topic, "events");
    assert_quiet(&mut bus).await;

    // Late subscribers see later messages.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    bus.registry.subscribe(
        "other",
        FnHandler::new("late", move |m: &Message| {
            tx.send(m.topic.clone()).context("receiver gone")
        }),
    );
    send_all(&sender, bus.addr, &split_message(Uuid::new_v4(), "other", b"{}", 1400)?).await?;
    let topic = tokio::time::timeout(RECV_TIMEOUT, rx.recv()).await?;
    assert_eq!(topic.as_deref(), Some("other"));

    bus.server.stop().await;
    Ok(())
}
