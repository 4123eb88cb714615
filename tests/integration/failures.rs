use crate::*;

use dgbus_core::wire::split_message;
use dgbus_core::Packet;
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn test_garbage_then_valid() -> Result<()> {
    let mut bus = start_bus(&["events"]).await?;
    let sender = client().await?;

    let mut bad_magic = split_message(Uuid::new_v4(), "events", b"{}", 1400)?[0].to_vec();
    bad_magic[..3].copy_from_slice(b"XYZ");
    let garbage = [
        Bytes::from_static(b""),
        Bytes::from_static(b"DGB"),
        Bytes::from(bad_magic),
        Bytes::from_static(&[0xffu8; 40]),
    ];
    send_all(&sender, bus.addr, &garbage).await?;

    let valid = split_message(Uuid::new_v4(), "events", b"{\"still\":\"alive\"}", 1400)?;
    send_all(&sender, bus.addr, &valid).await?;

    let message = next_message(&mut bus).await.context("no delivery")?;
    assert_eq!(message.properties, props(json!({ "still": "alive" })));
    assert_quiet(&mut bus).await;

    let stats = bus.server.stats().clone();
    assert!(wait_until(|| stats.snapshot().decode_failures == 4).await);
    let stats = stats.snapshot();
    assert_eq!(stats.messages_completed, 1);
    assert_eq!(bus.server.ledger().in_flight(), 0);

    bus.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_failing_handler_does_not_block_siblings() -> Result<()> {
    let mut bus = start_bus(&[]).await?;
    bus.registry.subscribe(
        "events",
        FnHandler::new("broken", |_m: &Message| anyhow::bail!("refusing")),
    );
    bus.registry.subscribe(
        "events",
        FnHandler::new("panicky", |_m: &Message| -> Result<()> { panic!("boom") }),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.registry.subscribe(
        "events",
        FnHandler::new("healthy", move |m: &Message| {
            tx.send(m.clone()).context("receiver gone")
        }),
    );

    let sender = client().await?;
    for n in 0..3 {
        let body = serde_json::to_vec(&json!({ "n": n }))?;
        send_all(&sender, bus.addr, &split_message(Uuid::new_v4(), "events", &body, 1400)?).await?;
    }

    let mut seen = Vec::new();
    for _ in 0..3 {
        let message = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await?
            .context("channel closed")?;
        seen.push(message.get("n").and_then(|v| v.as_i64()).context("missing n")?);
    }
    seen.sort();
    assert_eq!(seen, vec![0, 1, 2]);
    assert!(bus.delivered.try_recv().is_err());

    bus.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_conflicting_start_keeps_first() -> Result<()> {
    let mut bus = start_bus(&["events"]).await?;
    let sender = client().await?;

    let id = Uuid::new_v4();
    let first = Packet::start(id, "events", Bytes::from_static(b"{\"v\":"), true).encode()?;
    let second = Packet::start(id, "events", Bytes::from_static(b"{\"w\":"), true).encode()?;
    let end = Packet::data(id, 2, Bytes::from_static(b"7}"), false).encode()?;

    send_all(&sender, bus.addr, &[first]).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    send_all(&sender, bus.addr, &[second]).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    send_all(&sender, bus.addr, &[end]).await?;

    let message = next_message(&mut bus).await.context("no delivery")?;
    assert_eq!(message.properties, props(json!({ "v": 7 })));
    assert_quiet(&mut bus).await;
    assert_eq!(bus.server.stats().snapshot().protocol_errors, 1);

    bus.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_orphan_data_times_out_when_bounded() -> Result<()> {
    let mut config = loopback_config();
    config.reassembly.start_timeout_ms = 100;
    let mut bus = start_bus_with(config, &["events"]).await?;
    let sender = client().await?;

    let orphan = Packet::data(Uuid::new_v4(), 2, Bytes::from_static(b"}"), false).encode()?;
    send_all(&sender, bus.addr, &[orphan]).await?;

    let stats = bus.server.stats().clone();
    assert!(wait_until(|| stats.snapshot().protocol_errors == 1).await);
    assert_eq!(bus.server.ledger().pending_slots(), 0);
    assert_quiet(&mut bus).await;

    bus.server.stop().await;
    Ok(())
}
