use crate::*;

use dgbus_core::wire::split_message;
use dgbus_core::Packet;
use dgbus_services::ServerState;
use uuid::Uuid;

#[tokio::test]
async fn test_stop_and_restart() -> Result<()> {
    let mut bus = start_bus(&["events"]).await?;
    let sender = client().await?;

    send_all(&sender, bus.addr, &split_message(Uuid::new_v4(), "events", b"{\"round\":1}", 1400)?)
        .await?;
    next_message(&mut bus).await.context("no delivery before stop")?;

    assert!(bus.server.stop().await);
    assert_eq!(bus.server.state(), ServerState::Stopped);
    assert!(!bus.server.stop().await);

    assert!(bus.server.start().await?);
    let addr = bus.server.local_addr().await.context("no address after restart")?;
    send_all(&sender, addr, &split_message(Uuid::new_v4(), "events", b"{\"round\":2}", 1400)?)
        .await?;
    let message = next_message(&mut bus).await.context("no delivery after restart")?;
    assert_eq!(message.get("round"), Some(&serde_json::json!(2)));

    bus.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_stop_abandons_reassembly() -> Result<()> {
    let mut bus = start_bus(&["events"]).await?;
    let sender = client().await?;

    let id = Uuid::new_v4();
    let start = Packet::start(id, "events", Bytes::from_static(b"{\"x\":"), true).encode()?;
    send_all(&sender, bus.addr, &[start]).await?;
    let orphan = Packet::data(Uuid::new_v4(), 2, Bytes::from_static(b"}"), false).encode()?;
    send_all(&sender, bus.addr, &[orphan]).await?;

    let ledger = bus.server.ledger().clone();
    assert!(wait_until(|| ledger.in_flight() == 1 && ledger.pending_slots() == 1).await);

    bus.server.stop().await;
    assert_eq!(ledger.in_flight(), 0);
    assert!(wait_until(|| ledger.pending_slots() == 0).await);

    // The abandoned message cannot be finished after a restart.
    bus.server.start().await?;
    let addr = bus.server.local_addr().await.context("no address after restart")?;
    let end = Packet::data(id, 2, Bytes::from_static(b"1}"), false).encode()?;
    send_all(&sender, addr, &[end]).await?;
    assert_quiet(&mut bus).await;

    bus.server.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_inline_processing_single_receiver() -> Result<()> {
    let mut config = loopback_config();
    config.listener.receivers = 0;
    config.listener.inline_processing = true;
    config.dispatch.background = false;
    config.listener.packet_size = 64;
    let mut bus = start_bus_with(config, &["events"]).await?;
    let sender = client().await?;

    let body = serde_json::to_vec(&serde_json::json!({ "inline": "yes, in order", "pad": [1, 2, 3, 4, 5, 6, 7, 8] }))?;
    let packets = split_message(Uuid::new_v4(), "events", &body, 64)?;
    assert!(packets.len() > 1);
    send_all(&sender, bus.addr, &packets).await?;

    let message = next_message(&mut bus).await.context("no delivery")?;
    assert_eq!(message.payload.as_ref(), body.as_slice());

    bus.server.stop().await;
    Ok(())
}
