//! dgbus integration test harness.
//!
//! Each test starts its own `ListenerServer` on an OS-assigned loopback
//! port and drives it with real UDP datagrams:
//!
//!   cargo test --test integration
//!
//! Delivered messages are forwarded to the test over a channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use dgbus_core::config::DgbusConfig;
use dgbus_core::{Message, Properties};
use dgbus_services::{FnHandler, ListenerServer, TopicRegistry};

mod delivery;
mod failures;
mod lifecycle;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Bus {
    pub server: ListenerServer,
    pub addr: SocketAddr,
    pub registry: TopicRegistry,
    pub delivered: mpsc::UnboundedReceiver<Message>,
}

pub fn loopback_config() -> DgbusConfig {
    let mut config = DgbusConfig::default();
    config.listener.bind_addr = [127, 0, 0, 1].into();
    config.listener.port = 0;
    config.listener.receivers = 2;
    // Room for a burst of packets sent back to back.
    config.listener.recv_buffer_size = 1 << 20;
    config
}

/// Start a server whose subscribers on `topics` forward to `Bus::delivered`.
pub async fn start_bus(topics: &[&str]) -> Result<Bus> {
    start_bus_with(loopback_config(), topics).await
}

pub async fn start_bus_with(config: DgbusConfig, topics: &[&str]) -> Result<Bus> {
    let (tx, delivered) = mpsc::unbounded_channel();
    let registry = TopicRegistry::new();
    for topic in topics {
        let tx = tx.clone();
        registry.subscribe(
            *topic,
            FnHandler::new(format!("forward:{topic}"), move |m: &Message| {
                tx.send(m.clone()).context("test receiver gone")
            }),
        );
    }

    let server = ListenerServer::new(&config, Arc::new(registry.clone()));
    server.start().await.context("server failed to start")?;
    let addr = server.local_addr().await.context("no local address")?;
    Ok(Bus {
        server,
        addr,
        registry,
        delivered,
    })
}

pub async fn client() -> Result<UdpSocket> {
    UdpSocket::bind("127.0.0.1:0")
        .await
        .context("failed to bind client socket")
}

pub async fn send_all(socket: &UdpSocket, to: SocketAddr, packets: &[Bytes]) -> Result<()> {
    for packet in packets {
        socket.send_to(packet, to).await.context("send_to failed")?;
    }
    Ok(())
}

/// Next delivered message, or `None` after `RECV_TIMEOUT`.
pub async fn next_message(bus: &mut Bus) -> Option<Message> {
    tokio::time::timeout(RECV_TIMEOUT, bus.delivered.recv())
        .await
        .ok()
        .flatten()
}

/// Assert nothing more arrives within a short grace period.
pub async fn assert_quiet(bus: &mut Bus) {
    let extra = tokio::time::timeout(Duration::from_millis(200), bus.delivered.recv()).await;
    assert!(extra.is_err(), "unexpected extra delivery: {:?}", extra);
}

/// Poll `cond` until it holds or `RECV_TIMEOUT` passes.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

pub fn props(value: serde_json::Value) -> Properties {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}
