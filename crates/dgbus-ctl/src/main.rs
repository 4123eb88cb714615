//! dgbus-ctl: send messages to a dgbus listener.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::net::{lookup_host, UdpSocket};
use uuid::Uuid;

use dgbus_core::message::encode_properties;
use dgbus_core::wire::{split_message, MAX_PACKET_SIZE};

const DEFAULT_TARGET: &str = "127.0.0.1:7420";

// ── Subcommand handlers ───────────────────────────────────────────────────────

async fn resolve(target: &str) -> Result<SocketAddr> {
    lookup_host(target)
        .await
        .with_context(|| format!("failed to resolve {target}"))?
        .next()
        .with_context(|| format!("{target} resolved to no addresses"))
}

async fn cmd_send(target: &str, packet_size: usize, topic: &str, body: &str) -> Result<()> {
    let properties = match serde_json::from_str::<Value>(body).context("body is not valid JSON")? {
        Value::Object(map) => map,
        _ => anyhow::bail!("body must be a JSON object"),
    };
    let payload = encode_properties(&properties);

    let id = Uuid::new_v4();
    let packets = split_message(id, topic, &payload, packet_size)
        .context("failed to split message")?;

    let addr = resolve(target).await?;
    let bind = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind).await.context("failed to bind UDP socket")?;
    for packet in &packets {
        socket
            .send_to(packet, addr)
            .await
            .with_context(|| format!("failed to send to {addr}"))?;
    }

    println!(
        "Sent {} ({} bytes) to {} in {} packet(s)",
        id,
        payload.len(),
        addr,
        packets.len()
    );
    Ok(())
}

fn print_usage() {
    println!("dgbus-ctl: send messages to a dgbus listener");
    println!();
    println!("Usage: dgbus-ctl [--target <host:port>] [--packet-size <n>] <command>");
    println!();
    println!("Commands:");
    println!("  send <topic> <json-object>   Publish a property map on a topic");
    println!("  help                         Show this message");
    println!();
    println!("Defaults: --target {DEFAULT_TARGET} --packet-size {MAX_PACKET_SIZE}");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut target = DEFAULT_TARGET.to_string();
    let mut packet_size = MAX_PACKET_SIZE;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--target" => {
                i += 1;
                target = args.get(i).context("--target requires a value")?.clone();
            }
            "--packet-size" => {
                i += 1;
                packet_size = args
                    .get(i)
                    .context("--packet-size requires a value")?
                    .parse()
                    .context("--packet-size must be a number")?;
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["send", topic, body] => cmd_send(&target, packet_size, topic, body).await,
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
