//! dgbusd: datagram bus daemon.
//!
//! Listens for dgbus packets and logs every message delivered to the
//! subscribed topics.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use dgbus_core::config::DgbusConfig;
use dgbus_services::{ListenerServer, TopicRegistry};

mod sink;

const DEFAULT_TOPIC: &str = "events";

fn parse_topics() -> Result<Vec<String>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut topics = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--topic" => {
                i += 1;
                topics.push(args.get(i).context("--topic requires a value")?.clone());
            }
            "--help" | "-h" => {
                println!("Usage: dgbusd [--topic <topic>]...");
                println!();
                println!("Subscribes a log sink to each topic (default: {DEFAULT_TOPIC}).");
                println!("Configuration: $DGBUS_CONFIG or ~/.config/dgbus/config.toml");
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
        i += 1;
    }
    if topics.is_empty() {
        topics.push(DEFAULT_TOPIC.to_string());
    }
    Ok(topics)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let topics = parse_topics()?;

    // Load config
    if let Err(e) = DgbusConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = DgbusConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        DgbusConfig::default()
    });

    let registry = TopicRegistry::new();
    for topic in &topics {
        registry.subscribe(topic.clone(), Arc::new(sink::LogSink::new(topic)));
    }
    tracing::info!(topics = ?topics, "subscriptions ready");

    let server = Arc::new(ListenerServer::new(&config, Arc::new(registry)));
    server.start().await.context("failed to start listener")?;

    let stats_printer = {
        let server = server.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                server.stats().print_stats(server.ledger().in_flight());
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown signal received");

    stats_printer.abort();
    server.stop().await;
    Ok(())
}
