//! Loopback relay demo
//!
//! Starts a relay with N in-memory radios, has each radio hear a few
//! packets (plus an echo of the first one), and prints what happened.
//!
//! Run with: cargo run --example loopback_relay -- --endpoints 4 --messages 20

use anyhow::Result;
use clap::Parser;
use meshrelay::config::RelayConfig;
use meshrelay::endpoints::memory::{MemoryEndpoint, MemoryHandle};
use meshrelay::Relay;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Relay between in-memory mesh radios", long_about = None)]
struct Args {
    /// Number of loopback radios
    #[arg(short, long, default_value_t = 3)]
    endpoints: usize,

    /// Packets heard by each radio
    #[arg(short, long, default_value_t = 10)]
    messages: u32,

    /// Optional relay configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RelayConfig::load(path).await?,
        None => RelayConfig::default(),
    };
    let relay = Relay::start(config).await?;

    let mut radios: Vec<MemoryHandle> = Vec::with_capacity(args.endpoints);
    for i in 0..args.endpoints {
        let (endpoint, handle) = MemoryEndpoint::new(format!("radio{}", i));
        relay.add_endpoint(Arc::new(endpoint))?;
        radios.push(handle);
    }

    for _ in 0..100 {
        if relay.stats().connected_endpoints == args.endpoints {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    info!("{} radios connected", relay.stats().connected_endpoints);

    for (r, radio) in radios.iter().enumerate() {
        for m in 0..args.messages {
            let packet_id = ((r as u32) << 16) | m;
            radio.inject_text(packet_id, &format!("!{:08x}", r), 0, &format!("hello {} from radio{}", m, r));
        }
    }
    // The next radio hears radio0's first packet again.
    if let Some(next) = radios.get(1) {
        next.inject_text(0, "!00000000", 0, "hello 0 from radio0");
    }

    tokio::time::sleep(Duration::from_millis(500)).await;

    for radio in &radios {
        info!("{} transmitted {} packet(s)", radio.id(), radio.sent_count());
    }
    for record in relay.endpoints() {
        info!(
            "{}: status={} received={} sent={} errors={}",
            record.id, record.status, record.received, record.sent, record.errors
        );
    }

    let stats = relay.stats();
    info!(
        "Totals: received={} forwarded={} duplicates={} filtered={} send_errors={} tracked={}",
        stats.received,
        stats.forwarded,
        stats.dropped_duplicate,
        stats.dropped_filtered,
        stats.send_errors,
        stats.tracked_fingerprints
    );

    relay.stop().await;
    Ok(())
}
