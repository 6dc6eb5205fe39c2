mod device;
mod envelope;

use clap::Parser;
use device::{run_device, DeviceOptions};
use envelope::Identity;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Simulated home devices speaking the hub's envelope protocol.
#[derive(Parser, Debug)]
#[command(name = "simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Number of simulated devices
    #[arg(long, env = "DEVICES", default_value_t = 10)]
    devices: usize,

    #[arg(long, env = "LOCATION", default_value = "lab")]
    location: String,

    /// Telemetry period per device
    #[arg(long, env = "INTERVAL_MS", default_value_t = 1000)]
    interval_ms: u64,

    /// Send every n-th telemetry message in the legacy headerless shape (0 = never)
    #[arg(long, env = "LEGACY_EVERY", default_value_t = 0)]
    legacy_every: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting device simulator");
    info!(
        "Broker: {}:{}, Devices: {}, Interval: {}ms",
        args.broker, args.port, args.devices, args.interval_ms
    );

    let options = DeviceOptions {
        broker: args.broker,
        port: args.port,
        telemetry_interval: Duration::from_millis(args.interval_ms.max(1)),
        legacy_every: args.legacy_every,
    };

    let handles: Vec<_> = (0..args.devices)
        .map(|i| {
            let identity = Identity::new(format!("sim-{}", i), args.location.clone());
            tokio::spawn(run_device(identity, options.clone()))
        })
        .collect();

    tokio::select! {
        _ = join_devices(handles) => {
            error!("All device tasks terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }
}

async fn join_devices(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Device task failed: {}", e);
        }
    }
}
