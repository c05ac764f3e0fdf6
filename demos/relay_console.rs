//! Console relay example
//!
//! Connects to the first sensor advertising a supported service and prints
//! every temperature and humidity reading. Points are logged in line protocol.
//!
//! Run with: RUST_LOG=info cargo run --example relay_console

use ble_relay::{BleRelay, LoggingSink, MeasurementKind, RelayConfig, Result, Sample};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    println!("BLE Relay");
    println!("=========\n");
    println!("Waiting for a sensor...");
    println!("Press Ctrl+C to exit.\n");

    let relay = BleRelay::with_btleplug(Some(Arc::new(LoggingSink)), RelayConfig::default()).await?;
    relay.start().await?;

    let mut temperatures = relay.samples(MeasurementKind::Temperature);
    let mut humidity = relay.samples(MeasurementKind::Humidity);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nExiting...");
                break;
            }
            Some(sample) = next(&mut temperatures) => print_sample(&sample, "°C"),
            Some(sample) = next(&mut humidity) => print_sample(&sample, "%"),
        }
    }

    relay.shutdown().await?;

    Ok(())
}

async fn next(receiver: &mut Option<ble_relay::SampleReceiver>) -> Option<Sample> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn print_sample(sample: &Sample, unit: &str) {
    println!(
        "[{}] {} {}: {:.2}{}",
        sample.timestamp.format("%H:%M:%S"),
        sample.peripheral_name.as_deref().unwrap_or(sample.peripheral.as_str()),
        sample.kind(),
        sample.measurement.value(),
        unit
    );
}
