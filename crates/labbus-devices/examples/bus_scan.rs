use std::env;
use std::time::Duration;

use labbus_core::config::ControllerConfig;
use labbus_core::deps::anyhow::{self, Context};
use labbus_devices::controller::Controller;
use labbus_devices::discovery::{scan_bus, ScanOptions};

/// Scan a Prologix bridge for instruments
///
/// Usage: `cargo run --example bus_scan -- <host> [port]`
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    labbus_core::logging::init_with_filter("info")?;

    let mut args = env::args().skip(1);
    let host = args.next().context("missing bridge host")?;
    let port = match args.next() {
        Some(port) => port.parse().context("invalid port")?,
        None => 1234,
    };

    let controller = Controller::network(&ControllerConfig::new("bridge", host, port));
    controller.start().await?;

    let options = ScanOptions {
        identify: true,
        timeout: Duration::from_secs(2),
        ..ScanOptions::default()
    };
    let found = scan_bus(&controller, &options).await?;

    println!("Found {} instrument(s)", found.len());
    for device in &found {
        println!(
            "  {:>6}  status {}  {}",
            device.address.to_string(),
            device.status,
            device.identity.as_deref().unwrap_or("-")
        );
    }

    controller.stop().await;
    Ok(())
}
