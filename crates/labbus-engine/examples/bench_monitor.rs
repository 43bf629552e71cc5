use std::env;

use labbus_core::config::ConfigBuilder;
use labbus_core::deps::anyhow;
use labbus_devices::registry::BusRegistry;
use labbus_engine::{Ieee488Driver, Instrument};

/// Monitor every configured instrument as a generic IEEE 488.2 device
///
/// Usage: `cargo run --example bench_monitor -- <config.toml>`
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = env::args().nth(1).unwrap_or_else(|| "labbus.toml".to_string());
    let config = ConfigBuilder::new()
        .with_config_file(&path)
        .with_environment_prefix("LABBUS")
        .build()?;
    labbus_core::logging::init_from_config(&config.logging)?;

    let registry = BusRegistry::from_config(&config)?;
    registry.start_all().await?;

    let mut instruments = Vec::new();
    for entry in &config.instruments {
        let device = registry.device_named(&entry.name)?;
        let instrument = Instrument::from_config(Ieee488Driver::new(), device, entry, &config.bus)?;

        let name = entry.name.clone();
        instrument.add_status_listener(move |sample| {
            println!(
                "[{}] {} stb={} esr={:#04x}",
                sample.acquired_at.format("%H:%M:%S%.3f"),
                name,
                sample.value.status_byte,
                sample.value.event_status
            );
        });
        let name = entry.name.clone();
        instrument.add_settings_listener(move |sample| println!("{} is {}", name, sample.value));
        let name = entry.name.clone();
        instrument.add_interrupt_listener(move |status| println!("{} requested service ({})", name, status));

        instrument.start().await?;
        instrument.clear()?;
        instruments.push(instrument);
    }

    tokio::signal::ctrl_c().await?;

    for instrument in &instruments {
        instrument.stop().await;
    }
    registry.stop_all().await?;
    Ok(())
}
