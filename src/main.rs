use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use ble_pulse_lib::config::{AppConfig, CONFIG_FILE_NAME};
use ble_pulse_lib::core::SessionHandle;
use ble_pulse_lib::core::bluetooth::{ConnectionState, PeripheralId, SessionSnapshot};
use ble_pulse_lib::logging::init_logging;
use ble_pulse_lib::state::AppState;
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::time::timeout;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "ble-pulse")]
#[command(about = "Scan for BLE peripherals and read their GATT tables", long_about = None)]
#[command(version)]
struct Cli {
    /// Path of the JSON configuration file
    #[arg(short, long, default_value = CONFIG_FILE_NAME)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List advertising peripherals
    Scan {
        #[arg(short, long, default_value = "10")]
        seconds: u64,
        /// Only report peripherals advertising this service (repeatable)
        #[arg(long = "service")]
        services: Vec<Uuid>,
    },
    /// Connect to a peripheral by name or address and dump its services
    Inspect {
        target: String,
        #[arg(short, long, default_value = "10")]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let loaded = AppConfig::read(&cli.config).await?;
    let found = loaded.is_some();
    let config = loaded.unwrap_or_default();
    init_logging(&config.logging)?;
    if found {
        info!("Config loaded from {:?}", cli.config);
    } else {
        warn!("Config file not found at {:?}, using default.", cli.config);
    }

    let state = AppState::new(config).await?;
    let session = state.session();
    wait_for_power(&session).await?;

    let result = match cli.command {
        Commands::Scan { seconds, services } => {
            let filter = (!services.is_empty()).then_some(services);
            scan(&session, filter, seconds).await
        }
        Commands::Inspect { target, seconds } => inspect(&session, &target, seconds).await,
    };

    state.shutdown();
    result
}

async fn wait_for_power(session: &SessionHandle) -> Result<()> {
    let mut snapshots = session.subscribe();
    timeout(Duration::from_secs(5), snapshots.wait_for(|s| s.powered_on))
        .await
        .context("Bluetooth adapter did not power on")??;
    Ok(())
}

async fn scan(session: &SessionHandle, filter: Option<Vec<Uuid>>, seconds: u64) -> Result<()> {
    session.start_scan(filter).await?;
    info!("Scanning for {} seconds...", seconds);
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    session.stop_scan().await?;

    let snapshot = session.snapshot().await?;
    println!("{:<40} {:>5} {:>7}  NAME", "ADDRESS", "RSSI", "SEEN");
    for peripheral in &snapshot.peripherals {
        println!(
            "{:<40} {:>5} {:>7}  {}",
            peripheral.address,
            peripheral.rssi,
            peripheral.discover_count + 1,
            peripheral.name
        );
    }
    Ok(())
}

async fn inspect(session: &SessionHandle, target: &str, seconds: u64) -> Result<()> {
    session.start_scan(None).await?;
    let mut snapshots = session.subscribe();
    let found = timeout(
        Duration::from_secs(seconds),
        snapshots.wait_for(|s| find_peripheral(s, target).is_some()),
    )
    .await;
    let peripheral = match found {
        Ok(Ok(snapshot)) => find_peripheral(&snapshot, target),
        _ => None,
    };
    let Some(peripheral) = peripheral else {
        session.stop_scan().await?;
        bail!("No peripheral named {} was found", target);
    };

    session.connect(peripheral).await?;
    let settled = timeout(
        Duration::from_secs(seconds),
        snapshots.wait_for(|s| {
            matches!(
                s.connection_state,
                ConnectionState::Connected | ConnectionState::Error
            )
        }),
    )
    .await
    .is_ok();

    let snapshot = session.snapshot().await?;
    if !settled {
        warn!("Discovery did not finish in {} seconds", seconds);
    }
    if snapshot.connection_state == ConnectionState::Error {
        bail!(
            "Connection failed: {}",
            snapshot.last_error.as_deref().unwrap_or("unknown error")
        );
    }

    print_gatt(&snapshot);
    session.disconnect().await?;
    if timeout(
        Duration::from_secs(seconds),
        session.wait_for_connection(ConnectionState::Disconnected),
    )
    .await
    .is_err()
    {
        warn!("{} did not confirm the disconnect", target);
    }
    Ok(())
}

fn find_peripheral(snapshot: &SessionSnapshot, target: &str) -> Option<PeripheralId> {
    snapshot
        .peripherals
        .iter()
        .find(|p| p.name == target || p.address.as_str() == target)
        .map(|p| p.id)
}

fn print_gatt(snapshot: &SessionSnapshot) {
    if let Some(peripheral) = snapshot.target.and_then(|id| snapshot.peripheral(id)) {
        println!("{} ({})", peripheral.name, peripheral.address);
    }
    for service in &snapshot.services {
        println!("  service {}", service.uuid);
        for characteristic in snapshot.characteristics_of(service.id) {
            println!(
                "    {} {:<24} {}",
                characteristic.uuid, characteristic.label, characteristic.value
            );
        }
    }
}
