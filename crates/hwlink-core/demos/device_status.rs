//! Device status report
//!
//! Connects to a device, negotiates the packet version and prints the
//! device status.
//!
//! Usage:
//!   cargo run --example device_status -- [OPTIONS] [PORT]
//!
//! Options:
//!   --config FILE     JSON connection configuration
//!   --list            List serial ports and exit
//!
//! Without a port the first recognised device is used.

use anyhow::{bail, Context, Result};
use hwlink_core::protocol::{
    find_device, identify_device, list_ports, ConnectionConfig, DeviceConnection, PacketVersion,
    SerialTransport,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut port = None;
    let mut config_path = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config_path = Some(args.next().context("--config needs a file")?);
            }
            "--list" | "-l" => {
                for port in list_ports() {
                    let ids = match (port.vid, port.pid) {
                        (Some(vid), Some(pid)) => format!("{:04x}:{:04x}", vid, pid),
                        _ => String::new(),
                    };
                    println!(
                        "{:<20} {:<9} {}",
                        port.name,
                        ids,
                        match identify_device(&port) {
                            Some(d) if d.in_bootloader() => "device (bootloader)",
                            Some(_) => "device",
                            None => "",
                        }
                    );
                }
                return Ok(());
            }
            other if other.starts_with('-') => bail!("unknown option {}", other),
            other => port = Some(other.to_string()),
        }
    }

    let mut config = match config_path {
        Some(path) => ConnectionConfig::load(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => ConnectionConfig::default(),
    };

    let port = match port {
        Some(port) => port,
        None => {
            let device = find_device().context("no device found")?;
            config.in_bootloader = device.in_bootloader();
            device.port.name
        }
    };

    let (transport, events) = SerialTransport::new(&port, config.baud_rate);
    let connection = DeviceConnection::new(transport, events, config);
    connection
        .open()
        .await
        .with_context(|| format!("opening {}", port))?;

    if connection.is_in_bootloader() {
        println!("{}: device is in bootloader mode", port);
        connection.destroy().await?;
        return Ok(());
    }

    let version = connection.negotiate_version().await?;
    println!("{}: packet version {}", port, version);

    if version == PacketVersion::V3 {
        let status = connection.get_status().await?;
        println!("{:#?}", status);
    }

    let counters = connection.counters();
    println!(
        "tx {} bytes / rx {} bytes, {} retransmissions",
        counters.tx_bytes, counters.rx_bytes, counters.retransmissions
    );

    connection.destroy().await?;
    Ok(())
}
