//! # hwlink Core Library
//!
//! Host-side protocol engine for hardware wallets attached over a serial link.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Packet framing with CRC16 integrity checks (v1, v2 and v3 formats)
//! - Packet version negotiation
//! - Request/response correlation with retries and timeouts
//! - Command orchestration: send, status polling, output retrieval, abort
//! - A serial transport and USB device discovery
//!
//! ## Example
//!
//! ```rust,ignore
//! use hwlink_core::protocol::{find_device, ConnectionConfig, DeviceConnection, SerialTransport};
//!
//! let device = find_device()?;
//! let config = ConnectionConfig::default();
//! let (transport, events) = SerialTransport::new(&device.port.name, config.baud_rate);
//!
//! let connection = DeviceConnection::new(transport, events, config);
//! connection.open().await?;
//! connection.negotiate_version().await?;
//!
//! let status = connection.get_status().await?;
//! println!("Device state: {:?}", status.device_idle_state);
//! ```

pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        BootloaderError, CommandChannel, CommandOutput, ConnectionConfig, ConnectionState,
        DeviceConnection, PacketType, PacketVersion, ProtocolError, RawData, SdkVersion,
        SerialTransport, StatusData, Transport, TransportEvent,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
