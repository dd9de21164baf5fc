//! Device Link Protocol
//!
//! Implements the framed request/response protocol spoken by hardware
//! wallets over a serial link.
//!
//! Current devices speak the v3 packet format (16-byte header, CRC16,
//! typed packets). First-generation firmware speaks the v1/v2 formats,
//! which are still negotiated and supported for plain data exchange.

pub mod bootloader;
pub mod commands;
mod connection;
mod crc;
mod dispatch;
mod error;
pub mod legacy;
pub mod packet;
pub mod payload;
pub mod pool;
mod send;
pub mod serial;
pub mod transport;
mod version;
pub mod wait;

pub use bootloader::BootloaderError;
pub use commands::{CommandChannel, CommandOutput, SdkVersion};
pub use connection::{ConnectionConfig, ConnectionCounters, ConnectionState, DeviceConnection};
pub use crc::crc16;
pub use error::ProtocolError;
pub use legacy::{LegacyCodec, LegacyFrame};
pub use packet::{Frame, FrameCodec, FrameError, PacketType};
pub use payload::{CmdState, DeviceIdleState, DeviceWaitOn, Payload, RawData, StatusData};
pub use pool::{PacketPool, PoolEntry};
pub use send::Expect;
pub use serial::{
    find_device, identify_device, list_ports, DeviceInfo, PortInfo, SerialTransport,
};
pub use transport::{Transport, TransportEvent};
pub use version::PacketVersion;
pub use wait::{reject_reason, PacketWait, WaitCanceller};

/// Default baud rate for device communication
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for ACKs and responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Default maximum payload bytes per v3 frame
pub const DEFAULT_CHUNK_SIZE: usize = 128;

/// Sequence number reserved for status traffic
pub const STATUS_SEQUENCE_NUMBER: u16 = 0xFFFF;
