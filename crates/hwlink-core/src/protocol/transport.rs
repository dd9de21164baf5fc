//! Byte-stream transport contract
//!
//! The engine never touches a port directly. A transport writes bytes and
//! reports what it reads as [`TransportEvent`]s on an mpsc channel handed to
//! [`DeviceConnection::new`](super::DeviceConnection::new).

use std::io;

use async_trait::async_trait;

/// Events delivered by a transport, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A chunk of bytes read from the device
    Data(Vec<u8>),
    /// The link went away, with an optional reason
    Closed(Option<String>),
}

/// Half-duplex byte link to the device
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the underlying link
    async fn open(&self) -> io::Result<()>;

    /// Close the underlying link
    async fn close(&self) -> io::Result<()>;

    /// Whether the link is open for reading and writing
    fn is_open(&self) -> bool;

    /// Whether the device is still attached
    fn is_connected(&self) -> bool;

    /// Write `data`, resolving once it has been flushed
    async fn write(&self, data: &[u8]) -> io::Result<()>;
}
