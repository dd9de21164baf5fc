//! Connection management
//!
//! Handles the connection lifecycle, packet version negotiation and the
//! public API of the protocol engine.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::commands::{CommandChannel, CommandOutput, SdkVersion};
use super::dispatch::{run_dispatcher, Session};
use super::legacy::LegacyFrame;
use super::packet::{Frame, FrameCodec, PacketType};
use super::payload::{RawData, StatusData};
use super::pool::{PoolEntry, DEFAULT_POOL_LIMIT};
use super::send::Expect;
use super::transport::{Transport, TransportEvent};
use super::version::PacketVersion;
use super::wait::PacketWait;
use super::{ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_CHUNK_SIZE, DEFAULT_TIMEOUT_MS};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Transport closed
    Disconnected,
    /// Transport open, packet version unknown
    Open,
    /// Negotiation in progress
    Connecting,
    /// Packet version negotiated
    Connected,
    /// Negotiation failed
    Error,
}

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Baud rate used by serial transports
    pub baud_rate: u32,
    /// Response timeout for v3 frames in milliseconds
    pub ack_timeout_ms: u64,
    /// ACK timeout for legacy frames in milliseconds
    pub legacy_ack_timeout_ms: u64,
    /// Attempts per frame
    pub max_tries: u32,
    /// Attempts per packet version while negotiating
    pub negotiation_tries: u32,
    /// Delay between status polls while waiting for command output
    pub poll_interval_ms: u64,
    /// Maximum payload per v3 frame
    pub chunk_size: usize,
    /// Device is in its bootloader; traffic is passed through unframed
    pub in_bootloader: bool,
    /// Unclaimed frames kept per packet type
    pub pool_limit: usize,
    /// ACK timeout for the first bootloader packet in milliseconds
    pub bootloader_first_ack_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            ack_timeout_ms: DEFAULT_TIMEOUT_MS,
            legacy_ack_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_tries: 5,
            negotiation_tries: 3,
            poll_interval_ms: 200,
            chunk_size: DEFAULT_CHUNK_SIZE,
            in_bootloader: false,
            pool_limit: DEFAULT_POOL_LIMIT,
            bootloader_first_ack_timeout_ms: 10_000,
        }
    }
}

impl ConnectionConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Load a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
            .map_err(|e| ProtocolError::InvalidConfig(e.to_string()))
    }

    /// [`ConnectionConfig::poll_interval_ms`] as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) tx_bytes: AtomicU64,
    pub(crate) rx_bytes: AtomicU64,
    pub(crate) tx_frames: AtomicU64,
    pub(crate) rx_frames: AtomicU64,
    pub(crate) retransmissions: AtomicU64,
    pub(crate) malformed_frames: AtomicU64,
}

/// Traffic statistics of a connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionCounters {
    /// Bytes written to the transport
    pub tx_bytes: u64,
    /// Bytes received from the transport
    pub rx_bytes: u64,
    /// Frames written
    pub tx_frames: u64,
    /// Frames decoded, well-formed or not
    pub rx_frames: u64,
    /// Repeated attempts after a transient failure
    pub retransmissions: u64,
    /// Frames dropped or NACKed as malformed
    pub malformed_frames: u64,
}

impl Counters {
    fn snapshot(&self) -> ConnectionCounters {
        ConnectionCounters {
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
        }
    }
}

/// Shared core of a connection, owned by the handle, the dispatcher and
/// every [`CommandChannel`]
pub(crate) struct ConnectionInner {
    pub(crate) connection_id: Uuid,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) session: Arc<Session>,
    pub(crate) codec: FrameCodec,
    pub(crate) config: ConnectionConfig,
    /// Serialises logical operations; negotiation holds it exclusively
    pub(crate) operation_lock: tokio::sync::Mutex<()>,
    pub(crate) counters: Counters,
}

impl ConnectionInner {
    fn legacy_version(&self) -> Result<PacketVersion, ProtocolError> {
        match self.session.working_version() {
            Some(version) if version.is_legacy() => Ok(version),
            Some(version) => Err(ProtocolError::UnsupportedVersion(version)),
            None => Err(ProtocolError::VersionNotNegotiated),
        }
    }
}

/// Connection to one device
///
/// Must be created inside a tokio runtime: it spawns the dispatch task.
pub struct DeviceConnection {
    inner: Arc<ConnectionInner>,
    dispatcher: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl DeviceConnection {
    /// Create a connection over `transport`, consuming its `events`
    pub fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
        config: ConnectionConfig,
    ) -> Self {
        let inner = Arc::new(ConnectionInner {
            connection_id: Uuid::new_v4(),
            transport,
            session: Arc::new(Session::new(config.in_bootloader, config.pool_limit)),
            codec: FrameCodec::new(config.chunk_size),
            config,
            operation_lock: tokio::sync::Mutex::new(()),
            counters: Counters::default(),
        });

        if inner.transport.is_open() {
            inner.session.reopen();
        }

        let shutdown = CancellationToken::new();
        let dispatcher = tokio::spawn(run_dispatcher(
            Arc::clone(&inner),
            events,
            shutdown.clone(),
        ));

        info!(connection_id = %inner.connection_id, "Connection created");

        Self {
            inner,
            dispatcher: Some(dispatcher),
            shutdown,
        }
    }

    /// Open the transport
    pub async fn open(&self) -> Result<(), ProtocolError> {
        self.inner.transport.open().await?;
        self.inner.session.reopen();
        info!(connection_id = %self.inner.connection_id, "Connection opened");
        Ok(())
    }

    /// Close the transport, rejecting every pending wait
    pub async fn close(&self) -> Result<(), ProtocolError> {
        let result = self.inner.transport.close().await;
        self.inner.session.close();
        info!(connection_id = %self.inner.connection_id, "Connection closed");
        result.map_err(ProtocolError::from)
    }

    /// Close the connection and stop its dispatch task
    pub async fn destroy(mut self) -> Result<(), ProtocolError> {
        let result = if self.inner.transport.is_open() {
            self.close().await
        } else {
            self.inner.session.close();
            Ok(())
        };

        self.shutdown.cancel();
        if let Some(dispatcher) = self.dispatcher.take() {
            if let Err(e) = dispatcher.await {
                warn!("Dispatcher task failed: {}", e);
            }
        }
        result
    }

    /// Whether the transport is open
    pub fn is_open(&self) -> bool {
        self.inner.transport.is_open()
    }

    /// Whether the device is still attached
    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.inner.session.state()
    }

    /// Identifier used in log lines of this connection
    pub fn connection_id(&self) -> Uuid {
        self.inner.connection_id
    }

    /// Configuration the connection was created with
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Snapshot of the traffic counters
    pub fn counters(&self) -> ConnectionCounters {
        self.inner.counters.snapshot()
    }

    /// Pass traffic through unframed (device in bootloader) or decode it
    pub fn set_in_bootloader(&self, in_bootloader: bool) {
        self.inner.session.set_raw_mode(in_bootloader);
    }

    /// Whether traffic is passed through unframed
    pub fn is_in_bootloader(&self) -> bool {
        self.inner.session.raw_mode()
    }

    /// Negotiate the packet version spoken by the device.
    ///
    /// Returns the latched version without wire traffic once negotiated.
    pub async fn negotiate_version(&self) -> Result<PacketVersion, ProtocolError> {
        let _guard = self.inner.operation_lock.lock().await;
        self.negotiate_exclusive().await
    }

    /// Forget the negotiated version and probe again
    pub async fn renegotiate_version(&self) -> Result<PacketVersion, ProtocolError> {
        let _guard = self.inner.operation_lock.lock().await;
        self.inner.session.set_working_version(None);
        self.negotiate_exclusive().await
    }

    async fn negotiate_exclusive(&self) -> Result<PacketVersion, ProtocolError> {
        if self.inner.session.raw_mode() {
            debug!("Device is in bootloader, no packet version to negotiate");
            return Err(ProtocolError::NoWorkingPacketVersion);
        }

        if self.inner.session.working_version().is_none() {
            self.inner.session.set_state(ConnectionState::Connecting);
        }

        let result = self.inner.negotiate_locked().await;

        let state = match &result {
            Ok(_) => ConnectionState::Connected,
            Err(_) if self.inner.session.is_closed() => ConnectionState::Disconnected,
            Err(ProtocolError::ConnectionNotOpen) => ConnectionState::Disconnected,
            Err(_) => ConnectionState::Error,
        };
        self.inner.session.set_state(state);
        result
    }

    /// Negotiated packet version, if any
    pub fn working_version(&self) -> Option<PacketVersion> {
        self.inner.session.working_version()
    }

    /// Allocate a sequence number for a new command
    pub fn new_sequence_number(&self) -> u16 {
        self.inner.session.allocate_sequence()
    }

    /// Most recently allocated sequence number
    pub fn latest_sequence_number(&self) -> u16 {
        self.inner.session.latest_sequence()
    }

    /// Command operations; only available on v3
    pub fn commands(&self) -> Result<CommandChannel, ProtocolError> {
        match self.inner.session.working_version() {
            Some(PacketVersion::V3) => Ok(CommandChannel::new(Arc::clone(&self.inner))),
            Some(version) => Err(ProtocolError::UnsupportedVersion(version)),
            None => Err(ProtocolError::VersionNotNegotiated),
        }
    }

    /// See [`CommandChannel::send_command`]
    pub async fn send_command(
        &self,
        command_type: u32,
        data: &[u8],
        sequence_number: u16,
    ) -> Result<(), ProtocolError> {
        self.commands()?
            .send_command(command_type, data, sequence_number)
            .await
    }

    /// See [`CommandChannel::get_status`]
    pub async fn get_status(&self) -> Result<StatusData, ProtocolError> {
        self.commands()?.get_status().await
    }

    /// See [`CommandChannel::get_sdk_version`]
    pub async fn get_sdk_version(&self) -> Result<SdkVersion, ProtocolError> {
        self.commands()?.get_sdk_version().await
    }

    /// See [`CommandChannel::get_command_output`]
    pub async fn get_command_output(
        &self,
        sequence_number: u16,
    ) -> Result<CommandOutput, ProtocolError> {
        self.commands()?.get_command_output(sequence_number).await
    }

    /// See [`CommandChannel::wait_for_command_output`]. Polls at the
    /// configured interval.
    pub async fn wait_for_command_output<F>(
        &self,
        sequence_number: u16,
        expected_command_types: &[u32],
        on_status: F,
    ) -> Result<RawData, ProtocolError>
    where
        F: FnMut(&StatusData),
    {
        self.commands()?
            .wait_for_command_output(
                sequence_number,
                expected_command_types,
                on_status,
                self.inner.config.poll_interval(),
            )
            .await
    }

    /// See [`CommandChannel::send_abort`]
    pub async fn send_abort(&self, sequence_number: u16) -> Result<StatusData, ProtocolError> {
        self.commands()?.send_abort(sequence_number).await
    }

    /// Register a wait for a response frame
    pub fn wait_for(
        &self,
        packet_types: &[PacketType],
        sequence_number: u16,
        timeout: Duration,
    ) -> Result<PacketWait, ProtocolError> {
        self.inner.wait_for(packet_types, sequence_number, timeout)
    }

    /// Send pre-encoded frames with retries, returning the response to the
    /// last one when `expect` is given
    pub async fn send_frames(
        &self,
        frames: &[Vec<u8>],
        expect: Option<Expect<'_>>,
    ) -> Result<Option<Frame>, ProtocolError> {
        let _guard = self.inner.operation_lock.lock().await;
        self.inner
            .send_with_retry(frames, expect, self.inner.config.max_tries)
            .await
    }

    /// Unclaimed frames of the given types, oldest first
    pub fn get_packets_from_pool(&self, packet_types: &[PacketType]) -> Vec<PoolEntry<Frame>> {
        self.inner.session.get_packets(packet_types)
    }

    /// Remove a frame from the pool. Returns whether it was pooled.
    pub fn mark_consumed(&self, id: Uuid) -> bool {
        self.inner.session.mark_consumed(id)
    }

    /// Every well-formed v3 frame, as it arrives
    pub fn subscribe_data(&self) -> broadcast::Receiver<Frame> {
        self.inner.session.subscribe_data()
    }

    /// Unframed traffic while the device is in its bootloader
    pub fn subscribe_raw(&self) -> broadcast::Receiver<Vec<u8>> {
        self.inner.session.subscribe_raw()
    }

    /// Ask a device in its bootloader to abandon the firmware upload.
    ///
    /// Writes the abort byte and waits for the bootloader to acknowledge it.
    pub async fn send_bootloader_abort(&self) -> Result<(), ProtocolError> {
        let _guard = self.inner.operation_lock.lock().await;
        self.inner.bootloader_abort().await
    }

    /// Upload a firmware image to a device in its bootloader.
    ///
    /// Every block must be acknowledged before the next is sent; a rejection
    /// code from the bootloader ends the upload with
    /// [`ProtocolError::Bootloader`]. `on_progress` receives the percentage
    /// sent after each block.
    pub async fn send_firmware<F>(
        &self,
        firmware: &[u8],
        on_progress: F,
    ) -> Result<(), ProtocolError>
    where
        F: FnMut(f64),
    {
        let _guard = self.inner.operation_lock.lock().await;
        self.inner.bootloader_upload(firmware, on_progress).await
    }

    /// Send data to a legacy device
    pub async fn send_legacy_data(&self, command_type: u32, data: &[u8]) -> Result<(), ProtocolError> {
        let version = self.inner.legacy_version()?;
        let _guard = self.inner.operation_lock.lock().await;
        self.inner
            .send_legacy(version, command_type, data, self.inner.config.max_tries)
            .await
    }

    /// Receive one complete legacy message of one of `command_types`
    pub async fn receive_legacy_data(
        &self,
        command_types: &[u32],
        timeout: Duration,
    ) -> Result<RawData, ProtocolError> {
        self.inner.legacy_version()?;

        let mut incoming = self.inner.session.subscribe_legacy_data();
        let mut closed = self.inner.session.closed_watch();
        let mut assembly = LegacyAssembly::default();

        for entry in self.inner.session.get_legacy_packets(command_types) {
            if let Some(message) = assembly.push(&self.inner, entry) {
                return Ok(message);
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, async {
                tokio::select! {
                    entry = incoming.recv() => Some(entry),
                    _ = closed.wait_for(|closed| *closed) => None,
                }
            })
            .await;

            match event {
                Err(_) if !self.inner.transport.is_open() => {
                    return Err(ProtocolError::ConnectionClosed)
                }
                Err(_) => return Err(ProtocolError::ReadTimeout),
                Ok(None) | Ok(Some(Err(RecvError::Closed))) => {
                    return Err(ProtocolError::ConnectionClosed)
                }
                Ok(Some(Err(RecvError::Lagged(skipped)))) => {
                    warn!(skipped, "Legacy data listener lagged");
                }
                Ok(Some(Ok(entry))) if command_types.contains(&entry.packet.command_type) => {
                    if let Some(message) = assembly.push(&self.inner, entry) {
                        return Ok(message);
                    }
                }
                Ok(Some(Ok(_))) => {}
            }
        }
    }
}

impl Drop for DeviceConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Reassembles consecutive legacy frames into one message
#[derive(Default)]
struct LegacyAssembly {
    seen: HashSet<Uuid>,
    command_type: u32,
    next_packet: u16,
    data: Vec<u8>,
}

impl LegacyAssembly {
    fn push(&mut self, inner: &ConnectionInner, entry: PoolEntry<LegacyFrame>) -> Option<RawData> {
        if !self.seen.insert(entry.id) {
            return None;
        }
        inner.session.mark_consumed(entry.id);

        let frame = entry.packet;
        if frame.current_packet_number == 1 {
            self.command_type = frame.command_type;
            self.next_packet = 1;
            self.data.clear();
        }
        if frame.current_packet_number != self.next_packet || frame.command_type != self.command_type {
            debug!(
                packet = frame.current_packet_number,
                expected = self.next_packet,
                "Skipping out of order legacy frame"
            );
            return None;
        }

        self.data.extend_from_slice(&frame.data);
        self.next_packet += 1;

        (frame.current_packet_number == frame.total_packet_number).then(|| RawData {
            command_type: self.command_type,
            data: std::mem::take(&mut self.data),
        })
    }
}
