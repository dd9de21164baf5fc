//! Scripted device used by the integration tests
#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hwlink_core::protocol::legacy::{LegacyCodec, LegacyFrame};
use hwlink_core::protocol::payload::{encode_payload, encode_raw_data};
use hwlink_core::protocol::{
    CmdState, ConnectionConfig, DeviceConnection, DeviceIdleState, DeviceWaitOn, Frame,
    FrameCodec, PacketType, PacketVersion, RawData, StatusData, Transport, TransportEvent,
};
use tokio::sync::mpsc;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// Transport whose replies are produced by a closure over each write
pub struct MockDevice {
    events: mpsc::Sender<TransportEvent>,
    responder: Mutex<Responder>,
    written: Mutex<Vec<Vec<u8>>>,
    attempts: AtomicUsize,
    open: AtomicBool,
    connected: AtomicBool,
    fail_writes: AtomicBool,
}

impl MockDevice {
    pub fn new<F>(responder: F) -> (Arc<Self>, mpsc::Receiver<TransportEvent>)
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        let (events, rx) = mpsc::channel(64);
        let device = Arc::new(Self {
            events,
            responder: Mutex::new(Box::new(responder)),
            written: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            open: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
        });
        (device, rx)
    }

    /// Every successful write, in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    /// Every write attempt, including failed ones
    pub fn write_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Written v3 frames of `packet_type`
    pub fn written_frames(&self, packet_type: PacketType) -> Vec<Frame> {
        let codec = FrameCodec::default();
        self.written()
            .iter()
            .flat_map(|bytes| codec.decode(bytes))
            .filter(|frame| frame.is_valid() && frame.packet_type == packet_type)
            .collect()
    }

    /// Written legacy frames of `command_type`
    pub fn written_legacy(&self, version: PacketVersion, command_type: u32) -> Vec<LegacyFrame> {
        let codec = LegacyCodec::new(version);
        self.written()
            .iter()
            .flat_map(|bytes| codec.decode(bytes))
            .filter(|frame| frame.is_valid() && frame.command_type == command_type)
            .collect()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Deliver unsolicited bytes from the device
    pub async fn inject(&self, bytes: Vec<u8>) {
        self.events.send(TransportEvent::Data(bytes)).await.unwrap();
    }

    /// Simulate the device being unplugged
    pub async fn unplug(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.events
            .send(TransportEvent::Closed(Some("device unplugged".into())))
            .await
            .unwrap();
    }
}

#[async_trait]
impl Transport for MockDevice {
    async fn open(&self) -> io::Result<()> {
        self.open.store(true, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn write(&self, data: &[u8]) -> io::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "write failed"));
        }

        self.written.lock().unwrap().push(data.to_vec());
        let replies = {
            let mut responder = self.responder.lock().unwrap();
            (*responder)(data)
        };
        for reply in replies {
            self.events.send(TransportEvent::Data(reply)).await.unwrap();
        }
        Ok(())
    }
}

/// Responder that hands every well-formed v3 frame to `handler`
pub fn v3_device<F>(mut handler: F) -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static
where
    F: FnMut(&Frame) -> Vec<Vec<u8>> + Send + 'static,
{
    let codec = FrameCodec::default();
    move |bytes| {
        codec
            .decode(bytes)
            .iter()
            .filter(|frame| frame.is_valid())
            .flat_map(&mut handler)
            .collect()
    }
}

/// Responder that hands every well-formed legacy data frame to `handler`
pub fn legacy_device<F>(
    version: PacketVersion,
    mut handler: F,
) -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static
where
    F: FnMut(&LegacyFrame) -> Vec<Vec<u8>> + Send + 'static,
{
    let codec = LegacyCodec::new(version);
    move |bytes| {
        codec
            .decode(bytes)
            .iter()
            .filter(|frame| frame.is_valid() && !frame.is_info())
            .flat_map(&mut handler)
            .collect()
    }
}

/// Legacy device that acknowledges every frame
pub fn acking_legacy_device(
    version: PacketVersion,
) -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static {
    let codec = LegacyCodec::new(version);
    legacy_device(version, move |frame| {
        vec![codec.ack(frame.current_packet_number)]
    })
}

pub fn status(device_state: u8, current_cmd_seq: u16, cmd_state: CmdState) -> StatusData {
    StatusData {
        device_state,
        device_idle_state: DeviceIdleState::from(device_state & 0x0F),
        device_waiting_on: DeviceWaitOn::from(device_state >> 4),
        abort_disabled: false,
        card_tap_delta: [0; 4],
        current_cmd_seq,
        cmd_state,
        cmd_type: 0,
        cmd_status: 0,
    }
}

pub fn idle_status() -> StatusData {
    status(0x01, 0, CmdState::None)
}

pub fn status_reply(sequence_number: u16, status: &StatusData) -> Vec<Vec<u8>> {
    FrameCodec::default()
        .encode(
            &encode_payload(&status.to_bytes(), &[]).unwrap(),
            sequence_number,
            PacketType::Status,
        )
        .unwrap()
}

/// STATUS frame carrying an SDK version in its first six payload bytes
pub fn sdk_reply(sequence_number: u16, major: u16, minor: u16, patch: u16) -> Vec<Vec<u8>> {
    let payload: Vec<u8> = [major, minor, patch]
        .iter()
        .flat_map(|part| part.to_be_bytes())
        .collect();
    FrameCodec::default()
        .encode(&payload, sequence_number, PacketType::Status)
        .unwrap()
}

pub fn cmd_ack(sequence_number: u16) -> Vec<Vec<u8>> {
    FrameCodec::default()
        .encode(&[], sequence_number, PacketType::CmdAck)
        .unwrap()
}

pub fn reject(sequence_number: u16, code: u8) -> Vec<Vec<u8>> {
    FrameCodec::default()
        .encode(
            &encode_payload(&[code], &[]).unwrap(),
            sequence_number,
            PacketType::Error,
        )
        .unwrap()
}

/// Command output split into single-frame chunks of `chunk_len` bytes
pub fn output_chunks(sequence_number: u16, output: &RawData, chunk_len: usize) -> Vec<Vec<u8>> {
    let envelope = encode_payload(&encode_raw_data(output), &[]).unwrap();
    let chunks: Vec<&[u8]> = envelope.chunks(chunk_len).collect();
    let total = chunks.len() as u16;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            Frame::new(
                i as u16 + 1,
                total,
                sequence_number,
                PacketType::CmdOutput,
                0,
                chunk.to_vec(),
            )
            .to_bytes()
            .unwrap()
        })
        .collect()
}

pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        max_tries: 3,
        ..ConnectionConfig::default()
    }
}

/// Open a connection to a mock device without negotiating
pub async fn open_with<F>(
    config: ConnectionConfig,
    responder: F,
) -> (DeviceConnection, Arc<MockDevice>)
where
    F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
{
    let (device, events) = MockDevice::new(responder);
    let connection = DeviceConnection::new(device.clone(), events, config);
    connection.open().await.unwrap();
    (connection, device)
}

/// Open and negotiate v3 with a device driven by `handler`.
///
/// STATUS requests are answered with [`idle_status`] unless `handler`
/// replies to them itself.
pub async fn connect_v3<F>(mut handler: F) -> (DeviceConnection, Arc<MockDevice>)
where
    F: FnMut(&Frame) -> Vec<Vec<u8>> + Send + 'static,
{
    let responder = v3_device(move |frame| {
        let replies = handler(frame);
        if replies.is_empty() && frame.packet_type == PacketType::StatusReq {
            return status_reply(frame.sequence_number, &idle_status());
        }
        replies
    });

    let (connection, device) = open_with(test_config(), responder).await;
    assert_eq!(
        connection.negotiate_version().await.unwrap(),
        PacketVersion::V3
    );
    (connection, device)
}

/// Let the dispatcher drain pending events
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
