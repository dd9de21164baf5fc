//! Payload encoding/decoding
//!
//! Every non-empty frame payload is a chunk of an envelope:
//! - 2 bytes: protobuf blob size (big-endian)
//! - 2 bytes: raw blob size (big-endian)
//! - N bytes: protobuf blob
//! - M bytes: raw blob
//!
//! The raw blob of a STATUS response is a [`StatusData`] snapshot, the raw blob
//! of a CMD_OUTPUT response is a [`RawData`] record.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use super::ProtocolError;

const BLOB_SIZE_LEN: usize = 2;
const ENVELOPE_HEADER_LEN: usize = BLOB_SIZE_LEN * 2;

/// Length of an encoded status snapshot
pub const STATUS_DATA_LEN: usize = 15;

/// Length of the command type prefix of [`RawData`]
const COMMAND_TYPE_LEN: usize = 4;

/// Decoded payload envelope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// Serialized protobuf message
    pub protobuf: Vec<u8>,
    /// Raw blob
    pub raw: Vec<u8>,
}

fn blob_size(field: &'static str, blob: &[u8]) -> Result<u16, ProtocolError> {
    u16::try_from(blob.len()).map_err(|_| ProtocolError::PayloadTooLarge {
        field,
        length: blob.len(),
        max: u16::MAX as usize,
    })
}

/// Build a payload envelope. Two empty blobs produce an empty payload.
///
/// Fails when a blob is longer than its 16-bit size field can declare.
pub fn encode_payload(raw: &[u8], protobuf: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if raw.is_empty() && protobuf.is_empty() {
        return Ok(Vec::new());
    }

    let protobuf_size = blob_size("protobuf blob", protobuf)?;
    let raw_size = blob_size("raw blob", raw)?;

    let mut bytes = Vec::with_capacity(ENVELOPE_HEADER_LEN + protobuf.len() + raw.len());
    let mut size = [0u8; BLOB_SIZE_LEN];
    BigEndian::write_u16(&mut size, protobuf_size);
    bytes.extend_from_slice(&size);
    BigEndian::write_u16(&mut size, raw_size);
    bytes.extend_from_slice(&size);
    bytes.extend_from_slice(protobuf);
    bytes.extend_from_slice(raw);
    Ok(bytes)
}

/// Split a payload envelope into its blobs.
pub fn decode_payload(data: &[u8]) -> Result<Payload, ProtocolError> {
    if data.is_empty() {
        return Ok(Payload::default());
    }

    if data.len() < ENVELOPE_HEADER_LEN {
        return Err(ProtocolError::InvalidResponse(format!(
            "payload of {} bytes is shorter than its size header",
            data.len()
        )));
    }

    let protobuf_size = BigEndian::read_u16(&data[0..2]) as usize;
    let raw_size = BigEndian::read_u16(&data[2..4]) as usize;
    let body = &data[ENVELOPE_HEADER_LEN..];

    if body.len() < protobuf_size + raw_size {
        return Err(ProtocolError::InvalidResponse(format!(
            "payload declares {} bytes of blobs but carries {}",
            protobuf_size + raw_size,
            body.len()
        )));
    }

    Ok(Payload {
        protobuf: body[..protobuf_size].to_vec(),
        raw: body[protobuf_size..protobuf_size + raw_size].to_vec(),
    })
}

/// What the device is doing while idle (low nibble of the device state)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceIdleState {
    /// Nothing to do
    Idle,
    /// Device is servicing a request that arrived over this link
    Usb,
    /// Device is running a flow started on the device itself
    Device,
    /// Value this library does not know
    Unknown(u8),
}

impl From<u8> for DeviceIdleState {
    fn from(value: u8) -> Self {
        match value {
            1 => DeviceIdleState::Idle,
            2 => DeviceIdleState::Usb,
            3 => DeviceIdleState::Device,
            other => DeviceIdleState::Unknown(other),
        }
    }
}

/// What the device is blocked on (high nibble of the device state)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceWaitOn {
    /// Not blocked
    Nothing,
    /// Waiting in its idle loop
    Idle,
    /// Waiting for a card tap
    BusyCard,
    /// Waiting for a key press
    BusyKey,
    /// Value this library does not know
    Unknown(u8),
}

impl From<u8> for DeviceWaitOn {
    fn from(value: u8) -> Self {
        match value {
            0 => DeviceWaitOn::Nothing,
            1 => DeviceWaitOn::Idle,
            2 => DeviceWaitOn::BusyCard,
            3 => DeviceWaitOn::BusyKey,
            other => DeviceWaitOn::Unknown(other),
        }
    }
}

/// Lifecycle of the command tracked by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmdState {
    /// No command tracked
    None,
    /// Chunks are still arriving
    Receiving,
    /// Every chunk arrived
    Received,
    /// Command is running
    Executing,
    /// Command finished
    Done,
    /// Command was refused
    Rejected,
    /// Value this library does not know
    Unknown(u8),
}

impl CmdState {
    /// Whether the device has finished with the command
    pub fn is_terminal(&self) -> bool {
        matches!(self, CmdState::Done | CmdState::Rejected)
    }
}

impl From<u8> for CmdState {
    fn from(value: u8) -> Self {
        match value {
            0 => CmdState::None,
            1 => CmdState::Receiving,
            2 => CmdState::Received,
            3 => CmdState::Executing,
            4 => CmdState::Done,
            5 => CmdState::Rejected,
            other => CmdState::Unknown(other),
        }
    }
}

impl From<CmdState> for u8 {
    fn from(state: CmdState) -> Self {
        match state {
            CmdState::None => 0,
            CmdState::Receiving => 1,
            CmdState::Received => 2,
            CmdState::Executing => 3,
            CmdState::Done => 4,
            CmdState::Rejected => 5,
            CmdState::Unknown(other) => other,
        }
    }
}

/// Device status snapshot carried by STATUS frames
///
/// Layout (big-endian):
/// - 1 byte: device state (low nibble idle state, high nibble waiting-on)
/// - 1 byte: abort disabled flag
/// - 4 bytes: card tap deltas
/// - 2 bytes: sequence number of the tracked command
/// - 1 byte: command state
/// - 4 bytes: command type
/// - 2 bytes: command status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusData {
    /// Raw device state byte
    pub device_state: u8,
    /// Low nibble of `device_state`
    pub device_idle_state: DeviceIdleState,
    /// High nibble of `device_state`
    pub device_waiting_on: DeviceWaitOn,
    /// The running flow cannot be aborted
    pub abort_disabled: bool,
    /// Per-card tap counters
    pub card_tap_delta: [u8; 4],
    /// Sequence number of the tracked command
    pub current_cmd_seq: u16,
    /// State of the tracked command
    pub cmd_state: CmdState,
    /// Type of the tracked command
    pub cmd_type: u32,
    /// Command specific status word
    pub cmd_status: u16,
}

impl StatusData {
    /// Encode the snapshot the way the device sends it
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; STATUS_DATA_LEN];
        bytes[0] = self.device_state;
        bytes[1] = u8::from(self.abort_disabled);
        bytes[2..6].copy_from_slice(&self.card_tap_delta);
        BigEndian::write_u16(&mut bytes[6..8], self.current_cmd_seq);
        bytes[8] = self.cmd_state.into();
        BigEndian::write_u32(&mut bytes[9..13], self.cmd_type);
        BigEndian::write_u16(&mut bytes[13..15], self.cmd_status);
        bytes
    }
}

/// Decode a status snapshot from the raw blob of a STATUS response.
pub fn decode_status(raw: &[u8]) -> Result<StatusData, ProtocolError> {
    if raw.len() < STATUS_DATA_LEN {
        return Err(ProtocolError::InvalidResponse(format!(
            "status snapshot needs {} bytes, got {}",
            STATUS_DATA_LEN,
            raw.len()
        )));
    }

    let device_state = raw[0];
    let mut card_tap_delta = [0u8; 4];
    card_tap_delta.copy_from_slice(&raw[2..6]);

    Ok(StatusData {
        device_state,
        device_idle_state: DeviceIdleState::from(device_state & 0x0F),
        device_waiting_on: DeviceWaitOn::from(device_state >> 4),
        abort_disabled: raw[1] != 0,
        card_tap_delta,
        current_cmd_seq: BigEndian::read_u16(&raw[6..8]),
        cmd_state: CmdState::from(raw[8]),
        cmd_type: BigEndian::read_u32(&raw[9..13]),
        cmd_status: BigEndian::read_u16(&raw[13..15]),
    })
}

/// Command output record carried by CMD_OUTPUT frames (and sent in CMD frames)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawData {
    /// Command the record belongs to
    pub command_type: u32,
    /// Command data
    pub data: Vec<u8>,
}

/// Decode a command output record from a raw blob.
pub fn decode_raw_data(raw: &[u8]) -> Result<RawData, ProtocolError> {
    if raw.len() < COMMAND_TYPE_LEN {
        return Err(ProtocolError::InvalidResponse(format!(
            "command output needs at least {} bytes, got {}",
            COMMAND_TYPE_LEN,
            raw.len()
        )));
    }

    Ok(RawData {
        command_type: BigEndian::read_u32(&raw[..COMMAND_TYPE_LEN]),
        data: raw[COMMAND_TYPE_LEN..].to_vec(),
    })
}

/// Encode a command record into a raw blob.
pub fn encode_raw_data(raw_data: &RawData) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(COMMAND_TYPE_LEN + raw_data.data.len());
    let mut command_type = [0u8; COMMAND_TYPE_LEN];
    BigEndian::write_u32(&mut command_type, raw_data.command_type);
    bytes.extend_from_slice(&command_type);
    bytes.extend_from_slice(&raw_data.data);
    bytes
}
