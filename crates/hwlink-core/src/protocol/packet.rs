//! Frame encoding/decoding
//!
//! Frame format (v3), all integers big-endian:
//! - 1 byte: Start of frame (0xAA)
//! - 2 bytes: CRC16 of every byte after this field
//! - 2 bytes: Current packet number (1-based)
//! - 2 bytes: Total packet number
//! - 2 bytes: Sequence number
//! - 1 byte: Packet type
//! - 4 bytes: Timestamp (sender wall clock, milliseconds)
//! - 2 bytes: Payload length
//! - N bytes: Payload

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use super::crc::crc16;
use super::{ProtocolError, DEFAULT_CHUNK_SIZE};

/// Start of frame marker
pub const START_OF_FRAME: u8 = 0xAA;

/// Size of the fixed frame header
pub const FRAME_HEADER_LEN: usize = 16;

/// Offset of the first byte covered by the CRC
const CRC_COVERAGE_START: usize = 3;

/// Frame packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Command chunk sent to the device
    Cmd,
    /// Status request
    StatusReq,
    /// Request for one chunk of command output
    CmdOutputReq,
    /// Device acknowledged a command chunk
    CmdAck,
    /// Device status snapshot
    Status,
    /// Chunk of command output
    CmdOutput,
    /// Device rejected a request
    Error,
    /// Request to abort a command
    Abort,
    /// Type this library does not know
    Unknown(u8),
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value {
            1 => PacketType::Cmd,
            2 => PacketType::StatusReq,
            3 => PacketType::CmdOutputReq,
            4 => PacketType::CmdAck,
            5 => PacketType::Status,
            6 => PacketType::CmdOutput,
            7 => PacketType::Error,
            8 => PacketType::Abort,
            other => PacketType::Unknown(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        match packet_type {
            PacketType::Cmd => 1,
            PacketType::StatusReq => 2,
            PacketType::CmdOutputReq => 3,
            PacketType::CmdAck => 4,
            PacketType::Status => 5,
            PacketType::CmdOutput => 6,
            PacketType::Error => 7,
            PacketType::Abort => 8,
            PacketType::Unknown(other) => other,
        }
    }
}

/// Problems found while decoding a frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// First byte is not the start of frame marker
    #[error("Invalid start of frame: {0:#04x}")]
    InvalidStartOfFrame(u8),

    /// Packet number is zero or above the total
    #[error("Packet number {current} out of range (total {total})")]
    PacketNumberOutOfRange {
        /// Packet number carried by the frame
        current: u16,
        /// Total carried by the frame
        total: u16,
    },

    /// Payload longer than the codec's chunk size
    #[error("Payload of {length} bytes exceeds chunk size {max}")]
    PayloadTooLarge {
        /// Declared payload length
        length: usize,
        /// Chunk size of the codec
        max: usize,
    },

    /// Carried CRC differs from the computed one
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// CRC carried by the frame
        expected: u16,
        /// CRC computed over the received bytes
        actual: u16,
    },

    /// Input ended before the declared length
    #[error("Frame truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Declared length
        expected: usize,
        /// Bytes available
        actual: usize,
    },
}

/// A decoded v3 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Marker byte as received
    pub start_of_frame: u8,
    /// CRC as carried by the frame
    pub crc: u16,
    /// 1-based index of this chunk
    pub current_packet_number: u16,
    /// Number of chunks in the message
    pub total_packet_number: u16,
    /// Request this frame belongs to
    pub sequence_number: u16,
    /// Packet type
    pub packet_type: PacketType,
    /// Sender wall clock in milliseconds
    pub timestamp: u32,
    /// Chunk of the payload envelope
    pub payload: Vec<u8>,
    /// Problems found while decoding; empty for a well-formed frame
    pub errors: Vec<FrameError>,
}

impl Frame {
    /// Create a well-formed frame. The CRC is filled in by [`Frame::to_bytes`].
    pub fn new(
        current_packet_number: u16,
        total_packet_number: u16,
        sequence_number: u16,
        packet_type: PacketType,
        timestamp: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            start_of_frame: START_OF_FRAME,
            crc: 0,
            current_packet_number,
            total_packet_number,
            sequence_number,
            packet_type,
            timestamp,
            payload,
            errors: Vec::new(),
        }
    }

    /// Whether the frame decoded without problems
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Encode the frame to raw bytes, computing the CRC
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload_len =
            u16::try_from(self.payload.len()).map_err(|_| ProtocolError::PayloadTooLarge {
                field: "frame payload",
                length: self.payload.len(),
                max: u16::MAX as usize,
            })?;

        let mut bytes = vec![0u8; FRAME_HEADER_LEN];
        bytes[0] = START_OF_FRAME;
        BigEndian::write_u16(&mut bytes[3..5], self.current_packet_number);
        BigEndian::write_u16(&mut bytes[5..7], self.total_packet_number);
        BigEndian::write_u16(&mut bytes[7..9], self.sequence_number);
        bytes[9] = self.packet_type.into();
        BigEndian::write_u32(&mut bytes[10..14], self.timestamp);
        BigEndian::write_u16(&mut bytes[14..16], payload_len);
        bytes.extend_from_slice(&self.payload);

        let crc = crc16(&bytes[CRC_COVERAGE_START..]);
        BigEndian::write_u16(&mut bytes[1..3], crc);
        Ok(bytes)
    }
}

/// Parse one frame from the start of `data`.
///
/// Returns the frame and the number of bytes it occupied, or `None` for the
/// length when the frame is truncated and nothing after it can be trusted.
pub fn parse_frame(data: &[u8], max_payload: usize) -> (Frame, Option<usize>) {
    let mut errors = Vec::new();

    let mut header = [0u8; FRAME_HEADER_LEN];
    let available = data.len().min(FRAME_HEADER_LEN);
    header[..available].copy_from_slice(&data[..available]);

    if header[0] != START_OF_FRAME {
        errors.push(FrameError::InvalidStartOfFrame(header[0]));
    }

    let crc = BigEndian::read_u16(&header[1..3]);
    let current_packet_number = BigEndian::read_u16(&header[3..5]);
    let total_packet_number = BigEndian::read_u16(&header[5..7]);
    let sequence_number = BigEndian::read_u16(&header[7..9]);
    let packet_type = PacketType::from(header[9]);
    let timestamp = BigEndian::read_u32(&header[10..14]);
    let payload_length = BigEndian::read_u16(&header[14..16]) as usize;

    let expected_len = FRAME_HEADER_LEN + payload_length;
    let frame_len = data.len().min(expected_len);
    let truncated = data.len() < expected_len;

    if available == FRAME_HEADER_LEN {
        if current_packet_number == 0 || current_packet_number > total_packet_number {
            errors.push(FrameError::PacketNumberOutOfRange {
                current: current_packet_number,
                total: total_packet_number,
            });
        }
        if payload_length > max_payload {
            errors.push(FrameError::PayloadTooLarge {
                length: payload_length,
                max: max_payload,
            });
        }
    }

    let payload = if data.len() > FRAME_HEADER_LEN {
        data[FRAME_HEADER_LEN..frame_len].to_vec()
    } else {
        Vec::new()
    };

    let covered = if frame_len > CRC_COVERAGE_START {
        &data[CRC_COVERAGE_START..frame_len]
    } else {
        &[][..]
    };
    let actual_crc = crc16(covered);
    if actual_crc != crc {
        errors.push(FrameError::CrcMismatch {
            expected: crc,
            actual: actual_crc,
        });
    }

    if truncated {
        errors.push(FrameError::Truncated {
            expected: expected_len,
            actual: data.len(),
        });
    }

    let frame = Frame {
        start_of_frame: header[0],
        crc,
        current_packet_number,
        total_packet_number,
        sequence_number,
        packet_type,
        timestamp,
        payload,
        errors,
    };

    (frame, (!truncated).then_some(expected_len))
}

/// Chunking encoder and scanning decoder for v3 frames
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    chunk_size: usize,
}

impl FrameCodec {
    /// Create a codec with the given maximum payload per frame
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Maximum payload carried by one frame
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split `payload` into frames stamped with the current wall clock
    pub fn encode(
        &self,
        payload: &[u8],
        sequence_number: u16,
        packet_type: PacketType,
    ) -> Result<Vec<Vec<u8>>, ProtocolError> {
        self.encode_at(payload, sequence_number, packet_type, now_millis())
    }

    /// Split `payload` into frames stamped with `timestamp`.
    ///
    /// Fails when the payload needs more chunks than a packet number holds.
    pub fn encode_at(
        &self,
        payload: &[u8],
        sequence_number: u16,
        packet_type: PacketType,
        timestamp: u32,
    ) -> Result<Vec<Vec<u8>>, ProtocolError> {
        if payload.is_empty() {
            let frame = Frame::new(1, 1, sequence_number, packet_type, timestamp, Vec::new());
            return Ok(vec![frame.to_bytes()?]);
        }

        let chunk_count = payload.len().div_ceil(self.chunk_size);
        let total = u16::try_from(chunk_count).map_err(|_| ProtocolError::PayloadTooLarge {
            field: "chunk count",
            length: chunk_count,
            max: u16::MAX as usize,
        })?;

        payload
            .chunks(self.chunk_size)
            .zip(1..=total)
            .map(|(chunk, current)| {
                Frame::new(
                    current,
                    total,
                    sequence_number,
                    packet_type,
                    timestamp,
                    chunk.to_vec(),
                )
                .to_bytes()
            })
            .collect()
    }

    /// Decode every frame found in `raw`.
    ///
    /// Malformed frames are returned with their errors attached. Never panics.
    pub fn decode(&self, raw: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut offset = 0;

        while offset < raw.len() {
            let Some(pos) = raw[offset..].iter().position(|&b| b == START_OF_FRAME) else {
                break;
            };
            let start = offset + pos;

            let (frame, consumed) = parse_frame(&raw[start..], self.chunk_size);
            frames.push(frame);

            match consumed {
                Some(len) => offset = start + len,
                None => break,
            }
        }

        frames
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

/// Wall clock in milliseconds, truncated to 32 bits
fn now_millis() -> u32 {
    chrono::Utc::now().timestamp_millis() as u32
}
