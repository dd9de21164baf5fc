//! Legacy (v1/v2) frames
//!
//! Frame format:
//! - 1 byte: Start of frame (0xAA)
//! - v1: 1 byte, v2: 4 bytes: Command type
//! - v1: 1 byte, v2: 2 bytes: Body length
//! - Body:
//!   - v1: 1 byte, v2: 2 bytes: Current packet number
//!   - v1: 1 byte, v2: 2 bytes: Total packet number
//!   - N bytes: Data
//!   - 2 bytes: CRC16 of packet numbers and data
//!
//! Every data frame is answered with an ACK or NACK info frame carrying the
//! packet number it refers to.

use byteorder::{BigEndian, ByteOrder};

use super::crc::{crc16, crc16_parts};
use super::packet::{FrameError, START_OF_FRAME};
use super::version::PacketVersion;
use super::ProtocolError;

/// Acknowledgement command type
pub const ACK_COMMAND: u32 = 1;

/// Negative acknowledgement command type
pub const NACK_COMMAND: u32 = 7;

const CRC_LEN: usize = 2;

/// A decoded legacy frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyFrame {
    /// Command type, [`ACK_COMMAND`] or [`NACK_COMMAND`] for info frames
    pub command_type: u32,
    /// 1-based index of this chunk
    pub current_packet_number: u16,
    /// Number of chunks in the message
    pub total_packet_number: u16,
    /// Chunk data
    pub data: Vec<u8>,
    /// CRC as carried by the frame
    pub crc: u16,
    /// Problems found while decoding; empty for a well-formed frame
    pub errors: Vec<FrameError>,
}

impl LegacyFrame {
    /// Whether this is an ACK or NACK frame
    pub fn is_info(&self) -> bool {
        self.command_type == ACK_COMMAND || self.command_type == NACK_COMMAND
    }

    /// Whether the frame decoded without problems
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Field widths of one legacy revision
#[derive(Debug, Clone, Copy)]
struct Layout {
    command_width: usize,
    length_width: usize,
    number_width: usize,
    chunk_size: usize,
}

impl Layout {
    fn header_len(&self) -> usize {
        1 + self.command_width + self.length_width
    }
}

fn read_uint(bytes: &[u8]) -> u32 {
    match bytes.len() {
        1 => bytes[0] as u32,
        2 => BigEndian::read_u16(bytes) as u32,
        _ => BigEndian::read_u32(bytes),
    }
}

/// Largest value a field of `width` bytes holds
fn width_max(width: usize) -> u32 {
    match width {
        1 => u8::MAX as u32,
        2 => u16::MAX as u32,
        _ => u32::MAX,
    }
}

fn check_width(field: &'static str, value: usize, width: usize) -> Result<(), ProtocolError> {
    let max = width_max(width) as usize;
    if value > max {
        return Err(ProtocolError::PayloadTooLarge {
            field,
            length: value,
            max,
        });
    }
    Ok(())
}

/// Big-endian `value` in `width` bytes. Callers check the value fits.
fn write_uint(out: &mut Vec<u8>, value: u32, width: usize) {
    let bytes = value.to_be_bytes();
    out.extend_from_slice(&bytes[4 - width..]);
}

/// Encoder/decoder for the v1 and v2 chunked-ack framing
#[derive(Debug, Clone, Copy)]
pub struct LegacyCodec {
    layout: Layout,
}

impl LegacyCodec {
    /// Codec for a legacy revision. v3 falls back to the v2 layout.
    pub fn new(version: PacketVersion) -> Self {
        let layout = match version {
            PacketVersion::V1 => Layout {
                command_width: 1,
                length_width: 1,
                number_width: 1,
                chunk_size: 32,
            },
            PacketVersion::V2 | PacketVersion::V3 => Layout {
                command_width: 4,
                length_width: 2,
                number_width: 2,
                chunk_size: 48,
            },
        };
        Self { layout }
    }

    /// Maximum data carried by one frame
    pub fn chunk_size(&self) -> usize {
        self.layout.chunk_size
    }

    fn encode_frame(&self, command_type: u32, current: u16, total: u16, data: &[u8]) -> Vec<u8> {
        let layout = self.layout;

        let mut numbers = Vec::with_capacity(layout.number_width * 2);
        write_uint(&mut numbers, current as u32, layout.number_width);
        write_uint(&mut numbers, total as u32, layout.number_width);
        let crc = crc16_parts(&[numbers.as_slice(), data]);
        let body_len = numbers.len() + data.len() + CRC_LEN;

        let mut bytes = Vec::with_capacity(layout.header_len() + body_len);
        bytes.push(START_OF_FRAME);
        write_uint(&mut bytes, command_type, layout.command_width);
        write_uint(&mut bytes, body_len as u32, layout.length_width);
        bytes.extend_from_slice(&numbers);
        bytes.extend_from_slice(data);
        bytes.extend_from_slice(&crc.to_be_bytes());
        bytes
    }

    /// Split `data` into frames for `command_type`.
    ///
    /// Fails when the command type or the chunk count does not fit the
    /// revision's field widths.
    pub fn encode(&self, command_type: u32, data: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let layout = self.layout;
        check_width("command type", command_type as usize, layout.command_width)?;

        if data.is_empty() {
            return Ok(vec![self.encode_frame(command_type, 1, 1, &[])]);
        }

        let chunk_count = data.len().div_ceil(layout.chunk_size);
        check_width("chunk count", chunk_count, layout.number_width)?;
        let total = chunk_count as u16;

        Ok(data
            .chunks(layout.chunk_size)
            .zip(1..=total)
            .map(|(chunk, current)| self.encode_frame(command_type, current, total, chunk))
            .collect())
    }

    /// ACK frame for `packet_number`
    pub fn ack(&self, packet_number: u16) -> Vec<u8> {
        self.info_frame(ACK_COMMAND, packet_number)
    }

    /// NACK frame for `packet_number`
    pub fn nack(&self, packet_number: u16) -> Vec<u8> {
        self.info_frame(NACK_COMMAND, packet_number)
    }

    fn info_frame(&self, command_type: u32, packet_number: u16) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.layout.number_width);
        write_uint(&mut data, packet_number as u32, self.layout.number_width);
        self.encode_frame(command_type, 1, 1, &data)
    }

    /// Decode every frame found in `raw`.
    pub fn decode(&self, raw: &[u8]) -> Vec<LegacyFrame> {
        let layout = self.layout;
        let mut frames = Vec::new();
        let mut offset = 0;

        while offset < raw.len() {
            let Some(pos) = raw[offset..].iter().position(|&b| b == START_OF_FRAME) else {
                break;
            };
            let start = offset + pos;
            let data = &raw[start..];

            if data.len() < layout.header_len() {
                frames.push(LegacyFrame {
                    command_type: 0,
                    current_packet_number: 0,
                    total_packet_number: 0,
                    data: Vec::new(),
                    crc: 0,
                    errors: vec![FrameError::Truncated {
                        expected: layout.header_len(),
                        actual: data.len(),
                    }],
                });
                break;
            }

            let command_type = read_uint(&data[1..1 + layout.command_width]);
            let length_start = 1 + layout.command_width;
            let body_len = read_uint(&data[length_start..length_start + layout.length_width]) as usize;
            let expected_len = layout.header_len() + body_len;
            let body = &data[layout.header_len()..data.len().min(expected_len)];

            frames.push(self.decode_body(command_type, body, body_len));
            let consumed = (data.len() >= expected_len).then_some(expected_len);

            match consumed {
                Some(len) => offset = start + len,
                None => break,
            }
        }

        frames
    }

    fn decode_body(&self, command_type: u32, body: &[u8], body_len: usize) -> LegacyFrame {
        let layout = self.layout;
        let numbers_len = layout.number_width * 2;
        let mut errors = Vec::new();

        if body.len() < numbers_len + CRC_LEN {
            errors.push(FrameError::Truncated {
                expected: body_len.max(numbers_len + CRC_LEN),
                actual: body.len(),
            });
            return LegacyFrame {
                command_type,
                current_packet_number: 0,
                total_packet_number: 0,
                data: Vec::new(),
                crc: 0,
                errors,
            };
        }

        let current = read_uint(&body[..layout.number_width]);
        let total = read_uint(&body[layout.number_width..numbers_len]);
        let crc_start = body.len() - CRC_LEN;
        let data = body[numbers_len..crc_start].to_vec();
        let crc = BigEndian::read_u16(&body[crc_start..]);

        if current == 0 || current > total {
            errors.push(FrameError::PacketNumberOutOfRange {
                current: current as u16,
                total: total as u16,
            });
        }
        if data.len() > layout.chunk_size {
            errors.push(FrameError::PayloadTooLarge {
                length: data.len(),
                max: layout.chunk_size,
            });
        }

        let actual = crc16(&body[..crc_start]);
        if actual != crc {
            errors.push(FrameError::CrcMismatch { expected: crc, actual });
        }
        if body.len() < body_len {
            errors.push(FrameError::Truncated {
                expected: body_len,
                actual: body.len(),
            });
        }

        LegacyFrame {
            command_type,
            current_packet_number: current as u16,
            total_packet_number: total as u16,
            data,
            crc,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_v1_layout() {
        let codec = LegacyCodec::new(PacketVersion::V1);
        let frames = codec.encode(41, &[0x00]).unwrap();
        assert_eq!(frames.len(), 1);

        let crc = crc16(&[1, 1, 0]).to_be_bytes();
        assert_eq!(frames[0], vec![0xAA, 41, 5, 1, 1, 0x00, crc[0], crc[1]]);
    }

    #[test]
    fn test_v2_roundtrip() {
        let codec = LegacyCodec::new(PacketVersion::V2);
        let data: Vec<u8> = (0..100).collect();
        let frames = codec.encode(0x0102_0304, &data).unwrap();
        assert_eq!(frames.len(), 3);

        let decoded = codec.decode(&frames.concat());
        assert_eq!(decoded.len(), 3);
        assert!(decoded.iter().all(LegacyFrame::is_valid));
        assert!(decoded.iter().all(|f| f.command_type == 0x0102_0304));
        assert_eq!(decoded[2].current_packet_number, 3);
        assert_eq!(decoded[2].total_packet_number, 3);

        let reassembled: Vec<u8> = decoded.into_iter().flat_map(|f| f.data).collect();
        assert_eq!(reassembled, data);
    }

    #[test]
    fn test_ack_and_nack() {
        let codec = LegacyCodec::new(PacketVersion::V2);
        let decoded = codec.decode(&[codec.ack(3), codec.nack(4)].concat());
        assert_eq!(decoded.len(), 2);

        assert!(decoded[0].is_info());
        assert_eq!(decoded[0].command_type, ACK_COMMAND);
        assert_eq!(decoded[0].data, vec![0, 3]);

        assert!(decoded[1].is_info());
        assert_eq!(decoded[1].command_type, NACK_COMMAND);
        assert_eq!(decoded[1].data, vec![0, 4]);
    }

    #[test]
    fn test_corrupted_frame_is_flagged() {
        let codec = LegacyCodec::new(PacketVersion::V1);
        let mut frame = codec.encode(12, &[1, 2, 3]).unwrap().remove(0);
        let last = frame.len() - 3;
        frame[last] ^= 0x01;

        let decoded = codec.decode(&frame);
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0]
            .errors
            .iter()
            .any(|e| matches!(e, FrameError::CrcMismatch { .. })));
    }

    #[test]
    fn test_fields_that_do_not_fit_are_refused() {
        let v1 = LegacyCodec::new(PacketVersion::V1);
        assert!(matches!(
            v1.encode(0x100, &[1]),
            Err(ProtocolError::PayloadTooLarge { field: "command type", length: 256, max: 255 })
        ));

        // 255 chunks of 32 bytes is the most a v1 message carries
        assert_eq!(v1.encode(12, &vec![0; 255 * 32]).unwrap().len(), 255);
        assert!(matches!(
            v1.encode(12, &vec![0; 255 * 32 + 1]),
            Err(ProtocolError::PayloadTooLarge { field: "chunk count", length: 256, max: 255 })
        ));

        let v2 = LegacyCodec::new(PacketVersion::V2);
        assert!(v2.encode(0x0102_0304, &[1]).is_ok());
    }

    #[test]
    fn test_truncated_frame() {
        let codec = LegacyCodec::new(PacketVersion::V2);
        let frame = codec.encode(12, &[1, 2, 3]).unwrap().remove(0);
        let decoded = codec.decode(&frame[..frame.len() - 1]);
        assert_eq!(decoded.len(), 1);
        assert!(!decoded[0].is_valid());
    }
}
