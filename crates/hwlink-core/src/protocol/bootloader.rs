//! Bootloader traffic
//!
//! A device in its bootloader speaks no framed protocol. Firmware is uploaded
//! as XMODEM-1K blocks, each answered with a single status byte, and a running
//! upload is cancelled with a one-byte abort request.
//!
//! Block format:
//! - 1 byte: STX (0x02)
//! - 1 byte: Block number (starts at 1, wraps)
//! - 1 byte: 255 - block number
//! - 1024 bytes: Data, the last block padded with 0x1A
//! - 2 bytes: CRC16 of the data (big-endian)
//!
//! The upload ends with a single EOT byte.

use std::sync::atomic::Ordering;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::ConnectionInner;
use super::crc::crc16;
use super::ProtocolError;

/// Start of a 1024-byte block
pub const STX: u8 = 0x02;

/// End of transmission
pub const EOT: u8 = 0x04;

/// Bootloader accepted a block
pub const BOOTLOADER_ACK: u8 = 0x06;

/// Request to leave the bootloader upload
pub const ABORT_REQUEST: u8 = 0x41;

/// Bootloader accepted the abort request
pub const ABORT_ACK: u8 = 0x18;

/// Data bytes per block
pub const BLOCK_LEN: usize = 1024;

const PADDING: u8 = 0x1A;

/// Firmware rejections reported by the bootloader
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderError {
    /// Image is larger than the flash region (0x07)
    #[error("Firmware size limit exceeded")]
    LimitExceeded,

    /// Image is not newer than the installed firmware (0x08)
    #[error("Wrong firmware version")]
    WrongFirmwareVersion,

    /// Image targets another hardware revision (0x09)
    #[error("Wrong hardware version")]
    WrongHardwareVersion,

    /// Image header is not a firmware header (0x0A)
    #[error("Wrong magic number")]
    WrongMagicNumber,

    /// Image signature did not verify (0x0B)
    #[error("Signature not verified")]
    SignatureNotVerified,
}

impl BootloaderError {
    /// Rejection for a status byte, `None` if the byte is not a rejection
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x07 => Some(BootloaderError::LimitExceeded),
            0x08 => Some(BootloaderError::WrongFirmwareVersion),
            0x09 => Some(BootloaderError::WrongHardwareVersion),
            0x0A => Some(BootloaderError::WrongMagicNumber),
            0x0B => Some(BootloaderError::SignatureNotVerified),
            _ => None,
        }
    }

    /// Status byte the bootloader sends for this rejection
    pub fn code(&self) -> u8 {
        match self {
            BootloaderError::LimitExceeded => 0x07,
            BootloaderError::WrongFirmwareVersion => 0x08,
            BootloaderError::WrongHardwareVersion => 0x09,
            BootloaderError::WrongMagicNumber => 0x0A,
            BootloaderError::SignatureNotVerified => 0x0B,
        }
    }
}

/// Split firmware into XMODEM-1K blocks followed by EOT
pub fn encode_firmware(firmware: &[u8]) -> Vec<Vec<u8>> {
    let mut packets: Vec<Vec<u8>> = firmware
        .chunks(BLOCK_LEN)
        .enumerate()
        .map(|(i, chunk)| {
            let block = (i + 1) as u8;
            let mut data = chunk.to_vec();
            data.resize(BLOCK_LEN, PADDING);

            let mut packet = Vec::with_capacity(BLOCK_LEN + 5);
            packet.push(STX);
            packet.push(block);
            packet.push(u8::MAX - block);
            packet.extend_from_slice(&data);
            packet.extend_from_slice(&crc16(&data).to_be_bytes());
            packet
        })
        .collect();
    packets.push(vec![EOT]);
    packets
}

/// What a bootloader reply means for the packet awaiting it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Accepted,
    Rejected(BootloaderError),
}

/// Scan `bytes` for the awaited acknowledgement. With `check_rejections`
/// a rejection code anywhere in the reply wins over the acknowledgement.
fn classify(bytes: &[u8], ack: u8, check_rejections: bool) -> Option<Reply> {
    if check_rejections {
        if let Some(rejection) = bytes.iter().find_map(|&b| BootloaderError::from_code(b)) {
            return Some(Reply::Rejected(rejection));
        }
    }
    bytes.contains(&ack).then_some(Reply::Accepted)
}

/// How one bootloader packet is acknowledged
#[derive(Debug, Clone, Copy)]
struct Acknowledgement {
    ack: u8,
    check_rejections: bool,
}

impl ConnectionInner {
    fn require_bootloader(&self) -> Result<(), ProtocolError> {
        if self.session.raw_mode() {
            Ok(())
        } else {
            Err(ProtocolError::NotInBootloader)
        }
    }

    /// Cancel a firmware upload the bootloader is waiting on
    pub(crate) async fn bootloader_abort(&self) -> Result<(), ProtocolError> {
        self.require_bootloader()?;
        info!("Sending bootloader abort");

        let acknowledgement = Acknowledgement {
            ack: ABORT_ACK,
            check_rejections: false,
        };
        self.send_bootloader_packets(&[vec![ABORT_REQUEST]], acknowledgement, |_| {})
            .await
    }

    /// Upload `firmware`, reporting the percentage sent after every block
    pub(crate) async fn bootloader_upload<F>(
        &self,
        firmware: &[u8],
        on_progress: F,
    ) -> Result<(), ProtocolError>
    where
        F: FnMut(f64),
    {
        self.require_bootloader()?;

        let packets = encode_firmware(firmware);
        info!(
            bytes = firmware.len(),
            packets = packets.len(),
            "Uploading firmware"
        );

        let acknowledgement = Acknowledgement {
            ack: BOOTLOADER_ACK,
            check_rejections: true,
        };
        self.send_bootloader_packets(&packets, acknowledgement, on_progress)
            .await
    }

    async fn send_bootloader_packets<F>(
        &self,
        packets: &[Vec<u8>],
        acknowledgement: Acknowledgement,
        mut on_progress: F,
    ) -> Result<(), ProtocolError>
    where
        F: FnMut(f64),
    {
        let max_tries = self.config.max_tries.max(1);

        for (index, packet) in packets.iter().enumerate() {
            // The bootloader may erase flash before answering the first block
            let timeout = if index == 0 {
                Duration::from_millis(self.config.bootloader_first_ack_timeout_ms)
            } else {
                Duration::from_millis(self.config.ack_timeout_ms)
            };

            let mut first_error = None;
            for attempt in 1..=max_tries {
                match self
                    .write_bootloader_packet(packet, acknowledgement, timeout)
                    .await
                {
                    Ok(()) => {
                        first_error = None;
                        break;
                    }
                    Err(e) => {
                        warn!(
                            packet = index + 1,
                            total = packets.len(),
                            attempt,
                            "Error sending bootloader packet: {}",
                            e
                        );
                        let retryable = e.is_retryable();
                        first_error.get_or_insert(e);
                        if !retryable {
                            break;
                        }
                        if attempt < max_tries {
                            self.counters.retransmissions.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }

            if let Some(e) = first_error {
                return Err(e);
            }
            on_progress((index + 1) as f64 * 100.0 / packets.len() as f64);
        }

        Ok(())
    }

    async fn write_bootloader_packet(
        &self,
        packet: &[u8],
        acknowledgement: Acknowledgement,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        if !self.transport.is_connected() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let mut replies = self.session.subscribe_raw();
        let mut closed = self.session.closed_watch();
        let deadline = Instant::now() + timeout;

        self.write_raw(packet).await?;

        loop {
            let event = tokio::time::timeout_at(deadline, async {
                tokio::select! {
                    reply = replies.recv() => Some(reply),
                    _ = closed.wait_for(|closed| *closed) => None,
                }
            })
            .await;

            match event {
                Err(_) => return Err(ProtocolError::WriteTimeout),
                Ok(None) | Ok(Some(Err(RecvError::Closed))) => {
                    return Err(ProtocolError::ConnectionClosed)
                }
                Ok(Some(Err(RecvError::Lagged(skipped)))) => {
                    debug!(skipped, "Bootloader listener lagged");
                }
                Ok(Some(Ok(bytes))) => match classify(
                    &bytes,
                    acknowledgement.ack,
                    acknowledgement.check_rejections,
                ) {
                    Some(Reply::Accepted) => return Ok(()),
                    Some(Reply::Rejected(rejection)) => {
                        warn!(
                            code = rejection.code(),
                            "Bootloader rejected firmware: {}",
                            rejection
                        );
                        return Err(ProtocolError::Bootloader(rejection));
                    }
                    None => debug!(reply = ?bytes, "Ignoring bootloader reply"),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_block_layout() {
        let firmware: Vec<u8> = (0..1500).map(|i| i as u8).collect();
        let packets = encode_firmware(&firmware);
        assert_eq!(packets.len(), 3);

        let first = &packets[0];
        assert_eq!(first.len(), BLOCK_LEN + 5);
        assert_eq!(&first[..3], &[STX, 1, 254]);
        assert_eq!(&first[3..3 + BLOCK_LEN], &firmware[..BLOCK_LEN]);
        let crc = crc16(&firmware[..BLOCK_LEN]).to_be_bytes();
        assert_eq!(&first[BLOCK_LEN + 3..], &crc);

        let second = &packets[1];
        assert_eq!(&second[..3], &[STX, 2, 253]);
        assert_eq!(&second[3..3 + 476], &firmware[BLOCK_LEN..]);
        assert!(second[3 + 476..3 + BLOCK_LEN].iter().all(|&b| b == PADDING));

        assert_eq!(packets[2], vec![EOT]);
    }

    #[test]
    fn test_block_numbers_wrap() {
        let packets = encode_firmware(&vec![0; BLOCK_LEN * 256]);
        assert_eq!(&packets[254][1..3], &[255, 0]);
        assert_eq!(&packets[255][1..3], &[0, 255]);
    }

    #[test]
    fn test_rejection_codes() {
        for code in 0x07..=0x0B {
            let rejection = BootloaderError::from_code(code).unwrap();
            assert_eq!(rejection.code(), code);
        }
        assert_eq!(BootloaderError::from_code(0x06), None);
        assert_eq!(BootloaderError::from_code(0x0C), None);
        assert_eq!(
            BootloaderError::WrongMagicNumber.to_string(),
            "Wrong magic number"
        );
    }

    #[test]
    fn test_classify_replies() {
        assert_eq!(classify(&[0x06], BOOTLOADER_ACK, true), Some(Reply::Accepted));
        assert_eq!(
            classify(&[0x06, 0x0B], BOOTLOADER_ACK, true),
            Some(Reply::Rejected(BootloaderError::SignatureNotVerified))
        );
        assert_eq!(classify(&[0x43], BOOTLOADER_ACK, true), None);
        assert_eq!(classify(&[0x18], ABORT_ACK, false), Some(Reply::Accepted));
        assert_eq!(classify(&[0x07], ABORT_ACK, false), None);
    }
}
