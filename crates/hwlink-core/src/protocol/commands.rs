//! Command orchestration
//!
//! Issue a command, poll the device status, fetch streamed output and abort.
//! These operations only exist for v3 devices, so they hang off a
//! [`CommandChannel`] that can only be obtained once v3 is negotiated.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, info};

use super::connection::ConnectionInner;
use super::packet::{Frame, PacketType};
use super::payload::{
    decode_payload, decode_raw_data, decode_status, encode_payload, encode_raw_data,
    DeviceIdleState, RawData, StatusData,
};
use super::send::Expect;
use super::{ProtocolError, STATUS_SEQUENCE_NUMBER};

/// Result of fetching a command's output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutput {
    /// The command has not produced output yet; this is the device status
    Status(StatusData),
    /// Output of the command
    Raw(RawData),
}

/// Typed command operations on a v3 connection
#[derive(Clone)]
pub struct CommandChannel {
    inner: Arc<ConnectionInner>,
}

impl CommandChannel {
    pub(crate) fn new(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    /// Send a command and wait until the device acknowledges every chunk
    pub async fn send_command(
        &self,
        command_type: u32,
        data: &[u8],
        sequence_number: u16,
    ) -> Result<(), ProtocolError> {
        let raw = encode_raw_data(&RawData {
            command_type,
            data: data.to_vec(),
        });
        let payload = encode_payload(&raw, &[])?;
        let frames = self
            .inner
            .codec
            .encode(&payload, sequence_number, PacketType::Cmd)?;

        info!(
            command_type,
            sequence_number,
            frames = frames.len(),
            "Sending command"
        );

        let _guard = self.inner.operation_lock.lock().await;
        self.inner
            .send_with_retry(
                &frames,
                Some(Expect::new(&[PacketType::CmdAck], sequence_number)),
                self.inner.config.max_tries,
            )
            .await?;
        Ok(())
    }

    /// Fetch the device status
    pub async fn get_status(&self) -> Result<StatusData, ProtocolError> {
        let frame = self.request_status().await?;
        status_from_frame(&frame)
    }

    /// Read the SDK version the device firmware was built with.
    ///
    /// The first six payload bytes of the STATUS response hold major, minor
    /// and patch as big-endian 16-bit numbers.
    pub async fn get_sdk_version(&self) -> Result<SdkVersion, ProtocolError> {
        let frame = self.request_status().await?;
        let version = SdkVersion::from_bytes(&frame.payload)?;
        info!(%version, "Device SDK version");
        Ok(version)
    }

    async fn request_status(&self) -> Result<Frame, ProtocolError> {
        let frames = self
            .inner
            .codec
            .encode(&[], STATUS_SEQUENCE_NUMBER, PacketType::StatusReq)?;

        let _guard = self.inner.operation_lock.lock().await;
        self.request(
            &frames,
            Expect::new(&[PacketType::Status], STATUS_SEQUENCE_NUMBER),
        )
        .await
    }

    /// Fetch the output of command `sequence_number`, chunk by chunk.
    ///
    /// The device answers with a STATUS snapshot when the output is not ready.
    pub async fn get_command_output(
        &self,
        sequence_number: u16,
    ) -> Result<CommandOutput, ProtocolError> {
        let _guard = self.inner.operation_lock.lock().await;

        let mut chunks: Vec<Option<Vec<u8>>> = vec![None];
        let mut total;
        let mut current = 1u16;
        let mut is_status;

        loop {
            let request = encode_payload(&current.to_be_bytes(), &[])?;
            let frames = self
                .inner
                .codec
                .encode(&request, sequence_number, PacketType::CmdOutputReq)?;

            let frame = self
                .request(
                    &frames,
                    Expect::new(
                        &[PacketType::CmdOutput, PacketType::Status],
                        sequence_number,
                    ),
                )
                .await?;

            total = frame.total_packet_number;
            if chunks.len() < total as usize {
                chunks.resize(total as usize, None);
            }
            let index = (frame.current_packet_number as usize).saturating_sub(1);
            if let Some(slot) = chunks.get_mut(index) {
                *slot = Some(frame.payload);
            }
            is_status = frame.packet_type == PacketType::Status;

            debug!(chunk = index + 1, total, is_status, "Received output chunk");

            match next_chunk(current, total) {
                Some(next) => current = next,
                None => break,
            }
        }

        let mut envelope = Vec::new();
        for (i, chunk) in chunks.into_iter().take(total as usize).enumerate() {
            let chunk = chunk.ok_or_else(|| {
                ProtocolError::InvalidResponse(format!("missing output chunk {}", i + 1))
            })?;
            envelope.extend_from_slice(&chunk);
        }

        let payload = decode_payload(&envelope)?;
        if is_status {
            Ok(CommandOutput::Status(decode_status(&payload.raw)?))
        } else {
            Ok(CommandOutput::Raw(decode_raw_data(&payload.raw)?))
        }
    }

    /// Poll until command `sequence_number` produces output of one of
    /// `expected_command_types`.
    ///
    /// `on_status` sees every intermediate status while the device is
    /// reporting through this link.
    pub async fn wait_for_command_output<F>(
        &self,
        sequence_number: u16,
        expected_command_types: &[u32],
        mut on_status: F,
        poll_interval: Duration,
    ) -> Result<RawData, ProtocolError>
    where
        F: FnMut(&StatusData),
    {
        loop {
            match self.get_command_output(sequence_number).await? {
                CommandOutput::Raw(raw) if expected_command_types.contains(&raw.command_type) => {
                    return Ok(raw);
                }
                CommandOutput::Raw(raw) => {
                    return Err(ProtocolError::UnexpectedCommandType {
                        actual: raw.command_type,
                        expected: expected_command_types.to_vec(),
                    });
                }
                CommandOutput::Status(status) => {
                    if status.current_cmd_seq != sequence_number {
                        return Err(ProtocolError::ExecutingOtherCommand {
                            expected: sequence_number,
                            actual: status.current_cmd_seq,
                        });
                    }
                    if status.cmd_state.is_terminal() {
                        return Err(ProtocolError::NoCommandOutput(status.cmd_state));
                    }
                    if status.device_idle_state == DeviceIdleState::Usb {
                        on_status(&status);
                    }
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Ask the device to abort command `sequence_number`
    pub async fn send_abort(&self, sequence_number: u16) -> Result<StatusData, ProtocolError> {
        let frames = self
            .inner
            .codec
            .encode(&[], sequence_number, PacketType::Abort)?;

        info!(sequence_number, "Aborting command");

        let _guard = self.inner.operation_lock.lock().await;
        let frame = self
            .request(&frames, Expect::new(&[PacketType::Status], sequence_number))
            .await?;
        let status = status_from_frame(&frame)?;

        if status.current_cmd_seq != sequence_number {
            return Err(ProtocolError::AbortSequenceMismatch {
                expected: sequence_number,
                actual: status.current_cmd_seq,
            });
        }

        Ok(status)
    }

    /// Send single-frame request and return its response
    async fn request(&self, frames: &[Vec<u8>], expect: Expect<'_>) -> Result<Frame, ProtocolError> {
        self.inner
            .send_with_retry(frames, Some(expect), self.inner.config.max_tries)
            .await?
            .ok_or_else(|| ProtocolError::InvalidResponse("no response frame".into()))
    }
}

/// Index of the chunk to request after `current`, `None` once all `total`
/// chunks are in
fn next_chunk(current: u16, total: u16) -> Option<u16> {
    (current < total).then(|| current + 1)
}

/// SDK version reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SdkVersion {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Patch version
    pub patch: u16,
}

impl SdkVersion {
    const LEN: usize = 6;

    fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < Self::LEN {
            return Err(ProtocolError::InvalidResponse(format!(
                "SDK version needs {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        Ok(Self {
            major: BigEndian::read_u16(&bytes[0..2]),
            minor: BigEndian::read_u16(&bytes[2..4]),
            patch: BigEndian::read_u16(&bytes[4..6]),
        })
    }
}

impl fmt::Display for SdkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn status_from_frame(frame: &Frame) -> Result<StatusData, ProtocolError> {
    let payload = decode_payload(&frame.payload)?;
    decode_status(&payload.raw)
}
