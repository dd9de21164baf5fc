//! Writing frames and awaiting their responses
//!
//! This is the only place that retries. An attempt is repeated only for
//! transient transport failures (see [`ProtocolError::is_retryable`]).

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::connection::ConnectionInner;
use super::legacy::{LegacyCodec, ACK_COMMAND, NACK_COMMAND};
use super::packet::{Frame, PacketType};
use super::version::PacketVersion;
use super::ProtocolError;

/// Response a sent frame waits for
#[derive(Debug, Clone, Copy)]
pub struct Expect<'a> {
    /// Packet types that answer the frame
    pub packet_types: &'a [PacketType],
    /// Sequence number the answer must carry (STATUS answers carry any)
    pub sequence_number: u16,
}

impl<'a> Expect<'a> {
    /// Expect one of `packet_types` answering `sequence_number`
    pub fn new(packet_types: &'a [PacketType], sequence_number: u16) -> Self {
        Self {
            packet_types,
            sequence_number,
        }
    }
}

impl ConnectionInner {
    fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.config.ack_timeout_ms)
    }

    fn legacy_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.config.legacy_ack_timeout_ms)
    }

    fn write_failure(&self, e: std::io::Error) -> ProtocolError {
        if self.transport.is_connected() {
            ProtocolError::WriteError(e.to_string())
        } else {
            ProtocolError::ConnectionClosed
        }
    }

    /// Write bytes to the transport, bounded by the ACK timeout
    pub(crate) async fn write_raw(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        match tokio::time::timeout(self.ack_timeout(), self.transport.write(bytes)).await {
            Ok(Ok(())) => {
                debug!(len = bytes.len(), "Wrote frame");
                self.counters.tx_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                self.counters.tx_frames.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(e)) => Err(self.write_failure(e)),
            Err(_) => Err(ProtocolError::WriteTimeout),
        }
    }

    /// Write one frame and, if `expect` is given, await the matching response
    pub(crate) async fn send(
        &self,
        frame: &[u8],
        expect: Option<Expect<'_>>,
    ) -> Result<Option<Frame>, ProtocolError> {
        let Some(expect) = expect else {
            self.write_raw(frame).await?;
            return Ok(None);
        };

        let wait = self.wait_for_response(
            expect.packet_types,
            expect.sequence_number,
            self.ack_timeout(),
        )?;
        let canceller = wait.canceller();

        if let Err(e) = self.write_raw(frame).await {
            canceller.cancel();
            return Err(e);
        }

        wait.wait().await.map(Some)
    }

    /// Send `frames` in order, each with up to `max_tries` attempts.
    ///
    /// Returns the response to the last frame.
    pub(crate) async fn send_with_retry(
        &self,
        frames: &[Vec<u8>],
        expect: Option<Expect<'_>>,
        max_tries: u32,
    ) -> Result<Option<Frame>, ProtocolError> {
        let max_tries = max_tries.max(1);
        let mut response = None;

        for (index, frame) in frames.iter().enumerate() {
            let mut first_error = None;

            for attempt in 1..=max_tries {
                match self.send(frame, expect).await {
                    Ok(received) => {
                        response = received;
                        first_error = None;
                        break;
                    }
                    Err(e) => {
                        let retryable = e.is_retryable();
                        warn!(
                            frame = index + 1,
                            total = frames.len(),
                            attempt,
                            max_tries,
                            "Error sending frame: {}",
                            e
                        );
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
        }

        Ok(response)
    }

    /// Send `data` as legacy frames, each acknowledged before the next
    pub(crate) async fn send_legacy(
        &self,
        version: PacketVersion,
        command_type: u32,
        data: &[u8],
        max_tries: u32,
    ) -> Result<(), ProtocolError> {
        let codec = LegacyCodec::new(version);
        let frames = codec.encode(command_type, data)?;
        let max_tries = max_tries.max(1);
        debug!(%version, command_type, frames = frames.len(), "Sending legacy command");

        for (index, frame) in frames.iter().enumerate() {
            let mut first_error = None;

            for attempt in 1..=max_tries {
                match self.write_legacy_frame(frame).await {
                    Ok(()) => {
                        first_error = None;
                        break;
                    }
                    Err(e) => {
                        warn!(
                            frame = index + 1,
                            total = frames.len(),
                            attempt,
                            "Error sending legacy frame: {}",
                            e
                        );
                        let retryable = e.is_retryable();
                        first_error.get_or_insert(e);
                        if !retryable {
                            break;
                        }
                    }
                }
            }

            if let Some(e) = first_error {
                return Err(e);
            }
        }

        Ok(())
    }

    /// Write one legacy frame and wait for the device's ACK
    async fn write_legacy_frame(&self, frame: &[u8]) -> Result<(), ProtocolError> {
        if !self.transport.is_connected() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let mut acks = self.session.subscribe_ack();
        let mut closed = self.session.closed_watch();
        let deadline = Instant::now() + self.legacy_ack_timeout();

        self.write_raw(frame).await?;

        loop {
            let event = tokio::time::timeout_at(deadline, async {
                tokio::select! {
                    ack = acks.recv() => Some(ack),
                    _ = closed.wait_for(|closed| *closed) => None,
                }
            })
            .await;

            match event {
                Err(_) => return Err(ProtocolError::WriteTimeout),
                Ok(None) => return Err(ProtocolError::ConnectionClosed),
                Ok(Some(Ok(ack))) if ack.command_type == ACK_COMMAND => return Ok(()),
                Ok(Some(Ok(ack))) if ack.command_type == NACK_COMMAND => {
                    warn!("Received NACK");
                    return Err(ProtocolError::WriteError("device sent NACK".into()));
                }
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(RecvError::Lagged(skipped)))) => {
                    debug!(skipped, "ACK listener lagged");
                    continue;
                }
                Ok(Some(Err(RecvError::Closed))) => return Err(ProtocolError::ConnectionClosed),
            }
        }
    }
}
