//! Waiting for device responses
//!
//! A [`PacketWait`] is registered with the session before the request is
//! written, so a response can never slip past it. A wait for a request about
//! to be written drops pooled frames it would match, since they answer an
//! earlier request. A plain `wait_for` replays them instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::ConnectionInner;
use super::dispatch::Session;
use super::packet::{Frame, PacketType};
use super::payload::decode_payload;
use super::transport::Transport;
use super::ProtocolError;

/// Reject code reported when the device saw a sequence number it did not expect
const REJECT_INVALID_SEQUENCE: u32 = 5;

/// Human readable reason for a device reject code
pub fn reject_reason(code: u32) -> Option<&'static str> {
    let reason = match code {
        0 => "No error",
        1 => "Checksum error",
        2 => "Device is busy on previous command",
        3 => "Chunk out of order",
        4 => "Invalid chunk count",
        5 => "Invalid sequence number",
        6 => "Invalid payload length",
        7 => "Application buffer blocked",
        8 => "No more chunks",
        9 => "Invalid packet type",
        10 => "Invalid chunk number",
        11 => "Incomplete packet",
        _ => return None,
    };
    Some(reason)
}

/// Error for an ERROR frame received while waiting on `awaited_sequence`
fn rejection(frame: &Frame, awaited_sequence: u16, latest_sequence: u16) -> ProtocolError {
    let raw = match decode_payload(&frame.payload) {
        Ok(payload) => payload.raw,
        Err(_) => frame.payload.clone(),
    };
    let code = raw.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b));

    if code == REJECT_INVALID_SEQUENCE && latest_sequence != awaited_sequence {
        debug!(
            awaited_sequence,
            latest_sequence, "Request superseded by a newer command"
        );
        return ProtocolError::AbortedByUser;
    }

    let reason = match reject_reason(code) {
        Some(reason) => reason.to_string(),
        None => format!("Unknown reject reason: {:02x?}", raw),
    };
    warn!(code, %reason, "Device rejected request");
    ProtocolError::WriteRejected { code, reason }
}

/// Which frames resolve a wait
#[derive(Debug, Clone)]
pub(crate) struct WaitCriteria {
    pub(crate) packet_types: Vec<PacketType>,
    pub(crate) sequence_number: u16,
}

impl WaitCriteria {
    pub(crate) fn new(packet_types: &[PacketType], sequence_number: u16) -> Self {
        Self {
            packet_types: packet_types.to_vec(),
            sequence_number,
        }
    }

    /// Whether `frame` is a response this wait accepts. STATUS frames match any
    /// sequence number.
    pub(crate) fn matches(&self, frame: &Frame) -> bool {
        self.packet_types.contains(&frame.packet_type)
            && (frame.sequence_number == self.sequence_number
                || frame.packet_type == PacketType::Status)
    }

    /// Outcome of offering `frame` to this wait, `None` if it does not apply
    pub(crate) fn evaluate(
        &self,
        frame: &Frame,
        latest_sequence: u16,
    ) -> Option<Result<Frame, ProtocolError>> {
        if !frame.is_valid() {
            return None;
        }

        if frame.packet_type == PacketType::Error {
            return Some(Err(rejection(frame, self.sequence_number, latest_sequence)));
        }

        self.matches(frame).then(|| Ok(frame.clone()))
    }
}

/// A pending wait for one response frame
///
/// Dropping the wait deregisters it.
pub struct PacketWait {
    id: u64,
    reply: oneshot::Receiver<Result<Frame, ProtocolError>>,
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    deadline: Instant,
}

impl PacketWait {
    /// Handle that can cancel this wait from elsewhere
    pub fn canceller(&self) -> WaitCanceller {
        WaitCanceller {
            id: self.id,
            session: Arc::clone(&self.session),
            cancel: self.cancel.clone(),
        }
    }

    /// Wait for the response
    pub async fn wait(mut self) -> Result<Frame, ProtocolError> {
        let outcome = tokio::time::timeout_at(self.deadline, async {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => Err(ProtocolError::Cancelled),

                reply = &mut self.reply => match reply {
                    Ok(result) => result,
                    Err(_) => Err(ProtocolError::ConnectionClosed),
                },
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) if !self.transport.is_open() => Err(ProtocolError::ConnectionClosed),
            Err(_) => Err(ProtocolError::ReadTimeout),
        }
    }
}

impl Drop for PacketWait {
    fn drop(&mut self) {
        self.session.remove_waiter(self.id);
    }
}

/// Cancels a [`PacketWait`]
#[derive(Clone)]
pub struct WaitCanceller {
    id: u64,
    session: Arc<Session>,
    cancel: CancellationToken,
}

impl WaitCanceller {
    /// Cancel the wait. The listener is removed before this returns.
    pub fn cancel(&self) {
        self.session.remove_waiter(self.id);
        self.cancel.cancel();
    }

    /// Whether [`WaitCanceller::cancel`] was called
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl ConnectionInner {
    /// Register a wait for one of `packet_types` answering `sequence_number`,
    /// satisfied by a pooled frame if one matches
    pub(crate) fn wait_for(
        &self,
        packet_types: &[PacketType],
        sequence_number: u16,
        timeout: Duration,
    ) -> Result<PacketWait, ProtocolError> {
        self.register_wait(packet_types, sequence_number, timeout, true)
    }

    /// Register a wait for the response to a request that is about to be
    /// written. Matching pooled frames are discarded.
    pub(crate) fn wait_for_response(
        &self,
        packet_types: &[PacketType],
        sequence_number: u16,
        timeout: Duration,
    ) -> Result<PacketWait, ProtocolError> {
        self.register_wait(packet_types, sequence_number, timeout, false)
    }

    fn register_wait(
        &self,
        packet_types: &[PacketType],
        sequence_number: u16,
        timeout: Duration,
        replay: bool,
    ) -> Result<PacketWait, ProtocolError> {
        if !self.transport.is_connected() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let criteria = WaitCriteria::new(packet_types, sequence_number);
        let (id, reply) = self.session.register_waiter(criteria, replay)?;

        Ok(PacketWait {
            id,
            reply,
            session: Arc::clone(&self.session),
            transport: Arc::clone(&self.transport),
            cancel: CancellationToken::new(),
            deadline: Instant::now() + timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::payload::encode_payload;

    fn error_frame(code: u8) -> Frame {
        Frame::new(1, 1, 0, PacketType::Error, 0, encode_payload(&[code], &[]).unwrap())
    }

    #[test]
    fn test_reject_table() {
        assert_eq!(reject_reason(1), Some("Checksum error"));
        assert_eq!(reject_reason(2), Some("Device is busy on previous command"));
        assert_eq!(reject_reason(11), Some("Incomplete packet"));
        assert_eq!(reject_reason(12), None);
    }

    #[test]
    fn test_error_frame_rejects_any_waiter() {
        let criteria = WaitCriteria::new(&[PacketType::CmdAck], 4);
        match criteria.evaluate(&error_frame(2), 4) {
            Some(Err(ProtocolError::WriteRejected { code, reason })) => {
                assert_eq!(code, 2);
                assert_eq!(reason, "Device is busy on previous command");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_reject_code() {
        let criteria = WaitCriteria::new(&[PacketType::CmdAck], 4);
        match criteria.evaluate(&error_frame(0x42), 4) {
            Some(Err(ProtocolError::WriteRejected { code, reason })) => {
                assert_eq!(code, 0x42);
                assert!(reason.starts_with("Unknown reject reason"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_sequence_after_newer_command_is_abort() {
        let criteria = WaitCriteria::new(&[PacketType::CmdOutput], 4);
        assert!(matches!(
            criteria.evaluate(&error_frame(5), 5),
            Some(Err(ProtocolError::AbortedByUser))
        ));
        assert!(matches!(
            criteria.evaluate(&error_frame(5), 4),
            Some(Err(ProtocolError::WriteRejected { code: 5, .. }))
        ));
    }

    #[test]
    fn test_sequence_matching() {
        let criteria = WaitCriteria::new(&[PacketType::CmdOutput, PacketType::Status], 7);

        let output = Frame::new(1, 1, 7, PacketType::CmdOutput, 0, vec![]);
        let other_output = Frame::new(1, 1, 8, PacketType::CmdOutput, 0, vec![]);
        let status = Frame::new(1, 1, 0xFFFF, PacketType::Status, 0, vec![]);
        let ack = Frame::new(1, 1, 7, PacketType::CmdAck, 0, vec![]);

        assert!(criteria.matches(&output));
        assert!(!criteria.matches(&other_output));
        assert!(criteria.matches(&status));
        assert!(!criteria.matches(&ack));
    }

    #[test]
    fn test_malformed_frames_are_ignored() {
        let criteria = WaitCriteria::new(&[PacketType::Status], 1);
        let mut frame = Frame::new(1, 1, 1, PacketType::Status, 0, vec![]);
        frame.errors.push(crate::protocol::FrameError::CrcMismatch {
            expected: 0,
            actual: 1,
        });
        assert!(criteria.evaluate(&frame, 1).is_none());
    }
}
