//! Protocol errors

use thiserror::Error;

use super::bootloader::BootloaderError;
use super::payload::CmdState;
use super::version::PacketVersion;

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// No device was found
    #[error("No device connected")]
    NotConnected,

    /// The transport went away or the connection was closed
    #[error("Connection was closed while in process")]
    ConnectionClosed,

    /// The transport was never opened
    #[error("Connection was not open")]
    ConnectionNotOpen,

    /// A write failed or the device sent a NACK
    #[error("Unable to write packet to the device: {0}")]
    WriteError(String),

    /// A write or its acknowledgement did not complete in time
    #[error("Did not receive ACK of sent packet on time")]
    WriteTimeout,

    /// No response arrived in time
    #[error("Did not receive the expected data from device on time")]
    ReadTimeout,

    /// The device answered with an ERROR frame
    #[error("The write packet operation was rejected by the device because: {reason}")]
    WriteRejected {
        /// Reject code from the ERROR frame
        code: u32,
        /// Readable reject reason
        reason: String,
    },

    /// The device answered none of the packet versions
    #[error("No working packet version")]
    NoWorkingPacketVersion,

    /// The device status tracks another command
    #[error("Device is executing command {actual}, expected command {expected}")]
    ExecutingOtherCommand {
        /// Sequence number waited on
        expected: u16,
        /// Sequence number the device reports
        actual: u16,
    },

    /// A newer command replaced the one waited on
    #[error("Request was superseded by a newer command")]
    AbortedByUser,

    /// The wait was cancelled
    #[error("Operation was cancelled")]
    Cancelled,

    /// The operation needs a negotiated packet version
    #[error("Packet version has not been negotiated")]
    VersionNotNegotiated,

    /// The operation does not exist on the negotiated version
    #[error("Operation is not supported on packet version {0}")]
    UnsupportedVersion(PacketVersion),

    /// Command output of a type the caller did not ask for
    #[error("Unexpected command type {actual}, expected one of {expected:?}")]
    UnexpectedCommandType {
        /// Type of the received output
        actual: u32,
        /// Types the caller accepts
        expected: Vec<u32>,
    },

    /// The command finished without output
    #[error("Command reached state {0:?} without producing output")]
    NoCommandOutput(CmdState),

    /// The abort answer names another command
    #[error("Abort targeted command {actual}, expected command {expected}")]
    AbortSequenceMismatch {
        /// Sequence number asked to abort
        expected: u16,
        /// Sequence number the device reports
        actual: u16,
    },

    /// A response could not be decoded
    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),

    /// A length or count does not fit its wire field
    #[error("{field} of {length} does not fit its field (max {max})")]
    PayloadTooLarge {
        /// What overflowed
        field: &'static str,
        /// The value that was to be encoded
        length: usize,
        /// Largest value the field holds
        max: usize,
    },

    /// The operation needs the device in its bootloader
    #[error("Device is not in bootloader mode")]
    NotInBootloader,

    /// The bootloader refused the firmware image
    #[error("Bootloader rejected the firmware: {0}")]
    Bootloader(#[from] BootloaderError),

    /// A configuration file could not be parsed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transport I/O failure outside a write
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether a failed attempt may be repeated.
    ///
    /// Only transport hiccups are transient; everything else describes a
    /// connection or device state that another attempt will not change.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::WriteError(_) | ProtocolError::WriteTimeout | ProtocolError::ReadTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ProtocolError::WriteTimeout.is_retryable());
        assert!(ProtocolError::ReadTimeout.is_retryable());
        assert!(ProtocolError::WriteError("broken pipe".into()).is_retryable());

        assert!(!ProtocolError::ConnectionClosed.is_retryable());
        assert!(!ProtocolError::ConnectionNotOpen.is_retryable());
        assert!(!ProtocolError::NotConnected.is_retryable());
        assert!(!ProtocolError::AbortedByUser.is_retryable());
        assert!(!ProtocolError::NotInBootloader.is_retryable());
        assert!(!ProtocolError::Bootloader(BootloaderError::WrongMagicNumber).is_retryable());
        assert!(!ProtocolError::PayloadTooLarge {
            field: "raw blob",
            length: 70000,
            max: 65535
        }
        .is_retryable());
        assert!(!ProtocolError::WriteRejected {
            code: 2,
            reason: "Device is busy on previous command".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_overflow_message_names_field() {
        let err = ProtocolError::PayloadTooLarge {
            field: "chunk count",
            length: 70000,
            max: 65535,
        };
        assert_eq!(err.to_string(), "chunk count of 70000 does not fit its field (max 65535)");
    }

    #[test]
    fn test_rejection_message_carries_reason() {
        let err = ProtocolError::WriteRejected {
            code: 1,
            reason: "Checksum error".into(),
        };
        assert!(err.to_string().ends_with("because: Checksum error"));
    }
}
