//! Packet versions and version negotiation
//!
//! Devices in the field speak one of three framing revisions. The connection
//! probes them newest first and latches the first one that answers.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::connection::ConnectionInner;
use super::packet::PacketType;
use super::send::Expect;
use super::{ProtocolError, STATUS_SEQUENCE_NUMBER};

/// Framing revision spoken by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketVersion {
    /// First-generation framing with one-byte fields
    V1,
    /// First-generation framing with wide fields
    V2,
    /// Typed packets with a 16-byte header
    V3,
}

impl PacketVersion {
    /// Negotiation order
    pub fn newest_first() -> [PacketVersion; 3] {
        [PacketVersion::V3, PacketVersion::V2, PacketVersion::V1]
    }

    /// Whether this revision uses the chunked-ack legacy framing
    pub fn is_legacy(&self) -> bool {
        !matches!(self, PacketVersion::V3)
    }
}

impl fmt::Display for PacketVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketVersion::V1 => write!(f, "v1"),
            PacketVersion::V2 => write!(f, "v2"),
            PacketVersion::V3 => write!(f, "v3"),
        }
    }
}

/// Command used to probe legacy devices
const LEGACY_PROBE_COMMAND: u32 = 41;

impl ConnectionInner {
    /// Negotiate the packet version, reusing a latched result.
    ///
    /// Caller must hold the operation lock.
    pub(crate) async fn negotiate_locked(
        &self,
    ) -> Result<PacketVersion, ProtocolError> {
        if let Some(version) = self.session.working_version() {
            debug!(%version, "Packet version already negotiated");
            return Ok(version);
        }

        if !self.transport.is_open() {
            return Err(ProtocolError::ConnectionNotOpen);
        }

        let result = self.probe_all().await;
        self.session.set_probe_version(None);

        match result {
            Ok(version) => {
                self.session.set_working_version(Some(version));
                info!(%version, "Negotiated packet version");
                Ok(version)
            }
            Err(e) => {
                warn!("Packet version negotiation failed: {}", e);
                Err(e)
            }
        }
    }

    async fn probe_all(&self) -> Result<PacketVersion, ProtocolError> {
        for version in PacketVersion::newest_first() {
            self.session.set_probe_version(Some(version));

            for attempt in 1..=self.config.negotiation_tries {
                debug!(%version, attempt, "Probing packet version");

                let result = match version {
                    PacketVersion::V3 => self.probe_v3().await,
                    PacketVersion::V2 | PacketVersion::V1 => self.probe_legacy(version).await,
                };

                match result {
                    Ok(()) => return Ok(version),
                    Err(
                        e @ (ProtocolError::ConnectionClosed
                        | ProtocolError::ConnectionNotOpen
                        | ProtocolError::NotConnected),
                    ) => return Err(e),
                    Err(e) => debug!(%version, attempt, "Probe failed: {}", e),
                }
            }
        }

        Err(ProtocolError::NoWorkingPacketVersion)
    }

    async fn probe_v3(&self) -> Result<(), ProtocolError> {
        let frames = self
            .codec
            .encode(&[], STATUS_SEQUENCE_NUMBER, PacketType::StatusReq)?;
        self.send_with_retry(
            &frames,
            Some(Expect::new(&[PacketType::Status], STATUS_SEQUENCE_NUMBER)),
            1,
        )
        .await
        .map(|_| ())
    }

    async fn probe_legacy(&self, version: PacketVersion) -> Result<(), ProtocolError> {
        self.send_legacy(version, LEGACY_PROBE_COMMAND, &[0x00], 1)
            .await
    }
}
