//! Wire packets, bincode over UDP.

use serde::{Deserialize, Serialize};
use warfront_core::command::{CommandMessage, CommandRejection};
use warfront_core::components::{ConnectionId, TeamId};
use warfront_core::construction::BuildRejection;
use warfront_core::math::Vec2Fixed;
use warfront_core::replication::Snapshot;

use crate::error::Result;

/// Bumped whenever a packet layout changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest datagram the server reads.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Packets sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientPacket {
    /// Request a player slot.
    Hello {
        /// Client protocol version.
        version: u32,
    },
    /// Tick-stamped command. The connection id is taken from the sender's
    /// address, not from the message.
    Command(CommandMessage),
    /// New camera rectangle.
    ViewExtent {
        /// Ground point the camera looks at.
        center: Vec2Fixed,
        /// Half extents of the visible rectangle.
        half_extent: Vec2Fixed,
    },
    /// Leaving the game.
    Goodbye,
}

/// Outcome of a build command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    /// Structure placed.
    Accepted,
    /// Builder is walking to the site.
    Pending,
    /// Request refused.
    Rejected(BuildRejection),
}

/// Packets sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerPacket {
    /// Slot granted.
    Welcome {
        /// Assigned connection.
        connection_id: ConnectionId,
        /// Team the connection controls.
        team: TeamId,
        /// Current simulation tick.
        tick: u64,
    },
    /// Hello refused.
    Refused {
        /// Human-readable reason.
        reason: String,
    },
    /// Per-tick world state.
    Snapshot(Snapshot),
    /// Result of a build command.
    BuildStatus(BuildStatus),
    /// Command dropped at submission.
    CommandRejected(CommandRejection),
}

/// Encode a packet for sending.
pub fn encode<T: Serialize>(packet: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(packet)?)
}

/// Decode a received datagram.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use warfront_core::command::CommandKind;

    #[test]
    fn test_command_packet_decodes() {
        let packet = ClientPacket::Command(CommandMessage::new(3, 12, CommandKind::Stop));
        let bytes = encode(&packet).unwrap();
        assert_eq!(decode::<ClientPacket>(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(decode::<ClientPacket>(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }
}
