//! Per-tick command ingestion and ordering.
//!
//! Clients send tick-stamped commands that may arrive early, late, out of
//! order or twice. The [`CommandChannel`] buffers them per connection and
//! hands the simulation exactly the commands stamped with the tick being
//! simulated, in a fixed order. Commands that miss their tick are never
//! applied retroactively.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::UnitIndex;
use crate::components::{ConnectionId, EntityId};
use crate::construction::BuildRequest;
use crate::math::Vec3Fixed;

/// Kind of player command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CommandKind {
    /// No command this tick.
    #[default]
    None,
    /// Select the target entity, or clear the selection.
    PrimaryClick,
    /// Context action: attack an enemy target, otherwise move to the point.
    SecondaryClick,
    /// Attack the target entity.
    Attack,
    /// Drop orders and targets.
    Stop,
    /// Drop orders and hold position.
    Hold,
    /// Place a structure.
    Build,
    /// Queue a unit at the target structure.
    Produce,
}

/// A command as received from a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Issuing connection.
    pub connection: ConnectionId,
    /// Tick the command applies to.
    pub tick: u64,
    /// Command kind.
    pub kind: CommandKind,
    /// World-space point under the cursor.
    pub target_point: Vec3Fixed,
    /// Entity under the cursor.
    pub target_entity: Option<EntityId>,
    /// Placement payload for [`CommandKind::Build`].
    pub build: Option<BuildRequest>,
    /// Unit to queue for [`CommandKind::Produce`].
    pub produce: Option<UnitIndex>,
}

impl CommandMessage {
    /// Command with no target or payload.
    #[must_use]
    pub const fn new(connection: ConnectionId, tick: u64, kind: CommandKind) -> Self {
        Self {
            connection,
            tick,
            kind,
            target_point: Vec3Fixed::ZERO,
            target_entity: None,
            build: None,
            produce: None,
        }
    }

    /// Set the target point.
    #[must_use]
    pub const fn at(mut self, point: Vec3Fixed) -> Self {
        self.target_point = point;
        self
    }

    /// Set the target entity.
    #[must_use]
    pub const fn targeting(mut self, entity: EntityId) -> Self {
        self.target_entity = Some(entity);
        self
    }

    /// Attach a build payload.
    #[must_use]
    pub const fn with_build(mut self, request: BuildRequest) -> Self {
        self.build = Some(request);
        self
    }

    /// Attach a unit to produce.
    #[must_use]
    pub const fn with_produce(mut self, unit: UnitIndex) -> Self {
        self.produce = Some(unit);
        self
    }
}

/// Why a command was dropped at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CommandRejection {
    /// Connection is not registered.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    /// Tick is older than the last tick applied for this connection.
    #[error("stale tick {tick}, last applied {last_applied}")]
    Stale {
        /// Command tick.
        tick: u64,
        /// Last applied tick.
        last_applied: u64,
    },
    /// The tick has already been simulated.
    #[error("tick {tick} already passed, current tick {current}")]
    PastDeadline {
        /// Command tick.
        tick: u64,
        /// Tick being simulated next.
        current: u64,
    },
    /// Tick is further ahead than the channel buffers.
    #[error("tick {tick} too far ahead of current tick {current}")]
    TooFarAhead {
        /// Command tick.
        tick: u64,
        /// Tick being simulated next.
        current: u64,
    },
    /// An identical command is already buffered.
    #[error("duplicate command")]
    Duplicate,
    /// `Build` or `Produce` sent without its payload.
    #[error("missing payload for {0:?}")]
    MissingPayload(CommandKind),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ConnectionBuffer {
    last_applied: Option<u64>,
    pending: BTreeMap<u64, Vec<CommandMessage>>,
}

/// Buffered commands for every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandChannel {
    buffers: BTreeMap<ConnectionId, ConnectionBuffer>,
    /// Next tick to be drained. Commands for earlier ticks are late.
    next_tick: u64,
    /// How many ticks ahead a command may be stamped.
    max_lead: u64,
}

impl CommandChannel {
    /// Create a channel accepting commands up to `max_lead` ticks ahead.
    #[must_use]
    pub fn new(max_lead: u64) -> Self {
        Self {
            buffers: BTreeMap::new(),
            next_tick: 0,
            max_lead,
        }
    }

    /// Start accepting commands from `connection`.
    pub fn register(&mut self, connection: ConnectionId) {
        self.buffers.entry(connection).or_default();
    }

    /// Stop accepting commands from `connection`, discarding anything
    /// buffered. Returns how many commands were discarded.
    pub fn disconnect(&mut self, connection: ConnectionId) -> usize {
        self.buffers
            .remove(&connection)
            .map_or(0, |buffer| buffer.pending.values().map(Vec::len).sum())
    }

    /// Check if `connection` is registered.
    #[must_use]
    pub fn is_registered(&self, connection: ConnectionId) -> bool {
        self.buffers.contains_key(&connection)
    }

    /// Next tick to be drained.
    #[must_use]
    pub const fn next_tick(&self) -> u64 {
        self.next_tick
    }

    /// Last tick drained for `connection`.
    #[must_use]
    pub fn last_applied(&self, connection: ConnectionId) -> Option<u64> {
        self.buffers.get(&connection).and_then(|b| b.last_applied)
    }

    /// Number of commands waiting across all connections.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buffers
            .values()
            .flat_map(|b| b.pending.values())
            .map(Vec::len)
            .sum()
    }

    /// Buffer a command for its tick.
    pub fn submit(&mut self, message: CommandMessage) -> Result<(), CommandRejection> {
        let current = self.next_tick;
        let max_lead = self.max_lead;
        let buffer = self
            .buffers
            .get_mut(&message.connection)
            .ok_or(CommandRejection::UnknownConnection(message.connection))?;

        if let Some(last_applied) = buffer.last_applied {
            if message.tick < last_applied {
                return Err(CommandRejection::Stale {
                    tick: message.tick,
                    last_applied,
                });
            }
        }
        if message.tick < current {
            return Err(CommandRejection::PastDeadline {
                tick: message.tick,
                current,
            });
        }
        if message.tick > current.saturating_add(max_lead) {
            return Err(CommandRejection::TooFarAhead {
                tick: message.tick,
                current,
            });
        }
        let missing_payload = match message.kind {
            CommandKind::Build => message.build.is_none(),
            CommandKind::Produce => message.produce.is_none() || message.target_entity.is_none(),
            _ => false,
        };
        if missing_payload {
            return Err(CommandRejection::MissingPayload(message.kind));
        }

        let slot = buffer.pending.entry(message.tick).or_default();
        if slot.contains(&message) {
            return Err(CommandRejection::Duplicate);
        }
        slot.push(message);
        Ok(())
    }

    /// Take the commands for `tick`, ordered by connection id then arrival.
    ///
    /// Advances the deadline past `tick`. Connections with nothing buffered
    /// for `tick` simply contribute no commands.
    pub fn drain_tick(&mut self, tick: u64) -> Vec<CommandMessage> {
        let mut drained = Vec::new();
        for buffer in self.buffers.values_mut() {
            // Anything older missed its deadline; keep only later ticks.
            let mut later = buffer.pending.split_off(&tick);
            if let Some(commands) = later.remove(&tick) {
                drained.extend(commands);
            }
            buffer.pending = later;
            buffer.last_applied = Some(tick);
        }
        self.next_tick = self.next_tick.max(tick.saturating_add(1));
        drained
    }
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LEAD)
    }
}

/// Default lead limit: ten seconds at 20 ticks per second.
pub const DEFAULT_MAX_LEAD: u64 = 200;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StructureIndex;
    use crate::components::GridCoord;

    fn channel() -> CommandChannel {
        let mut channel = CommandChannel::default();
        channel.register(1);
        channel.register(2);
        channel
    }

    #[test]
    fn test_unknown_connection_rejected() {
        let mut channel = channel();
        assert_eq!(
            channel.submit(CommandMessage::new(9, 0, CommandKind::Stop)),
            Err(CommandRejection::UnknownConnection(9))
        );
    }

    #[test]
    fn test_early_commands_held_until_their_tick() {
        let mut channel = channel();
        channel
            .submit(CommandMessage::new(1, 2, CommandKind::Stop))
            .unwrap();
        assert!(channel.drain_tick(0).is_empty());
        assert!(channel.drain_tick(1).is_empty());
        let drained = channel.drain_tick(2);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].tick, 2);
        assert_eq!(channel.pending_len(), 0);
    }

    #[test]
    fn test_ordered_by_connection_then_arrival() {
        let mut channel = channel();
        channel
            .submit(CommandMessage::new(2, 0, CommandKind::Stop))
            .unwrap();
        channel
            .submit(CommandMessage::new(1, 0, CommandKind::Hold))
            .unwrap();
        channel
            .submit(CommandMessage::new(1, 0, CommandKind::Stop))
            .unwrap();

        let kinds: Vec<_> = channel
            .drain_tick(0)
            .iter()
            .map(|c| (c.connection, c.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (1, CommandKind::Hold),
                (1, CommandKind::Stop),
                (2, CommandKind::Stop)
            ]
        );
    }

    #[test]
    fn test_late_and_stale_commands_dropped() {
        let mut channel = channel();
        channel.drain_tick(0);
        channel.drain_tick(1);
        assert_eq!(
            channel.submit(CommandMessage::new(1, 0, CommandKind::Stop)),
            Err(CommandRejection::Stale {
                tick: 0,
                last_applied: 1
            })
        );
        assert_eq!(
            channel.submit(CommandMessage::new(1, 1, CommandKind::Stop)),
            Err(CommandRejection::PastDeadline {
                tick: 1,
                current: 2
            })
        );
        assert!(channel
            .submit(CommandMessage::new(1, 2, CommandKind::Stop))
            .is_ok());
    }

    #[test]
    fn test_duplicate_is_ignored() {
        let mut channel = channel();
        let message = CommandMessage::new(1, 3, CommandKind::Attack).targeting(4);
        channel.submit(message.clone()).unwrap();
        assert_eq!(channel.submit(message), Err(CommandRejection::Duplicate));
        assert_eq!(channel.pending_len(), 1);
    }

    #[test]
    fn test_too_far_ahead_rejected() {
        let mut channel = CommandChannel::new(5);
        channel.register(1);
        assert!(channel
            .submit(CommandMessage::new(1, 5, CommandKind::Stop))
            .is_ok());
        assert!(matches!(
            channel.submit(CommandMessage::new(1, 6, CommandKind::Stop)),
            Err(CommandRejection::TooFarAhead { .. })
        ));
    }

    #[test]
    fn test_build_requires_payload() {
        let mut channel = channel();
        assert_eq!(
            channel.submit(CommandMessage::new(1, 0, CommandKind::Build)),
            Err(CommandRejection::MissingPayload(CommandKind::Build))
        );
        let request = BuildRequest {
            structure: StructureIndex(0),
            grid_position: GridCoord::new(4, 4),
        };
        assert!(channel
            .submit(CommandMessage::new(1, 0, CommandKind::Build).with_build(request))
            .is_ok());
    }

    #[test]
    fn test_disconnect_discards_buffered() {
        let mut channel = channel();
        channel
            .submit(CommandMessage::new(1, 4, CommandKind::Stop))
            .unwrap();
        channel
            .submit(CommandMessage::new(1, 5, CommandKind::Hold))
            .unwrap();
        assert_eq!(channel.disconnect(1), 2);
        assert!(!channel.is_registered(1));
        assert!(channel.drain_tick(4).is_empty());
    }
}
