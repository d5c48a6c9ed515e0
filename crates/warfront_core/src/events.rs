//! Outbound simulation events.
//!
//! The simulation publishes notable outcomes to an [`EventSink`] passed into
//! each tick. The presentation layer (or the server) drains them once per
//! tick; nothing subscribes globally.

use serde::{Deserialize, Serialize};

use crate::catalog::{StructureIndex, UnitIndex};
use crate::command::CommandKind;
use crate::components::{ConnectionId, EntityId, GridCoord, TeamId};
use crate::construction::BuildRejection;
use crate::economy::LedgerError;
use crate::production::ProductionError;

/// Something that happened during a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimEvent {
    /// A unit entered the world.
    UnitSpawned {
        /// New unit.
        entity: EntityId,
        /// Owning team.
        team: TeamId,
        /// Catalog entry.
        unit: UnitIndex,
    },
    /// An entity reached zero health and was removed.
    EntityDestroyed {
        /// Removed entity.
        entity: EntityId,
        /// Its team.
        team: TeamId,
        /// Team credited with the kill.
        killed_by: Option<TeamId>,
    },
    /// A structure was placed and started construction.
    StructurePlaced {
        /// New structure.
        entity: EntityId,
        /// Owning team.
        team: TeamId,
        /// Catalog entry.
        structure: StructureIndex,
        /// Footprint origin.
        origin: GridCoord,
    },
    /// A structure finished construction.
    StructureCompleted {
        /// Completed structure.
        entity: EntityId,
    },
    /// A build request was refused.
    BuildRejected {
        /// Requesting connection.
        connection: ConnectionId,
        /// Reason.
        reason: BuildRejection,
    },
    /// A build request is waiting for its builder to get in range.
    BuildPending {
        /// Requesting connection.
        connection: ConnectionId,
        /// Builder walking to the site.
        builder: EntityId,
    },
    /// A production request was refused.
    ProductionRejected {
        /// Requesting connection.
        connection: ConnectionId,
        /// Reason.
        reason: ProductionError,
    },
    /// A produced unit is ready but blocked by the population cap.
    ProductionWithheld {
        /// Producing structure.
        structure: EntityId,
        /// Waiting unit.
        unit: UnitIndex,
        /// Ledger refusal.
        reason: LedgerError,
    },
    /// A command was dropped during application.
    CommandDropped {
        /// Issuing connection.
        connection: ConnectionId,
        /// Command kind.
        kind: CommandKind,
    },
}

/// Receiver for [`SimEvent`]s.
pub trait EventSink {
    /// Accept one event.
    fn publish(&mut self, event: SimEvent);
}

impl EventSink for Vec<SimEvent> {
    fn publish(&mut self, event: SimEvent) {
        self.push(event);
    }
}

/// Sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&mut self, _event: SimEvent) {}
}
