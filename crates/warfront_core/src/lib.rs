//! # Warfront Core
//!
//! Authoritative simulation core for the Warfront RTS server.
//!
//! This crate contains **only** deterministic logic:
//! - No rendering
//! - No networking
//! - No system randomness
//! - No floating-point math (uses fixed-point)
//!
//! This separation enables:
//! - A headless authoritative server
//! - Replay systems
//! - Determinism testing
//!
//! ## Crate Structure
//!
//! - [`command`] - Tick-stamped command buffering
//! - [`spatial`] - Spatial index for targeting and relevancy
//! - [`targeting`] - AI target acquisition and pursuit
//! - [`combat`] - Damage buffering and resolution
//! - [`construction`] - Occupancy grid and build validation
//! - [`production`] - Per-structure production queues
//! - [`economy`] - Resource and population ledger
//! - [`replication`] - Relevancy filter and snapshot encoding
//! - [`simulation`] - Core simulation loop
//! - [`math`] - Fixed-point math utilities

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod catalog;
pub mod combat;
pub mod command;
pub mod components;
pub mod config;
pub mod construction;
pub mod economy;
pub mod error;
pub mod events;
pub mod math;
pub mod production;
pub mod replay;
pub mod replication;
pub mod simulation;
pub mod spatial;
pub mod targeting;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::catalog::{Catalog, StructureDef, StructureIndex, UnitDef, UnitIndex};
    pub use crate::command::{CommandChannel, CommandKind, CommandMessage, CommandRejection};
    pub use crate::components::*;
    pub use crate::config::SimConfig;
    pub use crate::construction::{BuildRejection, BuildRequest, OccupancyGrid};
    pub use crate::economy::{EconomyLedger, LedgerError};
    pub use crate::error::{GameError, Result};
    pub use crate::events::{EventSink, NullSink, SimEvent};
    pub use crate::math::{Fixed, Rect, Vec2Fixed, Vec3Fixed};
    pub use crate::production::{ProductionError, ProductionQueue};
    pub use crate::replay::{Replay, ReplayPlayer};
    pub use crate::replication::{CodecTable, ComponentId, Replicator, Snapshot, SnapshotEntry};
    pub use crate::simulation::Simulation;
    pub use crate::targeting::{Pursuit, PursuitState};
}
