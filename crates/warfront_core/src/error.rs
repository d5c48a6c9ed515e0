//! Error types for the game simulation.
//!
//! Rejections that are part of normal play (build placement, ledger debits,
//! stale commands) have their own enums next to the code that produces
//! them. [`GameError`] covers caller mistakes and IO/serialization failures.

use thiserror::Error;

use crate::command::CommandRejection;
use crate::components::{ConnectionId, EntityId};
use crate::construction::BuildRejection;
use crate::economy::LedgerError;
use crate::production::ProductionError;

/// Result type alias using [`GameError`].
pub type Result<T> = std::result::Result<T, GameError>;

/// Top-level error type for all game simulation errors.
#[derive(Debug, Error)]
pub enum GameError {
    /// Invalid entity reference.
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    /// Connection was never registered or has left.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Catalog index does not name a unit or structure.
    #[error("Unknown catalog index: {0}")]
    UnknownCatalogIndex(u32),

    /// Data file parsing error.
    #[error("Failed to parse data file '{path}': {message}")]
    DataParseError {
        /// Path to the file that failed to parse.
        path: String,
        /// Error message.
        message: String,
    },

    /// Encoding or decoding simulation state failed.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Reading or writing a file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Command refused by the command channel.
    #[error("Command rejected: {0}")]
    Command(#[from] CommandRejection),

    /// Placement refused by the construction validator.
    #[error("Build rejected: {0}")]
    Build(#[from] BuildRejection),

    /// Production request refused.
    #[error("Production rejected: {0}")]
    Production(#[from] ProductionError),

    /// Ledger refused a debit.
    #[error("Ledger rejected: {0}")]
    Ledger(#[from] LedgerError),

    /// Invalid game state.
    #[error("Invalid game state: {0}")]
    InvalidState(String),

    /// Replay diverged from its recorded outcome.
    #[error("Desync detected at tick {tick}: local hash {local_hash}, remote hash {remote_hash}")]
    DesyncDetected {
        /// Tick where desync occurred.
        tick: u64,
        /// Local simulation hash.
        local_hash: u64,
        /// Remote simulation hash.
        remote_hash: u64,
    },
}

impl From<bincode::Error> for GameError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
