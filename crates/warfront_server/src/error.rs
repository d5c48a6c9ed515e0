//! Server error types.

use std::net::SocketAddr;

use thiserror::Error;
use warfront_core::error::GameError;

/// Result type alias using [`ServerError`].
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors raised by the server outside the simulation tick.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket or file IO failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A packet could not be encoded or decoded.
    #[error("Packet codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// A RON config file did not parse.
    #[error("Config parse error in '{path}': {message}")]
    Config {
        /// Offending file.
        path: String,
        /// Parser message.
        message: String,
    },

    /// The simulation core refused an operation.
    #[error(transparent)]
    Game(#[from] GameError),

    /// Every player slot is taken.
    #[error("Server full ({max_players} players)")]
    ServerFull {
        /// Configured player limit.
        max_players: u8,
    },

    /// Client speaks another protocol version.
    #[error("Protocol mismatch from {addr}: expected {expected}, got {actual}")]
    ProtocolMismatch {
        /// Sender.
        addr: SocketAddr,
        /// Server protocol version.
        expected: u32,
        /// Client protocol version.
        actual: u32,
    },
}
