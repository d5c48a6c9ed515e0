//! # Warfront Server
//!
//! Headless authoritative server for the Warfront RTS.
//!
//! Owns the only [`Simulation`](warfront_core::simulation::Simulation),
//! accepts tick-stamped commands over UDP and sends each client the
//! snapshot its camera can see.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;
pub mod state;

pub use config::{Args, ServerConfig};
pub use error::{Result, ServerError};
pub use network::Server;
pub use state::ServerState;
