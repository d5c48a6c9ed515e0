//! Server configuration from CLI flags and an optional RON file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use warfront_core::catalog::Catalog;
use warfront_core::config::{SimConfig, TICK_RATE};

use crate::error::{Result, ServerError};

/// Command line flags.
#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Warfront dedicated server")]
pub struct Args {
    /// RON file with server settings. Flags override it.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Address to bind to.
    #[arg(short = 'H', long)]
    pub host: Option<String>,
    /// UDP port to listen on.
    #[arg(short, long)]
    pub port: Option<u16>,
    /// Maximum players per game.
    #[arg(short, long)]
    pub max_players: Option<u8>,
    /// Simulation ticks per second.
    #[arg(short, long)]
    pub tick_rate: Option<u32>,
    /// Write a replay here on shutdown.
    #[arg(long)]
    pub replay: Option<PathBuf>,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Maximum players per game.
    pub max_players: u8,
    /// Tick rate (overrides the simulation config's).
    pub tick_rate: u32,
    /// Seconds of silence before a client is dropped.
    pub client_timeout_secs: u64,
    /// Simulation parameters file; built-in defaults when absent.
    pub sim_config_path: Option<PathBuf>,
    /// Catalog file; the bundled catalog when absent.
    pub catalog_path: Option<PathBuf>,
    /// Replay output written on shutdown.
    pub replay_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7777,
            max_players: 8,
            tick_rate: TICK_RATE,
            client_timeout_secs: 10,
            sim_config_path: None,
            catalog_path: None,
            replay_path: None,
        }
    }
}

impl ServerConfig {
    /// Parse a config from RON text.
    pub fn from_ron(text: &str, path: &Path) -> Result<Self> {
        ron::from_str(text).map_err(|e| ServerError::Config {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Build the effective config: file first, then flags.
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_ron(&std::fs::read_to_string(path)?, path)?,
            None => Self::default(),
        };
        if let Some(host) = &args.host {
            config.host.clone_from(host);
        }
        if let Some(port) = args.port {
            config.port = port;
        }
        if let Some(max_players) = args.max_players {
            config.max_players = max_players;
        }
        if let Some(tick_rate) = args.tick_rate {
            config.tick_rate = tick_rate;
        }
        if args.replay.is_some() {
            config.replay_path.clone_from(&args.replay);
        }
        Ok(config)
    }

    /// Socket address to bind.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ServerError::Config {
                path: "<host>".to_string(),
                message: e.to_string(),
            })
    }

    /// Timeout after which silent clients are dropped.
    #[must_use]
    pub const fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    /// Load simulation parameters, applying the server tick rate.
    pub fn sim_config(&self) -> Result<SimConfig> {
        let mut sim = match &self.sim_config_path {
            Some(path) => SimConfig::load(path)?,
            None => SimConfig::default(),
        };
        sim.tick_rate = self.tick_rate;
        Ok(sim)
    }

    /// Load the unit and structure catalog.
    pub fn catalog(&self) -> Result<Catalog> {
        Ok(match &self.catalog_path {
            Some(path) => Catalog::load(path)?,
            None => Catalog::standard()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["warfront_server"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_defaults_without_flags() {
        let config = ServerConfig::from_args(&args(&[])).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.bind_addr().unwrap().port(), 7777);
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.ron");
        std::fs::write(&path, "(port: 9000, max_players: 2, client_timeout_secs: 3)").unwrap();

        let path_arg = path.to_string_lossy().to_string();
        let config =
            ServerConfig::from_args(&args(&["--config", &path_arg, "--port", "9100"])).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.max_players, 2);
        assert_eq!(config.client_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_bad_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.ron");
        std::fs::write(&path, "(port: \"nope\")").unwrap();
        let path_arg = path.to_string_lossy().to_string();
        let err = ServerConfig::from_args(&args(&["--config", &path_arg])).unwrap_err();
        assert!(matches!(err, ServerError::Config { .. }));
    }

    #[test]
    fn test_tick_rate_flows_into_sim_config() {
        let config = ServerConfig::from_args(&args(&["--tick-rate", "10"])).unwrap();
        assert_eq!(config.sim_config().unwrap().tick_duration_ms(), 100);
        assert!(config.catalog().unwrap().unit_count() > 0);
    }
}
