//! Simulation tuning loaded once at world init.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GameError, Result};
use crate::math::{fixed_serde, Fixed};

/// Default ticks per second.
pub const TICK_RATE: u32 = 20;

/// Simulation parameters.
///
/// Every field has a default so RON files only need to list overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Ticks per second.
    pub tick_rate: u32,
    /// Construction grid width in cells.
    pub map_width: u32,
    /// Construction grid height in cells.
    pub map_height: u32,
    /// Size of a grid cell in world units.
    #[serde(with = "fixed_serde")]
    pub cell_size: Fixed,
    /// Distance from a pursuer to its target's last known position at which
    /// the target is given up.
    #[serde(with = "fixed_serde")]
    pub lose_target_distance: Fixed,
    /// Construction points added to every unfinished structure per tick.
    pub construction_rate: u32,
    /// Resources each new connection starts with.
    pub starting_resources: u32,
    /// Population cap for each connection.
    pub population_cap: u32,
    /// Maximum entries in one production queue.
    pub production_queue_limit: usize,
    /// Side length of a spatial index bucket in world units.
    #[serde(with = "fixed_serde")]
    pub spatial_bucket_size: Fixed,
    /// Whether live units block construction on the cell they stand on.
    pub unit_exclusion: bool,
    /// How many ticks ahead of the simulation a command may be stamped.
    pub command_max_lead: u64,
}

impl SimConfig {
    /// Duration of one tick in milliseconds.
    #[must_use]
    pub const fn tick_duration_ms(&self) -> u32 {
        1000 / self.tick_rate
    }

    /// Parse a config from RON text.
    pub fn from_ron(text: &str) -> Result<Self> {
        let config: Self = ron::from_str(text).map_err(|e| GameError::DataParseError {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a RON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_ron(&text).map_err(|e| match e {
            GameError::DataParseError { message, .. } => GameError::DataParseError {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return Err(GameError::InvalidState(format!(
                "tick_rate must be within 1..=1000, got {}",
                self.tick_rate
            )));
        }
        if self.map_width == 0 || self.map_height == 0 {
            return Err(GameError::InvalidState("map must not be empty".to_string()));
        }
        if self.cell_size <= Fixed::ZERO || self.spatial_bucket_size <= Fixed::ZERO {
            return Err(GameError::InvalidState(
                "cell_size and spatial_bucket_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick_rate: TICK_RATE,
            map_width: 128,
            map_height: 128,
            cell_size: Fixed::from_num(1),
            lose_target_distance: Fixed::from_num(20),
            construction_rate: 1,
            starting_resources: 500,
            population_cap: 20,
            production_queue_limit: 5,
            spatial_bucket_size: Fixed::from_num(8),
            unit_exclusion: true,
            command_max_lead: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_duration() {
        let config = SimConfig::default();
        assert_eq!(config.tick_duration_ms(), 50);
    }

    #[test]
    fn test_partial_ron_uses_defaults() {
        let config = SimConfig::from_ron("(starting_resources: 40, population_cap: 3)").unwrap();
        assert_eq!(config.starting_resources, 40);
        assert_eq!(config.population_cap, 3);
        assert_eq!(config.tick_rate, TICK_RATE);
    }

    #[test]
    fn test_bundled_config_matches_defaults() {
        let config = SimConfig::from_ron(include_str!("../data/config.ron")).unwrap();
        assert_eq!(config, SimConfig::default());
    }

    #[test]
    fn test_rejects_zero_tick_rate() {
        assert!(SimConfig::from_ron("(tick_rate: 0)").is_err());
    }
}
