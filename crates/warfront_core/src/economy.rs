//! Per-connection resource and population ledger.
//!
//! The ledger is the only place resources and population are counted.
//! Construction, production and the combat resolver's destruction pass are
//! its only callers. All math is integer and saturating.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason a debit was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum LedgerError {
    /// Not enough resources in the stockpile.
    #[error("insufficient resources: need {required}, have {available}")]
    InsufficientResources {
        /// Resources requested.
        required: u32,
        /// Resources on hand.
        available: u32,
    },
    /// Population would exceed the cap.
    #[error("population cap reached: {current} + {requested} > {max}")]
    PopulationCap {
        /// Population in use.
        current: u32,
        /// Population requested.
        requested: u32,
        /// Population cap.
        max: u32,
    },
}

/// Resources and population for one connection.
///
/// `resources` is unsigned, and `population <= population_max` holds after
/// every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EconomyLedger {
    /// Resource stockpile.
    pub resources: u32,
    /// Population in use.
    pub population: u32,
    /// Population cap.
    pub population_max: u32,
}

impl EconomyLedger {
    /// Create a ledger with a starting stockpile and cap.
    #[must_use]
    pub const fn new(resources: u32, population_max: u32) -> Self {
        Self {
            resources,
            population: 0,
            population_max,
        }
    }

    /// Check if the ledger can afford a debit without applying it.
    #[must_use]
    pub fn can_afford(&self, resources: u32, population_delta: i32) -> bool {
        self.check_debit(resources, population_delta).is_ok()
    }

    /// Free population slots.
    #[must_use]
    pub const fn population_headroom(&self) -> u32 {
        self.population_max.saturating_sub(self.population)
    }

    /// Debit resources and add population, all or nothing.
    ///
    /// A negative `population_delta` releases population.
    pub fn try_debit(&mut self, resources: u32, population_delta: i32) -> Result<(), LedgerError> {
        self.check_debit(resources, population_delta)?;
        self.resources -= resources;
        self.population = self.apply_population(population_delta);
        Ok(())
    }

    /// Add resources and adjust population.
    ///
    /// A negative `population_delta` releases population; used when a unit
    /// dies. Both counters saturate so a credit can never fail.
    pub fn credit(&mut self, resources: u32, population_delta: i32) {
        self.resources = self.resources.saturating_add(resources);
        self.population = self.apply_population(population_delta);
    }

    fn check_debit(&self, resources: u32, population_delta: i32) -> Result<(), LedgerError> {
        if resources > self.resources {
            return Err(LedgerError::InsufficientResources {
                required: resources,
                available: self.resources,
            });
        }
        if population_delta > 0 {
            let requested = population_delta.unsigned_abs();
            if self.population.saturating_add(requested) > self.population_max {
                return Err(LedgerError::PopulationCap {
                    current: self.population,
                    requested,
                    max: self.population_max,
                });
            }
        }
        Ok(())
    }

    fn apply_population(&self, delta: i32) -> u32 {
        let magnitude = delta.unsigned_abs();
        if delta >= 0 {
            self.population
                .saturating_add(magnitude)
                .min(self.population_max)
        } else {
            self.population.saturating_sub(magnitude)
        }
    }
}
