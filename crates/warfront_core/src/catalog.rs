//! Unit and structure catalog.
//!
//! The catalog is built once at world init and owned by the simulation.
//! Entries are addressed by their position in an ordered list, so an index
//! means the same thing on the server and on every client regardless of
//! how either side numbers its entities.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::components::Footprint;
use crate::error::{GameError, Result};
use crate::math::{fixed_serde, Fixed};

/// Stable handle of a unit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitIndex(pub u32);

/// Stable handle of a structure entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StructureIndex(pub u32);

/// Unit type definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDef {
    /// Display name.
    pub name: String,
    /// Resource cost, debited when queued.
    pub cost: u32,
    /// Population used while alive.
    pub population: u32,
    /// Production time in milliseconds.
    pub build_time_ms: u32,
    /// Maximum health.
    pub health: u32,
    /// Movement speed in world units per tick.
    #[serde(with = "fixed_serde")]
    pub speed: Fixed,
    /// Damage per hit (0 for unarmed units).
    pub damage: u32,
    /// Attack range in world units.
    #[serde(with = "fixed_serde")]
    pub attack_range: Fixed,
    /// Ticks between hits.
    pub attack_cooldown: u32,
    /// Radius within which the unit picks targets on its own.
    #[serde(with = "fixed_serde")]
    pub acquisition_radius: Fixed,
    /// Whether the unit can place structures.
    #[serde(default)]
    pub can_build: bool,
}

impl UnitDef {
    /// Check if the unit has a weapon.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.damage > 0
    }
}

/// Structure type definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureDef {
    /// Display name.
    pub name: String,
    /// Cells covered.
    pub footprint: Footprint,
    /// Resource cost, debited on placement.
    pub cost: u32,
    /// Construction points needed to finish.
    pub build_points: u32,
    /// Maximum health.
    pub health: u32,
    /// How close a builder must get to the footprint to start building.
    #[serde(with = "fixed_serde")]
    pub required_range: Fixed,
    /// Units this structure can produce once complete.
    #[serde(default)]
    pub produces: Vec<UnitIndex>,
}

impl StructureDef {
    /// Check if this structure can produce a given unit.
    #[must_use]
    pub fn can_produce(&self, unit: UnitIndex) -> bool {
        self.produces.contains(&unit)
    }
}

/// Ordered unit and structure definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    units: Vec<UnitDef>,
    structures: Vec<StructureDef>,
}

/// Catalog shipped with the crate.
const STANDARD_CATALOG: &str = include_str!("../data/catalog.ron");

impl Catalog {
    /// The bundled default catalog.
    pub fn standard() -> Result<Self> {
        Self::from_ron(STANDARD_CATALOG)
    }

    /// Build a catalog, checking that every `produces` entry names a unit.
    pub fn new(units: Vec<UnitDef>, structures: Vec<StructureDef>) -> Result<Self> {
        let catalog = Self { units, structures };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Parse a catalog from RON text.
    pub fn from_ron(text: &str) -> Result<Self> {
        let catalog: Self = ron::from_str(text).map_err(|e| GameError::DataParseError {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load a catalog from a RON file.
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
        for structure in &self.structures {
            if structure.footprint.width == 0 || structure.footprint.height == 0 {
                return Err(GameError::DataParseError {
                    path: structure.name.clone(),
                    message: "footprint must be at least 1x1".to_string(),
                });
            }
            if let Some(missing) = structure
                .produces
                .iter()
                .find(|unit| self.unit(**unit).is_none())
            {
                return Err(GameError::UnknownCatalogIndex(missing.0));
            }
        }
        Ok(())
    }

    /// Look up a unit definition.
    #[must_use]
    pub fn unit(&self, index: UnitIndex) -> Option<&UnitDef> {
        self.units.get(index.0 as usize)
    }

    /// Look up a structure definition.
    #[must_use]
    pub fn structure(&self, index: StructureIndex) -> Option<&StructureDef> {
        self.structures.get(index.0 as usize)
    }

    /// Find a unit by name.
    #[must_use]
    pub fn unit_index(&self, name: &str) -> Option<UnitIndex> {
        self.units
            .iter()
            .position(|u| u.name == name)
            .map(|i| UnitIndex(i as u32))
    }

    /// Find a structure by name.
    #[must_use]
    pub fn structure_index(&self, name: &str) -> Option<StructureIndex> {
        self.structures
            .iter()
            .position(|s| s.name == name)
            .map(|i| StructureIndex(i as u32))
    }

    /// Number of unit entries.
    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Number of structure entries.
    #[must_use]
    pub fn structure_count(&self) -> usize {
        self.structures.len()
    }
}
