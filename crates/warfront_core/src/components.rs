//! Component definitions.
//!
//! Components are pure data with no behavior beyond small invariant-keeping
//! helpers. Entities in [`crate::simulation`] are composed of these.

use serde::{Deserialize, Serialize};

use crate::catalog::{StructureIndex, UnitIndex};
use crate::combat::DamageBuffer;
use crate::construction::PendingBuildRequest;
use crate::economy::EconomyLedger;
use crate::math::{fixed_serde, Fixed, Rect, Vec2Fixed};
use crate::production::ProductionQueue;
use crate::targeting::Pursuit;

/// Unique identifier for entities.
pub type EntityId = u64;

/// Identifier assigned to a connected player.
pub type ConnectionId = u32;

/// Team membership. Entities on different teams are enemies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TeamId(pub u8);

/// Position component in world space (ground plane).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// World position.
    pub value: Vec2Fixed,
}

impl Position {
    /// Create a new position at the given coordinates.
    #[must_use]
    pub const fn new(value: Vec2Fixed) -> Self {
        Self { value }
    }
}

/// Linear velocity, in world units per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Velocity {
    /// Velocity vector (units per tick).
    pub value: Vec2Fixed,
}

impl Velocity {
    /// Zero velocity (stationary).
    pub const ZERO: Self = Self {
        value: Vec2Fixed::ZERO,
    };
}

/// Health component for damageable entities.
///
/// `current` never exceeds `max`; both helpers saturate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Health {
    /// Current health points.
    pub current: u32,
    /// Maximum health points.
    pub max: u32,
}

impl Health {
    /// Create new health component at full health.
    #[must_use]
    pub const fn new(max: u32) -> Self {
        Self { current: max, max }
    }

    /// Check if entity is dead (health == 0).
    #[must_use]
    pub const fn is_dead(&self) -> bool {
        self.current == 0
    }

    /// Apply damage, returning actual damage dealt.
    pub fn apply_damage(&mut self, amount: u32) -> u32 {
        let actual = amount.min(self.current);
        self.current -= actual;
        actual
    }
}

/// Movement component for mobile units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    /// Movement speed in units per tick.
    #[serde(with = "fixed_serde")]
    pub speed: Fixed,
    /// Current movement target (if any).
    pub target: Option<Vec2Fixed>,
}

/// Weapon stats for units that can deal damage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombatStats {
    /// Damage per hit.
    pub damage: u32,
    /// Attack range in world units.
    #[serde(with = "fixed_serde")]
    pub range: Fixed,
    /// Ticks between hits.
    pub attack_cooldown: u32,
    /// Ticks until the next hit is allowed.
    pub cooldown_remaining: u32,
}

impl CombatStats {
    /// Create combat stats ready to fire.
    #[must_use]
    pub const fn new(damage: u32, range: Fixed, attack_cooldown: u32) -> Self {
        Self {
            damage,
            range,
            attack_cooldown,
            cooldown_remaining: 0,
        }
    }

    /// Check if ready to attack.
    #[must_use]
    pub const fn can_attack(&self) -> bool {
        self.cooldown_remaining == 0
    }

    /// Tick down the cooldown by one.
    pub fn tick_cooldown(&mut self) {
        self.cooldown_remaining = self.cooldown_remaining.saturating_sub(1);
    }

    /// Reset cooldown after attacking.
    pub fn reset_cooldown(&mut self) {
        self.cooldown_remaining = self.attack_cooldown;
    }
}

/// Integer cell coordinate on the construction grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GridCoord {
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
}

impl GridCoord {
    /// Create a new grid coordinate.
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Size of a structure in grid cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Footprint {
    /// Width in cells.
    pub width: u32,
    /// Height in cells.
    pub height: u32,
}

impl Footprint {
    /// Create a new footprint.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Every cell covered when the footprint's origin is at `origin`.
    pub fn cells(self, origin: GridCoord) -> impl Iterator<Item = GridCoord> {
        (0..self.height as i32).flat_map(move |dy| {
            (0..self.width as i32).map(move |dx| GridCoord::new(origin.x.saturating_add(dx), origin.y.saturating_add(dy)))
        })
    }
}

impl Default for Footprint {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

/// A placed structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    /// Catalog entry this structure was built from.
    pub kind: StructureIndex,
    /// Lower-left cell of the footprint.
    pub origin: GridCoord,
    /// Cells covered.
    pub footprint: Footprint,
    /// Build progress points accumulated so far.
    pub build_progress: u32,
    /// Points needed to finish construction.
    pub build_total: u32,
    /// Radius used for builder range checks around this structure.
    #[serde(with = "fixed_serde")]
    pub range_radius: Fixed,
    /// Where produced units spawn.
    pub rally_point: Option<Vec2Fixed>,
}

impl Structure {
    /// Check if construction is complete.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.build_progress >= self.build_total
    }

    /// Advance construction by `rate` points.
    ///
    /// Returns `true` if construction just completed.
    pub fn tick_construction(&mut self, rate: u32) -> bool {
        if self.is_complete() {
            return false;
        }
        self.build_progress = self.build_progress.saturating_add(rate).min(self.build_total);
        self.is_complete()
    }

    /// Construction progress as a percentage (0-100).
    #[must_use]
    pub fn construction_percentage(&self) -> u32 {
        if self.build_total == 0 {
            100
        } else {
            (self.build_progress * 100) / self.build_total
        }
    }
}

/// Visible ground rectangle of a connection, as half extents around a center.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewExtent {
    /// Ground point the camera looks at.
    pub center: Vec2Fixed,
    /// Half-width (x) and half-depth (y) of the visible rectangle.
    pub half_extent: Vec2Fixed,
}

impl ViewExtent {
    /// Rectangle used for relevancy tests.
    #[must_use]
    pub fn rect(&self) -> Rect {
        Rect::centered(self.center, self.half_extent)
    }
}

/// A connected player and everything the simulation tracks for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Team this connection controls.
    pub team: TeamId,
    /// Current relevancy rectangle.
    pub view: ViewExtent,
    /// Resources and population.
    pub ledger: EconomyLedger,
    /// Build waiting for the builder to get in range.
    pub pending_build: Option<PendingBuildRequest>,
    /// Enemy entities destroyed by this connection's team.
    pub kills: u32,
    /// Own entities lost.
    pub losses: u32,
}

/// A simulated entity.
///
/// Entities are composed of optional components. Units carry `unit_kind`,
/// `movement` and `pursuit`; structures carry `structure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique identifier for this entity.
    pub id: EntityId,
    /// Owning team.
    pub team: TeamId,
    /// World position.
    pub position: Position,
    /// Velocity applied during the last movement step.
    pub velocity: Velocity,
    /// Health.
    pub health: Health,
    /// Catalog entry for units.
    pub unit_kind: Option<UnitIndex>,
    /// Movement capabilities.
    pub movement: Option<Movement>,
    /// AI target and pursuit state.
    pub pursuit: Option<Pursuit>,
    /// Weapon stats.
    pub combat: Option<CombatStats>,
    /// Structure data for buildings.
    pub structure: Option<Structure>,
    /// Production queue for completed producer structures.
    pub production_queue: Option<ProductionQueue>,
    /// Damage received this tick, applied by the combat resolver.
    pub damage: DamageBuffer,
    /// Selected by the owning connection.
    pub selected: bool,
    /// Holding position: attacks in range but never moves to pursue.
    pub holding: bool,
    /// Health reached zero; removed at the end of the resolver pass.
    pub destroyed: bool,
}

impl Entity {
    /// Create an entity with only the always-present components.
    #[must_use]
    pub fn new(id: EntityId, team: TeamId, position: Vec2Fixed, health: u32) -> Self {
        Self {
            id,
            team,
            position: Position::new(position),
            velocity: Velocity::ZERO,
            health: Health::new(health),
            unit_kind: None,
            movement: None,
            pursuit: None,
            combat: None,
            structure: None,
            production_queue: None,
            damage: DamageBuffer::default(),
            selected: false,
            holding: false,
            destroyed: false,
        }
    }

    /// Check whether this entity is a unit.
    #[must_use]
    pub const fn is_unit(&self) -> bool {
        self.unit_kind.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_damage_saturates() {
        let mut health = Health::new(100);
        assert_eq!(health.apply_damage(30), 30);
        assert_eq!(health.apply_damage(90), 70);
        assert_eq!(health.current, 0);
        assert!(health.is_dead());
        assert_eq!(health.apply_damage(10), 0);
    }

    #[test]
    fn test_footprint_cells() {
        let cells: Vec<_> = Footprint::new(2, 2).cells(GridCoord::new(4, 4)).collect();
        assert_eq!(
            cells,
            vec![
                GridCoord::new(4, 4),
                GridCoord::new(5, 4),
                GridCoord::new(4, 5),
                GridCoord::new(5, 5),
            ]
        );
    }

    #[test]
    fn test_structure_construction_progress() {
        let mut structure = Structure {
            kind: StructureIndex(0),
            origin: GridCoord::new(0, 0),
            footprint: Footprint::new(1, 1),
            build_progress: 0,
            build_total: 10,
            range_radius: Fixed::from_num(2),
            rally_point: None,
        };

        assert!(!structure.tick_construction(4));
        assert_eq!(structure.construction_percentage(), 40);
        assert!(!structure.tick_construction(4));
        assert!(structure.tick_construction(4));
        assert_eq!(structure.build_progress, 10);
        assert!(!structure.tick_construction(4));
    }

    #[test]
    fn test_combat_cooldown() {
        let mut stats = CombatStats::new(10, Fixed::from_num(3), 2);
        assert!(stats.can_attack());
        stats.reset_cooldown();
        assert!(!stats.can_attack());
        stats.tick_cooldown();
        stats.tick_cooldown();
        assert!(stats.can_attack());
    }
}
