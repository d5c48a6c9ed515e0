//! Deferred damage resolution.
//!
//! Systems never write health directly. Every hit is appended to the
//! target's [`DamageBuffer`] during the tick, and [`resolve_damage`] applies
//! all buffers at one fixed point late in the tick. The sum is commutative,
//! so the order in which attackers ran does not affect the outcome.

use serde::{Deserialize, Serialize};

use crate::catalog::UnitIndex;
use crate::components::{Entity, EntityId, Health, TeamId};

/// One damage contribution for the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DamageEvent {
    /// Damage amount.
    pub amount: u32,
    /// Team credited with the kill if this hit is fatal.
    pub source: Option<TeamId>,
}

/// Damage received by an entity this tick.
///
/// Cleared by the resolver every tick, so it is empty between ticks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DamageBuffer {
    events: Vec<DamageEvent>,
}

impl DamageBuffer {
    /// Append a damage contribution.
    pub fn push(&mut self, event: DamageEvent) {
        self.events.push(event);
    }

    /// Sum of buffered damage.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.events
            .iter()
            .fold(0u32, |acc, e| acc.saturating_add(e.amount))
    }

    /// Check whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Buffered events in arrival order.
    #[must_use]
    pub fn events(&self) -> &[DamageEvent] {
        &self.events
    }

    /// Drop all buffered events.
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// Outcome of applying one entity's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Health actually removed.
    pub applied: u32,
    /// Health reached zero in this pass.
    pub destroyed: bool,
    /// Source of the first buffered event, credited with the kill.
    pub killed_by: Option<TeamId>,
}

/// Apply a buffer to a health component and clear the buffer.
///
/// Returns `None` when nothing was buffered. An entity already at zero
/// loses nothing further and is not reported as destroyed again.
pub fn resolve(health: &mut Health, buffer: &mut DamageBuffer) -> Option<Resolution> {
    if buffer.is_empty() {
        return None;
    }
    let was_dead = health.is_dead();
    let killed_by = buffer.events().first().and_then(|e| e.source);
    let applied = health.apply_damage(buffer.total());
    buffer.clear();

    Some(Resolution {
        applied,
        destroyed: !was_dead && health.is_dead(),
        killed_by,
    })
}

/// Entity that reached zero health during the resolver pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Casualty {
    /// Destroyed entity.
    pub entity: EntityId,
    /// Its team.
    pub team: TeamId,
    /// Unit catalog entry, for population release. `None` for structures.
    pub unit_kind: Option<UnitIndex>,
    /// Team credited with the kill.
    pub killed_by: Option<TeamId>,
}

/// Resolve every entity's buffer, marking newly destroyed entities.
///
/// Entities must be supplied in a stable order; casualties are returned in
/// that order so ledger updates stay deterministic.
pub fn resolve_damage<'a>(entities: impl Iterator<Item = &'a mut Entity>) -> Vec<Casualty> {
    let mut casualties = Vec::new();

    for entity in entities {
        let Some(resolution) = resolve(&mut entity.health, &mut entity.damage) else {
            continue;
        };
        if resolution.destroyed {
            entity.destroyed = true;
            casualties.push(Casualty {
                entity: entity.id,
                team: entity.team,
                unit_kind: entity.unit_kind,
                killed_by: resolution.killed_by,
            });
        }
    }

    casualties
}
