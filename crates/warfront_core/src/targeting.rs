//! AI target acquisition and pursuit.
//!
//! Each unit with a [`Pursuit`] runs a three-state machine against the
//! tick's [`SpatialIndex`] snapshot:
//!
//! - `Idle -> Pursuing` when an enemy is found within acquisition radius,
//!   or when an attack order names a target.
//! - `Pursuing -> Lost` when the target leaves the index or its last known
//!   position is farther than the lose distance. The target is cleared.
//! - `Lost -> Idle` on the next evaluation.
//!
//! Units are found through the index; structures never move, so attack
//! orders against them resolve through a separate position map.
//!
//! Decisions are computed in parallel from immutable inputs and applied by
//! the caller in id order.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::components::{EntityId, TeamId};
use crate::math::{fixed_serde, Fixed, Vec2Fixed};
use crate::spatial::SpatialIndex;

/// Pursuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PursuitState {
    /// No target.
    #[default]
    Idle,
    /// Chasing a target.
    Pursuing,
    /// Target was dropped this tick.
    Lost,
}

/// Reference to the entity being pursued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiTarget {
    /// Target entity.
    pub entity: EntityId,
    /// Target position as of the last index rebuild.
    pub last_known: Vec2Fixed,
}

/// Targeting state of a unit.
///
/// `target` is `Some` only while `state` is `Pursuing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pursuit {
    /// Current state.
    pub state: PursuitState,
    /// Current target.
    pub target: Option<AiTarget>,
    /// Radius within which targets are picked up automatically.
    #[serde(with = "fixed_serde")]
    pub acquisition_radius: Fixed,
}

impl Pursuit {
    /// Idle pursuit with the given acquisition radius.
    #[must_use]
    pub const fn new(acquisition_radius: Fixed) -> Self {
        Self {
            state: PursuitState::Idle,
            target: None,
            acquisition_radius,
        }
    }

    /// Start pursuing `entity`, last seen at `position`.
    pub fn engage(&mut self, entity: EntityId, position: Vec2Fixed) {
        self.state = PursuitState::Pursuing;
        self.target = Some(AiTarget {
            entity,
            last_known: position,
        });
    }

    /// Drop the target and go idle.
    pub fn disengage(&mut self) {
        self.state = PursuitState::Idle;
        self.target = None;
    }

    /// Entity currently pursued.
    #[must_use]
    pub fn target_entity(&self) -> Option<EntityId> {
        self.target.map(|t| t.entity)
    }
}

/// What to do with a unit's movement target after evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveGoal {
    /// Leave it alone.
    Keep,
    /// Move toward a point.
    Set(Vec2Fixed),
    /// Stop.
    Clear,
}

/// Snapshot of one unit for evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PursuitInput {
    /// Unit id.
    pub id: EntityId,
    /// Unit team.
    pub team: TeamId,
    /// Unit position.
    pub position: Vec2Fixed,
    /// Current pursuit state.
    pub pursuit: Pursuit,
    /// Attack range, if armed.
    pub attack_range: Option<Fixed>,
    /// Holding position.
    pub holding: bool,
    /// Following a player move order.
    pub has_move_order: bool,
}

/// Result of evaluating one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PursuitDecision {
    /// Unit id.
    pub id: EntityId,
    /// New pursuit state.
    pub pursuit: Pursuit,
    /// Movement change.
    pub goal: MoveGoal,
}

/// Evaluate one unit against the index.
///
/// Holding units only consider targets inside their attack range and never
/// get a movement goal.
#[must_use]
pub fn evaluate(
    input: &PursuitInput,
    index: &SpatialIndex,
    structures: &BTreeMap<EntityId, Vec2Fixed>,
    lose_distance: Fixed,
) -> PursuitDecision {
    let mut pursuit = input.pursuit;
    let range = input.attack_range.unwrap_or(Fixed::ZERO);
    let (acquire_radius, lose_radius) = if input.holding {
        (pursuit.acquisition_radius.min(range), range)
    } else {
        (pursuit.acquisition_radius, lose_distance)
    };

    let goal = match pursuit.state {
        PursuitState::Lost => {
            pursuit.disengage();
            MoveGoal::Keep
        }
        PursuitState::Idle => {
            let found = if input.has_move_order || acquire_radius <= Fixed::ZERO {
                None
            } else {
                index
                    .nearest_enemy(input.position, input.team, acquire_radius)
                    .and_then(|id| index.position(id).map(|pos| (id, pos)))
            };
            match found {
                Some((entity, position)) => {
                    tracing::trace!(unit = input.id, target = entity, "target acquired");
                    pursuit.engage(entity, position);
                    chase(input, position, range)
                }
                None => MoveGoal::Keep,
            }
        }
        PursuitState::Pursuing => {
            let refreshed = pursuit
                .target
                .and_then(|t| locate(index, structures, t.entity).map(|pos| (t.entity, pos)))
                .filter(|(_, pos)| {
                    input.position.distance_squared(*pos) <= lose_radius.saturating_mul(lose_radius)
                });
            match refreshed {
                Some((entity, position)) => {
                    pursuit.engage(entity, position);
                    chase(input, position, range)
                }
                None => {
                    tracing::trace!(unit = input.id, "target lost");
                    pursuit.state = PursuitState::Lost;
                    pursuit.target = None;
                    if input.holding {
                        MoveGoal::Keep
                    } else {
                        MoveGoal::Clear
                    }
                }
            }
        }
    };

    PursuitDecision {
        id: input.id,
        pursuit,
        goal,
    }
}

/// Current position of a unit from the index, or of a structure.
fn locate(
    index: &SpatialIndex,
    structures: &BTreeMap<EntityId, Vec2Fixed>,
    id: EntityId,
) -> Option<Vec2Fixed> {
    index.position(id).or_else(|| structures.get(&id).copied())
}

fn chase(input: &PursuitInput, target: Vec2Fixed, range: Fixed) -> MoveGoal {
    if input.holding {
        MoveGoal::Keep
    } else if in_attack_range(input.position, target, range) {
        MoveGoal::Clear
    } else {
        MoveGoal::Set(target)
    }
}

/// Check if `target` is within `range` of `attacker`.
#[must_use]
pub fn in_attack_range(attacker: Vec2Fixed, target: Vec2Fixed, range: Fixed) -> bool {
    range > Fixed::ZERO && attacker.distance_squared(target) <= range.saturating_mul(range)
}

/// Evaluate every unit in parallel.
///
/// Output order matches input order.
#[must_use]
pub fn targeting_system(
    inputs: &[PursuitInput],
    index: &SpatialIndex,
    structures: &BTreeMap<EntityId, Vec2Fixed>,
    lose_distance: Fixed,
) -> Vec<PursuitDecision> {
    inputs
        .par_iter()
        .map(|input| evaluate(input, index, structures, lose_distance))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::SpatialEntry;

    fn pos(x: i32, y: i32) -> Vec2Fixed {
        Vec2Fixed::new(Fixed::from_num(x), Fixed::from_num(y))
    }

    fn input(pursuit: Pursuit) -> PursuitInput {
        PursuitInput {
            id: 1,
            team: TeamId(0),
            position: pos(0, 0),
            pursuit,
            attack_range: Some(Fixed::from_num(2)),
            holding: false,
            has_move_order: false,
        }
    }

    fn index_with(enemies: &[(EntityId, i32, i32)]) -> SpatialIndex {
        let mut index = SpatialIndex::new(Fixed::from_num(8));
        index.rebuild(enemies.iter().map(|&(id, x, y)| SpatialEntry {
            id,
            team: TeamId(1),
            position: pos(x, y),
        }));
        index
    }

    fn lose() -> Fixed {
        Fixed::from_num(20)
    }

    #[test]
    fn test_idle_acquires_nearest_in_radius() {
        let index = index_with(&[(5, 6, 0), (3, 9, 0)]);
        let decision = evaluate(&input(Pursuit::new(Fixed::from_num(8))), &index, &BTreeMap::new(), lose());
        assert_eq!(decision.pursuit.state, PursuitState::Pursuing);
        assert_eq!(decision.pursuit.target_entity(), Some(5));
        assert_eq!(decision.goal, MoveGoal::Set(pos(6, 0)));
    }

    #[test]
    fn test_idle_with_move_order_does_not_acquire() {
        let index = index_with(&[(5, 6, 0)]);
        let mut unit = input(Pursuit::new(Fixed::from_num(8)));
        unit.has_move_order = true;
        let decision = evaluate(&unit, &index, &BTreeMap::new(), lose());
        assert_eq!(decision.pursuit.state, PursuitState::Idle);
        assert_eq!(decision.goal, MoveGoal::Keep);
    }

    #[test]
    fn test_pursuing_refreshes_last_known() {
        let mut pursuit = Pursuit::new(Fixed::from_num(8));
        pursuit.engage(5, pos(6, 0));
        let index = index_with(&[(5, 10, 4)]);
        let decision = evaluate(&input(pursuit), &index, &BTreeMap::new(), lose());
        assert_eq!(decision.pursuit.target.unwrap().last_known, pos(10, 4));
        assert_eq!(decision.goal, MoveGoal::Set(pos(10, 4)));
    }

    #[test]
    fn test_in_range_stops_moving() {
        let mut pursuit = Pursuit::new(Fixed::from_num(8));
        pursuit.engage(5, pos(2, 0));
        let index = index_with(&[(5, 2, 0)]);
        let decision = evaluate(&input(pursuit), &index, &BTreeMap::new(), lose());
        assert_eq!(decision.pursuit.state, PursuitState::Pursuing);
        assert_eq!(decision.goal, MoveGoal::Clear);
    }

    #[test]
    fn test_lost_beyond_lose_distance_then_idle() {
        let mut pursuit = Pursuit::new(Fixed::from_num(8));
        pursuit.engage(5, pos(6, 0));
        let index = index_with(&[(5, 30, 0)]);

        let decision = evaluate(&input(pursuit), &index, &BTreeMap::new(), lose());
        assert_eq!(decision.pursuit.state, PursuitState::Lost);
        assert!(decision.pursuit.target.is_none());
        assert_eq!(decision.goal, MoveGoal::Clear);

        let next = evaluate(&input(decision.pursuit), &index, &BTreeMap::new(), lose());
        assert_eq!(next.pursuit.state, PursuitState::Idle);
    }

    #[test]
    fn test_lost_when_target_gone() {
        let mut pursuit = Pursuit::new(Fixed::from_num(8));
        pursuit.engage(5, pos(6, 0));
        let index = index_with(&[]);
        let decision = evaluate(&input(pursuit), &index, &BTreeMap::new(), lose());
        assert_eq!(decision.pursuit.state, PursuitState::Lost);
    }

    #[test]
    fn test_holding_only_acquires_in_attack_range() {
        let index = index_with(&[(5, 6, 0)]);
        let mut unit = input(Pursuit::new(Fixed::from_num(8)));
        unit.holding = true;
        let decision = evaluate(&unit, &index, &BTreeMap::new(), lose());
        assert_eq!(decision.pursuit.state, PursuitState::Idle);

        let index = index_with(&[(5, 2, 0)]);
        let decision = evaluate(&unit, &index, &BTreeMap::new(), lose());
        assert_eq!(decision.pursuit.state, PursuitState::Pursuing);
        assert_eq!(decision.goal, MoveGoal::Keep);
    }

    #[test]
    fn test_structure_target_located_outside_index() {
        let mut pursuit = Pursuit::new(Fixed::from_num(8));
        pursuit.engage(40, pos(6, 0));
        let structures = BTreeMap::from([(40, pos(6, 0))]);
        let decision = evaluate(&input(pursuit), &index_with(&[]), &structures, lose());
        assert_eq!(decision.pursuit.state, PursuitState::Pursuing);
        assert_eq!(decision.goal, MoveGoal::Set(pos(6, 0)));
    }

    #[test]
    fn test_equidistant_targets_pick_lowest_id() {
        let index = index_with(&[(8, 4, 0), (2, -4, 0), (6, 0, 4)]);
        let decision = evaluate(&input(Pursuit::new(Fixed::from_num(8))), &index, &BTreeMap::new(), lose());
        assert_eq!(decision.pursuit.target_entity(), Some(2));
    }

    #[test]
    fn test_system_preserves_input_order() {
        let index = index_with(&[(50, 3, 0)]);
        let inputs: Vec<_> = (1..=64)
            .map(|id| PursuitInput {
                id,
                ..input(Pursuit::new(Fixed::from_num(8)))
            })
            .collect();
        let decisions = targeting_system(&inputs, &index, &BTreeMap::new(), lose());
        let ids: Vec<_> = decisions.iter().map(|d| d.id).collect();
        assert_eq!(ids, (1..=64).collect::<Vec<_>>());
        assert!(decisions
            .iter()
            .all(|d| d.pursuit.target_entity() == Some(50)));
    }
}
