//! Test fixtures and helpers.
//!
//! Pre-built game states and scripted command streams
//! for consistent testing.

use fixed::types::I32F32;
use warfront_core::catalog::{Catalog, StructureIndex, UnitIndex};
use warfront_core::command::{CommandKind, CommandMessage};
use warfront_core::components::{ConnectionId, EntityId, GridCoord, TeamId};
use warfront_core::config::SimConfig;
use warfront_core::events::{EventSink, SimEvent};
use warfront_core::math::{Vec2Fixed, Vec3Fixed};
use warfront_core::simulation::Simulation;

/// Standard catalog entries.
pub mod standard {
    use super::{StructureIndex, UnitIndex};

    /// Worker, the only builder.
    pub const WORKER: UnitIndex = UnitIndex(0);
    /// Short-range infantry.
    pub const SOLDIER: UnitIndex = UnitIndex(1);
    /// Long-range infantry.
    pub const SNIPER: UnitIndex = UnitIndex(2);
    /// 3x3 headquarters, produces workers.
    pub const HEADQUARTERS: StructureIndex = StructureIndex(0);
    /// 2x2 barracks, produces soldiers and snipers.
    pub const BARRACKS: StructureIndex = StructureIndex(1);
    /// 1x1 wall.
    pub const WALL: StructureIndex = StructureIndex(2);
}

/// Create a fixed-point number from an integer.
#[must_use]
pub fn fixed(n: i32) -> I32F32 {
    I32F32::from_num(n)
}

/// Create a fixed-point number from a float (for tests only).
///
/// Note: In real simulation code, never use floats.
/// This is only for convenient test setup.
#[must_use]
pub fn fixed_f(n: f64) -> I32F32 {
    I32F32::from_num(n)
}

/// Ground position from integers.
#[must_use]
pub fn pos(x: i32, y: i32) -> Vec2Fixed {
    Vec2Fixed::new(fixed(x), fixed(y))
}

/// Cursor point on the ground plane.
#[must_use]
pub fn ground(x: i32, y: i32) -> Vec3Fixed {
    Vec3Fixed::new(fixed(x), I32F32::ZERO, fixed(y))
}

/// Empty world with the standard catalog and default config.
///
/// # Panics
///
/// Panics if the bundled catalog fails to parse.
#[must_use]
pub fn empty_world() -> Simulation {
    Simulation::new(
        SimConfig::default(),
        Catalog::standard().expect("bundled catalog parses"),
    )
}

/// Handles into a [`skirmish`] world.
#[derive(Debug, Clone)]
pub struct Skirmish {
    /// The world.
    pub sim: Simulation,
    /// Connection per team, indexed by team id.
    pub connections: [ConnectionId; 2],
    /// Completed headquarters per team.
    pub headquarters: [EntityId; 2],
    /// Soldiers per team.
    pub soldiers: [Vec<EntityId>; 2],
    /// One worker per team.
    pub workers: [EntityId; 2],
}

/// Two teams facing each other across the map.
///
/// Team 0 sits around x = 16, team 1 around x = 112, both at y = 64. Each
/// has a completed headquarters, a worker and `soldiers_per_team` soldiers
/// in a column in front of the headquarters. The armies start well outside
/// each other's acquisition radius.
///
/// # Panics
///
/// Panics if the population cap cannot fit the requested soldiers.
#[must_use]
pub fn skirmish(soldiers_per_team: usize) -> Skirmish {
    let mut sim = empty_world();
    let mut connections = [0; 2];
    let mut headquarters = [0; 2];
    let mut workers = [0; 2];
    let mut soldiers = [Vec::new(), Vec::new()];

    for (side, base_x) in [(0usize, 16), (1usize, 112)] {
        let team = TeamId(side as u8);
        connections[side] = sim.add_connection(team).expect("free team");
        sim.set_view_extent(connections[side], pos(base_x, 64), pos(32, 32))
            .expect("registered");
        headquarters[side] = sim
            .spawn_structure(
                team,
                standard::HEADQUARTERS,
                GridCoord::new(base_x - 1, 62),
                true,
            )
            .expect("headquarters fits");
        workers[side] = sim
            .spawn_unit(team, standard::WORKER, pos(base_x, 58))
            .expect("worker fits");
        let facing = if side == 0 { 6 } else { -6 };
        for row in 0..soldiers_per_team {
            let y = 56 + (row as i32 % 16);
            let x = base_x + facing + 2 * (row as i32 / 16) * facing.signum();
            soldiers[side].push(
                sim.spawn_unit(team, standard::SOLDIER, pos(x, y))
                    .expect("population cap fits soldiers"),
            );
        }
    }

    Skirmish {
        sim,
        connections,
        headquarters,
        soldiers,
        workers,
    }
}

/// A world plus commands to feed at their stamped ticks.
#[derive(Debug, Clone)]
pub struct ScriptedGame {
    /// The world.
    pub sim: Simulation,
    script: Vec<CommandMessage>,
    cursor: usize,
}

impl ScriptedGame {
    /// Wrap a world and a script. The script is ordered by tick.
    #[must_use]
    pub fn new(sim: Simulation, mut script: Vec<CommandMessage>) -> Self {
        script.sort_by_key(|c| c.tick);
        Self {
            sim,
            script,
            cursor: 0,
        }
    }

    /// Submit every scripted command due this tick, then tick once.
    pub fn step(&mut self, sink: &mut impl EventSink) {
        let tick = self.sim.get_tick();
        while let Some(command) = self.script.get(self.cursor) {
            if command.tick > tick {
                break;
            }
            if let Err(reason) = self.sim.submit_command(command.clone()) {
                tracing::debug!(tick, %reason, "scripted command rejected");
            }
            self.cursor += 1;
        }
        self.sim.tick(sink);
    }

    /// Step `ticks` times, collecting events.
    pub fn run(&mut self, ticks: u64) -> Vec<SimEvent> {
        let mut events = Vec::new();
        for _ in 0..ticks {
            self.step(&mut events);
        }
        events
    }
}

/// Select `unit` at `tick` and send it to `point` on the next tick.
#[must_use]
pub fn move_script(
    connection: ConnectionId,
    unit: EntityId,
    tick: u64,
    point: Vec3Fixed,
) -> Vec<CommandMessage> {
    vec![
        CommandMessage::new(connection, tick, CommandKind::PrimaryClick).targeting(unit),
        CommandMessage::new(connection, tick + 1, CommandKind::SecondaryClick).at(point),
    ]
}
