//! Determinism testing utilities.
//!
//! Provides a harness for verifying that the simulation
//! produces identical results given identical inputs.
//!
//! # Testing Strategy
//!
//! The server is authoritative, but replays and desync checks still need
//! the tick to be a pure function of state plus commands. Sources of
//! non-determinism include:
//!
//! - **Floating-point math**: We use fixed-point arithmetic via
//!   [`warfront_core::math::Fixed`] throughout.
//!
//! - **HashMap iteration order**: Rust's default hasher is randomized.
//!   We always iterate in sorted entity ID order.
//!
//! - **Parallel intent systems**: Rayon computes intents in any order,
//!   so results must be collected and applied in entity ID order.
//!
//! # Test Levels
//!
//! 1. **Unit tests**: Individual system determinism (targeting, combat, etc.)
//! 2. **Property tests**: Random command streams must still replay identically
//! 3. **Integration tests**: Full skirmishes are reproducible
//! 4. **Parallel tests**: Running N simulations on N threads all match

use std::thread;

use warfront_core::events::NullSink;
use warfront_core::simulation::Simulation;

use crate::fixtures::ScriptedGame;

/// Result of a determinism test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterminismResult {
    /// Whether all runs produced identical results.
    pub is_deterministic: bool,
    /// Hashes from each run.
    pub hashes: Vec<u64>,
    /// Number of ticks simulated.
    pub ticks: u64,
}

impl DeterminismResult {
    /// Get all unique hashes (should be 1 for deterministic simulation).
    #[must_use]
    pub fn unique_hashes(&self) -> Vec<u64> {
        let mut unique: Vec<u64> = self.hashes.clone();
        unique.sort_unstable();
        unique.dedup();
        unique
    }

    /// Assert that the simulation was deterministic, with a detailed error message.
    ///
    /// # Panics
    ///
    /// Panics if the simulation produced different hashes across runs.
    pub fn assert_deterministic(&self) {
        if !self.is_deterministic {
            let unique = self.unique_hashes();
            panic!(
                "Simulation is non-deterministic!\n\
                 Runs: {}\n\
                 Ticks: {}\n\
                 Unique hashes: {} (expected 1)\n\
                 All hashes: {:?}",
                self.hashes.len(),
                self.ticks,
                unique.len(),
                self.hashes
            );
        }
    }
}

/// Run a simulation multiple times and verify determinism.
///
/// # Arguments
///
/// * `runs` - Number of times to run the simulation
/// * `ticks` - Number of ticks to simulate per run
/// * `setup` - Function to create initial simulation state
/// * `step` - Function to advance simulation by one tick
/// * `hash` - Function to compute state hash
///
/// # Example
///
/// ```ignore
/// use warfront_test_utils::determinism::verify_determinism;
/// use warfront_test_utils::fixtures::skirmish;
/// use warfront_core::events::NullSink;
///
/// let result = verify_determinism(
///     5,   // Run 5 times
///     100, // 100 ticks each
///     || skirmish(6).sim,
///     |sim| sim.tick(&mut NullSink),
///     |sim| sim.state_hash(),
/// );
/// result.assert_deterministic();
/// ```
pub fn verify_determinism<S, Setup, Step, HashFn>(
    runs: usize,
    ticks: u64,
    setup: Setup,
    step: Step,
    hash: HashFn,
) -> DeterminismResult
where
    Setup: Fn() -> S,
    Step: Fn(&mut S),
    HashFn: Fn(&S) -> u64,
{
    let mut hashes = Vec::with_capacity(runs);

    for _ in 0..runs {
        let mut state = setup();

        for _ in 0..ticks {
            step(&mut state);
        }

        hashes.push(hash(&state));
    }

    let is_deterministic = hashes.windows(2).all(|w| w[0] == w[1]);

    DeterminismResult {
        is_deterministic,
        hashes,
        ticks,
    }
}

/// Run a world twice without commands and compare final hashes.
pub fn verify_simulation_determinism<F>(setup_fn: F, num_ticks: u64) -> bool
where
    F: Fn() -> Simulation,
{
    verify_determinism(
        2,
        num_ticks,
        &setup_fn,
        |sim| sim.tick(&mut NullSink),
        |sim| sim.state_hash(),
    )
    .is_deterministic
}

/// Run a scripted game twice and compare final hashes.
pub fn verify_scripted_determinism<F>(setup_fn: F, num_ticks: u64) -> DeterminismResult
where
    F: Fn() -> ScriptedGame,
{
    verify_determinism(
        2,
        num_ticks,
        &setup_fn,
        |game| game.step(&mut NullSink),
        |game| game.sim.state_hash(),
    )
}

/// Result of parallel simulation runs.
#[derive(Debug, Clone)]
pub struct ParallelSimResult {
    /// Final state hash from each simulation.
    pub hashes: Vec<u64>,
    /// Number of ticks each simulation ran.
    pub ticks: u64,
    /// Number of simulations run.
    pub num_sims: usize,
}

impl ParallelSimResult {
    /// Check if all simulations produced identical results.
    #[must_use]
    pub fn is_deterministic(&self) -> bool {
        self.hashes.windows(2).all(|w| w[0] == w[1])
    }

    /// Assert all simulations matched.
    ///
    /// # Panics
    ///
    /// Panics if simulations produced different hashes.
    pub fn assert_deterministic(&self) {
        if !self.is_deterministic() {
            let mut unique: Vec<u64> = self.hashes.clone();
            unique.sort_unstable();
            unique.dedup();
            panic!(
                "Parallel simulations diverged!\n\
                 Simulations: {}\n\
                 Ticks: {}\n\
                 Unique hashes: {}\n\
                 All hashes: {:?}",
                self.num_sims,
                self.ticks,
                unique.len(),
                self.hashes
            );
        }
    }
}

/// Run N scripted games on scoped threads and collect final hashes.
///
/// Each game also runs its targeting pass on the shared rayon pool, so
/// this exercises thread scheduling on both levels.
///
/// # Panics
///
/// Panics if a simulation thread panics.
pub fn run_parallel_simulations<F>(setup_fn: F, num_sims: usize, num_ticks: u64) -> ParallelSimResult
where
    F: Fn() -> ScriptedGame + Sync,
{
    let hashes = thread::scope(|s| {
        let handles: Vec<_> = (0..num_sims)
            .map(|_| {
                s.spawn(|| {
                    let mut game = setup_fn();
                    for _ in 0..num_ticks {
                        game.step(&mut NullSink);
                    }
                    game.sim.state_hash()
                })
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    ParallelSimResult {
        hashes,
        ticks: num_ticks,
        num_sims,
    }
}

/// Compare two runs tick-by-tick, finding first divergence.
///
/// # Returns
///
/// `None` if the runs agree throughout, `Some(tick)` for the first tick
/// after which their hashes differ (0 means the setups already differ).
pub fn find_first_divergence<F>(setup_fn: F, num_ticks: u64) -> Option<u64>
where
    F: Fn() -> ScriptedGame,
{
    let mut first = setup_fn();
    let mut second = setup_fn();

    if first.sim.state_hash() != second.sim.state_hash() {
        return Some(0);
    }

    for tick in 1..=num_ticks {
        first.step(&mut NullSink);
        second.step(&mut NullSink);

        if first.sim.state_hash() != second.sim.state_hash() {
            return Some(tick);
        }
    }

    None
}

/// Verify that a save/load round-trip mid-game changes nothing.
///
/// Runs `split_at` ticks, round-trips the world through bincode, then runs
/// both the original and the restored copy for `num_ticks - split_at` more
/// ticks without commands.
pub fn verify_serialization_determinism<F>(setup_fn: F, split_at: u64, num_ticks: u64) -> bool
where
    F: Fn() -> Simulation,
{
    let mut sim = setup_fn();
    for _ in 0..split_at {
        sim.tick(&mut NullSink);
    }

    let Ok(bytes) = sim.serialize() else {
        return false;
    };
    let Ok(mut restored) = Simulation::deserialize(&bytes) else {
        return false;
    };
    if restored.state_hash() != sim.state_hash() {
        return false;
    }

    for _ in split_at..num_ticks {
        sim.tick(&mut NullSink);
        restored.tick(&mut NullSink);
    }

    sim.state_hash() == restored.state_hash()
}

/// Proptest strategies for commands and world parameters.
///
/// These strategies generate random but reproducible inputs for
/// property-based testing of the simulation.
pub mod strategies {
    use proptest::prelude::*;
    use warfront_core::catalog::{StructureIndex, UnitIndex};
    use warfront_core::command::{CommandKind, CommandMessage};
    use warfront_core::components::{ConnectionId, EntityId, GridCoord};
    use warfront_core::construction::BuildRequest;
    use warfront_core::math::{Fixed, Vec2Fixed, Vec3Fixed};

    /// Generate a coordinate inside the default 128x128 map.
    pub fn arb_fixed_position() -> impl Strategy<Value = Fixed> {
        (0i32..128i32).prop_map(Fixed::from_num)
    }

    /// Generate a ground position inside the default map.
    pub fn arb_vec2_position() -> impl Strategy<Value = Vec2Fixed> {
        (arb_fixed_position(), arb_fixed_position()).prop_map(|(x, y)| Vec2Fixed::new(x, y))
    }

    /// Generate any coordinate a client could send: mostly on the map,
    /// sometimes far off it, occasionally at the limits of `Fixed`.
    pub fn arb_client_coordinate() -> impl Strategy<Value = Fixed> {
        prop_oneof![
            6 => arb_fixed_position(),
            2 => (-100_000i32..100_000i32).prop_map(Fixed::from_num),
            1 => any::<i64>().prop_map(Fixed::from_bits),
            1 => prop_oneof![Just(Fixed::MIN), Just(Fixed::MAX)],
        ]
    }

    /// Generate a client-supplied ground vector, on or off the map.
    pub fn arb_client_vec2() -> impl Strategy<Value = Vec2Fixed> {
        (arb_client_coordinate(), arb_client_coordinate()).prop_map(|(x, y)| Vec2Fixed::new(x, y))
    }

    /// Generate a cursor point on the ground plane, on or off the map.
    pub fn arb_ground_point() -> impl Strategy<Value = Vec3Fixed> {
        arb_client_vec2().prop_map(|p| Vec3Fixed::new(p.x, Fixed::ZERO, p.y))
    }

    /// Generate any command kind.
    pub fn arb_command_kind() -> impl Strategy<Value = CommandKind> {
        prop_oneof![
            Just(CommandKind::None),
            Just(CommandKind::PrimaryClick),
            Just(CommandKind::SecondaryClick),
            Just(CommandKind::Attack),
            Just(CommandKind::Stop),
            Just(CommandKind::Hold),
            Just(CommandKind::Build),
            Just(CommandKind::Produce),
        ]
    }

    fn arb_grid_axis() -> impl Strategy<Value = i32> {
        prop_oneof![
            8 => -4i32..132,
            1 => any::<i32>(),
            1 => prop_oneof![Just(i32::MIN), Just(i32::MAX)],
        ]
    }

    /// Generate a placement, including out-of-bounds and extreme origins.
    pub fn arb_build_request() -> impl Strategy<Value = BuildRequest> {
        (0u32..4, arb_grid_axis(), arb_grid_axis()).prop_map(|(structure, x, y)| BuildRequest {
            structure: StructureIndex(structure),
            grid_position: GridCoord::new(x, y),
        })
    }

    /// Generate a command from one of `connections`, stamped within
    /// `0..max_tick`, that may point at any entity id up to `max_entity`.
    ///
    /// Payloads are attached for the kinds that need them most of the
    /// time, so missing-payload rejections still occur.
    pub fn arb_command(
        connections: Vec<ConnectionId>,
        max_tick: u64,
        max_entity: EntityId,
    ) -> impl Strategy<Value = CommandMessage> {
        (
            proptest::sample::select(connections),
            0..max_tick.max(1),
            arb_command_kind(),
            arb_ground_point(),
            proptest::option::of(1..=max_entity.max(1)),
            proptest::option::weighted(0.8, arb_build_request()),
            proptest::option::weighted(0.8, (0u32..4).prop_map(UnitIndex)),
        )
            .prop_map(|(connection, tick, kind, point, target, build, produce)| {
                let mut command = CommandMessage::new(connection, tick, kind).at(point);
                command.target_entity = target;
                if kind == CommandKind::Build {
                    command.build = build;
                }
                if kind == CommandKind::Produce {
                    command.produce = produce;
                }
                command
            })
    }

    /// Generate a command script.
    pub fn arb_command_script(
        connections: Vec<ConnectionId>,
        max_tick: u64,
        max_entity: EntityId,
        max_len: usize,
    ) -> impl Strategy<Value = Vec<CommandMessage>> {
        proptest::collection::vec(arb_command(connections, max_tick, max_entity), 0..max_len)
    }

    /// Generate damage values (1-100).
    pub fn arb_damage() -> impl Strategy<Value = u32> {
        1u32..100u32
    }
}
