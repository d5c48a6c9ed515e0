//! Replays and repeated runs must agree bit for bit.

use warfront_core::command::CommandMessage;
use warfront_core::events::{NullSink, SimEvent};
use warfront_core::replay::{Replay, ReplayPlayer};
use warfront_core::simulation::Simulation;
use warfront_test_utils::determinism::{
    find_first_divergence, run_parallel_simulations, verify_scripted_determinism,
};
use warfront_test_utils::fixtures::{ground, move_script, skirmish, ScriptedGame};

/// Every soldier of both armies marches to the middle of the map.
fn battle_parts() -> (Simulation, Vec<CommandMessage>) {
    let skirmish = skirmish(8);
    let mut script = Vec::new();
    for side in 0..2 {
        for (i, &soldier) in skirmish.soldiers[side].iter().enumerate() {
            let tick = 2 * i as u64;
            script.extend(move_script(
                skirmish.connections[side],
                soldier,
                tick,
                ground(64, 60),
            ));
        }
    }
    script.sort_by_key(|c: &CommandMessage| c.tick);
    (skirmish.sim, script)
}

fn battle() -> ScriptedGame {
    let (sim, script) = battle_parts();
    ScriptedGame::new(sim, script)
}

#[test]
fn test_battle_runs_are_identical() {
    verify_scripted_determinism(battle, 600).assert_deterministic();
}

#[test]
fn test_battle_never_diverges() {
    assert_eq!(find_first_divergence(battle, 400), None);
}

#[test]
fn test_battle_on_many_threads() {
    run_parallel_simulations(battle, 4, 400).assert_deterministic();
}

#[test]
fn test_battle_produces_casualties() {
    let mut game = battle();
    let events = game.run(600);
    assert!(events
        .iter()
        .any(|e| matches!(e, SimEvent::EntityDestroyed { .. })));
}

#[test]
fn test_recorded_battle_replays_to_same_hash() {
    let (mut sim, script) = battle_parts();
    let mut replay = Replay::new("battle", &sim).unwrap();

    let mut pending = script.into_iter().peekable();
    for _ in 0..400 {
        let tick = sim.get_tick();
        while let Some(command) = pending.next_if(|c| c.tick <= tick) {
            if sim.submit_command(command.clone()).is_ok() {
                replay.record_command(tick, command);
            }
        }
        sim.tick(&mut NullSink);
    }
    replay.finalize(&sim);
    assert_eq!(replay.command_count(), 32);

    let mut player = ReplayPlayer::new(replay).unwrap();
    player.verify().unwrap();
    assert_eq!(player.simulation().state_hash(), sim.state_hash());
}
