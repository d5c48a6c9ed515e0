//! Replay system for recording and playing back games.
//!
//! Replays store the initial simulation state and a log of everything that
//! reached the simulation between ticks: accepted commands and players
//! joining or leaving. Because the simulation is deterministic, feeding the
//! same log into the same initial state reproduces the game exactly, which
//! the final hash confirms.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::command::CommandMessage;
use crate::components::{ConnectionId, TeamId};
use crate::error::{GameError, Result};
use crate::events::NullSink;
use crate::simulation::Simulation;

/// Replay file format version for compatibility.
pub const REPLAY_VERSION: u32 = 3;

/// An input the simulation received between two ticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayAction {
    /// A command the channel accepted.
    Command(CommandMessage),
    /// A player took control of `team` and was given `connection`.
    Joined {
        /// Team claimed.
        team: TeamId,
        /// Connection id the simulation assigned.
        connection: ConnectionId,
    },
    /// A player left.
    Left(ConnectionId),
}

/// One logged input, tagged with the tick that ran next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayEntry {
    /// Simulation tick when the input arrived.
    pub at_tick: u64,
    /// What arrived.
    pub action: ReplayAction,
}

/// Complete replay data structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replay {
    /// Replay format version.
    pub version: u32,
    /// Scenario identifier or name.
    pub scenario_id: String,
    /// Serialized initial simulation state.
    pub initial_state: Vec<u8>,
    /// Inputs in arrival order.
    pub entries: Vec<ReplayEntry>,
    /// Final tick when the game ended.
    pub final_tick: u64,
    /// Final state hash for verification.
    pub final_hash: u64,
}

impl Replay {
    /// Create a new replay from a simulation's initial state.
    pub fn new(scenario_id: impl Into<String>, initial_state: &Simulation) -> Result<Self> {
        let state_bytes = initial_state.serialize()?;
        Ok(Self {
            version: REPLAY_VERSION,
            scenario_id: scenario_id.into(),
            initial_state: state_bytes,
            entries: Vec::new(),
            final_tick: initial_state.get_tick(),
            final_hash: 0,
        })
    }

    fn push(&mut self, at_tick: u64, action: ReplayAction) {
        self.entries.push(ReplayEntry { at_tick, action });
    }

    /// Record a command the channel accepted while `at_tick` was next.
    pub fn record_command(&mut self, at_tick: u64, command: CommandMessage) {
        self.push(at_tick, ReplayAction::Command(command));
    }

    /// Record a player joining.
    pub fn record_join(&mut self, at_tick: u64, team: TeamId, connection: ConnectionId) {
        self.push(at_tick, ReplayAction::Joined { team, connection });
    }

    /// Record a player leaving.
    pub fn record_leave(&mut self, at_tick: u64, connection: ConnectionId) {
        self.push(at_tick, ReplayAction::Left(connection));
    }

    /// Finalize the replay with end-game state.
    pub fn finalize(&mut self, simulation: &Simulation) {
        self.final_tick = simulation.get_tick();
        self.final_hash = simulation.state_hash();
    }

    /// Save the replay to a file.
    ///
    /// # Errors
    /// Returns an error if serialization or file writing fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        std::fs::write(path.as_ref(), bytes)?;
        Ok(())
    }

    /// Load a replay from a file.
    ///
    /// # Errors
    /// Returns an error if file reading or deserialization fails.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let replay: Self = bincode::deserialize(&bytes)?;

        if replay.version != REPLAY_VERSION {
            return Err(GameError::InvalidState(format!(
                "Replay version mismatch: expected {}, got {}",
                REPLAY_VERSION, replay.version
            )));
        }

        Ok(replay)
    }

    /// Get the initial simulation state for playback.
    ///
    /// # Errors
    /// Returns an error if state deserialization fails.
    pub fn restore_initial_state(&self) -> Result<Simulation> {
        Simulation::deserialize(&self.initial_state)
    }

    /// Recorded commands in arrival order.
    pub fn commands(&self) -> impl Iterator<Item = &CommandMessage> {
        self.entries.iter().filter_map(|entry| match &entry.action {
            ReplayAction::Command(command) => Some(command),
            _ => None,
        })
    }

    /// Get commands stamped for a specific tick.
    #[must_use]
    pub fn commands_at_tick(&self, tick: u64) -> Vec<&CommandMessage> {
        self.commands().filter(|cmd| cmd.tick == tick).collect()
    }

    /// Get the total number of commands in the replay.
    #[must_use]
    pub fn command_count(&self) -> usize {
        self.commands().count()
    }
}

/// Replay playback controller.
#[derive(Debug)]
pub struct ReplayPlayer {
    /// The replay being played.
    replay: Replay,
    /// Current simulation state.
    simulation: Simulation,
    /// Index into the input log.
    entry_index: usize,
    /// Whether playback is paused.
    pub paused: bool,
}

impl ReplayPlayer {
    /// Create a new replay player from a replay.
    ///
    /// # Errors
    /// Returns an error if the initial state cannot be restored.
    pub fn new(replay: Replay) -> Result<Self> {
        let simulation = replay.restore_initial_state()?;
        Ok(Self {
            replay,
            simulation,
            entry_index: 0,
            paused: false,
        })
    }

    /// Feed every input that arrived before the current tick, then tick once.
    fn step(&mut self) {
        let tick = self.simulation.get_tick();
        while let Some(entry) = self.replay.entries.get(self.entry_index) {
            if entry.at_tick > tick {
                break;
            }
            self.entry_index += 1;
            match &entry.action {
                ReplayAction::Command(command) => {
                    if let Err(reason) = self.simulation.submit_command(command.clone()) {
                        tracing::warn!(tick, %reason, "recorded command rejected during playback");
                    }
                }
                ReplayAction::Joined { team, connection } => {
                    match self.simulation.add_connection(*team) {
                        Ok(id) if id == *connection => {}
                        Ok(id) => {
                            tracing::warn!(tick, expected = connection, got = id, "connection id diverged");
                        }
                        Err(err) => tracing::warn!(tick, %err, "recorded join failed during playback"),
                    }
                }
                ReplayAction::Left(connection) => {
                    self.simulation.remove_connection(*connection);
                }
            }
        }
        self.simulation.tick(&mut NullSink);
    }

    /// Advance the replay by one tick.
    ///
    /// Returns true if there are more ticks to play.
    pub fn advance(&mut self) -> bool {
        if !self.paused && !self.is_finished() {
            self.step();
        }
        !self.is_finished()
    }

    /// Seek to a specific tick, replaying from the start if needed.
    ///
    /// # Errors
    /// Returns an error if state restoration fails.
    pub fn seek(&mut self, target_tick: u64) -> Result<()> {
        if target_tick < self.simulation.get_tick() {
            self.simulation = self.replay.restore_initial_state()?;
            self.entry_index = 0;
        }
        let target = target_tick.min(self.replay.final_tick);
        while self.simulation.get_tick() < target {
            self.step();
        }
        Ok(())
    }

    /// Get the current tick.
    #[must_use]
    pub const fn current_tick(&self) -> u64 {
        self.simulation.get_tick()
    }

    /// Get a reference to the current simulation state.
    #[must_use]
    pub const fn simulation(&self) -> &Simulation {
        &self.simulation
    }

    /// Get the replay being played.
    #[must_use]
    pub const fn replay(&self) -> &Replay {
        &self.replay
    }

    /// Check if the replay has finished.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.simulation.get_tick() >= self.replay.final_tick
    }

    /// Play to the end and compare against the recorded hash.
    ///
    /// # Errors
    /// Returns [`GameError::DesyncDetected`] if the hashes differ.
    pub fn verify(&mut self) -> Result<()> {
        self.seek(self.replay.final_tick)?;
        let local_hash = self.simulation.state_hash();
        if local_hash != self.replay.final_hash {
            return Err(GameError::DesyncDetected {
                tick: self.simulation.get_tick(),
                local_hash,
                remote_hash: self.replay.final_hash,
            });
        }
        Ok(())
    }

    /// Toggle pause state.
    pub fn toggle_pause(&mut self) {
        self.paused = !self.paused;
    }

    /// Get progress as a percentage (0-100).
    #[must_use]
    pub fn progress_percent(&self) -> u64 {
        let played = self.replay.final_tick.min(self.simulation.get_tick());
        if self.replay.final_tick == 0 {
            100
        } else {
            played * 100 / self.replay.final_tick
        }
    }
}
