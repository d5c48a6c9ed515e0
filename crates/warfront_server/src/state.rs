//! Socket-free server logic.
//!
//! [`ServerState`] turns decoded client packets into simulation calls and
//! runs the tick, returning the packets to send. The network layer only
//! moves bytes.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use warfront_core::catalog::Catalog;
use warfront_core::components::ConnectionId;
use warfront_core::config::SimConfig;
use warfront_core::events::SimEvent;
use warfront_core::replay::Replay;
use warfront_core::replication::Replicator;
use warfront_core::simulation::Simulation;

use crate::error::{Result, ServerError};
use crate::protocol::{BuildStatus, ClientPacket, ServerPacket, PROTOCOL_VERSION};
use crate::session::{Session, Sessions};

/// A packet addressed to a peer.
pub type Outgoing = (SocketAddr, ServerPacket);

/// Authoritative game state plus connection bookkeeping.
#[derive(Debug)]
pub struct ServerState {
    sim: Simulation,
    sessions: Sessions,
    replicator: Replicator,
    replay: Replay,
    client_timeout: Duration,
}

impl ServerState {
    /// Start a new game.
    pub fn new(
        config: SimConfig,
        catalog: Catalog,
        max_players: u8,
        client_timeout: Duration,
    ) -> Result<Self> {
        let sim = Simulation::new(config, catalog);
        let replay = Replay::new("warfront", &sim)?;
        Ok(Self {
            sim,
            sessions: Sessions::new(max_players),
            replicator: Replicator::default(),
            replay,
            client_timeout,
        })
    }

    /// The simulation.
    #[must_use]
    pub const fn simulation(&self) -> &Simulation {
        &self.sim
    }

    /// Connected peers.
    #[must_use]
    pub const fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    /// Replay of every accepted input so far, finalized at the current tick.
    #[must_use]
    pub fn replay(&self) -> Replay {
        let mut replay = self.replay.clone();
        replay.finalize(&self.sim);
        replay
    }

    /// Handle one decoded packet.
    pub fn handle_packet(
        &mut self,
        packet: ClientPacket,
        addr: SocketAddr,
        now: Instant,
    ) -> Vec<Outgoing> {
        let known = self.sessions.find_by_addr(addr);
        if let Some(connection) = known {
            self.sessions.touch(connection, now);
        }

        match (packet, known) {
            (ClientPacket::Hello { version }, _) => self.admit(version, addr, now),
            (ClientPacket::Command(mut command), Some(connection)) => {
                command.connection = connection;
                match self.sim.submit_command(command.clone()) {
                    Ok(()) => {
                        self.replay.record_command(self.sim.get_tick(), command);
                        Vec::new()
                    }
                    Err(reason) => vec![(addr, ServerPacket::CommandRejected(reason))],
                }
            }
            (ClientPacket::ViewExtent { center, half_extent }, Some(connection)) => {
                if let Err(err) = self.sim.set_view_extent(connection, center, half_extent) {
                    tracing::warn!(connection, %err, "view update failed");
                }
                Vec::new()
            }
            (ClientPacket::Goodbye, Some(connection)) => {
                self.disconnect(connection);
                Vec::new()
            }
            (_, None) => {
                tracing::debug!(%addr, "packet from unknown peer");
                Vec::new()
            }
        }
    }

    fn admit(&mut self, version: u32, addr: SocketAddr, now: Instant) -> Vec<Outgoing> {
        match self.try_admit(version, addr, now) {
            Ok(session) => vec![(
                addr,
                ServerPacket::Welcome {
                    connection_id: session.connection,
                    team: session.team,
                    tick: self.sim.get_tick(),
                },
            )],
            Err(err) => {
                tracing::warn!(%addr, %err, "hello refused");
                vec![(
                    addr,
                    ServerPacket::Refused {
                        reason: err.to_string(),
                    },
                )]
            }
        }
    }

    fn try_admit(&mut self, version: u32, addr: SocketAddr, now: Instant) -> Result<Session> {
        if version != PROTOCOL_VERSION {
            return Err(ServerError::ProtocolMismatch {
                addr,
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }
        // A repeated hello from the same address starts over.
        if let Some(existing) = self.sessions.find_by_addr(addr) {
            self.disconnect(existing);
        }
        let full = ServerError::ServerFull {
            max_players: self.sessions.max_players(),
        };
        if !self.sessions.has_room() {
            return Err(full);
        }
        let team = self.sessions.free_team().ok_or(full)?;
        let connection = self.sim.add_connection(team)?;
        self.replay.record_join(self.sim.get_tick(), team, connection);
        let session = Session {
            connection,
            team,
            addr,
            last_seen: now,
        };
        self.sessions.insert(session);
        Ok(session)
    }

    fn disconnect(&mut self, connection: ConnectionId) {
        self.sessions.remove(connection);
        if self.sim.remove_connection(connection).is_some() {
            self.replay.record_leave(self.sim.get_tick(), connection);
        }
        self.replicator.forget(connection);
    }

    /// Drop silent peers, run one tick and build every outgoing packet.
    pub fn step(&mut self, now: Instant) -> Vec<Outgoing> {
        for connection in self.sessions.timed_out(now, self.client_timeout) {
            tracing::info!(connection, "client timed out");
            self.disconnect(connection);
        }

        let mut events = Vec::new();
        self.sim.tick(&mut events);

        let mut outgoing = self.route_events(&events);
        for session in self.sessions.iter() {
            match self.replicator.encode(&self.sim, session.connection) {
                Ok(snapshot) => outgoing.push((session.addr, ServerPacket::Snapshot(snapshot))),
                Err(err) => tracing::warn!(connection = session.connection, %err, "snapshot failed"),
            }
        }
        outgoing
    }

    fn route_events(&self, events: &[SimEvent]) -> Vec<Outgoing> {
        let addr_of = |connection: ConnectionId| self.sessions.get(connection).map(|s| s.addr);
        events
            .iter()
            .filter_map(|event| {
                let (connection, status) = match *event {
                    SimEvent::StructurePlaced { team, .. } => {
                        (self.sim.connection_for_team(team)?, BuildStatus::Accepted)
                    }
                    SimEvent::BuildPending { connection, .. } => {
                        (connection, BuildStatus::Pending)
                    }
                    SimEvent::BuildRejected { connection, reason } => {
                        (connection, BuildStatus::Rejected(reason))
                    }
                    _ => return None,
                };
                Some((addr_of(connection)?, ServerPacket::BuildStatus(status)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warfront_core::command::{CommandKind, CommandMessage};
    use warfront_core::components::{GridCoord, TeamId};
    use warfront_core::construction::{BuildRejection, BuildRequest};
    use warfront_core::replay::ReplayPlayer;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn state(max_players: u8) -> ServerState {
        ServerState::new(
            SimConfig::default(),
            Catalog::standard().unwrap(),
            max_players,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn hello(state: &mut ServerState, port: u16, now: Instant) -> ServerPacket {
        let mut out = state.handle_packet(
            ClientPacket::Hello {
                version: PROTOCOL_VERSION,
            },
            addr(port),
            now,
        );
        assert_eq!(out.len(), 1);
        out.remove(0).1
    }

    #[test]
    fn test_hello_assigns_distinct_teams() {
        let now = Instant::now();
        let mut state = state(2);
        let first = hello(&mut state, 5000, now);
        let second = hello(&mut state, 5001, now);
        assert!(matches!(first, ServerPacket::Welcome { team: TeamId(0), .. }));
        assert!(matches!(second, ServerPacket::Welcome { team: TeamId(1), .. }));
        assert!(matches!(
            hello(&mut state, 5002, now),
            ServerPacket::Refused { .. }
        ));
    }

    #[test]
    fn test_wrong_protocol_refused() {
        let mut state = state(2);
        let out = state.handle_packet(ClientPacket::Hello { version: 0 }, addr(5000), Instant::now());
        assert!(matches!(out[0].1, ServerPacket::Refused { .. }));
        assert!(state.sessions().is_empty());
    }

    #[test]
    fn test_command_connection_comes_from_address() {
        let now = Instant::now();
        let mut state = state(2);
        hello(&mut state, 5000, now);
        let spoofed = CommandMessage::new(99, 0, CommandKind::Stop);
        let out = state.handle_packet(ClientPacket::Command(spoofed), addr(5000), now);
        assert!(out.is_empty());
        assert_eq!(state.replay().commands().next().unwrap().connection, 1);
    }

    #[test]
    fn test_build_status_routed_to_requester() {
        let now = Instant::now();
        let mut state = state(2);
        hello(&mut state, 5000, now);
        let wall = state.simulation().catalog().structure_index("Wall").unwrap();
        let request = BuildRequest {
            structure: wall,
            grid_position: GridCoord::new(1000, 1000),
        };
        state.handle_packet(
            ClientPacket::Command(CommandMessage::new(1, 0, CommandKind::Build).with_build(request)),
            addr(5000),
            now,
        );
        let out = state.step(now);
        assert!(out.contains(&(
            addr(5000),
            ServerPacket::BuildStatus(BuildStatus::Rejected(BuildRejection::OutOfBounds))
        )));
        assert!(out
            .iter()
            .any(|(to, p)| *to == addr(5000) && matches!(p, ServerPacket::Snapshot(_))));
    }

    #[test]
    fn test_silent_client_dropped() {
        let start = Instant::now();
        let mut state = state(2);
        hello(&mut state, 5000, start);
        state.step(start + Duration::from_secs(10));
        assert!(state.sessions().is_empty());
        assert!(state.simulation().connection(1).is_none());
    }

    #[test]
    fn test_saved_replay_verifies() {
        let start = Instant::now();
        let mut state = state(2);
        hello(&mut state, 5000, start);
        hello(&mut state, 5001, start);

        let wall = state.simulation().catalog().structure_index("Wall").unwrap();
        let request = BuildRequest {
            structure: wall,
            grid_position: GridCoord::new(10, 10),
        };
        for (port, tick) in [(5000, 0), (5001, 2)] {
            let build = CommandMessage::new(0, tick, CommandKind::Build).with_build(request);
            state.handle_packet(ClientPacket::Command(build), addr(port), start);
        }
        for _ in 0..5 {
            state.step(start);
        }

        state.handle_packet(ClientPacket::Goodbye, addr(5000), start);
        hello(&mut state, 5002, start);
        state.step(start);
        // Both remaining clients have been silent since the start.
        state.step(start + Duration::from_secs(6));
        for _ in 0..3 {
            state.step(start + Duration::from_secs(6));
        }

        let replay = state.replay();
        assert_eq!(replay.command_count(), 2);
        assert_eq!(replay.final_tick, 10);
        let mut player = ReplayPlayer::new(replay).unwrap();
        player.verify().unwrap();
        assert_eq!(player.simulation().state_hash(), state.simulation().state_hash());
        assert_eq!(
            player.simulation().connections().count(),
            state.simulation().connections().count()
        );
    }

    #[test]
    fn test_goodbye_frees_team() {
        let now = Instant::now();
        let mut state = state(1);
        hello(&mut state, 5000, now);
        state.handle_packet(ClientPacket::Goodbye, addr(5000), now);
        assert!(matches!(
            hello(&mut state, 5001, now),
            ServerPacket::Welcome { team: TeamId(0), .. }
        ));
    }
}
