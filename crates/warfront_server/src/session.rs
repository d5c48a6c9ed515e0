//! Client address bookkeeping.
//!
//! Maps UDP peers to simulation connections and tracks liveness. The
//! simulation owns everything game-related about a connection; a session
//! only knows where to send packets and when the peer was last heard from.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use warfront_core::components::{ConnectionId, TeamId};

/// One connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    /// Simulation connection.
    pub connection: ConnectionId,
    /// Team the connection controls.
    pub team: TeamId,
    /// Peer address.
    pub addr: SocketAddr,
    /// Last time any packet arrived from the peer.
    pub last_seen: Instant,
}

impl Session {
    /// Check if the peer has been silent longer than `timeout`.
    #[must_use]
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

/// All sessions, keyed by connection id.
#[derive(Debug, Clone)]
pub struct Sessions {
    sessions: BTreeMap<ConnectionId, Session>,
    max_players: u8,
}

impl Sessions {
    /// Create an empty roster.
    #[must_use]
    pub fn new(max_players: u8) -> Self {
        Self {
            sessions: BTreeMap::new(),
            max_players,
        }
    }

    /// Configured player limit.
    #[must_use]
    pub const fn max_players(&self) -> u8 {
        self.max_players
    }

    /// Check if another player fits.
    #[must_use]
    pub fn has_room(&self) -> bool {
        self.sessions.len() < usize::from(self.max_players)
    }

    /// Lowest team id not taken by a session.
    #[must_use]
    pub fn free_team(&self) -> Option<TeamId> {
        (0..self.max_players)
            .map(TeamId)
            .find(|team| self.sessions.values().all(|s| s.team != *team))
    }

    /// Register a session.
    pub fn insert(&mut self, session: Session) {
        tracing::info!(
            connection = session.connection,
            team = session.team.0,
            addr = %session.addr,
            "client connected"
        );
        self.sessions.insert(session.connection, session);
    }

    /// Remove a session.
    pub fn remove(&mut self, connection: ConnectionId) -> Option<Session> {
        let removed = self.sessions.remove(&connection);
        if removed.is_some() {
            tracing::info!(connection, "client disconnected");
        }
        removed
    }

    /// Connection for a peer address.
    #[must_use]
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<ConnectionId> {
        self.sessions
            .values()
            .find(|s| s.addr == addr)
            .map(|s| s.connection)
    }

    /// Session for a connection.
    #[must_use]
    pub fn get(&self, connection: ConnectionId) -> Option<&Session> {
        self.sessions.get(&connection)
    }

    /// Record activity from a peer.
    pub fn touch(&mut self, connection: ConnectionId, now: Instant) {
        if let Some(session) = self.sessions.get_mut(&connection) {
            session.last_seen = now;
        }
    }

    /// Connections silent for longer than `timeout`, in id order.
    #[must_use]
    pub fn timed_out(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.sessions
            .values()
            .filter(|s| s.is_timed_out(now, timeout))
            .map(|s| s.connection)
            .collect()
    }

    /// Sessions in connection id order.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Number of sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if nobody is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
