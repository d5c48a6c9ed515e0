//! UDP transport and the fixed-rate game loop.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::protocol::{self, ClientPacket, MAX_PACKET_SIZE};
use crate::state::{Outgoing, ServerState};

/// Datagram decoded by the receiver task.
#[derive(Debug)]
struct Inbound {
    packet: ClientPacket,
    addr: SocketAddr,
}

/// Bound socket plus the authoritative state it serves.
#[derive(Debug)]
pub struct Server {
    socket: Arc<UdpSocket>,
    state: ServerState,
    tick_duration: Duration,
}

impl Server {
    /// Bind the socket and create a fresh game.
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let sim_config = config.sim_config()?;
        let tick_duration = Duration::from_micros(1_000_000 / u64::from(sim_config.tick_rate.max(1)));
        let state = ServerState::new(
            sim_config,
            config.catalog()?,
            config.max_players,
            config.client_timeout(),
        )?;
        let socket = Arc::new(UdpSocket::bind(config.bind_addr()?).await?);
        tracing::info!(addr = %socket.local_addr()?, "server listening");
        Ok(Self {
            socket,
            state,
            tick_duration,
        })
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Read datagrams forever, forwarding the ones that decode.
    fn spawn_receiver(&self, inbox: mpsc::UnboundedSender<Inbound>) {
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_PACKET_SIZE];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match protocol::decode::<ClientPacket>(&buffer[..len]) {
                        Ok(packet) => {
                            if inbox.send(Inbound { packet, addr }).is_err() {
                                break;
                            }
                        }
                        Err(err) => tracing::warn!(%addr, %err, "undecodable packet"),
                    },
                    Err(err) => {
                        tracing::error!(%err, "receive failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    async fn send_all(&self, outgoing: Vec<Outgoing>) {
        for (addr, packet) in outgoing {
            let bytes = match protocol::encode(&packet) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::error!(%addr, %err, "failed to encode packet");
                    continue;
                }
            };
            if let Err(err) = self.socket.send_to(&bytes, addr).await {
                tracing::warn!(%addr, %err, "send failed");
            }
        }
    }

    /// Run until ctrl-c, then hand back the final state.
    pub async fn run(self) -> Result<ServerState> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(%err, "ctrl-c handler failed");
            }
        })
        .await
    }

    /// Run until `shutdown` resolves, then hand back the final state.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<ServerState> {
        let (inbox_tx, mut inbox) = mpsc::unbounded_channel();
        self.spawn_receiver(inbox_tx);

        let mut ticker = interval(self.tick_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut server = self;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(Inbound { packet, addr }) = inbox.recv() => {
                    let replies = server.state.handle_packet(packet, addr, Instant::now());
                    server.send_all(replies).await;
                }
                _ = ticker.tick() => {
                    let outgoing = server.state.step(Instant::now());
                    server.send_all(outgoing).await;
                }
                () = &mut shutdown => {
                    tracing::info!(tick = server.state.simulation().get_tick(), "shutting down");
                    break;
                }
            }
        }
        Ok(server.state)
    }
}
