//! The tracker process: a single UDP listener dispatching one task per
//! datagram against a shared, mutex-guarded [`state::TrackerState`], plus a
//! periodic inactivity sweeper.
//!
//! Mirrors the teacher's per-connection task-spawning idiom, generalized
//! from TCP accept loops to UDP datagram dispatch: each request is
//! independent work, but all of it serializes on one lock around the
//! membership table, matching the teacher's single-writer-lock shape.

pub mod protocol;
pub mod state;

use std::{net::SocketAddr, sync::Arc, time::Instant};

use tokio::{net::UdpSocket, sync::Mutex, time};

use crate::{conf::TrackerConf, error::Result};
use protocol::{Request, Response};
use state::{PeerAddress, PeerKind, TrackerState};

/// A running tracker. Build with [`Tracker::bind`], then drive it forever
/// with [`Tracker::run`].
pub struct Tracker {
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<TrackerState>>,
    conf: TrackerConf,
}

impl Tracker {
    /// Binds the tracker's UDP socket on `conf.udp_port` across all
    /// interfaces.
    pub async fn bind(conf: TrackerConf) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], conf.udp_port));
        let socket = UdpSocket::bind(addr).await?;
        log::info!("Tracker bound to {}", addr);
        Ok(Self {
            socket: Arc::new(socket),
            state: Arc::new(Mutex::new(TrackerState::new(
                conf.peer_limit,
                conf.peer_timeout,
            ))),
            conf,
        })
    }

    /// Returns the address the tracker's UDP socket is actually bound to,
    /// which matters when `conf.udp_port` is 0 (ephemeral port, used by
    /// tests).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Runs the datagram dispatch loop and the inactivity sweeper until an
    /// I/O error on the socket itself (the sweeper never returns on its
    /// own). Each returned datagram's handling is spawned independently so
    /// a slow or malicious peer can't stall the others.
    pub async fn run(self) -> Result<()> {
        let sweeper = spawn_sweeper(Arc::clone(&self.state), self.conf.sweep_interval);

        let mut buf = vec![0u8; 4096];
        let result = loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(e) => break Err(e.into()),
            };
            let datagram = buf[..len].to_vec();
            let socket = Arc::clone(&self.socket);
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let response = handle_datagram(&state, src, &datagram).await;
                if let Err(e) = socket.send_to(&response, src).await {
                    log::warn!("Failed to send response to {}: {}", src, e);
                }
            });
        };

        sweeper.abort();
        result
    }
}

fn spawn_sweeper(
    state: Arc<Mutex<TrackerState>>,
    sweep_interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let removed = state.lock().await.sweep(Instant::now());
            for addr in removed {
                log::info!("Swept inactive peer {:?}", addr);
            }
        }
    })
}

async fn handle_datagram(
    state: &Arc<Mutex<TrackerState>>,
    src: SocketAddr,
    datagram: &[u8],
) -> Vec<u8> {
    let request = match protocol::parse_request(datagram) {
        Ok(request) => request,
        Err(e) => {
            log::warn!("Malformed request from {}: {}", src, e);
            return Response::BadRequest(e.to_string()).to_bytes();
        }
    };
    let peer_addr: PeerAddress = (src.ip(), src.port());

    let response = {
        let mut guard = state.lock().await;
        dispatch(&mut guard, peer_addr, request)
    };
    log::info!("{} -> {:?}", src, response);
    response.to_bytes()
}

fn dispatch(state: &mut TrackerState, addr: PeerAddress, request: Request) -> Response {
    match request {
        Request::RegisterLeecher { username } => {
            match state.register(addr, username, PeerKind::Leecher, None, Vec::new()) {
                Ok(peer_id) => Response::Registered { peer_id },
                Err(e) => e.into(),
            }
        }
        Request::RegisterSeeder {
            username,
            peer_tcp_port,
            files,
        } => match state.register(addr, username, PeerKind::Seeder, Some(peer_tcp_port), files) {
            Ok(peer_id) => Response::Registered { peer_id },
            Err(e) => e.into(),
        },
        Request::UpdateFiles {
            username: _,
            peer_tcp_port,
            files,
        } => match state.update_files(addr, Some(peer_tcp_port), files) {
            Ok(()) => Response::FilesUpdated,
            Err(e) => e.into(),
        },
        Request::ChangeUsername { old, new } => match state.change_username(addr, &old, new) {
            Ok(()) => Response::UsernameChanged,
            Err(e) => e.into(),
        },
        Request::KeepAlive { username: _ } => match state.keep_alive(addr) {
            Ok(()) => Response::KeptAlive,
            Err(e) => e.into(),
        },
        Request::Disconnect { username: _ } => match state.disconnect(addr) {
            Ok(()) => Response::Disconnected,
            Err(e) => e.into(),
        },
        Request::ListActive => {
            let (seeders, leechers) = state.list_active();
            Response::ListActive { seeders, leechers }
        }
        Request::ListFiles => Response::ListFiles {
            files: state.list_files(),
        },
        Request::GetPeers { filename } => match state.get_peers(&filename) {
            Some(entries) => {
                let first = &entries[0];
                Response::Peers {
                    filename: filename.clone(),
                    size: first.size,
                    checksum: first.checksum.clone(),
                    seeders: entries
                        .iter()
                        .map(|e| (e.address.0.to_string(), e.tcp_port, e.peer_id))
                        .collect(),
                }
            }
            None => Response::NotFound(format!("{} not found", filename)),
        },
        Request::Ping => Response::Pong,
    }
}
