//! The peer's long-running maintenance tasks: registration, periodic
//! keep-alive, directory rescans, availability recovery probing, and
//! graceful disconnect.
//!
//! Each "run forever" loop is a named, independently spawned task with its
//! own period and an explicit shutdown signal (a `tokio::sync::watch`
//! channel), mirroring the teacher's treatment of its disk and peer-session
//! event loops as long-lived tasks rather than ad hoc background threads.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::watch,
    task::JoinHandle,
    time::timeout,
};

use crate::{
    chunk::FileMetadata,
    conf::Conf,
    error::{Error, Result},
    peer::{
        availability::Availability,
        codec::PONG,
        tracker_client::{FileAd, TrackerClient},
    },
    store::StoreHandle,
    tracker::state::PeerId,
};

/// Shared slot the keep-alive task writes into before tripping shutdown, so
/// the engine facade can report *why* the peer stopped.
pub type FatalError = Arc<StdMutex<Option<Error>>>;

/// Drives registration and the maintenance tasks for one peer. Build once
/// at startup; [`Lifecycle::register`] must succeed before spawning the
/// periodic tasks.
///
/// All tracker interactions go through the single `tracker` client shared
/// with the rest of the peer (the downloader, the engine facade): reusing
/// one client bound once keeps this peer's `PeerAddress` stable across
/// registration, keep-alive, rescans and disconnect, as `PeerAddress` is
/// defined to be (§3).
pub struct Lifecycle {
    conf: Conf,
    username: String,
    store: StoreHandle,
    availability: Arc<Availability>,
    tracker: Arc<TrackerClient>,
    own_tcp_port: u16,
}

impl Lifecycle {
    pub fn new(
        conf: Conf,
        username: String,
        store: StoreHandle,
        availability: Arc<Availability>,
        tracker: Arc<TrackerClient>,
        own_tcp_port: u16,
    ) -> Self {
        Self {
            conf,
            username,
            store,
            availability,
            tracker,
            own_tcp_port,
        }
    }

    /// Rescans the shared directory, then registers with the tracker as a
    /// seeder (if the store is non-empty) or a leecher. A failure here is
    /// meant to abort peer startup.
    pub async fn register(&self) -> Result<PeerId> {
        self.store.scan().await?;
        let files = to_file_ads(self.store.list_all().await);
        let peer_id = if files.is_empty() {
            log::info!("Registering with tracker as leecher {}", self.username);
            self.tracker.register_leecher(&self.username).await?
        } else {
            log::info!(
                "Registering with tracker as seeder {} ({} file(s))",
                self.username,
                files.len()
            );
            self.tracker
                .register_seeder(&self.username, self.own_tcp_port, &files)
                .await?
        };
        Ok(peer_id)
    }

    /// Sends `DISCONNECT` for graceful shutdown.
    pub async fn disconnect(&self) -> Result<()> {
        self.tracker.disconnect(&self.username).await
    }

    /// Spawns the keep-alive task: sends `KEEP_ALIVE` every
    /// `keep_alive_interval` until `shutdown` fires. Any send failure is
    /// fatal — the tracker is a hard dependency — so the task records the
    /// error in `fatal_error` and trips `shutdown_tx` itself to stop its
    /// siblings.
    pub fn spawn_keep_alive(
        &self,
        mut shutdown_rx: watch::Receiver<bool>,
        shutdown_tx: watch::Sender<bool>,
        fatal_error: FatalError,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(&self.tracker);
        let username = self.username.clone();
        let keep_alive_interval = self.conf.tracker_client.keep_alive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keep_alive_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = tracker.keep_alive(&username).await {
                            log::error!(
                                "keep-alive failed ({}); treating tracker as unreachable",
                                e
                            );
                            *fatal_error.lock().unwrap() = Some(Error::TrackerUnreachable);
                            let _ = shutdown_tx.send(true);
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Spawns the rescan task: every `rescan_interval`, scans for
    /// added/changed files and reconciles removed ones, pushing any delta
    /// to the tracker via `UPDATE_FILES`.
    pub fn spawn_rescan(&self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let tracker = Arc::clone(&self.tracker);
        let rescan_interval = self.conf.store.rescan_interval;
        let store = self.store.clone();
        let username = self.username.clone();
        let own_tcp_port = self.own_tcp_port;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(rescan_interval);
            ticker.tick().await; // first tick fires immediately; registration already scanned once

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        run_rescan_pass(&tracker, &store, &username, own_tcp_port).await;
                    }
                }
            }
        })
    }

    /// Spawns the availability recovery task: every
    /// `availability_probe_interval`, `PING`s every seeder currently marked
    /// unavailable and marks it available again on `PONG`.
    pub fn spawn_availability_recovery(
        &self,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let availability = Arc::clone(&self.availability);
        let interval = self.conf.peer.availability_probe_interval;
        let connect_timeout = self.conf.peer.connect_timeout;
        let read_timeout = self.conf.peer.read_timeout;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        for key in availability.unavailable_keys() {
                            match probe(key, connect_timeout, read_timeout).await {
                                Ok(()) => availability.mark_available(key),
                                Err(e) => log::debug!("Seeder {} still unreachable: {}", key, e),
                            }
                        }
                    }
                }
            }
        })
    }
}

async fn run_rescan_pass(
    tracker: &TrackerClient,
    store: &StoreHandle,
    username: &str,
    own_tcp_port: u16,
) {
    let scan_report = match store.scan().await {
        Ok(report) => report,
        Err(e) => {
            log::warn!("Periodic rescan failed: {}", e);
            return;
        }
    };
    let removed = match store.reconcile().await {
        Ok(removed) => removed,
        Err(e) => {
            log::warn!("Periodic reconcile failed: {}", e);
            Vec::new()
        }
    };

    if scan_report.added.is_empty() && scan_report.updated.is_empty() && removed.is_empty() {
        return;
    }
    log::info!(
        "Rescan found {} added, {} updated, {} removed; pushing file-set update",
        scan_report.added.len(),
        scan_report.updated.len(),
        removed.len()
    );

    let files = to_file_ads(store.list_all().await);
    if let Err(e) = tracker.update_files(username, own_tcp_port, &files).await {
        log::warn!("Failed to push file-set update to tracker: {}", e);
    }
}

async fn probe(addr: SocketAddr, connect_timeout: Duration, read_timeout: Duration) -> Result<()> {
    let mut stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Timeout)??;
    stream.write_all(b"PING\n").await?;

    let mut buf = Vec::new();
    let mut read_buf = [0u8; 16];
    loop {
        let n = timeout(read_timeout, stream.read(&mut read_buf))
            .await
            .map_err(|_| Error::Timeout)??;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&read_buf[..n]);
        if buf.len() >= PONG.len() {
            break;
        }
    }
    if buf == PONG {
        Ok(())
    } else {
        Err(Error::ProtocolViolation("peer did not reply PONG to probe".into()))
    }
}

pub(crate) fn to_file_ads(files: HashMap<String, FileMetadata>) -> Vec<FileAd> {
    files
        .into_iter()
        .map(|(filename, metadata)| FileAd {
            filename,
            size: metadata.size,
            checksum: metadata.checksum,
        })
        .collect()
}
