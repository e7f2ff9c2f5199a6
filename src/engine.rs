//! The public facade: assembles the chunk store, the peer's TCP server, the
//! lifecycle maintenance tasks, and the downloader into a single handle,
//! mirroring the teacher's own top-level `engine` module that ties `Disk`,
//! `Torrent` and `PeerSession` together into one client object.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
};

use tokio::{sync::watch, task::JoinHandle};

use crate::{
    chunk::FileMetadata,
    conf::Conf,
    error::{Error, Result},
    peer::{
        availability::Availability,
        client::Downloader,
        lifecycle::{self, FatalError, Lifecycle},
        server::PeerServer,
        tracker_client::TrackerClient,
    },
    store::{Store, StoreHandle},
    tracker::state::PeerId,
};

/// A running peer: seeds whatever is in its shared directory, serves chunks
/// to others, and can download files advertised by the swarm.
///
/// Build with [`Peer::start`], which blocks until registration with the
/// tracker succeeds (or fails, aborting startup, per the lifecycle's
/// registration contract). Call [`Peer::shutdown`] to disconnect cleanly
/// and stop every background task.
pub struct Peer {
    conf: Conf,
    username: String,
    own_peer_id: PeerId,
    own_tcp_port: u16,
    store: StoreHandle,
    tracker: Arc<TrackerClient>,
    lifecycle: Lifecycle,
    downloader: Downloader,
    shutdown_tx: watch::Sender<bool>,
    fatal_error: FatalError,
    tasks: Vec<JoinHandle<()>>,
}

impl Peer {
    /// Starts a peer: loads/scans the chunk store, binds the TCP server,
    /// registers with the tracker (as a seeder if the store is non-empty,
    /// a leecher otherwise), and spawns the keep-alive, rescan and
    /// availability-recovery maintenance tasks.
    pub async fn start(conf: Conf, username: impl Into<String>) -> Result<Self> {
        let username = username.into();

        let (store, store_handle) = Store::new(&conf.store);
        tokio::spawn(store.run());

        let server = PeerServer::bind(conf.peer.peer_tcp_port, store_handle.clone()).await?;
        let own_tcp_port = server.local_addr()?.port();
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                log::error!("Peer TCP server stopped: {}", e);
            }
        });

        let tracker = Arc::new(TrackerClient::connect(&conf.tracker_client).await?);

        let availability = Arc::new(Availability::new());
        let lifecycle = Lifecycle::new(
            conf.clone(),
            username.clone(),
            store_handle.clone(),
            Arc::clone(&availability),
            Arc::clone(&tracker),
            own_tcp_port,
        );
        let own_peer_id = lifecycle.register().await?;
        log::info!(
            "Peer {} registered with tracker as peer id {}, serving on port {}",
            username,
            own_peer_id,
            own_tcp_port
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let fatal_error: FatalError = Arc::new(StdMutex::new(None));

        let tasks = vec![
            lifecycle.spawn_keep_alive(shutdown_rx.clone(), shutdown_tx.clone(), Arc::clone(&fatal_error)),
            lifecycle.spawn_rescan(shutdown_rx.clone()),
            lifecycle.spawn_availability_recovery(shutdown_rx.clone()),
        ];

        let downloader = Downloader::new(conf.clone(), own_peer_id, availability, Arc::clone(&tracker));

        Ok(Self {
            conf,
            username,
            own_peer_id,
            own_tcp_port,
            store: store_handle,
            tracker,
            lifecycle,
            downloader,
            shutdown_tx,
            fatal_error,
            tasks,
        })
    }

    /// This peer's tracker-assigned id.
    pub fn peer_id(&self) -> PeerId {
        self.own_peer_id
    }

    /// The TCP port this peer's server is actually bound to.
    pub fn tcp_port(&self) -> u16 {
        self.own_tcp_port
    }

    /// If a background task has hit a fatal error (currently, only a failed
    /// keep-alive), returns it. Once this returns `Some`, every maintenance
    /// task has stopped and the peer should be shut down and restarted.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal_error.lock().unwrap().as_ref().map(Error::to_string)
    }

    /// Downloads `filename` from the swarm, verifying it end to end.
    pub async fn download(&self, filename: &str) -> Result<(PathBuf, FileMetadata)> {
        self.downloader.download(filename).await
    }

    /// Promotes a file at `source_path` into the shared directory under
    /// `filename`, indexing it and immediately pushing the updated file set
    /// to the tracker rather than waiting for the next rescan. Typical use
    /// is re-seeding a file this peer just downloaded.
    pub async fn seed(
        &self,
        filename: impl Into<String>,
        source_path: impl Into<PathBuf>,
    ) -> Result<FileMetadata> {
        let metadata = self.store.add(filename, source_path).await?;
        let files = lifecycle::to_file_ads(self.store.list_all().await);
        self.tracker
            .update_files(&self.username, self.own_tcp_port, &files)
            .await?;
        Ok(metadata)
    }

    /// Renames this peer on the tracker. The local-process username used by
    /// subsequent keep-alive/rescan/seed calls is updated on success.
    pub async fn change_username(&mut self, new_username: impl Into<String>) -> Result<()> {
        let new_username = new_username.into();
        let own_addr = self.tracker.local_addr()?;
        self.tracker
            .change_username(&self.username, &new_username, own_addr)
            .await?;
        self.username = new_username;
        Ok(())
    }

    /// Lists every currently active seeder and leecher username.
    pub async fn list_active(&self) -> Result<(Vec<String>, Vec<String>)> {
        self.tracker.list_active().await
    }

    /// Lists every filename currently advertised by any seeder, with size.
    pub async fn list_files(&self) -> Result<std::collections::HashMap<String, u64>> {
        self.tracker.list_files().await
    }

    /// Sends a graceful `DISCONNECT`, stops every maintenance task, and
    /// shuts down the chunk store actor.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        let result = self.lifecycle.disconnect().await;
        self.store.shutdown();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Tracker;

    async fn spawn_tracker() -> u16 {
        let tracker_conf = crate::conf::TrackerConf::new(0);
        let tracker = Tracker::bind(tracker_conf).await.unwrap();
        let port = tracker.local_addr().unwrap().port();
        tokio::spawn(tracker.run());
        port
    }

    fn conf(shared_dir: PathBuf, download_dir: PathBuf, tracker_port: u16) -> Conf {
        let mut c = Conf::new(
            std::net::IpAddr::from([127, 0, 0, 1]),
            tracker_port,
            shared_dir,
            download_dir,
        );
        c.peer.peer_tcp_port = 0;
        c
    }

    #[tokio::test]
    async fn test_start_registers_as_leecher_when_store_empty() {
        let tracker_port = spawn_tracker().await;
        let shared = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();

        let peer = Peer::start(
            conf(shared.path().to_path_buf(), downloads.path().to_path_buf(), tracker_port),
            "alice",
        )
        .await
        .unwrap();

        let (seeders, leechers) = peer.list_active().await.unwrap();
        assert!(seeders.is_empty());
        assert_eq!(leechers, vec!["alice".to_string()]);
        assert!(peer.fatal_error().is_none());
    }

    #[tokio::test]
    async fn test_download_end_to_end_between_two_peers() {
        let tracker_port = spawn_tracker().await;

        let seeder_shared = tempfile::tempdir().unwrap();
        std::fs::write(seeder_shared.path().join("f.bin"), b"the quick brown fox").unwrap();
        let seeder_downloads = tempfile::tempdir().unwrap();
        let seeder = Peer::start(
            conf(
                seeder_shared.path().to_path_buf(),
                seeder_downloads.path().to_path_buf(),
                tracker_port,
            ),
            "seeder-one",
        )
        .await
        .unwrap();

        let leecher_shared = tempfile::tempdir().unwrap();
        let leecher_downloads = tempfile::tempdir().unwrap();
        let leecher = Peer::start(
            conf(
                leecher_shared.path().to_path_buf(),
                leecher_downloads.path().to_path_buf(),
                tracker_port,
            ),
            "leecher-one",
        )
        .await
        .unwrap();

        let (path, metadata) = leecher.download("f.bin").await.unwrap();
        assert_eq!(metadata.size, 19);
        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(contents, b"the quick brown fox");

        let _ = seeder.shutdown().await;
        let _ = leecher.shutdown().await;
    }
}
