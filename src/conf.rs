//! This module defines types used to configure the tracker and the peer's
//! parts (chunk store, tracker client, TCP server and downloader).

use std::{net::IpAddr, path::PathBuf, time::Duration};

/// The default chunk size used when splitting files: 1 MiB.
pub const DEFAULT_CHUNK_LEN: u64 = 1024 * 1024;

/// The global configuration for a peer and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub tracker_client: TrackerClientConf,
    pub store: StoreConf,
    pub peer: PeerConf,
}

impl Conf {
    /// Returns a peer configuration with reasonable defaults, except for the
    /// shared/download directories and the tracker address, which are not
    /// sensible to guess for the caller.
    pub fn new(
        tracker_host: IpAddr,
        tracker_udp_port: u16,
        shared_dir: impl Into<PathBuf>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tracker_client: TrackerClientConf::new(
                tracker_host,
                tracker_udp_port,
            ),
            store: StoreConf::new(shared_dir),
            peer: PeerConf::new(download_dir),
        }
    }
}

/// Configuration for talking to the tracker.
#[derive(Clone, Debug)]
pub struct TrackerClientConf {
    /// The tracker's host address.
    pub tracker_host: IpAddr,
    /// The tracker's UDP listening port.
    pub tracker_udp_port: u16,
    /// How long to wait for a tracker response before giving up.
    pub request_timeout: Duration,
    /// How often to send `KEEP_ALIVE`.
    pub keep_alive_interval: Duration,
}

impl TrackerClientConf {
    pub fn new(tracker_host: IpAddr, tracker_udp_port: u16) -> Self {
        Self {
            tracker_host,
            tracker_udp_port,
            request_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(2),
        }
    }
}

/// Configuration for the chunk store.
#[derive(Clone, Debug)]
pub struct StoreConf {
    /// The directory whose files are chunked, hashed and served to peers.
    pub shared_dir: PathBuf,
    /// The nominal chunk length; only the last chunk of a file may be
    /// shorter.
    pub chunk_len: u64,
    /// How often the directory is rescanned for added/changed/removed files.
    pub rescan_interval: Duration,
}

impl StoreConf {
    pub fn new(shared_dir: impl Into<PathBuf>) -> Self {
        Self {
            shared_dir: shared_dir.into(),
            chunk_len: DEFAULT_CHUNK_LEN,
            rescan_interval: Duration::from_secs(60),
        }
    }
}

/// Configuration for the peer's TCP server and downloader.
#[derive(Clone, Debug)]
pub struct PeerConf {
    /// The TCP port this peer's server listens on.
    pub peer_tcp_port: u16,
    /// The directory downloaded files are reassembled into.
    pub download_dir: PathBuf,
    /// Deadline for establishing a TCP connection to a seeder.
    pub connect_timeout: Duration,
    /// Deadline for an idle receive on an established connection.
    pub read_timeout: Duration,
    /// How often seeders marked unavailable are re-probed with `PING`.
    pub availability_probe_interval: Duration,
    /// The minimum number of parallel chunk-download workers.
    pub min_worker_count: usize,
}

impl PeerConf {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            // arbitrary but conventional; callers running more than one peer
            // on the same host must override this
            peer_tcp_port: 12000,
            download_dir: download_dir.into(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            availability_probe_interval: Duration::from_secs(60),
            min_worker_count: 4,
        }
    }
}

/// Configuration for the tracker process itself.
#[derive(Clone, Debug)]
pub struct TrackerConf {
    /// The tracker's UDP listening port.
    pub udp_port: u16,
    /// The maximum number of simultaneously active peers.
    pub peer_limit: usize,
    /// How long a peer may go without a `KEEP_ALIVE` before the sweeper
    /// removes it.
    pub peer_timeout: Duration,
    /// How often the inactivity sweeper runs.
    pub sweep_interval: Duration,
}

impl TrackerConf {
    pub fn new(udp_port: u16) -> Self {
        Self {
            udp_port,
            peer_limit: 10,
            peer_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(15),
        }
    }
}
