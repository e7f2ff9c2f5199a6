//! The tracker's in-memory membership table and file→seeders index.
//!
//! Pure state transitions, deliberately free of any socket or task code so
//! they can be unit tested without standing up a UDP listener. [`super`]
//! wraps a single instance in a `tokio::sync::Mutex` and drives it from the
//! datagram dispatch loop.

use std::{
    collections::HashMap,
    net::IpAddr,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

/// `(host, udp_port)`: the identifier a peer is addressed by across tracker
/// interactions. Derived from the UDP datagram's source address, never from
/// a claim embedded in the request body.
pub type PeerAddress = (IpAddr, u16);

/// A stable identifier handed out at registration, used by downloaders to
/// recognize themselves in a `GET_PEERS` seeder list without comparing
/// addresses (see the crate's design notes on self-identification).
pub type PeerId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerKind {
    Seeder,
    Leecher,
}

/// A single file a seeder advertises, as it claims it (the tracker never
/// validates or unifies conflicting advertisements of the same filename).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub filename: String,
    pub size: u64,
    pub checksum: String,
}

#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub username: String,
    pub kind: PeerKind,
    pub last_activity: Instant,
    pub files: Vec<FileEntry>,
    /// The TCP port this peer's server listens on, if it has one (seeders
    /// only — leechers serve nothing and are never looked up by
    /// `GET_PEERS`).
    pub tcp_port: Option<u16>,
}

/// One seeder's advertisement of a particular filename, as stored in the
/// file repository.
#[derive(Clone, Debug)]
pub struct SeederEntry {
    pub address: PeerAddress,
    pub peer_id: PeerId,
    /// The TCP port a downloader should actually connect to; distinct from
    /// `address.1`, which is only the UDP port the registration arrived
    /// from.
    pub tcp_port: u16,
    pub size: u64,
    pub checksum: String,
}

/// Errors shared across every mutating operation; `super::protocol` maps
/// each to the corresponding status-coded response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateError {
    /// The active set is already at `peer_limit`.
    AdmissionDenied,
    /// The requested username is held by a different, currently active
    /// address.
    DuplicateName,
    /// No active record exists for this address.
    NotFound,
}

/// The tracker's membership table and file index, guarded by a single lock
/// by the caller (see `super::Tracker`).
pub struct TrackerState {
    peer_limit: usize,
    peer_timeout: Duration,
    active_peers: HashMap<PeerAddress, PeerRecord>,
    file_repository: HashMap<String, Vec<SeederEntry>>,
}

impl TrackerState {
    pub fn new(peer_limit: usize, peer_timeout: Duration) -> Self {
        Self {
            peer_limit,
            peer_timeout,
            active_peers: HashMap::new(),
            file_repository: HashMap::new(),
        }
    }

    /// Registers `addr` under `username` with the given `kind` and file
    /// set, or idempotently rebinds an existing record at the same address
    /// with the same username. `tcp_port` is the port a downloader should
    /// connect to for this peer's files; required for seeders, ignored for
    /// leechers. Returns the peer's (possibly pre-existing) [`PeerId`].
    pub fn register(
        &mut self,
        addr: PeerAddress,
        username: String,
        kind: PeerKind,
        tcp_port: Option<u16>,
        files: Vec<FileEntry>,
    ) -> Result<PeerId, StateError> {
        let now = Instant::now();

        if let Some(existing) = self.active_peers.get(&addr) {
            if existing.username == username {
                let peer_id = existing.peer_id;
                self.remove_repository_entries(addr);
                self.insert_repository_entries(addr, peer_id, kind, tcp_port, &files);
                let record = self.active_peers.get_mut(&addr).unwrap();
                record.kind = kind;
                record.files = files;
                record.tcp_port = tcp_port;
                record.last_activity = now;
                return Ok(peer_id);
            }
        } else if self.active_peers.len() >= self.peer_limit {
            return Err(StateError::AdmissionDenied);
        }

        if self.username_taken_by_other(&username, addr) {
            return Err(StateError::DuplicateName);
        }

        let peer_id = self
            .active_peers
            .get(&addr)
            .map(|r| r.peer_id)
            .unwrap_or_else(rand::random);

        self.remove_repository_entries(addr);
        self.insert_repository_entries(addr, peer_id, kind, tcp_port, &files);
        self.active_peers.insert(
            addr,
            PeerRecord {
                peer_id,
                username,
                kind,
                last_activity: now,
                files,
                tcp_port,
            },
        );
        Ok(peer_id)
    }

    /// Replaces `addr`'s advertised file set. The peer's role (seeder vs.
    /// leecher) follows from whether the new set is non-empty.
    pub fn update_files(
        &mut self,
        addr: PeerAddress,
        tcp_port: Option<u16>,
        files: Vec<FileEntry>,
    ) -> Result<(), StateError> {
        let record = self
            .active_peers
            .get_mut(&addr)
            .ok_or(StateError::NotFound)?;
        let peer_id = record.peer_id;
        let kind = if files.is_empty() {
            PeerKind::Leecher
        } else {
            PeerKind::Seeder
        };
        record.kind = kind;
        record.files = files.clone();
        record.tcp_port = tcp_port;
        record.last_activity = Instant::now();

        self.remove_repository_entries(addr);
        self.insert_repository_entries(addr, peer_id, kind, tcp_port, &files);
        Ok(())
    }

    /// Renames `old` to `new` for the record at `addr`. Fails with
    /// `DuplicateName` if `new` is already held by a different address.
    pub fn change_username(
        &mut self,
        addr: PeerAddress,
        old: &str,
        new: String,
    ) -> Result<(), StateError> {
        if !self
            .active_peers
            .get(&addr)
            .map(|r| r.username == old)
            .unwrap_or(false)
        {
            return Err(StateError::NotFound);
        }
        if self.username_taken_by_other(&new, addr) {
            return Err(StateError::DuplicateName);
        }
        self.active_peers.get_mut(&addr).unwrap().username = new;
        Ok(())
    }

    /// Refreshes `addr`'s activity timestamp.
    pub fn keep_alive(&mut self, addr: PeerAddress) -> Result<(), StateError> {
        let record = self
            .active_peers
            .get_mut(&addr)
            .ok_or(StateError::NotFound)?;
        record.last_activity = Instant::now();
        Ok(())
    }

    /// Removes `addr` and every file repository entry it contributed.
    pub fn disconnect(&mut self, addr: PeerAddress) -> Result<(), StateError> {
        if self.active_peers.remove(&addr).is_none() {
            return Err(StateError::NotFound);
        }
        self.remove_repository_entries(addr);
        Ok(())
    }

    /// Returns `(seeders, leechers)` usernames of every active peer.
    pub fn list_active(&self) -> (Vec<String>, Vec<String>) {
        let mut seeders = Vec::new();
        let mut leechers = Vec::new();
        for record in self.active_peers.values() {
            match record.kind {
                PeerKind::Seeder => seeders.push(record.username.clone()),
                PeerKind::Leecher => leechers.push(record.username.clone()),
            }
        }
        (seeders, leechers)
    }

    /// Returns `{filename: size}` for every filename currently advertised
    /// by at least one seeder. When seeders disagree on size, the first
    /// entry encountered wins; the repository itself stores every claim.
    pub fn list_files(&self) -> HashMap<String, u64> {
        self.file_repository
            .iter()
            .filter_map(|(name, entries)| entries.first().map(|e| (name.clone(), e.size)))
            .collect()
    }

    /// Returns every seeder currently advertising `filename`, or `None` if
    /// no seeder does.
    pub fn get_peers(&self, filename: &str) -> Option<&[SeederEntry]> {
        self.file_repository
            .get(filename)
            .filter(|entries| !entries.is_empty())
            .map(Vec::as_slice)
    }

    /// Removes every peer whose `last_activity` is older than
    /// `peer_timeout` as of `now`, cascading removal of their repository
    /// entries. Returns the addresses removed.
    pub fn sweep(&mut self, now: Instant) -> Vec<PeerAddress> {
        let timeout = self.peer_timeout;
        let stale: Vec<PeerAddress> = self
            .active_peers
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_activity) > timeout)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &stale {
            self.active_peers.remove(addr);
            self.remove_repository_entries(*addr);
        }
        stale
    }

    fn username_taken_by_other(&self, username: &str, addr: PeerAddress) -> bool {
        self.active_peers
            .iter()
            .any(|(other_addr, record)| *other_addr != addr && record.username == username)
    }

    fn remove_repository_entries(&mut self, addr: PeerAddress) {
        self.file_repository.retain(|_, entries| {
            entries.retain(|e| e.address != addr);
            !entries.is_empty()
        });
    }

    fn insert_repository_entries(
        &mut self,
        addr: PeerAddress,
        peer_id: PeerId,
        kind: PeerKind,
        tcp_port: Option<u16>,
        files: &[FileEntry],
    ) {
        if kind != PeerKind::Seeder {
            return;
        }
        let tcp_port = tcp_port.unwrap_or(addr.1);
        for file in files {
            self.file_repository
                .entry(file.filename.clone())
                .or_insert_with(Vec::new)
                .push(SeederEntry {
                    address: addr,
                    peer_id,
                    tcp_port,
                    size: file.size,
                    checksum: file.checksum.clone(),
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> PeerAddress {
        (IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn file(name: &str) -> FileEntry {
        FileEntry {
            filename: name.to_string(),
            size: 100,
            checksum: "abc".into(),
        }
    }

    #[test]
    fn test_register_leecher_then_get_peers_empty() {
        let mut state = TrackerState::new(10, Duration::from_secs(30));
        state
            .register(addr(1), "alice".into(), PeerKind::Leecher, None, vec![])
            .unwrap();
        assert!(state.get_peers("missing.bin").is_none());
    }

    #[test]
    fn test_register_seeder_populates_repository() {
        let mut state = TrackerState::new(10, Duration::from_secs(30));
        state
            .register(addr(1), "alice".into(), PeerKind::Seeder, None, vec![file("f.bin")])
            .unwrap();
        let peers = state.get_peers("f.bin").unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address, addr(1));
    }

    #[test]
    fn test_username_collision_from_distinct_address_is_rejected() {
        let mut state = TrackerState::new(10, Duration::from_secs(30));
        state
            .register(addr(1), "alice".into(), PeerKind::Leecher, None, vec![])
            .unwrap();
        let result = state.register(addr(2), "alice".into(), PeerKind::Leecher, None, vec![]);
        assert_eq!(result, Err(StateError::DuplicateName));
    }

    #[test]
    fn test_reregistration_from_same_address_is_idempotent() {
        let mut state = TrackerState::new(10, Duration::from_secs(30));
        let first = state
            .register(addr(1), "alice".into(), PeerKind::Leecher, None, vec![])
            .unwrap();
        let second = state
            .register(addr(1), "alice".into(), PeerKind::Leecher, None, vec![])
            .unwrap();
        assert_eq!(first, second);
        let (_, leechers) = state.list_active();
        assert_eq!(leechers.len(), 1);
    }

    #[test]
    fn test_admission_denied_past_peer_limit() {
        let mut state = TrackerState::new(2, Duration::from_secs(30));
        state
            .register(addr(1), "a".into(), PeerKind::Leecher, None, vec![])
            .unwrap();
        state
            .register(addr(2), "b".into(), PeerKind::Leecher, None, vec![])
            .unwrap();
        let result = state.register(addr(3), "c".into(), PeerKind::Leecher, None, vec![]);
        assert_eq!(result, Err(StateError::AdmissionDenied));
    }

    #[test]
    fn test_update_files_replaces_repository_entries() {
        let mut state = TrackerState::new(10, Duration::from_secs(30));
        state
            .register(
                addr(1),
                "alice".into(),
                PeerKind::Seeder,
                None,
                vec![file("f1.bin"), file("f2.bin")],
            )
            .unwrap();
        state.update_files(addr(1), None, vec![file("f1.bin")]).unwrap();
        assert!(state.get_peers("f2.bin").is_none());
        assert!(state.get_peers("f1.bin").is_some());
    }

    #[test]
    fn test_update_files_is_idempotent() {
        let mut state = TrackerState::new(10, Duration::from_secs(30));
        state
            .register(addr(1), "alice".into(), PeerKind::Seeder, None, vec![file("f1.bin")])
            .unwrap();
        state.update_files(addr(1), None, vec![file("f1.bin")]).unwrap();
        state.update_files(addr(1), None, vec![file("f1.bin")]).unwrap();
        assert_eq!(state.get_peers("f1.bin").unwrap().len(), 1);
    }

    #[test]
    fn test_disconnect_removes_peer_and_repository_entries() {
        let mut state = TrackerState::new(10, Duration::from_secs(30));
        state
            .register(addr(1), "alice".into(), PeerKind::Seeder, None, vec![file("f.bin")])
            .unwrap();
        state.disconnect(addr(1)).unwrap();
        let (seeders, _) = state.list_active();
        assert!(seeders.is_empty());
        assert!(state.get_peers("f.bin").is_none());
    }

    #[test]
    fn test_register_disconnect_register_yields_single_record() {
        let mut state = TrackerState::new(10, Duration::from_secs(30));
        state
            .register(addr(1), "alice".into(), PeerKind::Leecher, None, vec![])
            .unwrap();
        state.disconnect(addr(1)).unwrap();
        state
            .register(addr(1), "alice".into(), PeerKind::Leecher, None, vec![])
            .unwrap();
        let (_, leechers) = state.list_active();
        assert_eq!(leechers.len(), 1);
    }

    #[test]
    fn test_sweep_removes_only_stale_peers() {
        let mut state = TrackerState::new(10, Duration::from_millis(10));
        state
            .register(addr(1), "alice".into(), PeerKind::Seeder, None, vec![file("f.bin")])
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let removed = state.sweep(Instant::now());
        assert_eq!(removed, vec![addr(1)]);
        assert!(state.get_peers("f.bin").is_none());
    }

    #[test]
    fn test_keep_alive_twice_creates_no_new_record() {
        let mut state = TrackerState::new(10, Duration::from_secs(30));
        state
            .register(addr(1), "alice".into(), PeerKind::Leecher, None, vec![])
            .unwrap();
        state.keep_alive(addr(1)).unwrap();
        state.keep_alive(addr(1)).unwrap();
        let (_, leechers) = state.list_active();
        assert_eq!(leechers.len(), 1);
    }

    #[test]
    fn test_change_username_rejects_collision() {
        let mut state = TrackerState::new(10, Duration::from_secs(30));
        state
            .register(addr(1), "alice".into(), PeerKind::Leecher, None, vec![])
            .unwrap();
        state
            .register(addr(2), "bob".into(), PeerKind::Leecher, None, vec![])
            .unwrap();
        let result = state.change_username(addr(2), "bob", "alice".into());
        assert_eq!(result, Err(StateError::DuplicateName));
    }
}
