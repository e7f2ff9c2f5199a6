//! The downloader's local, advisory belief about which seeders are
//! reachable.
//!
//! Shared (behind an `Arc`) across the keep-alive/recovery lifecycle tasks
//! and the download path, mirroring the teacher's `Arc<RwLock<PiecePicker>>`
//! shape for state that several independent tasks touch concurrently but
//! never hold across an `.await` — critical sections here are a single
//! hashmap lookup or insert, so a plain `std::sync::Mutex` is enough.

use std::{collections::HashMap, net::SocketAddr, sync::Mutex};

/// Identifies a seeder by the address a downloader actually connects to
/// (its TCP server), not by the UDP address it registered from.
pub type SeederKey = SocketAddr;

/// `PeerAddress -> bool`; a seeder defaults to available the first time it
/// is seen, flips to unavailable on any failed request, and flips back only
/// after a successful probe.
#[derive(Default)]
pub struct Availability {
    state: Mutex<HashMap<SeederKey, bool>>,
}

impl Availability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key` as available if it hasn't been seen before. Does not
    /// override an existing unavailable entry.
    pub fn note_seen(&self, key: SeederKey) {
        self.state.lock().unwrap().entry(key).or_insert(true);
    }

    /// Returns whether `key` is currently believed reachable. A seeder that
    /// has never been seen is optimistically available.
    pub fn is_available(&self, key: SeederKey) -> bool {
        *self.state.lock().unwrap().get(&key).unwrap_or(&true)
    }

    pub fn mark_unavailable(&self, key: SeederKey) {
        self.state.lock().unwrap().insert(key, false);
        log::debug!("Marked seeder {} unavailable", key);
    }

    pub fn mark_available(&self, key: SeederKey) {
        self.state.lock().unwrap().insert(key, true);
        log::debug!("Marked seeder {} available", key);
    }

    /// Returns every key currently marked unavailable, for the recovery
    /// task to re-probe.
    pub fn unavailable_keys(&self) -> Vec<SeederKey> {
        self.state
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, available)| !**available)
            .map(|(key, _)| *key)
            .collect()
    }
}
