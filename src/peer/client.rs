//! The peer client (downloader): given a filename, obtains the seeder set
//! from the tracker and pulls the file's chunks in parallel from as many of
//! them as are available, verifying integrity end to end.
//!
//! Structured after the teacher's piece-download machinery (`PeerSession` +
//! `PieceDownload` + `PiecePicker`) but collapsed to this protocol's
//! simpler shape: there is no choking/interest exchange and no shared
//! rarest-first piece picker, since every chunk of the target file is
//! wanted and every seeder is assumed to have the whole file. What carries
//! over is the division of labor between several concurrent workers
//! pulling from a shared work queue, each bound to one peer connection for
//! its lifetime.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use crate::{
    chunk::{self, FileMetadata},
    conf::Conf,
    error::{Error, Result},
    peer::{
        availability::{Availability, SeederKey},
        codec::{CHUNK_NOT_FOUND, FILE_NOT_FOUND, METADATA_NOT_AVAILABLE},
        tracker_client::{PeerListing, SeederListing, TrackerClient},
    },
    tracker::state::PeerId,
};

/// An upper bound on how many times a worker will requeue a chunk because
/// its bound seeder was (still) marked unavailable before giving up on that
/// seeder's share of the work.
const MAX_IDLE_SPINS: u32 = 20;

/// A filtered, ordered candidate list built from a `GET_PEERS` response:
/// self-excluded, deduplicated by connect address.
#[derive(Clone, Debug)]
struct Candidate {
    addr: SocketAddr,
    key: SeederKey,
}

/// Pulls `filename` from the swarm. One instance is created per peer and
/// reused across downloads; it owns the per-peer download lock that
/// serializes concurrent calls to [`Downloader::download`].
pub struct Downloader {
    conf: Conf,
    own_peer_id: PeerId,
    availability: Arc<Availability>,
    tracker: Arc<TrackerClient>,
    download_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Downloader {
    pub fn new(
        conf: Conf,
        own_peer_id: PeerId,
        availability: Arc<Availability>,
        tracker: Arc<TrackerClient>,
    ) -> Self {
        Self {
            conf,
            own_peer_id,
            availability,
            tracker,
            download_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Downloads `filename`, returning the path of the verified output file
    /// and the metadata it was downloaded against.
    ///
    /// Holds the per-peer download lock for the entire call: a second
    /// concurrent call blocks until this one finishes. This is inherited
    /// from the source rather than chosen for its own sake; per-filename
    /// locking would allow concurrent downloads of distinct files.
    pub async fn download(&self, filename: &str) -> Result<(PathBuf, FileMetadata)> {
        let _guard = self.download_lock.lock().await;

        let listing = self.tracker.get_peers(filename).await?;
        let candidates = self.filter_candidates(&listing)?;
        if candidates.is_empty() {
            return Err(Error::NoSeeders);
        }
        for candidate in &candidates {
            self.availability.note_seen(candidate.key);
        }

        let metadata = self.fetch_metadata(filename, &candidates).await?;
        log::info!(
            "Downloading {} ({} bytes, {} chunks) from {} candidate seeder(s)",
            filename,
            metadata.size,
            metadata.chunks.len(),
            candidates.len()
        );

        let tmp_dir = self.conf.peer.download_dir.join(".tmp").join(filename);
        tokio::fs::create_dir_all(&tmp_dir).await?;

        let completed = self.run_workers(filename, &metadata, &candidates, &tmp_dir).await?;
        if completed.len() != metadata.chunks.len() {
            return Err(Error::Incomplete);
        }

        let output_path = self
            .reassemble(filename, &metadata, &completed, &tmp_dir)
            .await?;

        let actual_checksum = {
            let output_path = output_path.clone();
            tokio::task::spawn_blocking(move || chunk::hash_file(&output_path))
                .await
                .map_err(|_| Error::ProtocolViolation("verification task panicked".into()))??
        };
        if actual_checksum != metadata.checksum {
            log::warn!(
                "Downloaded {} failed whole-file verification (expected {}, got {})",
                filename,
                metadata.checksum,
                actual_checksum
            );
            return Err(Error::IntegrityFailure);
        }

        Ok((output_path, metadata))
    }

    /// Filters a `GET_PEERS` response down to candidate seeders, excluding
    /// ourselves by comparing `PeerId`s rather than addresses (see the
    /// crate's design notes on why the address heuristic is avoided).
    fn filter_candidates(&self, listing: &PeerListing) -> Result<Vec<Candidate>> {
        let mut seen = std::collections::HashSet::new();
        let mut candidates = Vec::new();
        for seeder in &listing.seeders {
            if seeder.peer_id == self.own_peer_id {
                continue;
            }
            let addr = seeder_addr(seeder)?;
            if seen.insert(addr) {
                candidates.push(Candidate { addr, key: addr });
            }
        }
        Ok(candidates)
    }

    /// Tries each available candidate in order until one successfully
    /// serves `REQUEST_METADATA`.
    async fn fetch_metadata(
        &self,
        filename: &str,
        candidates: &[Candidate],
    ) -> Result<FileMetadata> {
        for candidate in candidates {
            if !self.availability.is_available(candidate.key) {
                continue;
            }
            match fetch_metadata(
                candidate.addr,
                filename,
                self.conf.peer.connect_timeout,
                self.conf.peer.read_timeout,
            )
            .await
            {
                Ok(metadata) => return Ok(metadata),
                Err(e) => {
                    log::warn!(
                        "Seeder {} failed to serve metadata for {}: {}",
                        candidate.addr,
                        filename,
                        e
                    );
                    self.availability.mark_unavailable(candidate.key);
                }
            }
        }
        Err(Error::NoMetadata)
    }

    /// Spawns `W` workers, each bound to one candidate seeder, to drain a
    /// shared FIFO queue of chunk ids. Returns once the queue is empty and
    /// every worker has exited.
    async fn run_workers(
        &self,
        filename: &str,
        metadata: &FileMetadata,
        candidates: &[Candidate],
        tmp_dir: &Path,
    ) -> Result<HashMap<usize, PathBuf>> {
        let total_chunks = metadata.chunks.len();
        let queue = Arc::new(Mutex::new(
            (0..total_chunks).collect::<VecDeque<usize>>(),
        ));
        let completed = Arc::new(Mutex::new(HashMap::new()));

        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let desired = (2 * cores).max(self.conf.peer.min_worker_count);
        let worker_count = desired.min(candidates.len()).max(1);
        log::debug!(
            "Spawning {} download worker(s) for {} across {} candidate(s)",
            worker_count,
            filename,
            candidates.len()
        );

        let mut handles = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let candidate = candidates[i % candidates.len()].clone();
            let queue = Arc::clone(&queue);
            let completed = Arc::clone(&completed);
            let availability = Arc::clone(&self.availability);
            let filename = filename.to_string();
            let metadata = metadata.clone();
            let tmp_dir = tmp_dir.to_path_buf();
            let connect_timeout = self.conf.peer.connect_timeout;
            let read_timeout = self.conf.peer.read_timeout;

            handles.push(tokio::spawn(async move {
                worker_loop(
                    candidate,
                    queue,
                    completed,
                    total_chunks,
                    availability,
                    filename,
                    metadata,
                    tmp_dir,
                    connect_timeout,
                    read_timeout,
                )
                .await
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        let completed = Arc::try_unwrap(completed)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_else(|arc| arc.lock().unwrap().clone());
        Ok(completed)
    }

    /// Copies each chunk's temp file into the output file in ascending
    /// chunk-id order (workers may have completed them out of order), then
    /// removes the temp directory.
    async fn reassemble(
        &self,
        filename: &str,
        metadata: &FileMetadata,
        completed: &HashMap<usize, PathBuf>,
        tmp_dir: &Path,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.conf.peer.download_dir).await?;
        let output_path = self.conf.peer.download_dir.join(filename);
        let mut output = tokio::fs::File::create(&output_path).await?;

        for chunk in &metadata.chunks {
            let part_path = completed.get(&chunk.id).ok_or(Error::Incomplete)?;
            let bytes = tokio::fs::read(part_path).await?;
            output.write_all(&bytes).await?;
        }
        output.flush().await?;

        let _ = tokio::fs::remove_dir_all(tmp_dir).await;
        Ok(output_path)
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    candidate: Candidate,
    queue: Arc<Mutex<VecDeque<usize>>>,
    completed: Arc<Mutex<HashMap<usize, PathBuf>>>,
    total_chunks: usize,
    availability: Arc<Availability>,
    filename: String,
    metadata: FileMetadata,
    tmp_dir: PathBuf,
    connect_timeout: Duration,
    read_timeout: Duration,
) {
    let mut idle_spins = 0u32;
    loop {
        let id = match queue.lock().unwrap().pop_front() {
            Some(id) => id,
            None => {
                // The queue can run dry while another worker still holds a
                // chunk it is about to fail and requeue; exiting here would
                // strand that chunk on a single (possibly dead) seeder. Stay
                // alive and keep checking as long as chunks remain unclaimed.
                if completed.lock().unwrap().len() >= total_chunks {
                    break;
                }
                idle_spins += 1;
                if idle_spins > MAX_IDLE_SPINS {
                    log::warn!(
                        "Worker bound to {} giving up waiting for outstanding work after {} idle spins",
                        candidate.addr,
                        idle_spins
                    );
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        if !availability.is_available(candidate.key) {
            queue.lock().unwrap().push_back(id);
            idle_spins += 1;
            if idle_spins > MAX_IDLE_SPINS {
                log::warn!(
                    "Worker bound to {} giving up after {} idle spins",
                    candidate.addr,
                    idle_spins
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            continue;
        }
        idle_spins = 0;

        let expected_len = match metadata.chunk_len(id) {
            Ok(len) => len,
            Err(_) => continue,
        };
        match fetch_chunk(candidate.addr, &filename, id, expected_len, connect_timeout, read_timeout)
            .await
        {
            Ok(bytes) => {
                let part_path = tmp_dir.join(format!("{}.part{}", filename, id));
                if let Err(e) = tokio::fs::write(&part_path, &bytes).await {
                    log::warn!("Failed to write chunk {} of {} to disk: {}", id, filename, e);
                    queue.lock().unwrap().push_back(id);
                    continue;
                }
                completed.lock().unwrap().insert(id, part_path);
            }
            Err(e) => {
                log::warn!(
                    "Failed to fetch chunk {} of {} from {}: {}",
                    id,
                    filename,
                    candidate.addr,
                    e
                );
                availability.mark_unavailable(candidate.key);
                queue.lock().unwrap().push_back(id);
            }
        }
    }
}

/// Connects to `addr` and issues `REQUEST_METADATA`, accumulating bytes
/// until a complete JSON value parses (there is no length prefix on the
/// wire).
async fn fetch_metadata(
    addr: SocketAddr,
    filename: &str,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<FileMetadata> {
    let mut stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Timeout)??;
    stream
        .write_all(format!("REQUEST_METADATA {}\n", filename).as_bytes())
        .await?;

    let mut buf = Vec::new();
    let mut read_buf = [0u8; 8192];
    loop {
        let n = timeout(read_timeout, stream.read(&mut read_buf))
            .await
            .map_err(|_| Error::Timeout)??;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&read_buf[..n]);

        if buf == FILE_NOT_FOUND {
            return Err(Error::NotFound);
        }
        if buf == METADATA_NOT_AVAILABLE {
            return Err(Error::Unavailable);
        }
        if let Ok(metadata) = serde_json::from_slice::<FileMetadata>(&buf) {
            return Ok(metadata);
        }
    }
    Err(Error::ProtocolViolation(
        "metadata response ended before a complete JSON value parsed".into(),
    ))
}

/// Connects to `addr` and issues `REQUEST_CHUNK`, reading exactly
/// `expected_len` bytes. Rejects (does not return) any response that is
/// short, over-long, or begins with the `CHUNK_NOT_FOUND` sentinel — a
/// partial chunk is never accepted, even on a timeout.
async fn fetch_chunk(
    addr: SocketAddr,
    filename: &str,
    id: usize,
    expected_len: u64,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Vec<u8>> {
    let mut stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Timeout)??;
    stream
        .write_all(format!("REQUEST_CHUNK {} {}\n", filename, id).as_bytes())
        .await?;

    let mut buf = Vec::with_capacity(expected_len as usize);
    let mut read_buf = [0u8; 64 * 1024];
    loop {
        let n = timeout(read_timeout, stream.read(&mut read_buf))
            .await
            .map_err(|_| Error::Timeout)??;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&read_buf[..n]);

        if buf.len() >= CHUNK_NOT_FOUND.len() && buf.starts_with(CHUNK_NOT_FOUND) {
            return Err(Error::NotFound);
        }
        if buf.len() as u64 > expected_len {
            return Err(Error::ProtocolViolation(format!(
                "chunk {} response exceeded advertised size",
                id
            )));
        }
        if buf.len() as u64 == expected_len {
            break;
        }
    }

    if buf.len() as u64 != expected_len {
        return Err(Error::IntegrityFailure);
    }
    Ok(buf)
}

fn seeder_addr(seeder: &SeederListing) -> Result<SocketAddr> {
    let ip: std::net::IpAddr = seeder.host.parse().map_err(|_| {
        Error::ProtocolViolation(format!(
            "tracker returned an unparseable seeder host {}",
            seeder.host
        ))
    })?;
    Ok(SocketAddr::new(ip, seeder.tcp_port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::PeerConf;

    fn listing_with(seeders: Vec<SeederListing>) -> PeerListing {
        PeerListing {
            filename: "f.bin".into(),
            size: 10,
            checksum: "abc".into(),
            seeders,
        }
    }

    async fn make_downloader(own_peer_id: PeerId) -> Downloader {
        let conf = Conf::new(
            std::net::IpAddr::from([127, 0, 0, 1]),
            0,
            std::env::temp_dir(),
            std::env::temp_dir(),
        );
        let tracker = Arc::new(TrackerClient::connect(&conf.tracker_client).await.unwrap());
        Downloader::new(conf, own_peer_id, Arc::new(Availability::new()), tracker)
    }

    #[tokio::test]
    async fn test_filter_candidates_excludes_self_by_peer_id() {
        let downloader = make_downloader(42).await;
        let listing = listing_with(vec![
            SeederListing { host: "127.0.0.1".into(), tcp_port: 9001, peer_id: 42 },
            SeederListing { host: "127.0.0.1".into(), tcp_port: 9002, peer_id: 7 },
        ]);
        let candidates = downloader.filter_candidates(&listing).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].addr.port(), 9002);
    }

    #[tokio::test]
    async fn test_filter_candidates_self_only_is_empty() {
        let downloader = make_downloader(42).await;
        let listing = listing_with(vec![SeederListing {
            host: "127.0.0.1".into(),
            tcp_port: 9001,
            peer_id: 42,
        }]);
        assert!(downloader.filter_candidates(&listing).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filter_candidates_dedupes_by_address() {
        let downloader = make_downloader(1).await;
        let listing = listing_with(vec![
            SeederListing { host: "127.0.0.1".into(), tcp_port: 9001, peer_id: 2 },
            SeederListing { host: "127.0.0.1".into(), tcp_port: 9001, peer_id: 2 },
        ]);
        assert_eq!(downloader.filter_candidates(&listing).unwrap().len(), 1);
    }

    #[allow(dead_code)]
    fn assert_peer_conf_fields_used(_: &PeerConf) {}
}
