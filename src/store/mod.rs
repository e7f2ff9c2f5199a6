//! The chunk store: an actor task owning the authoritative view of which
//! files this peer can serve, backed by a JSON sidecar in the shared
//! directory.
//!
//! Structured like the teacher's `disk` actor: a single task owns all
//! mutable state and is reached only through an `mpsc` command channel, so
//! no other task ever touches the shared directory's index directly. Unlike
//! the teacher's fire-and-forget `Disk` (which alerts a separate channel),
//! most chunk-store operations need a value back, so each command carries
//! its own `oneshot` reply channel.

mod persistence;

use std::{collections::HashMap, path::PathBuf};

use tokio::sync::{mpsc, oneshot};

use crate::{
    chunk::{self, FileMetadata},
    conf::StoreConf,
    error::{Error, Result},
};

/// Filenames that were added, changed, or removed by a scan or reconcile
/// pass, used by the peer lifecycle to decide whether to push `UPDATE_FILES`
/// to the tracker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
}

/// A handle to a running [`Store`] actor. Cheaply cloneable; every clone
/// shares the same underlying task.
#[derive(Clone)]
pub struct StoreHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

enum Command {
    Scan(oneshot::Sender<Result<ScanReport>>),
    Reconcile(oneshot::Sender<Result<Vec<String>>>),
    GetMetadata(String, oneshot::Sender<Result<FileMetadata>>),
    ReadChunk(String, usize, oneshot::Sender<Result<Vec<u8>>>),
    Add(String, PathBuf, oneshot::Sender<Result<FileMetadata>>),
    ListFiles(oneshot::Sender<HashMap<String, u64>>),
    ListAll(oneshot::Sender<HashMap<String, FileMetadata>>),
    Shutdown,
}

impl StoreHandle {
    /// Rescans the shared directory: every file that is new or whose
    /// content digest no longer matches the index is (re)chunked and
    /// hashed. Never removes entries for files that disappeared; see
    /// [`StoreHandle::reconcile`] for that.
    pub async fn scan(&self) -> Result<ScanReport> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Scan(tx))
            .map_err(|_| Error::TrackerUnreachable)?;
        rx.await.map_err(|_| Error::TrackerUnreachable)?
    }

    /// Removes index entries whose backing file no longer exists, returning
    /// the filenames that were dropped.
    pub async fn reconcile(&self) -> Result<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Reconcile(tx))
            .map_err(|_| Error::TrackerUnreachable)?;
        rx.await.map_err(|_| Error::TrackerUnreachable)?
    }

    /// Returns the stored metadata for `filename`, or `NotFound`.
    pub async fn get_metadata(
        &self,
        filename: impl Into<String>,
    ) -> Result<FileMetadata> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::GetMetadata(filename.into(), tx))
            .map_err(|_| Error::TrackerUnreachable)?;
        rx.await.map_err(|_| Error::TrackerUnreachable)?
    }

    /// Returns the exact bytes of chunk `id` of `filename`.
    ///
    /// The offset is the prefix sum of prior chunk sizes, not `id *
    /// chunk_len`. The read bytes are re-hashed and a warning is logged on
    /// mismatch, but the bytes are still returned: end-to-end integrity is
    /// the requester's job, since it verifies the whole-file digest.
    pub async fn read_chunk(
        &self,
        filename: impl Into<String>,
        id: usize,
    ) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ReadChunk(filename.into(), id, tx))
            .map_err(|_| Error::TrackerUnreachable)?;
        rx.await.map_err(|_| Error::TrackerUnreachable)?
    }

    /// Copies `source_path` into the shared directory as `filename` (if it
    /// isn't already there), (re)computes its metadata, and persists the
    /// index. Used to promote a freshly downloaded file into the store when
    /// the caller opts to re-seed it.
    pub async fn add(
        &self,
        filename: impl Into<String>,
        source_path: impl Into<PathBuf>,
    ) -> Result<FileMetadata> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Add(filename.into(), source_path.into(), tx))
            .map_err(|_| Error::TrackerUnreachable)?;
        rx.await.map_err(|_| Error::TrackerUnreachable)?
    }

    /// Returns `{filename: size}` for every file currently indexed: the
    /// shape the tracker's `LIST_FILES`/`REGISTER seeder`/`UPDATE_FILES`
    /// payloads need.
    pub async fn list_files(&self) -> HashMap<String, u64> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::ListFiles(tx)).is_err() {
            return HashMap::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Returns the full metadata of every file currently indexed. Used to
    /// build `REGISTER`/`UPDATE_FILES` payloads, which need each file's
    /// checksum and not just its size.
    pub async fn list_all(&self) -> HashMap<String, FileMetadata> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::ListAll(tx)).is_err() {
            return HashMap::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Signals the store task to stop after draining its command queue.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

/// The chunk store actor. Created with [`Store::new`] and driven to
/// completion with [`Store::run`], typically spawned onto the runtime by the
/// peer's engine facade.
pub struct Store {
    shared_dir: PathBuf,
    chunk_len: u64,
    files: HashMap<String, FileMetadata>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
}

impl Store {
    /// Creates a new store over `conf.shared_dir`, loading any existing
    /// sidecar (tolerating its absence).
    pub fn new(conf: &StoreConf) -> (Self, StoreHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let files = persistence::load(&conf.shared_dir).unwrap_or_else(|e| {
            log::warn!(
                "Failed to load chunk store sidecar in {:?}: {}; starting empty",
                conf.shared_dir,
                e
            );
            HashMap::new()
        });
        (
            Self {
                shared_dir: conf.shared_dir.clone(),
                chunk_len: conf.chunk_len,
                files,
                cmd_rx,
            },
            StoreHandle { cmd_tx },
        )
    }

    /// Runs the store's command loop until [`StoreHandle::shutdown`] is
    /// called or every handle is dropped.
    pub async fn run(mut self) {
        log::info!("Starting chunk store event loop for {:?}", self.shared_dir);
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Scan(reply) => {
                    let result = self.scan().await;
                    let _ = reply.send(result);
                }
                Command::Reconcile(reply) => {
                    let result = self.reconcile();
                    let _ = reply.send(result);
                }
                Command::GetMetadata(filename, reply) => {
                    let result =
                        self.files.get(&filename).cloned().ok_or(Error::NotFound);
                    let _ = reply.send(result);
                }
                Command::ReadChunk(filename, id, reply) => {
                    let result = self.read_chunk(&filename, id).await;
                    let _ = reply.send(result);
                }
                Command::Add(filename, source_path, reply) => {
                    let result = self.add(&filename, &source_path).await;
                    let _ = reply.send(result);
                }
                Command::ListFiles(reply) => {
                    let sizes = self
                        .files
                        .iter()
                        .map(|(name, meta)| (name.clone(), meta.size))
                        .collect();
                    let _ = reply.send(sizes);
                }
                Command::ListAll(reply) => {
                    let _ = reply.send(self.files.clone());
                }
                Command::Shutdown => {
                    log::info!("Shutting down chunk store event loop");
                    break;
                }
            }
        }
    }

    async fn scan(&mut self) -> Result<ScanReport> {
        log::debug!("Scanning shared directory {:?}", self.shared_dir);
        let shared_dir = self.shared_dir.clone();
        let entries = tokio::task::spawn_blocking(move || list_regular_files(&shared_dir))
            .await
            .map_err(|_| Error::ProtocolViolation("scan task panicked".into()))??;

        let mut report = ScanReport::default();
        for filename in entries {
            let path = self.shared_dir.join(&filename);
            let chunk_len = self.chunk_len;
            let metadata =
                tokio::task::spawn_blocking(move || chunk::compute_metadata(&path, chunk_len))
                    .await
                    .map_err(|_| Error::ProtocolViolation("hash task panicked".into()))??;

            match self.files.get(&filename) {
                None => {
                    log::info!("Adding new file {} to chunk store", filename);
                    self.files.insert(filename.clone(), metadata);
                    report.added.push(filename);
                }
                Some(existing) if existing.checksum != metadata.checksum => {
                    log::info!("Updating modified file {} in chunk store", filename);
                    self.files.insert(filename.clone(), metadata);
                    report.updated.push(filename);
                }
                Some(_) => {}
            }
        }

        if !report.added.is_empty() || !report.updated.is_empty() {
            self.persist()?;
        }
        Ok(report)
    }

    fn reconcile(&mut self) -> Result<Vec<String>> {
        let shared_dir = &self.shared_dir;
        let mut removed = Vec::new();
        self.files.retain(|filename, _| {
            let exists = shared_dir.join(filename).is_file();
            if !exists {
                log::info!("Removing vanished file {} from chunk store", filename);
                removed.push(filename.clone());
            }
            exists
        });
        if !removed.is_empty() {
            self.persist()?;
        }
        Ok(removed)
    }

    async fn read_chunk(&self, filename: &str, id: usize) -> Result<Vec<u8>> {
        let metadata = self.files.get(filename).ok_or(Error::NotFound)?;
        let offset = metadata.chunk_offset(id)?;
        let len = metadata.chunk_len(id)?;
        let expected_checksum = metadata.chunks[id].checksum.clone();
        let path = self.shared_dir.join(filename);

        let (data, actual_checksum) = tokio::task::spawn_blocking(move || {
            use std::io::{Read, Seek, SeekFrom};
            let mut file = std::fs::File::open(&path)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; len as usize];
            file.read_exact(&mut buf)?;
            let checksum = chunk::hash_hex(&buf);
            Ok::<_, Error>((buf, checksum))
        })
        .await
        .map_err(|_| Error::ProtocolViolation("read task panicked".into()))??;

        if actual_checksum != expected_checksum {
            log::warn!(
                "Chunk {} of {} on disk does not match stored checksum \
                 (expected {}, got {}); returning anyway, requester will \
                 verify end-to-end",
                id,
                filename,
                expected_checksum,
                actual_checksum
            );
        }
        Ok(data)
    }

    async fn add(&mut self, filename: &str, source_path: &PathBuf) -> Result<FileMetadata> {
        let dest = self.shared_dir.join(filename);
        if dest != *source_path {
            tokio::fs::copy(source_path, &dest).await?;
        }

        let chunk_len = self.chunk_len;
        let dest_for_hash = dest.clone();
        let metadata =
            tokio::task::spawn_blocking(move || chunk::compute_metadata(&dest_for_hash, chunk_len))
                .await
                .map_err(|_| Error::ProtocolViolation("hash task panicked".into()))??;

        self.files.insert(filename.to_string(), metadata.clone());
        self.persist()?;
        Ok(metadata)
    }

    fn persist(&self) -> Result<()> {
        persistence::save(&self.shared_dir, &self.files)
    }
}

/// Lists the names of regular files directly under `dir`, excluding the
/// sidecar itself and its crash-leftover temp file (a `save` that died
/// between the write and the rename can leave the `.tmp` behind; it must
/// never be indexed and advertised as a shareable file).
fn list_regular_files(dir: &std::path::Path) -> Result<Vec<String>> {
    std::fs::create_dir_all(dir)?;
    let tmp_name = persistence::sidecar_tmp_filename();
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name.to_string(),
            None => continue,
        };
        if name == persistence::SIDECAR_FILENAME || name == tmp_name {
            continue;
        }
        names.push(name);
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn spawn_store(conf: &StoreConf) -> StoreHandle {
        let (store, handle) = Store::new(conf);
        tokio::spawn(store.run());
        handle
    }

    #[tokio::test]
    async fn test_scan_adds_new_files_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = StoreConf::new(dir.path());
        conf.chunk_len = 16;
        std::fs::write(dir.path().join("a.txt"), b"hello world, this is chunked").unwrap();

        let handle = spawn_store(&conf);
        let report = handle.scan().await.unwrap();
        assert_eq!(report.added, vec!["a.txt".to_string()]);
        assert!(report.updated.is_empty());

        let metadata = handle.get_metadata("a.txt").await.unwrap();
        assert_eq!(metadata.size, 29);
        assert_eq!(metadata.chunks.len(), 2);

        let sidecar = dir.path().join("shared_files.json");
        assert!(sidecar.is_file());
    }

    #[tokio::test]
    async fn test_scan_is_idempotent_for_unmodified_files() {
        let dir = tempfile::tempdir().unwrap();
        let conf = StoreConf::new(dir.path());
        std::fs::write(dir.path().join("a.txt"), b"unchanging content").unwrap();

        let handle = spawn_store(&conf);
        let first = handle.scan().await.unwrap();
        assert_eq!(first.added.len(), 1);

        let second = handle.scan().await.unwrap();
        assert!(second.added.is_empty());
        assert!(second.updated.is_empty());
    }

    #[tokio::test]
    async fn test_scan_detects_modified_file() {
        let dir = tempfile::tempdir().unwrap();
        let conf = StoreConf::new(dir.path());
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"version one").unwrap();

        let handle = spawn_store(&conf);
        handle.scan().await.unwrap();

        std::fs::write(&path, b"version two, longer").unwrap();
        let report = handle.scan().await.unwrap();
        assert_eq!(report.updated, vec!["a.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_reconcile_removes_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        let conf = StoreConf::new(dir.path());
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"to be deleted").unwrap();

        let handle = spawn_store(&conf);
        handle.scan().await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let removed = handle.reconcile().await.unwrap();
        assert_eq!(removed, vec!["a.txt".to_string()]);
        assert!(handle.get_metadata("a.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_read_chunk_returns_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = StoreConf::new(dir.path());
        conf.chunk_len = 8;
        let data = b"0123456789abcdef0123";
        std::fs::write(dir.path().join("a.bin"), data).unwrap();

        let handle = spawn_store(&conf);
        handle.scan().await.unwrap();

        let chunk0 = handle.read_chunk("a.bin", 0).await.unwrap();
        assert_eq!(chunk0, b"01234567");
        let chunk2 = handle.read_chunk("a.bin", 2).await.unwrap();
        assert_eq!(chunk2, b"01"); // last, short chunk
    }

    #[tokio::test]
    async fn test_add_copies_and_indexes_file() {
        let shared_dir = tempfile::tempdir().unwrap();
        let conf = StoreConf::new(shared_dir.path());
        let handle = spawn_store(&conf);

        let source_dir = tempfile::tempdir().unwrap();
        let source_path = source_dir.path().join("downloaded.bin");
        let mut f = std::fs::File::create(&source_path).unwrap();
        f.write_all(b"downloaded content").unwrap();
        drop(f);

        let metadata = handle.add("downloaded.bin", &source_path).await.unwrap();
        assert_eq!(metadata.size, 19);
        assert!(shared_dir.path().join("downloaded.bin").is_file());
    }
}
