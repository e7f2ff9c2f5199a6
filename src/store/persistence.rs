//! Atomic JSON sidecar persistence for the chunk store's index.
//!
//! The sidecar lives alongside the shared files themselves, written with a
//! temp-file-plus-rename so a crash mid-write never leaves a torn index
//! behind (the rename is the only operation that can observably "complete").

use std::{collections::HashMap, path::Path};

use serde::{Deserialize, Serialize};

use crate::{chunk::FileMetadata, error::Result};

pub const SIDECAR_FILENAME: &str = "shared_files.json";

/// The temp file `save` writes before the atomic rename. A crash between the
/// write and the rename can leave this behind; scans must skip it the same
/// way they skip the sidecar itself.
pub fn sidecar_tmp_filename() -> String {
    format!("{}.tmp", SIDECAR_FILENAME)
}

#[derive(Serialize, Deserialize)]
struct Sidecar {
    files: HashMap<String, FileMetadata>,
}

/// Loads the sidecar from `shared_dir`, returning an empty index if it
/// doesn't exist yet.
pub fn load(shared_dir: &Path) -> Result<HashMap<String, FileMetadata>> {
    let path = shared_dir.join(SIDECAR_FILENAME);
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    let contents = std::fs::read_to_string(&path)?;
    let sidecar: Sidecar = serde_json::from_str(&contents)?;
    Ok(sidecar.files)
}

/// Writes `files` to `shared_dir`'s sidecar, atomically.
pub fn save(shared_dir: &Path, files: &HashMap<String, FileMetadata>) -> Result<()> {
    std::fs::create_dir_all(shared_dir)?;
    let sidecar = Sidecar {
        files: files.clone(),
    };
    let serialized = serde_json::to_string_pretty(&sidecar)?;

    let final_path = shared_dir.join(SIDECAR_FILENAME);
    let tmp_path = shared_dir.join(sidecar_tmp_filename());
    std::fs::write(&tmp_path, serialized)?;
    std::fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkInfo;

    fn sample_metadata() -> FileMetadata {
        FileMetadata {
            size: 10,
            checksum: "deadbeef".into(),
            chunks: vec![ChunkInfo {
                id: 0,
                size: 10,
                checksum: "deadbeef".into(),
            }],
        }
    }

    #[test]
    fn test_load_missing_sidecar_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let files = load(dir.path()).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = HashMap::new();
        files.insert("a.txt".to_string(), sample_metadata());

        save(dir.path(), &files).unwrap();
        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded, files);
    }

    #[test]
    fn test_save_overwrites_previous_sidecar_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = HashMap::new();
        files.insert("a.txt".to_string(), sample_metadata());
        save(dir.path(), &files).unwrap();

        files.remove("a.txt");
        files.insert("b.txt".to_string(), sample_metadata());
        save(dir.path(), &files).unwrap();

        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("b.txt"));

        // no leftover temp file
        assert!(!dir.path().join(sidecar_tmp_filename()).exists());
    }
}
