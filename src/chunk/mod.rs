//! Chunk files: identifiers, the on-disk store and the record streams over it.

pub mod id;
pub mod input;
pub mod output;

pub use id::ChunkId;
pub use input::{ChunkInput, ChunkRecords};
pub use output::ChunkOutput;

use std::fs;
use std::path::{Path, PathBuf};

use log;

use crate::error::{Result, SortError};

/// Stream backend used for chunk I/O.
///
/// Both backends honor the same stream contract; the algorithmic layers never
/// depend on which one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamBackend {
    /// `BufReader`/`BufWriter` with caller-sized capacities.
    #[default]
    Buffered,
    /// Memory-mapped files. The output stream preallocates the file at the
    /// expected size and windows the mapping through a write cursor.
    Mapped,
}

/// The chunk directory: resolves [`ChunkId`]s to paths, removes merged
/// chunks and scans for leftovers from a previous sort stage.
#[derive(Debug)]
pub struct ChunkStore {
    dir: PathBuf,
    sep: char,
    backend: StreamBackend,
    remove_merged: bool,
}

impl ChunkStore {
    pub fn new(dir: PathBuf, sep: char, backend: StreamBackend, remove_merged: bool) -> Self {
        ChunkStore {
            dir,
            sep,
            backend,
            remove_merged,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn backend(&self) -> StreamBackend {
        self.backend
    }

    pub fn remove_merged(&self) -> bool {
        self.remove_merged
    }

    /// The chunk's on-disk file name under this store's separator.
    pub fn name(&self, id: ChunkId) -> String {
        id.filename(self.sep)
    }

    pub fn path(&self, id: ChunkId) -> PathBuf {
        self.dir.join(id.filename(self.sep))
    }

    /// Deletes a merged chunk file. Failures are reported and ignored; a
    /// leftover temporary never fails the run.
    pub fn remove(&self, id: ChunkId) {
        let path = self.path(id);
        if let Err(err) = fs::remove_file(&path) {
            log::error!("failed to remove tmp chunk '{}': {}", path.display(), err);
        }
    }

    /// Lists every chunk present in the directory. Used by merge-only mode;
    /// a file name that does not parse as a chunk id is a fatal error.
    pub fn scan(&self) -> Result<Vec<ChunkId>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| SortError::io(&self.dir, e))?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SortError::io(&self.dir, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let id = ChunkId::parse(&name, self.sep)?;
            log::debug!("found chunk '{}'", name);
            ids.push(id);
        }

        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use rstest::*;

    use super::{ChunkId, ChunkStore, StreamBackend};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[rstest]
    fn test_path_uses_canonical_name(tmp_dir: tempfile::TempDir) {
        let store = ChunkStore::new(tmp_dir.path().into(), '_', StreamBackend::Buffered, true);
        let path = store.path(ChunkId::new(2, 16));
        assert_eq!(path.file_name().unwrap(), "2_10");
    }

    #[rstest]
    fn test_scan_returns_sorted_ids(tmp_dir: tempfile::TempDir) {
        let store = ChunkStore::new(tmp_dir.path().into(), '_', StreamBackend::Buffered, true);
        for name in ["1_0", "0_2", "0_0"] {
            fs::write(tmp_dir.path().join(name), b"test").unwrap();
        }

        let ids = store.scan().unwrap();
        assert_eq!(
            ids,
            vec![ChunkId::new(0, 0), ChunkId::new(0, 2), ChunkId::new(1, 0)]
        );
    }

    #[rstest]
    fn test_scan_rejects_foreign_files(tmp_dir: tempfile::TempDir) {
        let store = ChunkStore::new(tmp_dir.path().into(), '_', StreamBackend::Buffered, true);
        fs::write(tmp_dir.path().join("notes.txt"), b"test").unwrap();

        assert!(store.scan().is_err());
    }

    #[rstest]
    fn test_remove_is_non_fatal(tmp_dir: tempfile::TempDir) {
        let store = ChunkStore::new(tmp_dir.path().into(), '_', StreamBackend::Buffered, true);
        // removing a chunk that never existed only logs
        store.remove(ChunkId::new(0, 0));
    }
}
