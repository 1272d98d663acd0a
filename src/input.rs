//! The file being sorted: validation and atomic region reservation.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::Mmap;

use crate::chunk::StreamBackend;
use crate::error::{Result, SortError};
use crate::record::Record;

/// The input file shared by all sort-stage workers.
///
/// Workers claim disjoint regions through [`reserve`], which advances a
/// global position with a compare-and-swap loop; no two workers ever see the
/// same region and the whole file is covered exactly once. Region loading is
/// positioned and thread-safe: the mapped backend slices one shared read-only
/// mapping, the buffered backend opens a private handle per load.
///
/// [`reserve`]: InputFile::reserve
pub struct InputFile {
    path: PathBuf,
    len: u64,
    pos: AtomicU64,
    mmap: Option<Mmap>,
}

impl InputFile {
    /// Opens and validates the input. The length must be a non-zero multiple
    /// of the record size; empty inputs are short-circuited by the sorter
    /// before a pipeline is ever built.
    pub fn open<T: Record>(path: &Path, backend: StreamBackend) -> Result<Self> {
        let file = File::open(path).map_err(|e| SortError::io(path, e))?;
        let len = file.metadata().map_err(|e| SortError::io(path, e))?.len();

        if len == 0 {
            return Err(SortError::format(path, "input file is empty"));
        }
        if len % T::SIZE as u64 != 0 {
            return Err(SortError::format(
                path,
                format!("length {} is not a multiple of the record size {}", len, T::SIZE),
            ));
        }

        let mmap = match backend {
            StreamBackend::Buffered => None,
            StreamBackend::Mapped => {
                Some(unsafe { Mmap::map(&file) }.map_err(|e| SortError::io(path, e))?)
            }
        };

        Ok(InputFile {
            path: path.into(),
            len,
            pos: AtomicU64::new(0),
            mmap,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Claims the next region of at most `max_bytes`, returning its offset
    /// and length. The trailing remainder yields a short region; `None` once
    /// the input is exhausted.
    pub fn reserve(&self, max_bytes: u64) -> Option<(u64, u64)> {
        loop {
            let offset = self.pos.load(Ordering::Acquire);
            let remaining = self.len - offset;
            if remaining == 0 {
                return None;
            }

            let take = remaining.min(max_bytes);
            match self.pos.compare_exchange(
                offset,
                offset + take,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some((offset, take)),
                Err(_) => continue,
            }
        }
    }

    /// Loads the region `[offset, offset + len(out))` into `out`.
    pub fn read_region<T: Record>(&self, offset: u64, out: &mut [T]) -> Result<()> {
        let bytes = bytemuck::cast_slice_mut(out);

        match &self.mmap {
            Some(mmap) => {
                let start = offset as usize;
                bytes.copy_from_slice(&mmap[start..start + bytes.len()]);
                Ok(())
            }
            None => {
                let mut file = File::open(&self.path).map_err(|e| SortError::io(&self.path, e))?;
                file.seek(SeekFrom::Start(offset))
                    .map_err(|e| SortError::io(&self.path, e))?;
                file.read_exact(bytes)
                    .map_err(|e| SortError::io(&self.path, e))?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use rstest::*;

    use super::{InputFile, StreamBackend};

    #[rstest]
    #[case(StreamBackend::Buffered)]
    #[case(StreamBackend::Mapped)]
    fn test_reserve_covers_input_once(#[case] backend: StreamBackend) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input");
        let values: Vec<u32> = (0..10).collect();
        fs::write(&path, bytemuck::cast_slice(&values)).unwrap();

        let input = InputFile::open::<u32>(&path, backend).unwrap();
        assert_eq!(input.len(), 40);

        // 16-byte regions over 40 bytes: 16 + 16 + trailing 8
        assert_eq!(input.reserve(16), Some((0, 16)));
        assert_eq!(input.reserve(16), Some((16, 16)));
        assert_eq!(input.reserve(16), Some((32, 8)));
        assert_eq!(input.reserve(16), None);
        assert_eq!(input.reserve(16), None);
    }

    #[rstest]
    #[case(StreamBackend::Buffered)]
    #[case(StreamBackend::Mapped)]
    fn test_read_region(#[case] backend: StreamBackend) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input");
        let values: Vec<u32> = (0..10).collect();
        fs::write(&path, bytemuck::cast_slice(&values)).unwrap();

        let input = InputFile::open::<u32>(&path, backend).unwrap();
        let mut region = vec![0u32; 4];
        input.read_region(8, &mut region).unwrap();
        assert_eq!(region, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_misaligned_input_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input");
        fs::write(&path, &[0u8; 6]).unwrap();

        assert!(InputFile::open::<u32>(&path, StreamBackend::Buffered).is_err());
    }

    #[test]
    fn test_empty_input_is_rejected_here() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input");
        fs::write(&path, b"").unwrap();

        assert!(InputFile::open::<u32>(&path, StreamBackend::Buffered).is_err());
    }
}
