//! Chunk input streams.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::chunk::output::ChunkOutput;
use crate::chunk::{ChunkId, ChunkStore, StreamBackend};
use crate::error::{Result, SortError};
use crate::record::Record;

/// Sequential reader over one chunk file.
///
/// A freshly opened stream is positioned on the first record: [`value`]
/// returns it without advancing, [`next`] loads the following record and
/// reports whether one was available. Opening verifies that the file length
/// is a positive multiple of the record size.
///
/// [`value`]: ChunkInput::value
/// [`next`]: ChunkInput::next
pub enum ChunkInput<T: Record> {
    Buffered(BufferedInput<T>),
    Mapped(MappedInput<T>),
}

impl<T: Record> ChunkInput<T> {
    /// Opens the chunk named by `id` with a read buffer of `buf_size` bytes.
    pub fn open(id: ChunkId, store: &ChunkStore, buf_size: usize) -> Result<Self> {
        if buf_size == 0 || buf_size % T::SIZE != 0 {
            return Err(SortError::Config(format!(
                "input buffer size {} must be a positive multiple of the record size {}",
                buf_size,
                T::SIZE
            )));
        }

        let path = store.path(id);
        match store.backend() {
            StreamBackend::Buffered => Ok(ChunkInput::Buffered(BufferedInput::open(
                id, path, buf_size,
            )?)),
            StreamBackend::Mapped => Ok(ChunkInput::Mapped(MappedInput::open(id, path)?)),
        }
    }

    /// The current record.
    pub fn value(&self) -> T {
        match self {
            ChunkInput::Buffered(s) => s.current,
            ChunkInput::Mapped(s) => s.current,
        }
    }

    /// Advances to the next record; `false` once the chunk is exhausted.
    pub fn next(&mut self) -> Result<bool> {
        match self {
            ChunkInput::Buffered(s) => s.next(),
            ChunkInput::Mapped(s) => Ok(s.next()),
        }
    }

    pub fn eof(&self) -> bool {
        match self {
            ChunkInput::Buffered(s) => s.consumed >= s.file_size,
            ChunkInput::Mapped(s) => s.pos >= s.total,
        }
    }

    /// Chunk length in bytes.
    pub fn size(&self) -> u64 {
        match self {
            ChunkInput::Buffered(s) => s.file_size,
            ChunkInput::Mapped(s) => (s.total * T::SIZE) as u64,
        }
    }

    /// Chunk length in records.
    pub fn count(&self) -> u64 {
        self.size() / T::SIZE as u64
    }

    pub fn id(&self) -> ChunkId {
        match self {
            ChunkInput::Buffered(s) => s.id,
            ChunkInput::Mapped(s) => s.id,
        }
    }

    /// Drains the remaining records (current one included) into `out`.
    /// Fast path for a merge whose other sources ran dry.
    pub fn copy_to(&mut self, out: &mut ChunkOutput<T>) -> Result<()> {
        out.put(self.value())?;
        while self.next()? {
            out.put(self.value())?;
        }
        Ok(())
    }

    /// Consumes the stream, yielding every remaining record in order.
    pub fn records(self) -> ChunkRecords<T> {
        ChunkRecords {
            input: Some(self),
            fresh: true,
        }
    }
}

/// Iterator over the records of a [`ChunkInput`]. A read error ends the
/// iteration after yielding it.
pub struct ChunkRecords<T: Record> {
    input: Option<ChunkInput<T>>,
    fresh: bool,
}

impl<T: Record> Iterator for ChunkRecords<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let input = self.input.as_mut()?;

        if self.fresh {
            self.fresh = false;
            return Some(Ok(input.value()));
        }

        match input.next() {
            Ok(true) => Some(Ok(input.value())),
            Ok(false) => {
                self.input = None;
                None
            }
            Err(err) => {
                self.input = None;
                Some(Err(err))
            }
        }
    }
}

pub struct BufferedInput<T: Record> {
    id: ChunkId,
    path: PathBuf,
    reader: BufReader<File>,
    current: T,
    file_size: u64,
    consumed: u64,
}

impl<T: Record> BufferedInput<T> {
    fn open(id: ChunkId, path: PathBuf, buf_size: usize) -> Result<Self> {
        let file = File::open(&path).map_err(|e| SortError::io(&path, e))?;
        let file_size = file
            .metadata()
            .map_err(|e| SortError::io(&path, e))?
            .len();
        check_chunk_len::<T>(&path, file_size)?;

        let mut stream = BufferedInput {
            id,
            path,
            reader: BufReader::with_capacity(buf_size, file),
            current: T::default(),
            file_size,
            consumed: 0,
        };

        if !stream.next()? {
            return Err(SortError::format(&stream.path, "no first record"));
        }

        Ok(stream)
    }

    fn next(&mut self) -> Result<bool> {
        if self.consumed >= self.file_size {
            return Ok(false);
        }

        self.reader
            .read_exact(bytemuck::bytes_of_mut(&mut self.current))
            .map_err(|e| SortError::io(&self.path, e))?;
        self.consumed += T::SIZE as u64;

        Ok(true)
    }
}

pub struct MappedInput<T: Record> {
    id: ChunkId,
    mmap: Mmap,
    current: T,
    total: usize,
    pos: usize,
}

impl<T: Record> MappedInput<T> {
    fn open(id: ChunkId, path: PathBuf) -> Result<Self> {
        let file = File::open(&path).map_err(|e| SortError::io(&path, e))?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| SortError::io(&path, e))?;
        check_chunk_len::<T>(&path, mmap.len() as u64)?;

        let total = mmap.len() / T::SIZE;
        let current = bytemuck::pod_read_unaligned(&mmap[..T::SIZE]);

        Ok(MappedInput {
            id,
            mmap,
            current,
            total,
            pos: 1,
        })
    }

    fn next(&mut self) -> bool {
        if self.pos >= self.total {
            return false;
        }

        let start = self.pos * T::SIZE;
        self.current = bytemuck::pod_read_unaligned(&self.mmap[start..start + T::SIZE]);
        self.pos += 1;

        true
    }
}

fn check_chunk_len<T: Record>(path: &Path, len: u64) -> Result<()> {
    if len == 0 {
        return Err(SortError::format(path, "chunk file is empty"));
    }
    if len % T::SIZE as u64 != 0 {
        return Err(SortError::format(
            path,
            format!("length {} is not a multiple of the record size {}", len, T::SIZE),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::fs;

    use rstest::*;

    use super::{ChunkId, ChunkInput, ChunkStore, StreamBackend};

    fn store(dir: &tempfile::TempDir, backend: StreamBackend) -> ChunkStore {
        ChunkStore::new(dir.path().into(), '_', backend, true)
    }

    fn write_chunk(store: &ChunkStore, id: ChunkId, values: &[u32]) {
        fs::write(store.path(id), bytemuck::cast_slice(values)).unwrap();
    }

    #[rstest]
    #[case(StreamBackend::Buffered)]
    #[case(StreamBackend::Mapped)]
    fn test_reads_records_in_order(#[case] backend: StreamBackend) {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, backend);
        let id = ChunkId::new(0, 0);
        write_chunk(&store, id, &[3, 1, 4, 1, 5]);

        let mut input: ChunkInput<u32> = ChunkInput::open(id, &store, 8).unwrap();
        assert_eq!(input.size(), 20);
        assert_eq!(input.count(), 5);
        assert_eq!(input.id(), id);

        let mut seen = vec![input.value()];
        while input.next().unwrap() {
            seen.push(input.value());
        }
        assert_eq!(seen, vec![3, 1, 4, 1, 5]);
        assert!(input.eof());
        assert!(!input.next().unwrap());
    }

    #[rstest]
    #[case(StreamBackend::Buffered)]
    #[case(StreamBackend::Mapped)]
    fn test_single_record_is_eof_at_once(#[case] backend: StreamBackend) {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, backend);
        let id = ChunkId::new(0, 1);
        write_chunk(&store, id, &[42]);

        let mut input: ChunkInput<u32> = ChunkInput::open(id, &store, 4).unwrap();
        assert_eq!(input.value(), 42);
        assert!(input.eof());
        assert!(!input.next().unwrap());
    }

    #[rstest]
    #[case(StreamBackend::Buffered)]
    #[case(StreamBackend::Mapped)]
    fn test_empty_chunk_is_fatal(#[case] backend: StreamBackend) {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, backend);
        let id = ChunkId::new(0, 2);
        fs::write(store.path(id), b"").unwrap();

        assert!(ChunkInput::<u32>::open(id, &store, 4).is_err());
    }

    #[rstest]
    #[case(StreamBackend::Buffered)]
    #[case(StreamBackend::Mapped)]
    fn test_misaligned_chunk_is_fatal(#[case] backend: StreamBackend) {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, backend);
        let id = ChunkId::new(0, 3);
        fs::write(store.path(id), &[1u8, 2, 3]).unwrap();

        assert!(ChunkInput::<u32>::open(id, &store, 4).is_err());
    }

    #[rstest]
    #[case(StreamBackend::Buffered)]
    #[case(StreamBackend::Mapped)]
    fn test_records_iterator(#[case] backend: StreamBackend) {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, backend);
        let id = ChunkId::new(0, 5);
        write_chunk(&store, id, &[2, 4, 6, 8]);

        let input: ChunkInput<u32> = ChunkInput::open(id, &store, 8).unwrap();
        let records: Result<Vec<u32>, _> = input.records().collect();
        assert_eq!(records.unwrap(), vec![2, 4, 6, 8]);
    }

    #[test]
    fn test_bad_buffer_size_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, StreamBackend::Buffered);
        let id = ChunkId::new(0, 4);
        write_chunk(&store, id, &[1]);

        assert!(ChunkInput::<u32>::open(id, &store, 0).is_err());
        assert!(ChunkInput::<u32>::open(id, &store, 6).is_err());
    }
}
