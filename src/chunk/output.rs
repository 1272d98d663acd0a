//! Chunk output streams.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use memmap2::MmapMut;

use crate::chunk::{ChunkId, ChunkStore, StreamBackend};
use crate::error::{Result, SortError};
use crate::record::Record;

/// Sequential writer producing one chunk file.
///
/// The buffered backend appends through a `BufWriter` and flushes on close.
/// The mapped backend preallocates the file at `expected_bytes`, maps it
/// writable and windows the mapping through a write cursor; its close
/// verifies the caller delivered exactly the promised number of bytes and
/// syncs the mapping. `close` is idempotent.
pub enum ChunkOutput<T: Record> {
    Buffered(BufferedOutput<T>),
    Mapped(MappedOutput),
}

impl<T: Record> ChunkOutput<T> {
    /// Creates the chunk named by `id`.
    ///
    /// `buf_size` sizes the write buffer of the buffered backend (the mapped
    /// backend writes through the mapping and ignores it); `expected_bytes`
    /// is the exact final file length, which the mapped backend preallocates.
    pub fn create(
        id: ChunkId,
        store: &ChunkStore,
        buf_size: usize,
        expected_bytes: u64,
    ) -> Result<Self> {
        if buf_size == 0 || buf_size % T::SIZE != 0 {
            return Err(SortError::Config(format!(
                "output buffer size {} must be a positive multiple of the record size {}",
                buf_size,
                T::SIZE
            )));
        }

        let path = store.path(id);
        match store.backend() {
            StreamBackend::Buffered => {
                let file = File::create(&path).map_err(|e| SortError::io(&path, e))?;
                Ok(ChunkOutput::Buffered(BufferedOutput {
                    path,
                    writer: Some(BufWriter::with_capacity(buf_size, file)),
                    written: 0,
                    _marker: std::marker::PhantomData,
                }))
            }
            StreamBackend::Mapped => Ok(ChunkOutput::Mapped(MappedOutput::create::<T>(
                path,
                expected_bytes,
            )?)),
        }
    }

    /// Appends one record.
    pub fn put(&mut self, value: T) -> Result<()> {
        match self {
            ChunkOutput::Buffered(s) => s.write(bytemuck::bytes_of(&value)),
            ChunkOutput::Mapped(s) => s.write(bytemuck::bytes_of(&value)),
        }
    }

    /// Appends a run of records in one write.
    pub fn put_slice(&mut self, values: &[T]) -> Result<()> {
        match self {
            ChunkOutput::Buffered(s) => s.write(bytemuck::cast_slice(values)),
            ChunkOutput::Mapped(s) => s.write(bytemuck::cast_slice(values)),
        }
    }

    /// Bytes appended so far.
    pub fn written(&self) -> u64 {
        match self {
            ChunkOutput::Buffered(s) => s.written,
            ChunkOutput::Mapped(s) => s.cursor as u64,
        }
    }

    /// Flushes and closes the stream. A second call is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match self {
            ChunkOutput::Buffered(s) => s.close(),
            ChunkOutput::Mapped(s) => s.close(),
        }
    }
}

pub struct BufferedOutput<T: Record> {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    written: u64,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Record> BufferedOutput<T> {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SortError::Invariant("write to a closed chunk output".into()))?;

        writer
            .write_all(bytes)
            .map_err(|e| SortError::io(&self.path, e))?;
        self.written += bytes.len() as u64;

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| SortError::io(&self.path, e))?;
        }
        Ok(())
    }
}

pub struct MappedOutput {
    path: PathBuf,
    mmap: Option<MmapMut>,
    cursor: usize,
    expected: usize,
}

impl MappedOutput {
    fn create<T: Record>(path: PathBuf, expected_bytes: u64) -> Result<Self> {
        if expected_bytes == 0 || expected_bytes % T::SIZE as u64 != 0 {
            return Err(SortError::Config(format!(
                "mapped output size {} must be a positive multiple of the record size {}",
                expected_bytes,
                T::SIZE
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| SortError::io(&path, e))?;
        file.set_len(expected_bytes)
            .map_err(|e| SortError::io(&path, e))?;
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| SortError::io(&path, e))?;

        Ok(MappedOutput {
            path,
            mmap: Some(mmap),
            cursor: 0,
            expected: expected_bytes as usize,
        })
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mmap = self
            .mmap
            .as_mut()
            .ok_or_else(|| SortError::Invariant("write to a closed chunk output".into()))?;

        let end = self.cursor + bytes.len();
        if end > self.expected {
            return Err(SortError::Invariant(format!(
                "mapped chunk output '{}' overflows its expected size {}",
                self.path.display(),
                self.expected
            )));
        }

        mmap[self.cursor..end].copy_from_slice(bytes);
        self.cursor = end;

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mmap) = self.mmap.take() {
            mmap.flush().map_err(|e| SortError::io(&self.path, e))?;

            if self.cursor != self.expected {
                return Err(SortError::Invariant(format!(
                    "mapped chunk output '{}' closed at {} of {} expected bytes",
                    self.path.display(),
                    self.cursor,
                    self.expected
                )));
            }
        }
        Ok(())
    }
}
