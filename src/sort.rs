//! External sorter.

use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytesize::ByteSize;
use log;

use crate::chunk::{ChunkStore, StreamBackend};
use crate::error::{Result, SortError};
use crate::input::InputFile;
use crate::pipeline::memory::check_budget;
use crate::pipeline::tasks::FanIn;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::record::{round_down, Record};
use crate::task::SortAlgorithm;

const DEFAULT_MEMORY_LIMIT: u64 = 256 * 1024 * 1024;
const DEFAULT_IO_RATIO: f64 = 0.5;
const DEFAULT_TREE_HEIGHT: u32 = 2;
const DEFAULT_CHUNK_NAME_SEP: char = '_';
/// Workers used when hardware detection is not overridden and reports less.
const MIN_AUTO_WORKERS: u32 = 2;

/// What a finished run looked like.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortStats {
    /// Input length in bytes.
    pub input_bytes: u64,
    /// Input length in records.
    pub records: u64,
    /// Level-0 chunks produced by the sort stage.
    pub l0_chunks: usize,
    /// Merge tasks executed.
    pub merge_tasks: u64,
    /// Level of the result chunk, i.e. the height of the merge tree.
    pub levels: u32,
    pub elapsed: Duration,
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder<T: Record> {
    /// Total buffer/chunk memory budget in bytes.
    memory_limit: u64,
    /// Worker thread count; autodetected when absent.
    threads_number: Option<u32>,
    /// Merge fan-in; 0 selects the automatic width.
    fan_in: usize,
    /// Tree height targeted by the automatic fan-in.
    tree_height: u32,
    /// Collapse all level-0 chunks into one root merge.
    flat: bool,
    /// In-memory sort used by the sort stage.
    algorithm: SortAlgorithm,
    /// Input share of each worker's buffer budget.
    io_ratio: f64,
    /// Directory to be used to store chunk files.
    tmp_dir: Option<PathBuf>,
    /// Separator inside chunk file names.
    chunk_name_sep: char,
    /// Keep merged chunk files instead of deleting them.
    keep_chunks: bool,
    /// Chunk stream backend.
    backend: StreamBackend,

    /// Record type.
    record_type: PhantomData<T>,
}

impl<T: Record> ExternalSorterBuilder<T> {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<T>> {
        if self.memory_limit == 0 {
            return Err(SortError::Config("memory limit must be positive".into()));
        }
        if !(self.io_ratio > 0.0 && self.io_ratio < 1.0) {
            return Err(SortError::Config(format!(
                "I/O ratio {} must lie strictly between 0 and 1",
                self.io_ratio
            )));
        }
        if self.threads_number == Some(0) {
            return Err(SortError::Config("thread count must be positive".into()));
        }
        if self.tree_height == 0 {
            return Err(SortError::Config("tree height must be positive".into()));
        }
        if self.chunk_name_sep.is_ascii_hexdigit() || self.chunk_name_sep == '/' {
            return Err(SortError::Config(format!(
                "chunk name separator '{}' collides with the hex id encoding",
                self.chunk_name_sep
            )));
        }

        return Ok(ExternalSorter {
            memory_limit: self.memory_limit,
            threads_number: self.threads_number,
            fan_in: self.fan_in,
            tree_height: self.tree_height,
            flat: self.flat,
            algorithm: self.algorithm,
            io_ratio: self.io_ratio,
            tmp_dir: self.tmp_dir,
            chunk_name_sep: self.chunk_name_sep,
            keep_chunks: self.keep_chunks,
            backend: self.backend,
            record_type: PhantomData,
        });
    }

    /// Sets the total memory budget shared by all workers.
    pub fn with_memory_limit(mut self, bytes: u64) -> ExternalSorterBuilder<T> {
        self.memory_limit = bytes;
        return self;
    }

    /// Sets number of threads to be used by the pipeline.
    pub fn with_threads_number(mut self, threads_number: u32) -> ExternalSorterBuilder<T> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets the merge fan-in; `0` selects the automatic width derived from
    /// the chunk count and the tree height.
    pub fn with_fan_in(mut self, fan_in: usize) -> ExternalSorterBuilder<T> {
        self.fan_in = fan_in;
        return self;
    }

    /// Sets the merge tree height targeted by the automatic fan-in.
    pub fn with_tree_height(mut self, tree_height: u32) -> ExternalSorterBuilder<T> {
        self.tree_height = tree_height;
        return self;
    }

    /// Merges every level-0 chunk in a single root merge.
    pub fn with_flat_merge(mut self, flat: bool) -> ExternalSorterBuilder<T> {
        self.flat = flat;
        return self;
    }

    /// Selects the in-memory sort algorithm.
    pub fn with_algorithm(mut self, algorithm: SortAlgorithm) -> ExternalSorterBuilder<T> {
        self.algorithm = algorithm;
        return self;
    }

    /// Sets the input share of each worker's buffer budget.
    pub fn with_io_ratio(mut self, io_ratio: f64) -> ExternalSorterBuilder<T> {
        self.io_ratio = io_ratio;
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<T> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets the separator used inside chunk file names.
    pub fn with_chunk_name_sep(mut self, sep: char) -> ExternalSorterBuilder<T> {
        self.chunk_name_sep = sep;
        return self;
    }

    /// Keeps merged chunk files instead of deleting them.
    pub fn with_keep_chunks(mut self, keep: bool) -> ExternalSorterBuilder<T> {
        self.keep_chunks = keep;
        return self;
    }

    /// Selects the chunk stream backend.
    pub fn with_backend(mut self, backend: StreamBackend) -> ExternalSorterBuilder<T> {
        self.backend = backend;
        return self;
    }
}

impl<T: Record> Default for ExternalSorterBuilder<T> {
    fn default() -> Self {
        ExternalSorterBuilder {
            memory_limit: DEFAULT_MEMORY_LIMIT,
            threads_number: None,
            fan_in: 0,
            tree_height: DEFAULT_TREE_HEIGHT,
            flat: false,
            algorithm: SortAlgorithm::default(),
            io_ratio: DEFAULT_IO_RATIO,
            tmp_dir: None,
            chunk_name_sep: DEFAULT_CHUNK_NAME_SEP,
            keep_chunks: false,
            backend: StreamBackend::default(),
            record_type: PhantomData,
        }
    }
}

/// External sorter for files of fixed-width integer records.
pub struct ExternalSorter<T: Record> {
    memory_limit: u64,
    threads_number: Option<u32>,
    fan_in: usize,
    tree_height: u32,
    flat: bool,
    algorithm: SortAlgorithm,
    io_ratio: f64,
    tmp_dir: Option<PathBuf>,
    chunk_name_sep: char,
    keep_chunks: bool,
    backend: StreamBackend,

    record_type: PhantomData<T>,
}

impl<T: Record> ExternalSorter<T> {
    pub fn builder() -> ExternalSorterBuilder<T> {
        ExternalSorterBuilder::new()
    }

    /// Sorts `input` into `output`.
    ///
    /// An empty input is a legal no-op producing an empty output; any other
    /// input must be a whole number of records long. On success the root
    /// merge's chunk is renamed to `output`; on failure the chunk directory
    /// is left in place for postmortem inspection.
    pub fn sort(&self, input: &Path, output: &Path) -> Result<SortStats> {
        let started = Instant::now();

        let input_bytes = fs::metadata(input)
            .map_err(|e| SortError::io(input, e))?
            .len();

        if input_bytes == 0 {
            log::info!("input '{}' is empty, writing an empty output", input.display());
            fs::File::create(output).map_err(|e| SortError::io(output, e))?;
            return Ok(SortStats {
                elapsed: started.elapsed(),
                ..SortStats::default()
            });
        }

        if input_bytes % T::SIZE as u64 != 0 {
            return Err(SortError::format(
                input,
                format!(
                    "length {} is not a multiple of the record size {}",
                    input_bytes,
                    T::SIZE
                ),
            ));
        }

        let workers = self.resolve_workers();
        self.check_memory(workers)?;
        let chunk_size = self.chunk_size(input_bytes, workers);

        log::info!("input file: '{}' ({})", input.display(), ByteSize(input_bytes));
        log::info!("output file: '{}'", output.display());
        log::info!(
            "workers: {}, memory: {} ({} per worker), io ratio: {}",
            workers,
            ByteSize(self.memory_limit),
            ByteSize(self.memory_limit / workers as u64),
            self.io_ratio
        );
        log::info!(
            "chunk size: {}, expected level-0 chunks: {}",
            ByteSize(chunk_size),
            (input_bytes + chunk_size - 1) / chunk_size
        );

        let (store, tmp) = self.make_store(output)?;
        let input_file = Arc::new(InputFile::open::<T>(input, self.backend)?);

        let pipeline: Pipeline<T> = Pipeline::new(
            PipelineConfig {
                workers,
                memory: self.memory_limit,
                io_ratio: self.io_ratio,
                chunk_size,
                algorithm: self.algorithm,
                fan_in: self.resolve_fan_in(),
                skip_sort: false,
            },
            Some(input_file),
            store.clone(),
        );

        let report = match pipeline.run() {
            Ok(report) => report,
            Err(err) => return Err(self.keep_for_postmortem(tmp, err)),
        };

        let result_path = store.path(report.result);
        if let Err(e) = fs::rename(&result_path, output) {
            let err = SortError::io(&result_path, e);
            return Err(self.keep_for_postmortem(tmp, err));
        }

        let stats = SortStats {
            input_bytes,
            records: input_bytes / T::SIZE as u64,
            l0_chunks: report.l0_chunks,
            merge_tasks: report.merge_tasks,
            levels: report.result.level,
            elapsed: started.elapsed(),
        };

        log::info!(
            "sorted {} records ({} chunks, {} merges) in {} ms",
            stats.records,
            stats.l0_chunks,
            stats.merge_tasks,
            stats.elapsed.as_millis()
        );

        return Ok(stats);
    }

    /// Merges the chunks already present in the configured chunk directory
    /// into `output`, skipping the sort stage. Chunk files must carry their
    /// canonical names; at least two are required.
    pub fn merge_existing(&self, output: &Path) -> Result<SortStats> {
        let started = Instant::now();

        let dir = self.tmp_dir.clone().ok_or_else(|| {
            SortError::Config("merge-only mode requires a configured chunk directory".into())
        })?;

        let workers = self.resolve_workers();
        self.check_memory(workers)?;

        log::info!("merging existing chunks from '{}'", dir.display());

        let store = Arc::new(ChunkStore::new(
            dir,
            self.chunk_name_sep,
            self.backend,
            !self.keep_chunks,
        ));

        let pipeline: Pipeline<T> = Pipeline::new(
            PipelineConfig {
                workers,
                memory: self.memory_limit,
                io_ratio: self.io_ratio,
                chunk_size: 0,
                algorithm: self.algorithm,
                fan_in: self.resolve_fan_in(),
                skip_sort: true,
            },
            None,
            store.clone(),
        );

        let report = pipeline.run()?;

        let result_path = store.path(report.result);
        fs::rename(&result_path, output).map_err(|e| SortError::io(&result_path, e))?;

        let output_bytes = fs::metadata(output)
            .map_err(|e| SortError::io(output, e))?
            .len();

        return Ok(SortStats {
            input_bytes: output_bytes,
            records: output_bytes / T::SIZE as u64,
            l0_chunks: report.l0_chunks,
            merge_tasks: report.merge_tasks,
            levels: report.result.level,
            elapsed: started.elapsed(),
        });
    }

    fn resolve_workers(&self) -> u32 {
        match self.threads_number {
            Some(n) => n,
            None => (num_cpus::get() as u32).max(MIN_AUTO_WORKERS),
        }
    }

    fn resolve_fan_in(&self) -> FanIn {
        if self.flat {
            FanIn::Flat
        } else if self.fan_in == 0 {
            FanIn::Auto {
                tree_height: self.tree_height,
            }
        } else {
            FanIn::Fixed(self.fan_in)
        }
    }

    fn check_memory(&self, workers: u32) -> Result<()> {
        if !check_budget(self.memory_limit, workers, self.io_ratio, T::SIZE) {
            return Err(SortError::Config(format!(
                "memory limit {} cannot give {} workers a whole {}-byte record per stream",
                self.memory_limit,
                workers,
                T::SIZE
            )));
        }
        Ok(())
    }

    /// Level-0 chunk size: each worker's memory share, shrunk when the whole
    /// input fits the budget so the pipeline still sees `2 * workers` chunks.
    fn chunk_size(&self, input_bytes: u64, workers: u32) -> u64 {
        let per_worker = self.memory_limit / workers as u64;
        let raw = if self.memory_limit >= input_bytes {
            input_bytes / (2 * workers as u64)
        } else {
            per_worker
        };

        round_down(raw, T::SIZE as u64).max(T::SIZE as u64)
    }

    /// Resolves the chunk directory: the configured one, or a fresh tempdir
    /// next to the output so the final rename stays on one filesystem.
    fn make_store(&self, output: &Path) -> Result<(Arc<ChunkStore>, Option<tempfile::TempDir>)> {
        match &self.tmp_dir {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(|e| SortError::io(dir, e))?;
                let store = ChunkStore::new(
                    dir.clone(),
                    self.chunk_name_sep,
                    self.backend,
                    !self.keep_chunks,
                );
                Ok((Arc::new(store), None))
            }
            None => {
                let parent = output
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                let tmp = tempfile::Builder::new()
                    .prefix(".binsort-")
                    .tempdir_in(parent)
                    .map_err(|e| SortError::io(parent, e))?;

                log::info!("using '{}' as the chunk directory", tmp.path().display());

                let store = ChunkStore::new(
                    tmp.path().into(),
                    self.chunk_name_sep,
                    self.backend,
                    !self.keep_chunks,
                );
                Ok((Arc::new(store), Some(tmp)))
            }
        }
    }

    /// A failed run leaves its chunks behind for postmortem inspection.
    fn keep_for_postmortem(&self, tmp: Option<tempfile::TempDir>, err: SortError) -> SortError {
        if let Some(tmp) = tmp {
            log::error!(
                "run failed, temporary chunks kept in '{}'",
                tmp.path().display()
            );
            // disable the guard's cleanup
            std::mem::forget(tmp);
        }
        err
    }
}
