//! The two-stage sort/merge pipeline.
//!
//! `W` OS threads run both stages. Stage 1 partitions the input with an
//! atomic cursor and sorts chunks independently; the [`StageGate`] then
//! admits exactly one thread to turn the chunk registry into the merge
//! queue; stage 2 drains the queue level by level. One mutex (the pipeline
//! lock) guards the scheduler and the memory pool; a condvar implements the
//! level sync; everything else is atomics.
//!
//! [`StageGate`]: threads::StageGate

pub(crate) mod memory;
pub(crate) mod merging;
pub(crate) mod sorting;
pub(crate) mod tasks;
pub(crate) mod threads;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log;

use crate::chunk::{ChunkId, ChunkStore};
use crate::error::{poisoned, Result, SortError};
use crate::input::InputFile;
use crate::record::Record;
use crate::task::{SortAlgorithm, SortTask};

use memory::MemoryPool;
use tasks::{FanIn, Scheduler};
use threads::{StageGate, ThreadPool};

pub(crate) struct PipelineConfig {
    pub workers: u32,
    pub memory: u64,
    pub io_ratio: f64,
    pub chunk_size: u64,
    pub algorithm: SortAlgorithm,
    pub fan_in: FanIn,
    /// Merge-only mode: stage 1 is skipped and the chunk registry is
    /// scanned from the store instead.
    pub skip_sort: bool,
}

/// What the pipeline produced: the chunk holding the fully merged result
/// plus counters for the run summary.
pub(crate) struct PipelineReport {
    pub result: ChunkId,
    pub l0_chunks: usize,
    pub merge_tasks: u64,
}

pub(crate) struct Pipeline<T: Record> {
    shared: Mutex<Shared<T>>,
    level_cv: Condvar,
    gate: StageGate,
    threads: ThreadPool,
    input: Option<Arc<InputFile>>,
    store: Arc<ChunkStore>,
    next_l0_id: AtomicU32,
    chunk_size: u64,
    algorithm: SortAlgorithm,
    skip_sort: bool,
}

pub(crate) struct Shared<T: Record> {
    pub scheduler: Scheduler<T>,
    pub memory: MemoryPool,
}

impl<T: Record> Pipeline<T> {
    pub fn new(
        config: PipelineConfig,
        input: Option<Arc<InputFile>>,
        store: Arc<ChunkStore>,
    ) -> Self {
        let workers = config.workers.max(1);

        Pipeline {
            shared: Mutex::new(Shared {
                scheduler: Scheduler::new(store.clone(), config.fan_in),
                memory: MemoryPool::new(config.memory, workers, config.io_ratio),
            }),
            level_cv: Condvar::new(),
            gate: StageGate::new(workers),
            threads: ThreadPool::new(workers),
            input,
            store,
            next_l0_id: AtomicU32::new(0),
            chunk_size: config.chunk_size,
            algorithm: config.algorithm,
            skip_sort: config.skip_sort,
        }
    }

    /// Runs both stages on the worker pool and reports the result chunk.
    pub fn run(&self) -> Result<PipelineReport> {
        self.threads.spawn_and_join(|id| self.worker(id))?;

        let shared = self.lock()?;
        let result = shared.scheduler.result().ok_or_else(|| {
            SortError::Invariant("pipeline finished without a result chunk".into())
        })?;

        Ok(PipelineReport {
            result,
            l0_chunks: shared.scheduler.l0_count(),
            merge_tasks: shared.scheduler.merged_tasks(),
        })
    }

    fn worker(&self, id: u32) -> Result<()> {
        log::debug!("worker [{}] enter ({} active)", id, self.threads.active());

        let result = self.run_stages(id);

        // hand the buffer share back and wake any parked worker, on every
        // exit path
        if let Ok(mut shared) = self.shared.lock() {
            shared.memory.release_worker();
        }
        self.level_cv.notify_all();

        log::debug!("worker [{}] exit", id);
        result
    }

    fn run_stages(&self, id: u32) -> Result<()> {
        let sort_result = if self.skip_sort {
            Ok(())
        } else {
            sorting::run(self, id)
        };

        // arrive even after a failure, or the rest of the pool would wait
        // at the gate forever
        let gate_result = self
            .gate
            .arrive_and_build(sort_result.is_ok(), || self.build_merge_queue());

        sort_result?;
        gate_result?;

        merging::run(self, id)
    }

    fn build_merge_queue(&self) -> Result<()> {
        let mut shared = self.lock()?;

        if self.skip_sort {
            let ids = self.store.scan()?;
            if ids.len() < 2 {
                return Err(SortError::Invariant(format!(
                    "nothing to merge: found {} chunk(s) in '{}'",
                    ids.len(),
                    self.store.dir().display()
                )));
            }
            for id in ids {
                shared.scheduler.register_chunk(id);
            }
        }

        shared.scheduler.build_merge_queue()
    }

    /// Claims the next input region as a level-0 sort task; `None` once the
    /// input is exhausted. Lock-free.
    pub(crate) fn next_sort_task(&self) -> Option<SortTask<T>> {
        let input = self.input.as_ref()?;
        let (offset, bytes) = input.reserve(self.chunk_size)?;
        let id = ChunkId::new(0, self.next_l0_id.fetch_add(1, Ordering::AcqRel));

        Some(SortTask::new(
            input.clone(),
            offset,
            bytes,
            id,
            self.store.clone(),
        ))
    }

    pub(crate) fn register_chunk(&self, id: ChunkId) -> Result<()> {
        let mut shared = self.lock()?;
        shared.scheduler.register_chunk(id);
        Ok(())
    }

    pub(crate) fn algorithm(&self) -> SortAlgorithm {
        self.algorithm
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Shared<T>>> {
        self.shared.lock().map_err(poisoned)
    }

    /// Blocks on the level condvar until no merge task is in flight.
    pub(crate) fn wait_level_drain<'a>(
        &'a self,
        mut guard: MutexGuard<'a, Shared<T>>,
    ) -> Result<MutexGuard<'a, Shared<T>>> {
        while guard.scheduler.active_tasks() > 0 {
            guard = self.level_cv.wait(guard).map_err(poisoned)?;
        }
        Ok(guard)
    }

    pub(crate) fn notify_level_drain(&self) {
        self.level_cv.notify_all();
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::sync::Arc;

    use rstest::*;

    use crate::chunk::{ChunkStore, StreamBackend};
    use crate::input::InputFile;
    use crate::pipeline::tasks::FanIn;
    use crate::task::SortAlgorithm;

    use super::{Pipeline, PipelineConfig};

    fn config(workers: u32, chunk_size: u64, fan_in: FanIn) -> PipelineConfig {
        PipelineConfig {
            workers,
            memory: 1 << 20,
            io_ratio: 0.5,
            chunk_size,
            algorithm: SortAlgorithm::Std,
            fan_in,
            skip_sort: false,
        }
    }

    fn read_u32s(path: &std::path::Path) -> Vec<u32> {
        fs::read(path)
            .unwrap()
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
            .collect()
    }

    #[rstest]
    #[case(1, StreamBackend::Buffered)]
    #[case(2, StreamBackend::Buffered)]
    #[case(4, StreamBackend::Mapped)]
    fn test_pipeline_sorts_end_to_end(#[case] workers: u32, #[case] backend: StreamBackend) {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("input");
        let chunk_dir = dir.path().join("chunks");
        fs::create_dir(&chunk_dir).unwrap();

        let values: Vec<u32> = (0..256u32).rev().collect();
        fs::write(&input_path, bytemuck::cast_slice(&values)).unwrap();

        let input = Arc::new(InputFile::open::<u32>(&input_path, backend).unwrap());
        let store = Arc::new(ChunkStore::new(chunk_dir, '_', backend, true));

        // 64-byte chunks -> 16 L0 chunks, fan-in 4 -> two merge levels
        let pipeline: Pipeline<u32> =
            Pipeline::new(config(workers, 64, FanIn::Fixed(4)), Some(input), store.clone());
        let report = pipeline.run().unwrap();

        assert_eq!(report.l0_chunks, 16);
        assert_eq!(report.result.level, 2);

        let sorted = read_u32s(&store.path(report.result));
        assert_eq!(sorted, (0..256u32).collect::<Vec<_>>());
    }

    #[test]
    fn test_pipeline_single_chunk_skips_merging() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("input");
        let chunk_dir = dir.path().join("chunks");
        fs::create_dir(&chunk_dir).unwrap();

        fs::write(&input_path, bytemuck::cast_slice(&[3u32, 1, 2])).unwrap();

        let input = Arc::new(InputFile::open::<u32>(&input_path, StreamBackend::Buffered).unwrap());
        let store = Arc::new(ChunkStore::new(chunk_dir, '_', StreamBackend::Buffered, true));

        let pipeline: Pipeline<u32> =
            Pipeline::new(config(2, 1024, FanIn::Fixed(4)), Some(input), store.clone());
        let report = pipeline.run().unwrap();

        assert_eq!(report.l0_chunks, 1);
        assert_eq!(report.merge_tasks, 0);
        assert_eq!(report.result.level, 0);
        assert_eq!(read_u32s(&store.path(report.result)), vec![1, 2, 3]);
    }

    #[test]
    fn test_merge_only_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let chunk_dir = dir.path().join("chunks");
        fs::create_dir(&chunk_dir).unwrap();

        let store = Arc::new(ChunkStore::new(
            chunk_dir,
            '_',
            StreamBackend::Buffered,
            true,
        ));
        fs::write(store.path(crate::ChunkId::new(0, 0)), bytemuck::cast_slice(&[1u32, 4])).unwrap();
        fs::write(store.path(crate::ChunkId::new(0, 1)), bytemuck::cast_slice(&[2u32, 3])).unwrap();

        let mut cfg = config(2, 1024, FanIn::Fixed(4));
        cfg.skip_sort = true;

        let pipeline: Pipeline<u32> = Pipeline::new(cfg, None, store.clone());
        let report = pipeline.run().unwrap();

        assert_eq!(report.result.level, 1);
        assert_eq!(read_u32s(&store.path(report.result)), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_merge_only_with_one_chunk_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let chunk_dir = dir.path().join("chunks");
        fs::create_dir(&chunk_dir).unwrap();

        let store = Arc::new(ChunkStore::new(
            chunk_dir,
            '_',
            StreamBackend::Buffered,
            true,
        ));
        fs::write(store.path(crate::ChunkId::new(0, 0)), bytemuck::cast_slice(&[1u32])).unwrap();

        let mut cfg = config(2, 1024, FanIn::Fixed(4));
        cfg.skip_sort = true;

        let pipeline: Pipeline<u32> = Pipeline::new(cfg, None, store);
        assert!(pipeline.run().is_err());
    }
}
