//! Scheduler: the L0 registry, the merge queue and the level discipline.

use std::collections::VecDeque;
use std::sync::Arc;

use log;

use crate::chunk::{ChunkId, ChunkStore};
use crate::error::{Result, SortError};
use crate::record::Record;
use crate::task::MergeTask;
use crate::tree;

/// Merge fan-in selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FanIn {
    /// Fixed width, clamped up to 2.
    Fixed(usize),
    /// `round(chunk_count ^ (1 / tree_height))`, clamped up to 2.
    Auto { tree_height: u32 },
    /// All L0 chunks feed a single root merge.
    Flat,
}

impl FanIn {
    fn resolve(self, chunk_count: usize) -> usize {
        let k = match self {
            FanIn::Fixed(k) => k,
            FanIn::Flat => chunk_count,
            FanIn::Auto { tree_height } => {
                let height = tree_height.max(1) as f64;
                (chunk_count as f64).powf(1.0 / height).round() as usize
            }
        };
        k.max(2)
    }
}

/// Mutable heart of the pipeline, guarded by the pipeline lock.
///
/// Stage 1 fills the L0 registry; the stage gate turns the registry into the
/// level-ordered merge queue exactly once; stage 2 pops under the level
/// discipline: a task of level L runs only after every lower-level task was
/// saved.
pub(crate) struct Scheduler<T: Record> {
    store: Arc<ChunkStore>,
    fan_in: FanIn,
    l0: Vec<ChunkId>,
    queue: VecDeque<MergeTask<T>>,
    built: bool,
    result: Option<ChunkId>,
    last_level: u32,
    active_tasks: u32,
    /// Workers currently inside the merge loop; used to shed surplus
    /// workers as the queue drains. Mutated only under the pipeline lock so
    /// the shed decision and the count change are one atomic step.
    pub merge_workers: u32,
    l0_total: usize,
    merged_tasks: u64,
}

impl<T: Record> Scheduler<T> {
    pub fn new(store: Arc<ChunkStore>, fan_in: FanIn) -> Self {
        Scheduler {
            store,
            fan_in,
            l0: Vec::new(),
            queue: VecDeque::new(),
            built: false,
            result: None,
            last_level: 1,
            active_tasks: 0,
            merge_workers: 0,
            l0_total: 0,
            merged_tasks: 0,
        }
    }

    /// Registers a persisted level-0 chunk.
    pub fn register_chunk(&mut self, id: ChunkId) {
        self.l0.push(id);
    }

    /// Level-0 chunks registered so far; after queue construction, the total.
    pub fn l0_count(&self) -> usize {
        self.l0_total.max(self.l0.len())
    }

    /// Builds the merge queue from the registry. Idempotent; only the first
    /// call constructs the plan.
    pub fn build_merge_queue(&mut self) -> Result<()> {
        if self.built {
            return Ok(());
        }
        self.built = true;

        if self.l0.is_empty() {
            return Err(SortError::Invariant(
                "sort stage produced no chunks to merge".into(),
            ));
        }

        let fan_in = self.fan_in.resolve(self.l0.len());
        log::debug!(
            "building merge queue over {} chunks, fan-in {}",
            self.l0.len(),
            fan_in
        );

        self.l0_total = self.l0.len();
        let plan = tree::build_plan(std::mem::take(&mut self.l0), fan_in, &self.store)?;
        self.result = Some(plan.result);
        self.queue = plan.tasks;

        log::info!(
            "merge queue ready: {} tasks, result chunk {}",
            self.queue.len(),
            self.store.name(plan.result)
        );

        return Ok(());
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// True when the front task belongs to a level that must not start while
    /// earlier-level tasks are still in flight.
    pub fn needs_level_sync(&self) -> bool {
        match self.queue.front() {
            Some(task) => task.level() > self.last_level && self.active_tasks > 0,
            None => false,
        }
    }

    pub fn active_tasks(&self) -> u32 {
        self.active_tasks
    }

    /// Pops the front task, advancing the level cursor and the in-flight
    /// counter. Caller holds the pipeline lock.
    pub fn pop_merge(&mut self) -> Option<MergeTask<T>> {
        let task = self.queue.pop_front()?;
        self.last_level = self.last_level.max(task.level());
        self.active_tasks += 1;
        Some(task)
    }

    /// Saves a finished merge task: releases it, retires it from the
    /// in-flight count. The caller notifies the level condvar afterwards.
    pub fn save_merge(&mut self, task: &mut MergeTask<T>) {
        task.release();
        self.active_tasks -= 1;
        self.merged_tasks += 1;
    }

    pub fn result(&self) -> Option<ChunkId> {
        self.result
    }

    pub fn merged_tasks(&self) -> u64 {
        self.merged_tasks
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rstest::*;

    use crate::chunk::{ChunkId, ChunkStore, StreamBackend};

    use super::{FanIn, Scheduler};

    #[rstest]
    #[case(FanIn::Fixed(4), 100, 4)]
    #[case(FanIn::Fixed(0), 100, 2)]
    #[case(FanIn::Fixed(1), 100, 2)]
    #[case(FanIn::Flat, 37, 37)]
    #[case(FanIn::Auto { tree_height: 2 }, 16, 4)]
    #[case(FanIn::Auto { tree_height: 2 }, 100, 10)]
    #[case(FanIn::Auto { tree_height: 3 }, 1000, 10)]
    #[case(FanIn::Auto { tree_height: 2 }, 2, 2)]
    fn test_fan_in_resolution(#[case] fan_in: FanIn, #[case] chunks: usize, #[case] expected: usize) {
        assert_eq!(fan_in.resolve(chunks), expected);
    }

    fn scheduler(fan_in: FanIn) -> Scheduler<u32> {
        let store = Arc::new(ChunkStore::new(
            "./chunks".into(),
            '_',
            StreamBackend::Buffered,
            true,
        ));
        Scheduler::new(store, fan_in)
    }

    #[test]
    fn test_build_is_idempotent() {
        let mut sched = scheduler(FanIn::Fixed(2));
        for i in 0..4 {
            sched.register_chunk(ChunkId::new(0, i));
        }

        sched.build_merge_queue().unwrap();
        let len = sched.queue_len();
        sched.build_merge_queue().unwrap();
        assert_eq!(sched.queue_len(), len);
        assert_eq!(sched.result(), Some(ChunkId::new(2, 0)));
    }

    #[test]
    fn test_build_without_chunks_is_fatal() {
        let mut sched = scheduler(FanIn::Fixed(2));
        assert!(sched.build_merge_queue().is_err());
    }

    #[test]
    fn test_level_discipline() {
        let mut sched = scheduler(FanIn::Fixed(2));
        for i in 0..4 {
            sched.register_chunk(ChunkId::new(0, i));
        }
        sched.build_merge_queue().unwrap();
        // queue: (1,0) (1,1) (2,0)

        let mut t0 = sched.pop_merge().unwrap();
        assert_eq!(t0.level(), 1);
        assert!(!sched.needs_level_sync(), "same level never syncs");

        let mut t1 = sched.pop_merge().unwrap();
        assert_eq!(t1.level(), 1);

        // the root is next but two level-1 tasks are in flight
        assert!(sched.needs_level_sync());

        sched.save_merge(&mut t0);
        assert!(sched.needs_level_sync());
        sched.save_merge(&mut t1);
        assert!(!sched.needs_level_sync());

        let root = sched.pop_merge().unwrap();
        assert_eq!(root.level(), 2);
        assert_eq!(root.id(), ChunkId::new(2, 0));
        assert!(sched.pop_merge().is_none());
    }

    #[test]
    fn test_single_chunk_needs_no_merge() {
        let mut sched = scheduler(FanIn::Fixed(4));
        sched.register_chunk(ChunkId::new(0, 0));
        sched.build_merge_queue().unwrap();

        assert_eq!(sched.queue_len(), 0);
        assert_eq!(sched.result(), Some(ChunkId::new(0, 0)));
    }
}
