//! Sort and merge tasks: the units of pipeline work.

use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use bytemuck::Zeroable;
use log;
use rayon::prelude::*;

use crate::chunk::{ChunkId, ChunkInput, ChunkOutput, ChunkStore};
use crate::error::{Result, SortError};
use crate::input::InputFile;
use crate::record::{round_down, Record};

/// Write buffer used when persisting a sorted chunk; the payload leaves in
/// one bulk write, so this only smooths the header-less tail.
const SORT_PERSIST_BUF: usize = 64 * 1024;

/// In-memory sort used by the sort stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortAlgorithm {
    /// `slice::sort_unstable`.
    #[default]
    Std,
    /// rayon `par_sort_unstable`.
    Parallel,
    /// Least-significant-digit radix sort over the record bytes.
    Radix,
}

impl FromStr for SortAlgorithm {
    type Err = SortError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "std" => Ok(SortAlgorithm::Std),
            "parallel" => Ok(SortAlgorithm::Parallel),
            "radix" => Ok(SortAlgorithm::Radix),
            other => Err(SortError::Config(format!("unknown sort algorithm '{}'", other))),
        }
    }
}

/// Stage-1 task: load one input region, sort it in place, persist it as a
/// level-0 chunk.
pub struct SortTask<T: Record> {
    input: Arc<InputFile>,
    offset: u64,
    bytes: u64,
    id: ChunkId,
    store: Arc<ChunkStore>,
    data: Vec<T>,
    persisted: bool,
}

impl<T: Record> SortTask<T> {
    pub(crate) fn new(
        input: Arc<InputFile>,
        offset: u64,
        bytes: u64,
        id: ChunkId,
        store: Arc<ChunkStore>,
    ) -> Self {
        SortTask {
            input,
            offset,
            bytes,
            id,
            store,
            data: Vec::new(),
            persisted: false,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn count(&self) -> u64 {
        self.bytes / T::SIZE as u64
    }

    /// Loads the owned region and sorts it ascending.
    pub fn execute(&mut self, algorithm: SortAlgorithm) -> Result<()> {
        let started = Instant::now();

        let count = (self.bytes / T::SIZE as u64) as usize;
        self.data = vec![T::zeroed(); count];
        self.input.read_region(self.offset, &mut self.data)?;

        match algorithm {
            SortAlgorithm::Std => self.data.sort_unstable(),
            SortAlgorithm::Parallel => self.data.par_sort_unstable(),
            SortAlgorithm::Radix => radix_sort(&mut self.data),
        }

        log::debug!(
            "sorted chunk {} ({} records) in {} ms",
            self.store.name(self.id),
            count,
            started.elapsed().as_millis()
        );

        return Ok(());
    }

    /// Persists the sorted region as the level-0 chunk file. Idempotent.
    pub fn release(&mut self) -> Result<()> {
        if self.persisted {
            return Ok(());
        }

        let mut out: ChunkOutput<T> =
            ChunkOutput::create(self.id, &self.store, SORT_PERSIST_BUF, self.bytes)?;
        out.put_slice(&self.data)?;
        out.close()?;

        self.persisted = true;
        self.data = Vec::new();

        return Ok(());
    }
}

/// Stage-2 task: k-way merge of sorted input chunks into one output chunk
/// whose level is one above the highest input level.
pub struct MergeTask<T: Record> {
    inputs: Vec<ChunkId>,
    output: ChunkId,
    store: Arc<ChunkStore>,
    records: u64,
    released: bool,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Record> MergeTask<T> {
    pub(crate) fn new(inputs: Vec<ChunkId>, output: ChunkId, store: Arc<ChunkStore>) -> Self {
        MergeTask {
            inputs,
            output,
            store,
            records: 0,
            released: false,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.output
    }

    pub fn level(&self) -> u32 {
        self.output.level
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Runs the merge with the given input/output buffer budgets in bytes.
    ///
    /// The input budget is split evenly across the sources and both shares
    /// are rounded down to whole records; a share of zero is fatal. Source
    /// files are deleted afterwards when the store removes merged chunks.
    pub fn execute(&mut self, in_budget: usize, out_budget: usize) -> Result<()> {
        let started = Instant::now();

        let ick = round_down(in_budget as u64 / self.inputs.len() as u64, T::SIZE as u64) as usize;
        let ock = round_down(out_budget as u64, T::SIZE as u64) as usize;
        if ick == 0 || ock == 0 {
            return Err(SortError::Config(format!(
                "merge buffer budget exhausted: {} bytes in / {} bytes out across {} inputs",
                in_budget,
                out_budget,
                self.inputs.len()
            )));
        }

        let mut sources = Vec::with_capacity(self.inputs.len());
        for id in &self.inputs {
            sources.push(ChunkInput::<T>::open(*id, &self.store, ick)?);
        }

        let expected: u64 = sources.iter().map(|s| s.size()).sum();
        let mut out = ChunkOutput::create(self.output, &self.store, ock, expected)?;

        if sources.len() == 2 {
            two_way_merge(&mut sources, &mut out)?;
        } else {
            heap_merge(&mut sources, &mut out)?;
        }

        out.close()?;
        drop(sources);
        self.records = expected / T::SIZE as u64;

        if self.store.remove_merged() {
            for id in &self.inputs {
                self.store.remove(*id);
            }
        }

        log::debug!(
            "merged {} chunks into {} ({} records) in {} ms",
            self.inputs.len(),
            self.store.name(self.output),
            self.records,
            started.elapsed().as_millis()
        );

        return Ok(());
    }

    /// Drops the task's remaining state. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.inputs = Vec::new();
        self.released = true;
    }
}

/// Two-source fast path. On equal values side 0 is written and advanced;
/// records are pure keys, so the choice of side is unobservable.
fn two_way_merge<T: Record>(
    sources: &mut [ChunkInput<T>],
    out: &mut ChunkOutput<T>,
) -> Result<()> {
    let (left, right) = sources.split_at_mut(1);
    let a = &mut left[0];
    let b = &mut right[0];

    loop {
        let av = a.value();
        let bv = b.value();

        if bv < av {
            out.put(bv)?;
            if !b.next()? {
                return a.copy_to(out);
            }
        } else {
            out.put(av)?;
            if !a.next()? {
                return b.copy_to(out);
            }
        }
    }
}

/// Priority-queue path for three or more sources. Once a single source
/// remains it is drained through the bulk copy path.
fn heap_merge<T: Record>(sources: &mut [ChunkInput<T>], out: &mut ChunkOutput<T>) -> Result<()> {
    let mut heap: BinaryHeap<(Reverse<T>, usize)> = sources
        .iter()
        .enumerate()
        .map(|(idx, s)| (Reverse(s.value()), idx))
        .collect();

    loop {
        if heap.len() == 1 {
            if let Some((Reverse(value), idx)) = heap.pop() {
                out.put(value)?;
                if sources[idx].next()? {
                    sources[idx].copy_to(out)?;
                }
            }
            return Ok(());
        }

        let Some((Reverse(value), idx)) = heap.pop() else {
            return Ok(());
        };

        out.put(value)?;
        if sources[idx].next()? {
            heap.push((Reverse(sources[idx].value()), idx));
        }
    }
}

/// LSD radix sort on the widened record key, one byte per pass.
fn radix_sort<T: Record>(data: &mut [T]) {
    if data.len() <= 1 {
        return;
    }

    let mut src = data.to_vec();
    let mut dst = vec![T::zeroed(); data.len()];

    for pass in 0..T::SIZE {
        let shift = (pass * 8) as u32;

        let mut counts = [0usize; 256];
        for value in &src {
            counts[((value.sort_key() >> shift) & 0xff) as usize] += 1;
        }

        // a pass with every key in one bucket moves nothing
        if counts.iter().any(|&c| c == src.len()) {
            continue;
        }

        let mut offsets = [0usize; 256];
        let mut acc = 0;
        for (offset, count) in offsets.iter_mut().zip(counts) {
            *offset = acc;
            acc += count;
        }

        for value in &src {
            let bucket = ((value.sort_key() >> shift) & 0xff) as usize;
            dst[offsets[bucket]] = *value;
            offsets[bucket] += 1;
        }

        std::mem::swap(&mut src, &mut dst);
    }

    data.copy_from_slice(&src);
}
