//! Stage 1: the per-worker sorting loop.

use std::time::Instant;

use log;

use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::record::Record;

/// Pulls sort tasks until the input is exhausted. Region reservation is a
/// lock-free compare-and-swap on the input position; only chunk registration
/// takes the pipeline lock, so workers sort and persist fully in parallel.
pub(crate) fn run<T: Record>(pipeline: &Pipeline<T>, worker: u32) -> Result<()> {
    let started = Instant::now();
    log::debug!("worker [{}] entering sorting stage", worker);

    let mut chunks = 0u64;
    while let Some(mut task) = pipeline.next_sort_task() {
        task.execute(pipeline.algorithm())?;
        task.release()?;
        pipeline.register_chunk(task.id())?;
        chunks += 1;
    }

    log::debug!(
        "worker [{}] sorting stage done: {} chunks in {} ms",
        worker,
        chunks,
        started.elapsed().as_millis()
    );

    return Ok(());
}
