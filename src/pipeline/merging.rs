//! Stage 2: the per-worker merging loop.

use std::time::Instant;

use log;

use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::record::Record;

/// Pops merge tasks under the level discipline until the queue drains.
///
/// Exit rules, all decided and accounted under the pipeline lock:
/// an empty queue ends the stage; a worker count above the remaining task
/// count sheds the caller, and the shed decrement lands in the same critical
/// section as the decision, so later checks see it and exactly one worker
/// remains for the root merge. Shed workers hand their buffer memory back on
/// exit, growing the shares of those still merging.
pub(crate) fn run<T: Record>(pipeline: &Pipeline<T>, worker: u32) -> Result<()> {
    let started = Instant::now();
    log::debug!("worker [{}] entering merging stage", worker);

    {
        let mut shared = pipeline.lock()?;
        shared.scheduler.merge_workers += 1;
    }

    loop {
        let mut shared = pipeline.lock()?;

        let queued = shared.scheduler.queue_len() as u32;
        if queued == 0 {
            shared.scheduler.merge_workers -= 1;
            log::debug!(
                "worker [{}] merging stage done in {} ms",
                worker,
                started.elapsed().as_millis()
            );
            return Ok(());
        }

        if shared.scheduler.merge_workers > queued {
            shared.scheduler.merge_workers -= 1;
            log::debug!(
                "worker [{}] shedding: {} workers for {} remaining tasks",
                worker,
                shared.scheduler.merge_workers + 1,
                queued
            );
            return Ok(());
        }

        if shared.scheduler.needs_level_sync() {
            log::debug!(
                "worker [{}] waiting for level drain ({} tasks in flight)",
                worker,
                shared.scheduler.active_tasks()
            );
            let drained = pipeline.wait_level_drain(shared)?;
            drop(drained);
            continue;
        }

        let Some(mut task) = shared.scheduler.pop_merge() else {
            continue;
        };
        let shares = shared.memory.shares();
        drop(shared);

        let result = task.execute(shares.input, shares.output);

        // bookkeeping happens whether the merge succeeded or not, so a
        // worker parked on the level condvar is never left waiting for a
        // task that can no longer be saved
        let mut shared = pipeline.lock()?;
        shared.scheduler.save_merge(&mut task);
        if result.is_err() {
            shared.scheduler.merge_workers -= 1;
        }
        drop(shared);
        pipeline.notify_level_drain();

        result?;
    }
}
