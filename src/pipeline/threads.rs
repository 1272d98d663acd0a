//! Worker pool: spawning, joining, failure collection and the stage gate.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;

use log;

use crate::error::{poisoned, Result, SortError};

/// Fixed-size pool of `W` OS threads, one of which is the calling thread.
///
/// `spawn_and_join` runs the worker body on every thread with ids
/// `0..W-1`, joins them all, and reports the collected failures in one
/// error. A failing worker never cancels the others; they drain naturally.
pub(crate) struct ThreadPool {
    workers: u32,
    active: AtomicU32,
}

impl ThreadPool {
    pub fn new(workers: u32) -> Self {
        ThreadPool {
            workers: workers.max(1),
            active: AtomicU32::new(0),
        }
    }

    /// Threads currently inside the worker body.
    pub fn active(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    pub fn spawn_and_join<F>(&self, work: F) -> Result<()>
    where
        F: Fn(u32) -> Result<()> + Sync,
    {
        log::info!("starting {} pipeline workers", self.workers);

        let failures = thread::scope(|scope| {
            let work = &work;

            let handles: Vec<_> = (1..self.workers)
                .map(|id| {
                    let active = &self.active;
                    scope.spawn(move || {
                        active.fetch_add(1, Ordering::AcqRel);
                        let result = work(id);
                        active.fetch_sub(1, Ordering::AcqRel);
                        result
                    })
                })
                .collect();

            // worker 0 is the caller
            self.active.fetch_add(1, Ordering::AcqRel);
            let first = work(0);
            self.active.fetch_sub(1, Ordering::AcqRel);

            let mut failures = Vec::new();
            if let Err(err) = first {
                failures.push((0, err));
            }

            for (idx, handle) in handles.into_iter().enumerate() {
                let id = idx as u32 + 1;
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => failures.push((id, err)),
                    Err(_) => failures.push((
                        id,
                        SortError::Invariant(format!("worker [{}] panicked", id)),
                    )),
                }
            }

            failures
        });

        if failures.is_empty() {
            Ok(())
        } else {
            for (id, err) in &failures {
                log::error!("worker [{}] failed: {}", id, err);
            }
            Err(SortError::Workers(failures))
        }
    }
}

/// The latch between the two pipeline stages.
///
/// Every worker arrives exactly once, clean or not. The last arrival runs
/// the queue-construction closure and opens the gate; everyone else parks
/// until then. A dirty arrival (a worker whose sort stage failed) or a
/// build failure poisons the gate: construction is skipped and every worker
/// fails the run instead of merging over an incomplete chunk registry.
pub(crate) struct StageGate {
    expected: u32,
    state: Mutex<GateState>,
    cv: Condvar,
}

struct GateState {
    arrived: u32,
    open: bool,
    failure: Option<String>,
}

impl StageGate {
    pub fn new(expected: u32) -> Self {
        StageGate {
            expected,
            state: Mutex::new(GateState {
                arrived: 0,
                open: false,
                failure: None,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn arrive_and_build<F>(&self, clean: bool, build: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut state = self.state.lock().map_err(poisoned)?;

        state.arrived += 1;
        if state.arrived > self.expected {
            return Err(SortError::Invariant(format!(
                "stage gate overflow: {} arrivals for {} workers",
                state.arrived, self.expected
            )));
        }

        if !clean && state.failure.is_none() {
            state.failure = Some("a worker failed before the merge stage".into());
        }

        if state.arrived == self.expected {
            if state.failure.is_none() {
                if let Err(err) = build() {
                    state.failure = Some(err.to_string());
                    state.open = true;
                    self.cv.notify_all();
                    return Err(err);
                }
            }
            state.open = true;
            self.cv.notify_all();
        } else {
            while !state.open {
                state = self.cv.wait(state).map_err(poisoned)?;
            }
        }

        match &state.failure {
            None => Ok(()),
            Some(msg) => Err(SortError::Invariant(format!(
                "merge stage not started: {}",
                msg
            ))),
        }
    }
}
