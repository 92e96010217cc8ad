//! Process-wide run state and the single-flight lock.
//!
//! `Idle -> Running` is a compare-and-swap, so of any number of concurrent
//! start attempts exactly one wins. The winner holds a [`RunLock`]; dropping
//! it puts the state back to `Idle` whether the run finished, returned early
//! or panicked.

use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle of the single run slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RunState {
    /// No run; a start is accepted.
    Idle = 0,
    /// A run is walking the queue.
    Running = 1,
    /// Stop asked for; the run has not reached a checkpoint yet.
    StopRequested = 2,
    /// The cancelled run has returned and is releasing the slot.
    Stopped = 3,
}

impl RunState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RunState::Running,
            2 => RunState::StopRequested,
            3 => RunState::Stopped,
            _ => RunState::Idle,
        }
    }
}

/// Shared, lock-free holder of the [`RunState`].
#[derive(Debug, Default)]
pub struct RunStateCell(AtomicU8);

impl RunStateCell {
    /// New cell in `Idle`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current state.
    pub fn get(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: RunState, to: RunState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claims the single-flight slot.
    pub fn try_acquire(self: &Arc<Self>) -> Option<RunLock> {
        self.transition(RunState::Idle, RunState::Running)
            .then(|| RunLock {
                cell: Arc::clone(self),
            })
    }

    /// `Running -> StopRequested`. False if no run was running.
    pub fn request_stop(&self) -> bool {
        self.transition(RunState::Running, RunState::StopRequested)
    }
}

/// Proof of holding the single-flight slot.
#[derive(Debug)]
pub struct RunLock {
    cell: Arc<RunStateCell>,
}

impl RunLock {
    /// The run body has stopped after a cancellation.
    pub fn mark_stopped(&self) {
        self.cell
            .0
            .store(RunState::Stopped as u8, Ordering::Release);
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.cell.0.store(RunState::Idle as u8, Ordering::Release);
    }
}
