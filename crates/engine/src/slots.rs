//! Inference slot pool
//!
//! An engine owns a fixed number of inference slots (`num_ireq`). A request
//! holds one slot from submission to completion; when none is free the
//! engine stops accepting work until a completion returns one.

use enginelink_common::METRICS;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Starting,
    Listening,
    Reshaping,
    DispatchingInference,
    Returning,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Starting => "STARTING",
            EngineState::Listening => "LISTENING",
            EngineState::Reshaping => "RESHAPING",
            EngineState::DispatchingInference => "DISPATCHING_INFERENCE",
            EngineState::Returning => "RETURNING",
            EngineState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Counters shared between the engine loop and observers
#[derive(Debug)]
pub struct EngineStats {
    state: Mutex<EngineState>,
    free_slots: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    acquisitions: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
}

impl EngineStats {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(EngineState::Starting),
            free_slots: AtomicUsize::new(capacity),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            acquisitions: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: EngineState) {
        let mut current = self.state.lock();
        if *current != state {
            trace!("Engine state {} -> {}", *current, state);
            *current = state;
        }
    }

    pub fn free_slots(&self) -> usize {
        self.free_slots.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously held slots
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Acquire)
    }

    /// Slots handed out since start
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Acquire)
    }

    /// Inferences whose completion was processed
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Requests refused before taking a slot
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Acquire)
    }

    pub(crate) fn record_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::AcqRel);
        METRICS.engine.requests_rejected.inc();
    }

    pub(crate) fn record_completion(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }
}

/// Free list of inference slot indices
pub struct SlotPool {
    free: VecDeque<usize>,
    capacity: usize,
    stats: Arc<EngineStats>,
}

impl SlotPool {
    /// Create a pool of `capacity` slots, all free
    pub fn new(capacity: usize) -> Self {
        Self {
            free: (0..capacity).collect(),
            capacity,
            stats: Arc::new(EngineStats::new(capacity)),
        }
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// No slot is held
    pub fn is_idle(&self) -> bool {
        self.free.len() == self.capacity
    }

    /// Take the oldest free slot, if any
    pub fn try_acquire(&mut self) -> Option<usize> {
        let slot = self.free.pop_front()?;

        let in_flight = self.capacity - self.free.len();
        self.stats.free_slots.store(self.free.len(), Ordering::Release);
        self.stats.in_flight.store(in_flight, Ordering::Release);
        self.stats.peak_in_flight.fetch_max(in_flight, Ordering::AcqRel);
        self.stats.acquisitions.fetch_add(1, Ordering::AcqRel);
        METRICS.engine.inflight.set(in_flight as i64);

        trace!("Acquired slot {} ({} free)", slot, self.free.len());
        Some(slot)
    }

    /// Return a held slot
    pub fn release(&mut self, slot: usize) {
        if slot >= self.capacity || self.free.contains(&slot) {
            warn!("Ignoring release of slot {} which is not held", slot);
            return;
        }
        self.free.push_back(slot);

        let in_flight = self.capacity - self.free.len();
        self.stats.free_slots.store(self.free.len(), Ordering::Release);
        self.stats.in_flight.store(in_flight, Ordering::Release);
        METRICS.engine.inflight.set(in_flight as i64);

        trace!("Released slot {} ({} free)", slot, self.free.len());
    }
}
