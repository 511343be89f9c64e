//! N-slot request queue with completion callbacks
//!
//! Idle slot indices circulate through a bounded channel: `submit` takes one
//! (blocking while none are free) and the completion path puts it back after
//! the user callback has returned. Callbacks run on engine threads and may
//! overlap each other and the submitter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender};
use tracing::{debug, info};

use super::SlotId;
use crate::engine::{EngineError, InferRequest, InferenceEngine, Tensor, TensorMap};
use crate::error::PipelineError;

/// What the completion callback receives for one job.
#[derive(Debug)]
pub struct Completed<C> {
    pub slot: SlotId,
    pub outputs: Result<TensorMap, EngineError>,
    /// The context passed to `submit` for this job
    pub context: C,
    /// Submit to completion
    pub latency: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    Idle,
    Submitted,
    /// Callback running
    Completed,
}

type Callback<C> = Box<dyn Fn(Completed<C>) + Send + Sync>;

#[derive(Default)]
struct Stats {
    submitted: AtomicU64,
    completed: AtomicU64,
}

struct Shared<C> {
    phases: Mutex<Vec<SlotPhase>>,
    settled: Condvar,
    callback: Callback<C>,
    idle_tx: Sender<usize>,
    stats: CachePadded<Stats>,
}

impl<C> Shared<C> {
    fn phases(&self) -> MutexGuard<'_, Vec<SlotPhase>> {
        self.phases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, index: usize, phase: SlotPhase) {
        self.phases()[index] = phase;
    }

    /// Mark the slot idle and hand its index back to submitters. Returns how
    /// many slots are still busy.
    fn release(&self, index: usize) -> usize {
        let in_flight = {
            let mut phases = self.phases();
            phases[index] = SlotPhase::Idle;
            // Under the lock, so a returning `wait_all` always sees the slot ready.
            // Capacity equals the slot count and each index is out at most once.
            let _ = self.idle_tx.try_send(index);
            phases.iter().filter(|&&p| p != SlotPhase::Idle).count()
        };
        self.settled.notify_all();
        in_flight
    }

    fn complete(&self, completed: Completed<C>) {
        let _release = Release {
            shared: self,
            index: completed.slot.0,
        };
        self.set_phase(completed.slot.0, SlotPhase::Completed);
        (self.callback)(completed);
    }
}

/// Returns a slot to the idle pool, including when the callback panics.
struct Release<'a, C> {
    shared: &'a Shared<C>,
    index: usize,
}

impl<C> Drop for Release<'_, C> {
    fn drop(&mut self) {
        self.shared.stats.completed.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.shared.release(self.index);
        metrics::gauge!("queue_in_flight").set(in_flight as f64);
    }
}

pub struct AsyncInferQueue<R: InferRequest, C: Send + 'static> {
    requests: Vec<R>,
    idle_rx: Receiver<usize>,
    shared: Arc<Shared<C>>,
}

impl<R: InferRequest, C: Send + 'static> AsyncInferQueue<R, C> {
    pub fn new<E, F>(engine: &E, size: usize, callback: F) -> Result<Self, PipelineError>
    where
        E: InferenceEngine<Request = R>,
        F: Fn(Completed<C>) + Send + Sync + 'static,
    {
        if size == 0 {
            return Err(PipelineError::EmptyPool);
        }

        let requests = (0..size)
            .map(|_| engine.create_infer_request())
            .collect::<Result<Vec<_>, _>>()?;

        let (idle_tx, idle_rx) = flume::bounded(size);
        for index in 0..size {
            let _ = idle_tx.try_send(index);
        }

        info!("Async queue ready with {} slots", size);

        Ok(Self {
            requests,
            idle_rx,
            shared: Arc::new(Shared {
                phases: Mutex::new(vec![SlotPhase::Idle; size]),
                settled: Condvar::new(),
                callback: Box::new(callback),
                idle_tx,
                stats: CachePadded::new(Stats::default()),
            }),
        })
    }

    /// Start a job on any idle slot, blocking while all slots are busy.
    /// `context` comes back unchanged in the job's [`Completed`].
    pub fn submit(&mut self, input: &str, buffer: Tensor, context: C) -> Result<SlotId, PipelineError> {
        let index = self
            .idle_rx
            .recv()
            .map_err(|_| PipelineError::Engine(EngineError::Disconnected))?;
        let slot = SlotId(index);
        self.shared.set_phase(index, SlotPhase::Submitted);

        let shared = self.shared.clone();
        let submitted_at = Instant::now();
        let request = &mut self.requests[index];
        let started = request.set_input(input, buffer).and_then(|()| {
            request.start_async_with(Box::new(move |outputs| {
                shared.complete(Completed {
                    slot,
                    outputs,
                    context,
                    latency: submitted_at.elapsed(),
                });
            }))
        });

        if let Err(e) = started {
            debug!(%slot, "Submit failed: {}", e);
            self.shared.release(index);
            return Err(e.into());
        }

        self.shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(slot)
    }

    /// Block until every submitted job's callback has returned.
    pub fn wait_all(&self) {
        let phases = self.shared.phases();
        let _settled = self
            .shared
            .settled
            .wait_while(phases, |phases| phases.iter().any(|&p| p != SlotPhase::Idle))
            .unwrap_or_else(PoisonError::into_inner);
    }

    pub fn size(&self) -> usize {
        self.requests.len()
    }

    /// Slots currently submitted or running their callback
    pub fn in_flight(&self) -> usize {
        self.shared
            .phases()
            .iter()
            .filter(|&&p| p != SlotPhase::Idle)
            .count()
    }

    /// True when `submit` would not block
    pub fn is_ready(&self) -> bool {
        !self.idle_rx.is_empty()
    }

    pub fn phase(&self, slot: SlotId) -> Option<SlotPhase> {
        self.shared.phases().get(slot.0).copied()
    }

    pub fn submitted(&self) -> u64 {
        self.shared.stats.submitted.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.shared.stats.completed.load(Ordering::Relaxed)
    }
}

impl<R: InferRequest, C: Send + 'static> Drop for AsyncInferQueue<R, C> {
    fn drop(&mut self) {
        self.wait_all();
    }
}
