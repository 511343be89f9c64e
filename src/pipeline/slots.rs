//! Two-slot request pool with current/next roles
//!
//! Roles rotate by index over a fixed two-element array; the slots
//! themselves never move. Each slot carries the pending context of its job
//! (normally the frame) so the context is released exactly when the job
//! resolves.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::engine::{InferRequest, InferenceEngine, Tensor, TensorMap, Timeout};
use crate::error::PipelineError;

/// Index of a request slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
enum SlotState<C> {
    Idle,
    Submitted { at: Instant, context: C },
}

struct Slot<R, C> {
    request: R,
    state: SlotState<C>,
}

/// Result of one resolved slot
#[derive(Debug)]
pub struct SlotOutput<C> {
    pub outputs: TensorMap,
    pub context: C,
    /// Submit to completion
    pub latency: Duration,
}

pub struct SlotPool<R: InferRequest, C> {
    slots: [Slot<R, C>; 2],
    current: usize,
}

impl<R: InferRequest, C> SlotPool<R, C> {
    pub fn new<E>(engine: &E) -> Result<Self, PipelineError>
    where
        E: InferenceEngine<Request = R>,
    {
        let slot = || -> Result<Slot<R, C>, PipelineError> {
            Ok(Slot {
                request: engine.create_infer_request()?,
                state: SlotState::Idle,
            })
        };
        Ok(Self {
            slots: [slot()?, slot()?],
            current: 0,
        })
    }

    pub fn current(&self) -> SlotId {
        SlotId(self.current)
    }

    pub fn next(&self) -> SlotId {
        SlotId(1 - self.current)
    }

    /// Next becomes current. Only the role labels move.
    pub fn swap(&mut self) {
        self.current = 1 - self.current;
    }

    pub fn is_busy(&self, slot: SlotId) -> bool {
        matches!(self.slots[slot.0].state, SlotState::Submitted { .. })
    }

    /// Bind `buffer` and start the job without waiting for it.
    pub fn submit(
        &mut self,
        slot: SlotId,
        input: &str,
        buffer: Tensor,
        context: C,
    ) -> Result<(), PipelineError> {
        let entry = &mut self.slots[slot.0];
        if matches!(entry.state, SlotState::Submitted { .. }) {
            return Err(PipelineError::SlotBusy(slot));
        }

        entry.request.set_input(input, buffer)?;
        entry.request.start_async()?;
        entry.state = SlotState::Submitted {
            at: Instant::now(),
            context,
        };
        debug!(%slot, "Submitted");
        Ok(())
    }

    /// Block until the slot's job resolves or `timeout` elapses.
    ///
    /// On timeout the job stays in flight and the call may be repeated. An
    /// engine fault resolves the slot: it becomes idle and the context is
    /// dropped.
    pub fn await_completion(
        &mut self,
        slot: SlotId,
        timeout: Timeout,
    ) -> Result<SlotOutput<C>, PipelineError> {
        let entry = &mut self.slots[slot.0];
        let submitted_at = match &entry.state {
            SlotState::Idle => return Err(PipelineError::SlotIdle(slot)),
            SlotState::Submitted { at, .. } => *at,
        };

        let waited = entry.request.wait_for(timeout);
        if let Ok(false) = waited {
            let after = match timeout {
                Timeout::After(d) => d,
                Timeout::Infinite => submitted_at.elapsed(),
            };
            return Err(PipelineError::Timeout { slot, after });
        }

        let SlotState::Submitted { context, .. } =
            std::mem::replace(&mut entry.state, SlotState::Idle)
        else {
            return Err(PipelineError::SlotIdle(slot));
        };
        waited?;

        Ok(SlotOutput {
            outputs: entry.request.outputs()?,
            context,
            latency: submitted_at.elapsed(),
        })
    }

    /// Wait out every in-flight job and discard its result. Returns how many
    /// jobs were drained.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        for index in 0..self.slots.len() {
            let slot = SlotId(index);
            if !self.is_busy(slot) {
                continue;
            }
            drained += 1;
            if let Err(e) = self.await_completion(slot, Timeout::Infinite) {
                warn!(%slot, "Drained job failed: {}", e);
            }
        }
        if drained > 0 {
            debug!("Drained {} in-flight job(s)", drained);
        }
        drained
    }
}

impl<R: InferRequest, C> Drop for SlotPool<R, C> {
    fn drop(&mut self) {
        self.drain();
    }
}
