//! Pipeline driver: source → preprocess → submit → wait → postprocess → sink
//!
//! Every run, whatever its outcome, drains in-flight jobs before stopping
//! the frame source and returning.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::{
    queue::{AsyncInferQueue, Completed},
    slots::{SlotOutput, SlotPool},
    CancelToken, ThroughputCounter,
};
use crate::capture::{CaptureError, Frame, FrameSource, ScopedSource};
use crate::engine::{InferenceEngine, Timeout};
use crate::error::PipelineError;
use crate::postprocess::{Postprocessor, Sink};
use crate::preprocess::{Preprocessor, TargetShape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One slot, submit then wait
    Sync,
    /// Two slots, next frame submitted before waiting on current
    Async,
    /// N slots with completion callbacks
    Queue,
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Model input the preprocessed tensor is bound to
    pub input: String,
    pub target: TargetShape,
    pub wait_timeout: Timeout,
    pub queue_size: usize,
    pub throughput_window: usize,
}

/// Collaborators around the engine
#[derive(Clone)]
pub struct Stages {
    pub preprocessor: Arc<dyn Preprocessor>,
    pub postprocessor: Arc<dyn Postprocessor>,
    pub sink: Arc<Mutex<dyn Sink>>,
}

impl Stages {
    pub fn new(
        preprocessor: impl Preprocessor + 'static,
        postprocessor: impl Postprocessor + 'static,
        sink: impl Sink + 'static,
    ) -> Self {
        Self {
            preprocessor: Arc::new(preprocessor),
            postprocessor: Arc::new(postprocessor),
            sink: Arc::new(Mutex::new(sink)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub mode: Mode,
    pub frames: u64,
    pub elapsed: Duration,
    /// Cumulative from pipeline start
    pub fps: f64,
    pub cancelled: bool,
}

pub struct Driver<'e, E: InferenceEngine> {
    engine: &'e E,
    settings: DriverSettings,
    cancel: CancelToken,
}

impl<'e, E: InferenceEngine> Driver<'e, E> {
    pub fn new(engine: &'e E, settings: DriverSettings) -> Self {
        Self {
            engine,
            settings,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run(
        &self,
        mode: Mode,
        source: &mut dyn FrameSource,
        stages: &Stages,
    ) -> Result<RunSummary, PipelineError> {
        match mode {
            Mode::Sync => self.run_sync(source, stages),
            Mode::Async => self.run_async(source, stages),
            Mode::Queue => self.run_queued(source, stages),
        }
    }

    /// Two-slot mode. Results reach the sink in capture order.
    #[instrument(skip_all, fields(model = self.engine.model_name()))]
    pub fn run_async(
        &self,
        source: &mut dyn FrameSource,
        stages: &Stages,
    ) -> Result<RunSummary, PipelineError> {
        let counter = ThroughputCounter::new(self.settings.throughput_window);
        let mut pool: SlotPool<E::Request, Frame> = SlotPool::new(self.engine)?;
        let mut source = ScopedSource::start(source)?;

        let outcome = self.pump_async(&mut pool, &mut source, stages, &counter);
        pool.drain();
        let stopped = source.finish();
        self.conclude(Mode::Async, outcome, stopped, &counter)
    }

    fn pump_async(
        &self,
        pool: &mut SlotPool<E::Request, Frame>,
        source: &mut ScopedSource<'_>,
        stages: &Stages,
        counter: &ThroughputCounter,
    ) -> Result<bool, PipelineError> {
        let Some(first) = source.next_frame()? else {
            return Ok(false);
        };
        let current = pool.current();
        self.submit(pool, current, first, stages)?;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(true);
            }

            let next = source.next_frame()?;
            let end_of_stream = next.is_none();
            if let Some(frame) = next {
                let slot = pool.next();
                if let Err(e) = self.submit(pool, slot, frame, stages) {
                    // current was submitted before the failure and still reaches the sink
                    let done = pool.await_completion(pool.current(), self.settings.wait_timeout)?;
                    self.deliver(done, stages, counter)?;
                    return Err(e);
                }
            }

            if self.cancel.is_cancelled() {
                return Ok(true);
            }

            let done = pool.await_completion(pool.current(), self.settings.wait_timeout)?;
            self.deliver(done, stages, counter)?;

            if end_of_stream {
                return Ok(false);
            }
            pool.swap();
        }
    }

    /// Single-slot baseline: every wait stalls the capture side.
    #[instrument(skip_all, fields(model = self.engine.model_name()))]
    pub fn run_sync(
        &self,
        source: &mut dyn FrameSource,
        stages: &Stages,
    ) -> Result<RunSummary, PipelineError> {
        let counter = ThroughputCounter::new(self.settings.throughput_window);
        let mut pool: SlotPool<E::Request, Frame> = SlotPool::new(self.engine)?;
        let mut source = ScopedSource::start(source)?;

        let outcome = self.pump_sync(&mut pool, &mut source, stages, &counter);
        pool.drain();
        let stopped = source.finish();
        self.conclude(Mode::Sync, outcome, stopped, &counter)
    }

    fn pump_sync(
        &self,
        pool: &mut SlotPool<E::Request, Frame>,
        source: &mut ScopedSource<'_>,
        stages: &Stages,
        counter: &ThroughputCounter,
    ) -> Result<bool, PipelineError> {
        let slot = pool.current();
        loop {
            if self.cancel.is_cancelled() {
                return Ok(true);
            }
            let Some(frame) = source.next_frame()? else {
                return Ok(false);
            };
            self.submit(pool, slot, frame, stages)?;
            let done = pool.await_completion(slot, self.settings.wait_timeout)?;
            self.deliver(done, stages, counter)?;
        }
    }

    /// Queue mode. The sink may see frames out of capture order.
    #[instrument(skip_all, fields(model = self.engine.model_name(), slots = self.settings.queue_size))]
    pub fn run_queued(
        &self,
        source: &mut dyn FrameSource,
        stages: &Stages,
    ) -> Result<RunSummary, PipelineError> {
        let counter = Arc::new(ThroughputCounter::new(self.settings.throughput_window));
        let failure: Arc<Mutex<Option<PipelineError>>> = Arc::default();

        let callback = {
            let counter = counter.clone();
            let failure = failure.clone();
            let postprocessor = stages.postprocessor.clone();
            let sink = stages.sink.clone();
            move |done: Completed<Frame>| {
                let Completed {
                    slot,
                    outputs,
                    context: frame,
                    latency,
                } = done;
                metrics::histogram!("slot_latency_us").record(latency.as_micros() as f64);

                let delivered = outputs.map_err(PipelineError::from).and_then(|outputs| {
                    let reading = counter.record();
                    let annotated = postprocessor.postprocess(&outputs, frame, reading)?;
                    sink.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .consume(annotated)?;
                    Ok(())
                });

                if let Err(e) = delivered {
                    let mut first = failure.lock().unwrap_or_else(PoisonError::into_inner);
                    if first.is_none() {
                        error!(%slot, "Queued job failed: {}", e);
                        *first = Some(e);
                    }
                }
            }
        };

        let mut queue: AsyncInferQueue<E::Request, Frame> =
            AsyncInferQueue::new(self.engine, self.settings.queue_size, callback)?;
        let mut source = ScopedSource::start(source)?;

        let outcome = self.pump_queued(&mut queue, &mut source, stages, &failure);
        queue.wait_all();
        let stopped = source.finish();

        let outcome = outcome.and_then(|cancelled| {
            match failure.lock().unwrap_or_else(PoisonError::into_inner).take() {
                Some(e) => Err(e),
                None => Ok(cancelled),
            }
        });
        self.conclude(Mode::Queue, outcome, stopped, &counter)
    }

    fn pump_queued(
        &self,
        queue: &mut AsyncInferQueue<E::Request, Frame>,
        source: &mut ScopedSource<'_>,
        stages: &Stages,
        failure: &Mutex<Option<PipelineError>>,
    ) -> Result<bool, PipelineError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(true);
            }
            if failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
            {
                return Ok(false);
            }

            let Some(frame) = source.next_frame()? else {
                return Ok(false);
            };
            let tensor = stages
                .preprocessor
                .preprocess(&frame, &self.settings.target)?;
            queue.submit(&self.settings.input, tensor, frame)?;
        }
    }

    fn submit(
        &self,
        pool: &mut SlotPool<E::Request, Frame>,
        slot: super::SlotId,
        frame: Frame,
        stages: &Stages,
    ) -> Result<(), PipelineError> {
        let tensor = stages
            .preprocessor
            .preprocess(&frame, &self.settings.target)?;
        pool.submit(slot, &self.settings.input, tensor, frame)
    }

    fn deliver(
        &self,
        done: SlotOutput<Frame>,
        stages: &Stages,
        counter: &ThroughputCounter,
    ) -> Result<(), PipelineError> {
        metrics::histogram!("slot_latency_us").record(done.latency.as_micros() as f64);
        let reading = counter.record();
        let annotated = stages
            .postprocessor
            .postprocess(&done.outputs, done.context, reading)?;
        stages
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .consume(annotated)?;
        Ok(())
    }

    fn conclude(
        &self,
        mode: Mode,
        outcome: Result<bool, PipelineError>,
        stopped: Result<(), CaptureError>,
        counter: &ThroughputCounter,
    ) -> Result<RunSummary, PipelineError> {
        let cancelled = match (outcome, stopped) {
            (Ok(cancelled), Ok(())) => cancelled,
            (Ok(_), Err(stop)) => return Err(stop.into()),
            (Err(e), stopped) => {
                if let Err(stop) = stopped {
                    warn!("Frame source also failed to stop: {}", stop);
                }
                debug!(?mode, "Run aborted after {} frames", counter.frames());
                return Err(e);
            }
        };

        let reading = counter.snapshot();
        let summary = RunSummary {
            mode,
            frames: reading.frames,
            elapsed: reading.elapsed,
            fps: reading.fps,
            cancelled,
        };
        info!(
            "{:?} run finished: {} frames in {:.2?} ({:.1} fps){}",
            mode,
            summary.frames,
            summary.elapsed,
            summary.fps,
            if cancelled { ", cancelled" } else { "" }
        );
        Ok(summary)
    }
}
