//! In-process engine running a [`Model`] on dedicated worker threads

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use super::{
    CompletionCallback, EngineError, InferRequest, InferenceEngine, Model, Tensor, TensorMap,
    TensorSpec, Timeout,
};
use crate::EngineConfig;

type JobResult = Result<TensorMap, EngineError>;

struct Job {
    id: u64,
    inputs: TensorMap,
    delivery: Delivery,
}

enum Delivery {
    Wait(Sender<JobResult>),
    Callback {
        callback: CompletionCallback,
        in_flight: Arc<AtomicBool>,
    },
}

/// Engine whose jobs run on a fixed pool of worker threads.
///
/// Jobs from all requests share one queue; with more than one worker, jobs
/// may finish out of submission order.
pub struct ThreadedEngine {
    model: Arc<dyn Model>,
    jobs: Sender<Job>,
    job_ids: Arc<AtomicU64>,
}

impl ThreadedEngine {
    pub fn new(model: Arc<dyn Model>, config: &EngineConfig) -> Result<Self, EngineError> {
        let workers = config.workers.max(1);
        let (jobs, rx) = flume::unbounded::<Job>();

        let cores = if config.pin_workers {
            core_affinity::get_core_ids().filter(|ids| !ids.is_empty())
        } else {
            None
        };
        if config.pin_workers && cores.is_none() {
            warn!("CPU pinning requested but core ids are unavailable");
        }

        for index in 0..workers {
            let rx = rx.clone();
            let model = model.clone();
            let core = cores.as_ref().map(|ids| ids[index % ids.len()]);
            std::thread::Builder::new()
                .name(format!("engine-{}", index))
                .spawn(move || worker_loop(index, model, rx, core))
                .map_err(|e| EngineError::Execution(format!("failed to spawn worker: {}", e)))?;
        }

        info!(
            "Engine ready: model '{}' on {} worker(s)",
            model.name(),
            workers
        );

        Ok(Self {
            model,
            jobs,
            job_ids: Arc::new(AtomicU64::new(0)),
        })
    }
}

fn worker_loop(
    index: usize,
    model: Arc<dyn Model>,
    rx: Receiver<Job>,
    core: Option<core_affinity::CoreId>,
) {
    if let Some(core) = core {
        if !core_affinity::set_for_current(core) {
            warn!("Engine worker {} could not be pinned to {:?}", index, core);
        }
    }

    while let Ok(job) = rx.recv() {
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| model.infer(&job.inputs)))
            .unwrap_or_else(|_| Err(EngineError::Execution("model panicked".into())));
        metrics::histogram!("inference_latency_us").record(started.elapsed().as_micros() as f64);

        if let Err(e) = &result {
            debug!(job = job.id, "Job failed: {}", e);
        }

        match job.delivery {
            Delivery::Wait(tx) => {
                // Receiver is gone if the request was dropped mid-flight
                let _ = tx.send(result);
            }
            Delivery::Callback {
                callback,
                in_flight,
            } => {
                in_flight.store(false, Ordering::Release);
                if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                    error!(job = job.id, "Completion callback panicked");
                }
            }
        }
    }

    debug!("Engine worker {} exiting", index);
}

impl InferenceEngine for ThreadedEngine {
    type Request = ThreadedRequest;

    fn create_infer_request(&self) -> Result<ThreadedRequest, EngineError> {
        Ok(ThreadedRequest {
            model: self.model.clone(),
            jobs: self.jobs.clone(),
            job_ids: self.job_ids.clone(),
            inputs: TensorMap::new(),
            pending: None,
            outputs: None,
            in_flight: Arc::new(AtomicBool::new(false)),
        })
    }

    fn model_name(&self) -> &str {
        self.model.name()
    }

    fn inputs(&self) -> &[TensorSpec] {
        self.model.inputs()
    }

    fn outputs(&self) -> &[TensorSpec] {
        self.model.outputs()
    }
}

pub struct ThreadedRequest {
    model: Arc<dyn Model>,
    jobs: Sender<Job>,
    job_ids: Arc<AtomicU64>,
    inputs: TensorMap,
    pending: Option<Receiver<JobResult>>,
    outputs: Option<TensorMap>,
    in_flight: Arc<AtomicBool>,
}

impl ThreadedRequest {
    fn dispatch(&mut self, delivery: Delivery) -> Result<(), EngineError> {
        if let Some(missing) = self
            .model
            .inputs()
            .iter()
            .find(|spec| !self.inputs.contains_key(&spec.name))
        {
            return Err(EngineError::UnknownInput(missing.name.clone()));
        }

        let job = Job {
            id: self.job_ids.fetch_add(1, Ordering::Relaxed),
            inputs: std::mem::take(&mut self.inputs),
            delivery,
        };
        self.outputs = None;
        self.jobs.send(job).map_err(|_| EngineError::Disconnected)
    }
}

impl InferRequest for ThreadedRequest {
    fn set_input(&mut self, name: &str, tensor: Tensor) -> Result<(), EngineError> {
        if self.is_busy() {
            return Err(EngineError::Busy);
        }
        let spec = self
            .model
            .inputs()
            .iter()
            .find(|spec| spec.name == name)
            .ok_or_else(|| EngineError::UnknownInput(name.into()))?;
        if !spec.accepts(tensor.shape()) {
            return Err(EngineError::ShapeMismatch {
                name: name.into(),
                expected: spec.shape.clone(),
                actual: tensor.shape().to_vec(),
            });
        }
        self.inputs.insert(name.to_string(), tensor);
        Ok(())
    }

    fn start_async(&mut self) -> Result<(), EngineError> {
        if self.is_busy() {
            return Err(EngineError::Busy);
        }
        let (tx, rx) = flume::bounded(1);
        self.dispatch(Delivery::Wait(tx))?;
        self.pending = Some(rx);
        Ok(())
    }

    fn start_async_with(&mut self, on_complete: CompletionCallback) -> Result<(), EngineError> {
        if self.is_busy() {
            return Err(EngineError::Busy);
        }
        self.in_flight.store(true, Ordering::Release);
        let delivery = Delivery::Callback {
            callback: on_complete,
            in_flight: self.in_flight.clone(),
        };
        let dispatched = self.dispatch(delivery);
        if dispatched.is_err() {
            self.in_flight.store(false, Ordering::Release);
        }
        dispatched
    }

    fn wait_for(&mut self, timeout: Timeout) -> Result<bool, EngineError> {
        let Some(rx) = self.pending.as_ref() else {
            if self.in_flight.load(Ordering::Acquire) {
                return Err(EngineError::Busy);
            }
            return if self.outputs.is_some() {
                Ok(true)
            } else {
                Err(EngineError::NoResult)
            };
        };

        let received = match timeout {
            Timeout::Infinite => rx.recv().map_err(|_| EngineError::Disconnected),
            Timeout::After(d) => match rx.recv_timeout(d) {
                Ok(result) => Ok(result),
                Err(RecvTimeoutError::Timeout) => return Ok(false),
                Err(RecvTimeoutError::Disconnected) => Err(EngineError::Disconnected),
            },
        };
        self.pending = None;

        self.outputs = Some(received??);
        Ok(true)
    }

    fn output(&self, name: &str) -> Result<Tensor, EngineError> {
        self.outputs
            .as_ref()
            .ok_or(EngineError::NoResult)?
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownOutput(name.into()))
    }

    fn outputs(&self) -> Result<TensorMap, EngineError> {
        self.outputs.clone().ok_or(EngineError::NoResult)
    }

    fn is_busy(&self) -> bool {
        self.pending.is_some() || self.in_flight.load(Ordering::Acquire)
    }
}
