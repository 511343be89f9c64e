//! Inference engine adapter contract
//!
//! The engine is an opaque collaborator. The pipeline only needs to bind an
//! input to a request, start it without blocking, and later either wait for
//! it or be called back with its outputs.

pub mod model;
pub mod threaded;

pub use model::{DominantColor, Model};
pub use threaded::{ThreadedEngine, ThreadedRequest};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Named tensors, keyed by input or output name
pub type TensorMap = HashMap<String, Tensor>;

/// Invoked on an engine thread once an async job finishes.
pub type CompletionCallback = Box<dyn FnOnce(Result<TensorMap, EngineError>) + Send + 'static>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("unknown input '{0}'")]
    UnknownInput(String),
    #[error("unknown output '{0}'")]
    UnknownOutput(String),
    #[error("input '{name}' expects shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("request already has a job in flight")]
    Busy,
    #[error("no completed job on this request")]
    NoResult,
    #[error("inference failed: {0}")]
    Execution(String),
    #[error("engine workers have shut down")]
    Disconnected,
}

/// Dense f32 tensor. The buffer is shared so outputs can be handed out
/// without copying.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Arc<[f32]>,
}

impl Tensor {
    /// Returns `None` if `data` does not fill `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Option<Self> {
        if shape.iter().product::<usize>() != data.len() {
            return None;
        }
        Some(Self {
            shape,
            data: data.into(),
        })
    }

    pub fn from_slice(data: &[f32]) -> Self {
        Self {
            shape: vec![data.len()],
            data: data.into(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Name and shape of a model input or output. A zero dimension accepts any
/// size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    pub fn accepts(&self, shape: &[usize]) -> bool {
        self.shape.len() == shape.len()
            && self
                .shape
                .iter()
                .zip(shape)
                .all(|(&want, &got)| want == 0 || want == got)
    }
}

/// Wait bound for [`InferRequest::wait_for`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Infinite,
    After(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::After(d)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(d: Option<Duration>) -> Self {
        d.map_or(Timeout::Infinite, Timeout::After)
    }
}

/// One reusable execution context on the engine.
pub trait InferRequest: Send {
    /// Bind `tensor` to the named input. The request owns it from here on.
    fn set_input(&mut self, name: &str, tensor: Tensor) -> Result<(), EngineError>;

    /// Start executing the bound inputs. Returns immediately.
    fn start_async(&mut self) -> Result<(), EngineError>;

    /// Start executing; `on_complete` receives the outputs on an engine
    /// thread instead of them being kept for `wait_for`.
    fn start_async_with(&mut self, on_complete: CompletionCallback) -> Result<(), EngineError>;

    /// Block until the job started by `start_async` finishes. `Ok(false)`
    /// means the timeout elapsed first and the job is still running.
    fn wait_for(&mut self, timeout: Timeout) -> Result<bool, EngineError>;

    /// Read one output of the last successful job.
    fn output(&self, name: &str) -> Result<Tensor, EngineError>;

    /// Read all outputs of the last successful job.
    fn outputs(&self) -> Result<TensorMap, EngineError>;

    fn is_busy(&self) -> bool;
}

pub trait InferenceEngine: Send + Sync {
    type Request: InferRequest + 'static;

    fn create_infer_request(&self) -> Result<Self::Request, EngineError>;

    fn model_name(&self) -> &str;

    fn inputs(&self) -> &[TensorSpec];

    fn outputs(&self) -> &[TensorSpec];
}
