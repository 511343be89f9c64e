#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use twinslot::capture::{Frame, MemorySource, PixelFormat};
use twinslot::engine::{EngineError, Model, Tensor, TensorMap, TensorSpec, ThreadedEngine, Timeout};
use twinslot::pipeline::{CancelToken, DriverSettings, Throughput};
use twinslot::postprocess::{AnnotatedFrame, PostprocessError, Postprocessor, Prediction, Sink};
use twinslot::preprocess::{Layout, PreprocessError, Preprocessor, TargetShape};
use twinslot::EngineConfig;

pub const INPUT: &str = "in";
pub const OUTPUT: &str = "out";

/// Echoes its input. Element 1 of the input is a delay in milliseconds.
pub struct EchoModel {
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
    calls: AtomicUsize,
    fail_on: Option<usize>,
    gate: Option<flume::Receiver<()>>,
}

impl EchoModel {
    pub fn new() -> Self {
        Self {
            inputs: vec![TensorSpec::new(INPUT, vec![0])],
            outputs: vec![TensorSpec::new(OUTPUT, vec![0])],
            calls: AtomicUsize::new(0),
            fail_on: None,
            gate: None,
        }
    }

    /// Fail the n-th execution (1-based)
    pub fn failing_on(call: usize) -> Self {
        Self {
            fail_on: Some(call),
            ..Self::new()
        }
    }

    /// Every execution waits for a token on `gate` (or for it to close)
    pub fn gated(gate: flume::Receiver<()>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }
}

impl Model for EchoModel {
    fn name(&self) -> &str {
        "echo"
    }

    fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    fn infer(&self, inputs: &TensorMap) -> Result<TensorMap, EngineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.gate {
            let _ = gate.recv();
        }

        let x = inputs
            .get(INPUT)
            .ok_or_else(|| EngineError::UnknownInput(INPUT.into()))?;
        if let Some(&delay) = x.data().get(1) {
            std::thread::sleep(Duration::from_millis(delay as u64));
        }
        if self.fail_on == Some(call) {
            return Err(EngineError::Execution(format!("injected fault on call {}", call)));
        }
        Ok(TensorMap::from([(OUTPUT.to_string(), x.clone())]))
    }
}

pub fn engine(model: EchoModel, workers: usize) -> ThreadedEngine {
    let config = EngineConfig {
        workers,
        pin_workers: false,
        latency_ms: 0,
    };
    ThreadedEngine::new(Arc::new(model), &config).unwrap()
}

/// Tensor of `[id, delay_ms]`
pub fn job(id: u64, delay_ms: u64) -> Tensor {
    Tensor::from_slice(&[id as f32, delay_ms as f32])
}

pub fn frames(n: u64) -> MemorySource {
    MemorySource::new(
        (1..=n).map(|i| Frame::new(i, 1, 1, PixelFormat::Rgb24, Bytes::from_static(&[0, 0, 0]))),
    )
}

pub fn settings(wait_timeout: Timeout, queue_size: usize) -> DriverSettings {
    DriverSettings {
        input: INPUT.into(),
        target: TargetShape {
            width: 1,
            height: 1,
            layout: Layout::Nchw,
        },
        wait_timeout,
        queue_size,
        throughput_window: 8,
    }
}

/// Encodes the frame sequence and a per-frame delay into the input.
pub struct SeqPreprocessor {
    pub delay_ms: fn(u64) -> u64,
    pub fail_on: Option<u64>,
    /// Emit a tensor the echo model's input spec rejects
    pub malformed_on: Option<u64>,
}

impl SeqPreprocessor {
    pub fn with_delay(delay_ms: fn(u64) -> u64) -> Self {
        Self {
            delay_ms,
            fail_on: None,
            malformed_on: None,
        }
    }
}

impl Preprocessor for SeqPreprocessor {
    fn preprocess(&self, frame: &Frame, _target: &TargetShape) -> Result<Tensor, PreprocessError> {
        let seq = frame.sequence();
        if self.fail_on == Some(seq) {
            return Err(PreprocessError::InvalidTarget {
                width: 0,
                height: 0,
            });
        }
        let delay = (self.delay_ms)(seq);
        if self.malformed_on == Some(seq) {
            return Ok(Tensor::new(vec![1, 2], vec![seq as f32, delay as f32])
                .expect("shape matches data"));
        }
        Ok(job(seq, delay))
    }
}

/// Reports the echoed id as the top class.
pub struct EchoPost;

impl Postprocessor for EchoPost {
    fn postprocess(
        &self,
        outputs: &TensorMap,
        frame: Frame,
        metric: Throughput,
    ) -> Result<AnnotatedFrame, PostprocessError> {
        let out = outputs
            .get(OUTPUT)
            .ok_or_else(|| PostprocessError::MissingOutput(OUTPUT.into()))?;
        Ok(AnnotatedFrame {
            latency: frame.timestamp.elapsed(),
            predictions: vec![Prediction {
                class: out.data()[0] as usize,
                label: None,
                score: 1.0,
            }],
            frame,
            throughput: metric,
        })
    }
}

/// Remembers (frame sequence, echoed id) pairs in delivery order.
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub seen: Arc<Mutex<Vec<(u64, usize)>>>,
    cancel_after: Option<(usize, CancelToken)>,
    fail_on: Option<u64>,
}

impl RecordingSink {
    pub fn cancelling_after(count: usize, cancel: CancelToken) -> Self {
        Self {
            cancel_after: Some((count, cancel)),
            ..Self::default()
        }
    }

    /// Reject the frame with this sequence without recording it
    pub fn failing_on(sequence: u64) -> Self {
        Self {
            fail_on: Some(sequence),
            ..Self::default()
        }
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.seen.lock().unwrap().iter().map(|&(seq, _)| seq).collect()
    }

    pub fn pairs(&self) -> Vec<(u64, usize)> {
        self.seen.lock().unwrap().clone()
    }
}

impl Sink for RecordingSink {
    fn consume(&mut self, annotated: AnnotatedFrame) -> Result<(), PostprocessError> {
        if self.fail_on == Some(annotated.sequence()) {
            return Err(PostprocessError::Sink {
                sequence: annotated.sequence(),
                reason: "rejected".into(),
            });
        }
        let id = annotated.top().map(|p| p.class).unwrap_or(usize::MAX);
        let mut seen = self.seen.lock().unwrap();
        seen.push((annotated.sequence(), id));
        if let Some((count, cancel)) = &self.cancel_after {
            if seen.len() >= *count {
                cancel.cancel();
            }
        }
        Ok(())
    }
}
