//! Inference outputs to annotated frames, and where they go next

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::capture::Frame;
use crate::engine::TensorMap;
use crate::pipeline::Throughput;

#[derive(Debug, Error)]
pub enum PostprocessError {
    #[error("model produced no output named '{0}'")]
    MissingOutput(String),
    #[error("sink rejected frame {sequence}: {reason}")]
    Sink { sequence: u64, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class: usize,
    pub label: Option<String>,
    pub score: f32,
}

/// A frame together with what the model said about it.
#[derive(Debug)]
pub struct AnnotatedFrame {
    pub frame: Frame,
    pub predictions: Vec<Prediction>,
    pub throughput: Throughput,
    /// Capture to postprocess
    pub latency: Duration,
}

impl AnnotatedFrame {
    pub fn sequence(&self) -> u64 {
        self.frame.sequence()
    }

    pub fn top(&self) -> Option<&Prediction> {
        self.predictions.first()
    }
}

/// Pure `(outputs, frame, metric) -> annotated frame` transform.
pub trait Postprocessor: Send + Sync {
    fn postprocess(
        &self,
        outputs: &TensorMap,
        frame: Frame,
        metric: Throughput,
    ) -> Result<AnnotatedFrame, PostprocessError>;
}

/// Receives annotated frames; display and logging live here.
pub trait Sink: Send {
    fn consume(&mut self, annotated: AnnotatedFrame) -> Result<(), PostprocessError>;
}

/// Highest-scoring classes of a single score vector.
#[derive(Debug, Clone)]
pub struct TopK {
    output: String,
    k: usize,
    labels: Vec<String>,
}

impl TopK {
    pub fn new(output: impl Into<String>, k: usize, labels: Vec<String>) -> Self {
        Self {
            output: output.into(),
            k: k.max(1),
            labels,
        }
    }
}

impl Postprocessor for TopK {
    fn postprocess(
        &self,
        outputs: &TensorMap,
        frame: Frame,
        metric: Throughput,
    ) -> Result<AnnotatedFrame, PostprocessError> {
        let scores = outputs
            .get(&self.output)
            .ok_or_else(|| PostprocessError::MissingOutput(self.output.clone()))?;

        let mut ranked: Vec<(usize, f32)> = scores.data().iter().copied().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        let predictions = ranked
            .into_iter()
            .take(self.k)
            .map(|(class, score)| Prediction {
                class,
                label: self.labels.get(class).cloned(),
                score,
            })
            .collect();

        Ok(AnnotatedFrame {
            latency: frame.timestamp.elapsed(),
            frame,
            predictions,
            throughput: metric,
        })
    }
}

/// Logs a progress line every `report_every` frames.
pub struct LogSink {
    report_every: u64,
    delivered: u64,
}

impl LogSink {
    pub fn new(report_every: u64) -> Self {
        Self {
            report_every: report_every.max(1),
            delivered: 0,
        }
    }
}

impl Sink for LogSink {
    fn consume(&mut self, annotated: AnnotatedFrame) -> Result<(), PostprocessError> {
        self.delivered += 1;
        let label = annotated
            .top()
            .map(|p| p.label.clone().unwrap_or_else(|| format!("class {}", p.class)))
            .unwrap_or_else(|| "-".into());

        debug!(
            frame = annotated.sequence(),
            latency_ms = annotated.latency.as_secs_f64() * 1e3,
            "{}",
            label
        );

        if self.delivered % self.report_every == 0 {
            info!(
                "frame {:>6} | {:<8} | {:6.1} fps (steady {:6.1})",
                annotated.sequence(),
                label,
                annotated.throughput.fps,
                annotated.throughput.steady_fps,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::engine::Tensor;
    use bytes::Bytes;

    fn frame() -> Frame {
        Frame::new(7, 1, 1, PixelFormat::Rgb24, Bytes::from_static(&[0, 0, 0]))
    }

    #[test]
    fn top_k_ranks_scores_and_labels() {
        let post = TopK::new("scores", 2, vec!["a".into(), "b".into(), "c".into()]);
        let outputs = TensorMap::from([("scores".into(), Tensor::from_slice(&[0.1, 0.7, 0.2]))]);

        let annotated = post
            .postprocess(&outputs, frame(), Throughput::default())
            .unwrap();

        assert_eq!(annotated.sequence(), 7);
        assert_eq!(annotated.predictions.len(), 2);
        assert_eq!(annotated.top().unwrap().label.as_deref(), Some("b"));
        assert_eq!(annotated.predictions[1].class, 2);
    }

    #[test]
    fn missing_output_is_an_error() {
        let post = TopK::new("scores", 1, vec![]);
        let err = post
            .postprocess(&TensorMap::new(), frame(), Throughput::default())
            .unwrap_err();
        assert!(matches!(err, PostprocessError::MissingOutput(name) if name == "scores"));
    }
}
