use std::time::Duration;

use super::{EngineError, Tensor, TensorMap, TensorSpec};
use crate::preprocess::Layout;

/// Computation executed by [`super::ThreadedEngine`] workers.
pub trait Model: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn inputs(&self) -> &[TensorSpec];

    fn outputs(&self) -> &[TensorSpec];

    fn infer(&self, inputs: &TensorMap) -> Result<TensorMap, EngineError>;
}

/// Three-class "which channel is brightest" classifier.
///
/// Scores are the per-channel means of the input image. An optional fixed
/// latency stands in for device execution time.
pub struct DominantColor {
    layout: Layout,
    latency: Duration,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
}

impl DominantColor {
    pub const INPUT: &'static str = "image";
    pub const OUTPUT: &'static str = "scores";
    pub const LABELS: [&'static str; 3] = ["red", "green", "blue"];

    pub fn new(layout: Layout, latency: Duration) -> Self {
        let input_shape = match layout {
            Layout::Nchw => vec![1, 3, 0, 0],
            Layout::Nhwc => vec![1, 0, 0, 3],
        };
        Self {
            layout,
            latency,
            inputs: vec![TensorSpec::new(Self::INPUT, input_shape)],
            outputs: vec![TensorSpec::new(Self::OUTPUT, vec![1, 3])],
        }
    }
}

impl Model for DominantColor {
    fn name(&self) -> &str {
        "dominant-color"
    }

    fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    fn infer(&self, inputs: &TensorMap) -> Result<TensorMap, EngineError> {
        let image = inputs
            .get(Self::INPUT)
            .ok_or_else(|| EngineError::UnknownInput(Self::INPUT.into()))?;
        if image.is_empty() {
            return Err(EngineError::Execution("empty input image".into()));
        }

        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let data = image.data();
        let mut sums = [0f64; 3];
        match self.layout {
            Layout::Nchw => {
                let plane = data.len() / 3;
                for (c, sum) in sums.iter_mut().enumerate() {
                    *sum = data[c * plane..(c + 1) * plane]
                        .iter()
                        .map(|&v| v as f64)
                        .sum();
                }
            }
            Layout::Nhwc => {
                for px in data.chunks_exact(3) {
                    for (sum, &v) in sums.iter_mut().zip(px) {
                        *sum += v as f64;
                    }
                }
            }
        }

        let count = (data.len() / 3).max(1) as f64;
        let scores = sums.map(|s| (s / count) as f32);
        let tensor = Tensor::new(vec![1, 3], scores.to_vec())
            .ok_or_else(|| EngineError::Execution("score shape".into()))?;

        Ok(TensorMap::from([(Self::OUTPUT.to_string(), tensor)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_brightest_channel_nchw() {
        let model = DominantColor::new(Layout::Nchw, Duration::ZERO);
        // 2 pixels, planes R, G, B
        let image = Tensor::new(vec![1, 3, 1, 2], vec![0.1, 0.1, 0.9, 0.9, 0.2, 0.2]).unwrap();
        let out = model
            .infer(&TensorMap::from([(DominantColor::INPUT.into(), image)]))
            .unwrap();
        let scores = out[DominantColor::OUTPUT].data();
        assert!(scores[1] > scores[0] && scores[1] > scores[2]);
    }

    #[test]
    fn picks_brightest_channel_nhwc() {
        let model = DominantColor::new(Layout::Nhwc, Duration::ZERO);
        let image = Tensor::new(vec![1, 1, 2, 3], vec![0.1, 0.2, 0.8, 0.1, 0.2, 0.8]).unwrap();
        let out = model
            .infer(&TensorMap::from([(DominantColor::INPUT.into(), image)]))
            .unwrap();
        let scores = out[DominantColor::OUTPUT].data();
        assert!((scores[2] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn missing_input_is_reported() {
        let model = DominantColor::new(Layout::Nchw, Duration::ZERO);
        assert_eq!(
            model.infer(&TensorMap::new()).unwrap_err(),
            EngineError::UnknownInput("image".into())
        );
    }
}
