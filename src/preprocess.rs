//! Frame to input-tensor conversion
//!
//! [`ImagePreprocessor`] applies a fixed list of steps (decode, colour
//! order, resize or letterbox, normalisation, layout) in that order. It holds
//! no per-frame state, so one instance can serve every slot concurrently.

use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::{decoder, CaptureError, Frame};
use crate::engine::Tensor;
use crate::PreprocessConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    Nchw,
    Nhwc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    /// Scale each axis independently
    Stretch,
    /// Keep aspect ratio, pad the remainder
    Letterbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorOrder {
    Rgb,
    Bgr,
}

/// Input geometry expected by the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetShape {
    pub width: u32,
    pub height: u32,
    pub layout: Layout,
}

impl TargetShape {
    pub fn dims(&self) -> Vec<usize> {
        let (w, h) = (self.width as usize, self.height as usize);
        match self.layout {
            Layout::Nchw => vec![1, 3, h, w],
            Layout::Nhwc => vec![1, h, w, 3],
        }
    }
}

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error(transparent)]
    Decode(#[from] CaptureError),
    #[error("invalid target shape {width}x{height}")]
    InvalidTarget { width: u32, height: u32 },
}

/// Pure `(frame, target) -> tensor` transform.
pub trait Preprocessor: Send + Sync {
    fn preprocess(&self, frame: &Frame, target: &TargetShape) -> Result<Tensor, PreprocessError>;
}

#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    resize: ResizeMode,
    color: ColorOrder,
    mean: [f32; 3],
    scale: [f32; 3],
    pad_value: u8,
}

impl ImagePreprocessor {
    pub fn new(config: &PreprocessConfig) -> Self {
        Self {
            resize: config.resize,
            color: config.color,
            mean: config.mean,
            scale: config.scale.map(|s| if s == 0.0 { 1.0 } else { s }),
            pad_value: config.pad_value,
        }
    }

    fn resize(&self, img: &RgbImage, width: u32, height: u32) -> RgbImage {
        let (src_w, src_h) = img.dimensions();
        if (src_w, src_h) == (width, height) {
            return img.clone();
        }

        match self.resize {
            ResizeMode::Stretch => imageops::resize(img, width, height, FilterType::Triangle),
            ResizeMode::Letterbox => {
                let scale = f32::min(width as f32 / src_w as f32, height as f32 / src_h as f32);
                let new_w = ((src_w as f32 * scale) as u32).clamp(1, width);
                let new_h = ((src_h as f32 * scale) as u32).clamp(1, height);
                let scaled = imageops::resize(img, new_w, new_h, FilterType::Triangle);

                let mut padded = RgbImage::from_pixel(width, height, Rgb([self.pad_value; 3]));
                let offset_x = (width - new_w) / 2;
                let offset_y = (height - new_h) / 2;
                imageops::replace(&mut padded, &scaled, offset_x as i64, offset_y as i64);
                padded
            }
        }
    }
}

impl Preprocessor for ImagePreprocessor {
    fn preprocess(&self, frame: &Frame, target: &TargetShape) -> Result<Tensor, PreprocessError> {
        if target.width == 0 || target.height == 0 {
            return Err(PreprocessError::InvalidTarget {
                width: target.width,
                height: target.height,
            });
        }

        let rgb = decoder::decode_frame(frame)?;
        let resized = self.resize(&rgb, target.width, target.height);

        let order = match self.color {
            ColorOrder::Rgb => [0, 1, 2],
            ColorOrder::Bgr => [2, 1, 0],
        };
        let plane = (target.width * target.height) as usize;
        let mut data = vec![0f32; plane * 3];

        for (i, px) in resized.pixels().enumerate() {
            for (c, &src) in order.iter().enumerate() {
                let v = (px.0[src] as f32 - self.mean[c]) / self.scale[c];
                let idx = match target.layout {
                    Layout::Nchw => c * plane + i,
                    Layout::Nhwc => i * 3 + c,
                };
                data[idx] = v;
            }
        }

        Tensor::new(target.dims(), data).ok_or(PreprocessError::InvalidTarget {
            width: target.width,
            height: target.height,
        })
    }
}
