pub mod capture;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::Frame;
pub use error::PipelineError;
use pipeline::{DriverSettings, Mode};
use preprocess::{ColorOrder, Layout, ResizeMode, TargetShape};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Environment variable prefix, e.g. `TWINSLOT__PIPELINE__MODE=queue`
pub const ENV_PREFIX: &str = "TWINSLOT";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub preprocess: PreprocessConfig,
    pub engine: EngineConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Synthetic,
    Images,
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Image directory or capture device
    pub path: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Stop after this many frames; unbounded when unset
    pub frames: Option<u64>,
    /// Pace synthetic frames; as fast as possible when unset
    pub fps: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub width: u32,
    pub height: u32,
    pub layout: Layout,
    pub resize: ResizeMode,
    pub color: ColorOrder,
    pub mean: [f32; 3],
    pub scale: [f32; 3],
    /// Fill for letterbox borders
    pub pad_value: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: usize,
    pub pin_workers: bool,
    /// Simulated execution time of the built-in model
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub mode: Mode,
    /// Slots in queue mode
    pub queue_size: usize,
    /// Per-wait bound; waits forever when unset
    pub wait_timeout_ms: Option<u64>,
    /// Completions in the steady-state fps window
    pub throughput_window: usize,
    /// Log a progress line every N frames
    pub report_every: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Synthetic,
            path: None,
            width: 640,
            height: 480,
            format: PixelFormat::Rgb24,
            frames: Some(300),
            fps: None,
        }
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            width: 224,
            height: 224,
            layout: Layout::Nchw,
            resize: ResizeMode::Stretch,
            color: ColorOrder::Rgb,
            mean: [0.0; 3],
            scale: [255.0; 3],
            pad_value: 114,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            pin_workers: false,
            latency_ms: 15,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Async,
            queue_size: 4,
            wait_timeout_ms: None,
            throughput_window: 30,
            report_every: 30,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file if given, then `TWINSLOT__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn target_shape(&self) -> TargetShape {
        TargetShape {
            width: self.preprocess.width,
            height: self.preprocess.height,
            layout: self.preprocess.layout,
        }
    }

    pub fn driver_settings(&self, input: &str) -> DriverSettings {
        DriverSettings {
            input: input.to_string(),
            target: self.target_shape(),
            wait_timeout: self
                .pipeline
                .wait_timeout_ms
                .map(Duration::from_millis)
                .into(),
            queue_size: self.pipeline.queue_size,
            throughput_window: self.pipeline.throughput_window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Timeout;

    #[test]
    fn file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("twinslot-config-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
[pipeline]
mode = "queue"
queue_size = 8
wait_timeout_ms = 250

[preprocess]
layout = "nhwc"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.pipeline.mode, Mode::Queue);
        assert_eq!(config.pipeline.queue_size, 8);
        assert_eq!(config.preprocess.layout, Layout::Nhwc);
        // untouched sections keep their defaults
        assert_eq!(config.engine.workers, 2);
        assert_eq!(config.source.frames, Some(300));

        let settings = config.driver_settings("image");
        assert_eq!(settings.wait_timeout, Timeout::After(Duration::from_millis(250)));
        assert_eq!(settings.target.dims(), vec![1, 224, 224, 3]);
    }

    #[test]
    fn stored_config_drives_the_run() {
        let mut config = Config::default();
        config.pipeline.mode = Mode::Sync;
        config.pipeline.queue_size = 6;
        CONFIG.store(std::sync::Arc::new(config));

        let current = CONFIG.load();
        assert_eq!(current.pipeline.mode, Mode::Sync);
        assert_eq!(current.driver_settings("image").queue_size, 6);
    }

    #[test]
    fn defaults_wait_forever() {
        let settings = Config::default().driver_settings("image");
        assert_eq!(settings.wait_timeout, Timeout::Infinite);
        assert_eq!(settings.input, "image");
    }
}
