//! twinslot: stream frames through an inference engine in sync, two-slot
//! async, or callback-queue mode

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use twinslot::capture::{FrameSource, ImageDirSource, SyntheticSource};
use twinslot::engine::{DominantColor, InferenceEngine, ThreadedEngine};
use twinslot::pipeline::{CancelToken, Driver, Mode, Stages};
use twinslot::postprocess::{LogSink, TopK};
use twinslot::preprocess::ImagePreprocessor;
use twinslot::{Config, SourceConfig, SourceKind};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Scheduling mode, overrides the configuration
    #[arg(short, long, value_parser = parse_mode)]
    mode: Option<Mode>,

    /// Number of frames to process
    #[arg(short = 'n', long)]
    frames: Option<u64>,

    /// Directory of images to replay instead of the synthetic source
    #[arg(short, long)]
    source: Option<PathBuf>,
}

fn parse_mode(s: &str) -> Result<Mode, String> {
    match s.to_ascii_lowercase().as_str() {
        "sync" => Ok(Mode::Sync),
        "async" => Ok(Mode::Async),
        "queue" => Ok(Mode::Queue),
        other => Err(format!("unknown mode '{}', expected sync, async or queue", other)),
    }
}

fn open_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    match config.kind {
        SourceKind::Synthetic => Ok(Box::new(SyntheticSource::new(
            config.width,
            config.height,
            config.frames,
            config.fps,
        ))),
        SourceKind::Images => {
            let dir = config
                .path
                .as_deref()
                .ok_or_else(|| eyre!("image source needs source.path"))?;
            Ok(Box::new(ImageDirSource::new(dir)))
        }
        #[cfg(feature = "v4l2")]
        SourceKind::V4l2 => Ok(Box::new(twinslot::capture::V4l2Source::new(config)?)),
        #[cfg(not(feature = "v4l2"))]
        SourceKind::V4l2 => Err(eyre!("built without the `v4l2` feature")),
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("twinslot=info"));
    let fmt_layer =
        tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());
    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("twinslot launching...");

    let args = Args::parse();

    // Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(mode) = args.mode {
        config.pipeline.mode = mode;
    }
    if let Some(frames) = args.frames {
        config.source.frames = Some(frames);
    }
    if let Some(dir) = args.source {
        config.source.kind = SourceKind::Images;
        config.source.path = Some(dir.display().to_string());
    }
    twinslot::CONFIG.store(Arc::new(config));
    let config = twinslot::CONFIG.load_full();

    let model = DominantColor::new(
        config.preprocess.layout,
        Duration::from_millis(config.engine.latency_ms),
    );
    let engine = ThreadedEngine::new(Arc::new(model), &config.engine)?;
    info!(
        "Model '{}', input {:?}",
        engine.model_name(),
        config.target_shape().dims()
    );

    let stages = Stages::new(
        ImagePreprocessor::new(&config.preprocess),
        TopK::new(
            DominantColor::OUTPUT,
            1,
            DominantColor::LABELS.iter().map(|l| l.to_string()).collect(),
        ),
        LogSink::new(config.pipeline.report_every),
    );

    let mut source = open_source(&config.source)?;

    // Ctrl-C requests a cooperative stop; in-flight jobs still drain
    let cancel = CancelToken::new();
    let _signal_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, draining in-flight jobs");
                cancel.cancel();
            }
        }
    });

    let summary = tokio::task::spawn_blocking(move || {
        let current = twinslot::CONFIG.load();
        let driver = Driver::new(&engine, current.driver_settings(DominantColor::INPUT))
            .with_cancel(cancel);
        driver.run(current.pipeline.mode, source.as_mut(), &stages)
    })
    .await??;

    info!(
        "{:?}: {} frames, {:.1} fps over {:.2?}{}",
        summary.mode,
        summary.frames,
        summary.fps,
        summary.elapsed,
        if summary.cancelled { " (interrupted)" } else { "" }
    );
    info!("twinslot shutting down");
    Ok(())
}
