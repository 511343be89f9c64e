use std::time::Duration;

use thiserror::Error;

use crate::capture::CaptureError;
use crate::engine::EngineError;
use crate::pipeline::SlotId;
use crate::postprocess::PostprocessError;
use crate::preprocess::PreprocessError;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Submit to a slot whose previous job has not resolved yet
    #[error("slot {0} already has an outstanding job")]
    SlotBusy(SlotId),
    #[error("slot {0} has no submitted job")]
    SlotIdle(SlotId),
    #[error("slot {slot} did not complete within {after:?}")]
    Timeout { slot: SlotId, after: Duration },
    #[error("request pool needs at least one slot")]
    EmptyPool,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("frame source: {0}")]
    Capture(#[from] CaptureError),
    #[error("preprocessing: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("postprocessing: {0}")]
    Postprocess(#[from] PostprocessError),
}
