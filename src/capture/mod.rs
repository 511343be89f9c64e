pub mod decoder;
pub mod frame;
pub mod images;
pub mod source;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use frame::Frame;
pub use frame::FrameMetadata;
pub use frame::PixelFormat;
pub use images::ImageDirSource;
pub use source::{FrameSource, MemorySource, ScopedSource};
pub use synthetic::SyntheticSource;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Source;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("frame source not started")]
    NotStarted,
    #[error("frame source i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode {format:?} frame: {reason}")]
    Decode { format: PixelFormat, reason: String },
    #[error("failed to read image {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("unsupported device: {0}")]
    Unsupported(String),
}
