//! V4L2 camera capture with memory-mapped buffers

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{
    frame::{Frame, FrameMetadata, PixelFormat},
    source::FrameSource,
    CaptureError,
};
use crate::SourceConfig;

const BUFFER_COUNT: u32 = 4;

/// Live camera frames
pub struct V4l2Source {
    device: Box<Device>,
    stream: Option<MmapStream<'static>>,
    width: u32,
    height: u32,
    format: PixelFormat,
    sequence: u64,
    stopped: bool,
}

impl V4l2Source {
    pub fn new(config: &SourceConfig) -> Result<Self, CaptureError> {
        let path = config.path.as_deref().unwrap_or("/dev/video0");
        info!("Initializing V4L2 capture: {}", path);

        let device = Device::with_path(path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::Unsupported(format!(
                "{} doesn't support video capture",
                path
            )));
        }

        let mut fmt = device.format()?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = match config.format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            other => {
                return Err(CaptureError::Unsupported(format!(
                    "pixel format {:?} on V4L2",
                    other
                )))
            }
        };
        let fmt = device.set_format(&fmt)?;

        Ok(Self {
            device: Box::new(device),
            stream: None,
            width: fmt.width,
            height: fmt.height,
            format: config.format,
            sequence: 0,
            stopped: false,
        })
    }
}

impl FrameSource for V4l2Source {
    fn start(&mut self) -> Result<(), CaptureError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, BUFFER_COUNT)?;
        self.stream = Some(stream);
        info!("Capture stream started with {} buffers", BUFFER_COUNT);
        Ok(())
    }

    #[instrument(skip(self))]
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.stopped {
            return Ok(None);
        }
        let timestamp = Instant::now();
        let stream = self.stream.as_mut().ok_or(CaptureError::NotStarted)?;

        let (buf, meta) = stream.next()?;
        let data = Bytes::copy_from_slice(buf);

        self.sequence += 1;

        let frame_meta = Arc::new(FrameMetadata {
            sequence: self.sequence,
            width: self.width,
            height: self.height,
            stride: self.width,
            format: self.format,
            device_timestamp: Some(
                Duration::from_secs(meta.timestamp.sec as u64)
                    + Duration::from_micros(meta.timestamp.usec as u64),
            ),
        });

        Ok(Some(Frame {
            data,
            meta: frame_meta,
            timestamp,
        }))
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        if !self.stopped {
            self.stopped = true;
            self.stream = None;
            info!("Capture stream stopped after {} frames", self.sequence);
        }
        Ok(())
    }
}
