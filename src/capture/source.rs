//! Frame source contract and scoped acquisition

use std::collections::VecDeque;

use tracing::{debug, warn};

use super::{CaptureError, Frame};

/// Ordered producer of frames.
///
/// `next_frame` yields `Ok(None)` at end-of-stream; that is a normal
/// termination signal, not an error. `stop` must be idempotent and a stopped
/// source must never re-emit frames it already handed out.
pub trait FrameSource: Send {
    fn start(&mut self) -> Result<(), CaptureError>;
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;
    fn stop(&mut self) -> Result<(), CaptureError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn start(&mut self) -> Result<(), CaptureError> {
        (**self).start()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        (**self).next_frame()
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        (**self).stop()
    }
}

/// Started source that is stopped on every exit path.
///
/// Prefer [`ScopedSource::finish`] to surface stop errors; `Drop` is the
/// fallback and only logs.
pub struct ScopedSource<'a> {
    source: &'a mut dyn FrameSource,
    stopped: bool,
}

impl<'a> ScopedSource<'a> {
    pub fn start(source: &'a mut dyn FrameSource) -> Result<Self, CaptureError> {
        source.start()?;
        Ok(Self {
            source,
            stopped: false,
        })
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.stopped {
            return Ok(None);
        }
        self.source.next_frame()
    }

    pub fn finish(mut self) -> Result<(), CaptureError> {
        self.stopped = true;
        self.source.stop()
    }
}

impl Drop for ScopedSource<'_> {
    fn drop(&mut self) {
        if !self.stopped {
            if let Err(e) = self.source.stop() {
                warn!("Failed to stop frame source: {}", e);
            }
        }
    }
}

/// Source backed by frames already in memory.
pub struct MemorySource {
    frames: VecDeque<Frame>,
    started: bool,
    stopped: bool,
}

impl MemorySource {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            started: false,
            stopped: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for MemorySource {
    fn start(&mut self) -> Result<(), CaptureError> {
        self.started = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if !self.started {
            return Err(CaptureError::NotStarted);
        }
        if self.stopped {
            return Ok(None);
        }
        Ok(self.frames.pop_front())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        if !self.stopped {
            debug!("Memory source stopped with {} frames unread", self.frames.len());
            self.stopped = true;
            self.frames.clear();
        }
        Ok(())
    }
}
