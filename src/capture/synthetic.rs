//! Generated test-pattern frames

use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info};

use super::{source::FrameSource, CaptureError, Frame, PixelFormat};

/// Emits RGB frames whose dominant channel cycles red, green, blue.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    limit: Option<u64>,
    frame_interval: Option<Duration>,
    sequence: u64,
    last_emit: Option<Instant>,
    state: State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Stopped,
}

impl SyntheticSource {
    /// `limit` of `None` streams until stopped; `fps` paces emission.
    pub fn new(width: u32, height: u32, limit: Option<u64>, fps: Option<u32>) -> Self {
        Self {
            width,
            height,
            limit,
            frame_interval: fps
                .filter(|&f| f > 0)
                .map(|f| Duration::from_secs_f64(1.0 / f as f64)),
            sequence: 0,
            last_emit: None,
            state: State::Idle,
        }
    }

    fn render(&self, sequence: u64) -> Bytes {
        let dominant = (sequence % 3) as usize;
        let mut data = Vec::with_capacity((self.width * self.height * 3) as usize);
        for _y in 0..self.height {
            for x in 0..self.width {
                let ramp = (x * 64 / self.width.max(1)) as u8;
                let mut px = [40 + ramp; 3];
                px[dominant] = 200;
                data.extend_from_slice(&px);
            }
        }
        Bytes::from(data)
    }
}

impl FrameSource for SyntheticSource {
    fn start(&mut self) -> Result<(), CaptureError> {
        if self.state == State::Idle {
            info!(
                "Synthetic source started: {}x{}, limit {:?}",
                self.width, self.height, self.limit
            );
            self.state = State::Running;
        }
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        match self.state {
            State::Idle => return Err(CaptureError::NotStarted),
            State::Stopped => return Ok(None),
            State::Running => {}
        }

        if self.limit.is_some_and(|limit| self.sequence >= limit) {
            return Ok(None);
        }

        if let (Some(interval), Some(last)) = (self.frame_interval, self.last_emit) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_emit = Some(Instant::now());

        self.sequence += 1;
        let data = self.render(self.sequence);
        Ok(Some(Frame::new(
            self.sequence,
            self.width,
            self.height,
            PixelFormat::Rgb24,
            data,
        )))
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        if self.state != State::Stopped {
            debug!("Synthetic source stopped after {} frames", self.sequence);
            self.state = State::Stopped;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_source_ends_after_limit() {
        let mut source = SyntheticSource::new(4, 2, Some(3), None);
        source.start().unwrap();

        let sequences: Vec<u64> = std::iter::from_fn(|| source.next_frame().unwrap())
            .map(|f| f.sequence())
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn frames_have_rgb_layout() {
        let mut source = SyntheticSource::new(4, 2, None, None);
        source.start().unwrap();
        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.data.len(), 4 * 2 * 3);
        // sequence 1 is green-dominant
        assert_eq!(frame.data[1], 200);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut source = SyntheticSource::new(2, 2, None, None);
        source.start().unwrap();
        source.next_frame().unwrap();
        source.stop().unwrap();
        source.stop().unwrap();
        assert!(source.next_frame().unwrap().is_none());
    }
}
