//! Still images from a directory, replayed as a frame stream

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, info, instrument};

use super::{source::FrameSource, CaptureError, Frame, PixelFormat};

const EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Decodes every JPEG/PNG in a directory, in file-name order.
pub struct ImageDirSource {
    dir: PathBuf,
    pending: VecDeque<PathBuf>,
    sequence: u64,
    started: bool,
    stopped: bool,
}

impl ImageDirSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            pending: VecDeque::new(),
            sequence: 0,
            started: false,
            stopped: false,
        }
    }

    fn scan(&self) -> Result<Vec<PathBuf>, CaptureError> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
            if matches {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl FrameSource for ImageDirSource {
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    fn start(&mut self) -> Result<(), CaptureError> {
        if self.started {
            return Ok(());
        }
        self.pending = self.scan()?.into();
        self.started = true;
        info!("Image source found {} files", self.pending.len());
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if !self.started {
            return Err(CaptureError::NotStarted);
        }
        if self.stopped {
            return Ok(None);
        }

        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };

        let img = image::open(&path)
            .map_err(|source| CaptureError::Image {
                path: path.display().to_string(),
                source,
            })?
            .to_rgb8();

        self.sequence += 1;
        debug!("Loaded {} as frame {}", path.display(), self.sequence);

        let (width, height) = img.dimensions();
        Ok(Some(Frame::new(
            self.sequence,
            width,
            height,
            PixelFormat::Rgb24,
            Bytes::from(img.into_raw()),
        )))
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        self.stopped = true;
        self.pending.clear();
        Ok(())
    }
}
