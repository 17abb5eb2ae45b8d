//! Frame sources, user inputs and frame sinks the capture loop talks to.

use super::{Frame, SessionError, UserSignal};
use crate::detection::Detection;
use log::{debug, info};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Supplies frames to the session. `Ok(None)` means the stream ended.
pub trait FrameSource {
    fn read(&mut self) -> Result<Option<Frame>, SessionError>;
}

/// Delivers user decisions. Waits at most `timeout` for one.
pub trait UserInput {
    fn poll(&mut self, timeout: Duration) -> Option<UserSignal>;
}

/// Receives each processed frame, e.g. to draw the detected corners.
pub trait FrameSink {
    fn show(&mut self, frame: &Frame, detection: &Detection);
}

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// Reads image files in order and converts them to 8-bit grey.
#[derive(Debug, Clone)]
pub struct ImageSequenceSource {
    paths: VecDeque<PathBuf>,
}

impl ImageSequenceSource {
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
        }
    }

    /// All image files of `dir`, sorted by file name.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, SessionError> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir)
            .map_err(|e| SessionError::FrameSource(format!("{}: {e}", dir.display())))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            })
            .collect();
        paths.sort();
        info!("Found {} images in {}", paths.len(), dir.display());
        Ok(Self::new(paths))
    }

    pub fn remaining(&self) -> usize {
        self.paths.len()
    }
}

impl FrameSource for ImageSequenceSource {
    fn read(&mut self) -> Result<Option<Frame>, SessionError> {
        let Some(path) = self.paths.pop_front() else {
            return Ok(None);
        };
        let image = image::open(&path)
            .map_err(|e| SessionError::FrameSource(format!("{}: {e}", path.display())))?;
        debug!("Loaded {}", path.display());
        Ok(Some(image.to_luma8()))
    }
}

/// Frames already held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    frames: VecDeque<Frame>,
}

impl MemorySource {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }
}

impl FrameSource for MemorySource {
    fn read(&mut self) -> Result<Option<Frame>, SessionError> {
        Ok(self.frames.pop_front())
    }
}

/// Replays a fixed script, one entry per poll. `None` entries are polls where
/// the user did nothing; once the script is exhausted every poll is `None`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedInput {
    script: VecDeque<Option<UserSignal>>,
}

impl ScriptedInput {
    pub fn new(script: impl IntoIterator<Item = Option<UserSignal>>) -> Self {
        Self {
            script: script.into_iter().collect(),
        }
    }

    /// Builds a script from raw key codes, see [`UserSignal::from_key`].
    pub fn from_keys(keys: impl IntoIterator<Item = i32>) -> Self {
        Self::new(keys.into_iter().map(UserSignal::from_key))
    }
}

impl UserInput for ScriptedInput {
    fn poll(&mut self, _timeout: Duration) -> Option<UserSignal> {
        self.script.pop_front().flatten()
    }
}

/// Logs every frame's detection result and counts the frames it has seen.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    pub frames: usize,
    pub detections: usize,
}

impl FrameSink for LogSink {
    fn show(&mut self, frame: &Frame, detection: &Detection) {
        self.frames += 1;
        if detection.found {
            self.detections += 1;
            debug!(
                "frame {} ({}x{}): {} corners",
                self.frames,
                frame.width(),
                frame.height(),
                detection.corners.len()
            );
        } else {
            debug!("frame {}: no board", self.frames);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    #[test]
    fn test_image_sequence_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        GrayImage::from_pixel(8, 6, Luma([10]))
            .save(dir.path().join("b.png"))
            .unwrap();
        GrayImage::from_pixel(4, 3, Luma([200]))
            .save(dir.path().join("a.png"))
            .unwrap();
        fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

        let mut source = ImageSequenceSource::from_dir(dir.path()).unwrap();
        assert_eq!(source.remaining(), 2);
        let first = source.read().unwrap().unwrap();
        assert_eq!(first.dimensions(), (4, 3));
        assert_eq!(first.get_pixel(0, 0)[0], 200);
        assert_eq!(source.read().unwrap().unwrap().dimensions(), (8, 6));
        assert!(source.read().unwrap().is_none());
    }

    #[test]
    fn test_unreadable_image_is_a_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        fs::write(&path, "definitely not a png").unwrap();
        let mut source = ImageSequenceSource::new([path]);
        assert!(matches!(source.read(), Err(SessionError::FrameSource(_))));
    }

    #[test]
    fn test_scripted_input() {
        let mut input = ScriptedInput::from_keys([32, -1, 115, 27]);
        let t = Duration::from_millis(1);
        assert_eq!(input.poll(t), Some(UserSignal::Accept));
        assert_eq!(input.poll(t), None);
        assert_eq!(input.poll(t), Some(UserSignal::Calibrate));
        assert_eq!(input.poll(t), Some(UserSignal::Abort));
        assert_eq!(input.poll(t), None);
    }
}
