//! Interactive capture session.
//!
//! The session is a small state machine driven by two kinds of events: frames
//! and user signals. Every frame is searched for the board. The user accepts
//! frames with a detected board as calibration views and, once enough views
//! are collected, triggers the calibration. The result is written to the
//! configured output file and the session ends.
//!
//! ```text
//! WaitingForFrame --frame--> Detecting --> AwaitingUserAction
//!        ^                                     |      |
//!        +------------- next frame ------------+      +-- calibrate/abort --> Finished
//! ```

pub mod sources;

pub use sources::{
    FrameSink, FrameSource, ImageSequenceSource, LogSink, MemorySource, ScriptedInput, UserInput,
};

use crate::board::{BoardError, BoardGeometry};
use crate::camera::Resolution;
use crate::config::{ConfigError, SessionConfig};
use crate::correspondence::{build_correspondences, ViewSource};
use crate::detection::{Detection, PatternDetector};
use crate::optimization::{calibrate, CalibrationError, CalibrationResult};
use crate::store::{self, StoreError};
use image::GrayImage;
use log::{error, info, warn};
use nalgebra::Point2;
use std::path::PathBuf;

/// One captured camera image.
pub type Frame = GrayImage;

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("Frame source failed: {0}")]
    FrameSource(String),
    #[error(transparent)]
    Board(#[from] BoardError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A user decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSignal {
    /// Keep the current frame as a calibration view.
    Accept,
    /// Calibrate from the collected views.
    Calibrate,
    /// End the session without calibrating.
    Abort,
}

impl UserSignal {
    pub const KEY_ACCEPT: i32 = b' ' as i32;
    pub const KEY_CALIBRATE: i32 = b's' as i32;
    pub const KEY_ESCAPE: i32 = 27;

    /// Maps a key code to a signal: space accepts, `s` calibrates and escape
    /// aborts. Any other key is ignored.
    pub fn from_key(key: i32) -> Option<Self> {
        match key {
            Self::KEY_ACCEPT => Some(Self::Accept),
            Self::KEY_CALIBRATE => Some(Self::Calibrate),
            Self::KEY_ESCAPE => Some(Self::Abort),
            _ => None,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Calibrated,
    Aborted,
    SourceExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    WaitingForFrame,
    Detecting,
    AwaitingUserAction,
    Finished(SessionEnd),
}

/// How the session reacted to a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalResponse {
    /// The current frame was stored; the payload is the new view count.
    ViewSaved(usize),
    /// Accept was ignored because the current frame has no board.
    NoBoardInFrame,
    /// Accept was refused because the frame size differs from the stored
    /// views. Sizes are `(width, height)`.
    FrameSizeMismatch {
        expected: (u32, u32),
        found: (u32, u32),
    },
    /// Calibrate was ignored because too few views are stored.
    NotEnoughViews { found: usize, required: usize },
    Calibrated,
    Aborted,
    /// The session had already finished.
    Ignored,
}

/// An accepted calibration view. Owns its copy of the frame.
#[derive(Debug, Clone)]
pub struct View {
    pub frame: Frame,
    pub points: Vec<Point2<f64>>,
}

impl ViewSource for View {
    fn image_points(&self) -> &[Point2<f64>] {
        &self.points
    }
}

/// The result of the session's calibration.
#[derive(Debug, Clone)]
pub struct CalibrationOutcome {
    pub result: CalibrationResult,
    /// Where the calibration file was written, if the write succeeded.
    pub saved_to: Option<PathBuf>,
    /// Message of the failed write, if any.
    pub save_error: Option<String>,
}

pub struct CaptureSession<D> {
    config: SessionConfig,
    board: BoardGeometry,
    detector: D,
    state: SessionState,
    current: Option<(Frame, Detection)>,
    views: Vec<View>,
    outcome: Option<CalibrationOutcome>,
}

impl<D: PatternDetector> CaptureSession<D> {
    /// Creates a session for the board described by `config`.
    ///
    /// # Errors
    ///
    /// * [`SessionError::Config`] if the configuration is invalid.
    pub fn new(config: SessionConfig, detector: D) -> Result<Self, SessionError> {
        config.validate()?;
        let board = config.board()?;
        Ok(Self {
            config,
            board,
            detector,
            state: SessionState::WaitingForFrame,
            current: None,
            views: Vec::new(),
            outcome: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, SessionState::Finished(_))
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    pub fn outcome(&self) -> Option<&CalibrationOutcome> {
        self.outcome.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Detection on the most recent frame.
    pub fn current_detection(&self) -> Option<&Detection> {
        self.current.as_ref().map(|(_, detection)| detection)
    }

    /// Runs the detector on a new frame, which replaces the previous one.
    /// Frames arriving after the session finished are dropped.
    pub fn on_frame(&mut self, frame: Frame) -> Option<&Detection> {
        if self.is_finished() {
            return None;
        }
        self.state = SessionState::Detecting;
        let detection = self.detector.detect(&frame, self.board.pattern_size());
        self.current = Some((frame, detection));
        self.state = SessionState::AwaitingUserAction;
        self.current_detection()
    }

    /// Reacts to a user signal.
    ///
    /// # Errors
    ///
    /// * [`SessionError::Calibration`] if the solve fails. The session keeps
    ///   its views and stays open, so more views can be added.
    pub fn handle_signal(&mut self, signal: UserSignal) -> Result<SignalResponse, SessionError> {
        if self.is_finished() {
            return Ok(SignalResponse::Ignored);
        }
        match signal {
            UserSignal::Accept => Ok(self.accept_current()),
            UserSignal::Calibrate => self.calibrate_views(),
            UserSignal::Abort => {
                info!("Calibration aborted by user");
                self.state = SessionState::Finished(SessionEnd::Aborted);
                Ok(SignalResponse::Aborted)
            }
        }
    }

    fn accept_current(&mut self) -> SignalResponse {
        match &self.current {
            Some((frame, detection)) if detection.found => {
                if let Some(first) = self.views.first() {
                    let expected = first.frame.dimensions();
                    let found = frame.dimensions();
                    if found != expected {
                        warn!(
                            "frame is {}x{}, stored views are {}x{}; view not saved",
                            found.0, found.1, expected.0, expected.1
                        );
                        return SignalResponse::FrameSizeMismatch { expected, found };
                    }
                }
                self.views.push(View {
                    frame: frame.clone(),
                    points: detection.corners.clone(),
                });
                info!("saved {} image", self.views.len());
                SignalResponse::ViewSaved(self.views.len())
            }
            _ => SignalResponse::NoBoardInFrame,
        }
    }

    fn calibrate_views(&mut self) -> Result<SignalResponse, SessionError> {
        let required = self.config.min_views();
        if self.views.len() < required {
            info!(
                "{} views collected, {required} needed for calibration",
                self.views.len()
            );
            return Ok(SignalResponse::NotEnoughViews {
                found: self.views.len(),
                required,
            });
        }

        let resolution = match self.views.first() {
            Some(view) => Resolution {
                width: view.frame.width(),
                height: view.frame.height(),
            },
            None => {
                return Ok(SignalResponse::NotEnoughViews {
                    found: 0,
                    required,
                })
            }
        };
        let correspondences = build_correspondences(&self.views, &self.board)?;
        info!(
            "Calibrating from {} views at {}x{}",
            correspondences.len(),
            resolution.width,
            resolution.height
        );
        let result = calibrate(
            &correspondences.world_point_sets,
            &correspondences.image_point_sets,
            resolution,
            &self.config.solver,
        )?;
        info!("Calibration RMS reprojection error: {:.4} px", result.rms_error);

        let path = self.config.output_path.clone();
        let outcome = match store::save_result(&path, &result) {
            Ok(()) => CalibrationOutcome {
                result,
                saved_to: Some(path),
                save_error: None,
            },
            Err(e) => {
                error!("Failed to save calibration: {e}");
                CalibrationOutcome {
                    result,
                    saved_to: None,
                    save_error: Some(e.to_string()),
                }
            }
        };
        self.outcome = Some(outcome);
        self.state = SessionState::Finished(SessionEnd::Calibrated);
        Ok(SignalResponse::Calibrated)
    }

    /// Drives the session until it finishes or the source runs dry.
    ///
    /// Each iteration reads a frame, runs detection, hands the frame to the
    /// sink and waits one frame interval for a user signal.
    ///
    /// # Errors
    ///
    /// * [`SessionError::FrameSource`] if the source fails; the session stops.
    pub fn run(
        &mut self,
        source: &mut impl FrameSource,
        input: &mut impl UserInput,
        sink: &mut impl FrameSink,
    ) -> Result<SessionEnd, SessionError> {
        let interval = self.config.frame_interval();
        loop {
            if let SessionState::Finished(end) = self.state {
                return Ok(end);
            }
            self.state = SessionState::WaitingForFrame;

            let Some(frame) = source.read()? else {
                info!("Frame source exhausted");
                self.state = SessionState::Finished(SessionEnd::SourceExhausted);
                continue;
            };
            self.on_frame(frame);
            if let Some((frame, detection)) = &self.current {
                sink.show(frame, detection);
            }

            let Some(signal) = input.poll(interval) else {
                continue;
            };
            match self.handle_signal(signal) {
                Ok(_) => {}
                Err(SessionError::Calibration(e)) => {
                    warn!("Calibration failed: {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }
}
