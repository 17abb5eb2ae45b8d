//! End-to-end run of the capture session on rendered frames: detection,
//! view collection, calibration and the written calibration file.

use checkerboard_calib::detection::ChessboardDetector;
use checkerboard_calib::session::{
    CaptureSession, LogSink, MemorySource, ScriptedInput, SessionEnd, UserSignal,
};
use checkerboard_calib::{store, synthetic, SessionConfig};

#[test]
fn test_session_calibrates_rendered_board() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        output_path: dir.path().join("CameraCalibration.txt"),
        ..SessionConfig::default()
    };
    let camera = synthetic::demo_camera();
    let frames = synthetic::render_sequence(
        &camera,
        config.pattern_size(),
        config.square_size,
        20,
        0.45,
    );

    // Every frame is offered; the last one carries the calibrate signal.
    let mut script = vec![Some(UserSignal::Accept); 19];
    script.push(Some(UserSignal::Calibrate));
    let mut input = ScriptedInput::new(script);
    let mut source = MemorySource::new(frames.iter().map(|(frame, _)| frame.clone()));
    let mut sink = LogSink::default();

    let detector = ChessboardDetector::new(config.detector);
    let mut session = CaptureSession::new(config, detector).unwrap();
    let end = session.run(&mut source, &mut input, &mut sink).unwrap();

    assert_eq!(end, SessionEnd::Calibrated);
    assert!(session.views().len() >= 15, "{} views", session.views().len());

    // Accepted views carry the detected corners of their frame.
    for view in session.views() {
        let (_, truth) = frames
            .iter()
            .find(|(frame, _)| frame.as_raw() == view.frame.as_raw())
            .unwrap();
        for (detected, expected) in view.points.iter().zip(truth) {
            assert!((detected - expected).norm() < 0.25);
        }
    }

    let outcome = session.outcome().unwrap();
    let result = &outcome.result;
    assert!(result.rms_error < 0.25, "rms {}", result.rms_error);

    let truth = camera.intrinsics;
    assert!((result.intrinsics.fx - truth.fx).abs() < 0.02 * truth.fx);
    assert!((result.intrinsics.fy - truth.fy).abs() < 0.02 * truth.fy);
    assert!((result.intrinsics.cx - truth.cx).abs() < 5.0);
    assert!((result.intrinsics.cy - truth.cy).abs() < 5.0);
    assert!((result.distortion[0] - camera.distortions[0]).abs() < 0.05);

    let (k, d) = store::load(dir.path().join("CameraCalibration.txt")).unwrap();
    assert_eq!(k, result.camera_matrix());
    assert_eq!(d, result.distortion);
}
