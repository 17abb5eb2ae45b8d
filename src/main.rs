//! Checkerboard calibration tool
//!
//! Usage:
//! ```bash
//! checkerboard-calib calibrate frames/*.png --output CameraCalibration.txt --report report.yaml
//! checkerboard-calib detect frames/*.png --csv corners.csv
//! checkerboard-calib show CameraCalibration.txt
//! checkerboard-calib demo --views 16
//! ```

use checkerboard_calib::detection::{ChessboardDetector, PatternDetector};
use checkerboard_calib::session::{
    CaptureSession, FrameSource, ImageSequenceSource, LogSink, MemorySource, ScriptedInput,
    SessionEnd, SignalResponse, UserSignal,
};
use checkerboard_calib::{store, synthetic, CalibrationResult, SessionConfig};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Camera calibration from checkerboard images
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Session configuration YAML (pattern, square size, solver settings)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Calibrate from image files, using every frame where the board is found
    Calibrate {
        /// Image files, or a single directory of images
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Calibration file to write (overrides the configuration)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write a full YAML report with poses and per-view errors
        #[arg(short, long)]
        report: Option<PathBuf>,
    },
    /// Detect board corners and write them to CSV
    Detect {
        #[arg(required = true)]
        images: Vec<PathBuf>,

        #[arg(long)]
        csv: PathBuf,
    },
    /// Print a calibration file
    Show { file: PathBuf },
    /// Run a full session on rendered synthetic frames
    Demo {
        /// Number of views to accept before calibrating
        #[arg(short = 'n', long, default_value = "16")]
        views: usize,

        /// Calibration file to write (overrides the configuration)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Serialize)]
struct CornerRecord<'a> {
    image: &'a str,
    index: usize,
    row: usize,
    col: usize,
    x: f64,
    y: f64,
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Ok(SessionConfig::load_from_yaml(path)?)
        }
        None => Ok(SessionConfig::default()),
    }
}

fn image_source(images: &[PathBuf]) -> Result<ImageSequenceSource, Box<dyn std::error::Error>> {
    match images {
        [dir] if dir.is_dir() => Ok(ImageSequenceSource::from_dir(dir)?),
        _ => Ok(ImageSequenceSource::new(images.iter().cloned())),
    }
}

fn print_result(result: &CalibrationResult) {
    let k = result.camera_matrix();
    println!("\n📷 Calibration result ({} views)", result.view_count());
    println!("----------------------------------");
    println!(
        "   fx={:.4}, fy={:.4}, cx={:.4}, cy={:.4}",
        k[(0, 0)],
        k[(1, 1)],
        k[(0, 2)],
        k[(1, 2)]
    );
    println!("   distortion: {:?}", result.distortion);
    println!("   RMS reprojection error: {:.4} px", result.rms_error);
}

fn run_calibrate(
    config: SessionConfig,
    images: &[PathBuf],
    report: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut source = image_source(images)?;
    let detector = ChessboardDetector::new(config.detector);
    let mut session = CaptureSession::new(config, detector)?;

    let mut frame_index = 0;
    while let Some(frame) = source.read()? {
        frame_index += 1;
        let found = session.on_frame(frame).is_some_and(|d| d.found);
        if found {
            session.handle_signal(UserSignal::Accept)?;
        } else {
            warn!("frame {frame_index}: board not found");
        }
    }

    match session.handle_signal(UserSignal::Calibrate)? {
        SignalResponse::NotEnoughViews { found, required } => {
            return Err(format!("board found in {found} images, need at least {required}").into())
        }
        SignalResponse::Calibrated => {}
        other => return Err(format!("unexpected session response {other:?}").into()),
    }

    let outcome = session.outcome().ok_or("calibration produced no result")?;
    print_result(&outcome.result);
    if let Some(error) = &outcome.save_error {
        return Err(format!("failed to save calibration: {error}").into());
    }
    if let Some(path) = &outcome.saved_to {
        println!("✅ Saved calibration to {}", path.display());
    }
    if let Some(report) = report {
        store::save_report_yaml(report, &outcome.result)?;
        println!("✅ Saved report to {}", report.display());
    }
    Ok(())
}

fn run_detect(
    config: &SessionConfig,
    images: &[PathBuf],
    csv_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let detector = ChessboardDetector::new(config.detector);
    let pattern = config.pattern_size();
    let mut writer = csv::Writer::from_path(csv_path)?;

    let mut found_count = 0;
    for path in images {
        let frame = image::open(path)?.to_luma8();
        let detection = detector.detect(&frame, pattern);
        let name = path.to_string_lossy();
        if !detection.found {
            println!("❌ {name}: board not found");
            continue;
        }
        found_count += 1;
        println!("✅ {name}: {} corners", detection.corners.len());
        for (index, corner) in detection.corners.iter().enumerate() {
            writer.serialize(CornerRecord {
                image: &name,
                index,
                row: index / pattern.width,
                col: index % pattern.width,
                x: corner.x,
                y: corner.y,
            })?;
        }
    }
    writer.flush()?;
    println!(
        "Board found in {found_count}/{} images, corners written to {}",
        images.len(),
        csv_path.display()
    );
    Ok(())
}

fn run_show(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let (k, d) = store::load(file)?;
    println!("Camera matrix:{k}");
    println!("Distortion [k1, k2, p1, p2, k3, k4, k5, k6]:");
    println!("   {d:?}");
    Ok(())
}

fn run_demo(config: SessionConfig, views: usize) -> Result<(), Box<dyn std::error::Error>> {
    let camera = synthetic::demo_camera();
    let pattern = config.pattern_size();
    println!("🎲 Rendering {views} synthetic views of a {pattern} board");
    println!(
        "   ground truth: fx={}, fy={}, cx={}, cy={}, distortion {:?}",
        camera.intrinsics.fx,
        camera.intrinsics.fy,
        camera.intrinsics.cx,
        camera.intrinsics.cy,
        camera.distortions
    );

    // One extra frame to carry the calibrate signal.
    let frames = synthetic::render_sequence(&camera, pattern, config.square_size, views + 1, 0.45)
        .into_iter()
        .map(|(frame, _)| frame);
    let mut source = MemorySource::new(frames);
    let mut script = vec![Some(UserSignal::Accept); views];
    script.push(Some(UserSignal::Calibrate));
    let mut input = ScriptedInput::new(script);
    let mut sink = LogSink::default();

    let detector = ChessboardDetector::new(config.detector);
    let mut session = CaptureSession::new(config, detector)?;
    let end = session.run(&mut source, &mut input, &mut sink)?;
    println!(
        "Session ended ({end:?}): board found in {}/{} frames, {} views accepted",
        sink.detections,
        sink.frames,
        session.views().len()
    );

    match (end, session.outcome()) {
        (SessionEnd::Calibrated, Some(outcome)) => {
            print_result(&outcome.result);
            if let Some(path) = &outcome.saved_to {
                println!("✅ Saved calibration to {}", path.display());
            }
            Ok(())
        }
        _ => Err("demo session did not calibrate".into()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Calibrate {
            images,
            output,
            report,
        } => {
            if let Some(output) = output {
                config.output_path = output;
            }
            run_calibrate(config, &images, report.as_deref())
        }
        Command::Detect { images, csv } => run_detect(&config, &images, &csv),
        Command::Show { file } => run_show(&file),
        Command::Demo { views, output } => {
            if let Some(output) = output {
                config.output_path = output;
            }
            run_demo(config, views)
        }
    }
}
