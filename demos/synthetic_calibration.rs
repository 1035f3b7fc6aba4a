//! Synthetic Fisheye Calibration
//!
//! Projects a planar target through a known fisheye camera from a ring of
//! poses, adds pixel noise, and calibrates the camera back from the noisy
//! observations. With `--stereo` a second camera is added and the pair is
//! calibrated jointly and rectified.
//!
//! Usage:
//! ```bash
//! RUST_LOG=info cargo run --example synthetic_calibration -- \
//!   --camera samples/fisheye.yaml --views 15 --noise 0.3 --stereo
//! ```

use clap::Parser;
use fisheye_calib::geometry::{orbit_poses, planar_grid};
use fisheye_calib::optimization::{
    calibrate, stereo_calibrate, CalibrationFlags, CalibrationView, StereoView, TermCriteria,
};
use fisheye_calib::rectify::{stereo_rectify, RectifyOptions};
use fisheye_calib::util::{
    compute_reprojection_error, display_calibration_results, export_calibration_json,
    export_stereo_report,
};
use fisheye_calib::{CameraModel, FisheyeModel, ViewPose};
use log::info;
use nalgebra::{Matrix2xX, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::path::PathBuf;

/// Synthetic fisheye calibration tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the ground-truth camera YAML file
    #[arg(short = 'c', long, default_value = "samples/fisheye.yaml")]
    camera: PathBuf,

    /// Number of target views
    #[arg(short = 'v', long, default_value = "12")]
    views: usize,

    /// Standard deviation of the pixel noise
    #[arg(short = 'n', long, default_value = "0.2")]
    noise: f64,

    /// Seed of the noise generator
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Also calibrate and rectify a stereo pair
    #[arg(long)]
    stereo: bool,

    /// Directory for the JSON results
    #[arg(short = 'o', long, default_value = "output")]
    output: PathBuf,
}

fn add_noise(points: Matrix2xX<f64>, noise: &Normal<f64>, rng: &mut StdRng) -> Matrix2xX<f64> {
    points.map(|v| v + noise.sample(rng))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let camera_path = cli.camera.to_str().ok_or("Invalid camera path string")?;
    let truth = FisheyeModel::load_from_yaml(camera_path)?;
    info!("Ground truth camera: {truth:?}");

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let noise = Normal::new(0.0, cli.noise)?;
    let grid = planar_grid(9, 6, 0.04);
    let poses = orbit_poses(cli.views, 0.5);
    let views: Vec<CalibrationView> = poses
        .iter()
        .map(|pose| {
            let pixels = add_noise(truth.project_points(&grid, pose), &noise, &mut rng);
            CalibrationView::new(grid.clone(), pixels)
        })
        .collect();

    let flags = CalibrationFlags {
        check_cond: true,
        ..CalibrationFlags::default()
    };
    let result = calibrate(&views, truth.resolution, None, flags, TermCriteria::default())?;
    display_calibration_results(&result);

    let stats = compute_reprojection_error(&result.camera, &views, &result.poses)?;
    info!("{stats:?}");
    println!(
        "Mono: rms {:.4} px after {} iterations, fx error {:.4} px",
        result.rms,
        result.iterations,
        (result.camera.intrinsics.fx - truth.intrinsics.fx).abs()
    );
    export_calibration_json(&result, &cli.output.join("mono_calibration.json"))?;

    if !cli.stereo {
        return Ok(());
    }

    let mut right = truth.clone();
    right.intrinsics.fx *= 0.99;
    right.intrinsics.cx += 8.0;
    let relative = ViewPose::new(Vector3::new(0.0, 0.02, 0.0), Vector3::new(-0.12, 0.0, 0.0));
    let stereo_views: Vec<StereoView> = poses
        .iter()
        .map(|pose| {
            StereoView::new(
                grid.clone(),
                add_noise(truth.project_points(&grid, pose), &noise, &mut rng),
                add_noise(right.project_points(&grid, &relative.compose(pose)), &noise, &mut rng),
            )
        })
        .collect();

    let stereo = stereo_calibrate(
        &stereo_views,
        truth.resolution,
        None,
        None,
        CalibrationFlags::default(),
        TermCriteria::stereo(),
    )?;
    println!(
        "Stereo: rms {:.4} px, baseline {:.4} m",
        stereo.rms,
        stereo.relative.translation.norm()
    );
    export_calibration_json(&stereo, &cli.output.join("stereo_calibration.json"))?;
    export_stereo_report(&stereo, &cli.output.join("stereo_report.txt"))?;

    let rectification = stereo_rectify(
        &stereo.left,
        &stereo.right,
        truth.resolution,
        &stereo.relative.rotation_matrix(),
        &stereo.relative.translation,
        &RectifyOptions::default(),
    )?;
    info!("P1: {}", rectification.p1);
    info!("P2: {}", rectification.p2);
    export_calibration_json(&rectification, &cli.output.join("rectification.json"))?;

    Ok(())
}
