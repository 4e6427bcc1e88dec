use cv_calib3d::*;
use cv_core::{CameraExtrinsics, CameraIntrinsics, CollectingReporter, Distortion, PinholeModel, Severity};
use image::{GrayImage, Luma};
use nalgebra::{Point2, Point3, Rotation3, Vector3};
use rayon::prelude::*;

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

fn truth_model() -> PinholeModel {
    PinholeModel::new(
        CameraIntrinsics::new(600.0, 600.0, 321.0, 238.0, WIDTH, HEIGHT),
        Distortion::new(-0.06, 0.0, 0.0, 0.0, 0.0),
    )
}

/// Pose viewing the centre of a `grid` board from `distance` cm.
fn pose(grid: &CalibrationGrid, rx: f64, ry: f64, rz: f64, distance: f64) -> CameraExtrinsics {
    let rot = Rotation3::from_euler_angles(rx, ry, rz).into_inner();
    let centre = Vector3::new(
        (grid.rows - 1) as f64 * grid.square_size_cm * 0.5,
        (grid.columns - 1) as f64 * grid.square_size_cm * 0.5,
        0.0,
    );
    CameraExtrinsics::new(rot, Vector3::new(0.0, 0.0, distance) - rot * centre)
}

/// Antialiased render of a chessboard with a white border through a
/// distorted pinhole camera.
fn render_board(model: &PinholeModel, grid: &CalibrationGrid, pose: &CameraExtrinsics) -> GrayImage {
    let sq = grid.square_size_cm;
    let (x_max, y_max) = (grid.rows as f64 * sq, grid.columns as f64 * sq);
    let inv = pose.inverse();
    let intr = model.intrinsics;
    let shade = |xn: f64, yn: f64| -> f64 {
        // intersect the viewing ray with the board plane
        let origin = inv.translation;
        let dir = inv.rotation * Vector3::new(xn, yn, 1.0);
        if dir.z.abs() < 1e-12 {
            return 128.0;
        }
        let s = -origin.z / dir.z;
        let (wx, wy) = (origin.x + s * dir.x, origin.y + s * dir.y);
        if wx < -sq || wy < -sq || wx >= x_max || wy >= y_max {
            let border = wx >= -2.0 * sq && wy >= -2.0 * sq && wx < x_max + sq && wy < y_max + sq;
            return if border { 230.0 } else { 150.0 };
        }
        let parity = ((wx / sq).floor() as i64 + (wy / sq).floor() as i64).rem_euclid(2);
        if parity == 0 {
            25.0
        } else {
            230.0
        }
    };

    let mut img = GrayImage::new(WIDTH, HEIGHT);
    img.as_mut()
        .par_chunks_mut(WIDTH as usize)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let n = intr.normalize(&Point2::new(x as f64, y as f64));
                let (xu, yu) = model.distortion.remove(n.x, n.y);
                let mut acc = 0.0;
                for sy in [-1.0, 0.0, 1.0] {
                    for sx in [-1.0, 0.0, 1.0] {
                        acc += shade(xu + sx / (3.0 * intr.fx), yu + sy / (3.0 * intr.fy));
                    }
                }
                *out = (acc / 9.0).round() as u8;
            }
        });
    img
}

fn calibration_images(grid: &CalibrationGrid) -> Vec<(GrayImage, String)> {
    let model = truth_model();
    [
        pose(grid, 0.3, -0.15, 0.05, 48.0),
        pose(grid, -0.25, 0.3, -0.1, 50.0),
        pose(grid, 0.15, 0.25, 0.2, 46.0),
    ]
    .iter()
    .enumerate()
    .map(|(i, p)| (render_board(&model, grid, p), format!("board{i}.png")))
    .collect()
}

#[test]
fn intrinsic_calibration_on_rendered_boards() {
    let grid = CalibrationGrid::new(6, 8, 2.5);
    let images = calibration_images(&grid);
    let reporter = CollectingReporter::new();

    let calib = calibrate_intrinsics_from_images(&images, &grid, &IntrinsicOptions::default(), &reporter).unwrap();

    assert!(calib.successful);
    assert!(calib.avg_reprojection_error < 0.5, "error {}", calib.avg_reprojection_error);
    assert_eq!(calib.per_image.len(), 3);
    assert!(calib.reprojection_error("board1.png").is_some());
    let k = calib.camera_matrix;
    let truth = truth_model().intrinsics;
    assert!((k[(0, 0)] - truth.fx).abs() / truth.fx < 0.01, "fx {}", k[(0, 0)]);
    assert!((k[(1, 1)] - truth.fy).abs() / truth.fy < 0.01, "fy {}", k[(1, 1)]);
    assert!((k[(0, 2)] - truth.cx).abs() < 6.0, "cx {}", k[(0, 2)]);
    assert!((k[(1, 2)] - truth.cy).abs() < 6.0, "cy {}", k[(1, 2)]);
    assert!((calib.distortion.k1 + 0.06).abs() < 0.03, "k1 {}", calib.distortion.k1);
    assert_eq!(reporter.count(Severity::Warning), 0);
    assert_eq!(reporter.last_progress(), Some((3, 3)));
}

#[test]
fn skipped_views_are_reported_in_input_order() {
    let grid = CalibrationGrid::new(6, 8, 2.5);
    let mut boards = calibration_images(&grid).into_iter();
    let mut images = vec![(GrayImage::from_pixel(WIDTH, HEIGHT, Luma([255])), "empty.png".to_string())];
    images.extend(boards.next());
    images.push((GrayImage::new(320, 240), "small.png".to_string()));
    images.extend(boards);
    let reporter = CollectingReporter::new();

    let calib = calibrate_intrinsics_from_images(&images, &grid, &IntrinsicOptions::default(), &reporter).unwrap();
    let ids: Vec<&str> = calib.per_image.iter().map(|v| v.id.as_str()).collect();
    assert_eq!(ids, ["board0.png", "board1.png", "board2.png"]);

    let warnings: Vec<String> = reporter
        .reports()
        .into_iter()
        .filter(|r| r.severity == Severity::Warning)
        .map(|r| r.message)
        .collect();
    assert_eq!(warnings.len(), 2);
    assert!(warnings[0].contains("empty.png"), "{warnings:?}");
    assert!(warnings[1].contains("small.png"), "{warnings:?}");
    assert_eq!(reporter.last_progress(), Some((5, 5)));
}

#[test]
fn unreadable_files_are_skipped() {
    let grid = CalibrationGrid::new(6, 8, 2.5);
    let dir = tempfile::tempdir().unwrap();
    let mut files = Vec::new();
    for (img, id) in calibration_images(&grid) {
        let path = dir.path().join(&id);
        img.save(&path).unwrap();
        files.push((path, id));
    }
    files.push((dir.path().join("missing.png"), "missing.png".to_string()));
    let reporter = CollectingReporter::new();

    let calib = calibrate_intrinsics_from_files(&files, &grid, &IntrinsicOptions::default(), &reporter).unwrap();
    assert!(calib.avg_reprojection_error < 1.0);
    assert_eq!(calib.per_image.len(), 3);
    assert_eq!(reporter.count(Severity::Warning), 1);
}

#[test]
fn floor_camera_end_to_end() {
    let grid = CalibrationGrid::new(6, 8, 2.5);
    let intrinsic = calibrate_intrinsics_from_images(
        &calibration_images(&grid),
        &grid,
        &IntrinsicOptions::default(),
        &CollectingReporter::new(),
    )
    .unwrap();

    let mut registry = CameraRegistry::new();
    registry.assign_camera("north", "cam-7");
    registry.set_intrinsics("cam-7", intrinsic.clone());

    let truth = pose(&grid, 0.2, -0.1, 0.4, 52.0);
    let floor = render_board(&truth_model(), &grid, &truth);
    let reporter = CollectingReporter::new();
    let ext = calibrate_position(&mut registry, "north", &floor, &grid, &IntrinsicOptions::default(), &reporter).unwrap();

    assert!(ext.successful);
    assert_eq!(registry.extrinsics("north"), Some(&ext));
    assert!((ext.translation - truth.translation).norm() < 1.5, "{}", ext.translation);
    // a 2.5 cm square at ~50 cm with f = 600 spans ~30 px
    assert!(ext.grid_square_size_px > 20.0 && ext.grid_square_size_px < 40.0);

    let mapping = GroundPlaneMapping::from_calibrations(&intrinsic, &ext).unwrap();
    for p in [Point2::new(100.0, 80.0), Point2::new(320.0, 240.0), Point2::new(560.0, 420.0)] {
        let q = mapping.image_to_plane(&p).unwrap();
        let back = mapping.plane_to_image(&q).unwrap();
        assert!((back - p).norm() < 0.5, "{p} -> {back}");
    }

    // board corners land on a regular grid in the plane image
    let model = truth_model();
    let c0 = mapping.image_to_plane(&model.project_world(&truth, &Point3::new(0.0, 0.0, 0.0))).unwrap();
    let c1 = mapping.image_to_plane(&model.project_world(&truth, &Point3::new(0.0, 2.5, 0.0))).unwrap();
    let d = (c1 - c0).norm() / ext.px_per_cm();
    assert!((d - 2.5).abs() < 0.1, "{d}");

    let warp = compute_ground_plane_warp(&mapping, floor.dimensions()).unwrap();
    let again = compute_ground_plane_warp(&mapping, floor.dimensions()).unwrap();
    // unseen pixels are NaN, so compare bit patterns
    let bits = |m: &[f32]| m.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&warp.map_x), bits(&again.map_x));
    assert_eq!(bits(&warp.map_y), bits(&again.map_y));
    assert_eq!(warp.offset, again.offset);
    let a = unwarp_ground_plane(&floor, &warp).unwrap();
    let b = unwarp_ground_plane(&floor, &again).unwrap();
    assert_eq!(a, b);
}

#[test]
fn uncalibrated_camera_blocks_extrinsics() {
    let grid = CalibrationGrid::new(6, 8, 2.5);
    let mut intrinsic = calibrate_intrinsics_from_images(
        &calibration_images(&grid),
        &grid,
        &IntrinsicOptions::default(),
        &CollectingReporter::new(),
    )
    .unwrap();
    intrinsic.successful = false;

    let mut registry = CameraRegistry::new();
    registry.assign_camera("south", "cam-2");
    registry.set_intrinsics("cam-2", intrinsic);
    let floor = render_board(&truth_model(), &grid, &pose(&grid, 0.1, 0.1, 0.0, 50.0));
    let reporter = CollectingReporter::new();

    let err = calibrate_position(&mut registry, "south", &floor, &grid, &IntrinsicOptions::default(), &reporter)
        .unwrap_err();
    assert!(err.to_string().contains("not correctly calibrated"));
    assert_eq!(reporter.count(Severity::Error), 1);
}

#[test]
fn missing_board_names_grid_size() {
    let grid = CalibrationGrid::new(6, 8, 2.5);
    let blank = GrayImage::from_pixel(WIDTH, HEIGHT, Luma([128]));
    let err = detect_calibration_corners(&blank, &grid, &IntrinsicOptions::default()).unwrap_err();
    assert!(err.to_string().contains("6 x 8"), "{err}");
}
