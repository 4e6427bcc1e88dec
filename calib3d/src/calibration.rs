//! Intrinsic camera calibration from chessboard views.
//!
//! Each usable view contributes its detected, sub-pixel refined corners. The
//! camera matrix, five distortion coefficients and every view pose are then
//! refined jointly with Levenberg-Marquardt. A second small fit produces
//! coefficients that approximately invert the lens model, so that points can
//! be undistorted analytically later on.

use std::path::Path;

use chrono::{DateTime, Utc};
use cv_core::{CameraExtrinsics, CameraIntrinsics, Distortion, PinholeModel, Reporter, Severity};
use cv_imgproc::flip_vertical;
use cv_optimize::{LMConfig, LeastSquaresProblem, LevenbergMarquardt};
use image::GrayImage;
use nalgebra::{DMatrix, DVector, Matrix2, Matrix3, Point2, Point3, Vector2, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::homography::{find_homography, pose_from_homography};
use crate::pattern::{corner_subpix, create_calibration_object, find_chessboard_corners};
use crate::{CalibError, Result};

const MIN_VIEWS: usize = 2;
const INVERSE_FIT_GRID: usize = 12;

/// Chessboard geometry. `rows` and `columns` count inner corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationGrid {
    pub rows: usize,
    pub columns: usize,
    pub square_size_cm: f64,
}

impl CalibrationGrid {
    pub fn new(rows: usize, columns: usize, square_size_cm: f64) -> Self {
        Self {
            rows,
            columns,
            square_size_cm,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.rows < 3 || self.columns < 3 {
            return Err(CalibError::InvalidParameters(format!(
                "calibration grid needs at least 3 x 3 inner corners, got {} x {}",
                self.rows, self.columns
            )));
        }
        if !self.square_size_cm.is_finite() || self.square_size_cm <= 0.0 {
            return Err(CalibError::InvalidParameters(format!(
                "square size must be positive, got {}",
                self.square_size_cm
            )));
        }
        Ok(())
    }

    /// `(cols, rows)` as expected by the detector.
    pub fn pattern_size(&self) -> (usize, usize) {
        (self.columns, self.rows)
    }

    pub fn corner_count(&self) -> usize {
        self.rows * self.columns
    }

    pub fn object_points(&self) -> Vec<Point3<f64>> {
        create_calibration_object(self.rows, self.columns, self.square_size_cm)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntrinsicOptions {
    /// Hold `fx = ratio * fy` during optimization.
    pub fix_aspect_ratio: Option<f64>,
    pub zero_tangential_distortion: bool,
    /// Hold the principal point at the image centre.
    pub fix_principal_point: bool,
    /// Flip every image upside down before detection.
    pub flip_vertical: bool,
    pub subpix_half_window: usize,
    pub subpix_max_iters: usize,
    pub subpix_eps: f64,
    pub lm: LMConfig,
}

impl Default for IntrinsicOptions {
    fn default() -> Self {
        Self {
            fix_aspect_ratio: None,
            zero_tangential_distortion: false,
            fix_principal_point: false,
            flip_vertical: false,
            subpix_half_window: 5,
            subpix_max_iters: 30,
            subpix_eps: 0.1,
            lm: LMConfig::default().with_max_iters(100).with_tolerance(1e-9),
        }
    }
}

impl IntrinsicOptions {
    pub fn with_fix_aspect_ratio(mut self, ratio: f64) -> Self {
        self.fix_aspect_ratio = Some(ratio);
        self
    }

    pub fn with_zero_tangential_distortion(mut self, on: bool) -> Self {
        self.zero_tangential_distortion = on;
        self
    }

    pub fn with_fix_principal_point(mut self, on: bool) -> Self {
        self.fix_principal_point = on;
        self
    }

    pub fn with_flip_vertical(mut self, on: bool) -> Self {
        self.flip_vertical = on;
        self
    }
}

/// Reprojection summary for one input image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageReprojection {
    pub id: String,
    /// Mean `|du| + |dv|` over the corners of this view, in pixels.
    pub error: f64,
    pub detected_points: Vec<Point2<f64>>,
    pub reprojected_points: Vec<Point2<f64>>,
    pub extrinsics: CameraExtrinsics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicCalibration {
    pub camera_matrix: Matrix3<f64>,
    pub distortion: Distortion,
    /// Coefficients that, fed through the same polynomial, map distorted
    /// normalized coordinates back to undistorted ones.
    pub inverse_distortion: Distortion,
    pub image_size: (u32, u32),
    pub avg_reprojection_error: f64,
    pub per_image: Vec<ImageReprojection>,
    pub successful: bool,
    pub calibrated_at: DateTime<Utc>,
}

impl IntrinsicCalibration {
    pub fn intrinsics(&self) -> CameraIntrinsics {
        CameraIntrinsics::from_matrix(&self.camera_matrix, self.image_size.0, self.image_size.1)
    }

    pub fn model(&self) -> PinholeModel {
        PinholeModel::new(self.intrinsics(), self.distortion)
    }

    pub fn is_finite(&self) -> bool {
        self.camera_matrix.iter().all(|v| v.is_finite())
            && self.intrinsics().is_finite()
            && self.distortion.is_finite()
            && self.inverse_distortion.is_finite()
    }

    pub fn reprojection_error(&self, id: &str) -> Option<f64> {
        self.per_image.iter().find(|r| r.id == id).map(|r| r.error)
    }
}

/// Detected corners of one calibration image.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationView {
    pub id: String,
    pub image_points: Vec<Point2<f64>>,
}

/// Detect and refine the chessboard corners of a single image.
pub fn detect_calibration_corners(
    image: &GrayImage,
    grid: &CalibrationGrid,
    options: &IntrinsicOptions,
) -> Result<Vec<Point2<f64>>> {
    let mut corners = find_chessboard_corners(image, grid.pattern_size())?;
    if corners.len() != grid.corner_count() {
        return Err(CalibError::ChessboardNotFound {
            rows: grid.rows,
            cols: grid.columns,
            found: corners.len(),
        });
    }
    corner_subpix(
        image,
        &mut corners,
        options.subpix_half_window,
        options.subpix_max_iters,
        options.subpix_eps,
    )?;
    Ok(corners)
}

/// Calibrate from image files. Unreadable images and images without a
/// complete chessboard are reported and skipped.
pub fn calibrate_intrinsics_from_files<P: AsRef<Path>>(
    images: &[(P, String)],
    grid: &CalibrationGrid,
    options: &IntrinsicOptions,
    reporter: &dyn Reporter,
) -> Result<IntrinsicCalibration> {
    grid.validate()?;
    let mut loaded = Vec::with_capacity(images.len());
    for (path, id) in images {
        let path = path.as_ref();
        match image::open(path) {
            Ok(img) => loaded.push((img.to_luma8(), id.clone())),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable calibration image");
                reporter.report(
                    Severity::Warning,
                    "Intrinsic calibration",
                    &format!("Cannot read image '{}'", path.display()),
                    &e.to_string(),
                );
            }
        }
    }
    calibrate_intrinsics_from_images(&loaded, grid, options, reporter)
}

/// Same pipeline as [`calibrate_intrinsics_from_files`] on decoded images.
pub fn calibrate_intrinsics_from_images(
    images: &[(GrayImage, String)],
    grid: &CalibrationGrid,
    options: &IntrinsicOptions,
    reporter: &dyn Reporter,
) -> Result<IntrinsicCalibration> {
    grid.validate()?;
    // detection runs per view in parallel; reporting stays in input order
    let detected: Vec<((u32, u32), Result<Vec<Point2<f64>>>)> = images
        .par_iter()
        .map(|(img, _)| {
            if options.flip_vertical {
                let flipped = flip_vertical(img);
                (flipped.dimensions(), detect_calibration_corners(&flipped, grid, options))
            } else {
                (img.dimensions(), detect_calibration_corners(img, grid, options))
            }
        })
        .collect();

    let mut views = Vec::with_capacity(images.len());
    let mut image_size: Option<(u32, u32)> = None;
    for (done, ((_, id), (dims, found))) in images.iter().zip(detected).enumerate() {
        if let Some(size) = image_size {
            if dims != size {
                tracing::warn!(id = %id, ?size, actual = ?dims, "image size differs, skipping");
                reporter.report(
                    Severity::Warning,
                    "Intrinsic calibration",
                    &format!("Image '{id}' has a different size and was skipped"),
                    &format!("expected {:?}, got {:?}", size, dims),
                );
                reporter.progress(done + 1, images.len());
                continue;
            }
        }

        match found {
            Ok(points) => {
                image_size.get_or_insert(dims);
                views.push(CalibrationView {
                    id: id.clone(),
                    image_points: points,
                });
            }
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "no chessboard found, skipping");
                reporter.report(
                    Severity::Warning,
                    "Intrinsic calibration",
                    &format!("No chessboard found in image '{id}'"),
                    &e.to_string(),
                );
            }
        }
        reporter.progress(done + 1, images.len());
    }

    let image_size = image_size.ok_or_else(|| {
        CalibError::CalibrationError("no usable calibration images".to_string())
    })?;
    let calib = calibrate_from_views(&views, image_size, grid, options)?;
    reporter.report(
        Severity::Info,
        "Intrinsic calibration",
        &format!(
            "Calibrated from {} of {} images, average error {:.3} px",
            views.len(),
            images.len(),
            calib.avg_reprojection_error
        ),
        "",
    );
    Ok(calib)
}

/// Joint refinement of intrinsics, distortion and view poses from detected
/// corners.
pub fn calibrate_from_views(
    views: &[CalibrationView],
    image_size: (u32, u32),
    grid: &CalibrationGrid,
    options: &IntrinsicOptions,
) -> Result<IntrinsicCalibration> {
    grid.validate()?;
    if views.len() < MIN_VIEWS {
        return Err(CalibError::CalibrationError(format!(
            "need at least {MIN_VIEWS} usable views, got {}",
            views.len()
        )));
    }
    let object = grid.object_points();
    if let Some(bad) = views.iter().find(|v| v.image_points.len() != object.len()) {
        return Err(CalibError::DimensionMismatch(format!(
            "view '{}' has {} points, expected {}",
            bad.id,
            bad.image_points.len(),
            object.len()
        )));
    }

    let plane: Vec<Point2<f64>> = object.iter().map(|p| Point2::new(p.x, p.y)).collect();
    let homographies = views
        .iter()
        .map(|v| find_homography(&plane, &v.image_points))
        .collect::<Result<Vec<_>>>()?;

    let k0 = initial_camera_matrix(&homographies, image_size, options.fix_aspect_ratio);
    let k0_inv = k0
        .try_inverse()
        .ok_or_else(|| CalibError::NumericFailure("singular initial camera matrix".to_string()))?;
    let poses = homographies
        .iter()
        .map(|h| pose_from_homography(&k0_inv, h))
        .collect::<Result<Vec<_>>>()?;

    let layout = ParamLayout::new(options, image_size);
    let problem = IntrinsicProblem {
        object: &object,
        views,
        layout,
    };
    let x0 = layout.pack(&k0, &Distortion::none(), &poses);
    let lm = LevenbergMarquardt::new(options.lm);
    let (x, report) = lm.minimize(&problem, x0)?;
    tracing::debug!(
        iterations = report.iterations,
        initial_cost = report.initial_cost,
        final_cost = report.final_cost,
        "intrinsic refinement finished"
    );

    let (intr, distortion, poses) = layout.unpack(&x, views.len());
    if !intr.iter().all(|v| v.is_finite())
        || !distortion.is_finite()
        || !poses.iter().all(|p| p.is_finite())
    {
        return Err(CalibError::NumericFailure(
            "calibration produced non-finite parameters".to_string(),
        ));
    }

    let camera_matrix = Matrix3::new(intr[0], 0.0, intr[2], 0.0, intr[1], intr[3], 0.0, 0.0, 1.0);
    let model = PinholeModel::new(
        CameraIntrinsics::from_matrix(&camera_matrix, image_size.0, image_size.1),
        distortion,
    );

    let per_image: Vec<ImageReprojection> = views
        .iter()
        .zip(poses.iter())
        .map(|(view, pose)| {
            let reprojected: Vec<Point2<f64>> =
                object.iter().map(|p| model.project_world(pose, p)).collect();
            let error = reprojected
                .iter()
                .zip(view.image_points.iter())
                .map(|(a, b)| (a.x - b.x).abs() + (a.y - b.y).abs())
                .sum::<f64>()
                / object.len() as f64;
            ImageReprojection {
                id: view.id.clone(),
                error,
                detected_points: view.image_points.clone(),
                reprojected_points: reprojected,
                extrinsics: *pose,
            }
        })
        .collect();
    let avg_reprojection_error =
        per_image.iter().map(|r| r.error).sum::<f64>() / per_image.len() as f64;

    let inverse_distortion = fit_inverse_distortion(&model, &object, &poses, options.lm)?;

    let calib = IntrinsicCalibration {
        camera_matrix,
        distortion,
        inverse_distortion,
        image_size,
        avg_reprojection_error,
        per_image,
        successful: true,
        calibrated_at: Utc::now(),
    };
    if !calib.is_finite() || !avg_reprojection_error.is_finite() {
        return Err(CalibError::NumericFailure(
            "calibration produced non-finite parameters".to_string(),
        ));
    }
    tracing::info!(
        views = views.len(),
        fx = camera_matrix[(0, 0)],
        fy = camera_matrix[(1, 1)],
        error = avg_reprojection_error,
        "intrinsic calibration done"
    );
    Ok(calib)
}

/// Fit coefficients `d'` with `apply(d', distorted) ~ undistorted` over the
/// board corners of every view plus a regular grid spanning the image.
pub fn fit_inverse_distortion(
    model: &PinholeModel,
    object: &[Point3<f64>],
    poses: &[CameraExtrinsics],
    config: LMConfig,
) -> Result<Distortion> {
    let mut pairs: Vec<(Vector2<f64>, Vector2<f64>)> = Vec::new();
    for pose in poses {
        for p in object {
            let pc = pose.transform_point(p);
            if pc.z.abs() < 1e-12 {
                continue;
            }
            let (xu, yu) = (pc.x / pc.z, pc.y / pc.z);
            let (xd, yd) = model.distortion.apply(xu, yu);
            pairs.push((Vector2::new(xd, yd), Vector2::new(xu, yu)));
        }
    }
    let intr = &model.intrinsics;
    for gy in 0..=INVERSE_FIT_GRID {
        for gx in 0..=INVERSE_FIT_GRID {
            let px = Point2::new(
                intr.width as f64 * gx as f64 / INVERSE_FIT_GRID as f64,
                intr.height as f64 * gy as f64 / INVERSE_FIT_GRID as f64,
            );
            let d = intr.normalize(&px);
            let (xu, yu) = model.distortion.remove(d.x, d.y);
            let (rx, ry) = model.distortion.apply(xu, yu);
            // skip samples where the forward model could not be inverted
            if (rx - d.x).abs() + (ry - d.y).abs() < 1e-9 {
                pairs.push((Vector2::new(d.x, d.y), Vector2::new(xu, yu)));
            }
        }
    }

    let problem = InverseDistortionProblem { pairs: &pairs };
    let (x, _) = LevenbergMarquardt::new(config).minimize(&problem, DVector::zeros(5))?;
    let inverse = Distortion::new(x[0], x[1], x[2], x[3], x[4]);
    if !inverse.is_finite() {
        return Err(CalibError::NumericFailure(
            "inverse distortion fit diverged".to_string(),
        ));
    }
    Ok(inverse)
}

struct InverseDistortionProblem<'a> {
    pairs: &'a [(Vector2<f64>, Vector2<f64>)],
}

impl LeastSquaresProblem for InverseDistortionProblem<'_> {
    fn num_params(&self) -> usize {
        5
    }

    fn num_residuals(&self) -> usize {
        2 * self.pairs.len()
    }

    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        let d = Distortion::new(params[0], params[1], params[2], params[3], params[4]);
        let mut r = DVector::zeros(2 * self.pairs.len());
        for (i, (dist, und)) in self.pairs.iter().enumerate() {
            let (x, y) = d.apply(dist.x, dist.y);
            r[2 * i] = x - und.x;
            r[2 * i + 1] = y - und.y;
        }
        r
    }
}

/// Focal lengths from the orthogonality constraints of the plane
/// homographies with the principal point held at the image centre.
fn initial_camera_matrix(
    homographies: &[Matrix3<f64>],
    image_size: (u32, u32),
    fix_aspect_ratio: Option<f64>,
) -> Matrix3<f64> {
    let cx = (image_size.0 as f64 - 1.0) * 0.5;
    let cy = (image_size.1 as f64 - 1.0) * 0.5;
    let shift = Matrix3::new(1.0, 0.0, -cx, 0.0, 1.0, -cy, 0.0, 0.0, 1.0);

    let mut ata = Matrix2::<f64>::zeros();
    let mut atb = Vector2::<f64>::zeros();
    for h in homographies {
        let mut hc = shift * h;
        hc /= hc.norm().max(1e-300);
        let h1: Vector3<f64> = hc.column(0).into_owned();
        let h2: Vector3<f64> = hc.column(1).into_owned();
        // diagonals d1 = h1 + h2, d2 = h1 - h2 are orthogonal iff |r1| = |r2|
        let d1 = h1 + h2;
        let d2 = h1 - h2;
        let rows = [
            (Vector2::new(h1.x * h2.x, h1.y * h2.y), -h1.z * h2.z),
            (Vector2::new(d1.x * d2.x, d1.y * d2.y), -d1.z * d2.z),
        ];
        for (a, b) in rows {
            let n = (a.norm_squared() + b * b).sqrt().max(1e-300);
            let (a, b) = (a / n, b / n);
            ata += a * a.transpose();
            atb += a * b;
        }
    }

    let fallback = image_size.0.max(image_size.1) as f64;
    let (mut fx, mut fy) = match ata.try_inverse().map(|inv| inv * atb) {
        Some(s) if s.x > 0.0 && s.y > 0.0 => (1.0 / s.x.sqrt(), 1.0 / s.y.sqrt()),
        _ => (fallback, fallback),
    };
    if !fx.is_finite() || !fy.is_finite() {
        fx = fallback;
        fy = fallback;
    }
    if let Some(ratio) = fix_aspect_ratio {
        let f = (fx * fy / ratio).sqrt();
        fy = f;
        fx = ratio * f;
    }
    Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0)
}

/// Maps between the full intrinsic vector `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`
/// and the free parameters selected by the calibration flags. View poses
/// follow as `[rvec, t]` blocks of six.
#[derive(Debug, Clone, Copy)]
struct ParamLayout {
    free: [bool; 9],
    fixed: [f64; 9],
    aspect: Option<f64>,
}

impl ParamLayout {
    fn new(options: &IntrinsicOptions, image_size: (u32, u32)) -> Self {
        let mut free = [true; 9];
        let mut fixed = [0.0; 9];
        if options.fix_aspect_ratio.is_some() {
            free[0] = false;
        }
        if options.fix_principal_point {
            free[2] = false;
            free[3] = false;
            fixed[2] = (image_size.0 as f64 - 1.0) * 0.5;
            fixed[3] = (image_size.1 as f64 - 1.0) * 0.5;
        }
        if options.zero_tangential_distortion {
            free[6] = false;
            free[7] = false;
        }
        Self {
            free,
            fixed,
            aspect: options.fix_aspect_ratio,
        }
    }

    fn num_intrinsic(&self) -> usize {
        self.free.iter().filter(|f| **f).count()
    }

    fn pack(&self, k: &Matrix3<f64>, d: &Distortion, poses: &[CameraExtrinsics]) -> DVector<f64> {
        let full = [
            k[(0, 0)],
            k[(1, 1)],
            k[(0, 2)],
            k[(1, 2)],
            d.k1,
            d.k2,
            d.p1,
            d.p2,
            d.k3,
        ];
        let mut out: Vec<f64> = full
            .iter()
            .zip(self.free.iter())
            .filter(|(_, free)| **free)
            .map(|(v, _)| *v)
            .collect();
        for pose in poses {
            let r = pose.rodrigues();
            out.extend_from_slice(&[r.x, r.y, r.z]);
            out.extend_from_slice(pose.translation.as_slice());
        }
        DVector::from_vec(out)
    }

    fn intrinsics(&self, x: &DVector<f64>) -> [f64; 9] {
        let mut full = self.fixed;
        let mut k = 0;
        for (i, free) in self.free.iter().enumerate() {
            if *free {
                full[i] = x[k];
                k += 1;
            }
        }
        if let Some(ratio) = self.aspect {
            full[0] = ratio * full[1];
        }
        full
    }

    fn pose(&self, x: &DVector<f64>, view: usize) -> CameraExtrinsics {
        let o = self.num_intrinsic() + 6 * view;
        CameraExtrinsics::from_rodrigues(
            &Vector3::new(x[o], x[o + 1], x[o + 2]),
            Vector3::new(x[o + 3], x[o + 4], x[o + 5]),
        )
    }

    fn unpack(&self, x: &DVector<f64>, views: usize) -> ([f64; 9], Distortion, Vec<CameraExtrinsics>) {
        let full = self.intrinsics(x);
        let d = Distortion::new(full[4], full[5], full[6], full[7], full[8]);
        let poses = (0..views).map(|v| self.pose(x, v)).collect();
        (full, d, poses)
    }
}

struct IntrinsicProblem<'a> {
    object: &'a [Point3<f64>],
    views: &'a [CalibrationView],
    layout: ParamLayout,
}

impl IntrinsicProblem<'_> {
    fn model(&self, x: &DVector<f64>) -> PinholeModel {
        let f = self.layout.intrinsics(x);
        PinholeModel::new(
            CameraIntrinsics::new(f[0], f[1], f[2], f[3], 0, 0),
            Distortion::new(f[4], f[5], f[6], f[7], f[8]),
        )
    }

    fn view_residuals(&self, model: &PinholeModel, pose: &CameraExtrinsics, view: usize, out: &mut [f64]) {
        for (i, (p, obs)) in self.object.iter().zip(&self.views[view].image_points).enumerate() {
            let proj = model.project_world(pose, p);
            out[2 * i] = proj.x - obs.x;
            out[2 * i + 1] = proj.y - obs.y;
        }
    }
}

impl LeastSquaresProblem for IntrinsicProblem<'_> {
    fn num_params(&self) -> usize {
        self.layout.num_intrinsic() + 6 * self.views.len()
    }

    fn num_residuals(&self) -> usize {
        2 * self.object.len() * self.views.len()
    }

    fn residuals(&self, x: &DVector<f64>) -> DVector<f64> {
        let model = self.model(x);
        let per_view = 2 * self.object.len();
        let mut r = DVector::zeros(self.num_residuals());
        for v in 0..self.views.len() {
            let pose = self.layout.pose(x, v);
            self.view_residuals(&model, &pose, v, &mut r.as_mut_slice()[v * per_view..(v + 1) * per_view]);
        }
        r
    }

    /// Pose columns only touch the residuals of their own view.
    fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        let n_intr = self.layout.num_intrinsic();
        let per_view = 2 * self.object.len();
        let mut jac = DMatrix::zeros(self.num_residuals(), self.num_params());

        let intr_cols: Vec<DVector<f64>> = (0..n_intr)
            .into_par_iter()
            .map(|k| {
                let h = 1e-6 * (1.0 + x[k].abs());
                let mut plus = x.clone();
                let mut minus = x.clone();
                plus[k] += h;
                minus[k] -= h;
                (self.residuals(&plus) - self.residuals(&minus)) / (2.0 * h)
            })
            .collect();
        for (k, col) in intr_cols.iter().enumerate() {
            jac.set_column(k, col);
        }

        let model = self.model(x);
        let blocks: Vec<DMatrix<f64>> = (0..self.views.len())
            .into_par_iter()
            .map(|v| {
                let mut block = DMatrix::zeros(per_view, 6);
                let mut plus = vec![0.0; per_view];
                let mut minus = vec![0.0; per_view];
                for k in 0..6 {
                    let idx = n_intr + 6 * v + k;
                    let h = 1e-6 * (1.0 + x[idx].abs());
                    let mut xp = x.clone();
                    xp[idx] += h;
                    self.view_residuals(&model, &self.layout.pose(&xp, v), v, &mut plus);
                    xp[idx] -= 2.0 * h;
                    self.view_residuals(&model, &self.layout.pose(&xp, v), v, &mut minus);
                    for i in 0..per_view {
                        block[(i, k)] = (plus[i] - minus[i]) / (2.0 * h);
                    }
                }
                block
            })
            .collect();
        for (v, block) in blocks.iter().enumerate() {
            jac.view_mut((v * per_view, n_intr + 6 * v), (per_view, 6))
                .copy_from(block);
        }
        jac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::CollectingReporter;
    use nalgebra::Rotation3;

    fn synthetic_views(
        model: &PinholeModel,
        grid: &CalibrationGrid,
        poses: &[CameraExtrinsics],
    ) -> Vec<CalibrationView> {
        let object = grid.object_points();
        poses
            .iter()
            .enumerate()
            .map(|(i, pose)| CalibrationView {
                id: format!("view{i}"),
                image_points: object.iter().map(|p| model.project_world(pose, p)).collect(),
            })
            .collect()
    }

    fn board_pose(rx: f64, ry: f64, rz: f64, t: [f64; 3]) -> CameraExtrinsics {
        CameraExtrinsics::new(
            Rotation3::from_euler_angles(rx, ry, rz).into_inner(),
            Vector3::new(t[0], t[1], t[2]),
        )
    }

    fn test_poses() -> Vec<CameraExtrinsics> {
        vec![
            board_pose(0.35, -0.2, 0.05, [-8.0, -6.0, 55.0]),
            board_pose(-0.3, 0.25, -0.1, [-9.0, -5.0, 60.0]),
            board_pose(0.1, 0.4, 0.2, [-6.0, -8.0, 50.0]),
            board_pose(-0.25, -0.35, 0.0, [-10.0, -4.0, 65.0]),
        ]
    }

    #[test]
    fn recovers_camera_from_exact_projections() {
        let grid = CalibrationGrid::new(6, 8, 2.5);
        let truth = PinholeModel::new(
            CameraIntrinsics::new(820.0, 800.0, 322.0, 236.0, 640, 480),
            Distortion::new(-0.12, 0.05, 0.001, -0.0005, 0.0),
        );
        let views = synthetic_views(&truth, &grid, &test_poses());

        let calib = calibrate_from_views(&views, (640, 480), &grid, &IntrinsicOptions::default()).unwrap();
        let k = calib.camera_matrix;
        assert!((k[(0, 0)] - 820.0).abs() < 0.5, "fx {}", k[(0, 0)]);
        assert!((k[(1, 1)] - 800.0).abs() < 0.5, "fy {}", k[(1, 1)]);
        assert!((k[(0, 2)] - 322.0).abs() < 0.5);
        assert!((k[(1, 2)] - 236.0).abs() < 0.5);
        assert!((calib.distortion.k1 + 0.12).abs() < 1e-3);
        assert!(calib.avg_reprojection_error < 1e-3);
        assert_eq!(calib.per_image.len(), 4);
        assert_eq!(calib.per_image[2].id, "view2");
        assert!(calib.successful);
    }

    #[test]
    fn flags_hold_parameters() {
        let grid = CalibrationGrid::new(6, 8, 2.5);
        let truth = PinholeModel::new(
            CameraIntrinsics::new(800.0, 800.0, 319.5, 239.5, 640, 480),
            Distortion::new(-0.1, 0.0, 0.0, 0.0, 0.0),
        );
        let views = synthetic_views(&truth, &grid, &test_poses());
        let options = IntrinsicOptions::default()
            .with_fix_aspect_ratio(1.0)
            .with_fix_principal_point(true)
            .with_zero_tangential_distortion(true);

        let calib = calibrate_from_views(&views, (640, 480), &grid, &options).unwrap();
        let k = calib.camera_matrix;
        assert_eq!(k[(0, 0)], k[(1, 1)]);
        assert_eq!(k[(0, 2)], 319.5);
        assert_eq!(k[(1, 2)], 239.5);
        assert_eq!(calib.distortion.p1, 0.0);
        assert_eq!(calib.distortion.p2, 0.0);
        assert!((k[(0, 0)] - 800.0).abs() < 0.5);
    }

    #[test]
    fn inverse_distortion_undoes_forward_model() {
        let grid = CalibrationGrid::new(6, 8, 2.5);
        let truth = PinholeModel::new(
            CameraIntrinsics::new(800.0, 800.0, 320.0, 240.0, 640, 480),
            Distortion::new(-0.08, 0.02, 0.0, 0.0, 0.0),
        );
        let views = synthetic_views(&truth, &grid, &test_poses());
        let calib = calibrate_from_views(&views, (640, 480), &grid, &IntrinsicOptions::default()).unwrap();

        let inv = calib.inverse_distortion;
        for &(x, y) in &[(0.1, 0.05), (-0.3, 0.2), (0.35, -0.25)] {
            let (xd, yd) = calib.distortion.apply(x, y);
            let (xu, yu) = inv.apply(xd, yd);
            assert!((xu - x).abs() < 2e-4 && (yu - y).abs() < 2e-4, "({x},{y}) -> ({xu},{yu})");
        }
    }

    #[test]
    fn too_few_views_is_an_error() {
        let grid = CalibrationGrid::new(6, 8, 2.5);
        let truth = PinholeModel::new(
            CameraIntrinsics::new(800.0, 800.0, 320.0, 240.0, 640, 480),
            Distortion::none(),
        );
        let views = synthetic_views(&truth, &grid, &test_poses()[..1]);
        assert!(matches!(
            calibrate_from_views(&views, (640, 480), &grid, &IntrinsicOptions::default()),
            Err(CalibError::CalibrationError(_))
        ));
    }

    #[test]
    fn grid_validation() {
        assert!(CalibrationGrid::new(2, 8, 2.5).validate().is_err());
        assert!(CalibrationGrid::new(6, 8, 0.0).validate().is_err());
        assert!(CalibrationGrid::new(6, 8, 2.5).validate().is_ok());
        assert_eq!(CalibrationGrid::new(6, 8, 2.5).pattern_size(), (8, 6));
    }

    #[test]
    fn blank_images_are_reported_and_skipped() {
        let grid = CalibrationGrid::new(6, 8, 2.5);
        let images = vec![
            (GrayImage::new(200, 150), "a".to_string()),
            (GrayImage::new(200, 150), "b".to_string()),
        ];
        let reporter = CollectingReporter::new();
        let res = calibrate_intrinsics_from_images(&images, &grid, &IntrinsicOptions::default(), &reporter);
        assert!(res.is_err());
        assert_eq!(reporter.count(Severity::Warning), 2);
        assert_eq!(reporter.last_progress(), Some((2, 2)));
    }
}
