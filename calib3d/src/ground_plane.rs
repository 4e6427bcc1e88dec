//! Mapping between a camera image and its top-down ground-plane image.
//!
//! Plane pixels are world centimetres scaled by `px_per_cm`, with `u`
//! following the board's column axis (world Y) and `v` its row axis (world X).
//! An offset shifts the plane so the unwarped camera view starts at (0, 0).

use cv_core::{CameraExtrinsics, CameraIntrinsics, Distortion};
use cv_imgproc::{remap, BorderMode, FloatImage, Interpolation};
use image::GrayImage;
use nalgebra::{Matrix3, Point2, Point3, Vector2, Vector3};
use rayon::prelude::*;

use crate::calibration::IntrinsicCalibration;
use crate::distortion::normalize_with_inverse;
use crate::extrinsic::ExtrinsicCalibration;
use crate::pnp::solve_planar_pose;
use crate::{CalibError, Result};

/// Upper bound on either side of a ground-plane image.
pub const MAX_WARP_DIMENSION: u32 = 4096;

/// Pose of a floor board seen by a calibrated camera.
pub fn compute_extrinsic_parameters(
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    intrinsics: &CameraIntrinsics,
    distortion: &Distortion,
) -> Result<(Matrix3<f64>, Vector3<f64>)> {
    let pose = solve_planar_pose(object_points, image_points, intrinsics, distortion)?;
    Ok((pose.rotation, pose.translation))
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroundPlaneMapping {
    intrinsics: CameraIntrinsics,
    distortion: Distortion,
    inverse_distortion: Distortion,
    /// `[r1 r2 t]`, plane (X, Y, 1) to camera rays.
    plane_to_camera: Matrix3<f64>,
    camera_to_plane: Matrix3<f64>,
    px_per_cm: f64,
    offset: Vector2<f64>,
}

impl GroundPlaneMapping {
    pub fn new(
        intrinsics: CameraIntrinsics,
        extrinsics: &CameraExtrinsics,
        distortion: Distortion,
        inverse_distortion: Distortion,
        px_per_cm: f64,
    ) -> Result<Self> {
        if !px_per_cm.is_finite() || px_per_cm <= 0.0 {
            return Err(CalibError::InvalidParameters(format!(
                "ground plane scale must be positive, got {px_per_cm}"
            )));
        }
        if !intrinsics.is_finite() || !extrinsics.is_finite() {
            return Err(CalibError::InvalidParameters(
                "ground plane mapping needs finite camera parameters".to_string(),
            ));
        }
        let r = &extrinsics.rotation;
        let plane_to_camera = Matrix3::from_columns(&[
            r.column(0).into_owned(),
            r.column(1).into_owned(),
            extrinsics.translation,
        ]);
        let camera_to_plane = plane_to_camera.try_inverse().ok_or_else(|| {
            CalibError::NumericFailure("camera centre lies on the ground plane".to_string())
        })?;

        Ok(Self {
            intrinsics,
            distortion,
            inverse_distortion,
            plane_to_camera,
            camera_to_plane,
            px_per_cm,
            offset: Vector2::zeros(),
        })
    }

    pub fn from_calibrations(
        intrinsic: &IntrinsicCalibration,
        extrinsic: &ExtrinsicCalibration,
    ) -> Result<Self> {
        Self::new(
            intrinsic.intrinsics(),
            &extrinsic.extrinsics(),
            intrinsic.distortion,
            intrinsic.inverse_distortion,
            extrinsic.px_per_cm(),
        )
    }

    pub fn with_offset(mut self, offset: Vector2<f64>) -> Self {
        self.offset = offset;
        self
    }

    pub fn offset(&self) -> Vector2<f64> {
        self.offset
    }

    pub fn px_per_cm(&self) -> f64 {
        self.px_per_cm
    }

    /// Ground-plane pixel seen at camera pixel `p`, or `None` if the viewing
    /// ray does not hit the floor in front of the camera.
    pub fn image_to_plane(&self, p: &Point2<f64>) -> Option<Point2<f64>> {
        let n = normalize_with_inverse(p, &self.intrinsics, &self.inverse_distortion);
        let ray = self.camera_to_plane * Vector3::new(n.x, n.y, 1.0);
        if ray.z <= 1e-12 {
            return None;
        }
        let (wx, wy) = (ray.x / ray.z, ray.y / ray.z);
        let q = Point2::new(
            wy * self.px_per_cm - self.offset.x,
            wx * self.px_per_cm - self.offset.y,
        );
        (q.x.is_finite() && q.y.is_finite()).then_some(q)
    }

    /// Camera pixel showing ground-plane pixel `q`, or `None` when that
    /// floor point is behind the camera.
    pub fn plane_to_image(&self, q: &Point2<f64>) -> Option<Point2<f64>> {
        let wy = (q.x + self.offset.x) / self.px_per_cm;
        let wx = (q.y + self.offset.y) / self.px_per_cm;
        let cam = self.plane_to_camera * Vector3::new(wx, wy, 1.0);
        if cam.z <= 1e-12 {
            return None;
        }
        let (xd, yd) = self.distortion.apply(cam.x / cam.z, cam.y / cam.z);
        let p = self.intrinsics.denormalize(&Point2::new(xd, yd));
        (p.x.is_finite() && p.y.is_finite()).then_some(p)
    }
}

/// Per-pixel source coordinates of a ground-plane image. Entries are NaN
/// where the plane pixel is not seen by the camera.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundPlaneWarp {
    pub map_x: Vec<f32>,
    pub map_y: Vec<f32>,
    pub width: u32,
    pub height: u32,
    /// Plane pixel of the warp's (0, 0), before offsetting.
    pub offset: Vector2<f64>,
}

impl GroundPlaneWarp {
    pub fn source_at(&self, x: u32, y: u32) -> Option<(f32, f32)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y * self.width + x) as usize;
        let (sx, sy) = (self.map_x[i], self.map_y[i]);
        (sx.is_finite() && sy.is_finite()).then_some((sx, sy))
    }
}

/// Build the remap tables that unwarp a `image_size` camera image onto the
/// ground plane, cropped to the projection of the image border.
pub fn compute_ground_plane_warp(
    mapping: &GroundPlaneMapping,
    image_size: (u32, u32),
) -> Result<GroundPlaneWarp> {
    let (w, h) = image_size;
    if w < 2 || h < 2 {
        return Err(CalibError::InvalidInput(format!(
            "cannot warp a {w}x{h} image"
        )));
    }
    let base = mapping.clone().with_offset(Vector2::zeros());

    let (wf, hf) = ((w - 1) as f64, (h - 1) as f64);
    let border = (0..w)
        .flat_map(|x| [Point2::new(x as f64, 0.0), Point2::new(x as f64, hf)])
        .chain((1..h - 1).flat_map(|y| [Point2::new(0.0, y as f64), Point2::new(wf, y as f64)]));

    let mut min = Vector2::repeat(f64::INFINITY);
    let mut max = Vector2::repeat(f64::NEG_INFINITY);
    for p in border {
        let q = base.image_to_plane(&p).ok_or_else(|| {
            CalibError::NumericFailure(format!(
                "image border pixel ({}, {}) does not see the ground plane",
                p.x, p.y
            ))
        })?;
        min = min.inf(&q.coords);
        max = max.sup(&q.coords);
    }

    let offset = Vector2::new(min.x.floor(), min.y.floor());
    let full_w = (max.x - offset.x).ceil() + 1.0;
    let full_h = (max.y - offset.y).ceil() + 1.0;
    let limit = MAX_WARP_DIMENSION as f64;
    if full_w > limit || full_h > limit {
        tracing::warn!(full_w, full_h, limit, "ground plane image cropped");
    }
    let width = full_w.min(limit) as u32;
    let height = full_h.min(limit) as u32;

    let shifted = base.with_offset(offset);
    let n = (width * height) as usize;
    let mut map_x = vec![f32::NAN; n];
    let mut map_y = vec![f32::NAN; n];
    let (max_x, max_y) = (w as f64 - 0.5, h as f64 - 0.5);

    map_x
        .par_chunks_mut(width as usize)
        .zip(map_y.par_chunks_mut(width as usize))
        .enumerate()
        .for_each(|(v, (row_x, row_y))| {
            for u in 0..width as usize {
                let Some(p) = shifted.plane_to_image(&Point2::new(u as f64, v as f64)) else {
                    continue;
                };
                if p.x >= -0.5 && p.y >= -0.5 && p.x <= max_x && p.y <= max_y {
                    row_x[u] = p.x as f32;
                    row_y[u] = p.y as f32;
                }
            }
        });

    tracing::debug!(width, height, offset_x = offset.x, offset_y = offset.y, "ground plane warp computed");
    Ok(GroundPlaneWarp {
        map_x,
        map_y,
        width,
        height,
        offset,
    })
}

/// Resample a camera image onto the ground plane; unseen pixels are 0.
pub fn unwarp_ground_plane(image: &GrayImage, warp: &GroundPlaneWarp) -> Result<GrayImage> {
    Ok(remap(
        image,
        &warp.map_x,
        &warp.map_y,
        warp.width,
        warp.height,
        Interpolation::Linear,
        BorderMode::Constant(0),
    )?)
}

/// Frobenius norm of the warp Jacobian at every plane pixel, i.e. how many
/// source pixels one plane pixel spans. NaN where the map is undefined.
pub fn warp_gradient_magnitude(warp: &GroundPlaneWarp) -> FloatImage {
    let (w, h) = (warp.width as usize, warp.height as usize);
    let mut out = FloatImage::new(warp.width, warp.height);
    if w == 0 || h == 0 {
        return out;
    }
    let at = |map: &[f32], x: usize, y: usize| map[y * w + x];
    // central difference, one-sided at the border
    let diff = |map: &[f32], x: usize, y: usize, along_x: bool| -> f32 {
        let (pos, len) = if along_x { (x, w) } else { (y, h) };
        if len < 2 {
            return f32::NAN;
        }
        let (lo, hi) = (pos.saturating_sub(1), (pos + 1).min(len - 1));
        let (a, b) = if along_x {
            (at(map, lo, y), at(map, hi, y))
        } else {
            (at(map, x, lo), at(map, x, hi))
        };
        (b - a) / (hi - lo) as f32
    };

    out.data.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        for (x, o) in row.iter_mut().enumerate() {
            let j = [
                diff(&warp.map_x, x, y, true),
                diff(&warp.map_x, x, y, false),
                diff(&warp.map_y, x, y, true),
                diff(&warp.map_y, x, y, false),
            ];
            // NaN neighbours propagate
            *o = j.iter().map(|v| v * v).sum::<f32>().sqrt();
        }
    });
    out
}
