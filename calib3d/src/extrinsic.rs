//! Extrinsic calibration of a mounted camera against a chessboard lying on
//! the floor.
//!
//! The board defines the ground plane: its row axis is world X, its column
//! axis world Y and the floor is `Z = 0`.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use cv_core::{CameraExtrinsics, Error, Reporter, Severity};
use cv_imgproc::flip_vertical;
use image::GrayImage;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::calibration::{detect_calibration_corners, CalibrationGrid, IntrinsicCalibration, IntrinsicOptions};
use crate::pnp::solve_planar_pose;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtrinsicCalibration {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    /// Distance between the first two detected corners.
    pub grid_square_size_px: f64,
    pub square_size_cm: f64,
    pub successful: bool,
    pub calibrated_at: DateTime<Utc>,
}

impl ExtrinsicCalibration {
    pub fn extrinsics(&self) -> CameraExtrinsics {
        CameraExtrinsics::new(self.rotation, self.translation)
    }

    /// Scale of the ground-plane image.
    pub fn px_per_cm(&self) -> f64 {
        self.grid_square_size_px / self.square_size_cm
    }

    pub fn is_finite(&self) -> bool {
        self.extrinsics().is_finite() && self.px_per_cm().is_finite() && self.px_per_cm() > 0.0
    }
}

/// Room layout bookkeeping: which camera sits at which position, and the
/// calibrations obtained for each.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CameraRegistry {
    positions: BTreeMap<String, String>,
    intrinsics: BTreeMap<String, IntrinsicCalibration>,
    extrinsics: BTreeMap<String, ExtrinsicCalibration>,
}

impl CameraRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign_camera(&mut self, position_id: impl Into<String>, camera_id: impl Into<String>) {
        self.positions.insert(position_id.into(), camera_id.into());
    }

    pub fn set_intrinsics(&mut self, camera_id: impl Into<String>, calib: IntrinsicCalibration) {
        self.intrinsics.insert(camera_id.into(), calib);
    }

    pub fn set_extrinsics(&mut self, position_id: impl Into<String>, calib: ExtrinsicCalibration) {
        self.extrinsics.insert(position_id.into(), calib);
    }

    pub fn camera_for(&self, position_id: &str) -> Option<&str> {
        self.positions.get(position_id).map(String::as_str)
    }

    pub fn position_ids(&self) -> impl Iterator<Item = &str> {
        self.positions.keys().map(String::as_str)
    }

    pub fn extrinsics(&self, position_id: &str) -> Option<&ExtrinsicCalibration> {
        self.extrinsics.get(position_id)
    }

    /// Resolves position -> camera -> intrinsic calibration. Anything missing,
    /// unsuccessful or non-finite along the way is reported as not calibrated.
    pub fn intrinsics_for_position(&self, position_id: &str) -> Result<&IntrinsicCalibration> {
        let camera_id = self.camera_for(position_id).ok_or_else(|| {
            Error::MissingEntry(format!("no camera assigned to position '{position_id}'"))
        })?;
        self.intrinsics
            .get(camera_id)
            .filter(|c| c.successful && c.is_finite())
            .ok_or_else(|| Error::not_calibrated(camera_id))
    }
}

/// Calibrate one camera pose from a single image of the floor board.
/// Only the detection fields of `options` are used.
pub fn calibrate_extrinsics(
    image: &GrayImage,
    grid: &CalibrationGrid,
    intrinsics: &IntrinsicCalibration,
    options: &IntrinsicOptions,
) -> Result<ExtrinsicCalibration> {
    grid.validate()?;
    if !intrinsics.successful || !intrinsics.is_finite() {
        return Err(Error::NotCalibrated(
            "camera is not correctly calibrated".to_string(),
        ));
    }

    let flipped;
    let image = if options.flip_vertical {
        flipped = flip_vertical(image);
        &flipped
    } else {
        image
    };
    let corners = detect_calibration_corners(image, grid, options)?;
    let grid_square_size_px = (corners[1] - corners[0]).norm();

    let pose = solve_planar_pose(
        &grid.object_points(),
        &corners,
        &intrinsics.intrinsics(),
        &intrinsics.distortion,
    )?;

    let calib = ExtrinsicCalibration {
        rotation: pose.rotation,
        translation: pose.translation,
        grid_square_size_px,
        square_size_cm: grid.square_size_cm,
        successful: true,
        calibrated_at: Utc::now(),
    };
    if !calib.is_finite() {
        return Err(Error::NumericFailure(
            "extrinsic calibration produced non-finite parameters".to_string(),
        ));
    }
    tracing::info!(
        square_px = grid_square_size_px,
        tz = calib.translation.z,
        "extrinsic calibration done"
    );
    Ok(calib)
}

pub fn calibrate_extrinsics_from_file(
    path: impl AsRef<Path>,
    grid: &CalibrationGrid,
    intrinsics: &IntrinsicCalibration,
    options: &IntrinsicOptions,
) -> Result<ExtrinsicCalibration> {
    let path = path.as_ref();
    let image = image::open(path)
        .map_err(|e| Error::ImageUnreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
        .to_luma8();
    calibrate_extrinsics(&image, grid, intrinsics, options)
}

/// Calibrate the camera at `position_id` and store the result in the
/// registry. Failures are also sent to `reporter`.
pub fn calibrate_position(
    registry: &mut CameraRegistry,
    position_id: &str,
    image: &GrayImage,
    grid: &CalibrationGrid,
    options: &IntrinsicOptions,
    reporter: &dyn Reporter,
) -> Result<ExtrinsicCalibration> {
    let result = registry
        .intrinsics_for_position(position_id)
        .and_then(|intr| calibrate_extrinsics(image, grid, intr, options));

    match result {
        Ok(calib) => {
            registry.set_extrinsics(position_id, calib.clone());
            reporter.report(
                Severity::Info,
                "Extrinsic calibration",
                &format!("Position '{position_id}' calibrated"),
                &format!("{:.3} px/cm", calib.px_per_cm()),
            );
            Ok(calib)
        }
        Err(e) => {
            tracing::warn!(position = position_id, error = %e, "extrinsic calibration failed");
            reporter.report(
                Severity::Error,
                "Extrinsic calibration",
                &e.to_string(),
                position_id,
            );
            Err(e)
        }
    }
}
