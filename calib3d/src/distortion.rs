//! Point-wise lens distortion correction.

use crate::{CalibError, Result};
use cv_core::{CameraIntrinsics, Distortion};
use nalgebra::Point2;

/// Undistort pixel positions, returning pixels of the ideal pinhole camera
/// with the same intrinsics.
pub fn undistort_points(
    distorted_points: &[Point2<f64>],
    intrinsics: &CameraIntrinsics,
    distortion: &Distortion,
) -> Result<Vec<Point2<f64>>> {
    if !intrinsics.is_finite() {
        return Err(CalibError::InvalidParameters(
            "undistort_points requires finite, non-zero focal lengths".to_string(),
        ));
    }

    Ok(distorted_points
        .iter()
        .map(|p| {
            let n = intrinsics.normalize(p);
            let (xu, yu) = distortion.remove(n.x, n.y);
            intrinsics.denormalize(&Point2::new(xu, yu))
        })
        .collect())
}

/// Normalized ideal coordinates of pixel `p`, through fitted inverse
/// coefficients.
pub(crate) fn normalize_with_inverse(
    p: &Point2<f64>,
    intrinsics: &CameraIntrinsics,
    inverse: &Distortion,
) -> Point2<f64> {
    let n = intrinsics.normalize(p);
    let (xu, yu) = inverse.apply(n.x, n.y);
    Point2::new(xu, yu)
}

/// Same as [`undistort_points`] but closed form, through fitted inverse
/// coefficients.
pub fn undistort_points_with_inverse(
    distorted_points: &[Point2<f64>],
    intrinsics: &CameraIntrinsics,
    inverse: &Distortion,
) -> Vec<Point2<f64>> {
    distorted_points
        .iter()
        .map(|p| intrinsics.denormalize(&normalize_with_inverse(p, intrinsics, inverse)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undistort_inverts_projection() {
        let k = CameraIntrinsics::new(700.0, 690.0, 330.0, 245.0, 640, 480);
        let d = Distortion::new(-0.15, 0.04, 0.0005, -0.001, 0.0);
        let ideal = [Point2::new(100.0, 80.0), Point2::new(600.0, 400.0), Point2::new(330.0, 245.0)];
        let distorted: Vec<Point2<f64>> = ideal
            .iter()
            .map(|p| {
                let n = k.normalize(p);
                let (xd, yd) = d.apply(n.x, n.y);
                k.denormalize(&Point2::new(xd, yd))
            })
            .collect();

        let out = undistort_points(&distorted, &k, &d).unwrap();
        for (a, b) in out.iter().zip(ideal.iter()) {
            assert!((a - b).norm() < 1e-6);
        }
    }

    #[test]
    fn zero_focal_length_is_rejected() {
        let k = CameraIntrinsics::new(0.0, 690.0, 330.0, 245.0, 640, 480);
        assert!(undistort_points(&[], &k, &Distortion::none()).is_err());
    }

    #[test]
    fn fitted_inverse_matches_iterative_undistortion() {
        use crate::calibration::fit_inverse_distortion;
        use crate::pattern::create_calibration_object;
        use cv_core::{CameraExtrinsics, PinholeModel};
        use cv_optimize::LMConfig;
        use nalgebra::{Rotation3, Vector3};

        let k = CameraIntrinsics::new(600.0, 600.0, 320.0, 240.0, 640, 480);
        let d = Distortion::new(-0.12, 0.02, 0.0, 0.0, 0.0);
        let pose = CameraExtrinsics::new(
            Rotation3::from_euler_angles(0.1, -0.05, 0.0).into_inner(),
            Vector3::new(-8.0, -6.0, 120.0),
        );
        let inverse = fit_inverse_distortion(
            &PinholeModel::new(k, d),
            &create_calibration_object(6, 8, 2.5),
            &[pose],
            LMConfig::default().with_max_iters(200).with_tolerance(1e-14),
        )
        .unwrap();

        let pixels: Vec<Point2<f64>> = (0..5)
            .flat_map(|j| (0..6).map(move |i| Point2::new(30.0 + 115.0 * i as f64, 25.0 + 105.0 * j as f64)))
            .collect();
        let closed = undistort_points_with_inverse(&pixels, &k, &inverse);
        let iterative = undistort_points(&pixels, &k, &d).unwrap();
        for ((a, b), p) in closed.iter().zip(&iterative).zip(&pixels) {
            assert!((a - b).norm() < 0.5, "{p}: {a} vs {b}");
        }
        // no correction at the principal point
        let centre = undistort_points_with_inverse(&[Point2::new(320.0, 240.0)], &k, &inverse);
        assert!((centre[0] - Point2::new(320.0, 240.0)).norm() < 1e-9);
    }
}
