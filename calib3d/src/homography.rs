//! Planar homography estimation and decomposition.

use crate::{CalibError, Result};
use cv_core::CameraExtrinsics;
use nalgebra::{DMatrix, Matrix3, Point2, Vector3};

/// Homography `H` with `dst ~ H * src` from at least four correspondences,
/// estimated by DLT on Hartley-normalized points. Scaled so `H[(2, 2)] = 1`
/// when that entry is not vanishing.
pub fn find_homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Result<Matrix3<f64>> {
    if src.len() != dst.len() || src.len() < 4 {
        return Err(CalibError::CalibrationError(
            "find_homography needs >=4 paired points".to_string(),
        ));
    }

    let (src_n, ts) = normalize_points_hartley(src)?;
    let (dst_n, td) = normalize_points_hartley(dst)?;
    let n = src.len();
    let mut a = DMatrix::<f64>::zeros(2 * n.max(5), 9);
    for i in 0..n {
        let (x, y) = (src_n[i].x, src_n[i].y);
        let (u, v) = (dst_n[i].x, dst_n[i].y);
        let r0 = 2 * i;
        let r1 = r0 + 1;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    // Zero rows pad the four-point case so the SVD yields a full V^T.
    let svd = a.svd(false, true);
    let vt = svd
        .v_t
        .ok_or_else(|| CalibError::NumericFailure("SVD failed in find_homography".to_string()))?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .ok_or_else(|| CalibError::NumericFailure("empty SVD in find_homography".to_string()))?;
    let h = vt.row(min_idx);
    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let td_inv = td
        .try_inverse()
        .ok_or_else(|| CalibError::NumericFailure("singular normalization".to_string()))?;
    let mut out = td_inv * hn * ts;
    if out[(2, 2)].abs() > 1e-12 {
        out /= out[(2, 2)];
    }
    if !out.iter().all(|v| v.is_finite()) {
        return Err(CalibError::NumericFailure(
            "non-finite homography".to_string(),
        ));
    }
    Ok(out)
}

/// Recover `[R | t]` of a plane at `Z = 0` from `H ~ K [r1 r2 t]`, given
/// `K^-1`. The sign is chosen so the plane lies in front of the camera.
pub fn pose_from_homography(k_inv: &Matrix3<f64>, h: &Matrix3<f64>) -> Result<CameraExtrinsics> {
    let r1_raw = k_inv * h.column(0);
    let r2_raw = k_inv * h.column(1);
    let t_raw = k_inv * h.column(2);

    let norm = (r1_raw.norm() * r2_raw.norm()).sqrt();
    if norm < 1e-18 {
        return Err(CalibError::NumericFailure(
            "degenerate homography".to_string(),
        ));
    }
    let mut scale = 1.0 / norm;
    if t_raw.z * scale < 0.0 {
        scale = -scale;
    }

    let r1 = r1_raw * scale;
    let r2 = r2_raw * scale;
    let r3 = r1.cross(&r2);
    let r = Matrix3::from_columns(&[r1, r2, r3]);

    let svd = r.svd(true, true);
    let (u, vt) = match (svd.u, svd.v_t) {
        (Some(u), Some(vt)) => (u, vt),
        _ => {
            return Err(CalibError::NumericFailure(
                "SVD failed in pose_from_homography".to_string(),
            ))
        }
    };
    let mut rot = u * vt;
    if rot.determinant() < 0.0 {
        rot = -rot;
    }

    let t: Vector3<f64> = t_raw * scale;
    Ok(CameraExtrinsics::new(rot, t))
}

/// Apply a homography to a point; NaN when the point maps to infinity.
pub fn apply_homography(h: &Matrix3<f64>, p: &Point2<f64>) -> Point2<f64> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    if v.z.abs() < 1e-12 {
        return Point2::new(f64::NAN, f64::NAN);
    }
    Point2::new(v.x / v.z, v.y / v.z)
}

fn normalize_points_hartley(points: &[Point2<f64>]) -> Result<(Vec<Point2<f64>>, Matrix3<f64>)> {
    if points.is_empty() {
        return Err(CalibError::CalibrationError(
            "normalize_points_hartley: empty points array".to_string(),
        ));
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.x).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - mean_x).powi(2) + (p.y - mean_y).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let scale = if mean_dist > 1e-18 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let normalized = points
        .iter()
        .map(|p| Point2::new((p.x - mean_x) * scale, (p.y - mean_y) * scale))
        .collect();
    let t = Matrix3::new(
        scale,
        0.0,
        -mean_x * scale,
        0.0,
        scale,
        -mean_y * scale,
        0.0,
        0.0,
        1.0,
    );
    Ok((normalized, t))
}
