/// Pose of a planar target from its image.
///
/// The board is assumed to lie on `Z = 0` of its own frame; the initial pose
/// comes from the plane-to-image homography of the undistorted corners and is
/// polished with Levenberg-Marquardt on the distorted reprojection error.
use crate::distortion::undistort_points;
use crate::homography::{find_homography, pose_from_homography};
use crate::{CalibError, Result};
use cv_core::{CameraExtrinsics, CameraIntrinsics, Distortion, PinholeModel};
use cv_optimize::{LMConfig, LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DVector, Point2, Point3, Vector3};

pub fn solve_planar_pose(
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    intrinsics: &CameraIntrinsics,
    distortion: &Distortion,
) -> Result<CameraExtrinsics> {
    if object_points.len() != image_points.len() || object_points.len() < 4 {
        return Err(CalibError::CalibrationError(
            "solve_planar_pose needs >=4 paired points".to_string(),
        ));
    }
    if object_points.iter().any(|p| p.z.abs() > 1e-9) {
        return Err(CalibError::InvalidInput(
            "solve_planar_pose expects object points on Z = 0".to_string(),
        ));
    }

    let undistorted = undistort_points(image_points, intrinsics, distortion)?;
    let plane: Vec<Point2<f64>> = object_points.iter().map(|p| Point2::new(p.x, p.y)).collect();
    let h = find_homography(&plane, &undistorted)?;
    let initial = pose_from_homography(&intrinsics.inverse_matrix(), &h)?;

    solve_pnp_refine(
        &initial,
        object_points,
        image_points,
        intrinsics,
        distortion,
        LMConfig::default(),
    )
}

pub fn solve_pnp_refine(
    initial: &CameraExtrinsics,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    intrinsics: &CameraIntrinsics,
    distortion: &Distortion,
    config: LMConfig,
) -> Result<CameraExtrinsics> {
    if object_points.len() != image_points.len() || object_points.len() < 3 {
        return Err(CalibError::CalibrationError(
            "solve_pnp_refine needs >=3 paired points".to_string(),
        ));
    }

    let problem = PoseProblem {
        model: PinholeModel::new(*intrinsics, *distortion),
        object_points,
        image_points,
    };
    let (params, _) = LevenbergMarquardt::new(config).minimize(&problem, extrinsics_to_params(initial))?;
    let pose = params_to_extrinsics(&params);
    if !pose.is_finite() {
        return Err(CalibError::NumericFailure(
            "pose refinement diverged".to_string(),
        ));
    }
    Ok(pose)
}

struct PoseProblem<'a> {
    model: PinholeModel,
    object_points: &'a [Point3<f64>],
    image_points: &'a [Point2<f64>],
}

impl LeastSquaresProblem for PoseProblem<'_> {
    fn num_params(&self) -> usize {
        6
    }

    fn num_residuals(&self) -> usize {
        2 * self.object_points.len()
    }

    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        let pose = params_to_extrinsics(params);
        let mut r = DVector::zeros(self.num_residuals());
        for (i, (p3, p2)) in self.object_points.iter().zip(self.image_points).enumerate() {
            let pred = self.model.project_world(&pose, p3);
            r[2 * i] = pred.x - p2.x;
            r[2 * i + 1] = pred.y - p2.y;
        }
        r
    }
}

fn extrinsics_to_params(ext: &CameraExtrinsics) -> DVector<f64> {
    let omega = ext.rodrigues();
    DVector::from_vec(vec![
        omega[0],
        omega[1],
        omega[2],
        ext.translation[0],
        ext.translation[1],
        ext.translation[2],
    ])
}

fn params_to_extrinsics(params: &DVector<f64>) -> CameraExtrinsics {
    CameraExtrinsics::from_rodrigues(
        &Vector3::new(params[0], params[1], params[2]),
        Vector3::new(params[3], params[4], params[5]),
    )
}
