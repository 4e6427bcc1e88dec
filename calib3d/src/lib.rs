pub type CalibError = cv_core::Error;
pub type Result<T> = cv_core::Result<T>;

pub mod pattern;
pub use pattern::{
    corner_subpix, create_calibration_object, find_chessboard_corners,
    find_chessboard_corners_with_options, ChessboardOptions,
};

pub mod homography;
pub use homography::{apply_homography, find_homography, pose_from_homography};

pub mod distortion;
pub use distortion::{undistort_points, undistort_points_with_inverse};

pub mod pnp;
pub use pnp::{solve_planar_pose, solve_pnp_refine};

pub mod calibration;
pub use calibration::{
    calibrate_from_views, calibrate_intrinsics_from_files, calibrate_intrinsics_from_images,
    detect_calibration_corners, fit_inverse_distortion, CalibrationGrid, CalibrationView,
    ImageReprojection, IntrinsicCalibration, IntrinsicOptions,
};

pub mod extrinsic;
pub use extrinsic::{
    calibrate_extrinsics, calibrate_extrinsics_from_file, calibrate_position, CameraRegistry,
    ExtrinsicCalibration,
};

pub mod ground_plane;
pub use ground_plane::{
    compute_extrinsic_parameters, compute_ground_plane_warp, unwarp_ground_plane,
    warp_gradient_magnitude, GroundPlaneMapping, GroundPlaneWarp, MAX_WARP_DIMENSION,
};

pub mod composite;
pub use composite::{
    align_ground_plane, composite_image_bounding_box, create_composite_image, BoundingBox,
};
