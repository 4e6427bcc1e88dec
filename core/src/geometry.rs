use nalgebra::{Matrix3, Point2, Point3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
        }
    }

    /// Build from a 3x3 camera matrix (skew is ignored).
    pub fn from_matrix(k: &Matrix3<f64>, width: u32, height: u32) -> Self {
        Self::new(k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)], width, height)
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    pub fn inverse_matrix(&self) -> Matrix3<f64> {
        self.matrix().try_inverse().unwrap_or(Matrix3::identity())
    }

    pub fn is_finite(&self) -> bool {
        self.fx.is_finite()
            && self.fy.is_finite()
            && self.cx.is_finite()
            && self.cy.is_finite()
            && self.fx.abs() > 1e-12
            && self.fy.abs() > 1e-12
    }

    /// Pixel to normalized image coordinates.
    pub fn normalize(&self, pixel: &Point2<f64>) -> Point2<f64> {
        Point2::new((pixel.x - self.cx) / self.fx, (pixel.y - self.cy) / self.fy)
    }

    /// Normalized image coordinates to pixel.
    pub fn denormalize(&self, p: &Point2<f64>) -> Point2<f64> {
        Point2::new(p.x * self.fx + self.cx, p.y * self.fy + self.cy)
    }
}

/// Brown-Conrady lens model with coefficients stored in OpenCV order
/// `[k1, k2, p1, p2, k3]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    pub fn new(k1: f64, k2: f64, p1: f64, p2: f64, k3: f64) -> Self {
        Self { k1, k2, p1, p2, k3 }
    }

    pub fn none() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0, 0.0)
    }

    pub fn from_array(c: [f64; 5]) -> Self {
        Self::new(c[0], c[1], c[2], c[3], c[4])
    }

    pub fn to_array(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (x * radial + dx, y * radial + dy)
    }

    /// Iterative inversion of [`Distortion::apply`].
    pub fn remove(&self, x: f64, y: f64) -> (f64, f64) {
        let mut xu = x;
        let mut yu = y;
        for _ in 0..20 {
            let (xd, yd) = self.apply(xu, yu);
            xu += x - xd;
            yu += y - yd;
        }
        (xu, yu)
    }
}

impl Default for Distortion {
    fn default() -> Self {
        Self::none()
    }
}

/// World-to-camera rigid transform: `p_cam = rotation * p_world + translation`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraExtrinsics {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl CameraExtrinsics {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from a Rodrigues rotation vector and a translation.
    pub fn from_rodrigues(rvec: &Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: Rotation3::from_scaled_axis(*rvec).into_inner(),
            translation,
        }
    }

    pub fn rodrigues(&self) -> Vector3<f64> {
        Rotation3::from_matrix_unchecked(self.rotation).scaled_axis()
    }

    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation * point.coords + self.translation)
    }

    pub fn inverse(&self) -> Self {
        let r_inv = self.rotation.transpose();
        let t_inv = -r_inv * self.translation;
        Self {
            rotation: r_inv,
            translation: t_inv,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.rotation.iter().all(|v| v.is_finite()) && self.translation.iter().all(|v| v.is_finite())
    }
}

impl Default for CameraExtrinsics {
    fn default() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }
}

/// Pinhole camera with radial/tangential lens distortion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PinholeModel {
    pub intrinsics: CameraIntrinsics,
    pub distortion: Distortion,
}

impl PinholeModel {
    pub fn new(intrinsics: CameraIntrinsics, distortion: Distortion) -> Self {
        Self {
            intrinsics,
            distortion,
        }
    }

    /// Project a point given in camera coordinates. Returns NaN for points on
    /// the camera plane.
    pub fn project(&self, p: &Point3<f64>) -> Point2<f64> {
        if p.z.abs() < 1e-12 {
            return Point2::new(f64::NAN, f64::NAN);
        }
        let (xd, yd) = self.distortion.apply(p.x / p.z, p.y / p.z);
        self.intrinsics.denormalize(&Point2::new(xd, yd))
    }

    pub fn project_world(&self, extrinsics: &CameraExtrinsics, p: &Point3<f64>) -> Point2<f64> {
        self.project(&extrinsics.transform_point(p))
    }

    pub fn unproject(&self, pixel: &Point2<f64>, depth: f64) -> Point3<f64> {
        let n = self.intrinsics.normalize(pixel);
        let (xu, yu) = self.distortion.remove(n.x, n.y);
        Point3::new(xu * depth, yu * depth, depth)
    }
}
