//! Compositing of ground-plane images into a shared canvas.

use cv_imgproc::{get_translation_matrix, transform_point, warp_perspective_ex, BorderMode, Interpolation};
use image::GrayImage;
use nalgebra::{Matrix3, Point2, Vector2};
use serde::{Deserialize, Serialize};

use crate::{CalibError, Result};

/// Axis-aligned box in the common frame. Starts empty and grows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Point2<f32>,
    pub max: Point2<f32>,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::empty()
    }
}

impl BoundingBox {
    pub fn empty() -> Self {
        Self {
            min: Point2::new(f32::INFINITY, f32::INFINITY),
            max: Point2::new(f32::NEG_INFINITY, f32::NEG_INFINITY),
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.min.x <= self.max.x && self.min.y <= self.max.y)
    }

    pub fn include(&mut self, p: &Point2<f32>) {
        self.min = Point2::new(self.min.x.min(p.x), self.min.y.min(p.y));
        self.max = Point2::new(self.max.x.max(p.x), self.max.y.max(p.y));
    }

    /// Integer top-left corner of the canvas covering this box.
    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.min.x.floor() as f64, self.min.y.floor() as f64)
    }

    /// Canvas size covering this box from [`Self::position`].
    pub fn dimension(&self) -> (u32, u32) {
        if self.is_empty() {
            return (0, 0);
        }
        let w = (self.max.x - self.min.x.floor()).ceil().max(0.0);
        let h = (self.max.y - self.min.y.floor()).ceil().max(0.0);
        (w as u32, h as u32)
    }
}

/// Grow `running` by the corners of a `size` image mapped through `transform`.
pub fn composite_image_bounding_box(
    transform: &Matrix3<f64>,
    size: (u32, u32),
    running: &BoundingBox,
) -> Result<BoundingBox> {
    let m: Matrix3<f32> = transform.cast();
    let (w, h) = (size.0 as f32, size.1 as f32);
    let mut bbox = *running;
    for c in [
        Point2::new(0.0, 0.0),
        Point2::new(w, 0.0),
        Point2::new(w, h),
        Point2::new(0.0, h),
    ] {
        let p = transform_point(&m, &c);
        if !p.x.is_finite() || !p.y.is_finite() {
            return Err(CalibError::NumericFailure(
                "image corner maps to infinity".to_string(),
            ));
        }
        bbox.include(&p);
    }
    Ok(bbox)
}

/// Warp `src` into a `dst_size` canvas. `transform` maps src-frame points to
/// the common frame; pixel (0, 0) of `src` sits at `src_origin` in its own
/// frame and pixel (0, 0) of the canvas at `dst_origin` in the common one.
pub fn align_ground_plane(
    transform: &Matrix3<f64>,
    src: &GrayImage,
    dst_size: (u32, u32),
    src_origin: Vector2<f64>,
    dst_origin: Vector2<f64>,
) -> Result<GrayImage> {
    let inv = transform.try_inverse().ok_or_else(|| {
        CalibError::NumericFailure("alignment transform is singular".to_string())
    })?;
    let dst_to_src = get_translation_matrix(-src_origin.x, -src_origin.y)
        * inv
        * get_translation_matrix(dst_origin.x, dst_origin.y);
    Ok(warp_perspective_ex(
        src,
        &dst_to_src,
        dst_size.0,
        dst_size.1,
        Interpolation::Linear,
        BorderMode::Constant(0),
    ))
}

/// `a` over `b` wherever `a` is non-zero.
pub fn create_composite_image(a: &GrayImage, b: &GrayImage) -> Result<GrayImage> {
    if a.dimensions() != b.dimensions() {
        return Err(CalibError::DimensionMismatch(format!(
            "cannot composite {:?} over {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }
    let mut out = b.clone();
    for (o, &pa) in out.as_mut().iter_mut().zip(a.as_raw()) {
        if pa != 0 {
            *o = pa;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn bounding_box_grows_with_each_image() {
        let bbox = composite_image_bounding_box(&Matrix3::identity(), (100, 50), &BoundingBox::empty()).unwrap();
        assert_eq!(bbox.position(), Vector2::new(0.0, 0.0));
        assert_eq!(bbox.dimension(), (100, 50));

        let shifted = get_translation_matrix(-20.0, 30.0);
        let bbox = composite_image_bounding_box(&shifted, (100, 50), &bbox).unwrap();
        assert_eq!(bbox.position(), Vector2::new(-20.0, 0.0));
        assert_eq!(bbox.dimension(), (120, 80));
    }

    #[test]
    fn empty_box_has_no_size() {
        assert!(BoundingBox::empty().is_empty());
        assert_eq!(BoundingBox::default().dimension(), (0, 0));
    }

    #[test]
    fn align_places_image_at_offset() {
        let mut src = GrayImage::new(10, 10);
        src.put_pixel(3, 4, Luma([200]));
        // src frame shifted by (5, 2) into the common frame, canvas starts at (-1, -1)
        let t = get_translation_matrix(5.0, 2.0);
        let out = align_ground_plane(&t, &src, (20, 20), Vector2::zeros(), Vector2::new(-1.0, -1.0)).unwrap();
        assert_eq!(out.get_pixel(3 + 5 + 1, 4 + 2 + 1)[0], 200);
        assert_eq!(out.get_pixel(3, 4)[0], 0);
    }

    #[test]
    fn src_origin_shifts_sampling() {
        let mut src = GrayImage::new(10, 10);
        src.put_pixel(3, 4, Luma([90]));
        let out = align_ground_plane(&Matrix3::identity(), &src, (20, 20), Vector2::new(2.0, 1.0), Vector2::zeros()).unwrap();
        assert_eq!(out.get_pixel(5, 5)[0], 90);
    }

    #[test]
    fn composite_paints_non_zero_pixels() {
        let a = GrayImage::from_raw(3, 1, vec![0, 7, 0]).unwrap();
        let b = GrayImage::from_raw(3, 1, vec![1, 2, 3]).unwrap();
        let out = create_composite_image(&a, &b).unwrap();
        assert_eq!(out.as_raw(), &vec![1, 7, 3]);
        assert!(create_composite_image(&a, &GrayImage::new(2, 1)).is_err());
    }
}
