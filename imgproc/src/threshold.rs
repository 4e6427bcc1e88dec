use crate::{ImgprocError, Result};
use image::GrayImage;
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdType {
    Binary,
    BinaryInv,
}

pub fn threshold(src: &GrayImage, thresh: u8, max_value: u8, typ: ThresholdType) -> GrayImage {
    let mut dst = GrayImage::new(src.width(), src.height());
    for (out_px, &value) in dst.as_mut().iter_mut().zip(src.as_raw().iter()) {
        *out_px = apply_threshold(value as f32, thresh as f32, max_value, typ);
    }
    dst
}

/// Per-pixel absolute difference of two equally sized images.
pub fn abs_diff(a: &GrayImage, b: &GrayImage) -> Result<GrayImage> {
    if a.dimensions() != b.dimensions() {
        return Err(ImgprocError::DimensionMismatch(format!(
            "abs_diff on {:?} and {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }
    let mut dst = GrayImage::new(a.width(), a.height());
    dst.as_mut()
        .par_iter_mut()
        .zip(a.as_raw().par_iter().zip(b.as_raw().par_iter()))
        .for_each(|(out, (&x, &y))| *out = x.abs_diff(y));
    Ok(dst)
}

#[inline]
fn apply_threshold(value: f32, thresh: f32, max_value: u8, typ: ThresholdType) -> u8 {
    match (typ, value > thresh) {
        (ThresholdType::Binary, true) | (ThresholdType::BinaryInv, false) => max_value,
        _ => 0,
    }
}
