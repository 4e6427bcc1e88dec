//! Radially weighted template correlation.
//!
//! Templates are square `FloatImage`s of odd side length centred on the
//! target. Each pixel carries a weight from [`radial_weight`] so that the
//! background around a circular target contributes little to the score.

use crate::{FloatImage, ImgprocError, Result};

/// Side length of the square window that covers a disc of `radius`.
pub fn patch_size(radius: f32) -> u32 {
    2 * radius.max(1.0).ceil() as u32 + 1
}

/// Cosine-tapered disc: 1 at the centre falling to 0 at `radius`, 0 outside.
pub fn radial_weight(size: u32, radius: f32) -> FloatImage {
    let mut w = FloatImage::new(size, size);
    let c = (size as f32 - 1.0) / 2.0;
    let radius = radius.max(1e-3);
    for y in 0..size {
        for x in 0..size {
            let r = ((x as f32 - c).powi(2) + (y as f32 - c).powi(2)).sqrt();
            let v = if r < radius {
                0.5 * (1.0 + (std::f32::consts::PI * r / radius).cos())
            } else {
                0.0
            };
            w.set(x, y, v);
        }
    }
    w
}

/// Extracts a `size x size` window centred at `(cx, cy)` with bilinear
/// sampling.
pub fn sample_patch(img: &FloatImage, cx: f32, cy: f32, size: u32) -> FloatImage {
    let mut out = FloatImage::new(size, size);
    let half = (size as f32 - 1.0) / 2.0;
    for y in 0..size {
        for x in 0..size {
            out.set(x, y, img.sample(cx + x as f32 - half, cy + y as f32 - half));
        }
    }
    out
}

/// Rotates a square patch about its centre by `angle` radians (image
/// coordinates, y down, positive angle turns +x towards +y).
pub fn rotate_patch(patch: &FloatImage, angle: f32) -> FloatImage {
    let mut out = FloatImage::new(patch.width, patch.height);
    let cx = (patch.width as f32 - 1.0) / 2.0;
    let cy = (patch.height as f32 - 1.0) / 2.0;
    let (s, c) = angle.sin_cos();
    for y in 0..patch.height {
        for x in 0..patch.width {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            // inverse rotation into the source patch
            let sx = c * dx + s * dy + cx;
            let sy = -s * dx + c * dy + cy;
            out.set(x, y, patch.sample(sx, sy));
        }
    }
    out
}

/// Weighted normalized cross-correlation in [-1, 1]. Flat inputs score 0.
pub fn weighted_ncc(a: &[f32], b: &[f32], weights: &[f32]) -> Result<f32> {
    if a.len() != b.len() || a.len() != weights.len() {
        return Err(ImgprocError::DimensionMismatch(format!(
            "ncc inputs of length {}, {} and {}",
            a.len(),
            b.len(),
            weights.len()
        )));
    }
    let sw: f64 = weights.iter().map(|&w| w as f64).sum();
    if sw <= 1e-12 {
        return Ok(0.0);
    }
    let mut ma = 0.0f64;
    let mut mb = 0.0f64;
    for ((&x, &y), &w) in a.iter().zip(b).zip(weights) {
        ma += w as f64 * x as f64;
        mb += w as f64 * y as f64;
    }
    ma /= sw;
    mb /= sw;

    let mut cross = 0.0f64;
    let mut va = 0.0f64;
    let mut vb = 0.0f64;
    for ((&x, &y), &w) in a.iter().zip(b).zip(weights) {
        let da = x as f64 - ma;
        let db = y as f64 - mb;
        cross += w as f64 * da * db;
        va += w as f64 * da * da;
        vb += w as f64 * db * db;
    }
    let denom = (va * vb).sqrt();
    if denom <= 1e-9 {
        return Ok(0.0);
    }
    Ok((cross / denom) as f32)
}

/// Scores `template` against `image` centred at `(cx, cy)`.
pub fn match_at(
    image: &FloatImage,
    template: &FloatImage,
    weights: &FloatImage,
    cx: f32,
    cy: f32,
) -> Result<f32> {
    if template.width != weights.width || template.height != weights.height {
        return Err(ImgprocError::DimensionMismatch(
            "template and weight sizes differ".into(),
        ));
    }
    let window = sample_patch(image, cx, cy, template.width);
    weighted_ncc(&window.data, &template.data, &weights.data)
}
