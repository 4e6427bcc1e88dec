use crate::convolve::map_coord;
use crate::{BorderMode, ImgprocError, Interpolation, Result};
use image::GrayImage;
use nalgebra::{Matrix3, Point2};
use rayon::prelude::*;

fn bilinear_with_border(img: &GrayImage, x: f32, y: f32, border: BorderMode) -> f32 {
    let x0 = x.floor() as isize;
    let y0 = y.floor() as isize;

    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let v00 = sample_pixel(img, x0, y0, border);
    let v10 = sample_pixel(img, x0 + 1, y0, border);
    let v01 = sample_pixel(img, x0, y0 + 1, border);
    let v11 = sample_pixel(img, x0 + 1, y0 + 1, border);

    let v0 = v00 * (1.0 - fx) + v10 * fx;
    let v1 = v01 * (1.0 - fx) + v11 * fx;

    v0 * (1.0 - fy) + v1 * fy
}

pub fn sample_pixel(img: &GrayImage, x: isize, y: isize, border: BorderMode) -> f32 {
    let width = img.width() as usize;
    let height = img.height() as usize;
    let raw = img.as_raw();

    match (map_coord(x, width, border), map_coord(y, height, border)) {
        (Some(ix), Some(iy)) => raw[iy * width + ix] as f32,
        _ => match border {
            BorderMode::Constant(v) => v as f32,
            _ => 0.0,
        },
    }
}

fn interpolate_sample(
    src: &GrayImage,
    x: f32,
    y: f32,
    interpolation: Interpolation,
    border: BorderMode,
) -> f32 {
    if !x.is_finite() || !y.is_finite() {
        return match border {
            BorderMode::Constant(v) => v as f32,
            _ => 0.0,
        };
    }
    match interpolation {
        Interpolation::Nearest => sample_pixel(src, x.round() as isize, y.round() as isize, border),
        Interpolation::Linear => bilinear_with_border(src, x, y, border),
    }
}

/// Inverse-mapped perspective warp: `dst(x, y) = src(M * (x, y, 1))`.
pub fn warp_perspective_ex(
    src: &GrayImage,
    matrix: &Matrix3<f64>,
    width: u32,
    height: u32,
    interpolation: Interpolation,
    border: BorderMode,
) -> GrayImage {
    let matrix: Matrix3<f32> = matrix.cast();
    let mut dst = GrayImage::new(width, height);
    if width == 0 || height == 0 {
        return dst;
    }

    dst.as_mut()
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let src_pt = transform_point(&matrix, &Point2::new(x as f32, y as f32));
                let val = interpolate_sample(src, src_pt.x, src_pt.y, interpolation, border);
                *out = val.round().clamp(0.0, 255.0) as u8;
            }
        });

    dst
}

/// Per-pixel resampling through explicit source-coordinate maps.
pub fn remap(
    src: &GrayImage,
    map_x: &[f32],
    map_y: &[f32],
    width: u32,
    height: u32,
    interpolation: Interpolation,
    border: BorderMode,
) -> Result<GrayImage> {
    let n = (width as usize) * (height as usize);
    if map_x.len() != n || map_y.len() != n {
        return Err(ImgprocError::DimensionMismatch(format!(
            "remap maps hold {}/{} entries, expected {n}",
            map_x.len(),
            map_y.len()
        )));
    }

    let mut dst = GrayImage::new(width, height);
    if n == 0 {
        return Ok(dst);
    }

    dst.as_mut()
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let base = y * width as usize;
            for (x, out) in row.iter_mut().enumerate() {
                let val = interpolate_sample(src, map_x[base + x], map_y[base + x], interpolation, border);
                *out = val.round().clamp(0.0, 255.0) as u8;
            }
        });

    Ok(dst)
}

pub fn transform_point(matrix: &Matrix3<f32>, pt: &Point2<f32>) -> Point2<f32> {
    let x = pt.x;
    let y = pt.y;

    let w = matrix[(2, 0)] * x + matrix[(2, 1)] * y + matrix[(2, 2)];
    if w.abs() < 1e-10 {
        return Point2::new(f32::NAN, f32::NAN);
    }
    Point2::new(
        (matrix[(0, 0)] * x + matrix[(0, 1)] * y + matrix[(0, 2)]) / w,
        (matrix[(1, 0)] * x + matrix[(1, 1)] * y + matrix[(1, 2)]) / w,
    )
}

pub fn get_translation_matrix(dx: f64, dy: f64) -> Matrix3<f64> {
    Matrix3::new(1.0, 0.0, dx, 0.0, 1.0, dy, 0.0, 0.0, 1.0)
}

pub fn flip_vertical(src: &GrayImage) -> GrayImage {
    let w = src.width() as usize;
    let mut dst = GrayImage::new(src.width(), src.height());
    if w == 0 {
        return dst;
    }
    for (dst_row, src_row) in dst
        .as_mut()
        .chunks_mut(w)
        .zip(src.as_raw().chunks(w).rev())
    {
        dst_row.copy_from_slice(src_row);
    }
    dst
}
