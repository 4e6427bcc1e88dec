use crate::FloatImage;
use image::GrayImage;
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderMode {
    Constant(u8),
    Replicate,
    Reflect101,
}

pub(crate) fn map_coord(coord: isize, len: usize, mode: BorderMode) -> Option<usize> {
    let n = len as isize;
    if n <= 0 {
        return None;
    }

    match mode {
        BorderMode::Constant(_) => {
            if coord < 0 || coord >= n {
                None
            } else {
                Some(coord as usize)
            }
        }
        BorderMode::Replicate => Some(coord.clamp(0, n - 1) as usize),
        BorderMode::Reflect101 => {
            if n == 1 {
                return Some(0);
            }
            let period = 2 * n - 2;
            let mut c = coord % period;
            if c < 0 {
                c += period;
            }
            if c >= n {
                c = period - c;
            }
            Some(c as usize)
        }
    }
}

/// Normalized 1D Gaussian kernel. `size` is forced odd; zero picks
/// `2 * ceil(3 * sigma) + 1`.
pub fn gaussian_kernel_1d(sigma: f32, size: usize) -> Vec<f32> {
    let size = if size == 0 {
        2 * (3.0 * sigma).ceil().max(1.0) as usize + 1
    } else {
        size | 1
    };
    let half = (size / 2) as i32;
    let two_sigma_sq = 2.0 * sigma * sigma;
    let mut k: Vec<f32> = (-half..=half)
        .map(|i| (-((i * i) as f32) / two_sigma_sq).exp())
        .collect();
    let sum: f32 = k.iter().sum();
    for v in &mut k {
        *v /= sum;
    }
    k
}

/// Separable convolution on a float image with the same kernel in x and y.
pub fn separable_convolve_f32(image: &FloatImage, kernel_1d: &[f32], border: BorderMode) -> FloatImage {
    assert!(kernel_1d.len() % 2 == 1, "kernel size must be odd");
    let width = image.width as usize;
    let height = image.height as usize;
    let r = (kernel_1d.len() / 2) as isize;
    let constant = match border {
        BorderMode::Constant(v) => v as f32,
        _ => 0.0,
    };

    let mut tmp = vec![0.0f32; width * height];
    tmp.par_chunks_mut(width.max(1))
        .enumerate()
        .for_each(|(y, row_out)| {
            let row = &image.data[y * width..(y + 1) * width];
            for (x, out) in row_out.iter_mut().enumerate() {
                let mut acc = 0.0f32;
                for (k, w) in kernel_1d.iter().enumerate() {
                    let sx = x as isize + k as isize - r;
                    acc += w * match map_coord(sx, width, border) {
                        Some(ix) => row[ix],
                        None => constant,
                    };
                }
                *out = acc;
            }
        });

    let mut out = FloatImage::new(image.width, image.height);
    out.data
        .par_chunks_mut(width.max(1))
        .enumerate()
        .for_each(|(y, row_out)| {
            for (x, o) in row_out.iter_mut().enumerate() {
                let mut acc = 0.0f32;
                for (k, w) in kernel_1d.iter().enumerate() {
                    let sy = y as isize + k as isize - r;
                    acc += w * match map_coord(sy, height, border) {
                        Some(iy) => tmp[iy * width + x],
                        None => constant,
                    };
                }
                *o = acc;
            }
        });
    out
}

pub fn gaussian_blur_f32(image: &FloatImage, sigma: f32) -> FloatImage {
    if sigma <= 0.0 {
        return image.clone();
    }
    let k = gaussian_kernel_1d(sigma, 0);
    separable_convolve_f32(image, &k, BorderMode::Replicate)
}

/// Summed-area table with a leading zero row and column,
/// `(width + 1) * (height + 1)` entries.
pub fn integral_image(image: &GrayImage) -> Vec<u64> {
    let w = image.width() as usize;
    let h = image.height() as usize;
    let raw = image.as_raw();
    let stride = w + 1;
    let mut sat = vec![0u64; stride * (h + 1)];
    for y in 0..h {
        let mut row_sum = 0u64;
        for x in 0..w {
            row_sum += raw[y * w + x] as u64;
            sat[(y + 1) * stride + x + 1] = sat[y * stride + x + 1] + row_sum;
        }
    }
    sat
}

/// Mean over a `size x size` window (clipped at the border) computed in
/// constant time per pixel from the integral image.
pub fn box_filter(image: &GrayImage, size: u32) -> GrayImage {
    let w = image.width() as usize;
    let h = image.height() as usize;
    let mut out = GrayImage::new(image.width(), image.height());
    if w == 0 || h == 0 || size == 0 {
        return out;
    }
    let sat = integral_image(image);
    let stride = w + 1;
    let before = (size as usize - 1) / 2;
    let after = size as usize / 2;

    out.as_mut()
        .par_chunks_mut(w)
        .enumerate()
        .for_each(|(y, row)| {
            let y0 = y.saturating_sub(before);
            let y1 = (y + after + 1).min(h);
            for (x, o) in row.iter_mut().enumerate() {
                let x0 = x.saturating_sub(before);
                let x1 = (x + after + 1).min(w);
                let sum = sat[y1 * stride + x1] + sat[y0 * stride + x0]
                    - sat[y0 * stride + x1]
                    - sat[y1 * stride + x0];
                let area = ((y1 - y0) * (x1 - x0)) as u64;
                *o = ((sum + area / 2) / area) as u8;
            }
        });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn gaussian_kernel_1d_is_normalized() {
        let k = gaussian_kernel_1d(1.2, 7);
        let sum: f32 = k.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert_eq!(k.len(), 7);
        assert_eq!(gaussian_kernel_1d(1.0, 0).len(), 7);
    }

    #[test]
    fn gaussian_blur_preserves_size_and_mass() {
        let mut img = GrayImage::from_pixel(32, 24, Luma([100]));
        img.put_pixel(10, 10, Luma([255]));

        let out = gaussian_blur_f32(&FloatImage::from_gray(&img), 1.0);
        assert_eq!((out.width, out.height), (32, 24));
        assert!(out.get(10, 10) < 255.0);
        assert!(out.get(10, 10) > 100.0);
        assert!((out.get(30, 20) - 100.0).abs() < 1e-3);
    }

    #[test]
    fn box_filter_averages_window() {
        let mut img = GrayImage::new(5, 5);
        img.put_pixel(2, 2, Luma([90]));
        let out = box_filter(&img, 3);
        assert_eq!(out.get_pixel(2, 2)[0], 10);
        assert_eq!(out.get_pixel(1, 1)[0], 10);
        // corner window clipped to 2x2
        assert_eq!(out.get_pixel(4, 4)[0], 0);
    }
}
