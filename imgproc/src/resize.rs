use crate::convolve::{map_coord, separable_convolve_f32};
use crate::{BorderMode, FloatImage};
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
    Linear,
}

const PYR_KERNEL: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];

/// Gaussian 5-tap smoothing followed by dropping every other row and column.
/// Output size is `((w + 1) / 2, (h + 1) / 2)`.
pub fn pyr_down(src: &FloatImage) -> FloatImage {
    let smoothed = separable_convolve_f32(src, &PYR_KERNEL, BorderMode::Reflect101);
    let new_width = (src.width + 1) / 2;
    let new_height = (src.height + 1) / 2;
    let mut dst = FloatImage::new(new_width, new_height);
    if new_width == 0 || new_height == 0 {
        return dst;
    }
    let sw = src.width as usize;
    dst.data
        .par_chunks_mut(new_width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let sy = map_coord(2 * y as isize, src.height as usize, BorderMode::Replicate).unwrap_or(0);
            for (x, out) in row.iter_mut().enumerate() {
                *out = smoothed.data[sy * sw + 2 * x];
            }
        });
    dst
}

/// Level 0 is the input; stops early once a level would drop below 8 pixels.
pub fn build_pyramid(src: &FloatImage, levels: u32) -> Vec<FloatImage> {
    let mut pyramid = vec![src.clone()];
    for _ in 1..levels.max(1) {
        let next = match pyramid.last() {
            Some(prev) if prev.width >= 16 && prev.height >= 16 => pyr_down(prev),
            _ => break,
        };
        pyramid.push(next);
    }
    pyramid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pyramid_halves_each_level() {
        let mut img = FloatImage::new(64, 48);
        for v in img.data.iter_mut() {
            *v = 80.0;
        }
        let pyr = build_pyramid(&img, 3);
        assert_eq!(pyr.len(), 3);
        assert_eq!((pyr[1].width, pyr[1].height), (32, 24));
        assert_eq!((pyr[2].width, pyr[2].height), (16, 12));
        assert!((pyr[2].get(5, 5) - 80.0).abs() < 1e-3);
    }

    #[test]
    fn pyramid_stops_on_small_images() {
        let img = FloatImage::new(20, 20);
        assert_eq!(build_pyramid(&img, 5).len(), 2);
    }
}
