//! Pyramidal Lucas-Kanade optical flow
//!
//! Iterative (Bouguet style) tracking of single points through image
//! pyramids built with [`cv_imgproc::build_pyramid`].

use cv_imgproc::FloatImage;
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

/// Smallest eigenvalue of the normalized structure tensor accepted as
/// trackable texture.
const MIN_EIGEN: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LucasKanade {
    /// Half size of the integration window.
    pub window_radius: usize,
    pub max_iterations: usize,
    pub epsilon: f32,
    pub pyramid_levels: u32,
}

impl Default for LucasKanade {
    fn default() -> Self {
        Self {
            window_radius: 10,
            max_iterations: 30,
            epsilon: 0.01,
            pyramid_levels: 3,
        }
    }
}

impl LucasKanade {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window_radius(mut self, radius: usize) -> Self {
        self.window_radius = radius.max(1);
        self
    }

    pub fn with_pyramid_levels(mut self, levels: u32) -> Self {
        self.pyramid_levels = levels.max(1);
        self
    }

    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Track `point` from `prev` to `next`, both given as pyramids with level
    /// 0 at full resolution. `None` when the window has no usable texture or
    /// the result leaves the image.
    pub fn track_point(
        &self,
        prev: &[FloatImage],
        next: &[FloatImage],
        point: (f32, f32),
    ) -> Option<(f32, f32)> {
        let levels = prev.len().min(next.len()).min(self.pyramid_levels.max(1) as usize);
        if levels == 0 {
            return None;
        }
        let p = Vector2::new(point.0, point.1);
        let mut guess = Vector2::<f32>::zeros();

        for level in (0..levels).rev() {
            let scale = (1u32 << level) as f32;
            let pl = p / scale;
            let flow = self.refine(&prev[level], &next[level], pl, guess);
            match flow {
                Some(d) => guess = d,
                // coarse levels may lack texture, keep the propagated guess
                None if level > 0 => {}
                None => return None,
            }
            if level > 0 {
                guess *= 2.0;
            }
        }

        let out = p + guess;
        let base = &next[0];
        let inside = out.x >= 0.0
            && out.y >= 0.0
            && out.x <= (base.width - 1) as f32
            && out.y <= (base.height - 1) as f32;
        (inside && out.x.is_finite() && out.y.is_finite()).then_some((out.x, out.y))
    }

    pub fn track_points(
        &self,
        prev: &[FloatImage],
        next: &[FloatImage],
        points: &[(f32, f32)],
    ) -> Vec<Option<(f32, f32)>> {
        points
            .iter()
            .map(|&p| self.track_point(prev, next, p))
            .collect()
    }

    /// Align a centred `template` patch to `image` starting at `guess`.
    pub fn align_patch(
        &self,
        template: &FloatImage,
        image: &FloatImage,
        guess: (f32, f32),
    ) -> Option<(f32, f32)> {
        let half = (template.width as f32 - 1.0) / 2.0;
        let p = Vector2::new(half, half);
        let start = Vector2::new(guess.0 - half, guess.1 - half);
        let radius = (template.width / 2) as usize;
        let d = self.refine_window(template, image, p, start, radius)?;
        let out = p + d;
        (out.x.is_finite() && out.y.is_finite()).then_some((out.x, out.y))
    }

    fn refine(
        &self,
        prev: &FloatImage,
        next: &FloatImage,
        p: Vector2<f32>,
        guess: Vector2<f32>,
    ) -> Option<Vector2<f32>> {
        self.refine_window(prev, next, p, guess, self.window_radius)
    }

    /// Displacement `d` minimizing the window SSD between `prev` around `p`
    /// and `next` around `p + d`, starting from `d = guess`.
    fn refine_window(
        &self,
        prev: &FloatImage,
        next: &FloatImage,
        p: Vector2<f32>,
        guess: Vector2<f32>,
        radius: usize,
    ) -> Option<Vector2<f32>> {
        let r = radius as i32;
        let n = ((2 * r + 1) * (2 * r + 1)) as usize;
        let mut values = Vec::with_capacity(n);
        let mut grads = Vec::with_capacity(n);
        let mut g = Matrix2::<f64>::zeros();

        for dy in -r..=r {
            for dx in -r..=r {
                let x = p.x + dx as f32;
                let y = p.y + dy as f32;
                let ix = (prev.sample(x + 1.0, y) - prev.sample(x - 1.0, y)) * 0.5;
                let iy = (prev.sample(x, y + 1.0) - prev.sample(x, y - 1.0)) * 0.5;
                g[(0, 0)] += (ix * ix) as f64;
                g[(0, 1)] += (ix * iy) as f64;
                g[(1, 1)] += (iy * iy) as f64;
                values.push(prev.sample(x, y));
                grads.push((ix, iy));
            }
        }
        g[(1, 0)] = g[(0, 1)];

        let norm = g / n as f64;
        let tr = norm.trace();
        let det = norm.determinant();
        let min_eig = 0.5 * (tr - (tr * tr - 4.0 * det).max(0.0).sqrt());
        if min_eig < MIN_EIGEN {
            return None;
        }
        let g_inv = g.try_inverse()?;

        let mut d = guess;
        for _ in 0..self.max_iterations {
            let mut b = Vector2::<f64>::zeros();
            let mut k = 0;
            for dy in -r..=r {
                for dx in -r..=r {
                    let x = p.x + d.x + dx as f32;
                    let y = p.y + d.y + dy as f32;
                    let diff = values[k] - next.sample(x, y);
                    let (ix, iy) = grads[k];
                    b[0] += (diff * ix) as f64;
                    b[1] += (diff * iy) as f64;
                    k += 1;
                }
            }
            let eta = g_inv * b;
            d += Vector2::new(eta[0] as f32, eta[1] as f32);
            if !d.x.is_finite() || !d.y.is_finite() {
                return None;
            }
            if eta.norm() < self.epsilon as f64 {
                break;
            }
        }
        Some(d)
    }
}
