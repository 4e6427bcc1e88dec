use std::collections::{HashMap, VecDeque};

use cv_imgproc::{gaussian_blur_f32, FloatImage};
use image::GrayImage;
use nalgebra::{Matrix2, Point2, Point3, Vector2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{CalibError, Result};

const RING_SAMPLES: usize = 16;
const NMS_RADIUS: i64 = 3;
const SEED_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChessboardOptions {
    /// Smoothing applied before the saddle response.
    pub blur_sigma: f32,
    /// Radius of the sampling ring used to confirm X-junctions.
    pub ring_radius: f32,
    /// Minimum intensity spread on the ring.
    pub min_contrast: f32,
    /// Saddle response threshold relative to the strongest response.
    pub response_ratio: f32,
}

impl Default for ChessboardOptions {
    fn default() -> Self {
        Self {
            blur_sigma: 1.5,
            ring_radius: 5.0,
            min_contrast: 20.0,
            response_ratio: 0.02,
        }
    }
}

/// Detect the inner corners of a chessboard.
///
/// `pattern_size` is `(cols, rows)` in inner corners. Corners are returned
/// row-major with `cols` points per row. The first corner is the one closest
/// to the image origin among the orderings whose column axis turns clockwise
/// onto the row axis, so repeated detections of the same board agree.
///
/// Positions are pixel accurate; refine them with [`corner_subpix`].
pub fn find_chessboard_corners(
    image: &GrayImage,
    pattern_size: (usize, usize),
) -> Result<Vec<Point2<f64>>> {
    find_chessboard_corners_with_options(image, pattern_size, &ChessboardOptions::default())
}

pub fn find_chessboard_corners_with_options(
    image: &GrayImage,
    pattern_size: (usize, usize),
    options: &ChessboardOptions,
) -> Result<Vec<Point2<f64>>> {
    let (cols, rows) = pattern_size;
    if cols < 2 || rows < 2 {
        return Err(CalibError::InvalidParameters(
            "pattern_size must be at least (2,2)".to_string(),
        ));
    }
    let margin = options.ring_radius.ceil() as u32 + 2;
    if image.width() <= 2 * margin || image.height() <= 2 * margin {
        return Err(CalibError::InvalidParameters(
            "image too small for chessboard detection".to_string(),
        ));
    }

    let blurred = gaussian_blur_f32(&FloatImage::from_gray(image), options.blur_sigma);
    let response = saddle_response(&blurred);
    let candidates = corner_candidates(&blurred, &response, margin, options);
    let found = candidates.len();
    tracing::debug!(found, cols, rows, "chessboard corner candidates");

    let not_found = || CalibError::ChessboardNotFound { rows, cols, found };
    if found < cols * rows {
        return Err(not_found());
    }
    assemble_grid(&candidates, cols, rows).ok_or_else(not_found)
}

/// Object points `(row * square, col * square, 0)` in detection order.
pub fn create_calibration_object(rows: usize, cols: usize, square_size: f64) -> Vec<Point3<f64>> {
    let mut points = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            points.push(Point3::new(r as f64 * square_size, c as f64 * square_size, 0.0));
        }
    }
    points
}

/// Refine corner positions to sub-pixel accuracy.
///
/// Every gradient in the `(2 * win_radius + 1)^2` window around a true corner
/// is orthogonal to the vector from the corner to its sample position; the
/// refined corner is the least-squares solution of those constraints. Stops
/// after `max_iters` or once the update moves less than `eps` pixels.
pub fn corner_subpix(
    image: &GrayImage,
    corners: &mut [Point2<f64>],
    win_radius: usize,
    max_iters: usize,
    eps: f64,
) -> Result<()> {
    if win_radius == 0 {
        return Err(CalibError::InvalidParameters(
            "win_radius must be >= 1".to_string(),
        ));
    }
    let img = FloatImage::from_gray(image);
    let r = win_radius as i32;
    let max_x = (image.width() - 1) as f64;
    let max_y = (image.height() - 1) as f64;

    corners.par_iter_mut().for_each(|p| {
        let start = *p;
        let mut cur = p.coords;
        for _ in 0..max_iters {
            let mut a = Matrix2::<f64>::zeros();
            let mut b = Vector2::<f64>::zeros();
            for dy in -r..=r {
                for dx in -r..=r {
                    let q = Vector2::new(cur.x + dx as f64, cur.y + dy as f64);
                    let wx = dx as f64 / r as f64;
                    let wy = dy as f64 / r as f64;
                    let weight = (-(wx * wx + wy * wy)).exp();
                    let (qx, qy) = (q.x as f32, q.y as f32);
                    let gx = 0.5 * (img.sample(qx + 1.0, qy) - img.sample(qx - 1.0, qy)) as f64;
                    let gy = 0.5 * (img.sample(qx, qy + 1.0) - img.sample(qx, qy - 1.0)) as f64;
                    let g = Vector2::new(gx, gy);
                    let ggt = g * g.transpose() * weight;
                    a += ggt;
                    b += ggt * q;
                }
            }
            if a.determinant().abs() < 1e-9 {
                break;
            }
            let Some(next) = a.try_inverse().map(|inv| inv * b) else {
                break;
            };
            let shift = (next - cur).norm();
            cur = next;
            if shift < eps {
                break;
            }
        }
        if (cur - start.coords).norm() > win_radius as f64 || !cur.iter().all(|v| v.is_finite()) {
            cur = start.coords;
        }
        *p = Point2::new(cur.x.clamp(0.0, max_x), cur.y.clamp(0.0, max_y));
    });
    Ok(())
}

/// `Ixy^2 - Ixx * Iyy`: positive at saddle points, which is what an
/// X-junction between four squares looks like after blurring.
fn saddle_response(img: &FloatImage) -> FloatImage {
    let w = img.width as usize;
    let h = img.height as usize;
    let mut out = FloatImage::new(img.width, img.height);
    out.data
        .par_chunks_mut(w)
        .enumerate()
        .skip(1)
        .take(h.saturating_sub(2))
        .for_each(|(y, row)| {
            let at = |x: usize, y: usize| img.data[y * w + x];
            for x in 1..w - 1 {
                let c = at(x, y);
                let ixx = at(x + 1, y) - 2.0 * c + at(x - 1, y);
                let iyy = at(x, y + 1) - 2.0 * c + at(x, y - 1);
                let ixy = 0.25
                    * (at(x + 1, y + 1) - at(x + 1, y - 1) - at(x - 1, y + 1) + at(x - 1, y - 1));
                row[x] = ixy * ixy - ixx * iyy;
            }
        });
    out
}

fn corner_candidates(
    blurred: &FloatImage,
    response: &FloatImage,
    margin: u32,
    options: &ChessboardOptions,
) -> Vec<Point2<f64>> {
    let max_r = response.max_value();
    if !(max_r > 0.0) {
        return Vec::new();
    }
    let threshold = max_r * options.response_ratio;
    let w = response.width;
    let h = response.height;

    (margin..h - margin)
        .into_par_iter()
        .flat_map_iter(|y| {
            (margin..w - margin).filter_map(move |x| {
                let v = response.get(x, y);
                if v <= threshold || !is_local_max(response, x, y, v) {
                    return None;
                }
                let (xf, yf) = (x as f32, y as f32);
                ring_is_saddle(blurred, xf, yf, options.ring_radius, options.min_contrast)
                    .then(|| Point2::new(x as f64, y as f64))
            })
        })
        .collect()
}

/// Strict maximum over the NMS window; ties go to the first pixel in scan order.
fn is_local_max(response: &FloatImage, x: u32, y: u32, v: f32) -> bool {
    for dy in -NMS_RADIUS..=NMS_RADIUS {
        for dx in -NMS_RADIUS..=NMS_RADIUS {
            if dx == 0 && dy == 0 {
                continue;
            }
            let n = response.get_clamped(x as i64 + dx, y as i64 + dy);
            if n > v || (n == v && (dy < 0 || (dy == 0 && dx < 0))) {
                return false;
            }
        }
    }
    true
}

/// An X-junction shows four alternating dark/bright arcs on a ring around it,
/// with opposite arcs of the same colour.
fn ring_is_saddle(img: &FloatImage, x: f32, y: f32, radius: f32, min_contrast: f32) -> bool {
    let mut samples = [0.0f32; RING_SAMPLES];
    for (k, s) in samples.iter_mut().enumerate() {
        let a = 2.0 * std::f32::consts::PI * k as f32 / RING_SAMPLES as f32;
        *s = img.sample(x + radius * a.cos(), y + radius * a.sin());
    }
    let lo = samples.iter().copied().fold(f32::INFINITY, f32::min);
    let hi = samples.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if hi - lo < min_contrast {
        return false;
    }
    let mid = 0.5 * (lo + hi);
    let bright: Vec<bool> = samples.iter().map(|&s| s > mid).collect();

    let transitions = (0..RING_SAMPLES)
        .filter(|&k| bright[k] != bright[(k + 1) % RING_SAMPLES])
        .count();
    let half = RING_SAMPLES / 2;
    let opposite_agree = (0..half).filter(|&k| bright[k] == bright[k + half]).count();
    transitions == 4 && opposite_agree + 2 >= half
}

#[derive(Debug, Clone, Copy)]
struct GridNode {
    idx: usize,
    u: Vector2<f64>,
    v: Vector2<f64>,
}

fn assemble_grid(points: &[Point2<f64>], cols: usize, rows: usize) -> Option<Vec<Point2<f64>>> {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p.coords) / n;
    let mut order: Vec<usize> = (0..points.len()).collect();
    order.sort_by(|&a, &b| {
        let da = (points[a].coords - centroid).norm_squared();
        let db = (points[b].coords - centroid).norm_squared();
        da.total_cmp(&db)
    });

    order
        .iter()
        .take(SEED_ATTEMPTS)
        .find_map(|&seed| grow_grid(points, seed, cols, rows))
        .map(canonical_order)
}

/// Breadth-first growth of a lattice from `seed`, predicting each neighbour
/// from the local step vectors. Returns the grid as `rows` vectors of `cols`.
fn grow_grid(
    points: &[Point2<f64>],
    seed: usize,
    cols: usize,
    rows: usize,
) -> Option<Vec<Vec<Point2<f64>>>> {
    let p = |i: usize| points[i].coords;

    let mut by_dist: Vec<usize> = (0..points.len()).filter(|&i| i != seed).collect();
    by_dist.sort_by(|&a, &b| (p(a) - p(seed)).norm().total_cmp(&(p(b) - p(seed)).norm()));
    let first = *by_dist.first()?;
    let u = p(first) - p(seed);
    let v = by_dist.iter().take(8).find_map(|&i| {
        let d = p(i) - p(seed);
        let cos = d.dot(&u) / (d.norm() * u.norm());
        (cos.abs() < 0.5 && d.norm() < 2.0 * u.norm()).then_some(d)
    })?;

    let mut used = vec![false; points.len()];
    let mut cells: HashMap<(i32, i32), GridNode> = HashMap::new();
    let mut queue = VecDeque::new();
    cells.insert((0, 0), GridNode { idx: seed, u, v });
    used[seed] = true;
    queue.push_back((0, 0));

    while let Some((i, j)) = queue.pop_front() {
        let node = cells[&(i, j)];
        let steps = [(1, 0, node.u), (-1, 0, -node.u), (0, 1, node.v), (0, -1, -node.v)];
        for (di, dj, step) in steps {
            let key = (i + di, j + dj);
            if cells.contains_key(&key) {
                continue;
            }
            let pred = match cells.get(&(i - di, j - dj)) {
                Some(back) => 2.0 * p(node.idx) - p(back.idx),
                None => p(node.idx) + step,
            };
            let tol = 0.35 * step.norm();
            let hit = (0..points.len())
                .filter(|&k| !used[k])
                .map(|k| (k, (p(k) - pred).norm()))
                .filter(|&(_, d)| d < tol)
                .min_by(|a, b| a.1.total_cmp(&b.1));
            if let Some((k, _)) = hit {
                let d = p(k) - p(node.idx);
                let (nu, nv) = if di != 0 {
                    (d * di as f64, node.v)
                } else {
                    (node.u, d * dj as f64)
                };
                cells.insert(key, GridNode { idx: k, u: nu, v: nv });
                used[k] = true;
                queue.push_back(key);
            }
        }
    }

    if cells.len() != cols * rows {
        return None;
    }
    let imin = cells.keys().map(|k| k.0).min()?;
    let imax = cells.keys().map(|k| k.0).max()?;
    let jmin = cells.keys().map(|k| k.1).min()?;
    let jmax = cells.keys().map(|k| k.1).max()?;
    let extent_u = (imax - imin + 1) as usize;
    let extent_v = (jmax - jmin + 1) as usize;

    let transpose = if (extent_u, extent_v) == (cols, rows) {
        false
    } else if (extent_u, extent_v) == (rows, cols) {
        true
    } else {
        return None;
    };

    let mut grid = vec![vec![Point2::origin(); cols]; rows];
    for (&(i, j), node) in &cells {
        let (a, b) = ((i - imin) as usize, (j - jmin) as usize);
        let (r, c) = if transpose { (a, b) } else { (b, a) };
        grid[r][c] = points[node.idx];
    }
    Some(grid)
}

/// Picks among the symmetric relabellings of the grid the one with a
/// clockwise column-to-row turn and the first corner nearest the origin.
fn canonical_order(grid: Vec<Vec<Point2<f64>>>) -> Vec<Point2<f64>> {
    let rows = grid.len();
    let cols = grid.first().map_or(0, |r| r.len());
    let mut variants = Vec::new();
    for transpose in [false, true] {
        if transpose && rows != cols {
            continue;
        }
        for flip_r in [false, true] {
            for flip_c in [false, true] {
                let g: Vec<Vec<Point2<f64>>> = (0..rows)
                    .map(|r| {
                        (0..cols)
                            .map(|c| {
                                let rr = if flip_r { rows - 1 - r } else { r };
                                let cc = if flip_c { cols - 1 - c } else { c };
                                if transpose {
                                    grid[cc][rr]
                                } else {
                                    grid[rr][cc]
                                }
                            })
                            .collect()
                    })
                    .collect();
                variants.push(g);
            }
        }
    }

    let turn = |g: &Vec<Vec<Point2<f64>>>| {
        let a = g[0][1] - g[0][0];
        let b = g[1][0] - g[0][0];
        a.x * b.y - a.y * b.x
    };
    let best = variants
        .into_iter()
        .filter(|g| turn(g) > 0.0)
        .min_by(|a, b| (a[0][0].x + a[0][0].y).total_cmp(&(b[0][0].x + b[0][0].y)));

    best.unwrap_or(grid).into_iter().flatten().collect()
}
