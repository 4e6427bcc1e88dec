//! KLT robot tracker
//!
//! Two stage tracking of a circular target in ground-plane video:
//!
//! 1. pyramidal Lucas-Kanade from the previous frame gives a candidate
//!    position,
//! 2. the appearance template is rotated to the two headings the target can
//!    have (its principal axis is ambiguous by pi), each prediction is aligned
//!    to the live frame and scored with radially weighted NCC.
//!
//! A low score marks the target lost. Lost targets are searched for inside
//! regions that changed between frames.

use std::f32::consts::{FRAC_PI_4, PI};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cv_imgproc::{
    abs_diff, box_filter, build_pyramid, dilate, match_at, patch_size, radial_weight, rotate_patch,
    sample_patch, threshold, FloatImage, ThresholdType,
};
use image::GrayImage;
use nalgebra::{Matrix2, Point2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::optical_flow::LucasKanade;
use crate::track_log::{wrap_angle, TrackEntry, TrackHistory, UNKNOWN_WGM};
use crate::{Result, VideoError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerParams {
    /// NCC below this marks the target lost.
    pub loss_threshold: f32,
    /// NCC a relocalization candidate must exceed.
    pub relocalization_threshold: f32,
    /// Heading change (rad) treated as a 180 degree flip.
    pub flip_threshold: f32,
    /// Intensity below which a pixel belongs to the dark half of the target.
    pub heading_threshold: f32,
    pub pyramid_levels: u32,
    /// LK window radius as a fraction of the robot radius.
    pub lk_window_scale: f32,
    pub lk_iterations: usize,
    pub lk_epsilon: f32,
    pub frame_diff_threshold: u8,
    /// Box filter size of the motion filter, in pixels.
    pub motion_filter_size: u32,
    pub motion_threshold: u8,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            loss_threshold: 0.4,
            relocalization_threshold: 0.7,
            flip_threshold: 1.6,
            heading_threshold: 100.0,
            pyramid_levels: 3,
            lk_window_scale: 0.9,
            lk_iterations: 30,
            lk_epsilon: 0.01,
            frame_diff_threshold: 20,
            motion_filter_size: 24,
            motion_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackStatus {
    Inactive,
    Active,
    JustLost,
    Lost,
}

#[derive(Clone)]
struct Frame {
    gray: GrayImage,
    pyramid: Vec<FloatImage>,
}

impl Frame {
    fn new(gray: GrayImage, levels: u32) -> Self {
        let pyramid = build_pyramid(&FloatImage::from_gray(&gray), levels);
        Self { gray, pyramid }
    }

    fn base(&self) -> &FloatImage {
        &self.pyramid[0]
    }

    fn contains(&self, p: &Point2<f32>) -> bool {
        p.x >= 0.0
            && p.y >= 0.0
            && p.x <= (self.gray.width() - 1) as f32
            && p.y <= (self.gray.height() - 1) as f32
    }
}

/// One appearance hypothesis of stage two.
#[derive(Debug, Clone)]
struct Candidate {
    position: Point2<f32>,
    heading: f32,
    score: f32,
    appearance: FloatImage,
}

pub struct KltTracker {
    params: TrackerParams,
    radius: f32,
    flow: LucasKanade,
    weights: FloatImage,
    status: TrackStatus,
    position: Point2<f32>,
    heading: f32,
    error: f32,
    current: Option<Frame>,
    previous: Option<Frame>,
    /// Appearance captured at activation and the heading it was seen at.
    template: Option<FloatImage>,
    template_heading: f32,
    /// Latest winning prediction, used for relocalization.
    appearance: Option<FloatImage>,
    warp_gradient: Option<FloatImage>,
    history: TrackHistory,
    cancel: Arc<AtomicBool>,
}

impl KltTracker {
    /// Tracker for a target of `radius` ground-plane pixels.
    pub fn new(radius: f32, params: TrackerParams) -> Result<Self> {
        if !radius.is_finite() || radius < 2.0 {
            return Err(VideoError::InvalidParameters(format!(
                "target radius must be at least 2 pixels, got {radius}"
            )));
        }
        let window = (params.lk_window_scale * radius).round().max(2.0) as usize;
        let flow = LucasKanade::new()
            .with_window_radius(window)
            .with_pyramid_levels(params.pyramid_levels)
            .with_max_iterations(params.lk_iterations)
            .with_epsilon(params.lk_epsilon);
        let size = patch_size(radius);
        Ok(Self {
            params,
            radius,
            flow,
            weights: radial_weight(size, radius),
            status: TrackStatus::Inactive,
            position: Point2::origin(),
            heading: 0.0,
            error: 0.0,
            current: None,
            previous: None,
            template: None,
            template_heading: 0.0,
            appearance: None,
            warp_gradient: None,
            history: TrackHistory::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn params(&self) -> &TrackerParams {
        &self.params
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn status(&self) -> TrackStatus {
        self.status
    }

    pub fn position(&self) -> Point2<f32> {
        self.position
    }

    pub fn heading(&self) -> f32 {
        self.heading
    }

    /// NCC score of the last accepted match.
    pub fn error(&self) -> f32 {
        self.error
    }

    pub fn history(&self) -> &TrackHistory {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut TrackHistory {
        &mut self.history
    }

    /// Gradient magnitude image from the ground-plane warp, sampled into
    /// each track entry.
    pub fn set_warp_gradient(&mut self, wgm: FloatImage) {
        self.warp_gradient = Some(wgm);
    }

    /// Flag checked between rows of [`Self::target_search`]. Setting it
    /// abandons the running search; the search clears it on exit.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Advance to a new frame. The current frame becomes the previous one.
    pub fn next_frame(&mut self, image: GrayImage) -> Result<()> {
        cv_imgproc::validate_image_size(image.width(), image.height())?;
        if let Some(cur) = &self.current {
            if cur.gray.dimensions() != image.dimensions() {
                return Err(VideoError::SizeMismatch(format!(
                    "frame of {:?} after frames of {:?}",
                    image.dimensions(),
                    cur.gray.dimensions()
                )));
            }
        }
        self.previous = self.current.take();
        self.current = Some(Frame::new(image, self.params.pyramid_levels));
        Ok(())
    }

    fn current_frame(&self) -> Result<&Frame> {
        self.current
            .as_ref()
            .ok_or_else(|| VideoError::TrackingError("no frame loaded".to_string()))
    }

    /// Start tracking at `position` in the current frame.
    pub fn activate(&mut self, position: Point2<f32>, timestamp_ms: u64) -> Result<()> {
        let frame = self.current_frame()?;
        if !frame.contains(&position) {
            return Err(VideoError::InvalidParameters(format!(
                "activation point ({}, {}) outside the frame",
                position.x, position.y
            )));
        }
        let template = sample_patch(frame.base(), position.x, position.y, self.weights.width);
        let theta = self.compute_heading(&position).unwrap_or(0.0);
        let seed = frame.clone();
        self.previous = Some(seed);
        self.template = Some(template);
        self.template_heading = theta;

        // settle the pi ambiguity of the principal axis once, as in tracking
        let primary = self.candidate(&position, theta)?;
        let flipped = self.candidate(&position, wrap_angle(theta + PI))?;
        let best = if flipped.score > primary.score { flipped } else { primary };
        let heading = best.heading;

        self.template_heading = heading;
        self.template = Some(best.appearance.clone());
        self.appearance = Some(best.appearance);
        self.position = position;
        self.heading = heading;
        self.error = best.score;
        self.status = TrackStatus::Active;
        self.record(timestamp_ms);
        tracing::debug!(x = position.x, y = position.y, heading, "tracker activated");
        Ok(())
    }

    fn record(&mut self, timestamp_ms: u64) {
        let wgm = self.warp_gradient_at(&self.position);
        self.history.push(
            TrackEntry::new(self.position, self.heading, self.error, timestamp_ms).with_warp_gradient(wgm),
        );
    }

    fn warp_gradient_at(&self, p: &Point2<f32>) -> f32 {
        let Some(wgm) = &self.warp_gradient else {
            return UNKNOWN_WGM;
        };
        let (x, y) = (p.x.round(), p.y.round());
        if x < 0.0 || y < 0.0 || x >= wgm.width as f32 || y >= wgm.height as f32 {
            return UNKNOWN_WGM;
        }
        let v = wgm.get(x as u32, y as u32);
        if v.is_finite() {
            v
        } else {
            UNKNOWN_WGM
        }
    }

    /// Track the target into the current frame. Returns whether a position
    /// was accepted; a rejected frame leaves the tracker `JustLost`.
    pub fn track(&mut self, timestamp_ms: u64, flip_correct: bool) -> Result<bool> {
        if self.status != TrackStatus::Active {
            return Ok(false);
        }
        let (Some(prev), Some(cur)) = (&self.previous, &self.current) else {
            return Err(VideoError::TrackingError(
                "tracking needs a previous and a current frame".to_string(),
            ));
        };

        let moved = self
            .flow
            .track_point(&prev.pyramid, &cur.pyramid, (self.position.x, self.position.y));
        let Some((x, y)) = moved else {
            tracing::debug!(timestamp_ms, "optical flow failed");
            self.status = TrackStatus::JustLost;
            return Ok(false);
        };
        let estimate = Point2::new(x, y);

        let theta = self.compute_heading(&estimate).unwrap_or(self.heading);
        let primary = self.candidate(&estimate, theta)?;
        let flipped = self.candidate(&estimate, wrap_angle(theta + PI))?;
        let (mut best, mut other) = if flipped.score > primary.score {
            (flipped, primary)
        } else {
            (primary, flipped)
        };
        if flip_correct && wrap_angle(best.heading - self.heading).abs() > self.params.flip_threshold {
            tracing::debug!(from = self.heading, to = best.heading, "heading flip corrected");
            std::mem::swap(&mut best, &mut other);
        }

        if best.score < self.params.loss_threshold {
            tracing::debug!(timestamp_ms, score = best.score, "target lost");
            self.status = TrackStatus::JustLost;
            return Ok(false);
        }

        self.position = best.position;
        self.heading = best.heading;
        self.error = best.score;
        self.appearance = Some(best.appearance);
        self.record(timestamp_ms);
        Ok(true)
    }

    /// Predict the target's look at `heading`, align it near `estimate` and
    /// score the result.
    fn candidate(&self, estimate: &Point2<f32>, heading: f32) -> Result<Candidate> {
        let (Some(cur), Some(template)) = (&self.current, &self.template) else {
            return Err(VideoError::TrackingError("tracker not activated".to_string()));
        };
        let appearance = rotate_patch(template, heading - self.template_heading);
        let position = self
            .flow
            .align_patch(&appearance, cur.base(), (estimate.x, estimate.y))
            .map(|(x, y)| Point2::new(x, y))
            .filter(|p| cur.contains(p) && (p - estimate).norm() <= self.radius)
            .unwrap_or(*estimate);
        let score = match_at(cur.base(), &appearance, &self.weights, position.x, position.y)?;
        Ok(Candidate {
            position,
            heading,
            score,
            appearance,
        })
    }

    /// Called on frames where the target is not being tracked. Returns
    /// whether the tracker is active afterwards.
    pub fn do_inactive_processing(&mut self, timestamp_ms: u64) -> Result<bool> {
        match self.status {
            TrackStatus::Inactive => Ok(false),
            TrackStatus::Active => Ok(true),
            TrackStatus::JustLost | TrackStatus::Lost => {
                if let Some(found) = self.loss_recovery()? {
                    tracing::info!(x = found.x, y = found.y, timestamp_ms, "target relocalized");
                    self.activate(found, timestamp_ms)?;
                    return Ok(true);
                }
                if self.status == TrackStatus::JustLost {
                    tracing::warn!(timestamp_ms, "target lost");
                }
                self.status = TrackStatus::Lost;
                Ok(false)
            }
        }
    }

    /// Search for the target where the scene changed since the last frame.
    pub fn loss_recovery(&self) -> Result<Option<Point2<f32>>> {
        let (Some(prev), Some(cur)) = (&self.previous, &self.current) else {
            return Ok(None);
        };
        let p = &self.params;
        let diff = abs_diff(&prev.gray, &cur.gray)?;
        let moving = threshold(&diff, p.frame_diff_threshold, 255, ThresholdType::Binary);
        let density = box_filter(&moving, p.motion_filter_size);
        let motion = threshold(&density, p.motion_threshold, 255, ThresholdType::Binary);
        let size = self.weights.width;
        let mask = dilate(&motion, size, size);

        let found = self.target_search(&mask)?;
        if found.is_none() {
            tracing::debug!("relocalization found no match");
        }
        Ok(found.map(|(position, _)| position))
    }

    /// Best NCC match of the appearance template over the non-zero pixels of
    /// `mask`, if it beats the relocalization threshold.
    pub fn target_search(&self, mask: &GrayImage) -> Result<Option<(Point2<f32>, f32)>> {
        let cur = self.current_frame()?;
        let template = self
            .appearance
            .as_ref()
            .or(self.template.as_ref())
            .ok_or_else(|| VideoError::TrackingError("no appearance template".to_string()))?;
        if mask.dimensions() != cur.gray.dimensions() {
            return Err(VideoError::SizeMismatch(format!(
                "search mask of {:?} on frame of {:?}",
                mask.dimensions(),
                cur.gray.dimensions()
            )));
        }

        let width = mask.width() as usize;
        let image = cur.base();
        let cancel = &self.cancel;
        let row_best: Vec<Option<(Point2<f32>, f32)>> = mask
            .as_raw()
            .par_chunks(width)
            .enumerate()
            .map(|(y, row)| -> Result<Option<(Point2<f32>, f32)>> {
                if cancel.load(Ordering::Relaxed) {
                    return Ok(None);
                }
                let mut best: Option<(Point2<f32>, f32)> = None;
                for (x, _) in row.iter().enumerate().filter(|&(_, &m)| m != 0) {
                    let p = Point2::new(x as f32, y as f32);
                    let score = match_at(image, template, &self.weights, p.x, p.y)?;
                    if best.map_or(true, |(_, s)| score > s) {
                        best = Some((p, score));
                    }
                }
                Ok(best)
            })
            .collect::<Result<_>>()?;

        if cancel.swap(false, Ordering::Relaxed) {
            tracing::debug!("target search cancelled");
            return Ok(None);
        }
        let best = row_best
            .into_iter()
            .flatten()
            .fold(None, |acc: Option<(Point2<f32>, f32)>, c| match acc {
                Some(a) if a.1 >= c.1 => Some(a),
                _ => Some(c),
            });
        Ok(best.filter(|(_, score)| *score > self.params.relocalization_threshold))
    }

    /// Heading of the dark half of the target around `pos`: principal axis
    /// of the radially weighted dark pixels, plus a fixed quarter turn
    /// correction. `None` when no dark pixel is in reach.
    pub fn compute_heading(&self, pos: &Point2<f32>) -> Option<f32> {
        let frame = self.current.as_ref()?;
        let patch = sample_patch(frame.base(), pos.x, pos.y, self.weights.width);
        let size = patch.width;

        let mut sw = 0.0f64;
        let (mut mx, mut my) = (0.0f64, 0.0f64);
        for y in 0..size {
            for x in 0..size {
                if patch.get(x, y) < self.params.heading_threshold {
                    let w = self.weights.get(x, y) as f64;
                    sw += w;
                    mx += w * x as f64;
                    my += w * y as f64;
                }
            }
        }
        if sw < 1e-6 {
            return None;
        }
        mx /= sw;
        my /= sw;

        let mut cov = Matrix2::<f64>::zeros();
        for y in 0..size {
            for x in 0..size {
                if patch.get(x, y) < self.params.heading_threshold {
                    let w = self.weights.get(x, y) as f64;
                    let dx = x as f64 - mx;
                    let dy = y as f64 - my;
                    cov[(0, 0)] += w * dx * dx;
                    cov[(0, 1)] += w * dx * dy;
                    cov[(1, 1)] += w * dy * dy;
                }
            }
        }
        cov[(1, 0)] = cov[(0, 1)];
        let svd = (cov / sw).svd(true, false);
        let u = svd.u?;
        let axis = u.column(0);
        Some(wrap_angle(axis[1].atan2(axis[0]) as f32 + FRAC_PI_4))
    }

    /// Go back to the state recorded at `timestamp_ms`. Returns false when
    /// no entry that old remains.
    pub fn rewind(&mut self, timestamp_ms: u64) -> bool {
        self.history.rewind(timestamp_ms);
        match self.history.last() {
            Some(e) => {
                self.position = e.position;
                self.heading = e.orientation_rad;
                self.error = e.error;
                true
            }
            None => false,
        }
    }
}
