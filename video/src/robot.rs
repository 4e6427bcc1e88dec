use nalgebra::{Point2, Rotation2, Vector2};
use serde::{Deserialize, Serialize};

use crate::{Result, VideoError};

/// Physical robot dimensions in centimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotMetrics {
    pub radius: f64,
    pub height: f64,
    /// Distance from the robot centre to the brush bar.
    pub brush_bar_offset: f64,
    pub brush_bar_width: f64,
    /// Tracked target position relative to the robot centre, in the robot
    /// frame (x forward).
    pub target_offset_x: f64,
    pub target_offset_y: f64,
    /// Heading of the target pattern relative to the robot's forward axis.
    pub target_rotation_deg: f64,
}

impl Default for RobotMetrics {
    fn default() -> Self {
        Self {
            radius: 17.0,
            height: 9.0,
            brush_bar_offset: 4.0,
            brush_bar_width: 18.0,
            target_offset_x: 0.0,
            target_offset_y: 0.0,
            target_rotation_deg: 0.0,
        }
    }
}

/// [`RobotMetrics`] in ground-plane pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelMetrics {
    pub radius: f32,
    pub height: f32,
    pub brush_bar_offset: f32,
    pub brush_bar_width: f32,
    pub target_offset: Vector2<f32>,
    pub target_rotation_rad: f32,
}

impl RobotMetrics {
    pub fn to_pixels(&self, px_per_cm: f64) -> Result<PixelMetrics> {
        if !px_per_cm.is_finite() || px_per_cm <= 0.0 {
            return Err(VideoError::InvalidParameters(format!(
                "pixel scale must be positive, got {px_per_cm}"
            )));
        }
        if self.radius <= 0.0 {
            return Err(VideoError::InvalidParameters(format!(
                "robot radius must be positive, got {}",
                self.radius
            )));
        }
        let s = |v: f64| (v * px_per_cm) as f32;
        Ok(PixelMetrics {
            radius: s(self.radius),
            height: s(self.height),
            brush_bar_offset: s(self.brush_bar_offset),
            brush_bar_width: s(self.brush_bar_width),
            target_offset: Vector2::new(s(self.target_offset_x), s(self.target_offset_y)),
            target_rotation_rad: self.target_rotation_deg.to_radians() as f32,
        })
    }
}

impl PixelMetrics {
    /// Robot heading for a tracked target heading.
    pub fn robot_heading(&self, target_heading: f32) -> f32 {
        target_heading - self.target_rotation_rad
    }

    /// Robot centre for a target seen at `target` with `target_heading`.
    pub fn robot_centre(&self, target: &Point2<f32>, target_heading: f32) -> Point2<f32> {
        let rot = Rotation2::new(self.robot_heading(target_heading));
        target - rot * self.target_offset
    }

    /// End points of the brush bar, left then right of the forward axis.
    pub fn brush_bar(&self, centre: &Point2<f32>, heading: f32) -> (Point2<f32>, Point2<f32>) {
        let rot = Rotation2::new(heading);
        let mid = centre + rot * Vector2::new(self.brush_bar_offset, 0.0);
        let half = rot * Vector2::new(0.0, self.brush_bar_width * 0.5);
        (mid - half, mid + half)
    }
}
