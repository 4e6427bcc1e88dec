//! Session configuration shared by the calibration, stitching and tracking
//! stages, loaded from one JSON document.

use std::path::Path;

use cv_calib3d::{CalibrationGrid, IntrinsicOptions};
use cv_stitching::MappingGraph;
use cv_video::{KltTracker, RobotMetrics, TrackerParams};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Cannot read session file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed session config: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] cv_core::Error),

    #[error(transparent)]
    Video(#[from] cv_video::VideoError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub grid: CalibrationGrid,
    #[serde(default)]
    pub intrinsic: IntrinsicOptions,
    #[serde(default)]
    pub tracker: TrackerParams,
    #[serde(default)]
    pub robot: RobotMetrics,
    /// Homographies between camera positions for floor-plan stitching.
    #[serde(default)]
    pub mapping: MappingGraph,
}

impl SessionConfig {
    pub fn new(grid: CalibrationGrid) -> Self {
        Self {
            grid,
            intrinsic: IntrinsicOptions::default(),
            tracker: TrackerParams::default(),
            robot: RobotMetrics::default(),
            mapping: MappingGraph::default(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.grid.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json(&text)?;
        tracing::debug!(path = %path.as_ref().display(), "session config loaded");
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Tracker sized for the robot at the ground-plane scale `px_per_cm`.
    pub fn tracker(&self, px_per_cm: f64) -> Result<KltTracker> {
        let metrics = self.robot.to_pixels(px_per_cm)?;
        Ok(KltTracker::new(metrics.radius, self.tracker)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_uses_defaults() {
        let config = SessionConfig::from_json(
            r#"{
                "grid": {"rows": 6, "columns": 8, "square_size_cm": 2.5},
                "tracker": {"loss_threshold": 0.3},
                "robot": {"radius": 12.0}
            }"#,
        )
        .unwrap();
        assert_eq!(config.grid, CalibrationGrid::new(6, 8, 2.5));
        assert_eq!(config.tracker.loss_threshold, 0.3);
        assert_eq!(config.tracker.relocalization_threshold, 0.7);
        assert_eq!(config.robot.radius, 12.0);
        assert_eq!(config.intrinsic, IntrinsicOptions::default());
        assert!(config.mapping.edges.is_empty());
    }

    #[test]
    fn bad_grid_is_rejected() {
        let err = SessionConfig::from_json(r#"{"grid": {"rows": 2, "columns": 8, "square_size_cm": 2.5}}"#);
        assert!(matches!(err, Err(SessionError::Core(_))));
        assert!(matches!(SessionConfig::from_json("{"), Err(SessionError::Json(_))));
    }

    #[test]
    fn saves_and_loads() {
        let mut config = SessionConfig::new(CalibrationGrid::new(6, 8, 2.5));
        config.intrinsic = config.intrinsic.with_fix_principal_point(true);
        config.mapping.add_edge(cv_stitching::HomographyEdge::new(
            "ceiling",
            "door",
            cv_core::Matrix3::new(1.0, 0.0, 12.0, 0.0, 1.0, -4.0, 0.0, 0.0, 1.0),
        ));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        config.save(&path).unwrap();
        assert_eq!(SessionConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn tracker_radius_follows_scale() {
        let config = SessionConfig::new(CalibrationGrid::new(6, 8, 2.5));
        let tracker = config.tracker(0.5).unwrap();
        assert_eq!(tracker.radius(), 8.5);
        assert!(config.tracker(-1.0).is_err());
    }
}
