pub mod geometry;
pub mod report;
pub mod runtime;

pub use geometry::*;
pub use report::*;
pub use runtime::*;

pub use nalgebra::{Matrix3, Point2, Point3, Vector2, Vector3};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Calibration error: {0}")]
    CalibrationError(String),

    #[error("Algorithm error: {0}")]
    AlgorithmError(String),

    #[error("Numeric failure: {0}")]
    NumericFailure(String),

    #[error("Cannot read image '{path}': {reason}")]
    ImageUnreadable { path: String, reason: String },

    #[error("Chessboard with {rows} x {cols} inner corners not found ({found} corners detected)")]
    ChessboardNotFound {
        rows: usize,
        cols: usize,
        found: usize,
    },

    #[error("{0}")]
    NotCalibrated(String),

    #[error("Missing entry: {0}")]
    MissingEntry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_calibrated(camera: impl AsRef<str>) -> Self {
        Self::NotCalibrated(format!(
            "camera '{}' is not correctly calibrated",
            camera.as_ref()
        ))
    }
}
