//! Robot tracking in unwarped floor video
//!
//! A KLT tracker follows a circular target mounted on the robot, scores every
//! frame against an appearance template and relocalizes from frame
//! differences after the target is lost.

pub mod optical_flow;
pub mod robot;
pub mod track_log;
pub mod tracking;

pub use optical_flow::*;
pub use robot::*;
pub use track_log::*;
pub use tracking::*;

pub type Result<T> = std::result::Result<T, VideoError>;

#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("Image size mismatch: {0}")]
    SizeMismatch(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tracking error: {0}")]
    TrackingError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] cv_core::Error),
}

impl From<cv_imgproc::ImgprocError> for VideoError {
    fn from(e: cv_imgproc::ImgprocError) -> Self {
        Self::Core(e.into())
    }
}
