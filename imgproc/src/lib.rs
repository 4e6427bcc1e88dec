pub mod convolve;
pub mod float_image;
pub mod geometry;
pub mod morph;
pub mod resize;
pub mod template_matching;
pub mod threshold;

pub use convolve::*;
pub use float_image::*;
pub use geometry::*;
pub use morph::*;
pub use resize::*;
pub use template_matching::*;
pub use threshold::*;

pub type Result<T> = std::result::Result<T, ImgprocError>;

#[derive(Debug, thiserror::Error)]
pub enum ImgprocError {
    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Algorithm error: {0}")]
    AlgorithmError(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

impl From<ImgprocError> for cv_core::Error {
    fn from(e: ImgprocError) -> Self {
        match e {
            ImgprocError::DimensionMismatch(m) => cv_core::Error::DimensionMismatch(m),
            ImgprocError::ImageError(m) => cv_core::Error::InvalidInput(m),
            ImgprocError::AlgorithmError(m) => cv_core::Error::AlgorithmError(m),
        }
    }
}

pub fn validate_image_size(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(ImgprocError::DimensionMismatch(
            "Image dimensions must be non-zero".into(),
        ));
    }
    Ok(())
}
