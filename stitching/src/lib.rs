//! Resolution of pairwise camera homographies into a single floor-plan frame.

pub mod floor_plan;
pub mod graph;

pub use floor_plan::{FloorPlan, FloorPlanBuilder, PlaneView, StitchTransform, MAX_FLOOR_PLAN_DIMENSION};
pub use graph::{HomographyEdge, MappingGraph};

pub type Result<T> = std::result::Result<T, StitchError>;

#[derive(Debug, thiserror::Error)]
pub enum StitchError {
    #[error("camera mapping is incomplete: every camera position needs a homography")]
    MappingIncomplete,

    #[error("need one root camera, found {0}")]
    RootCount(usize),

    #[error("no homography chain from camera '{0}' to the root camera")]
    BrokenChain(String),

    #[error("camera mapping contains a cycle")]
    Cycle,

    #[error("no homography maps camera '{from}' into camera '{to}'")]
    MissingEdge { from: String, to: String },

    #[error("floor plan of {width}x{height} pixels exceeds the {limit} pixel limit")]
    CanvasTooLarge { width: u32, height: u32, limit: u32 },

    #[error("no image for camera '{0}'")]
    MissingView(String),

    #[error(transparent)]
    Core(#[from] cv_core::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}
