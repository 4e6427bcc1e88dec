use std::collections::BTreeMap;
use std::path::Path;

use cv_calib3d::{
    align_ground_plane, composite_image_bounding_box, create_composite_image, unwarp_ground_plane,
    BoundingBox, GroundPlaneWarp,
};
use image::GrayImage;
use nalgebra::{Matrix3, Vector2};
use serde::{Deserialize, Serialize};

use crate::graph::MappingGraph;
use crate::{Result, StitchError};

/// Resolved placement of one camera's ground-plane image in the floor plan:
/// floor-plan pixel = `transform * p + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StitchTransform {
    pub transform: Matrix3<f64>,
    pub offset: Vector2<f64>,
}

impl StitchTransform {
    pub fn identity() -> Self {
        Self {
            transform: Matrix3::identity(),
            offset: Vector2::zeros(),
        }
    }
}

/// A camera image together with the warp that takes it onto the floor.
#[derive(Debug, Clone)]
pub struct PlaneView {
    pub image: GrayImage,
    pub warp: GroundPlaneWarp,
}

impl PlaneView {
    pub fn new(image: GrayImage, warp: GroundPlaneWarp) -> Self {
        Self { image, warp }
    }

    pub fn unwarp(&self) -> Result<GrayImage> {
        Ok(unwarp_ground_plane(&self.image, &self.warp)?)
    }
}

#[derive(Debug, Clone)]
pub struct FloorPlan {
    pub image: GrayImage,
    pub root_id: String,
    pub transforms: BTreeMap<String, StitchTransform>,
    /// Position of the canvas' (0, 0) in the root camera's plane frame.
    pub canvas_origin: Vector2<f64>,
}

impl FloorPlan {
    pub fn save_png(&self, path: impl AsRef<Path>) -> Result<()> {
        self.image.save_with_format(path, image::ImageFormat::Png)?;
        Ok(())
    }

    /// Composite per-camera masks on the layout of this floor plan.
    pub fn create_floor_mask(&self, masks: &BTreeMap<String, PlaneView>) -> Result<GrayImage> {
        let mut ids: Vec<&String> = self.transforms.keys().collect();
        // root first, like the floor plan itself
        ids.sort_by_key(|id| **id != self.root_id);

        let mask_for = |id: &String| {
            masks
                .get(id)
                .ok_or_else(|| StitchError::MissingView(id.clone()))
        };
        if self.transforms.len() == 1 {
            return mask_for(&self.root_id)?.unwarp();
        }

        let size = self.image.dimensions();
        let mut canvas = GrayImage::new(size.0, size.1);
        for id in ids {
            let plane = mask_for(id)?.unwarp()?;
            let placed = place(&self.transforms[id], &plane, size)?;
            canvas = create_composite_image(&placed, &canvas)?;
        }
        Ok(canvas)
    }
}

fn place(t: &StitchTransform, plane: &GrayImage, size: (u32, u32)) -> Result<GrayImage> {
    Ok(align_ground_plane(
        &t.transform,
        plane,
        size,
        Vector2::zeros(),
        -t.offset,
    )?)
}

/// Largest floor-plan side, in pixels, a builder accepts by default.
pub const MAX_FLOOR_PLAN_DIMENSION: u32 = 8192;

#[derive(Debug, Clone, Copy)]
pub struct FloorPlanBuilder {
    max_dimension: u32,
}

impl Default for FloorPlanBuilder {
    fn default() -> Self {
        Self {
            max_dimension: MAX_FLOOR_PLAN_DIMENSION,
        }
    }
}

impl FloorPlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject canvases wider or taller than `max_dimension` pixels.
    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    /// Resolve every camera into the root camera's frame and paint all
    /// ground-plane images onto one canvas, root first.
    pub fn create_floor_plan(
        &self,
        views: &BTreeMap<String, PlaneView>,
        graph: &MappingGraph,
    ) -> Result<FloorPlan> {
        let ids: Vec<&str> = views.keys().map(String::as_str).collect();
        if ids.is_empty() {
            return Err(StitchError::RootCount(0));
        }
        if let [only] = ids.as_slice() {
            tracing::info!(root = *only, "single camera floor plan");
            return Ok(FloorPlan {
                image: views[*only].unwarp()?,
                transforms: BTreeMap::from([(only.to_string(), StitchTransform::identity())]),
                root_id: only.to_string(),
                canvas_origin: Vector2::zeros(),
            });
        }

        if !graph.check_mapping_is_complete(&ids) {
            return Err(StitchError::MappingIncomplete);
        }
        if graph.detect_cycle() {
            return Err(StitchError::Cycle);
        }
        let roots = graph.find_root(&ids);
        if roots.len() != 1 {
            return Err(StitchError::RootCount(roots.len()));
        }
        let root = roots[0].clone();
        let root_view = views
            .get(&root)
            .ok_or_else(|| StitchError::MissingView(root.clone()))?;

        let mut placed: Vec<(String, Matrix3<f64>, GrayImage)> = Vec::with_capacity(ids.len());
        placed.push((root.clone(), Matrix3::identity(), root_view.unwarp()?));
        for &id in ids.iter().filter(|id| **id != root) {
            let chain = graph
                .find_chain(id, &root)
                .ok_or_else(|| StitchError::BrokenChain(id.to_string()))?;
            let transform = graph.compute_transform(id, &chain)?;
            tracing::debug!(camera = id, ?chain, "camera chain resolved");
            placed.push((id.to_string(), transform, views[id].unwarp()?));
        }

        let mut bbox = BoundingBox::empty();
        for (_, transform, plane) in &placed {
            bbox = composite_image_bounding_box(transform, plane.dimensions(), &bbox)?;
        }
        let origin = bbox.position();
        let size = bbox.dimension();
        if size.0 > self.max_dimension || size.1 > self.max_dimension {
            return Err(StitchError::CanvasTooLarge {
                width: size.0,
                height: size.1,
                limit: self.max_dimension,
            });
        }

        let mut canvas = GrayImage::new(size.0, size.1);
        let mut transforms = BTreeMap::new();
        for (id, transform, plane) in &placed {
            let t = StitchTransform {
                transform: *transform,
                offset: -origin,
            };
            let aligned = place(&t, plane, size)?;
            canvas = create_composite_image(&aligned, &canvas)?;
            transforms.insert(id.clone(), t);
        }

        tracing::info!(root = %root, cameras = placed.len(), width = size.0, height = size.1, "floor plan created");
        Ok(FloorPlan {
            image: canvas,
            root_id: root,
            transforms,
            canvas_origin: origin,
        })
    }
}
