use std::collections::{BTreeMap, BTreeSet};

use cv_calib3d::find_homography;
use nalgebra::{Matrix3, Point2};
use serde::{Deserialize, Serialize};

use crate::{Result, StitchError};

/// Homography taking ground-plane pixels of `camera2_id` into the
/// ground-plane frame of `camera1_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomographyEdge {
    pub camera1_id: String,
    pub camera2_id: String,
    pub homography: Matrix3<f64>,
    /// Image files the correspondences were picked on, kept for display.
    #[serde(default)]
    pub camera1_image: Option<String>,
    #[serde(default)]
    pub camera2_image: Option<String>,
}

impl HomographyEdge {
    pub fn new(camera1_id: impl Into<String>, camera2_id: impl Into<String>, homography: Matrix3<f64>) -> Self {
        Self {
            camera1_id: camera1_id.into(),
            camera2_id: camera2_id.into(),
            homography,
            camera1_image: None,
            camera2_image: None,
        }
    }

    /// Estimate the edge from matching points picked in both plane images.
    pub fn from_correspondences(
        camera1_id: impl Into<String>,
        camera2_id: impl Into<String>,
        points1: &[Point2<f64>],
        points2: &[Point2<f64>],
    ) -> Result<Self> {
        let h = find_homography(points2, points1)?;
        Ok(Self::new(camera1_id, camera2_id, h))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingGraph {
    pub edges: Vec<HomographyEdge>,
}

impl MappingGraph {
    pub fn new(edges: Vec<HomographyEdge>) -> Self {
        Self { edges }
    }

    pub fn add_edge(&mut self, edge: HomographyEdge) {
        self.edges.push(edge);
    }

    fn mentions(&self, id: &str) -> bool {
        self.is_base(id) || self.is_ref(id)
    }

    /// Some other camera is mapped into `id`.
    pub fn is_base(&self, id: &str) -> bool {
        self.edges.iter().any(|e| e.camera1_id == id)
    }

    /// `id` is mapped into some other camera.
    pub fn is_ref(&self, id: &str) -> bool {
        self.edges.iter().any(|e| e.camera2_id == id)
    }

    /// A single position needs no mapping; otherwise every position must take
    /// part in at least one edge.
    pub fn check_mapping_is_complete<S: AsRef<str>>(&self, ids: &[S]) -> bool {
        ids.len() <= 1 || ids.iter().all(|id| self.mentions(id.as_ref()))
    }

    /// Positions other cameras map into that are never mapped themselves.
    pub fn find_root<S: AsRef<str>>(&self, ids: &[S]) -> Vec<String> {
        ids.iter()
            .map(AsRef::as_ref)
            .filter(|id| self.is_base(id) && !self.is_ref(id))
            .map(str::to_string)
            .collect()
    }

    /// Every mapped position reaches `root`.
    pub fn check_root_mapping<S: AsRef<str>>(&self, root: &str, ids: &[S]) -> bool {
        ids.iter()
            .map(AsRef::as_ref)
            .filter(|id| *id != root && self.is_ref(id))
            .all(|id| self.find_chain(id, root).is_some())
    }

    /// Cameras visited walking from `from` up to `root`, excluding `from` and
    /// ending with `root`. Empty when `from` is the root.
    pub fn find_chain(&self, from: &str, root: &str) -> Option<Vec<String>> {
        if from == root {
            return Some(Vec::new());
        }
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        // (camera, index of the next outgoing edge to try)
        let mut stack: Vec<(&str, usize)> = vec![(from, 0)];
        visited.insert(from);

        while let Some((cur, next)) = stack.last_mut() {
            let cur: &str = *cur;
            let found = self.edges[*next..]
                .iter()
                .position(|e| e.camera2_id == cur && !visited.contains(e.camera1_id.as_str()));
            match found {
                Some(offset) => {
                    let edge = &self.edges[*next + offset];
                    *next += offset + 1;
                    let to = edge.camera1_id.as_str();
                    if to == root {
                        let mut chain: Vec<String> = stack[1..].iter().map(|(id, _)| id.to_string()).collect();
                        chain.push(root.to_string());
                        return Some(chain);
                    }
                    visited.insert(to);
                    stack.push((to, 0));
                }
                None => {
                    stack.pop();
                }
            }
        }
        None
    }

    fn edge(&self, camera1_id: &str, camera2_id: &str) -> Option<&HomographyEdge> {
        self.edges
            .iter()
            .find(|e| e.camera1_id == camera1_id && e.camera2_id == camera2_id)
    }

    /// Homography taking `reference` plane pixels into the frame of the last
    /// camera of `chain`.
    pub fn compute_transform<S: AsRef<str>>(&self, reference: &str, chain: &[S]) -> Result<Matrix3<f64>> {
        let mut transform = Matrix3::identity();
        let mut cur = reference;
        for next in chain.iter().map(AsRef::as_ref) {
            let edge = self.edge(next, cur).ok_or_else(|| StitchError::MissingEdge {
                from: cur.to_string(),
                to: next.to_string(),
            })?;
            transform = edge.homography * transform;
            cur = next;
        }
        Ok(transform)
    }

    /// Whether following edges from some camera leads back to it.
    pub fn detect_cycle(&self) -> bool {
        let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for e in &self.edges {
            adjacency
                .entry(e.camera2_id.as_str())
                .or_default()
                .push(e.camera1_id.as_str());
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Open,
            Done,
        }
        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        for &start in adjacency.keys() {
            if marks.contains_key(start) {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
            marks.insert(start, Mark::Open);
            while let Some((node, idx)) = stack.last_mut() {
                let succ = adjacency.get(*node).and_then(|v| v.get(*idx)).copied();
                *idx += 1;
                match succ {
                    Some(s) => match marks.get(s) {
                        Some(Mark::Open) => return true,
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(s, Mark::Open);
                            stack.push((s, 0));
                        }
                    },
                    None => {
                        marks.insert(*node, Mark::Done);
                        stack.pop();
                    }
                }
            }
        }
        false
    }
}
