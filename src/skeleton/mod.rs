mod mediapipe;
mod trajectory;

pub use trajectory::load_trajectory;

use ndarray::{s, Array3, ArrayView2};
use serde::Serialize;
use std::{collections::BTreeMap, collections::HashSet, path::Path};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SkeletonError {
    #[error("Unknown tracker type: {0}")]
    UnknownTracker(String),
    #[error("Failed to read trajectory file {path:?}: {reason}")]
    ReadFailed { path: String, reason: String },
    #[error("Trajectory array must be frames x joints x 3, got shape {0:?}")]
    BadShape(Vec<usize>),
    #[error("{joints} joints do not match any marker layout, expected one of {expected:?}")]
    JointCountMismatch { joints: usize, expected: Vec<usize> },
}

impl SkeletonError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, SkeletonError::UnknownTracker(_))
    }
}

#[derive(Debug, Clone)]
pub struct MarkerGroup {
    pub name: String,
    pub markers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SegmentDef {
    pub name: String,
    pub proximal: String,
    pub distal: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SegmentConnection {
    pub proximal: String,
    pub distal: String,
}

/// Marker layout and bone connectivity of one tracker.
#[derive(Debug, Clone)]
pub struct SkeletonTopology {
    groups: Vec<MarkerGroup>,
    segments: Vec<SegmentDef>,
}

/// Document consumed by the browser viewer.
#[derive(Debug, Serialize)]
pub struct SkeletonData {
    pub markers: Vec<String>,
    pub trajectories: BTreeMap<String, Vec<Vec<[f64; 3]>>>,
    pub segments: BTreeMap<String, SegmentConnection>,
    pub num_frames: usize,
}

impl SkeletonTopology {
    pub fn new(groups: Vec<MarkerGroup>, segments: Vec<SegmentDef>) -> Self {
        Self { groups, segments }
    }

    pub fn for_tracker(tracker_type: &str) -> Result<Self, SkeletonError> {
        match tracker_type {
            "mediapipe" => Ok(mediapipe::topology()),
            other => Err(SkeletonError::UnknownTracker(other.to_string())),
        }
    }

    pub fn groups(&self) -> &[MarkerGroup] {
        &self.groups
    }

    pub fn segments(&self) -> &[SegmentDef] {
        &self.segments
    }

    /// Joint counts that land on a group boundary, e.g. body only or body + hands.
    pub fn accepted_joint_counts(&self) -> Vec<usize> {
        self.groups
            .iter()
            .scan(0, |total, group| {
                *total += group.markers.len();
                Some(*total)
            })
            .collect()
    }

    /// Splits the joint axis into marker groups, in order, and builds the viewer document.
    pub fn integrate(&self, data: &Array3<f64>) -> Result<SkeletonData, SkeletonError> {
        let (num_frames, joints, _) = data.dim();
        let expected = self.accepted_joint_counts();
        if !expected.contains(&joints) {
            return Err(SkeletonError::JointCountMismatch { joints, expected });
        }

        let mut markers = Vec::with_capacity(joints);
        let mut trajectories = BTreeMap::new();
        let mut start = 0;
        for group in &self.groups {
            if start >= joints {
                break;
            }
            let end = start + group.markers.len();
            let frames: Vec<Vec<[f64; 3]>> = data
                .slice(s![.., start..end, ..])
                .outer_iter()
                .map(frame_points)
                .collect();
            trajectories.insert(group.name.clone(), frames);
            markers.extend(group.markers.iter().cloned());
            start = end;
        }

        let present: HashSet<&str> = markers.iter().map(String::as_str).collect();
        let segments = self
            .segments
            .iter()
            .filter(|s| present.contains(s.proximal.as_str()) && present.contains(s.distal.as_str()))
            .map(|s| {
                (
                    s.name.clone(),
                    SegmentConnection {
                        proximal: s.proximal.clone(),
                        distal: s.distal.clone(),
                    },
                )
            })
            .collect();

        Ok(SkeletonData {
            markers,
            trajectories,
            segments,
            num_frames,
        })
    }
}

fn frame_points(frame: ArrayView2<f64>) -> Vec<[f64; 3]> {
    frame
        .outer_iter()
        .map(|point| [point[0], point[1], point[2]])
        .collect()
}

/// Loads the trajectory file fresh and shapes it for the configured tracker.
pub fn load_skeleton_data(path: &Path, tracker_type: &str) -> Result<SkeletonData, SkeletonError> {
    let topology = SkeletonTopology::for_tracker(tracker_type)?;
    let data = load_trajectory(path)?;
    topology.integrate(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_unknown_tracker_is_client_error() {
        let err = SkeletonTopology::for_tracker("openpose").unwrap_err();
        assert!(err.is_client_error());
        assert_eq!(err.to_string(), "Unknown tracker type: openpose");
    }

    #[test]
    fn test_accepted_joint_counts() {
        let topology = SkeletonTopology::for_tracker("mediapipe").unwrap();
        assert_eq!(topology.accepted_joint_counts(), vec![33, 54, 75, 543]);
    }

    #[test]
    fn test_integrate_body_only() {
        let topology = SkeletonTopology::for_tracker("mediapipe").unwrap();
        let data = Array3::from_shape_fn((4, 33, 3), |(f, j, c)| (f * 100 + j * 3 + c) as f64);

        let doc = topology.integrate(&data).unwrap();

        assert_eq!(doc.num_frames, 4);
        assert_eq!(doc.markers.len(), 33);
        assert_eq!(doc.trajectories.keys().collect::<Vec<_>>(), vec!["body"]);
        assert_eq!(doc.trajectories["body"][2][1], [203.0, 204.0, 205.0]);
        assert_eq!(
            doc.segments["left_thigh"],
            SegmentConnection {
                proximal: "left_hip".to_string(),
                distal: "left_knee".to_string()
            }
        );
        assert!(!doc.segments.contains_key("left_hand_thumb_1"));
    }

    #[test]
    fn test_integrate_full_holistic() {
        let topology = SkeletonTopology::for_tracker("mediapipe").unwrap();
        let data = Array3::<f64>::zeros((2, 543, 3));

        let doc = topology.integrate(&data).unwrap();

        assert_eq!(doc.markers.len(), 543);
        assert_eq!(doc.trajectories["face"][0].len(), 468);
        assert_eq!(doc.trajectories["right_hand"][1].len(), 21);
        assert!(doc.segments.contains_key("right_hand_pinky_4"));
    }

    #[test]
    fn test_integrate_rejects_odd_joint_count() {
        let topology = SkeletonTopology::for_tracker("mediapipe").unwrap();
        let data = Array3::<f64>::zeros((2, 40, 3));

        assert!(matches!(
            topology.integrate(&data),
            Err(SkeletonError::JointCountMismatch { joints: 40, .. })
        ));
    }

    #[test]
    fn test_nan_serializes_as_null() {
        let topology = SkeletonTopology::for_tracker("mediapipe").unwrap();
        let mut data = Array3::<f64>::zeros((1, 33, 3));
        data[[0, 0, 0]] = f64::NAN;

        let json = serde_json::to_value(topology.integrate(&data).unwrap()).unwrap();

        assert!(json["trajectories"]["body"][0][0][0].is_null());
        assert_eq!(json["num_frames"], 1);
    }
}
