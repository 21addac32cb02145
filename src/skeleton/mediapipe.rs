//! MediaPipe holistic landmark layout as written by the 3D reconstruction step:
//! body, left hand, right hand, then face, concatenated along the joint axis.

use super::{MarkerGroup, SegmentDef, SkeletonTopology};

pub const BODY_LANDMARKS: [&str; 33] = [
    "nose",
    "left_eye_inner",
    "left_eye",
    "left_eye_outer",
    "right_eye_inner",
    "right_eye",
    "right_eye_outer",
    "left_ear",
    "right_ear",
    "mouth_left",
    "mouth_right",
    "left_shoulder",
    "right_shoulder",
    "left_elbow",
    "right_elbow",
    "left_wrist",
    "right_wrist",
    "left_pinky",
    "right_pinky",
    "left_index",
    "right_index",
    "left_thumb",
    "right_thumb",
    "left_hip",
    "right_hip",
    "left_knee",
    "right_knee",
    "left_ankle",
    "right_ankle",
    "left_heel",
    "right_heel",
    "left_foot_index",
    "right_foot_index",
];

pub const HAND_LANDMARKS: [&str; 21] = [
    "wrist",
    "thumb_cmc",
    "thumb_mcp",
    "thumb_ip",
    "thumb_tip",
    "index_finger_mcp",
    "index_finger_pip",
    "index_finger_dip",
    "index_finger_tip",
    "middle_finger_mcp",
    "middle_finger_pip",
    "middle_finger_dip",
    "middle_finger_tip",
    "ring_finger_mcp",
    "ring_finger_pip",
    "ring_finger_dip",
    "ring_finger_tip",
    "pinky_mcp",
    "pinky_pip",
    "pinky_dip",
    "pinky_tip",
];

pub const FACE_LANDMARK_COUNT: usize = 468;

const BODY_SEGMENTS: [(&str, &str, &str); 22] = [
    ("head", "left_ear", "right_ear"),
    ("mouth", "mouth_left", "mouth_right"),
    ("shoulders", "left_shoulder", "right_shoulder"),
    ("hips", "left_hip", "right_hip"),
    ("left_torso", "left_shoulder", "left_hip"),
    ("right_torso", "right_shoulder", "right_hip"),
    ("left_upper_arm", "left_shoulder", "left_elbow"),
    ("right_upper_arm", "right_shoulder", "right_elbow"),
    ("left_forearm", "left_elbow", "left_wrist"),
    ("right_forearm", "right_elbow", "right_wrist"),
    ("left_hand", "left_wrist", "left_index"),
    ("right_hand", "right_wrist", "right_index"),
    ("left_thigh", "left_hip", "left_knee"),
    ("right_thigh", "right_hip", "right_knee"),
    ("left_shin", "left_knee", "left_ankle"),
    ("right_shin", "right_knee", "right_ankle"),
    ("left_foot", "left_ankle", "left_foot_index"),
    ("right_foot", "right_ankle", "right_foot_index"),
    ("left_heel", "left_ankle", "left_heel"),
    ("right_heel", "right_ankle", "right_heel"),
    ("left_sole", "left_heel", "left_foot_index"),
    ("right_sole", "right_heel", "right_foot_index"),
];

/// Bones of each finger, wrist outward.
const FINGER_CHAINS: [(&str, [usize; 5]); 5] = [
    ("thumb", [0, 1, 2, 3, 4]),
    ("index", [0, 5, 6, 7, 8]),
    ("middle", [0, 9, 10, 11, 12]),
    ("ring", [0, 13, 14, 15, 16]),
    ("pinky", [0, 17, 18, 19, 20]),
];

fn hand_group(side: &str) -> MarkerGroup {
    MarkerGroup {
        name: format!("{}_hand", side),
        markers: HAND_LANDMARKS
            .iter()
            .map(|landmark| format!("{}_hand_{}", side, landmark))
            .collect(),
    }
}

fn hand_segments(side: &str) -> Vec<SegmentDef> {
    FINGER_CHAINS
        .iter()
        .flat_map(|(finger, chain)| {
            chain.windows(2).enumerate().map(move |(bone, pair)| SegmentDef {
                name: format!("{}_hand_{}_{}", side, finger, bone + 1),
                proximal: format!("{}_hand_{}", side, HAND_LANDMARKS[pair[0]]),
                distal: format!("{}_hand_{}", side, HAND_LANDMARKS[pair[1]]),
            })
        })
        .collect()
}

pub fn topology() -> SkeletonTopology {
    let groups = vec![
        MarkerGroup {
            name: "body".to_string(),
            markers: BODY_LANDMARKS.iter().map(|m| m.to_string()).collect(),
        },
        hand_group("left"),
        hand_group("right"),
        MarkerGroup {
            name: "face".to_string(),
            markers: (0..FACE_LANDMARK_COUNT)
                .map(|i| format!("face_{:04}", i))
                .collect(),
        },
    ];

    let mut segments: Vec<SegmentDef> = BODY_SEGMENTS
        .iter()
        .map(|(name, proximal, distal)| SegmentDef {
            name: name.to_string(),
            proximal: proximal.to_string(),
            distal: distal.to_string(),
        })
        .collect();
    segments.extend(hand_segments("left"));
    segments.extend(hand_segments("right"));

    SkeletonTopology::new(groups, segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_sizes() {
        let topology = topology();
        let sizes: Vec<usize> = topology.groups().iter().map(|g| g.markers.len()).collect();
        assert_eq!(sizes, vec![33, 21, 21, 468]);
    }

    #[test]
    fn test_every_segment_names_known_markers() {
        let topology = topology();
        let markers: Vec<&String> = topology
            .groups()
            .iter()
            .flat_map(|g| g.markers.iter())
            .collect();

        for segment in topology.segments() {
            assert!(markers.contains(&&segment.proximal), "{}", segment.proximal);
            assert!(markers.contains(&&segment.distal), "{}", segment.distal);
        }
    }

    #[test]
    fn test_hand_chain_naming() {
        let segments = hand_segments("left");
        assert_eq!(segments.len(), 20);
        assert_eq!(segments[0].name, "left_hand_thumb_1");
        assert_eq!(segments[0].proximal, "left_hand_wrist");
        assert_eq!(segments[0].distal, "left_hand_thumb_cmc");
    }
}
