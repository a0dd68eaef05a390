//! `tagframe-types` – shared data model.
//!
//! Messages mirror their ROS counterparts (`sensor_msgs/Image`,
//! `sensor_msgs/CameraInfo`, `geometry_msgs/PoseStamped`, …) closely enough
//! that the middleware can translate them to rosbridge JSON field-for-field.

pub mod geometry;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use geometry::{Quaternion, Transform3D, Vec3};

// ────────────────────────────────────────────────────────────────────────────
// Sensor messages
// ────────────────────────────────────────────────────────────────────────────

/// Stamp and coordinate frame attached to every timestamped message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub stamp: DateTime<Utc>,
    /// Name of the coordinate frame the data is expressed in.
    pub frame_id: String,
}

impl Header {
    pub fn new(stamp: DateTime<Utc>, frame_id: impl Into<String>) -> Self {
        Self {
            stamp,
            frame_id: frame_id.into(),
        }
    }
}

/// Calibration record published alongside every rectified image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub header: Header,
    pub width: u32,
    pub height: u32,
    /// Intrinsic camera matrix, row-major 3×3.
    pub k: [f64; 9],
    /// Projection matrix of the rectified image, row-major 3×4.
    #[serde(default)]
    pub p: [f64; 12],
}

/// An uncompressed image, laid out like `sensor_msgs/Image`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMessage {
    pub header: Header,
    pub width: u32,
    pub height: u32,
    /// Pixel encoding, e.g. `"rgb8"`, `"bgr8"`, `"mono8"`.
    pub encoding: String,
    /// Row length in bytes.
    pub step: u32,
    pub data: Vec<u8>,
}

/// An image paired with the calibration that was valid when it was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraFrame {
    pub image: ImageMessage,
    pub camera_info: CameraInfo,
}

// ────────────────────────────────────────────────────────────────────────────
// Detection messages
// ────────────────────────────────────────────────────────────────────────────

/// Supported AprilTag code families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TagFamily {
    #[serde(rename = "16h5")]
    Tag16h5,
    #[serde(rename = "25h7")]
    Tag25h7,
    #[serde(rename = "25h9")]
    Tag25h9,
    #[serde(rename = "36h9")]
    Tag36h9,
    #[default]
    #[serde(rename = "36h11")]
    Tag36h11,
}

impl fmt::Display for TagFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TagFamily::Tag16h5 => "16h5",
            TagFamily::Tag25h7 => "25h7",
            TagFamily::Tag25h9 => "25h9",
            TagFamily::Tag36h9 => "36h9",
            TagFamily::Tag36h11 => "36h11",
        };
        f.write_str(name)
    }
}

impl FromStr for TagFamily {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches("tag") {
            "16h5" => Ok(TagFamily::Tag16h5),
            "25h7" => Ok(TagFamily::Tag25h7),
            "25h9" => Ok(TagFamily::Tag25h9),
            "36h9" => Ok(TagFamily::Tag36h9),
            "36h11" => Ok(TagFamily::Tag36h11),
            other => Err(TagError::Config(format!("unknown tag family '{other}'"))),
        }
    }
}

/// One marker as reported by a detector backend, before any pose is known.
///
/// Corners are in pixels and ordered counter-clockwise around the marker,
/// matching the model points `(-s,-s)`, `(s,-s)`, `(s,s)`, `(-s,s)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<TagFamily>,
    /// Number of bits corrected while decoding.
    #[serde(default)]
    pub hamming: u32,
    pub center: [f64; 2],
    pub corners: [[f64; 2]; 4],
}

/// Position and orientation, as in `geometry_msgs/Pose`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub orientation: Quaternion,
}

impl From<Transform3D> for Pose {
    fn from(t: Transform3D) -> Self {
        Self {
            position: t.translation,
            orientation: t.rotation,
        }
    }
}

impl From<Pose> for Transform3D {
    fn from(p: Pose) -> Self {
        Transform3D::new(p.position, p.orientation)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseStamped {
    pub header: Header,
    pub pose: Pose,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseArray {
    pub header: Header,
    pub poses: Vec<Pose>,
}

/// A recognised marker together with its metric pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagDetection {
    pub id: i32,
    pub size: f64,
    pub pose: PoseStamped,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TagDetectionArray {
    pub detections: Vec<TagDetection>,
}

/// Pose of `child_frame_id` expressed in `header.frame_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedTransform {
    pub header: Header,
    pub child_frame_id: String,
    pub transform: Transform3D,
}

// ────────────────────────────────────────────────────────────────────────────
// Bus events
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the headless event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "tagframe-middleware::ros2/image_rect"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Wrap `payload` in a fresh event stamped with the current wall-clock time.
    pub fn now(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// A synchronised image + calibration pair awaiting detection.
    CameraFrame(Box<CameraFrame>),
    /// Enable (`true`) or disable (`false`) frame processing.
    Enable(bool),
    Detections(TagDetectionArray),
    Poses(PoseArray),
    AnnotatedImage(ImageMessage),
    /// A marker frame broadcast for downstream frame lookups.
    Transform(StampedTransform),
    Fault { component: String, message: String },
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error type shared by every tagframe crate.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TagError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Frame Conversion Error: {0}")]
    FrameConversion(String),

    #[error("Transform Unavailable from '{source_frame}' to '{target_frame}': {reason}")]
    TransformUnavailable {
        target_frame: String,
        source_frame: String,
        reason: String,
    },

    #[error("Unknown Marker: no description for tag {0}")]
    UnknownMarker(i32),

    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Parsing Error: {0}")]
    Parsing(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),
}
