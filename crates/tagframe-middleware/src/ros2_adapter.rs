//! ROS 2 adapter speaking the rosbridge v2 JSON protocol.
//!
//! [`Ros2Adapter`] bridges between the internal [`EventBus`] and a ROS 2
//! graph reached through `rosbridge_server`:
//!
//! * **Inbound (Camera)** – `publish` ops on `image_rect` become
//!   [`EventPayload::CameraFrame`] events on [`Topic::CameraFrames`].  The
//!   message may carry both halves (`{"image": .., "camera_info": ..}`), or a
//!   bare `sensor_msgs/Image` that is paired with a `camera_info` publish
//!   carrying the identical stamp.
//!
//! * **Inbound (Control)** – `publish` ops on `enable` (`std_msgs/Bool`)
//!   become [`EventPayload::Enable`] events on [`Topic::Enable`].
//!
//! * **Outbound** – detections, poses, the annotated image and per-tag frame
//!   relationships are rendered as `publish` ops on `tag_detections`,
//!   `tag_detections_pose`, `tag_detections_image` and `/tf`.
//!
//! Stamps use the ROS 2 `{sec, nanosec}` layout; leading slashes on topic
//! names are ignored.

use std::sync::{Arc, Mutex, PoisonError};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tagframe_types::{
    CameraFrame, CameraInfo, Event, EventPayload, Header, ImageMessage, Pose, PoseArray,
    StampedTransform, TagDetectionArray, TagError,
};
use tracing::debug;

use crate::adapter::TagAdapter;
use crate::bus::{EventBus, Topic};

/// Maximum pixel payload accepted in a single image message.
///
/// Larger payloads are rejected to prevent memory exhaustion from malformed
/// or malicious frames.
pub const MAX_IMAGE_BYTES: usize = 32 * 1024 * 1024; // 32 MiB

pub const IMAGE_TOPIC: &str = "image_rect";
pub const CAMERA_INFO_TOPIC: &str = "camera_info";
pub const ENABLE_TOPIC: &str = "enable";
pub const DETECTIONS_TOPIC: &str = "tag_detections";
pub const POSES_TOPIC: &str = "tag_detections_pose";
pub const ANNOTATED_IMAGE_TOPIC: &str = "tag_detections_image";
pub const TF_TOPIC: &str = "/tf";

const SOURCE: &str = "tagframe-middleware::ros2";

// ────────────────────────────────────────────────────────────────────────────
// Wire types (inbound)
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RosStamp {
    sec: i64,
    #[serde(default)]
    nanosec: u32,
}

#[derive(Debug, Deserialize)]
struct RosHeader {
    stamp: RosStamp,
    #[serde(default)]
    frame_id: String,
}

#[derive(Debug, Deserialize)]
struct RosImage {
    header: RosHeader,
    height: u32,
    width: u32,
    encoding: String,
    step: u32,
    data: RosBytes,
}

/// `uint8[]` payload: rosbridge sends base64 by default, but plain JSON
/// arrays are accepted as well.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RosBytes {
    Base64(String),
    Array(Vec<u8>),
}

impl RosBytes {
    fn into_bytes(self) -> Result<Vec<u8>, TagError> {
        match self {
            RosBytes::Array(bytes) => Ok(bytes),
            RosBytes::Base64(text) => STANDARD
                .decode(text.as_bytes())
                .map_err(|e| TagError::Parsing(format!("{IMAGE_TOPIC}: invalid base64 data: {e}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RosCameraInfo {
    header: RosHeader,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    width: u32,
    k: Vec<f64>,
    #[serde(default)]
    p: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct RosBool {
    data: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// Adapter
// ────────────────────────────────────────────────────────────────────────────

/// Half of a camera frame waiting for its partner.
#[derive(Debug, Default)]
struct PendingFrame {
    image: Option<ImageMessage>,
    camera_info: Option<CameraInfo>,
}

/// Adapter that translates rosbridge JSON into bus events and back.
pub struct Ros2Adapter {
    bus: Arc<EventBus>,
    pending: Mutex<PendingFrame>,
}

impl Ros2Adapter {
    /// Create a new [`Ros2Adapter`] backed by the given [`EventBus`].
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            pending: Mutex::new(PendingFrame::default()),
        }
    }

    /// Publish a complete camera frame on [`Topic::CameraFrames`].
    pub fn ingest_camera_frame(&self, frame: CameraFrame) -> Result<usize, TagError> {
        let event = Event::now(
            format!("{SOURCE}/{IMAGE_TOPIC}"),
            EventPayload::CameraFrame(Box::new(frame)),
        );
        self.bus.publish_to(Topic::CameraFrames, event)
    }

    /// Publish an enable switch on [`Topic::Enable`].
    pub fn ingest_enable(&self, enabled: bool) -> Result<usize, TagError> {
        let event = Event::now(format!("{SOURCE}/{ENABLE_TOPIC}"), EventPayload::Enable(enabled));
        self.bus.publish_to(Topic::Enable, event)
    }

    /// Store one half of a frame; returns the complete frame once both halves
    /// with the same stamp have arrived.
    fn pair(&self, image: Option<ImageMessage>, info: Option<CameraInfo>) -> Option<CameraFrame> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(image) = image {
            pending.image = Some(image);
        }
        if let Some(info) = info {
            pending.camera_info = Some(info);
        }
        let matched = matches!(
            (&pending.image, &pending.camera_info),
            (Some(image), Some(info)) if image.header.stamp == info.header.stamp
        );
        if !matched {
            return None;
        }
        match (pending.image.take(), pending.camera_info.take()) {
            (Some(image), Some(camera_info)) => Some(CameraFrame { image, camera_info }),
            _ => None,
        }
    }
}

impl TagAdapter for Ros2Adapter {
    fn ingest(&self, frame: &str) -> Result<Option<Topic>, TagError> {
        let value: Value = serde_json::from_str(frame)
            .map_err(|e| TagError::Parsing(format!("rosbridge frame is not JSON: {e}")))?;

        if value.get("op").and_then(Value::as_str) != Some("publish") {
            return Ok(None);
        }
        let topic = value
            .get("topic")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim_start_matches('/');
        let msg = value.get("msg").cloned().unwrap_or(Value::Null);

        match topic {
            IMAGE_TOPIC => {
                let combined = msg.get("image").is_some() && msg.get("camera_info").is_some();
                let frame = if combined {
                    Some(CameraFrame {
                        image: decode_image(msg["image"].clone(), MAX_IMAGE_BYTES)?,
                        camera_info: decode_camera_info(msg["camera_info"].clone())?,
                    })
                } else {
                    self.pair(Some(decode_image(msg, MAX_IMAGE_BYTES)?), None)
                };
                match frame {
                    Some(frame) => {
                        self.ingest_camera_frame(frame)?;
                        Ok(Some(Topic::CameraFrames))
                    }
                    None => Ok(None),
                }
            }
            CAMERA_INFO_TOPIC => match self.pair(None, Some(decode_camera_info(msg)?)) {
                Some(frame) => {
                    self.ingest_camera_frame(frame)?;
                    Ok(Some(Topic::CameraFrames))
                }
                None => Ok(None),
            },
            ENABLE_TOPIC => {
                let flag: RosBool = serde_json::from_value(msg)
                    .map_err(|e| TagError::Parsing(format!("enable: {e}")))?;
                self.ingest_enable(flag.data)?;
                Ok(Some(Topic::Enable))
            }
            other => {
                debug!(topic = other, "ignoring rosbridge publish on unmapped topic");
                Ok(None)
            }
        }
    }

    fn encode(&self, event: &Event) -> Result<Option<String>, TagError> {
        let op = match &event.payload {
            EventPayload::Detections(detections) => {
                publish_op(DETECTIONS_TOPIC, encode_detections(detections))
            }
            EventPayload::Poses(poses) => publish_op(POSES_TOPIC, encode_pose_array(poses)),
            EventPayload::AnnotatedImage(image) => {
                publish_op(ANNOTATED_IMAGE_TOPIC, encode_image(image))
            }
            EventPayload::Transform(transform) => publish_op(
                TF_TOPIC,
                json!({ "transforms": [encode_stamped_transform(transform)] }),
            ),
            _ => return Ok(None),
        };
        serde_json::to_string(&op)
            .map(Some)
            .map_err(|e| TagError::Serialization(e.to_string()))
    }

    /// Subscribe to the camera and control topics and advertise every output.
    fn handshake(&self) -> Vec<String> {
        let ops = [
            json!({ "op": "subscribe", "topic": IMAGE_TOPIC, "type": "sensor_msgs/msg/Image" }),
            json!({ "op": "subscribe", "topic": CAMERA_INFO_TOPIC, "type": "sensor_msgs/msg/CameraInfo" }),
            json!({ "op": "subscribe", "topic": ENABLE_TOPIC, "type": "std_msgs/msg/Bool" }),
            json!({ "op": "advertise", "topic": DETECTIONS_TOPIC, "type": "apriltags_ros/msg/AprilTagDetectionArray" }),
            json!({ "op": "advertise", "topic": POSES_TOPIC, "type": "geometry_msgs/msg/PoseArray" }),
            json!({ "op": "advertise", "topic": ANNOTATED_IMAGE_TOPIC, "type": "sensor_msgs/msg/Image" }),
            json!({ "op": "advertise", "topic": TF_TOPIC, "type": "tf2_msgs/msg/TFMessage" }),
        ];
        ops.iter().map(Value::to_string).collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Decoding
// ────────────────────────────────────────────────────────────────────────────

fn decode_stamp(stamp: &RosStamp) -> Result<DateTime<Utc>, TagError> {
    DateTime::from_timestamp(stamp.sec, stamp.nanosec).ok_or_else(|| {
        TagError::Parsing(format!(
            "stamp {}.{:09} is out of range",
            stamp.sec, stamp.nanosec
        ))
    })
}

fn decode_header(header: &RosHeader) -> Result<Header, TagError> {
    Ok(Header::new(decode_stamp(&header.stamp)?, header.frame_id.clone()))
}

fn decode_image(msg: Value, max_bytes: usize) -> Result<ImageMessage, TagError> {
    let image: RosImage = serde_json::from_value(msg)
        .map_err(|e| TagError::Parsing(format!("{IMAGE_TOPIC}: {e}")))?;
    let data = image.data.into_bytes()?;
    if data.len() > max_bytes {
        return Err(TagError::Parsing(format!(
            "image payload is {} bytes, exceeding the limit of {max_bytes}",
            data.len(),
        )));
    }
    Ok(ImageMessage {
        header: decode_header(&image.header)?,
        width: image.width,
        height: image.height,
        encoding: image.encoding,
        step: image.step,
        data,
    })
}

fn decode_camera_info(msg: Value) -> Result<CameraInfo, TagError> {
    let info: RosCameraInfo = serde_json::from_value(msg)
        .map_err(|e| TagError::Parsing(format!("{CAMERA_INFO_TOPIC}: {e}")))?;
    let k: [f64; 9] = info.k.as_slice().try_into().map_err(|_| {
        TagError::Parsing(format!("camera_info.k has {} entries, expected 9", info.k.len()))
    })?;
    let p: [f64; 12] = if info.p.is_empty() {
        [0.0; 12]
    } else {
        info.p.as_slice().try_into().map_err(|_| {
            TagError::Parsing(format!("camera_info.p has {} entries, expected 12", info.p.len()))
        })?
    };
    Ok(CameraInfo {
        header: decode_header(&info.header)?,
        width: info.width,
        height: info.height,
        k,
        p,
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Encoding
// ────────────────────────────────────────────────────────────────────────────

fn publish_op(topic: &str, msg: Value) -> Value {
    json!({ "op": "publish", "topic": topic, "msg": msg })
}

fn encode_header(header: &Header) -> Value {
    json!({
        "stamp": {
            "sec": header.stamp.timestamp(),
            "nanosec": header.stamp.timestamp_subsec_nanos(),
        },
        "frame_id": header.frame_id,
    })
}

fn encode_pose(pose: &Pose) -> Value {
    let (p, q) = (pose.position, pose.orientation);
    json!({
        "position": { "x": p.x, "y": p.y, "z": p.z },
        "orientation": { "x": q.x, "y": q.y, "z": q.z, "w": q.w },
    })
}

fn encode_detections(array: &TagDetectionArray) -> Value {
    let detections: Vec<Value> = array
        .detections
        .iter()
        .map(|d| {
            json!({
                "id": d.id,
                "size": d.size,
                "pose": {
                    "header": encode_header(&d.pose.header),
                    "pose": encode_pose(&d.pose.pose),
                },
            })
        })
        .collect();
    json!({ "detections": detections })
}

fn encode_pose_array(array: &PoseArray) -> Value {
    json!({
        "header": encode_header(&array.header),
        "poses": array.poses.iter().map(encode_pose).collect::<Vec<_>>(),
    })
}

fn encode_image(image: &ImageMessage) -> Value {
    json!({
        "header": encode_header(&image.header),
        "height": image.height,
        "width": image.width,
        "encoding": image.encoding,
        "is_bigendian": 0,
        "step": image.step,
        "data": image.data,
    })
}

fn encode_stamped_transform(transform: &StampedTransform) -> Value {
    let (t, q) = (transform.transform.translation, transform.transform.rotation);
    json!({
        "header": encode_header(&transform.header),
        "child_frame_id": transform.child_frame_id,
        "transform": {
            "translation": { "x": t.x, "y": t.y, "z": t.z },
            "rotation": { "x": q.x, "y": q.y, "z": q.z, "w": q.w },
        },
    })
}
