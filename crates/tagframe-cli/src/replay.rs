//! Recorded-session replay.
//!
//! A recording is a JSON-lines file; each non-blank line is one
//! [`ReplayRecord`]: a camera frame together with the markers a detector
//! reported for it.
//!
//! ```json
//! {"frame": {"image": {...}, "camera_info": {...}}, "detections": [{"id": 5, ...}]}
//! ```
//!
//! The detections feed a [`ScriptedDetector`], so replaying a recording
//! drives the full pipeline without a pixel decoder.  `frame` may be
//! omitted when only detections are needed (live mode).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tagframe_perception::detector::ScriptedDetector;
use tagframe_types::{CameraFrame, RawDetection, TagFamily};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<CameraFrame>,
    #[serde(default)]
    pub detections: Vec<RawDetection>,
}

/// Parse a whole recording.  Errors name the offending line (1-based).
pub fn parse(contents: &str) -> Result<Vec<ReplayRecord>, String> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .map_err(|e| format!("Invalid replay record on line {}: {}", index + 1, e))
        })
        .collect()
}

pub fn load(path: &Path) -> Result<Vec<ReplayRecord>, String> {
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read recording at {}: {}", path.display(), e))?;
    parse(&raw)
}

/// Split `records` into a detector that replays their detections (one batch
/// per record, in order) and the frames to feed through the pipeline.
pub fn into_session(
    family: TagFamily,
    records: Vec<ReplayRecord>,
) -> (ScriptedDetector, Vec<CameraFrame>) {
    let mut detector = ScriptedDetector::new(family);
    let mut frames = Vec::with_capacity(records.len());
    for record in records {
        detector.push_batch(record.detections);
        if let Some(frame) = record.frame {
            frames.push(frame);
        }
    }
    (detector, frames)
}
