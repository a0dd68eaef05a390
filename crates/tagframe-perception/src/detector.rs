//! Detector boundary.
//!
//! Finding and decoding markers in pixels is outside this crate; a backend
//! only has to implement [`TagDetector`].  [`ScriptedDetector`] replays
//! pre-computed detections, one batch per frame, and backs both the replay
//! mode of the CLI and the pipeline tests.

use std::collections::VecDeque;

use image::GrayImage;
use tagframe_types::{RawDetection, TagFamily};

/// A marker detector for one tag family.
pub trait TagDetector: Send {
    /// The family this detector decodes.
    fn family(&self) -> TagFamily;

    /// Detect all markers in `gray`, in any order.
    fn detect(&mut self, gray: &GrayImage) -> Vec<RawDetection>;
}

/// Returns queued detection batches in order, ignoring pixel content.
///
/// Detections tagged with a family other than [`TagDetector::family`] are
/// dropped, mirroring a real decoder that cannot see them.  An exhausted
/// queue yields empty batches.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDetector {
    family: TagFamily,
    batches: VecDeque<Vec<RawDetection>>,
}

impl ScriptedDetector {
    pub fn new(family: TagFamily) -> Self {
        Self {
            family,
            batches: VecDeque::new(),
        }
    }

    /// Queue the detections reported for the next unclaimed frame.
    pub fn push_batch(&mut self, batch: Vec<RawDetection>) {
        self.batches.push_back(batch);
    }

    /// Builder form of [`push_batch`](Self::push_batch).
    pub fn with_batch(mut self, batch: Vec<RawDetection>) -> Self {
        self.push_batch(batch);
        self
    }

    pub fn pending(&self) -> usize {
        self.batches.len()
    }
}

impl TagDetector for ScriptedDetector {
    fn family(&self) -> TagFamily {
        self.family
    }

    fn detect(&mut self, _gray: &GrayImage) -> Vec<RawDetection> {
        let family = self.family;
        self.batches
            .pop_front()
            .unwrap_or_default()
            .into_iter()
            .filter(|d| d.family.is_none_or(|f| f == family))
            .collect()
    }
}
