//! [`TagDetectorNode`] – the per-frame pipeline.
//!
//! For every camera frame that arrives while the node is enabled:
//!
//! 1. **Convert** – decode the image to RGB and derive the grayscale copy the
//!    detector works on.
//! 2. **Calibrate** – pick the pinhole parameters with the configured
//!    [`CameraModel`].
//! 3. **Anchor** – resolve the sensor frame (override or image header) and,
//!    if an output frame is configured, look up the sensor → output
//!    relationship for the image stamp.  A missing relationship skips the
//!    whole frame.
//! 4. **Detect** – run the injected [`TagDetector`]; markers absent from the
//!    [`TagCatalog`] are skipped with a rate-limited warning.
//! 5. **Reconstruct** – outline each retained marker, recover its pose,
//!    rebase it into the output frame and record a frame relationship named
//!    after the catalog entry.
//! 6. **Publish** – broadcast the relationships, then publish detections,
//!    poses and the annotated image exactly once, even when nothing was
//!    found.
//!
//! Steps 1–5 live in [`TagDetectorNode::process_frame`], which touches
//! neither the bus nor the broadcasters; [`TagDetectorNode::handle_frame`]
//! adds error reporting and step 6.
//!
//! # Enable switch
//!
//! The node starts disabled unless configured otherwise.  While disabled,
//! frames are dropped without any output.  The switch is an
//! `Arc<AtomicBool>` shared with whoever holds [`TagDetectorNode::enable_handle`];
//! `Enable` events on the bus flip it too.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use tagframe_middleware::{EventBus, Topic, TopicReceiver};
use tagframe_perception::{
    CameraModel, FrameBroadcaster, FrameLookup, TagCatalog, TagDetector, image_ops, pose, rebase,
};
use tagframe_types::{
    CameraFrame, Event, EventPayload, Header, ImageMessage, Pose, PoseArray, PoseStamped,
    StampedTransform, TagDetection, TagDetectionArray, TagError,
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::throttle::Throttle;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

const SOURCE: &str = "tagframe-runtime::detector_node";

/// How often [`TagDetectorNode::run`] re-checks the shutdown flag while idle.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and results
// ─────────────────────────────────────────────────────────────────────────────

/// Per-node settings that are not part of the tag catalog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectorNodeConfig {
    pub camera_model: CameraModel,
    /// Replaces the image header's frame id when set.
    pub sensor_frame_id: Option<String>,
    /// Frame all published poses are expressed in; the sensor frame if `None`.
    pub output_frame_id: Option<String>,
    pub start_enabled: bool,
}

/// Everything a single frame produces.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutput {
    pub detections: TagDetectionArray,
    pub poses: PoseArray,
    pub annotated_image: ImageMessage,
    /// One relationship per retained marker, in detection order.
    pub transforms: Vec<StampedTransform>,
}

/// What [`TagDetectorNode::handle_frame`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The node is disabled; the frame was dropped.
    Disabled,
    /// Outputs were published carrying `detections` markers.
    Published { detections: usize },
    /// The frame could not be processed; nothing was published.
    Skipped,
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus broadcaster
// ─────────────────────────────────────────────────────────────────────────────

/// [`FrameBroadcaster`] that publishes each relationship on
/// [`Topic::Transforms`].
#[derive(Debug, Clone)]
pub struct BusBroadcaster {
    bus: Arc<EventBus>,
}

impl BusBroadcaster {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl FrameBroadcaster for BusBroadcaster {
    fn send_transform(&self, transform: StampedTransform) -> Result<(), TagError> {
        let event = Event::now(SOURCE, EventPayload::Transform(transform));
        self.bus.publish_to(Topic::Transforms, event).map(|_| ())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TagDetectorNode
// ─────────────────────────────────────────────────────────────────────────────

/// The frame pipeline orchestrator.
pub struct TagDetectorNode {
    catalog: TagCatalog,
    config: DetectorNodeConfig,
    detector: Box<dyn TagDetector>,
    lookup: Arc<dyn FrameLookup>,
    broadcasters: Vec<Arc<dyn FrameBroadcaster>>,
    bus: Arc<EventBus>,
    enabled: Arc<AtomicBool>,
    unknown_tag_warning: Throttle,
    transform_warning: Throttle,
    frames_rx: TopicReceiver,
    enable_rx: TopicReceiver,
}

impl TagDetectorNode {
    /// Build a node that reads from and publishes to `bus`.
    ///
    /// Subscriptions to [`Topic::CameraFrames`] and [`Topic::Enable`] are
    /// taken here, so events published before [`run`](Self::run) starts are
    /// not lost.  Frame relationships go to a [`BusBroadcaster`]; add more
    /// destinations with [`with_broadcaster`](Self::with_broadcaster).
    pub fn new(
        catalog: TagCatalog,
        config: DetectorNodeConfig,
        detector: Box<dyn TagDetector>,
        lookup: Arc<dyn FrameLookup>,
        bus: Arc<EventBus>,
    ) -> Self {
        info!(
            tags = catalog.len(),
            family = %detector.family(),
            camera_model = ?config.camera_model,
            sensor_frame = ?config.sensor_frame_id,
            output_frame = ?config.output_frame_id,
            enabled = config.start_enabled,
            "tag detector node configured"
        );
        let frames_rx = bus.subscribe_to(Topic::CameraFrames);
        let enable_rx = bus.subscribe_to(Topic::Enable);
        Self {
            catalog,
            enabled: Arc::new(AtomicBool::new(config.start_enabled)),
            config,
            detector,
            lookup,
            broadcasters: vec![Arc::new(BusBroadcaster::new(Arc::clone(&bus)))],
            bus,
            unknown_tag_warning: Throttle::default(),
            transform_warning: Throttle::default(),
            frames_rx,
            enable_rx,
        }
    }

    /// Also send every frame relationship to `broadcaster`.
    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn FrameBroadcaster>) -> Self {
        self.broadcasters.push(broadcaster);
        self
    }

    /// Shared handle to the enable switch.
    pub fn enable_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.enabled)
    }

    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            info!(enabled, "tag detection switched");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Per-frame processing
    // -------------------------------------------------------------------------

    /// Run steps 1–5 on `frame`.
    ///
    /// Returns `Ok(None)` while disabled.
    ///
    /// # Errors
    ///
    /// * [`TagError::FrameConversion`] – the image cannot be decoded.
    /// * [`TagError::TransformUnavailable`] – an output frame is configured
    ///   but not connected to the sensor frame at the image stamp.
    pub fn process_frame(&mut self, frame: &CameraFrame) -> Result<Option<FrameOutput>, TagError> {
        if !self.is_enabled() {
            return Ok(None);
        }

        let mut canvas = image_ops::to_rgb(&frame.image)?;
        let gray = image_ops::to_gray(&canvas);
        let camera = self.config.camera_model.select(&frame.camera_info);

        let stamp = frame.image.header.stamp;
        let sensor_frame = self
            .config
            .sensor_frame_id
            .clone()
            .unwrap_or_else(|| frame.image.header.frame_id.clone());
        let (header, sensor_to_output) = match &self.config.output_frame_id {
            Some(output_frame) => {
                let transform = self.lookup.lookup_transform(output_frame, &sensor_frame, stamp)?;
                (Header::new(stamp, output_frame.clone()), Some(transform))
            }
            None => (Header::new(stamp, sensor_frame), None),
        };

        let raw = self.detector.detect(&gray);
        debug!(count = raw.len(), "tags detected");

        let mut detections = TagDetectionArray::default();
        let mut poses = Vec::with_capacity(raw.len());
        let mut transforms = Vec::with_capacity(raw.len());

        for detection in &raw {
            let Some(description) = self.catalog.lookup(detection.id) else {
                if let Some(suppressed) = self.unknown_tag_warning.check() {
                    warn!(
                        error = %TagError::UnknownMarker(detection.id),
                        suppressed,
                        "skipping detection"
                    );
                }
                continue;
            };

            image_ops::draw_outline(&mut canvas, &detection.corners, detection.center);

            let matrix = pose::reconstruct(detection, description.size, &camera);
            let mut tag_pose = pose::transform_from_matrix(&matrix);
            debug!(id = detection.id, pose = ?tag_pose, "tag pose in sensor frame");
            if let Some(sensor_to_output) = &sensor_to_output {
                tag_pose = rebase(&tag_pose, sensor_to_output);
                debug!(id = detection.id, pose = ?tag_pose, frame = %header.frame_id, "tag pose rebased");
            }

            let tag_pose_msg = Pose::from(tag_pose);
            detections.detections.push(TagDetection {
                id: detection.id,
                size: description.size,
                pose: PoseStamped {
                    header: header.clone(),
                    pose: tag_pose_msg,
                },
            });
            poses.push(tag_pose_msg);
            transforms.push(StampedTransform {
                header: header.clone(),
                child_frame_id: description.frame_name.clone(),
                transform: tag_pose,
            });
        }

        Ok(Some(FrameOutput {
            detections,
            poses: PoseArray { header, poses },
            annotated_image: image_ops::to_message(&canvas, frame.image.header.clone()),
            transforms,
        }))
    }

    /// Process `frame` and publish its outputs.
    ///
    /// Errors are logged (missing transforms rate-limited) and never
    /// propagated.  Each call runs in a `handle_frame` span carrying the
    /// image stamp, which is what the OTLP exporter ships.
    #[instrument(skip_all, fields(stamp = %frame.image.header.stamp))]
    pub fn handle_frame(&mut self, frame: &CameraFrame) -> FrameOutcome {
        match self.process_frame(frame) {
            Ok(None) => FrameOutcome::Disabled,
            Ok(Some(output)) => {
                let detections = output.detections.detections.len();
                self.publish(output);
                FrameOutcome::Published { detections }
            }
            Err(e @ TagError::TransformUnavailable { .. }) => {
                if let Some(suppressed) = self.transform_warning.check() {
                    warn!(error = %e, suppressed, "skipping frame");
                }
                FrameOutcome::Skipped
            }
            Err(e) => {
                error!(error = %e, "failed to process camera frame");
                self.raise_alert(&e);
                FrameOutcome::Skipped
            }
        }
    }

    /// Route one bus event.  Returns the outcome for camera frames.
    pub fn handle_event(&mut self, event: &Event) -> Option<FrameOutcome> {
        match &event.payload {
            EventPayload::CameraFrame(frame) => Some(self.handle_frame(frame)),
            EventPayload::Enable(enabled) => {
                self.set_enabled(*enabled);
                None
            }
            other => {
                debug!(source = %event.source, payload = ?std::mem::discriminant(other), "ignoring event");
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Event loop
    // -------------------------------------------------------------------------

    /// Consume camera frames and enable switches until both topics close or
    /// `shutdown` is raised.  Frames are processed one at a time; enable
    /// switches are applied before any frame that is ready at the same time.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) {
        let mut frames_open = true;
        let mut enable_open = true;
        let mut poll = tokio::time::interval(SHUTDOWN_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("tag detector node running");
        while (frames_open || enable_open) && !shutdown.load(Ordering::Acquire) {
            tokio::select! {
                biased;
                result = self.enable_rx.recv(), if enable_open => {
                    match result {
                        Ok(event) => {
                            self.handle_event(&event);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(lagged_by = n, "enable subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => enable_open = false,
                    }
                }
                result = self.frames_rx.recv(), if frames_open => {
                    match result {
                        Ok(event) => {
                            self.handle_event(&event);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(dropped_frames = n, "camera frame subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => frames_open = false,
                    }
                }
                _ = poll.tick() => {}
            }
        }
        info!("tag detector node stopped");
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    fn publish(&self, output: FrameOutput) {
        for transform in output.transforms {
            for broadcaster in &self.broadcasters {
                if let Err(e) = broadcaster.send_transform(transform.clone()) {
                    debug!(child = %transform.child_frame_id, error = %e, "frame broadcast not delivered");
                }
            }
        }

        // Publishing with nobody listening is not an error for the pipeline.
        let _ = self.bus.publish_to(
            Topic::Detections,
            Event::now(SOURCE, EventPayload::Detections(output.detections)),
        );
        let _ = self.bus.publish_to(
            Topic::Poses,
            Event::now(SOURCE, EventPayload::Poses(output.poses)),
        );
        let _ = self.bus.publish_to(
            Topic::AnnotatedImage,
            Event::now(SOURCE, EventPayload::AnnotatedImage(output.annotated_image)),
        );
    }

    fn raise_alert(&self, error: &TagError) {
        let event = Event::now(
            SOURCE,
            EventPayload::Fault {
                component: "detector_node".to_string(),
                message: error.to_string(),
            },
        );
        let _ = self.bus.publish_to(Topic::SystemAlerts, event);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use image::Rgb;
    use serde_json::json;
    use tagframe_perception::detector::ScriptedDetector;
    use tagframe_perception::{SharedTfEngine, TfEngine};
    use tagframe_types::{CameraInfo, Quaternion, RawDetection, TagFamily, Transform3D, Vec3};

    const WIDTH: u32 = 400;
    const HEIGHT: u32 = 320;

    fn stamp() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn frame() -> CameraFrame {
        CameraFrame {
            image: ImageMessage {
                header: Header::new(stamp(), "camera"),
                width: WIDTH,
                height: HEIGHT,
                encoding: "mono8".to_string(),
                step: WIDTH,
                data: vec![0; (WIDTH * HEIGHT) as usize],
            },
            camera_info: CameraInfo {
                header: Header::new(stamp(), "camera"),
                width: WIDTH,
                height: HEIGHT,
                k: [600.0, 0.0, 320.0, 0.0, 600.0, 240.0, 0.0, 0.0, 1.0],
                p: [0.0; 12],
            },
        }
    }

    /// A 0.2 m tag exactly 1 m in front of the camera.
    fn centred(id: i32) -> RawDetection {
        RawDetection {
            id,
            family: None,
            hamming: 0,
            center: [320.0, 240.0],
            corners: [[260.0, 180.0], [380.0, 180.0], [380.0, 300.0], [260.0, 300.0]],
        }
    }

    fn catalog() -> TagCatalog {
        TagCatalog::build(&[json!({ "id": 5, "size": 0.2 })]).unwrap()
    }

    fn enabled_config() -> DetectorNodeConfig {
        DetectorNodeConfig {
            start_enabled: true,
            ..DetectorNodeConfig::default()
        }
    }

    fn make_node(
        config: DetectorNodeConfig,
        batches: Vec<Vec<RawDetection>>,
        lookup: Arc<dyn FrameLookup>,
    ) -> (Arc<EventBus>, TagDetectorNode) {
        let mut detector = ScriptedDetector::new(TagFamily::Tag36h11);
        for batch in batches {
            detector.push_batch(batch);
        }
        let bus = Arc::new(EventBus::default());
        let node = TagDetectorNode::new(catalog(), config, Box::new(detector), lookup, Arc::clone(&bus));
        (bus, node)
    }

    fn no_frames() -> Arc<dyn FrameLookup> {
        Arc::new(TfEngine::new())
    }

    struct Outputs {
        detections: TopicReceiver,
        poses: TopicReceiver,
        image: TopicReceiver,
        transforms: TopicReceiver,
    }

    impl Outputs {
        fn subscribe(bus: &EventBus) -> Self {
            Self {
                detections: bus.subscribe_to(Topic::Detections),
                poses: bus.subscribe_to(Topic::Poses),
                image: bus.subscribe_to(Topic::AnnotatedImage),
                transforms: bus.subscribe_to(Topic::Transforms),
            }
        }

        fn all_empty(&mut self) -> bool {
            self.detections.try_recv().is_err()
                && self.poses.try_recv().is_err()
                && self.image.try_recv().is_err()
                && self.transforms.try_recv().is_err()
        }
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    // ── process_frame ────────────────────────────────────────────────────────

    #[test]
    fn known_tag_one_metre_ahead() {
        let (_bus, mut node) = make_node(enabled_config(), vec![vec![centred(5)]], no_frames());
        let output = node.process_frame(&frame()).unwrap().unwrap();

        assert_eq!(output.detections.detections.len(), 1);
        let detection = &output.detections.detections[0];
        assert_eq!(detection.id, 5);
        assert_eq!(detection.size, 0.2);
        assert_eq!(detection.pose.header.frame_id, "camera");
        assert_eq!(detection.pose.header.stamp, stamp());

        let p = detection.pose.pose.position;
        assert_close(p.x, 0.0);
        assert_close(p.y, 0.0);
        assert_close(p.z, 1.0);
        assert!(detection.pose.pose.orientation.angle_to(Quaternion::identity()) < 1e-6);

        assert_eq!(output.poses.poses, vec![detection.pose.pose]);
        assert_eq!(output.transforms.len(), 1);
        assert_eq!(output.transforms[0].child_frame_id, "tag_5");
        assert_eq!(output.transforms[0].header.frame_id, "camera");
    }

    #[test]
    fn unknown_tag_yields_no_detections_but_an_image() {
        let (_bus, mut node) = make_node(enabled_config(), vec![vec![centred(9)]], no_frames());
        let output = node.process_frame(&frame()).unwrap().unwrap();

        assert!(output.detections.detections.is_empty());
        assert!(output.poses.poses.is_empty());
        assert!(output.transforms.is_empty());
        assert_eq!(output.annotated_image.width, WIDTH);
        // No outline is drawn for markers outside the catalog.
        assert!(output.annotated_image.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn unknown_tags_do_not_affect_known_ones() {
        let (_bus, mut node) = make_node(
            enabled_config(),
            vec![vec![centred(9), centred(5), centred(11)]],
            no_frames(),
        );
        let output = node.process_frame(&frame()).unwrap().unwrap();
        let ids: Vec<i32> = output.detections.detections.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![5]);
    }

    #[test]
    fn known_tag_outline_is_drawn() {
        let (_bus, mut node) = make_node(enabled_config(), vec![vec![centred(5)]], no_frames());
        let output = node.process_frame(&frame()).unwrap().unwrap();
        let annotated = image_ops::to_rgb(&output.annotated_image).unwrap();
        // Middle of the first edge, (260,180) → (380,180).
        assert_eq!(annotated.get_pixel(320, 180), &Rgb([255, 0, 0]));
        assert_eq!(output.annotated_image.header, frame().image.header);
    }

    #[test]
    fn disabled_node_produces_nothing() {
        let (_bus, mut node) = make_node(
            DetectorNodeConfig::default(),
            vec![vec![centred(5)]],
            no_frames(),
        );
        assert!(!node.is_enabled());
        assert_eq!(node.process_frame(&frame()).unwrap(), None);
    }

    #[test]
    fn sensor_frame_override_labels_outputs() {
        let config = DetectorNodeConfig {
            sensor_frame_id: Some("optical".to_string()),
            ..enabled_config()
        };
        let (_bus, mut node) = make_node(config, vec![vec![centred(5)]], no_frames());
        let output = node.process_frame(&frame()).unwrap().unwrap();
        assert_eq!(output.poses.header.frame_id, "optical");
        assert_eq!(output.transforms[0].header.frame_id, "optical");
    }

    #[test]
    fn output_frame_rebases_poses() {
        let mut tf = TfEngine::new();
        // Camera origin sits 2 m along the map's Z axis.
        tf.set_transform(
            "map",
            "camera",
            Transform3D::new(Vec3::new(0.0, 0.0, 2.0), Quaternion::identity()),
        );
        let config = DetectorNodeConfig {
            output_frame_id: Some("map".to_string()),
            ..enabled_config()
        };
        let (_bus, mut node) = make_node(config, vec![vec![centred(5)]], Arc::new(tf));
        let output = node.process_frame(&frame()).unwrap().unwrap();

        assert_eq!(output.poses.header.frame_id, "map");
        assert_eq!(output.poses.header.stamp, stamp());
        assert_close(output.poses.poses[0].position.z, 3.0);
        assert_eq!(output.transforms[0].header.frame_id, "map");
        assert_close(output.transforms[0].transform.translation.z, 3.0);
    }

    #[test]
    fn missing_output_transform_is_an_error() {
        let config = DetectorNodeConfig {
            output_frame_id: Some("map".to_string()),
            ..enabled_config()
        };
        let (_bus, mut node) = make_node(config, vec![vec![centred(5)]], no_frames());
        let err = node.process_frame(&frame()).unwrap_err();
        assert!(matches!(err, TagError::TransformUnavailable { .. }));
    }

    #[test]
    fn projected_model_reads_projection_matrix() {
        let mut frame = frame();
        // P describes the same camera; K is deliberately wrong.
        frame.camera_info.k = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        frame.camera_info.p = [
            600.0, 0.0, 320.0, 0.0, //
            0.0, 600.0, 240.0, 0.0, //
            0.0, 0.0, 1.0, 0.0,
        ];
        let config = DetectorNodeConfig {
            camera_model: CameraModel::Projected,
            ..enabled_config()
        };
        let (_bus, mut node) = make_node(config, vec![vec![centred(5)]], no_frames());
        let output = node.process_frame(&frame).unwrap().unwrap();
        assert_close(output.poses.poses[0].position.z, 1.0);
    }

    // ── handle_frame / publishing ────────────────────────────────────────────

    #[test]
    fn handle_frame_publishes_each_output_once() {
        let (bus, mut node) = make_node(enabled_config(), vec![vec![centred(5)]], no_frames());
        let mut out = Outputs::subscribe(&bus);

        assert_eq!(node.handle_frame(&frame()), FrameOutcome::Published { detections: 1 });

        let detections = out.detections.try_recv().unwrap();
        assert!(matches!(detections.payload, EventPayload::Detections(ref d) if d.detections.len() == 1));
        assert!(matches!(out.poses.try_recv().unwrap().payload, EventPayload::Poses(_)));
        assert!(matches!(out.image.try_recv().unwrap().payload, EventPayload::AnnotatedImage(_)));
        let EventPayload::Transform(tf) = out.transforms.try_recv().unwrap().payload else {
            panic!("expected a Transform payload");
        };
        assert_eq!(tf.child_frame_id, "tag_5");
        assert_eq!(tf.header.frame_id, "camera");
        assert_eq!(tf.header.stamp, stamp());
        assert!(out.all_empty());
    }

    #[test]
    fn unknown_tag_publishes_image_but_no_broadcast() {
        let (bus, mut node) = make_node(enabled_config(), vec![vec![centred(9)]], no_frames());
        let mut out = Outputs::subscribe(&bus);

        assert_eq!(node.handle_frame(&frame()), FrameOutcome::Published { detections: 0 });
        assert!(out.image.try_recv().is_ok());
        assert!(out.detections.try_recv().is_ok());
        assert!(out.transforms.try_recv().is_err());
    }

    #[test]
    fn empty_frame_still_publishes_once() {
        let (bus, mut node) = make_node(enabled_config(), vec![], no_frames());
        let mut out = Outputs::subscribe(&bus);

        assert_eq!(node.handle_frame(&frame()), FrameOutcome::Published { detections: 0 });
        let EventPayload::Detections(d) = out.detections.try_recv().unwrap().payload else {
            panic!("expected Detections payload");
        };
        assert!(d.detections.is_empty());
        let EventPayload::Poses(p) = out.poses.try_recv().unwrap().payload else {
            panic!("expected Poses payload");
        };
        assert!(p.poses.is_empty());
        assert!(out.image.try_recv().is_ok());
        assert!(out.all_empty());
    }

    #[test]
    fn disabled_node_publishes_nothing() {
        let (bus, mut node) = make_node(
            DetectorNodeConfig::default(),
            vec![vec![centred(5)]],
            no_frames(),
        );
        let mut out = Outputs::subscribe(&bus);
        assert_eq!(node.handle_frame(&frame()), FrameOutcome::Disabled);
        assert!(out.all_empty());
    }

    #[test]
    fn missing_transform_skips_whole_frame() {
        let config = DetectorNodeConfig {
            output_frame_id: Some("map".to_string()),
            ..enabled_config()
        };
        let (bus, mut node) = make_node(config, vec![vec![centred(5)]; 3], no_frames());
        let mut out = Outputs::subscribe(&bus);
        for _ in 0..3 {
            assert_eq!(node.handle_frame(&frame()), FrameOutcome::Skipped);
        }
        assert!(out.all_empty());
    }

    #[test]
    fn conversion_failure_raises_alert() {
        let (bus, mut node) = make_node(enabled_config(), vec![], no_frames());
        let mut out = Outputs::subscribe(&bus);
        let mut alerts = bus.subscribe_to(Topic::SystemAlerts);

        let mut bad = frame();
        bad.image.encoding = "yuv422".to_string();
        assert_eq!(node.handle_frame(&bad), FrameOutcome::Skipped);
        assert!(out.all_empty());
        let EventPayload::Fault { component, message } = alerts.try_recv().unwrap().payload else {
            panic!("expected Fault payload");
        };
        assert_eq!(component, "detector_node");
        assert!(message.contains("yuv422"));
    }

    #[test]
    fn broadcast_frames_become_queryable() {
        let shared = SharedTfEngine::default();
        let (_bus, node) = make_node(enabled_config(), vec![vec![centred(5)]], Arc::new(shared.clone()));
        let mut node = node.with_broadcaster(Arc::new(shared.clone()));

        assert_eq!(node.handle_frame(&frame()), FrameOutcome::Published { detections: 1 });
        let t = shared.lookup_transform("camera", "tag_5", stamp()).unwrap();
        assert_close(t.translation.z, 1.0);
    }

    // ── events ───────────────────────────────────────────────────────────────

    #[test]
    fn handle_frame_opens_a_stamped_span() {
        use std::sync::Mutex;
        use tracing::span::{Attributes, Id};
        use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

        #[derive(Clone, Default)]
        struct SpanLog(Arc<Mutex<Vec<(String, bool)>>>);

        impl<S: tracing::Subscriber> Layer<S> for SpanLog {
            fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
                let meta = attrs.metadata();
                let has_stamp = meta.fields().field("stamp").is_some();
                self.0
                    .lock()
                    .unwrap()
                    .push((meta.name().to_string(), has_stamp));
            }
        }

        let log = SpanLog::default();
        let subscriber = tracing_subscriber::registry().with(log.clone());
        let (_bus, mut node) = make_node(enabled_config(), vec![vec![centred(5)]], no_frames());
        tracing::subscriber::with_default(subscriber, || {
            node.handle_frame(&frame());
        });

        let spans = log.0.lock().unwrap();
        assert!(spans.contains(&("handle_frame".to_string(), true)), "{spans:?}");
    }

    #[test]
    fn handle_event_routes_enable_and_frames() {
        let (_bus, mut node) = make_node(
            DetectorNodeConfig::default(),
            vec![vec![centred(5)]],
            no_frames(),
        );
        let handle = node.enable_handle();

        let frame_event = Event::now("test", EventPayload::CameraFrame(Box::new(frame())));
        assert_eq!(node.handle_event(&frame_event), Some(FrameOutcome::Disabled));

        assert_eq!(node.handle_event(&Event::now("test", EventPayload::Enable(true))), None);
        assert!(handle.load(Ordering::Acquire));
        assert_eq!(
            node.handle_event(&frame_event),
            Some(FrameOutcome::Published { detections: 1 })
        );

        handle.store(false, Ordering::Release);
        assert!(!node.is_enabled());
    }

    #[tokio::test]
    async fn run_loop_processes_bus_traffic_until_shutdown() {
        let (bus, node) = make_node(
            DetectorNodeConfig::default(),
            vec![vec![centred(5)]],
            no_frames(),
        );
        let mut detections = bus.subscribe_to(Topic::Detections);
        let shutdown = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(node.run(Arc::clone(&shutdown)));

        bus.publish_to(Topic::Enable, Event::now("test", EventPayload::Enable(true)))
            .unwrap();
        bus.publish_to(
            Topic::CameraFrames,
            Event::now("test", EventPayload::CameraFrame(Box::new(frame()))),
        )
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), detections.recv())
            .await
            .expect("no detections published")
            .unwrap();
        assert!(matches!(event.payload, EventPayload::Detections(ref d) if d.detections.len() == 1));

        shutdown.store(true, Ordering::Release);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("node did not stop")
            .unwrap();
    }
}
