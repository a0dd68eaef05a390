//! Frame graph and frame rebasing.
//!
//! Maintains a graph of named reference frames and the rigid-body transforms
//! that relate them.  Given any two frame names the engine composes a chain
//! of transforms via BFS, walking edges in either direction (a reverse edge
//! contributes its inverse).
//!
//! The pipeline only talks to this module through two capabilities:
//! [`FrameLookup`] (query a relationship) and [`FrameBroadcaster`] (publish
//! a new one).  [`TfEngine`] is the in-process implementation; anything that
//! can answer "where is frame B in frame A right now" can stand in for it.
//!
//! # Example
//!
//! ```rust
//! use tagframe_perception::transform::TfEngine;
//! use tagframe_types::{Quaternion, Transform3D, Vec3};
//!
//! let mut tf = TfEngine::new();
//! // The mast sits 2 m up from the dock; the camera 0.3 m further along the mast.
//! tf.set_transform("dock", "mast",
//!     Transform3D::new(Vec3::new(0.0, 0.0, 2.0), Quaternion::identity()));
//! tf.set_transform("mast", "camera",
//!     Transform3D::new(Vec3::new(0.0, 0.0, 0.3), Quaternion::identity()));
//!
//! let camera_in_dock = tf.lookup("dock", "camera").unwrap();
//! assert!((camera_in_dock.translation.z - 2.3).abs() < 1e-9);
//!
//! let dock_in_camera = tf.lookup("camera", "dock").unwrap();
//! assert!((dock_in_camera.translation.z + 2.3).abs() < 1e-9);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use tagframe_types::{StampedTransform, TagError, Transform3D};

// ────────────────────────────────────────────────────────────────────────────
// Capabilities
// ────────────────────────────────────────────────────────────────────────────

/// Query the spatial relationship between two named frames.
pub trait FrameLookup: Send + Sync {
    /// Return T_target_source: the transform that maps points expressed in
    /// `source` into `target`, valid at `stamp`.
    ///
    /// Must not block; an unresolvable relationship is reported immediately
    /// as [`TagError::TransformUnavailable`].
    fn lookup_transform(
        &self,
        target: &str,
        source: &str,
        stamp: DateTime<Utc>,
    ) -> Result<Transform3D, TagError>;
}

/// Publish a named frame so that later lookups can reference it.
pub trait FrameBroadcaster: Send + Sync {
    fn send_transform(&self, transform: StampedTransform) -> Result<(), TagError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Rebasing
// ────────────────────────────────────────────────────────────────────────────

/// Express a camera-relative `pose` in the output frame.
///
/// `camera_to_output` is T_output_camera as returned by
/// [`FrameLookup::lookup_transform`]`(output, camera, ..)`.  The result is
/// `camera_to_output ∘ pose` with its quaternion renormalised.
pub fn rebase(pose: &Transform3D, camera_to_output: &Transform3D) -> Transform3D {
    camera_to_output.compose(*pose).normalized()
}

// ────────────────────────────────────────────────────────────────────────────
// TfEngine
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Edge {
    transform: Transform3D,
    /// `None` for static relationships, which never go stale.
    stamp: Option<DateTime<Utc>>,
}

/// A graph of named reference frames and the [`Transform3D`]s that relate
/// them.
///
/// Every registered relationship is stored in both directions so lookups may
/// traverse the tree upwards as well as downwards.
#[derive(Debug, Default)]
pub struct TfEngine {
    /// `edges[a][b]` is T_a_b.
    edges: HashMap<String, HashMap<String, Edge>>,
    /// Stamped edges older than this (relative to the query stamp) are
    /// ignored.  `None` keeps every edge forever.
    max_age: Option<Duration>,
}

impl TfEngine {
    /// Create an empty TF engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ignore dynamic transforms older than `max_age` at lookup time.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Register or update a relationship that holds at all times.
    pub fn set_transform(&mut self, parent_frame: &str, child_frame: &str, transform: Transform3D) {
        self.insert(parent_frame, child_frame, Edge { transform, stamp: None });
    }

    /// Register or update the pose of `child_frame_id` in `header.frame_id`.
    pub fn set_stamped_transform(&mut self, transform: &StampedTransform) {
        self.insert(
            &transform.header.frame_id,
            &transform.child_frame_id,
            Edge {
                transform: transform.transform,
                stamp: Some(transform.header.stamp),
            },
        );
    }

    /// `true` if `frame` appears in any registered relationship.
    pub fn has_frame(&self, frame: &str) -> bool {
        self.edges.contains_key(frame)
    }

    /// Compose T_target_source along the shortest chain of edges, ignoring
    /// staleness.  Returns `None` if no path exists.
    pub fn lookup(&self, target_frame: &str, source_frame: &str) -> Option<Transform3D> {
        self.lookup_at(target_frame, source_frame, None)
    }

    fn insert(&mut self, parent: &str, child: &str, edge: Edge) {
        let reverse = Edge {
            transform: edge.transform.inverse(),
            stamp: edge.stamp,
        };
        self.edges
            .entry(parent.to_string())
            .or_default()
            .insert(child.to_string(), edge);
        self.edges
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string(), reverse);
    }

    fn is_fresh(&self, edge: &Edge, at: Option<DateTime<Utc>>) -> bool {
        match (edge.stamp, self.max_age, at) {
            (Some(stamp), Some(max_age), Some(at)) => at - stamp <= max_age,
            _ => true,
        }
    }

    fn lookup_at(
        &self,
        target_frame: &str,
        source_frame: &str,
        at: Option<DateTime<Utc>>,
    ) -> Option<Transform3D> {
        if target_frame == source_frame {
            return Some(Transform3D::identity());
        }

        // BFS from the target; each queue item carries T_target_current.
        let mut queue: VecDeque<(&str, Transform3D)> = VecDeque::new();
        let mut visited: HashSet<&str> = HashSet::new();

        queue.push_back((target_frame, Transform3D::identity()));
        visited.insert(target_frame);

        while let Some((current, accumulated)) = queue.pop_front() {
            let Some(neighbours) = self.edges.get(current) else {
                continue;
            };
            for (next, edge) in neighbours {
                if visited.contains(next.as_str()) || !self.is_fresh(edge, at) {
                    continue;
                }
                let composed = accumulated.compose(edge.transform);
                if next == source_frame {
                    return Some(composed.normalized());
                }
                visited.insert(next.as_str());
                queue.push_back((next.as_str(), composed));
            }
        }

        None
    }
}

impl FrameLookup for TfEngine {
    fn lookup_transform(
        &self,
        target: &str,
        source: &str,
        stamp: DateTime<Utc>,
    ) -> Result<Transform3D, TagError> {
        self.lookup_at(target, source, Some(stamp))
            .ok_or_else(|| TagError::TransformUnavailable {
                target_frame: target.to_string(),
                source_frame: source.to_string(),
                reason: if self.has_frame(target) && self.has_frame(source) {
                    "frames are not connected".to_string()
                } else {
                    "frame does not exist".to_string()
                },
            })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SharedTfEngine
// ────────────────────────────────────────────────────────────────────────────

/// A [`TfEngine`] shared between the component that broadcasts frames and
/// the one that looks them up.  Clones share the same graph.
#[derive(Debug, Clone, Default)]
pub struct SharedTfEngine {
    inner: Arc<RwLock<TfEngine>>,
}

impl SharedTfEngine {
    pub fn new(engine: TfEngine) -> Self {
        Self {
            inner: Arc::new(RwLock::new(engine)),
        }
    }

    /// Register a static relationship (see [`TfEngine::set_transform`]).
    pub fn set_transform(&self, parent_frame: &str, child_frame: &str, transform: Transform3D) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_transform(parent_frame, child_frame, transform);
    }
}

impl FrameLookup for SharedTfEngine {
    fn lookup_transform(
        &self,
        target: &str,
        source: &str,
        stamp: DateTime<Utc>,
    ) -> Result<Transform3D, TagError> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup_transform(target, source, stamp)
    }
}

impl FrameBroadcaster for SharedTfEngine {
    fn send_transform(&self, transform: StampedTransform) -> Result<(), TagError> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_stamped_transform(&transform);
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_1_SQRT_2, FRAC_PI_2};
    use tagframe_types::{Header, Quaternion, Vec3};

    fn translation(x: f64, y: f64, z: f64) -> Transform3D {
        Transform3D::new(Vec3::new(x, y, z), Quaternion::identity())
    }

    fn assert_transform_close(a: &Transform3D, b: &Transform3D) {
        assert!(
            a.translation.sub(b.translation).norm() < 1e-9,
            "translation {:?} != {:?}",
            a.translation,
            b.translation
        );
        assert!(
            a.rotation.angle_to(b.rotation) < 1e-9,
            "rotation {:?} != {:?}",
            a.rotation,
            b.rotation
        );
    }

    // ── rebase ──────────────────────────────────────────────────────────────

    #[test]
    fn rebase_applies_output_transform_first() {
        // Camera sits 1 m above the map origin, looking along map +X after a
        // 90° yaw.  A tag 2 m along camera +X ends up 2 m along map +Y.
        let yaw = Quaternion::from_axis_angle(Vec3::new(0.0, 0.0, 1.0), FRAC_PI_2);
        let map_from_camera = Transform3D::new(Vec3::new(0.0, 0.0, 1.0), yaw);
        let tag_in_camera = translation(2.0, 0.0, 0.0);

        let tag_in_map = rebase(&tag_in_camera, &map_from_camera);
        assert_transform_close(&tag_in_map, &Transform3D::new(Vec3::new(0.0, 2.0, 1.0), yaw));
    }

    #[test]
    fn rebase_is_not_commutative() {
        let yaw = Quaternion::from_axis_angle(Vec3::new(0.0, 0.0, 1.0), FRAC_PI_2);
        let a = Transform3D::new(Vec3::new(1.0, 0.0, 0.0), yaw);
        let b = translation(1.0, 0.0, 0.0);
        let ab = rebase(&b, &a);
        let ba = rebase(&a, &b);
        assert_transform_close(&ab, &Transform3D::new(Vec3::new(1.0, 1.0, 0.0), yaw));
        assert_transform_close(&ba, &Transform3D::new(Vec3::new(2.0, 0.0, 0.0), yaw));
        assert!(ab.translation.sub(ba.translation).norm() > 1e-3);
    }

    #[test]
    fn rebase_with_inverse_restores_pose() {
        let pose = Transform3D::new(
            Vec3::new(0.2, -0.1, 1.4),
            Quaternion::from_axis_angle(Vec3::new(0.3, 1.0, -0.2), 0.8),
        );
        let t = Transform3D::new(
            Vec3::new(-1.0, 4.0, 0.5),
            Quaternion::from_axis_angle(Vec3::new(1.0, 0.0, 1.0), -2.1),
        );
        let back = rebase(&rebase(&pose, &t), &t.inverse());
        assert_transform_close(&back, &pose);
    }

    #[test]
    fn rebase_renormalises_drifted_quaternion() {
        let drifted = Transform3D::new(Vec3::zero(), Quaternion::new(1.001, 0.0, 0.0, 0.0));
        let out = rebase(&translation(0.0, 0.0, 1.0), &drifted);
        assert!((out.rotation.norm() - 1.0).abs() < 1e-12);
    }

    // ── TfEngine ────────────────────────────────────────────────────────────

    #[test]
    fn lookup_same_frame_returns_identity() {
        let tf = TfEngine::new();
        assert_eq!(tf.lookup("map", "map"), Some(Transform3D::identity()));
    }

    #[test]
    fn lookup_composed_chain() {
        let mut tf = TfEngine::new();
        tf.set_transform("map", "robot_base", translation(1.0, 0.0, 0.0));
        tf.set_transform("robot_base", "camera", translation(0.5, 0.0, 0.0));

        let t = tf.lookup("map", "camera").unwrap();
        assert!((t.translation.x - 1.5).abs() < 1e-9);
    }

    #[test]
    fn lookup_walks_edges_backwards() {
        let q90z = Quaternion::new(FRAC_1_SQRT_2, 0.0, 0.0, FRAC_1_SQRT_2);
        let mut tf = TfEngine::new();
        tf.set_transform("map", "robot_base", Transform3D::new(Vec3::new(1.0, 0.0, 0.0), q90z));

        let forward = tf.lookup("map", "robot_base").unwrap();
        let backward = tf.lookup("robot_base", "map").unwrap();
        assert_transform_close(&backward, &forward.inverse());
    }

    #[test]
    fn lookup_between_siblings() {
        let mut tf = TfEngine::new();
        tf.set_transform("base", "camera", translation(0.0, 0.0, 1.0));
        tf.set_transform("base", "lidar", translation(0.0, 0.0, 2.0));

        let t = tf.lookup("camera", "lidar").unwrap();
        assert!((t.translation.z - 1.0).abs() < 1e-9);
    }

    #[test]
    fn lookup_respects_rotation_in_chain() {
        let q90z = Quaternion::new(FRAC_1_SQRT_2, 0.0, 0.0, FRAC_1_SQRT_2);
        let mut tf = TfEngine::new();
        tf.set_transform("map", "robot_base", Transform3D::new(Vec3::zero(), q90z));
        tf.set_transform("robot_base", "camera", translation(1.0, 0.0, 0.0));

        let t = tf.lookup("map", "camera").unwrap();
        assert_transform_close(&t, &Transform3D::new(Vec3::new(0.0, 1.0, 0.0), q90z));
    }

    #[test]
    fn lookup_no_path_returns_none() {
        let mut tf = TfEngine::new();
        tf.set_transform("map", "robot_base", translation(1.0, 0.0, 0.0));
        tf.set_transform("odom", "wheel", translation(1.0, 0.0, 0.0));
        assert!(tf.lookup("map", "wheel").is_none());
        assert!(tf.lookup("map", "ghost_frame").is_none());
    }

    #[test]
    fn set_transform_overrides_previous() {
        let mut tf = TfEngine::new();
        tf.set_transform("map", "sensor", translation(1.0, 0.0, 0.0));
        tf.set_transform("map", "sensor", translation(5.0, 0.0, 0.0));

        assert!((tf.lookup("map", "sensor").unwrap().translation.x - 5.0).abs() < 1e-9);
        assert!((tf.lookup("sensor", "map").unwrap().translation.x + 5.0).abs() < 1e-9);
    }

    #[test]
    fn lookup_transform_reports_unavailable() {
        let tf = TfEngine::new();
        let err = tf.lookup_transform("map", "camera", Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            TagError::TransformUnavailable { ref target_frame, ref source_frame, .. }
                if target_frame == "map" && source_frame == "camera"
        ));
    }

    #[test]
    fn stale_dynamic_transform_is_ignored() {
        let mut tf = TfEngine::new().with_max_age(Duration::milliseconds(100));
        let stamp = Utc::now();
        tf.set_stamped_transform(&StampedTransform {
            header: Header::new(stamp, "map"),
            child_frame_id: "camera".to_string(),
            transform: translation(1.0, 0.0, 0.0),
        });

        assert!(tf.lookup_transform("map", "camera", stamp).is_ok());
        let later = stamp + Duration::seconds(1);
        assert!(tf.lookup_transform("map", "camera", later).is_err());
    }

    #[test]
    fn static_transform_never_goes_stale() {
        let mut tf = TfEngine::new().with_max_age(Duration::milliseconds(1));
        tf.set_transform("map", "camera", translation(1.0, 0.0, 0.0));
        let much_later = Utc::now() + Duration::days(1);
        assert!(tf.lookup_transform("map", "camera", much_later).is_ok());
    }

    // ── SharedTfEngine ──────────────────────────────────────────────────────

    #[test]
    fn shared_engine_sees_broadcast_frames() {
        let shared = SharedTfEngine::default();
        shared.set_transform("map", "camera", translation(0.0, 0.0, 1.0));

        let broadcaster = shared.clone();
        let stamp = Utc::now();
        broadcaster
            .send_transform(StampedTransform {
                header: Header::new(stamp, "camera"),
                child_frame_id: "tag_5".to_string(),
                transform: translation(0.0, 0.0, 2.0),
            })
            .unwrap();

        let t = shared.lookup_transform("map", "tag_5", stamp).unwrap();
        assert!((t.translation.z - 3.0).abs() < 1e-9);
    }
}
