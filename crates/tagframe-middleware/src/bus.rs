//! In-process event bus, one broadcast channel per [`Topic`].
//!
//! Each subscriber sees every event published after it subscribed.
//! Publishers never wait: a subscriber that falls behind loses its oldest
//! events and learns about it through [`broadcast::error::RecvError::Lagged`].
//!
//! # Topics
//!
//! | Topic | Direction | Payload |
//! |---|---|---|
//! | [`Topic::CameraFrames`] | in | `EventPayload::CameraFrame` |
//! | [`Topic::Enable`] | in | `EventPayload::Enable` |
//! | [`Topic::Detections`] | out | `EventPayload::Detections` |
//! | [`Topic::Poses`] | out | `EventPayload::Poses` |
//! | [`Topic::AnnotatedImage`] | out | `EventPayload::AnnotatedImage` |
//! | [`Topic::Transforms`] | out | `EventPayload::Transform` |
//! | [`Topic::SystemAlerts`] | out | `EventPayload::Fault` |

use tagframe_types::{Event, TagError};
use tokio::sync::broadcast;

/// Events buffered per topic before slow subscribers start lagging.
const DEFAULT_CAPACITY: usize = 256;

/// Routing key for every event on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Rectified image plus calibration, one event per frame.
    CameraFrames,
    /// Processing on/off switch.
    Enable,
    /// Per-frame detection list.
    Detections,
    /// Per-frame pose list, in the same order as the detections.
    Poses,
    /// The input frame with marker outlines drawn on it.
    AnnotatedImage,
    /// One stamped frame relationship per retained marker.
    Transforms,
    /// Component faults worth surfacing to an operator.
    SystemAlerts,
}

impl Topic {
    /// Topics produced by the detector node.
    pub const OUTBOUND: [Topic; 5] = [
        Topic::Detections,
        Topic::Poses,
        Topic::AnnotatedImage,
        Topic::Transforms,
        Topic::SystemAlerts,
    ];
}

/// The bus.  Clones publish into and subscribe from the same channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    camera_frames: broadcast::Sender<Event>,
    enable: broadcast::Sender<Event>,
    detections: broadcast::Sender<Event>,
    poses: broadcast::Sender<Event>,
    annotated_image: broadcast::Sender<Event>,
    transforms: broadcast::Sender<Event>,
    system_alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// Every topic gets its own channel of `capacity` events.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero (a [`broadcast::channel`] requirement).
    pub fn new(capacity: usize) -> Self {
        let (camera_frames, _) = broadcast::channel(capacity);
        let (enable, _) = broadcast::channel(capacity);
        let (detections, _) = broadcast::channel(capacity);
        let (poses, _) = broadcast::channel(capacity);
        let (annotated_image, _) = broadcast::channel(capacity);
        let (transforms, _) = broadcast::channel(capacity);
        let (system_alerts, _) = broadcast::channel(capacity);
        Self {
            camera_frames,
            enable,
            detections,
            poses,
            annotated_image,
            transforms,
            system_alerts,
        }
    }

    /// Send `event` on `topic` and return how many subscribers got it.
    ///
    /// # Errors
    ///
    /// [`TagError::Channel`] when nobody is subscribed to `topic`.  Callers
    /// that publish best-effort simply ignore it.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, TagError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| TagError::Channel(format!("no subscribers for topic {topic:?}")))
    }

    /// Start receiving events on `topic`.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::CameraFrames => &self.camera_frames,
            Topic::Enable => &self.enable,
            Topic::Detections => &self.detections,
            Topic::Poses => &self.poses,
            Topic::AnnotatedImage => &self.annotated_image,
            Topic::Transforms => &self.transforms,
            Topic::SystemAlerts => &self.system_alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Receivers
// ─────────────────────────────────────────────────────────────────────────────

/// Subscription handle returned by [`EventBus::subscribe_to`].
#[derive(Debug)]
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Next event on this topic.
    ///
    /// `Lagged(n)` means `n` events were overwritten before this subscriber
    /// read them; receiving can continue.  `Closed` means every sender is
    /// gone.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}
