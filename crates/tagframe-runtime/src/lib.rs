//! `tagframe-runtime` – the running tag detector.
//!
//! Wires the pure pipeline stages of `tagframe-perception` to the event bus
//! of `tagframe-middleware`.
//!
//! # Modules
//!
//! - [`detector_node`] – [`TagDetectorNode`][detector_node::TagDetectorNode]:
//!   per-frame orchestration (enable switch, frame lookup, detection,
//!   pose reconstruction, rebasing, annotation and publication) plus the
//!   async [`run`][detector_node::TagDetectorNode::run] loop.
//! - [`throttle`] – [`Throttle`][throttle::Throttle]: rate-limited warnings
//!   that report how many messages were suppressed.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with optional OTLP span export.

pub mod detector_node;
pub mod telemetry;
pub mod throttle;

pub use detector_node::{
    BusBroadcaster, DetectorNodeConfig, FrameOutcome, FrameOutput, TagDetectorNode,
};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use throttle::Throttle;
