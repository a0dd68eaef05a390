//! `tagframe-perception` – from marker corners to metric poses.
//!
//! Everything in this crate is synchronous and free of I/O so it can be unit
//! tested without a bus or a transform service.
//!
//! # Modules
//!
//! - [`catalog`] – [`TagCatalog`][catalog::TagCatalog]: the read-only map from
//!   marker id to physical size and frame name, built once from configuration.
//! - [`camera_model`] – [`CameraModel`][camera_model::CameraModel]: picks the
//!   focal lengths and principal point out of a `CameraInfo` record.
//! - [`pose`] – [`reconstruct`][pose::reconstruct]: planar-homography pose
//!   recovery for a single detection.
//! - [`transform`] – [`TfEngine`][transform::TfEngine] frame graph, the
//!   [`FrameLookup`][transform::FrameLookup] /
//!   [`FrameBroadcaster`][transform::FrameBroadcaster] capabilities and
//!   [`rebase`][transform::rebase].
//! - [`detector`] – the [`TagDetector`][detector::TagDetector] boundary that
//!   detection backends implement.
//! - [`image_ops`] – grayscale conversion and outline drawing.

pub mod camera_model;
pub mod catalog;
pub mod detector;
pub mod image_ops;
pub mod pose;
pub mod transform;

pub use camera_model::{CameraModel, CameraParameters};
pub use catalog::{TagCatalog, TagDescription};
pub use detector::TagDetector;
pub use transform::{FrameBroadcaster, FrameLookup, SharedTfEngine, TfEngine, rebase};
