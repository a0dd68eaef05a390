//! Tag Catalog.
//!
//! Maps a marker id to the physical edge length of the printed tag and the
//! name of the coordinate frame it represents.  Built once at startup and
//! never mutated afterwards.
//!
//! Entries are taken as [`serde_json::Value`]s so the catalog does not care
//! whether the configuration came from TOML, JSON or a parameter server.
//!
//! ```rust
//! use tagframe_perception::catalog::TagCatalog;
//!
//! let entries = vec![
//!     serde_json::json!({ "id": 5, "size": 0.2 }),
//!     serde_json::json!({ "id": 7, "size": 0.1, "frame_id": "dock" }),
//! ];
//! let catalog = TagCatalog::build(&entries).unwrap();
//! assert_eq!(catalog.lookup(5).unwrap().frame_name, "tag_5");
//! assert_eq!(catalog.lookup(7).unwrap().frame_name, "dock");
//! assert!(catalog.lookup(9).is_none());
//! ```

use std::collections::BTreeMap;

use serde_json::Value;
use tagframe_types::TagError;
use tracing::{info, warn};

/// Prefix of the frame name generated for entries without a `frame_id`.
pub const DEFAULT_FRAME_PREFIX: &str = "tag_";

/// Static description of one marker.
#[derive(Debug, Clone, PartialEq)]
pub struct TagDescription {
    pub id: i32,
    /// Edge length of the black square, in metres.
    pub size: f64,
    pub frame_name: String,
}

impl TagDescription {
    pub fn new(id: i32, size: f64, frame_name: impl Into<String>) -> Self {
        Self {
            id,
            size,
            frame_name: frame_name.into(),
        }
    }
}

/// Read-only mapping from marker id to [`TagDescription`].
#[derive(Debug, Clone, Default)]
pub struct TagCatalog {
    descriptions: BTreeMap<i32, TagDescription>,
}

impl TagCatalog {
    /// An empty catalog: every detection will be treated as unknown.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse every entry of `entries`.
    ///
    /// A later entry with an id that is already present replaces the earlier
    /// one.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::Config`] for the first entry that is not an
    /// object, lacks an integer `id` or a numeric `size`, has a size that is
    /// not strictly positive, or carries a non-string `frame_id`.
    pub fn build(entries: &[Value]) -> Result<Self, TagError> {
        let mut descriptions = BTreeMap::new();
        for (index, entry) in entries.iter().enumerate() {
            let description = parse_entry(index, entry)?;
            info!(
                id = description.id,
                size = description.size,
                frame_name = %description.frame_name,
                "loaded tag description"
            );
            if let Some(previous) = descriptions.insert(description.id, description) {
                warn!(
                    id = previous.id,
                    replaced_frame = %previous.frame_name,
                    "duplicate tag id in configuration; the later entry wins"
                );
            }
        }
        Ok(Self { descriptions })
    }

    /// Return the description for `id`, or `None` if the marker is not of
    /// interest.
    pub fn lookup(&self, id: i32) -> Option<&TagDescription> {
        self.descriptions.get(&id)
    }

    pub fn len(&self) -> usize {
        self.descriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptions.is_empty()
    }

    /// Iterate over all descriptions in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &TagDescription> {
        self.descriptions.values()
    }
}

fn parse_entry(index: usize, entry: &Value) -> Result<TagDescription, TagError> {
    let object = entry.as_object().ok_or_else(|| {
        TagError::Config(format!("tag description #{index} is not a table"))
    })?;

    let id_value = object
        .get("id")
        .ok_or_else(|| TagError::Config(format!("tag description #{index} has no 'id'")))?;
    let id = id_value
        .as_i64()
        .and_then(|id| i32::try_from(id).ok())
        .ok_or_else(|| {
            TagError::Config(format!(
                "tag description #{index}: 'id' must be a 32-bit integer, got {id_value}"
            ))
        })?;

    let size_value = object
        .get("size")
        .ok_or_else(|| TagError::Config(format!("tag {id} has no 'size'")))?;
    let size = size_value.as_f64().ok_or_else(|| {
        TagError::Config(format!("tag {id}: 'size' must be a number, got {size_value}"))
    })?;
    if !size.is_finite() || size <= 0.0 {
        return Err(TagError::Config(format!(
            "tag {id}: 'size' must be positive, got {size}"
        )));
    }

    let frame_name = match object.get("frame_id") {
        None => format!("{DEFAULT_FRAME_PREFIX}{id}"),
        Some(Value::String(name)) => name.clone(),
        Some(other) => {
            return Err(TagError::Config(format!(
                "tag {id}: 'frame_id' must be a string, got {other}"
            )));
        }
    };

    Ok(TagDescription::new(id, size, frame_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_entries_and_defaults_frame_name() {
        let catalog = TagCatalog::build(&[
            json!({ "id": 5, "size": 0.2 }),
            json!({ "id": 6, "size": 0.15, "frame_id": "shelf" }),
        ])
        .unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.lookup(5), Some(&TagDescription::new(5, 0.2, "tag_5")));
        assert_eq!(catalog.lookup(6).unwrap().frame_name, "shelf");
    }

    #[test]
    fn lookup_of_missing_id_is_none() {
        let catalog = TagCatalog::build(&[json!({ "id": 1, "size": 0.1 })]).unwrap();
        assert!(catalog.lookup(2).is_none());
        assert!(TagCatalog::empty().lookup(1).is_none());
    }

    #[test]
    fn integer_size_is_accepted() {
        let catalog = TagCatalog::build(&[json!({ "id": 1, "size": 1 })]).unwrap();
        assert_eq!(catalog.lookup(1).unwrap().size, 1.0);
    }

    #[test]
    fn missing_id_is_config_error() {
        let err = TagCatalog::build(&[json!({ "size": 0.1 })]).unwrap_err();
        assert!(matches!(err, TagError::Config(msg) if msg.contains("'id'")));
    }

    #[test]
    fn missing_size_is_config_error() {
        let err = TagCatalog::build(&[json!({ "id": 3 })]).unwrap_err();
        assert!(matches!(err, TagError::Config(msg) if msg.contains("'size'")));
    }

    #[test]
    fn non_integer_id_is_config_error() {
        for bad in [json!("5"), json!(5.5), json!(1_i64 << 40)] {
            let err = TagCatalog::build(&[json!({ "id": bad, "size": 0.1 })]).unwrap_err();
            assert!(matches!(err, TagError::Config(_)), "id {bad} should be rejected");
        }
    }

    #[test]
    fn non_numeric_size_is_config_error() {
        let err = TagCatalog::build(&[json!({ "id": 1, "size": "big" })]).unwrap_err();
        assert!(matches!(err, TagError::Config(_)));
    }

    #[test]
    fn non_positive_size_is_config_error() {
        for bad in [0.0, -0.2] {
            let err = TagCatalog::build(&[json!({ "id": 1, "size": bad })]).unwrap_err();
            assert!(matches!(err, TagError::Config(_)));
        }
    }

    #[test]
    fn non_string_frame_id_is_config_error() {
        let err =
            TagCatalog::build(&[json!({ "id": 1, "size": 0.1, "frame_id": 3 })]).unwrap_err();
        assert!(matches!(err, TagError::Config(_)));
    }

    #[test]
    fn non_table_entry_is_config_error() {
        let err = TagCatalog::build(&[json!([1, 0.1])]).unwrap_err();
        assert!(matches!(err, TagError::Config(_)));
    }

    /// Duplicate ids are not rejected: the last entry silently replaces the
    /// first one.  Easy to trip over when copy-pasting configuration.
    #[test]
    fn duplicate_id_last_write_wins() {
        let catalog = TagCatalog::build(&[
            json!({ "id": 4, "size": 0.1, "frame_id": "first" }),
            json!({ "id": 4, "size": 0.3, "frame_id": "second" }),
        ])
        .unwrap();
        assert_eq!(catalog.len(), 1);
        let d = catalog.lookup(4).unwrap();
        assert_eq!(d.frame_name, "second");
        assert_eq!(d.size, 0.3);
    }

    #[test]
    fn iter_is_sorted_by_id() {
        let catalog = TagCatalog::build(&[
            json!({ "id": 9, "size": 0.1 }),
            json!({ "id": 2, "size": 0.1 }),
        ])
        .unwrap();
        let ids: Vec<i32> = catalog.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![2, 9]);
    }
}
