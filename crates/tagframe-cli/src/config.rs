//! Node configuration – reads/writes `tagframe.toml`.
//!
//! ```toml
//! tag_family = "36h11"
//! projected_optics = true
//! output_frame_id = "map"
//! start_enabled = true
//!
//! [[tag_descriptions]]
//! id = 5
//! size = 0.2
//! frame_id = "dock"
//!
//! [[static_transforms]]
//! parent = "map"
//! child = "camera"
//! translation = [0.0, 0.0, 1.5]
//! rotation = [0.0, 0.0, 0.0, 1.0]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

use tagframe_perception::{CameraModel, TagCatalog, TfEngine};
use tagframe_runtime::DetectorNodeConfig;
use tagframe_types::{Quaternion, TagFamily, Transform3D, Vec3};

/// File looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "tagframe.toml";

/// A fixed frame relationship known at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticTransformConfig {
    pub parent: String,
    pub child: String,
    /// Metres, `[x, y, z]`.
    #[serde(default)]
    pub translation: [f64; 3],
    /// Unit quaternion in ROS order, `[x, y, z, w]`.
    #[serde(default = "default_rotation")]
    pub rotation: [f64; 4],
}

impl StaticTransformConfig {
    pub fn transform(&self) -> Transform3D {
        let [x, y, z] = self.translation;
        let [qx, qy, qz, qw] = self.rotation;
        Transform3D::new(Vec3::new(x, y, z), Quaternion::new(qw, qx, qy, qz)).normalized()
    }
}

/// Persisted node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Raw catalog entries; validated by [`TagCatalog::build`].
    #[serde(default)]
    pub tag_descriptions: Vec<Value>,

    /// Detector family name, e.g. `"36h11"`.
    #[serde(default = "default_tag_family")]
    pub tag_family: String,

    /// Take pinhole parameters from `P` instead of `K`.
    #[serde(default)]
    pub projected_optics: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_frame_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_frame_id: Option<String>,

    #[serde(default)]
    pub start_enabled: bool,

    #[serde(default)]
    pub static_transforms: Vec<StaticTransformConfig>,

    /// Address the rosbridge endpoint listens on in server mode.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// rosbridge server to dial in client mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rosbridge_url: Option<String>,

    /// Capacity of every bus topic.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

fn default_tag_family() -> String {
    TagFamily::default().to_string()
}
fn default_listen_addr() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_bus_capacity() -> usize {
    256
}
fn default_rotation() -> [f64; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tag_descriptions: Vec::new(),
            tag_family: default_tag_family(),
            projected_optics: false,
            sensor_frame_id: None,
            output_frame_id: None,
            start_enabled: false,
            static_transforms: Vec::new(),
            listen_addr: default_listen_addr(),
            rosbridge_url: None,
            bus_capacity: default_bus_capacity(),
        }
    }
}

impl NodeConfig {
    /// The configured family, falling back to 36h11 on an unknown name.
    pub fn family(&self) -> TagFamily {
        self.tag_family.parse().unwrap_or_else(|e| {
            warn!(tag_family = %self.tag_family, error = %e, "invalid tag family; using 36h11");
            TagFamily::default()
        })
    }

    /// Build the catalog.  An invalid catalog is logged and replaced by an
    /// empty one so the node can still run (and report every marker as
    /// unknown).
    pub fn catalog(&self) -> TagCatalog {
        TagCatalog::build(&self.tag_descriptions).unwrap_or_else(|e| {
            error!(error = %e, "invalid tag_descriptions; no tags will be reported");
            TagCatalog::empty()
        })
    }

    pub fn node_config(&self) -> DetectorNodeConfig {
        DetectorNodeConfig {
            camera_model: CameraModel::from_projected_optics(self.projected_optics),
            sensor_frame_id: non_empty(&self.sensor_frame_id),
            output_frame_id: non_empty(&self.output_frame_id),
            start_enabled: self.start_enabled,
        }
    }

    /// A frame graph seeded with every static relationship.
    pub fn frame_graph(&self) -> TfEngine {
        let mut engine = TfEngine::new();
        for st in &self.static_transforms {
            engine.set_transform(&st.parent, &st.child, st.transform());
        }
        engine
    }
}

/// Blank frame names count as unset.
fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

/// Load the config from `path`.  Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<NodeConfig>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: NodeConfig =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `TAGFRAME_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TAGFRAME_TAG_FAMILY` | `tag_family` |
/// | `TAGFRAME_SENSOR_FRAME` | `sensor_frame_id` |
/// | `TAGFRAME_OUTPUT_FRAME` | `output_frame_id` |
/// | `TAGFRAME_START_ENABLED` | `start_enabled` (`true`/`false`) |
/// | `TAGFRAME_LISTEN_ADDR` | `listen_addr` |
/// | `TAGFRAME_ROSBRIDGE_URL` | `rosbridge_url` |
pub fn apply_env_overrides(cfg: &mut NodeConfig) {
    if let Ok(v) = std::env::var("TAGFRAME_TAG_FAMILY") {
        cfg.tag_family = v;
    }
    if let Ok(v) = std::env::var("TAGFRAME_SENSOR_FRAME") {
        cfg.sensor_frame_id = Some(v);
    }
    if let Ok(v) = std::env::var("TAGFRAME_OUTPUT_FRAME") {
        cfg.output_frame_id = Some(v);
    }
    if let Ok(v) = std::env::var("TAGFRAME_START_ENABLED")
        && let Ok(enabled) = v.trim().parse::<bool>()
    {
        cfg.start_enabled = enabled;
    }
    if let Ok(v) = std::env::var("TAGFRAME_LISTEN_ADDR") {
        cfg.listen_addr = v;
    }
    if let Ok(v) = std::env::var("TAGFRAME_ROSBRIDGE_URL") {
        cfg.rosbridge_url = Some(v);
    }
}

/// Write `cfg` to `path`, creating parent directories.
pub fn save_to(cfg: &NodeConfig, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}

/// `path` if given, otherwise [`DEFAULT_CONFIG_FILE`].
pub fn resolve_path(path: Option<PathBuf>) -> PathBuf {
    path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}
