//! Layered config discovery.
//!
//! Two layers are read, the later one overriding the earlier:
//!
//! | Layer     | File                                            |
//! |-----------|-------------------------------------------------|
//! | `User`    | `$STRATA_CONFIG_DIR/config.toml`, else `<config dir>/strata/config.toml` |
//! | `Project` | `<project dir>/strata.toml`                     |
//!
//! Relative paths inside a layer (SQLite files, the recovery directory) are
//! anchored to that layer's directory before merging, so a project file can
//! say `path = "memory.db"` and mean the file next to it.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::{ConfigError, Result, StrataConfig};

const PROJECT_FILE: &str = "strata.toml";
const USER_FILE: &str = "config.toml";
const APP_DIR: &str = "strata";
const CONFIG_DIR_ENV: &str = "STRATA_CONFIG_DIR";

/// Where a config layer comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayer {
    User,
    Project,
}

impl fmt::Display for ConfigLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigLayer::User => f.write_str("user"),
            ConfigLayer::Project => f.write_str("project"),
        }
    }
}

/// What happened to one layer during [`Discovery::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerOutcome {
    /// Parsed and merged.
    Merged,
    /// No file at the path.
    Missing,
    /// Present but unreadable or malformed; skipped.
    Skipped(String),
}

#[derive(Debug, Clone)]
pub struct LayerReport {
    pub layer: ConfigLayer,
    pub path: PathBuf,
    pub outcome: LayerOutcome,
}

/// The merged, validated configuration and how it was assembled.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub config: StrataConfig,
    /// One report per layer looked at, lowest precedence first.
    pub layers: Vec<LayerReport>,
}

impl Discovered {
    /// Files that contributed to the result.
    pub fn merged_files(&self) -> Vec<&Path> {
        self.layers
            .iter()
            .filter(|r| r.outcome == LayerOutcome::Merged)
            .map(|r| r.path.as_path())
            .collect()
    }

    /// Human readable notes for skipped layers.
    pub fn warnings(&self) -> Vec<String> {
        self.layers
            .iter()
            .filter_map(|r| match &r.outcome {
                LayerOutcome::Skipped(reason) => {
                    Some(format!("{} config {} skipped: {reason}", r.layer, r.path.display()))
                }
                _ => None,
            })
            .collect()
    }

    /// Directory for snapshots and operation logs, when `[recovery]` is
    /// declared. Falls back to the platform data directory.
    pub fn recovery_dir(&self) -> Option<PathBuf> {
        self.config.recovery.as_ref()?.resolved_dir()
    }
}

/// Builder describing which layers to read.
#[derive(Debug, Clone)]
pub struct Discovery {
    user_dir: Option<PathBuf>,
    project_dir: Option<PathBuf>,
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Discovery {
    /// User layer from the environment or platform, project layer from the
    /// current directory.
    pub fn new() -> Self {
        Self {
            user_dir: user_config_dir(),
            project_dir: Some(PathBuf::from(".")),
        }
    }

    pub fn with_user_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.user_dir = Some(dir.into());
        self
    }

    pub fn without_user_layer(mut self) -> Self {
        self.user_dir = None;
        self
    }

    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    pub fn without_project_layer(mut self) -> Self {
        self.project_dir = None;
        self
    }

    /// The file a layer would be read from, if the layer is enabled.
    pub fn layer_path(&self, layer: ConfigLayer) -> Option<PathBuf> {
        match layer {
            ConfigLayer::User => self.user_dir.as_ref().map(|d| d.join(USER_FILE)),
            ConfigLayer::Project => self.project_dir.as_ref().map(|d| d.join(PROJECT_FILE)),
        }
    }

    /// Read every enabled layer, merge, and validate the result.
    ///
    /// A broken layer is reported and skipped; an invalid merged result is
    /// an error.
    pub fn load(&self) -> Result<Discovered> {
        let mut config = StrataConfig::new();
        let mut layers = Vec::new();

        for layer in [ConfigLayer::User, ConfigLayer::Project] {
            let Some(path) = self.layer_path(layer) else {
                continue;
            };
            let outcome = if !path.is_file() {
                LayerOutcome::Missing
            } else {
                match read_config_file(&path) {
                    Ok(found) => {
                        config.merge(found);
                        LayerOutcome::Merged
                    }
                    Err(err) => LayerOutcome::Skipped(err.to_string()),
                }
            };
            layers.push(LayerReport {
                layer,
                path,
                outcome,
            });
        }

        config.validate()?;
        Ok(Discovered { config, layers })
    }
}

/// Parse one file, anchoring its relative paths to the file's directory.
pub fn read_config_file(path: &Path) -> Result<StrataConfig> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    let mut config = StrataConfig::from_toml(&contents)?;
    if let Some(base) = path.parent() {
        config.anchor_paths(base);
    }
    Ok(config)
}

/// Write `config` as TOML, creating missing parent directories.
pub fn write_config_file(config: &StrataConfig, path: &Path) -> Result<()> {
    let write_err = |at: &Path, source| ConfigError::WriteFile {
        path: at.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| write_err(parent, e))?;
    }
    std::fs::write(path, config.to_toml()?).map_err(|e| write_err(path, e))
}

/// `STRATA_CONFIG_DIR` when set, else `<platform config dir>/strata`.
pub fn user_config_dir() -> Option<PathBuf> {
    match std::env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::config_dir().map(|d| d.join(APP_DIR)),
    }
}

/// `<platform data dir>/strata`.
pub fn data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join(APP_DIR))
}
