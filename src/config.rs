use directories::{BaseDirs, ProjectDirs};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::model::SenderConfig;

const DEFAULT_SENDER_TEMPLATE: &str = include_str!("../sender.toml");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Builtin,
    Typst,
}

/// Timings and raster options of the generation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub settle_ms: u64,
    pub image_timeout_ms: u64,
    pub font_timeout_ms: u64,
    pub raster_timeout_ms: u64,
    pub margin_pt: f32,
    pub image_quality: f32,
    pub scale_unrestricted: f32,
    pub scale_restricted: f32,
    pub engine: Engine,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            settle_ms: 100,
            image_timeout_ms: 5_000,
            font_timeout_ms: 3_000,
            raster_timeout_ms: 25_000,
            margin_pt: 36.0,
            image_quality: 0.98,
            scale_unrestricted: 2.0,
            scale_restricted: 1.5,
            engine: Engine::Builtin,
        }
    }
}

impl PipelineConfig {
    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_millis(self.image_timeout_ms)
    }

    pub fn font_timeout(&self) -> Duration {
        Duration::from_millis(self.font_timeout_ms)
    }

    pub fn raster_timeout(&self) -> Duration {
        Duration::from_millis(self.raster_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppSettings {
    pub data_root: String,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl AppSettings {
    pub fn new(data_root: impl Into<String>) -> Self {
        AppSettings {
            data_root: data_root.into(),
            pipeline: PipelineConfig::default(),
        }
    }

    /// Data root with a leading `~` expanded.
    pub fn root(&self) -> PathBuf {
        PathBuf::from(expand_home_dir(&self.data_root))
    }
}

pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("com", "invoice-docgen", "app") {
        return proj_dirs.config_dir().join("settings.toml");
    }
    PathBuf::from("settings.toml")
}

/// Returns `Ok(None)` when no settings file exists yet.
pub fn load_settings(path: &Path) -> Result<Option<AppSettings>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let settings = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(settings))
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let toml_str = toml::to_string_pretty(settings)?;
    fs::write(path, toml_str).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads `sender.toml` from the data root, writing the embedded default on first use.
pub fn load_sender_config(root: &Path) -> Result<SenderConfig, ConfigError> {
    let path = root.join("sender.toml");
    if path.exists() {
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        return toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source });
    }

    info!("initializing default sender configuration at {}", path.display());
    let default_sender: SenderConfig =
        toml::from_str(DEFAULT_SENDER_TEMPLATE).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<embedded sender.toml>"),
            source,
        })?;
    fs::create_dir_all(root).map_err(|source| ConfigError::Io {
        path: root.to_path_buf(),
        source,
    })?;
    fs::write(&path, DEFAULT_SENDER_TEMPLATE).map_err(|source| ConfigError::Io { path, source })?;
    Ok(default_sender)
}

pub fn expand_home_dir(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(base_dirs) = BaseDirs::new() {
            let home = base_dirs.home_dir().to_string_lossy();
            return path.replacen('~', &home, 1);
        }
    }
    path.to_string()
}
