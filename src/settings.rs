//! Flat JSON settings document.
//!
//! Only the recognized keys are ever written; unknown keys are ignored on
//! load and missing keys fall back to defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{Backend, BundleMode, PackagingConfig, WindowMode};

pub const DEFAULT_SETTINGS_FILE: &str = "config.json";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to access settings file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid settings file '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// On-disk shape of the settings, key for key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsDocument {
    pub main_file: String,
    pub output_dir: String,
    pub output_name: String,
    pub packager: String,
    pub onefile: bool,
    pub console: bool,
    pub windowed: bool,
    pub icon_path: String,
    pub hidden_imports: Vec<String>,
    pub add_data: Vec<String>,
    pub excludes: Vec<String>,
    pub clean: bool,
    pub noconfirm: bool,
    pub auto_analyze: bool,
    pub smart_exclude: bool,
    pub upx_compress: bool,
    pub auto_add_missing: bool,
}

impl Default for SettingsDocument {
    fn default() -> Self {
        Self {
            main_file: String::new(),
            output_dir: String::new(),
            output_name: String::new(),
            packager: Backend::PyInstaller.as_str().to_string(),
            onefile: false,
            console: true,
            windowed: false,
            icon_path: String::new(),
            hidden_imports: Vec::new(),
            add_data: Vec::new(),
            excludes: Vec::new(),
            clean: true,
            noconfirm: true,
            auto_analyze: true,
            smart_exclude: true,
            upx_compress: false,
            auto_add_missing: true,
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn path_string(path: Option<&Path>) -> String {
    path.map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl From<SettingsDocument> for PackagingConfig {
    fn from(doc: SettingsDocument) -> Self {
        Self {
            backend: Backend::from_setting(&doc.packager),
            main_file: PathBuf::from(doc.main_file.trim()),
            output_dir: non_empty(&doc.output_dir).map(PathBuf::from),
            output_name: non_empty(&doc.output_name),
            bundle: if doc.onefile {
                BundleMode::OneFile
            } else {
                BundleMode::OneDir
            },
            window: if doc.windowed {
                WindowMode::Windowed
            } else {
                WindowMode::Console
            },
            icon: non_empty(&doc.icon_path).map(PathBuf::from),
            hidden_imports: doc.hidden_imports,
            data_files: doc.add_data,
            excludes: doc.excludes,
            clean: doc.clean,
            no_confirm: doc.noconfirm,
            auto_analyze: doc.auto_analyze,
            smart_exclude: doc.smart_exclude,
            upx_compress: doc.upx_compress,
            auto_add_missing: doc.auto_add_missing,
        }
    }
}

impl From<&PackagingConfig> for SettingsDocument {
    fn from(config: &PackagingConfig) -> Self {
        Self {
            main_file: config.main_file.to_string_lossy().into_owned(),
            output_dir: path_string(config.output_dir.as_deref()),
            output_name: config.output_name.clone().unwrap_or_default(),
            packager: config.backend.as_str().to_string(),
            onefile: config.bundle == BundleMode::OneFile,
            console: config.window == WindowMode::Console,
            windowed: config.window == WindowMode::Windowed,
            icon_path: path_string(config.icon.as_deref()),
            hidden_imports: config.hidden_imports.clone(),
            add_data: config.data_files.clone(),
            excludes: config.excludes.clone(),
            clean: config.clean,
            noconfirm: config.no_confirm,
            auto_analyze: config.auto_analyze,
            smart_exclude: config.smart_exclude,
            upx_compress: config.upx_compress,
            auto_add_missing: config.auto_add_missing,
        }
    }
}

/// Reads and writes the settings document at one path.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(DEFAULT_SETTINGS_FILE)
    }
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the config; a missing file yields the defaults.
    pub fn load(&self) -> Result<PackagingConfig, SettingsError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No settings file, using defaults");
                return Ok(PackagingConfig::default());
            }
            Err(source) => {
                return Err(SettingsError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let doc: SettingsDocument =
            serde_json::from_str(&text).map_err(|source| SettingsError::Json {
                path: self.path.clone(),
                source,
            })?;
        Ok(doc.into())
    }

    pub fn save(&self, config: &PackagingConfig) -> Result<(), SettingsError> {
        let doc = SettingsDocument::from(config);
        let text = serde_json::to_string_pretty(&doc).map_err(|source| SettingsError::Json {
            path: self.path.clone(),
            source,
        })?;

        std::fs::write(&self.path, text).map_err(|source| SettingsError::Io {
            path: self.path.clone(),
            source,
        })?;
        info!(path = %self.path.display(), "Settings saved");
        Ok(())
    }
}
