//! Configuration file and EMB layout profiles.

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tambour_core::{AdmissionPolicy, EmbLayout};

/// Name of the layout compiled into the binary.
pub const BUILTIN_LAYOUT: &str = "default";

/// Main configuration structure.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default CLI options.
    pub defaults: Defaults,
    /// User-defined EMB layout profiles.
    pub layouts: IndexMap<String, LayoutProfile>,
    /// Directory of the file this was loaded from; relative layout paths
    /// resolve against it.
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

/// Default CLI options.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Enable verbose output by default.
    pub verbose: bool,
    /// Enable quiet output by default.
    pub quiet: bool,
    /// Replay every DST written and check it against its header.
    pub verify: bool,
    /// What a second request does while a conversion is running.
    pub admission: AdmissionPolicy,
    /// Layout profile used when `--layout` is not given.
    pub layout: Option<String>,
}

/// A layout profile: either an inline table or a path to a layout file.
///
/// ```toml
/// [layouts.vendor-b]
/// path = "layouts/vendor-b.yaml"
///
/// [layouts.big-endian]
/// byte_order = "big"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LayoutProfile {
    File(LayoutFile),
    Inline(EmbLayout),
}

/// Reference to a layout file, relative to the config file's directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayoutFile {
    pub path: PathBuf,
}

impl Config {
    /// Load config from the default location (~/.config/tambour/config.toml).
    pub fn load() -> Self {
        Self::load_from_path(Self::default_path())
    }

    /// Load config from a specific path. Missing or invalid files fall back
    /// to defaults with a warning.
    pub fn load_from_path(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "failed to parse config file: {e}");
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), "failed to read config file: {e}");
                Self::default()
            }
        };
        config.base_dir = path.parent().map(Path::to_path_buf);
        config
    }

    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("tambour").join("config.toml"))
    }

    /// All profile names, built-in first.
    pub fn layout_names(&self) -> Vec<&str> {
        let mut names = vec![BUILTIN_LAYOUT];
        names.extend(
            self.layouts
                .keys()
                .map(String::as_str)
                .filter(|name| *name != BUILTIN_LAYOUT),
        );
        names
    }

    /// Resolve `--layout`: a profile name, else a path to a layout file.
    ///
    /// Without an argument the configured default profile is used.
    pub fn resolve_layout(&self, selector: Option<&str>) -> Result<EmbLayout> {
        let selector = selector
            .or(self.defaults.layout.as_deref())
            .unwrap_or(BUILTIN_LAYOUT);

        if let Some(profile) = self.layouts.get(selector) {
            return self
                .load_profile(profile)
                .with_context(|| format!("Invalid layout profile '{selector}'"));
        }
        if selector == BUILTIN_LAYOUT {
            return Ok(EmbLayout::default());
        }

        let path = Path::new(selector);
        if path.is_file() {
            return load_layout_file(path);
        }

        anyhow::bail!(crate::errors::unknown_layout_error(
            selector,
            &self.layout_names()
        ))
    }

    fn load_profile(&self, profile: &LayoutProfile) -> Result<EmbLayout> {
        match profile {
            LayoutProfile::Inline(layout) => {
                layout.validate()?;
                Ok(layout.clone())
            }
            LayoutProfile::File(LayoutFile { path }) => {
                let path = match &self.base_dir {
                    Some(base) if path.is_relative() => base.join(path),
                    _ => path.clone(),
                };
                load_layout_file(&path)
            }
        }
    }
}

/// Read a TOML, YAML or JSON layout file.
pub fn load_layout_file(path: &Path) -> Result<EmbLayout> {
    let data = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!(crate::errors::file_read_error(&path.to_string_lossy(), &e)))?;
    let layout = EmbLayout::from_bytes(&data, path.to_str())
        .with_context(|| format!("Invalid layout file '{}'", path.display()))?;
    Ok(layout)
}
