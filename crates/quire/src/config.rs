//! Configuration file (quire.toml).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use quire_static::{CriticalCssOptions, ThemeVariables, VariableValue, WaitPolicy, THEME_TEMPLATE};
use serde::Deserialize;

/// Configuration file structure.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ConfigFile {
    pub build: BuildSettings,
    pub serve: ServeSettings,
    pub critical: CriticalSettings,
    pub theme: ThemeSettings,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Site-builder entry point
    pub entry_point: PathBuf,
    pub cache_dir: PathBuf,
    /// Scanned for inline scripts
    pub source_dir: PathBuf,
    pub bundler: PathBuf,
    /// Runs the bundle driver and the compiled site builder
    pub runtime: PathBuf,
    /// Watched for changes in serve mode
    pub watch: Vec<PathBuf>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            entry_point: PathBuf::from("quire/build.ts"),
            cache_dir: PathBuf::from(".quire-cache"),
            source_dir: PathBuf::from("quire"),
            bundler: PathBuf::from("esbuild"),
            runtime: PathBuf::from("node"),
            watch: vec![PathBuf::from(".")],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServeSettings {
    pub host: String,
    pub open: bool,
}

impl Default for ServeSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            open: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CriticalSettings {
    pub index: PathBuf,
    pub stylesheets: Vec<PathBuf>,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub navigation_timeout_ms: u64,
    pub network_idle_ms: u64,
    pub settle_ms: u64,
    /// Chrome executable; auto-detected when unset
    pub chrome_path: Option<PathBuf>,
}

impl Default for CriticalSettings {
    fn default() -> Self {
        let defaults = CriticalCssOptions::default();
        Self {
            index: defaults.index,
            stylesheets: defaults.stylesheets,
            viewport_width: defaults.viewport.0,
            viewport_height: defaults.viewport.1,
            navigation_timeout_ms: defaults.wait.navigation_timeout.as_millis() as u64,
            network_idle_ms: defaults.wait.network_idle.as_millis() as u64,
            settle_ms: defaults.wait.settle.as_millis() as u64,
            chrome_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ThemeSettings {
    /// Overrides and additions to the built-in theme values
    pub variables: BTreeMap<String, VariableValue>,
    /// Extra variable names that take no `px` suffix
    pub unitless: Vec<String>,
}

impl ConfigFile {
    /// Critical CSS options for a site built into `output_dir`.
    pub fn critical_options(&self, output_dir: &Path) -> CriticalCssOptions {
        let mut theme = ThemeVariables::default();
        theme.extend(self.theme.variables.clone());
        for name in &self.theme.unitless {
            theme.mark_unitless(name.clone());
        }

        CriticalCssOptions {
            output_dir: output_dir.to_path_buf(),
            index: self.critical.index.clone(),
            stylesheets: self.critical.stylesheets.clone(),
            viewport: (self.critical.viewport_width, self.critical.viewport_height),
            wait: WaitPolicy {
                navigation_timeout: Duration::from_millis(self.critical.navigation_timeout_ms),
                network_idle: Duration::from_millis(self.critical.network_idle_ms),
                settle: Duration::from_millis(self.critical.settle_ms),
            },
            theme,
            theme_template: THEME_TEMPLATE.to_string(),
        }
    }
}

/// Load configuration from `path` if it exists.
/// Returns an error if the config file exists but is malformed.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}
