//! Reusable bundler session.
//!
//! The main bundle runs through a small node driver using the esbuild JS API,
//! so inline scripts can be swapped for their generated modules by file path
//! with an `onLoad` plugin. The driver reads its settings from a JSON file
//! written next to the compiled module.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::inline::{InlineModule, InlineScriptPlugin};
use crate::metafile::BuildMetadata;

/// Configuration for a bundler session.
#[derive(Debug, Clone)]
pub struct BundlerOptions {
    /// Project root; the bundler runs from here and other paths are relative to it
    pub root: PathBuf,

    /// Site-builder entry point
    pub entry_point: PathBuf,

    /// Compiled server-side module
    pub outfile: PathBuf,

    /// Directory scanned for inline scripts
    pub source_dir: PathBuf,

    /// Bundler executable, used for standalone inline scripts
    pub bundler: PathBuf,

    /// JavaScript runtime running the bundle driver
    pub runtime: PathBuf,
}

impl Default for BundlerOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            entry_point: PathBuf::from("quire/build.ts"),
            outfile: PathBuf::from(".quire-cache/transpiled-build.mjs"),
            source_dir: PathBuf::from("quire"),
            bundler: PathBuf::from("esbuild"),
            runtime: PathBuf::from("node"),
        }
    }
}

impl BundlerOptions {
    /// Directory holding the compiled module and generated files.
    pub fn cache_dir(&self) -> PathBuf {
        self.outfile
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    /// Metafile written next to the compiled module.
    pub fn metafile(&self) -> PathBuf {
        self.outfile.with_extension("meta.json")
    }
}

/// Source of the node script running the main bundle.
pub const DRIVER_SOURCE: &str = include_str!("bundle_driver.mjs");

const DRIVER_FILE: &str = "bundle-driver.mjs";
const DRIVER_CONFIG_FILE: &str = "bundle-config.json";

/// Settings handed to the bundle driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    pub entry_point: PathBuf,
    pub outfile: PathBuf,
    pub metafile: PathBuf,

    /// `@inline/<stem>` specifiers and the generated modules they name
    pub alias: BTreeMap<String, PathBuf>,

    /// Inline script sources and the generated modules loaded in their place
    pub inline: BTreeMap<PathBuf, PathBuf>,
}

/// Errors that can occur while bundling.
#[derive(Debug, thiserror::Error)]
pub enum BundlerError {
    #[error("Couldn't compile {}: {message}", entry_point.display())]
    Compile { entry_point: PathBuf, message: String },

    #[error("Failed to run {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to bundle inline script {}: {message}", path.display())]
    InlineScript { path: PathBuf, message: String },

    #[error(
        "Inline scripts {} and {} both map to {specifier}",
        first.display(),
        second.display()
    )]
    DuplicateInlineScript {
        specifier: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Failed to read build metadata {}: {message}", path.display())]
    Metafile { path: PathBuf, message: String },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Bundler context has been disposed")]
    Disposed,
}

/// An incremental bundling session.
#[async_trait]
pub trait Bundler: Send {
    /// Entry point being compiled.
    fn entry_point(&self) -> &Path;

    /// Location of the compiled module on disk.
    fn outfile(&self) -> PathBuf;

    /// Recompile from the current sources on disk.
    async fn rebuild(&mut self) -> Result<BuildMetadata, BundlerError>;

    /// Release the session. Further rebuilds fail.
    async fn dispose(&mut self);
}

/// Bundler session backed by esbuild.
#[derive(Debug)]
pub struct BundlerContext {
    options: BundlerOptions,
    inline: InlineScriptPlugin,
    rebuilds: usize,
    disposed: bool,
}

impl BundlerContext {
    /// Create a new session.
    pub fn new(options: BundlerOptions) -> Self {
        let inline = InlineScriptPlugin::new(options.bundler.clone());
        Self {
            options,
            inline,
            rebuilds: 0,
            disposed: false,
        }
    }

    pub fn options(&self) -> &BundlerOptions {
        &self.options
    }

    /// Number of successful rebuilds so far.
    pub fn rebuilds(&self) -> usize {
        self.rebuilds
    }

    /// Driver settings for the main server-side bundle.
    pub fn driver_config(&self, inline: &[InlineModule]) -> DriverConfig {
        DriverConfig {
            entry_point: self.options.entry_point.clone(),
            outfile: self.options.outfile.clone(),
            metafile: self.options.metafile(),
            alias: inline
                .iter()
                .map(|module| (module.specifier.clone(), module.generated.clone()))
                .collect(),
            inline: inline
                .iter()
                .map(|module| (module.source.clone(), module.generated.clone()))
                .collect(),
        }
    }

    /// Write the driver and its settings into the cache dir.
    async fn write_driver(
        &self,
        cache_dir: &Path,
        config: &DriverConfig,
    ) -> Result<(PathBuf, PathBuf), BundlerError> {
        let driver = cache_dir.join(DRIVER_FILE);
        let config_path = cache_dir.join(DRIVER_CONFIG_FILE);

        let json = serde_json::to_string_pretty(config).map_err(|e| BundlerError::Io {
            path: config_path.clone(),
            source: std::io::Error::other(e),
        })?;

        for (path, contents) in [(&driver, DRIVER_SOURCE), (&config_path, json.as_str())] {
            tokio::fs::write(path, contents)
                .await
                .map_err(|source| BundlerError::Io {
                    path: path.clone(),
                    source,
                })?;
        }

        Ok((driver, config_path))
    }
}

#[async_trait]
impl Bundler for BundlerContext {
    fn entry_point(&self) -> &Path {
        &self.options.entry_point
    }

    fn outfile(&self) -> PathBuf {
        self.options.root.join(&self.options.outfile)
    }

    async fn rebuild(&mut self) -> Result<BuildMetadata, BundlerError> {
        if self.disposed {
            return Err(BundlerError::Disposed);
        }

        let start = Instant::now();
        let root = self.options.root.clone();

        let cache_dir = root.join(self.options.cache_dir());
        tokio::fs::create_dir_all(&cache_dir)
            .await
            .map_err(|source| BundlerError::Io {
                path: cache_dir.clone(),
                source,
            })?;

        let inline = self
            .inline
            .prepare(&root, &root.join(&self.options.source_dir), &cache_dir)
            .await?;

        let config = self.driver_config(&inline);
        let (driver, config_path) = self.write_driver(&cache_dir, &config).await?;
        tracing::debug!(
            "Running {} {} {}",
            self.options.runtime.display(),
            driver.display(),
            config_path.display()
        );

        let output = Command::new(&self.options.runtime)
            .arg(&driver)
            .arg(&config_path)
            .current_dir(&root)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| BundlerError::Spawn {
                program: self.options.runtime.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("bundler exited with {}", output.status)
            } else {
                stderr
            };
            return Err(BundlerError::Compile {
                entry_point: self.options.entry_point.clone(),
                message,
            });
        }

        let metafile = root.join(self.options.metafile());
        let json = tokio::fs::read_to_string(&metafile)
            .await
            .map_err(|source| BundlerError::Io {
                path: metafile.clone(),
                source,
            })?;

        let mut metadata =
            BuildMetadata::from_json(&json).map_err(|e| BundlerError::Metafile {
                path: metafile,
                message: e.to_string(),
            })?;
        metadata.inline_scripts = inline.len();
        metadata.duration = start.elapsed();

        self.rebuilds += 1;
        Ok(metadata)
    }

    async fn dispose(&mut self) {
        if !self.disposed {
            tracing::debug!("Disposing bundler context for {}", self.options.entry_point.display());
            self.disposed = true;
        }
    }
}
