//! Critical CSS injection across the built site.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use walkdir::WalkDir;

use crate::critical::{CriticalCssCache, CriticalCssError};
use crate::head::{HeadDocument, HeadIntegrityError};

/// Errors from injecting critical CSS.
#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    #[error(transparent)]
    CriticalCss(#[from] CriticalCssError),

    #[error("Invalid <head> in {}: {source}", path.display())]
    Head {
        path: PathBuf,
        #[source]
        source: HeadIntegrityError,
    },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Injection task failed: {0}")]
    Join(String),
}

/// Outcome of one injection batch.
#[derive(Debug, Default)]
pub struct InjectionReport {
    /// Files rewritten with critical CSS
    pub processed: usize,

    /// Files left untouched because of an error
    pub skipped: Vec<PathBuf>,

    pub duration: Duration,
}

/// Writes the cached critical CSS into every page of the output directory.
#[derive(Debug, Clone)]
pub struct CriticalCssInjector {
    output_dir: PathBuf,
    cache: Arc<CriticalCssCache>,
}

impl CriticalCssInjector {
    pub fn new(output_dir: impl Into<PathBuf>, cache: Arc<CriticalCssCache>) -> Self {
        Self {
            output_dir: output_dir.into(),
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<CriticalCssCache> {
        &self.cache
    }

    /// All `.html` files below the output directory, sorted.
    pub fn html_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.output_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "html"))
            .map(|e| e.into_path())
            .collect();
        files.sort();
        files
    }

    /// Inject into every page currently in the output directory.
    pub async fn inject_all(&self) -> Result<InjectionReport, InjectError> {
        let files = self.html_files();
        self.inject_files(files).await
    }

    /// Inject into `files`.
    ///
    /// Fails without touching any file if the critical CSS can't be computed.
    /// A file that can't be processed is logged and skipped.
    pub async fn inject_files(&self, files: Vec<PathBuf>) -> Result<InjectionReport, InjectError> {
        if files.is_empty() {
            return Ok(InjectionReport::default());
        }

        let start = Instant::now();
        let css = self.cache.get_or_compute().await?;

        let mut report = tokio::task::spawn_blocking(move || inject_batch(&files, &css))
            .await
            .map_err(|e| InjectError::Join(e.to_string()))?;
        report.duration = start.elapsed();

        tracing::info!(
            "Injected critical CSS into {} files in {:.2?}",
            report.processed,
            report.duration
        );
        Ok(report)
    }
}

fn inject_batch(files: &[PathBuf], css: &str) -> InjectionReport {
    let results: Vec<(&PathBuf, Result<(), InjectError>)> = files
        .par_iter()
        .map(|path| (path, inject_file(path, css)))
        .collect();

    let mut report = InjectionReport::default();
    for (path, result) in results {
        match result {
            Ok(()) => report.processed += 1,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", path.display(), e);
                report.skipped.push(path.clone());
            }
        }
    }
    report
}

/// Rewrite one page in place.
pub fn inject_file(path: &Path, css: &str) -> Result<(), InjectError> {
    let html = std::fs::read_to_string(path).map_err(|source| InjectError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let processed = process_html(&html, css).map_err(|source| InjectError::Head {
        path: path.to_path_buf(),
        source,
    })?;

    if processed != html {
        std::fs::write(path, processed).map_err(|source| InjectError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Insert `css` as the critical CSS of `html` and put the head in canonical order.
pub fn process_html(html: &str, css: &str) -> Result<String, HeadIntegrityError> {
    let mut doc = HeadDocument::parse(html)?;
    doc.set_critical_css(css);
    doc.reorder()?;
    Ok(doc.render())
}
