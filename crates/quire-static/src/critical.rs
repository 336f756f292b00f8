//! Critical CSS generation and caching.
//!
//! The critical CSS is extracted once per process from the built home page,
//! combined with the theme snippet, minified, and then reused for every page.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::theme::{ThemeError, ThemeVariables, THEME_TEMPLATE};

/// Errors that can occur while computing critical CSS.
#[derive(Debug, thiserror::Error)]
pub enum CriticalCssError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Headless browser error: {0}")]
    Browser(String),

    #[error("Failed to load {url}: {message}")]
    Navigation { url: String, message: String },

    #[error("Timed out after {timeout:?} loading {url}")]
    Timeout { url: String, timeout: Duration },

    #[error("Critical CSS extraction script failed: {0}")]
    Script(String),

    #[error(transparent)]
    Theme(#[from] ThemeError),

    #[error("CSS minification failed: {0}")]
    Minify(String),
}

/// How long to wait for the page before extracting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Upper bound on page navigation, and separately on waiting for the
    /// network to go idle
    pub navigation_timeout: Duration,

    /// How long no request may be in flight before the network counts as idle
    pub network_idle: Duration,

    /// Extra time after the network is idle for late layout
    pub settle: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(30),
            network_idle: Duration::from_millis(500),
            settle: Duration::from_secs(1),
        }
    }
}

/// Input to a critical CSS extractor.
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    /// Page to render
    pub page: PathBuf,

    /// Stylesheet sources to filter
    pub stylesheets: Vec<String>,

    /// Viewport width and height in CSS pixels
    pub viewport: (u32, u32),

    pub wait: WaitPolicy,
}

/// Produces the above-the-fold subset of a page's CSS.
#[async_trait]
pub trait CriticalExtractor: Send + Sync {
    async fn extract(&self, request: &ExtractRequest) -> Result<String, CriticalCssError>;
}

/// Configuration for critical CSS generation.
#[derive(Debug, Clone)]
pub struct CriticalCssOptions {
    /// Built site
    pub output_dir: PathBuf,

    /// Page to extract from, relative to the output directory
    pub index: PathBuf,

    /// Stylesheets to filter, relative to the output directory
    pub stylesheets: Vec<PathBuf>,

    pub viewport: (u32, u32),

    pub wait: WaitPolicy,

    /// Values for the theme snippet
    pub theme: ThemeVariables,

    /// Hand-written CSS appended after extraction
    pub theme_template: String,
}

impl Default for CriticalCssOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("public"),
            index: PathBuf::from("index.html"),
            stylesheets: vec![
                PathBuf::from("index.css"),
                PathBuf::from("static/styles/katex.min.css"),
            ],
            viewport: (1700, 900),
            wait: WaitPolicy::default(),
            theme: ThemeVariables::default(),
            theme_template: THEME_TEMPLATE.to_string(),
        }
    }
}

impl CriticalCssOptions {
    /// Read the stylesheets and build an extraction request.
    pub async fn request(&self) -> Result<ExtractRequest, CriticalCssError> {
        let page = self.output_dir.join(&self.index);
        tokio::fs::metadata(&page).await.map_err(|source| CriticalCssError::Io {
            path: page.clone(),
            source,
        })?;

        let mut stylesheets = Vec::with_capacity(self.stylesheets.len());
        for stylesheet in &self.stylesheets {
            let path = self.output_dir.join(stylesheet);
            let css = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| CriticalCssError::Io { path, source })?;
            stylesheets.push(css);
        }

        Ok(ExtractRequest {
            page,
            stylesheets,
            viewport: self.viewport,
            wait: self.wait,
        })
    }
}

/// Observable state of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Empty,
    Computing,
    Cached,
}

/// Computes critical CSS at most once and shares the result.
///
/// Callers arriving while a computation runs wait for it instead of starting
/// their own. A failed computation leaves the cache empty.
pub struct CriticalCssCache {
    options: CriticalCssOptions,
    extractor: Arc<dyn CriticalExtractor>,
    value: OnceLock<Arc<str>>,
    compute: Mutex<()>,
    computing: AtomicBool,
}

impl CriticalCssCache {
    pub fn new(options: CriticalCssOptions, extractor: Arc<dyn CriticalExtractor>) -> Self {
        Self {
            options,
            extractor,
            value: OnceLock::new(),
            compute: Mutex::new(()),
            computing: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &CriticalCssOptions {
        &self.options
    }

    pub fn output_dir(&self) -> &Path {
        &self.options.output_dir
    }

    pub fn state(&self) -> CacheState {
        if self.value.get().is_some() {
            CacheState::Cached
        } else if self.computing.load(Ordering::Acquire) {
            CacheState::Computing
        } else {
            CacheState::Empty
        }
    }

    /// The cached CSS, if computed.
    pub fn cached(&self) -> Option<Arc<str>> {
        self.value.get().cloned()
    }

    /// Return the cached CSS, computing it first if needed.
    pub async fn get_or_compute(&self) -> Result<Arc<str>, CriticalCssError> {
        if let Some(css) = self.value.get() {
            return Ok(css.clone());
        }

        let _guard = self.compute.lock().await;
        if let Some(css) = self.value.get() {
            return Ok(css.clone());
        }

        let css = {
            let _computing = ComputingFlag::raise(&self.computing);
            self.compute().await?
        };

        Ok(self.value.get_or_init(|| css).clone())
    }

    async fn compute(&self) -> Result<Arc<str>, CriticalCssError> {
        let start = Instant::now();

        let request = self.options.request().await?;
        let extracted = self.extractor.extract(&request).await?;
        let theme = self.options.theme.render(&self.options.theme_template)?;

        let css = minify_css(&format!("{}\n{}", extracted, theme))?;

        tracing::info!(
            "Computed critical CSS ({} bytes) in {:.2?}",
            css.len(),
            start.elapsed()
        );
        Ok(Arc::from(css))
    }
}

impl std::fmt::Debug for CriticalCssCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CriticalCssCache")
            .field("output_dir", &self.options.output_dir)
            .field("state", &self.state())
            .finish()
    }
}

/// Clears the computing flag even if the computation is dropped midway.
struct ComputingFlag<'a>(&'a AtomicBool);

impl<'a> ComputingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for ComputingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Minify CSS using lightningcss.
pub fn minify_css(css: &str) -> Result<String, CriticalCssError> {
    use lightningcss::stylesheet::{ParserOptions, PrinterOptions, StyleSheet};

    let stylesheet = StyleSheet::parse(css, ParserOptions::default())
        .map_err(|e| CriticalCssError::Minify(format!("CSS parse error: {}", e)))?;

    let minified = stylesheet
        .to_css(PrinterOptions {
            minify: true,
            ..Default::default()
        })
        .map_err(|e| CriticalCssError::Minify(format!("CSS print error: {}", e)))?;

    Ok(minified.code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeExtractor {
        calls: AtomicUsize,
        fail_next: AtomicBool,
        gate: Option<Arc<Notify>>,
        /// Returned instead of the stylesheets
        css: Option<&'static str>,
    }

    #[async_trait]
    impl CriticalExtractor for FakeExtractor {
        async fn extract(&self, request: &ExtractRequest) -> Result<String, CriticalCssError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(CriticalCssError::Browser("page crashed".into()));
            }
            assert_eq!(request.viewport, (1700, 900));
            if let Some(css) = self.css {
                return Ok(css.to_string());
            }
            Ok(format!("body {{ margin : 0 ; }}\n{}", request.stylesheets.join("\n")))
        }
    }

    fn site() -> TempDir {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("index.html"), "<html><head></head></html>").unwrap();
        fs::write(temp.path().join("index.css"), "h1 { color: #ff0000; }").unwrap();
        fs::create_dir_all(temp.path().join("static/styles")).unwrap();
        fs::write(
            temp.path().join("static/styles/katex.min.css"),
            ".katex{font-size:1.1em}",
        )
        .unwrap();
        temp
    }

    fn cache(dir: &Path, extractor: Arc<FakeExtractor>) -> CriticalCssCache {
        let mut theme = ThemeVariables::empty();
        theme.set("lightLink", "#1f5fbf");

        CriticalCssCache::new(
            CriticalCssOptions {
                output_dir: dir.to_path_buf(),
                theme,
                theme_template: "a { color: $light-link; }".to_string(),
                ..Default::default()
            },
            extractor,
        )
    }

    #[tokio::test]
    async fn computes_once() {
        let temp = site();
        let extractor = Arc::new(FakeExtractor::default());
        let cache = cache(temp.path(), extractor.clone());

        assert_eq!(cache.state(), CacheState::Empty);

        let first = cache.get_or_compute().await.unwrap();
        let second = cache.get_or_compute().await.unwrap();

        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.state(), CacheState::Cached);
    }

    #[tokio::test]
    async fn appends_theme_and_minifies() {
        let temp = site();
        let cache = cache(temp.path(), Arc::new(FakeExtractor::default()));

        let css = cache.get_or_compute().await.unwrap();

        assert!(css.contains("body{margin:0}"));
        assert!(css.contains(".katex{font-size:1.1em}"));
        assert!(css.contains("#1f5fbf"));
        assert!(!css.contains('\n'));
        assert!(!css.contains('$'));
    }

    #[tokio::test]
    async fn failure_resets_to_empty() {
        let temp = site();
        let extractor = Arc::new(FakeExtractor::default());
        extractor.fail_next.store(true, Ordering::SeqCst);
        let cache = cache(temp.path(), extractor.clone());

        let err = cache.get_or_compute().await.unwrap_err();
        assert!(matches!(err, CriticalCssError::Browser(_)));
        assert_eq!(cache.state(), CacheState::Empty);
        assert!(cache.cached().is_none());

        cache.get_or_compute().await.unwrap();
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.state(), CacheState::Cached);
    }

    #[tokio::test]
    async fn unparseable_css_fails_minification() {
        let temp = site();
        let extractor = Arc::new(FakeExtractor {
            css: Some("a{color:red}}"),
            ..Default::default()
        });
        let cache = cache(temp.path(), extractor.clone());

        let err = cache.get_or_compute().await.unwrap_err();

        assert!(matches!(err, CriticalCssError::Minify(_)));
        assert_eq!(cache.state(), CacheState::Empty);
        assert!(cache.cached().is_none());

        // Nothing is cached, so the next call extracts again
        let _ = cache.get_or_compute().await;
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_first_callers_share_one_extraction() {
        let temp = site();
        let gate = Arc::new(Notify::new());
        let extractor = Arc::new(FakeExtractor {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let cache = Arc::new(cache(temp.path(), extractor.clone()));

        let a = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get_or_compute().await }
        });
        let b = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get_or_compute().await }
        });

        while extractor.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(cache.state(), CacheState::Computing);
        gate.notify_one();

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(a, b);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_stylesheet_fails_before_extraction() {
        let temp = site();
        fs::remove_file(temp.path().join("static/styles/katex.min.css")).unwrap();
        let extractor = Arc::new(FakeExtractor::default());
        let cache = cache(temp.path(), extractor.clone());

        let err = cache.get_or_compute().await.unwrap_err();

        assert!(matches!(err, CriticalCssError::Io { ref path, .. } if path.ends_with("katex.min.css")));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_theme_variable_fails() {
        let temp = site();
        let mut cache = cache(temp.path(), Arc::new(FakeExtractor::default()));
        cache.options.theme_template = "a { color: $nope; }".to_string();

        let err = cache.get_or_compute().await.unwrap_err();

        assert!(matches!(err, CriticalCssError::Theme(_)));
        assert_eq!(cache.state(), CacheState::Empty);
    }

    #[test]
    fn minifies_css() {
        let css = minify_css("a {\n  color: red;\n}\n\n.b { margin: 0px 0px; }").unwrap();
        assert_eq!(css, "a{color:red}.b{margin:0}");
    }
}
