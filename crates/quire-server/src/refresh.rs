//! Post-build refresh: critical CSS injection, then live reload.

use async_trait::async_trait;
use quire_static::{CriticalCssInjector, InjectError};

use crate::lock::BuildLock;
use crate::websocket::{LiveReloadHub, ReloadMessage};

/// Errors from refreshing after a build.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Failed to inject critical CSS: {0}")]
    Inject(#[from] InjectError),
}

/// Told whenever a build has written new output.
#[async_trait]
pub trait ReloadNotifier: Send + Sync {
    async fn notify(&self) -> Result<(), NotifyError>;
}

/// Injects critical CSS into the fresh output, then tells open pages to reload.
#[derive(Debug, Clone)]
pub struct RefreshNotifier {
    lock: BuildLock,
    injector: CriticalCssInjector,
    hub: Option<LiveReloadHub>,
}

impl RefreshNotifier {
    /// `hub` is `None` outside serve mode.
    pub fn new(lock: BuildLock, injector: CriticalCssInjector, hub: Option<LiveReloadHub>) -> Self {
        Self { lock, injector, hub }
    }
}

#[async_trait]
impl ReloadNotifier for RefreshNotifier {
    async fn notify(&self) -> Result<(), NotifyError> {
        {
            let _guard = self.lock.acquire().await;
            let report = self.injector.inject_all().await?;
            if !report.skipped.is_empty() {
                tracing::warn!("{} pages left without critical CSS", report.skipped.len());
            }
        }

        if let Some(hub) = &self.hub {
            let sent = hub.send(ReloadMessage::Rebuild);
            tracing::debug!("Sent rebuild to {} connections", sent);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    use quire_static::{
        CriticalCssCache, CriticalCssError, CriticalCssOptions, CriticalExtractor, ExtractRequest,
    };
    use tempfile::tempdir;

    struct Fixed(Option<&'static str>);

    #[async_trait]
    impl CriticalExtractor for Fixed {
        async fn extract(&self, _request: &ExtractRequest) -> Result<String, CriticalCssError> {
            self.0
                .map(str::to_string)
                .ok_or_else(|| CriticalCssError::Browser("no browser".into()))
        }
    }

    fn notifier(dir: &Path, css: Option<&'static str>, hub: Option<LiveReloadHub>) -> RefreshNotifier {
        fs::write(dir.join("index.html"), "<html><head><title>t</title></head></html>").unwrap();
        fs::write(dir.join("index.css"), "h1{}").unwrap();

        let cache = CriticalCssCache::new(
            CriticalCssOptions {
                output_dir: dir.to_path_buf(),
                stylesheets: vec!["index.css".into()],
                theme_template: String::new(),
                ..Default::default()
            },
            Arc::new(Fixed(css)),
        );
        RefreshNotifier::new(
            BuildLock::new(),
            CriticalCssInjector::new(dir, Arc::new(cache)),
            hub,
        )
    }

    #[tokio::test]
    async fn injects_then_broadcasts() {
        let temp = tempdir().unwrap();
        let hub = LiveReloadHub::new();
        let mut rx = hub.subscribe();
        let notifier = notifier(temp.path(), Some("h1{color:red}"), Some(hub));

        notifier.notify().await.unwrap();

        let html = fs::read_to_string(temp.path().join("index.html")).unwrap();
        assert!(html.contains("<style id=\"critical-css\">h1{color:red}</style>"));
        assert_eq!(rx.try_recv().unwrap(), ReloadMessage::Rebuild);
        assert!(!notifier.lock.is_locked());
    }

    #[tokio::test]
    async fn css_failure_skips_broadcast() {
        let temp = tempdir().unwrap();
        let hub = LiveReloadHub::new();
        let mut rx = hub.subscribe();
        let notifier = notifier(temp.path(), None, Some(hub));

        let err = notifier.notify().await.unwrap_err();

        assert!(matches!(err, NotifyError::Inject(InjectError::CriticalCss(_))));
        assert!(rx.try_recv().is_err());
        assert!(!notifier.lock.is_locked());
    }

    #[tokio::test]
    async fn works_without_hub() {
        let temp = tempdir().unwrap();
        let notifier = notifier(temp.path(), Some("h1{color:red}"), None);

        notifier.notify().await.unwrap();
    }
}
