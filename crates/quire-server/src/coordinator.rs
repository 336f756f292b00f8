//! Serialized, coalescing rebuilds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use quire_bundler::{BuildMetadata, Bundler, BundlerError};
use tokio::sync::Mutex;

use crate::builder::{BuildContext, BuilderError, CleanupHandle, ModuleLoader};
use crate::lock::BuildLock;
use crate::refresh::{NotifyError, ReloadNotifier};

/// Errors that end a rebuild cycle.
#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error(transparent)]
    Bundler(#[from] BundlerError),

    #[error(transparent)]
    Builder(#[from] BuilderError),

    #[error(transparent)]
    Notify(#[from] NotifyError),
}

/// A request to rebuild, ordered by when it was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildRequest {
    pub sequence: u64,
    pub requested_at: Instant,
}

/// What happened to a rebuild request.
#[derive(Debug)]
pub enum RebuildOutcome {
    /// The site was rebuilt
    Built(BuildMetadata),

    /// A newer request arrived first; nothing was done
    Superseded,
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorOptions {
    /// Arguments handed to the site builder
    pub args: Vec<String>,

    /// Log a per-input breakdown of the bundle after each build
    pub bundle_info: bool,
}

/// Runs rebuilds one at a time, dropping requests that have gone stale.
pub struct RebuildCoordinator {
    bundler: Mutex<Box<dyn Bundler>>,
    loader: Arc<dyn ModuleLoader>,
    notifier: Arc<dyn ReloadNotifier>,
    lock: BuildLock,
    latest: AtomicU64,
    cleanup: Mutex<Option<CleanupHandle>>,
    options: CoordinatorOptions,
}

impl RebuildCoordinator {
    pub fn new(
        bundler: Box<dyn Bundler>,
        loader: Arc<dyn ModuleLoader>,
        notifier: Arc<dyn ReloadNotifier>,
        lock: BuildLock,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            bundler: Mutex::new(bundler),
            loader,
            notifier,
            lock,
            latest: AtomicU64::new(0),
            cleanup: Mutex::new(None),
            options,
        }
    }

    pub fn lock(&self) -> &BuildLock {
        &self.lock
    }

    /// Record a new request. Every earlier request becomes stale.
    pub fn request(&self) -> BuildRequest {
        BuildRequest {
            sequence: self.latest.fetch_add(1, Ordering::SeqCst) + 1,
            requested_at: Instant::now(),
        }
    }

    /// Request a rebuild and run it.
    pub async fn rebuild(&self) -> Result<RebuildOutcome, RebuildError> {
        let request = self.request();
        self.run(request).await
    }

    /// Run `request` unless a newer one was made while it waited for the lock.
    pub async fn run(&self, request: BuildRequest) -> Result<RebuildOutcome, RebuildError> {
        let guard = self.lock.acquire().await;

        if self.latest.load(Ordering::SeqCst) > request.sequence {
            tracing::debug!(
                "Skipping rebuild #{} requested {:.2?} ago; a newer one is pending",
                request.sequence,
                request.requested_at.elapsed()
            );
            return Ok(RebuildOutcome::Superseded);
        }

        let previous = self.cleanup.lock().await.take();
        if let Some(cleanup) = previous {
            cleanup.run().await;
        }

        let (metadata, artifact) = {
            let mut bundler = self.bundler.lock().await;
            let metadata = bundler.rebuild().await?;
            (metadata, bundler.outfile())
        };
        drop(guard);

        tracing::info!(
            "Transpiled {} in {:.2?}",
            metadata.summary(&artifact),
            metadata.duration
        );
        if self.options.bundle_info {
            tracing::info!("Bundle analysis:{}", metadata.analyze());
        }

        let builder = self.loader.load(&artifact).await?;
        let cleanup = builder
            .build(BuildContext {
                args: self.options.args.clone(),
                lock: self.lock.clone(),
                notifier: Arc::clone(&self.notifier),
            })
            .await?;

        // A rebuild that overtook this one may already have stored its handle
        let overtaken = self.cleanup.lock().await.replace(cleanup);
        if let Some(cleanup) = overtaken {
            cleanup.run().await;
        }

        self.notifier.notify().await?;

        Ok(RebuildOutcome::Built(metadata))
    }

    /// Tear down the live build and release the bundler.
    pub async fn dispose(&self) {
        let _guard = self.lock.acquire().await;

        let cleanup = self.cleanup.lock().await.take();
        if let Some(cleanup) = cleanup {
            cleanup.run().await;
        }
        self.bundler.lock().await.dispose().await;
    }
}
