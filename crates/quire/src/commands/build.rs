//! Build command: one-shot build, or build-and-serve with live reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use quire_bundler::{BundlerContext, BundlerOptions};
use quire_server::{
    normalize_base_dir, BuildLock, CoordinatorOptions, DevServer, DevServerConfig, FileWatcher,
    LiveReloadHub, ProcessLoader, RebuildCoordinator, RebuildOutcome, RefreshNotifier,
    WatchFilter,
};
use quire_static::{BrowserExtractor, CriticalCssCache, CriticalCssInjector};

use crate::config::ConfigFile;

#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    /// Serve the site and rebuild on source changes
    #[arg(long)]
    pub serve: bool,

    /// Print what went into the compiled site builder
    #[arg(long)]
    pub bundle_info: bool,

    /// Output directory
    #[arg(short, long, default_value = "public")]
    pub output: PathBuf,

    /// Content directory (read by the site builder)
    #[arg(short, long, default_value = "content")]
    pub directory: PathBuf,

    /// URL prefix the site is served under
    #[arg(long, default_value = "")]
    pub base_dir: String,

    /// HTTP port
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Live-reload WebSocket port
    #[arg(long, default_value_t = 3001)]
    pub ws_port: u16,

    /// Worker count (read by the site builder)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Open the site in a browser once serving
    #[arg(long)]
    pub open: bool,
}

/// Run the build command. `raw_args` is handed to the site builder unchanged.
pub async fn run(args: BuildArgs, config: ConfigFile, raw_args: Vec<String>) -> Result<()> {
    let root = std::env::current_dir().context("Failed to read current directory")?;
    let output_dir = root.join(&args.output);

    tracing::debug!(
        "Building {} into {} (concurrency {:?})",
        args.directory.display(),
        output_dir.display(),
        args.concurrency
    );

    let lock = BuildLock::new();
    let hub = LiveReloadHub::new();
    let coordinator = Arc::new(coordinator(
        &args,
        &config,
        &root,
        &output_dir,
        lock.clone(),
        args.serve.then(|| hub.clone()),
        raw_args,
    ));

    let initial = coordinator.rebuild().await;
    if !args.serve || initial.is_err() {
        coordinator.dispose().await;
        initial.with_context(|| format!("Build failed for {}", config.build.entry_point.display()))?;
        return Ok(());
    }

    let filter = WatchFilter::default()
        .ignore_dir(&output_dir)
        .ignore_dir(root.join(&config.build.cache_dir));
    let watch: Vec<PathBuf> = config.build.watch.iter().map(|p| root.join(p)).collect();
    let (watcher, mut rx) = FileWatcher::new(&watch, filter)?;

    let watch_coordinator = Arc::clone(&coordinator);
    let watch_task = tokio::spawn(async move {
        // Keep watcher alive
        let _watcher = watcher;

        while let Some(event) = rx.recv().await {
            tracing::info!("Detected a source code change, doing a hard rebuild...");
            tracing::debug!("{:?}", event);

            let coordinator = Arc::clone(&watch_coordinator);
            tokio::spawn(async move {
                match coordinator.rebuild().await {
                    Ok(RebuildOutcome::Built(_)) | Ok(RebuildOutcome::Superseded) => {}
                    Err(e) => tracing::error!("Rebuild failed: {:#}", anyhow::Error::new(e)),
                }
            });
        }
    });

    let server = DevServer::new(
        DevServerConfig {
            output_dir,
            base_dir: normalize_base_dir(&args.base_dir),
            host: config.serve.host.clone(),
            port: args.port,
            ws_port: args.ws_port,
            open: args.open || config.serve.open,
        },
        lock,
        hub,
    );

    let served = server
        .start(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await;

    watch_task.abort();
    coordinator.dispose().await;
    served?;

    Ok(())
}

fn coordinator(
    args: &BuildArgs,
    config: &ConfigFile,
    root: &Path,
    output_dir: &Path,
    lock: BuildLock,
    hub: Option<LiveReloadHub>,
    raw_args: Vec<String>,
) -> RebuildCoordinator {
    let bundler = BundlerContext::new(BundlerOptions {
        root: root.to_path_buf(),
        entry_point: config.build.entry_point.clone(),
        outfile: config.build.cache_dir.join("transpiled-build.mjs"),
        source_dir: config.build.source_dir.clone(),
        bundler: config.build.bundler.clone(),
        runtime: config.build.runtime.clone(),
    });

    let extractor = BrowserExtractor::new(config.critical.chrome_path.clone());
    let cache = CriticalCssCache::new(config.critical_options(output_dir), Arc::new(extractor));
    let injector = CriticalCssInjector::new(output_dir, Arc::new(cache));
    let notifier = RefreshNotifier::new(lock.clone(), injector, hub);

    RebuildCoordinator::new(
        Box::new(bundler),
        Arc::new(ProcessLoader::new(&config.build.runtime)),
        Arc::new(notifier),
        lock,
        CoordinatorOptions {
            args: raw_args,
            bundle_info: args.bundle_info,
        },
    )
}
