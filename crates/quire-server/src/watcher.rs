//! Source watching for rebuilds.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc as async_mpsc;

const DEBOUNCE: Duration = Duration::from_millis(100);

/// Errors from setting up the watcher.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Failed to create file watcher: {0}")]
    Create(#[source] notify::Error),

    #[error("Failed to watch {}: {source}", path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Events emitted by the file watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Created(path) | WatchEvent::Modified(path) | WatchEvent::Removed(path) => {
                path
            }
        }
    }
}

/// Which paths count as source changes.
#[derive(Debug, Clone)]
pub struct WatchFilter {
    pub extensions: Vec<String>,
    pub file_names: Vec<String>,

    /// Directories whose contents are never sources
    pub ignored_dirs: Vec<PathBuf>,
    pub ignored_names: Vec<String>,
}

impl Default for WatchFilter {
    fn default() -> Self {
        Self {
            extensions: ["ts", "tsx", "scss", "css"].map(String::from).to_vec(),
            file_names: vec!["package.json".to_string()],
            ignored_dirs: Vec::new(),
            ignored_names: ["node_modules", ".git"].map(String::from).to_vec(),
        }
    }
}

impl WatchFilter {
    /// Also ignore everything below `dir` (output, cache).
    pub fn ignore_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.ignored_dirs
            .push(std::fs::canonicalize(&dir).unwrap_or(dir));
        self
    }

    pub fn matches(&self, path: &Path) -> bool {
        if self.ignored_dirs.iter().any(|dir| path.starts_with(dir)) {
            return false;
        }

        if path.components().any(|c| {
            self.ignored_names
                .iter()
                .any(|name| c.as_os_str() == name.as_str())
        }) {
            return false;
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        self.file_names.iter().any(|name| name == file_name)
            || self.extensions.iter().any(|wanted| wanted == ext)
    }
}

/// File watcher for detecting source changes.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Create a new file watcher for the given paths.
    ///
    /// Returns the watcher and a channel to receive events. Bursts of events
    /// are delivered once the burst has been quiet for a moment.
    pub fn new(
        paths: &[PathBuf],
        filter: WatchFilter,
    ) -> Result<(Self, async_mpsc::Receiver<WatchEvent>), WatchError> {
        let (sync_tx, sync_rx) = mpsc::channel();
        let (async_tx, async_rx) = async_mpsc::channel(100);

        let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, _>| {
            if let Ok(event) = res {
                let _ = sync_tx.send(event);
            }
        })
        .map_err(WatchError::Create)?;

        for path in paths {
            if path.exists() {
                watcher
                    .watch(path, RecursiveMode::Recursive)
                    .map_err(|source| WatchError::Watch {
                        path: path.clone(),
                        source,
                    })?;
            }
        }

        std::thread::spawn(move || {
            while let Ok(event) = sync_rx.recv() {
                let mut batch = Vec::new();
                collect(&filter, event, &mut batch);

                while let Ok(event) = sync_rx.recv_timeout(DEBOUNCE) {
                    collect(&filter, event, &mut batch);
                }

                let mut seen = BTreeSet::new();
                for event in batch {
                    if seen.insert(event.clone()) && async_tx.blocking_send(event).is_err() {
                        return;
                    }
                }
            }
        });

        Ok((Self { _watcher: watcher }, async_rx))
    }
}

fn collect(filter: &WatchFilter, event: notify::Event, batch: &mut Vec<WatchEvent>) {
    for path in &event.paths {
        if filter.matches(path) {
            if let Some(e) = classify_event(path, &event.kind) {
                batch.push(e);
            }
        }
    }
}

/// Classify a notify event into a WatchEvent.
fn classify_event(path: &Path, kind: &notify::EventKind) -> Option<WatchEvent> {
    use notify::EventKind;

    match kind {
        EventKind::Create(_) => Some(WatchEvent::Created(path.to_path_buf())),
        EventKind::Remove(_) => Some(WatchEvent::Removed(path.to_path_buf())),
        EventKind::Modify(_) => Some(WatchEvent::Modified(path.to_path_buf())),
        _ => None,
    }
}

impl PartialOrd for WatchEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WatchEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let rank = |e: &WatchEvent| match e {
            WatchEvent::Created(_) => 0,
            WatchEvent::Modified(_) => 1,
            WatchEvent::Removed(_) => 2,
        };
        rank(self)
            .cmp(&rank(other))
            .then_with(|| self.path().cmp(other.path()))
    }
}
