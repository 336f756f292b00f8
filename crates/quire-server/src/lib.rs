//! Rebuild coordination and live-reload development server for quire.
//!
//! Rebuilds run one at a time behind a lock that the server also takes while
//! answering requests, so a page is never served from a half-written site.

pub mod builder;
pub mod coordinator;
pub mod lock;
pub mod refresh;
pub mod routing;
pub mod server;
pub mod watcher;
pub mod websocket;

pub use builder::{
    BuildContext, BuilderError, CleanupHandle, ModuleLoader, ProcessLoader, ProcessSiteBuilder,
    SiteBuilder, BUILD_ID_ENV,
};
pub use coordinator::{
    BuildRequest, CoordinatorOptions, RebuildCoordinator, RebuildError, RebuildOutcome,
};
pub use lock::{BuildGuard, BuildLock};
pub use refresh::{NotifyError, RefreshNotifier, ReloadNotifier};
pub use routing::{normalize_base_dir, resolve, Resolution};
pub use server::{router, DevServer, DevServerConfig, ServerError, ServerState};
pub use watcher::{FileWatcher, WatchError, WatchEvent, WatchFilter};
pub use websocket::{LiveReloadHub, ReloadMessage};
