//! Loading and running the compiled site builder.
//!
//! The compiled module runs in a child process started fresh for every build.
//! It reports progress as JSON lines on stdout:
//!
//! - `{"type":"ready"}`: the initial build is written and the child keeps
//!   running (serve mode)
//! - `{"type":"rebuilt"}`: the child rewrote output on its own
//! - `{"type":"lock"}` / `{"type":"unlock"}`: take or release the build lock;
//!   the parent answers `{"type":"locked"}` on stdin once it holds the lock
//!
//! Any other line is logged as is. A child that exits successfully without
//! `ready` was a one-shot build.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdout, Command};

use crate::lock::{BuildGuard, BuildLock};
use crate::refresh::ReloadNotifier;

/// Environment variable carrying the per-load build id.
pub const BUILD_ID_ENV: &str = "QUIRE_BUILD_ID";

/// Errors from loading or running the site builder.
#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("Compiled site builder not found at {}", path.display())]
    MissingArtifact { path: PathBuf },

    #[error("Failed to start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Site builder exited with {0}")]
    Failed(ExitStatus),

    #[error("Lost contact with site builder: {0}")]
    Ipc(#[from] std::io::Error),
}

/// Tears down whatever the previous build left running.
pub struct CleanupHandle(Option<BoxFuture<'static, ()>>);

impl CleanupHandle {
    /// A handle with nothing to clean up.
    pub fn noop() -> Self {
        Self(None)
    }

    pub fn new<F>(cleanup: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(Some(Box::pin(cleanup)))
    }

    pub async fn run(self) {
        if let Some(cleanup) = self.0 {
            cleanup.await;
        }
    }
}

impl std::fmt::Debug for CleanupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CleanupHandle")
            .field(&self.0.as_ref().map(|_| ".."))
            .finish()
    }
}

/// What a site builder gets to work with.
#[derive(Clone)]
pub struct BuildContext {
    /// Command-line arguments quire was started with
    pub args: Vec<String>,

    pub lock: BuildLock,

    /// Called when the builder rewrites output on its own
    pub notifier: Arc<dyn ReloadNotifier>,
}

/// A loaded site builder.
#[async_trait]
pub trait SiteBuilder: Send {
    /// Identifier unique to this load.
    fn build_id(&self) -> &str;

    /// Build the site. The returned handle undoes anything left running.
    async fn build(self: Box<Self>, ctx: BuildContext) -> Result<CleanupHandle, BuilderError>;
}

/// Loads the compiled module.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self, artifact: &Path) -> Result<Box<dyn SiteBuilder>, BuilderError>;
}

/// Runs the compiled module with a JavaScript runtime.
#[derive(Debug, Clone)]
pub struct ProcessLoader {
    runtime: PathBuf,
}

impl ProcessLoader {
    pub fn new(runtime: impl Into<PathBuf>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }
}

impl Default for ProcessLoader {
    fn default() -> Self {
        Self::new("node")
    }
}

#[async_trait]
impl ModuleLoader for ProcessLoader {
    async fn load(&self, artifact: &Path) -> Result<Box<dyn SiteBuilder>, BuilderError> {
        if tokio::fs::metadata(artifact).await.is_err() {
            return Err(BuilderError::MissingArtifact {
                path: artifact.to_path_buf(),
            });
        }

        Ok(Box::new(ProcessSiteBuilder {
            runtime: self.runtime.clone(),
            artifact: artifact.to_path_buf(),
            build_id: uuid::Uuid::new_v4().to_string(),
        }))
    }
}

/// One run of the compiled module in a child process.
#[derive(Debug)]
pub struct ProcessSiteBuilder {
    runtime: PathBuf,
    artifact: PathBuf,
    build_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChildMessage {
    Ready,
    Rebuilt,
    Lock,
    Unlock,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ParentMessage {
    Locked,
}

#[async_trait]
impl SiteBuilder for ProcessSiteBuilder {
    fn build_id(&self) -> &str {
        &self.build_id
    }

    async fn build(self: Box<Self>, ctx: BuildContext) -> Result<CleanupHandle, BuilderError> {
        tracing::debug!("Loading {} ({})", self.artifact.display(), self.build_id);

        let mut child = Command::new(&self.runtime)
            .arg(&self.artifact)
            .args(&ctx.args)
            .env(BUILD_ID_ENV, &self.build_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BuilderError::Spawn {
                program: self.runtime.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(BuilderError::Ipc(std::io::Error::other(
                "site builder pipes unavailable",
            )));
        };

        let mut lines = BufReader::new(stdout).lines();
        let mut session = Session {
            stdin,
            lock: ctx.lock,
            guard: None,
            notifier: ctx.notifier,
        };

        while let Some(line) = lines.next_line().await? {
            match parse_message(&line) {
                Some(ChildMessage::Ready) => {
                    let task = tokio::spawn(async move {
                        session.pump(&mut lines).await;
                        match child.wait().await {
                            Ok(status) if !status.success() => {
                                tracing::warn!("Site builder exited with {}", status)
                            }
                            Err(e) => tracing::warn!("Failed to wait for site builder: {}", e),
                            Ok(_) => {}
                        }
                    });

                    // Aborting drops the child, which kills it
                    return Ok(CleanupHandle::new(async move {
                        task.abort();
                        let _ = task.await;
                    }));
                }
                Some(message) => session.handle(message).await?,
                None => forward(&line),
            }
        }

        drop(session);
        let status = child.wait().await?;
        if status.success() {
            Ok(CleanupHandle::noop())
        } else {
            Err(BuilderError::Failed(status))
        }
    }
}

struct Session<W> {
    stdin: W,
    lock: BuildLock,
    guard: Option<BuildGuard>,
    notifier: Arc<dyn ReloadNotifier>,
}

impl<W: AsyncWrite + Unpin + Send> Session<W> {
    async fn handle(&mut self, message: ChildMessage) -> Result<(), BuilderError> {
        match message {
            ChildMessage::Lock => {
                if self.guard.is_none() {
                    self.guard = Some(self.lock.acquire().await);
                }
                self.reply(ParentMessage::Locked).await?;
            }
            ChildMessage::Unlock => self.guard = None,
            ChildMessage::Rebuilt => {
                // The notifier takes the lock itself
                self.guard = None;
                if let Err(e) = self.notifier.notify().await {
                    tracing::error!("{}", e);
                }
            }
            ChildMessage::Ready => {}
        }
        Ok(())
    }

    async fn reply(&mut self, message: ParentMessage) -> Result<(), BuilderError> {
        let mut line = serde_json::to_string(&message).map_err(std::io::Error::other)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Serve the child until its stdout closes.
    async fn pump(&mut self, lines: &mut Lines<BufReader<ChildStdout>>) {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_message(&line) {
                    Some(message) => {
                        if let Err(e) = self.handle(message).await {
                            tracing::warn!("{}", e);
                            return;
                        }
                    }
                    None => forward(&line),
                },
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!("Failed to read from site builder: {}", e);
                    return;
                }
            }
        }
    }
}

fn parse_message(line: &str) -> Option<ChildMessage> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

fn forward(line: &str) {
    if !line.trim().is_empty() {
        tracing::info!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::NotifyError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Default)]
    struct CountingNotifier(AtomicUsize);

    #[async_trait]
    impl ReloadNotifier for CountingNotifier {
        async fn notify(&self) -> Result<(), NotifyError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn context(notifier: Arc<CountingNotifier>, args: &[&str]) -> BuildContext {
        BuildContext {
            args: args.iter().map(|s| s.to_string()).collect(),
            lock: BuildLock::new(),
            notifier,
        }
    }

    #[test]
    fn parses_child_messages() {
        assert_eq!(parse_message(r#"{"type":"ready"}"#), Some(ChildMessage::Ready));
        assert_eq!(parse_message(r#" {"type":"lock"} "#), Some(ChildMessage::Lock));
        assert_eq!(parse_message(r#"{"type":"unknown"}"#), None);
        assert_eq!(parse_message("Building 42 pages"), None);
    }

    #[tokio::test]
    async fn missing_artifact_is_reported() {
        let temp = tempdir().unwrap();
        let loader = ProcessLoader::default();

        let err = loader
            .load(&temp.path().join("transpiled-build.mjs"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BuilderError::MissingArtifact { .. }));
    }

    #[tokio::test]
    async fn each_load_gets_a_new_build_id() {
        let temp = tempdir().unwrap();
        let artifact = temp.path().join("transpiled-build.mjs");
        std::fs::write(&artifact, "").unwrap();
        let loader = ProcessLoader::default();

        let first = loader.load(&artifact).await.unwrap();
        let second = loader.load(&artifact).await.unwrap();
        assert_ne!(first.build_id(), second.build_id());
    }

    #[cfg(unix)]
    async fn run_script(
        script: &str,
        args: &[&str],
    ) -> (Result<CleanupHandle, BuilderError>, Arc<CountingNotifier>, BuildLock) {
        let temp = tempdir().unwrap();
        let artifact = temp.path().join("build.sh");
        std::fs::write(&artifact, script).unwrap();

        let builder = ProcessLoader::new("sh").load(&artifact).await.unwrap();
        let notifier = Arc::new(CountingNotifier::default());
        let ctx = context(notifier.clone(), args);
        let lock = ctx.lock.clone();

        (builder.build(ctx).await, notifier, lock)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn one_shot_build_succeeds() {
        let (result, notifier, _) = run_script(
            "echo \"building with $1 $2\"\necho '{\"type\":\"rebuilt\"}'\nexit 0\n",
            &["build", "--output"],
        )
        .await;

        result.unwrap().run().await;
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_build_is_an_error() {
        let (result, _, _) = run_script("echo oops >&2\nexit 3\n", &[]).await;

        assert!(matches!(result, Err(BuilderError::Failed(status)) if status.code() == Some(3)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn passes_build_id() {
        let (result, notifier, _) = run_script(
            "[ -n \"$QUIRE_BUILD_ID\" ] && echo '{\"type\":\"rebuilt\"}'\n",
            &[],
        )
        .await;

        result.unwrap();
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lock_requests_are_answered() {
        let (result, notifier, lock) = run_script(
            r#"echo '{"type":"lock"}'
read reply
case "$reply" in *locked*) ;; *) exit 9 ;; esac
echo '{"type":"unlock"}'
echo '{"type":"rebuilt"}'
"#,
            &[],
        )
        .await;

        result.unwrap();
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
        assert!(!lock.is_locked());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ready_child_keeps_running_until_cleanup() {
        let (result, notifier, lock) = run_script(
            r#"echo '{"type":"ready"}'
sleep 0.1
echo '{"type":"rebuilt"}'
sleep 30
"#,
            &[],
        )
        .await;

        let cleanup = result.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);

        tokio::time::timeout(Duration::from_secs(5), cleanup.run())
            .await
            .unwrap();
        assert!(!lock.is_locked());
    }
}
