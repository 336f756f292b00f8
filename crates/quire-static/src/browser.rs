//! Critical CSS extraction in headless Chrome.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::Page;
use futures::{stream, Stream, StreamExt};
use tracing::{debug, warn};

use crate::critical::{CriticalCssError, CriticalExtractor, ExtractRequest};

const EXTRACT_SCRIPT: &str = include_str!("extract_critical.js");

/// Renders the page in a fresh headless Chrome and keeps the CSS rules that
/// apply above the fold.
#[derive(Debug, Clone, Default)]
pub struct BrowserExtractor {
    /// Chrome executable (None = auto-detect)
    pub chrome_path: Option<PathBuf>,
}

impl BrowserExtractor {
    pub fn new(chrome_path: Option<PathBuf>) -> Self {
        Self { chrome_path }
    }

    fn browser_config(&self, (width, height): (u32, u32)) -> Result<BrowserConfig, CriticalCssError> {
        // A unique profile keeps parallel runs from fighting over the singleton lock
        let user_data_dir =
            std::env::temp_dir().join(format!("quire-critical-{}", uuid::Uuid::new_v4()));

        let mut config = BrowserConfig::builder()
            .arg("--headless")
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg(format!("--window-size={},{}", width, height))
            .arg(format!("--user-data-dir={}", user_data_dir.display()))
            .viewport(Viewport {
                width,
                height,
                ..Default::default()
            });

        if let Some(path) = &self.chrome_path {
            config = config.chrome_executable(path.clone());
        }

        config
            .build()
            .map_err(|e| CriticalCssError::Browser(format!("invalid browser configuration: {e}")))
    }

    async fn run(&self, browser: &Browser, request: &ExtractRequest) -> Result<String, CriticalCssError> {
        let page = tokio::fs::canonicalize(&request.page)
            .await
            .map_err(|source| CriticalCssError::Io {
                path: request.page.clone(),
                source,
            })?;
        let url = format!("file://{}", page.display());

        let tab = browser
            .new_page("about:blank")
            .await
            .map_err(|e| CriticalCssError::Browser(e.to_string()))?;

        // Subscribe before navigating so the page's first requests are seen
        let network = network_events(&tab).await?;

        debug!("Loading {} for critical CSS", url);
        tokio::time::timeout(request.wait.navigation_timeout, tab.goto(url.as_str()))
            .await
            .map_err(|_| CriticalCssError::Timeout {
                url: url.clone(),
                timeout: request.wait.navigation_timeout,
            })?
            .map_err(|e| CriticalCssError::Navigation {
                url: url.clone(),
                message: e.to_string(),
            })?;

        let idle = wait_for_idle(network, request.wait.network_idle);
        if tokio::time::timeout(request.wait.navigation_timeout, idle)
            .await
            .is_err()
        {
            warn!(
                "{} still had requests in flight after {:?}; extracting anyway",
                url, request.wait.navigation_timeout
            );
        }

        tokio::time::sleep(request.wait.settle).await;

        let script = extraction_script(&request.stylesheets)?;
        let css: String = tab
            .evaluate(script.as_str())
            .await
            .map_err(|e| CriticalCssError::Script(e.to_string()))?
            .into_value()
            .map_err(|e| CriticalCssError::Script(e.to_string()))?;

        Ok(css)
    }
}

#[async_trait]
impl CriticalExtractor for BrowserExtractor {
    async fn extract(&self, request: &ExtractRequest) -> Result<String, CriticalCssError> {
        let config = self.browser_config(request.viewport)?;

        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| CriticalCssError::Browser(format!("failed to launch Chrome: {e}")))?;

        // chromiumoxide only processes CDP events while the handler is polled
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("Browser handler error: {}", e);
                }
            }
        });

        let result = self.run(&browser, request).await;

        if let Err(e) = browser.close().await {
            debug!("Failed to close browser cleanly: {}", e);
        }
        events.abort();

        result
    }
}

/// A request starting or ending, by CDP request id.
#[derive(Debug, Clone, PartialEq, Eq)]
enum NetworkEvent {
    Started(String),
    Done(String),
}

fn cdp_error(e: CdpError) -> CriticalCssError {
    CriticalCssError::Browser(e.to_string())
}

/// Request events for `page`, from the moment of subscribing.
async fn network_events(
    page: &Page,
) -> Result<impl Stream<Item = NetworkEvent> + Unpin + Send, CriticalCssError> {
    let sent = page
        .event_listener::<EventRequestWillBeSent>()
        .await
        .map_err(cdp_error)?
        .map(|e| NetworkEvent::Started(e.request_id.inner().clone()));
    let finished = page
        .event_listener::<EventLoadingFinished>()
        .await
        .map_err(cdp_error)?
        .map(|e| NetworkEvent::Done(e.request_id.inner().clone()));
    let failed = page
        .event_listener::<EventLoadingFailed>()
        .await
        .map_err(cdp_error)?
        .map(|e| NetworkEvent::Done(e.request_id.inner().clone()));

    Ok(stream::select(sent, stream::select(finished, failed)))
}

/// Resolves once no request has been in flight for `quiet`, or the events end.
async fn wait_for_idle<S>(mut events: S, quiet: Duration)
where
    S: Stream<Item = NetworkEvent> + Unpin,
{
    let mut in_flight: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(NetworkEvent::Started(id)) => {
                    in_flight.insert(id);
                }
                Some(NetworkEvent::Done(id)) => {
                    in_flight.remove(&id);
                }
                None => return,
            },
            _ = tokio::time::sleep(quiet), if in_flight.is_empty() => return,
        }
    }
}

/// The in-page extraction script with the stylesheet sources embedded.
fn extraction_script(stylesheets: &[String]) -> Result<String, CriticalCssError> {
    let sources =
        serde_json::to_string(stylesheets).map_err(|e| CriticalCssError::Script(e.to_string()))?;
    Ok(EXTRACT_SCRIPT.replace("__STYLESHEETS__", &sources))
}
