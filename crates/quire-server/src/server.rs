//! Development server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use owo_colors::OwoColorize;
use tower::ServiceExt;
use tower_http::services::ServeDir;

use crate::lock::BuildLock;
use crate::routing::{resolve, Resolution};
use crate::websocket::LiveReloadHub;

/// Configuration for the development server.
#[derive(Debug, Clone)]
pub struct DevServerConfig {
    /// Built site
    pub output_dir: PathBuf,

    /// URL prefix the site is served under, already normalized
    pub base_dir: String,

    /// Host to bind to
    pub host: String,

    /// HTTP port
    pub port: u16,

    /// Live-reload WebSocket port
    pub ws_port: u16,

    /// Open browser on start
    pub open: bool,
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("public"),
            base_dir: String::new(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            ws_port: 3001,
            open: false,
        }
    }
}

/// Errors that can occur with the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid address {0}")]
    InvalidAddress(String),

    #[error("Failed to bind to {0}: {1}")]
    Bind(SocketAddr, String),

    #[error("Server error: {0}")]
    Serve(String),
}

/// Shared server state.
#[derive(Debug)]
pub struct ServerState {
    pub config: DevServerConfig,
    pub lock: BuildLock,
}

/// Router serving the output directory.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new().fallback(serve_request).with_state(state)
}

/// Development server.
pub struct DevServer {
    config: DevServerConfig,
    lock: BuildLock,
    hub: LiveReloadHub,
}

impl DevServer {
    pub fn new(config: DevServerConfig, lock: BuildLock, hub: LiveReloadHub) -> Self {
        Self { config, lock, hub }
    }

    fn addr(&self, port: u16) -> Result<SocketAddr, ServerError> {
        let addr = format!("{}:{}", self.config.host, port);
        addr.parse().map_err(|_| ServerError::InvalidAddress(addr))
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.addr(self.config.port)?;
        let ws_addr = self.addr(self.config.ws_port)?;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(addr, e.to_string()))?;
        let ws_listener = tokio::net::TcpListener::bind(ws_addr)
            .await
            .map_err(|e| ServerError::Bind(ws_addr, e.to_string()))?;

        let ws_app = self.hub.router();
        let ws_server = tokio::spawn(async move {
            let service = ws_app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(ws_listener, service).await {
                tracing::error!("Live reload server failed: {}", e);
            }
        });

        let url = format!("http://{}{}/", addr, self.config.base_dir);
        tracing::info!("Serving at {}", url);
        tracing::info!("Live reload at ws://{}", ws_addr);

        if self.config.open {
            let _ = open::that(&url);
        }

        let app = router(Arc::new(ServerState {
            config: self.config,
            lock: self.lock,
        }));

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Serve(e.to_string()));

        ws_server.abort();
        result
    }
}

async fn serve_request(State(state): State<Arc<ServerState>>, request: Request) -> Response {
    let uri = request.uri().clone();
    let method = request.method().clone();
    let base_dir = &state.config.base_dir;

    // Never serve a half-written output tree
    let _guard = state.lock.acquire().await;

    match resolve(&state.config.output_dir, base_dir, uri.path(), uri.query()) {
        Resolution::OutsideBase => {
            tracing::warn!(
                "{} {} {} is outside {}; is a link missing the base dir?",
                "[404]".red(),
                method,
                uri.path(),
                base_dir
            );
            StatusCode::NOT_FOUND.into_response()
        }

        Resolution::Redirect(location) => {
            tracing::info!("{} {} {} -> {}", "[302]".yellow(), method, uri.path(), location);
            match HeaderValue::from_str(&location) {
                Ok(location) => (StatusCode::FOUND, [(header::LOCATION, location)]).into_response(),
                Err(_) => StatusCode::BAD_REQUEST.into_response(),
            }
        }

        Resolution::Serve(path) => {
            let target = match uri.query() {
                Some(query) => format!("{}?{}", path, query),
                None => path,
            };
            let Ok(target) = target.parse::<Uri>() else {
                return StatusCode::BAD_REQUEST.into_response();
            };

            let mut request = request;
            *request.uri_mut() = target;

            let mut response = serve_file(&state, request).await;
            response.headers_mut().insert(
                header::CONTENT_DISPOSITION,
                HeaderValue::from_static("inline"),
            );

            let status = response.status();
            let tag = format!("[{}]", status.as_u16());
            if status.is_success() {
                tracing::info!("{} {} {}", tag.green(), method, uri.path());
            } else {
                tracing::info!("{} {} {}", tag.red(), method, uri.path());
            }
            response
        }
    }
}

/// Serve from the output directory, reading the whole body so the file is
/// not touched after the lock is released.
async fn serve_file(state: &ServerState, request: Request) -> Response {
    let service = ServeDir::new(&state.config.output_dir).append_index_html_on_directories(false);
    let response = match service.oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };

    let (parts, body) = response.into_parts();
    match axum::body::to_bytes(Body::new(body), usize::MAX).await {
        Ok(bytes) => Response::from_parts(parts, Body::from(bytes)),
        Err(e) => {
            tracing::error!("Failed to read {}: {}", parts.status, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
