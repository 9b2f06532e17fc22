//! HTTP listener lifecycle and route expiry.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rand::RngExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use kernelhub_core::config::FileServerConfig;

use super::routes::{RouteTable, build_router};

/// File server errors.
#[derive(Debug, thiserror::Error)]
pub enum FileServerError {
    #[error("Failed to bind {host} after {attempts} attempts: {reason}")]
    Bind {
        host: String,
        attempts: u32,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serves registered files over loopback HTTP.
#[derive(Debug)]
pub struct FileServer {
    config: FileServerConfig,
    routes: RouteTable,
    addr: OnceLock<SocketAddr>,
}

impl FileServer {
    pub fn new(config: FileServerConfig) -> Self {
        Self {
            config,
            routes: RouteTable::new(),
            addr: OnceLock::new(),
        }
    }

    pub const fn config(&self) -> &FileServerConfig {
        &self.config
    }

    pub const fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Bind a random port in the configured range and serve until `shutdown`
    /// flips to `true`. Starting twice returns the existing address.
    pub async fn start(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<SocketAddr, FileServerError> {
        if let Some(addr) = self.addr.get() {
            return Ok(*addr);
        }

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "File server could not start");
                return Err(e);
            }
        };
        let addr = listener.local_addr()?;
        let _ = self.addr.set(addr);

        let app = build_router(self.routes.clone());
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = served {
                error!(%addr, error = %e, "File server stopped with error");
            } else {
                info!(%addr, "File server stopped");
            }
        });

        info!(%addr, "File server listening");
        Ok(addr)
    }

    async fn bind(&self) -> Result<TcpListener, FileServerError> {
        let host = self.config.host.as_str();
        let attempts = self.config.bind_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let port = pick_port(self.config.port_range_start, self.config.port_range_end);
            match TcpListener::bind((host, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    debug!(host, port, attempt, error = %e, "Port unavailable");
                    last_error = Some(e);
                }
            }
        }

        Err(FileServerError::Bind {
            host: host.to_string(),
            attempts,
            reason: last_error.map_or_else(String::new, |e| e.to_string()),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addr.get().copied()
    }

    /// `http://host:port` once started.
    pub fn base_url(&self) -> Option<String> {
        self.local_addr().map(|addr| format!("http://{addr}"))
    }

    /// Serve `path` at `route_path`. Returns the normalized route.
    pub async fn add_route(&self, path: &Path, route_path: &str) -> String {
        let route = self.routes.insert(path, route_path).await;
        debug!(route = %route, path = %path.display(), "Route added");
        route
    }

    /// Stop serving `route_path`. The file itself is left alone.
    pub async fn remove_route(&self, route_path: &str) -> bool {
        self.routes.remove(route_path).await.is_some()
    }

    pub async fn route_count(&self) -> usize {
        self.routes.len().await
    }

    /// Drop routes older than `max_age` and delete their files.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let expired = self.routes.take_expired(max_age).await;
        for route in &expired {
            match tokio::fs::remove_file(&route.source_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    route = %route.route_path,
                    path = %route.source_path.display(),
                    error = %e,
                    "Failed to delete expired file"
                ),
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Swept expired routes");
        }
        expired.len()
    }

    /// Sweep every `sweep_interval` with `route_ttl` until `shutdown`.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let interval = server.config.sweep_interval().max(Duration::from_secs(1));
            let ttl = server.config.route_ttl();
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        server.sweep(ttl).await;
                    }
                    _ = shutdown.changed() => {
                        debug!("Route sweeper shutting down");
                        return;
                    }
                }
            }
        })
    }
}

/// Random port in `[start, end)`, or `start` when the range is empty.
fn pick_port(start: u16, end: u16) -> u16 {
    if end <= start {
        return start;
    }
    rand::rng().random_range(start..end)
}
