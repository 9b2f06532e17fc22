//! Route table and HTTP handler.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A URL path backed by a file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub source_path: PathBuf,
    pub route_path: String,
    pub registered_at: Instant,
}

/// Shared map from URL path to file.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Arc<RwLock<HashMap<String, Route>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `route_path` (a leading `/` is added if missing) and return
    /// the normalized path. Re-registering a path replaces its file.
    pub async fn insert(&self, source_path: &Path, route_path: &str) -> String {
        let route_path = normalize(route_path);
        let route = Route {
            source_path: source_path.to_path_buf(),
            route_path: route_path.clone(),
            registered_at: Instant::now(),
        };
        self.routes.write().await.insert(route_path.clone(), route);
        route_path
    }

    pub async fn remove(&self, route_path: &str) -> Option<Route> {
        self.routes.write().await.remove(&normalize(route_path))
    }

    pub async fn source(&self, route_path: &str) -> Option<PathBuf> {
        self.routes
            .read()
            .await
            .get(route_path)
            .map(|r| r.source_path.clone())
    }

    pub async fn len(&self) -> usize {
        self.routes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.routes.read().await.is_empty()
    }

    /// Remove and return every route registered more than `max_age` ago.
    pub async fn take_expired(&self, max_age: Duration) -> Vec<Route> {
        let now = Instant::now();
        let mut routes = self.routes.write().await;
        let expired: Vec<String> = routes
            .values()
            .filter(|r| now.duration_since(r.registered_at) > max_age)
            .map(|r| r.route_path.clone())
            .collect();
        expired
            .iter()
            .filter_map(|path| routes.remove(path))
            .collect()
    }
}

fn normalize(route_path: &str) -> String {
    if route_path.starts_with('/') {
        route_path.to_string()
    } else {
        format!("/{route_path}")
    }
}

/// Build the HTTP router serving every registered route.
pub fn build_router(table: RouteTable) -> Router {
    Router::new().fallback(serve_file).with_state(table)
}

async fn serve_file(State(table): State<RouteTable>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let Some(path) = table.source(uri.path()).await else {
        debug!(route = uri.path(), "No such route");
        return StatusCode::NOT_FOUND.into_response();
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let content_type = mime_guess::from_path(&path).first_or_octet_stream();
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, content_type.essence_str().to_string())],
                bytes,
            )
                .into_response()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(route = uri.path(), path = %path.display(), "Routed file vanished");
            StatusCode::NOT_FOUND.into_response()
        }
        Err(e) => {
            warn!(
                route = uri.path(),
                path = %path.display(),
                error = %e,
                "Failed to read routed file"
            );
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
