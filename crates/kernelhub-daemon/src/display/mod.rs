//! Display-data materializer.
//!
//! Rewrites `display_data` events so that large rich payloads (HTML, PNG,
//! SVG) are written to temporary files, served by the [`FileServer`], and
//! replaced in the event by their route.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use kernelhub_core::protocol::KernelEvent;

use crate::files::FileServer;

/// Payload shapes a display mime key is decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Text,
    Base64,
}

/// Mime keys that are materialized, with their file extension.
const DISPLAY_KINDS: [(&str, &str, Encoding); 4] = [
    ("text/html", ".html", Encoding::Text),
    ("image/png", ".png", Encoding::Base64),
    ("image/svg+xml", ".svg", Encoding::Text),
    ("image/svg", ".svg", Encoding::Text),
];

/// Errors from materializing a display event.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Failed to decode {key}: {reason}")]
    Decode { key: String, reason: String },

    #[error("Invalid {key} payload: expected a string")]
    InvalidPayload { key: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether `event` is a display event with at least one data entry.
pub fn is_display_event(event: &KernelEvent) -> bool {
    event.msg_type() == Some("display_data")
        && event
            .payload
            .pointer("/content/data")
            .and_then(Value::as_object)
            .is_some_and(|data| !data.is_empty())
}

struct Written {
    key: &'static str,
    path: PathBuf,
    route: String,
}

/// Writes display payloads to files and registers them with the file server.
#[derive(Debug, Clone)]
pub struct DisplayMaterializer {
    files: Arc<FileServer>,
    temp_dir: PathBuf,
}

impl DisplayMaterializer {
    pub fn new(files: Arc<FileServer>) -> Self {
        let temp_dir = files.config().temp_dir();
        Self { files, temp_dir }
    }

    #[must_use]
    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    /// Rewrite a display event in place; anything else passes through.
    ///
    /// Every present mime kind is written concurrently. If any of them fails
    /// the files already written are removed and the event is left untouched.
    pub async fn materialize(&self, mut event: KernelEvent) -> Result<KernelEvent, TransformError> {
        if !is_display_event(&event) {
            return Ok(event);
        }

        let jobs = decode_all(&event)?;
        if jobs.is_empty() {
            return Ok(event);
        }

        let mut tasks = JoinSet::new();
        for (key, extension, bytes) in jobs {
            let files = Arc::clone(&self.files);
            let temp_dir = self.temp_dir.clone();
            tasks.spawn(async move {
                let path = tokio::task::spawn_blocking(move || {
                    write_temp_file(&temp_dir, extension, &bytes)
                })
                .await
                .map_err(std::io::Error::other)??;
                let route = files.add_route(&path, &route_for(&path)).await;
                Ok::<_, TransformError>(Written { key, path, route })
            });
        }

        let mut written = Vec::new();
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(|e| TransformError::Io(std::io::Error::other(e))) {
                Ok(Ok(file)) => written.push(file),
                Ok(Err(e)) | Err(e) => failure = failure.or(Some(e)),
            }
        }

        if let Some(e) = failure {
            self.discard(&written).await;
            return Err(e);
        }

        if let Some(data) = event
            .payload
            .pointer_mut("/content/data")
            .and_then(Value::as_object_mut)
        {
            for file in written {
                debug!(key = file.key, route = %file.route, "Display data materialized");
                data.insert(file.key.to_string(), Value::String(file.route));
            }
        }
        Ok(event)
    }

    async fn discard(&self, written: &[Written]) {
        for file in written {
            self.files.remove_route(&file.route).await;
            if let Err(e) = tokio::fs::remove_file(&file.path).await {
                warn!(
                    path = %file.path.display(),
                    error = %e,
                    "Failed to remove partial display file"
                );
            }
        }
    }
}

type DecodedKind = (&'static str, &'static str, Vec<u8>);

fn decode_all(event: &KernelEvent) -> Result<Vec<DecodedKind>, TransformError> {
    let Some(data) = event
        .payload
        .pointer("/content/data")
        .and_then(Value::as_object)
    else {
        return Ok(Vec::new());
    };

    let mut jobs = Vec::new();
    for (key, extension, encoding) in DISPLAY_KINDS {
        let Some(value) = data.get(key) else {
            continue;
        };
        let text = value.as_str().ok_or_else(|| TransformError::InvalidPayload {
            key: key.to_string(),
        })?;
        let bytes = match encoding {
            Encoding::Text => text.as_bytes().to_vec(),
            Encoding::Base64 => decode_base64(key, text)?,
        };
        jobs.push((key, extension, bytes));
    }
    Ok(jobs)
}

/// Kernels wrap base64 at 76 columns; strip whitespace before decoding.
fn decode_base64(key: &str, text: &str) -> Result<Vec<u8>, TransformError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    BASE64.decode(compact).map_err(|e| TransformError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn write_temp_file(dir: &Path, extension: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix("kernelhub-")
        .suffix(extension)
        .tempfile_in(dir)?;
    file.write_all(bytes)?;
    file.flush()?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

fn route_for(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("/{name}")
}
