//! Host facts for choosing a kernel.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

/// Executables that can start a kernel.
const KERNEL_EXECUTABLES: [&str; 4] = ["python", "python3", "ipython", "jupyter"];

/// A kernel-capable executable found on `PATH`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableKernel {
    pub name: String,
    pub path: PathBuf,
}

/// What the host knows about its environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemFacts {
    pub available_kernels: Vec<AvailableKernel>,
    pub homedir: Option<PathBuf>,
    pub path_sep: String,
    pub path_delimiter: String,
}

#[derive(Debug, thiserror::Error)]
pub enum FactsError {
    #[error("Gathering system facts took longer than {0:?}")]
    Timeout(Duration),

    #[error("System facts task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Gather facts, giving up after `timeout`.
pub async fn system_facts(timeout: Duration) -> Result<SystemFacts, FactsError> {
    let search_path = std::env::var_os("PATH");
    let task = tokio::task::spawn_blocking(move || {
        let dirs: Vec<PathBuf> = search_path
            .as_deref()
            .map(|p| std::env::split_paths(p).collect())
            .unwrap_or_default();
        gather(&dirs)
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(facts) => Ok(facts?),
        Err(_) => {
            warn!(?timeout, "System facts timed out");
            Err(FactsError::Timeout(timeout))
        }
    }
}

fn gather(search_path: &[PathBuf]) -> SystemFacts {
    let available_kernels: Vec<AvailableKernel> = KERNEL_EXECUTABLES
        .iter()
        .filter_map(|name| {
            find_executable(name, search_path).map(|path| AvailableKernel {
                name: (*name).to_string(),
                path,
            })
        })
        .collect();
    debug!(count = available_kernels.len(), "Found kernel executables");

    SystemFacts {
        available_kernels,
        homedir: dirs::home_dir(),
        path_sep: std::path::MAIN_SEPARATOR.to_string(),
        path_delimiter: if cfg!(windows) { ";" } else { ":" }.to_string(),
    }
}

/// First match for `name` in `search_path`.
fn find_executable(name: &str, search_path: &[PathBuf]) -> Option<PathBuf> {
    search_path.iter().find_map(|dir| {
        candidates(dir, name)
            .into_iter()
            .find(|candidate| is_executable(candidate))
    })
}

fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    if cfg!(windows) {
        vec![dir.join(format!("{name}.exe")), dir.join(name)]
    } else {
        vec![dir.join(name)]
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
