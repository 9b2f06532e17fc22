//! Kernel process launching.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use kernelhub_core::KernelOptions;

use super::client::{KernelClient, KernelProcess};
use super::transport::KernelTransport;
use super::types::{KernelClientConfig, KernelError};

/// Starts kernels for validated options.
///
/// The returned client is not necessarily ready yet; callers wait on
/// [`KernelClient::ready`].
pub trait KernelLauncher: Send + Sync {
    fn launch(&self, id: &str, options: &KernelOptions) -> Result<KernelClient, KernelError>;
}

/// Launches kernels as child processes speaking NDJSON on stdio.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    /// Arguments appended to every kernel command.
    args: Vec<String>,
    client_config: KernelClientConfig,
}

impl ProcessLauncher {
    pub const fn new(args: Vec<String>, client_config: KernelClientConfig) -> Self {
        Self {
            args,
            client_config,
        }
    }
}

impl KernelLauncher for ProcessLauncher {
    fn launch(&self, id: &str, options: &KernelOptions) -> Result<KernelClient, KernelError> {
        let working_dir = resolve_working_dir(options.cwd.as_deref());

        let mut cmd = Command::new(&options.cmd);
        cmd.args(&self.args)
            .current_dir(&working_dir)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            kernel_id = id,
            cmd = %options.cmd,
            working_dir = %working_dir.display(),
            "Spawning kernel"
        );
        let mut child = cmd.spawn().map_err(|e| KernelError::SpawnFailed {
            reason: format!("{}: {e}", options.cmd),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| KernelError::SpawnFailed {
            reason: "Failed to capture stdin".to_string(),
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KernelError::SpawnFailed {
                reason: "Failed to capture stdout".to_string(),
            })?;

        let capacity = self.client_config.channel_capacity;
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(capacity);
        let (stdout_tx, stdout_rx) = mpsc::channel::<String>(capacity);

        let kernel_id = id.to_string();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    error!(kernel_id = %kernel_id, "Failed to write to stdin: {}", e);
                    break;
                }
                if let Err(e) = stdin.write_all(b"\n").await {
                    error!(kernel_id = %kernel_id, "Failed to write newline: {}", e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    error!(kernel_id = %kernel_id, "Failed to flush stdin: {}", e);
                    break;
                }
            }
            debug!(kernel_id = %kernel_id, "stdin writer finished");
        });

        let kernel_id = id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stdout_tx.send(line).await.is_err() {
                    break;
                }
            }
            debug!(kernel_id = %kernel_id, "stdout reader finished");
        });

        if let Some(stderr) = child.stderr.take() {
            let kernel_id = id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(kernel_id = %kernel_id, "stderr: {}", line);
                }
            });
        }

        Ok(KernelClient::new(
            id,
            KernelTransport {
                stdin_tx,
                stdout_rx,
            },
            Some(KernelProcess::new(child)),
            self.client_config.clone(),
        ))
    }
}

fn resolve_working_dir(requested: Option<&Path>) -> PathBuf {
    if let Some(dir) = requested
        && dir.is_dir()
    {
        return dir.to_path_buf();
    }

    let fallback = std::env::current_dir()
        .ok()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir);
    if let Some(dir) = requested {
        warn!(
            requested = %dir.display(),
            fallback = %fallback.display(),
            "Working directory missing, using fallback"
        );
    }
    fallback
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn existing_working_dir_is_used() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_working_dir(Some(dir.path())), dir.path());
    }

    #[test]
    fn missing_working_dir_falls_back() {
        let resolved = resolve_working_dir(Some(Path::new("/definitely/not/here")));
        assert!(resolved.is_dir());
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let launcher = ProcessLauncher::new(Vec::new(), KernelClientConfig::default());
        let err = launcher
            .launch("k", &KernelOptions::new("kernelhub-no-such-binary"))
            .unwrap_err();
        assert!(matches!(err, KernelError::SpawnFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_kernel_round_trip() {
        // A shell kernel: announce readiness, then answer every request with
        // a fixed result by echoing its id back.
        let script = r#"echo '{"type":"ready"}'; while read -r line; do id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p'); printf '{"type":"response","id":"%s","result":"ok"}\n' "$id"; done"#;
        let launcher = ProcessLauncher::new(
            vec!["-c".to_string(), script.to_string()],
            KernelClientConfig::default(),
        );
        let client = launcher.launch("sh-1", &KernelOptions::new("sh")).unwrap();

        client.ready().await.unwrap();
        assert_eq!(client.get_status().await.unwrap(), serde_json::json!("ok"));
        client.kill().await.unwrap();
    }
}
