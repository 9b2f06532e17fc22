//! `kernelhub` host
//!
//! Runs a single kernel session, prints every routed kernel event as a JSON
//! line on stdout, and executes each stdin line in the kernel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use kernelhub_core::KernelOptions;
use kernelhub_core::config::load_config;
use kernelhub_daemon::display::DisplayMaterializer;
use kernelhub_daemon::files::FileServer;
use kernelhub_daemon::guard::KernelSession;
use kernelhub_daemon::host::{HostOutput, run_console};
use kernelhub_daemon::kernel::{KernelClientConfig, ProcessLauncher};
use kernelhub_daemon::registry::KernelRegistry;
use kernelhub_daemon::router::{EventRouter, TargetRegistry};

#[derive(Parser, Debug)]
#[command(name = "kernelhub")]
#[command(version, about = "kernelhub - kernel pool host")]
struct Args {
    /// Command that starts the kernel (overrides `kernel.default_cmd`)
    #[arg(long, env = "KERNELHUB_CMD")]
    cmd: Option<String>,

    /// Working directory for the kernel
    #[arg(long, env = "KERNELHUB_CWD")]
    cwd: Option<PathBuf>,

    /// Consumer target events are routed to (overrides `router.default_target`)
    #[arg(long, env = "KERNELHUB_TARGET")]
    target: Option<String>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "KERNELHUB_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "KERNELHUB_LOG_JSON")]
    log_json: bool,

    /// Do not serve display data over HTTP; rich payloads stay inline.
    #[arg(long, env = "KERNELHUB_NO_FILE_SERVER")]
    no_file_server: bool,
}

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!(
        "kernelhub_daemon={level},kernelhub_core={level},kernelhub={level}",
        level = args.log_level
    );
    kernelhub_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let project_dir = std::env::current_dir().ok();
    let mut config = load_config(project_dir.as_deref())?;
    if let Some(cmd) = args.cmd {
        config.kernel.default_cmd = cmd;
    }
    if let Some(cwd) = args.cwd {
        config.kernel.default_cwd = Some(cwd);
    }
    if let Some(target) = args.target {
        config.router.default_target = target;
    }
    if args.no_file_server {
        config.file_server.enabled = false;
    }

    let mut defaults = KernelOptions::new(config.kernel.default_cmd.clone());
    defaults.cwd.clone_from(&config.kernel.default_cwd);
    defaults.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        cmd = %defaults.cmd,
        target_name = %config.router.default_target,
        file_server = config.file_server.enabled,
        "Starting kernelhub"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // File server and display materialization
    let files = Arc::new(FileServer::new(config.file_server.clone()));
    let (materializer, sweeper) = if config.file_server.enabled {
        // Bind failures are logged by the server; routes are still recorded.
        if let Ok(addr) = files.start(shutdown_rx.clone()).await {
            info!(%addr, "Display data served");
        }
        (
            Some(DisplayMaterializer::new(Arc::clone(&files))),
            Some(files.spawn_sweeper(shutdown_rx.clone())),
        )
    } else {
        (None, None)
    };

    // Routing
    let targets = TargetRegistry::new(config.router.target_capacity);
    let router = EventRouter::new(targets.clone(), materializer);
    let mut events = targets.register(&config.router.default_target).await;

    // Kernels
    let launcher = ProcessLauncher::new(
        config.kernel.args.clone(),
        KernelClientConfig::from(&config.kernel),
    );
    let registry = Arc::new(
        KernelRegistry::new(Arc::new(launcher), config.kernel.startup_timeout())
            .with_router(router.clone(), config.router.default_target.clone()),
    );
    let session = Arc::new(KernelSession::new(Arc::clone(&registry), defaults));

    // Single stdout writer so event and result lines never interleave.
    let (out_tx, mut out_rx) = mpsc::channel::<HostOutput>(config.router.target_capacity.max(1));
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(output) = out_rx.recv().await {
            let mut line = match serde_json::to_string(&output) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Failed to encode output line");
                    continue;
                }
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let event_tx = out_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if event_tx.send(HostOutput::Event(event)).await.is_err() {
                break;
            }
        }
    });

    if let Err(e) = session.ensure_instance().await {
        error!(error = %e, "Failed to create kernel instance");
    }

    let console = run_console(
        Arc::clone(&session),
        BufReader::new(tokio::io::stdin()),
        out_tx,
        config.system_facts_timeout(),
    );

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the host is ready (unix only). The `true` parameter
    // unsets $NOTIFY_SOCKET so kernel processes don't notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        () = console => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let stopped = registry.shutdown().await;
    let _ = shutdown_tx.send(true);
    if let Some(handle) = sweeper {
        let _ = handle.await;
    }

    // Closing the target ends the event stream; flush what is left.
    targets.unregister(&config.router.default_target).await;
    if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
        warn!("Timed out flushing output");
    }

    info!(kernels = stopped, "kernelhub stopped");
    Ok(())
}
