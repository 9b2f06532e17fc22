#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Integration tests for the event pipeline.
//!
//! Tests the full flow: session → registry → kernel → router →
//! materializer → file server → target, with in-process kernels.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use kernelhub_core::KernelOptions;
use kernelhub_core::config::FileServerConfig;
use kernelhub_core::protocol::Channel;
use kernelhub_daemon::display::DisplayMaterializer;
use kernelhub_daemon::files::FileServer;
use kernelhub_daemon::guard::KernelSession;
use kernelhub_daemon::kernel::loopback::LoopbackLauncher;
use kernelhub_daemon::registry::{KernelRegistry, RegistryError};
use kernelhub_daemon::router::{EventRouter, RoutedEvent, TargetRegistry};

const TARGET: &str = "mainWindow";

struct Host {
    _dir: tempfile::TempDir,
    files: Arc<FileServer>,
    router: EventRouter,
    registry: Arc<KernelRegistry>,
    launcher: LoopbackLauncher,
    _shutdown: watch::Sender<bool>,
}

async fn host() -> Host {
    let dir = tempfile::tempdir().unwrap();
    let files = Arc::new(FileServer::new(FileServerConfig {
        port_range_start: 0,
        port_range_end: 0,
        temp_dir: Some(dir.path().to_path_buf()),
        ..FileServerConfig::default()
    }));
    let (shutdown, shutdown_rx) = watch::channel(false);
    files.start(shutdown_rx).await.unwrap();

    let router = EventRouter::new(
        TargetRegistry::default(),
        Some(DisplayMaterializer::new(Arc::clone(&files))),
    );
    let launcher = LoopbackLauncher::default();
    let registry = Arc::new(
        KernelRegistry::new(Arc::new(launcher.clone()), Duration::from_secs(5))
            .with_router(router.clone(), TARGET),
    );

    Host {
        _dir: dir,
        files,
        router,
        registry,
        launcher,
        _shutdown: shutdown,
    }
}

async fn next(rx: &mut mpsc::Receiver<RoutedEvent>) -> RoutedEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

/// Minimal HTTP/1.0 GET returning (status line, body).
async fn http_get(base_url: &str, path: &str) -> (String, Vec<u8>) {
    let addr = base_url.trim_start_matches("http://");
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(format!("GET {path} HTTP/1.0\r\nHost: {addr}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();

    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap();
    let head = String::from_utf8_lossy(&response[..split]).into_owned();
    let status = head.lines().next().unwrap().to_string();
    (status, response[split + 4..].to_vec())
}

// =========================================================================
// Routing
// =========================================================================

#[tokio::test]
async fn execute_output_reaches_default_target() {
    let host = host().await;
    let mut rx = host.router.targets().register(TARGET).await;

    let id = host
        .registry
        .create(KernelOptions::new("python3"))
        .await
        .unwrap()
        .id()
        .to_string();
    host.registry.execute(&id, "print('hello')").await.unwrap();

    let event = next(&mut rx).await;
    assert_eq!(event.instance_id, id);
    assert_eq!(event.channel, Channel::Iopub);
    assert_eq!(event.payload["content"]["text"], "print('hello')");
}

#[tokio::test]
async fn events_without_target_are_dropped() {
    let host = host().await;
    let id = host
        .registry
        .create(KernelOptions::new("python3"))
        .await
        .unwrap()
        .id()
        .to_string();
    host.registry.execute(&id, "1").await.unwrap();

    // Wait for the forwarding task to see the event.
    for _ in 0..100 {
        if host.router.stats().dropped_no_target > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(host.router.stats().dropped_no_target, 1);
    assert_eq!(host.router.stats().delivered, 0);
}

#[tokio::test]
async fn events_from_each_channel_keep_their_order() {
    let host = host().await;
    let mut rx = host.router.targets().register(TARGET).await;
    let handle = host.registry.create(KernelOptions::new("python3")).await.unwrap();
    handle.ready().await.unwrap();

    let emitter = host.launcher.emitter(handle.id()).unwrap();
    for n in 0..20 {
        emitter.emit(Channel::Shell, json!({ "n": n })).await;
        emitter.emit(Channel::Stdin, json!({ "n": n })).await;
    }

    let mut shell = Vec::new();
    let mut stdin = Vec::new();
    for _ in 0..40 {
        let event = next(&mut rx).await;
        let n = event.payload["n"].as_u64().unwrap();
        match event.channel {
            Channel::Shell => shell.push(n),
            Channel::Stdin => stdin.push(n),
            other => panic!("unexpected channel {other}"),
        }
    }
    let expected: Vec<u64> = (0..20).collect();
    assert_eq!(shell, expected);
    assert_eq!(stdin, expected);
}

#[tokio::test]
async fn burst_to_unread_target_is_not_lost() {
    let host = host().await;
    let mut rx = host.router.targets().register(TARGET).await;
    let handle = host.registry.create(KernelOptions::new("python3")).await.unwrap();
    handle.ready().await.unwrap();

    // Far more than the target queue holds, emitted before anyone reads.
    let emitter = host.launcher.emitter(handle.id()).unwrap();
    for n in 0..1000 {
        emitter.emit(Channel::Iopub, json!({ "n": n })).await;
    }

    for n in 0..1000 {
        assert_eq!(next(&mut rx).await.payload["n"], n);
    }
    for _ in 0..100 {
        if host.router.stats().delivered == 1000 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stats = host.router.stats();
    assert_eq!(stats.delivered, 1000);
    assert_eq!(stats.dropped_no_target, 0);
}

// =========================================================================
// Display data
// =========================================================================

#[tokio::test]
async fn display_data_is_served_over_http() {
    let host = host().await;
    let mut rx = host.router.targets().register(TARGET).await;
    let handle = host.registry.create(KernelOptions::new("python3")).await.unwrap();
    handle.ready().await.unwrap();

    host.launcher
        .emitter(handle.id())
        .unwrap()
        .emit(
            Channel::Iopub,
            json!({
                "msg_type": "display_data",
                "content": {
                    "data": {
                        "text/html": "<table><tr><td>1</td></tr></table>",
                        "image/png": "iVBORw0KGgo=",
                        "text/plain": "<DataFrame>",
                    },
                    "metadata": {},
                },
            }),
        )
        .await;

    let event = next(&mut rx).await;
    let data = &event.payload["content"]["data"];
    assert_eq!(data["text/plain"], "<DataFrame>");
    let html_route = data["text/html"].as_str().unwrap();
    let png_route = data["image/png"].as_str().unwrap();
    assert_ne!(html_route, png_route);
    assert_eq!(host.files.route_count().await, 2);

    let base_url = host.files.base_url().unwrap();
    let (status, body) = http_get(&base_url, html_route).await;
    assert!(status.contains("200"), "status: {status}");
    assert_eq!(body, b"<table><tr><td>1</td></tr></table>");

    let (status, body) = http_get(&base_url, png_route).await;
    assert!(status.contains("200"), "status: {status}");
    assert_eq!(body, b"\x89PNG\r\n\x1a\n");

    let (status, _) = http_get(&base_url, "/kernelhub-missing.png").await;
    assert!(status.contains("404"), "status: {status}");
}

#[tokio::test]
async fn add_route_serves_arbitrary_file() {
    let host = host().await;
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("abc.png");
    std::fs::write(&file, [1u8, 2, 3, 4]).unwrap();

    host.files.add_route(&file, "/plot/abc.png").await;
    let (status, body) = http_get(&host.files.base_url().unwrap(), "/plot/abc.png").await;
    assert!(status.contains("200"), "status: {status}");
    assert_eq!(body, vec![1, 2, 3, 4]);
}

// =========================================================================
// Lifecycle
// =========================================================================

#[tokio::test(start_paused = true)]
async fn stalled_auto_complete_times_out_without_side_effects() {
    let launcher = LoopbackLauncher::default().stall_auto_complete();
    let registry = KernelRegistry::new(Arc::new(launcher.clone()), Duration::from_secs(5));
    let handle = registry.create(KernelOptions::new("python3")).await.unwrap();
    handle.ready().await.unwrap();

    let err = registry
        .get_auto_complete(handle.id(), "imp", 3)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Kernel(_)));
    assert!(err.to_string().contains("5s"), "{err}");

    // The kernel was told to cancel and is still usable.
    let client = registry.get(handle.id()).await.unwrap();
    assert_eq!(client.pending_requests().await, 0);
    registry.get_status(handle.id()).await.unwrap();
    let frames = launcher.frames();
    assert!(frames.iter().any(|f| f["type"] == "cancel"));
}

#[tokio::test]
async fn session_restart_through_registry() {
    let host = host().await;
    let session = KernelSession::new(Arc::clone(&host.registry), KernelOptions::new("python3"));

    let first = session.ensure_instance().await.unwrap();
    let second = session.restart().await.unwrap();
    assert_ne!(first, second);
    assert!(matches!(
        host.registry.execute(&first, "1").await,
        Err(RegistryError::NotFound { .. })
    ));
    session.execute("1").await.unwrap();
    assert_eq!(host.registry.len().await, 1);
}
