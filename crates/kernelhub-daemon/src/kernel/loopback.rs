//! In-process kernels.
//!
//! A loopback kernel speaks the NDJSON protocol over channels instead of
//! pipes. It answers every request with a canned result and can be told to
//! never become ready, to fail at launch, or to leave some methods
//! unanswered. Events can be pushed from outside through [`LoopbackLauncher::emitter`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Value, json};
use tracing::debug;

use kernelhub_core::KernelOptions;
use kernelhub_core::protocol::{Channel, Method};

use super::client::KernelClient;
use super::launcher::KernelLauncher;
use super::transport::{KernelPeer, KernelTransport, PeerSender};
use super::types::{KernelClientConfig, KernelError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum Startup {
    #[default]
    Ready,
    Never,
    Fail(String),
}

/// Launches [`loopback`](self) kernels.
#[derive(Debug, Clone, Default)]
pub struct LoopbackLauncher {
    startup: Startup,
    stalled: Vec<Method>,
    config: KernelClientConfig,
    launches: Arc<AtomicUsize>,
    frames: Arc<Mutex<Vec<Value>>>,
    emitters: Arc<Mutex<HashMap<String, PeerSender>>>,
}

impl LoopbackLauncher {
    pub fn new(config: KernelClientConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Kernels never send their `ready` frame.
    #[must_use]
    pub fn never_ready(mut self) -> Self {
        self.startup = Startup::Never;
        self
    }

    /// Every launch fails with `reason`.
    #[must_use]
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.startup = Startup::Fail(reason.into());
        self
    }

    /// Kernels never answer `method` requests.
    #[must_use]
    pub fn stall(mut self, method: Method) -> Self {
        self.stalled.push(method);
        self
    }

    /// Kernels never answer `get_auto_complete`.
    #[must_use]
    pub fn stall_auto_complete(self) -> Self {
        self.stall(Method::GetAutoComplete)
    }

    /// Number of `launch` calls so far, failed ones included.
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Every host frame received by any kernel of this launcher, in order.
    pub fn frames(&self) -> Vec<Value> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Methods of the requests received so far.
    pub fn methods(&self) -> Vec<String> {
        self.frames()
            .iter()
            .filter_map(|f| f.get("method").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    /// Writer for pushing frames out of the kernel with the given id.
    pub fn emitter(&self, kernel_id: &str) -> Option<PeerSender> {
        self.emitters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kernel_id)
            .cloned()
    }
}

impl KernelLauncher for LoopbackLauncher {
    fn launch(&self, id: &str, _options: &KernelOptions) -> Result<KernelClient, KernelError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Startup::Fail(reason) = &self.startup {
            return Err(KernelError::SpawnFailed {
                reason: reason.clone(),
            });
        }

        let (transport, peer) = KernelTransport::pair(self.config.channel_capacity);
        self.emitters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), peer.sender());

        tokio::spawn(serve(
            id.to_string(),
            peer,
            self.startup == Startup::Ready,
            self.stalled.clone(),
            Arc::clone(&self.frames),
            Arc::clone(&self.emitters),
        ));

        Ok(KernelClient::new(id, transport, None, self.config.clone()))
    }
}

async fn serve(
    kernel_id: String,
    mut peer: KernelPeer,
    announce_ready: bool,
    stalled: Vec<Method>,
    frames: Arc<Mutex<Vec<Value>>>,
    emitters: Arc<Mutex<HashMap<String, PeerSender>>>,
) {
    let out = peer.sender();
    if announce_ready {
        out.ready().await;
    }

    let mut execution_count = 0u64;
    while let Some(frame) = peer.next_frame().await {
        frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.clone());

        if frame["type"] != "request" {
            continue;
        }
        let Some(id) = frame["id"].as_str() else {
            continue;
        };
        let args = &frame["args"];

        let method = frame["method"].as_str().unwrap_or_default();
        if stalled.iter().any(|m| m.as_str() == method) {
            continue;
        }

        let result = match method {
            "execute" | "execute_hidden" => {
                execution_count += 1;
                let text = args["text"].as_str().or_else(|| args["code"].as_str());
                out.emit(
                    Channel::Iopub,
                    json!({
                        "msg_type": "stream",
                        "content": { "name": "stdout", "text": text },
                    }),
                )
                .await;
                json!({ "status": "ok", "execution_count": execution_count })
            }
            "eval" => json!({ "status": "ok", "value": args["text"] }),
            "get_auto_complete" => json!({
                "status": "ok",
                "matches": [],
                "cursor_start": args["cursor_pos"],
                "cursor_end": args["cursor_pos"],
            }),
            "get_inspection" => json!({ "status": "ok", "found": false }),
            "get_status" => json!({ "status": "idle" }),
            "is_complete" => json!({ "status": "complete" }),
            "interrupt" => Value::Null,
            other => {
                out.fail(id, &format!("unknown method: {other}")).await;
                continue;
            }
        };
        out.respond(id, result).await;
    }

    // Release the last writers so the client sees the kernel go away.
    emitters
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&kernel_id);
    debug!(kernel_id = %kernel_id, "Loopback kernel stopped");
}
