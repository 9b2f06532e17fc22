//! Line transport between a kernel client and its kernel.
//!
//! A real kernel is a child process whose stdin/stdout pipes are pumped into
//! these channels by the launcher; an in-process kernel holds the other end
//! directly as a [`KernelPeer`].

use serde_json::{Value, json};
use tokio::sync::mpsc;

use kernelhub_core::protocol::Channel;

/// Client side of a kernel transport.
#[derive(Debug)]
pub struct KernelTransport {
    /// Lines written to the kernel.
    pub stdin_tx: mpsc::Sender<String>,
    /// Lines read from the kernel.
    pub stdout_rx: mpsc::Receiver<String>,
}

impl KernelTransport {
    /// Create a connected transport/peer pair.
    pub fn pair(capacity: usize) -> (Self, KernelPeer) {
        let (stdin_tx, stdin_rx) = mpsc::channel(capacity);
        let (stdout_tx, stdout_rx) = mpsc::channel(capacity);
        (
            Self {
                stdin_tx,
                stdout_rx,
            },
            KernelPeer {
                requests: stdin_rx,
                frames: stdout_tx,
            },
        )
    }
}

/// Kernel side of an in-process transport.
#[derive(Debug)]
pub struct KernelPeer {
    /// Host frames, one JSON line each.
    pub requests: mpsc::Receiver<String>,
    /// Kernel frames, one JSON line each.
    pub frames: mpsc::Sender<String>,
}

impl KernelPeer {
    /// Receive and decode the next host frame. `None` once the host closed stdin.
    pub async fn next_frame(&mut self) -> Option<Value> {
        loop {
            let line = self.requests.recv().await?;
            if let Ok(value) = serde_json::from_str(&line) {
                return Some(value);
            }
        }
    }

    pub fn sender(&self) -> PeerSender {
        PeerSender {
            frames: self.frames.clone(),
        }
    }
}

/// Cloneable writer for kernel frames.
#[derive(Debug, Clone)]
pub struct PeerSender {
    frames: mpsc::Sender<String>,
}

impl PeerSender {
    /// Returns `false` once the host stopped reading.
    pub async fn send(&self, frame: &Value) -> bool {
        self.frames.send(frame.to_string()).await.is_ok()
    }

    pub async fn ready(&self) -> bool {
        self.send(&json!({"type": "ready"})).await
    }

    pub async fn respond(&self, id: &str, result: Value) -> bool {
        self.send(&json!({"type": "response", "id": id, "result": result}))
            .await
    }

    pub async fn fail(&self, id: &str, message: &str) -> bool {
        self.send(&json!({"type": "response", "id": id, "error": message}))
            .await
    }

    pub async fn emit(&self, channel: Channel, payload: Value) -> bool {
        self.send(&json!({"type": "event", "channel": channel, "payload": payload}))
            .await
    }
}
