//! Client for one kernel.
//!
//! Correlates host requests with kernel replies by request id, queues
//! unsolicited events per channel, and owns the kernel process (if any).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::process::Child;
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use kernelhub_core::protocol::{self, Channel, HostFrame, KernelEvent, KernelFrame, Method};

use super::transport::KernelTransport;
use super::types::{KernelClientConfig, KernelError, Readiness};

type Reply = Result<Value, KernelError>;
type PendingMap = Arc<tokio::sync::Mutex<HashMap<String, oneshot::Sender<Reply>>>>;

/// The child process behind a kernel.
#[derive(Debug)]
pub struct KernelProcess {
    pid: Option<u32>,
    child: tokio::sync::Mutex<Child>,
}

impl KernelProcess {
    pub fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: tokio::sync::Mutex::new(child),
        }
    }

    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Request/response and event façade over one kernel.
pub struct KernelClient {
    id: String,
    stdin_tx: RwLock<Option<mpsc::Sender<String>>>,
    pending: PendingMap,
    channels: Mutex<HashMap<Channel, mpsc::UnboundedReceiver<KernelEvent>>>,
    ready_rx: watch::Receiver<Readiness>,
    process: Option<KernelProcess>,
    config: KernelClientConfig,
}

impl std::fmt::Debug for KernelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelClient")
            .field("id", &self.id)
            .field("readiness", &*self.ready_rx.borrow())
            .field("pid", &self.process.as_ref().and_then(KernelProcess::pid))
            .finish_non_exhaustive()
    }
}

impl KernelClient {
    /// Wrap a transport and start reading kernel frames from it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        id: impl Into<String>,
        transport: KernelTransport,
        process: Option<KernelProcess>,
        config: KernelClientConfig,
    ) -> Self {
        let id = id.into();
        let (ready_tx, ready_rx) = watch::channel(Readiness::Starting);
        let pending = PendingMap::default();

        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for channel in Channel::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(channel, tx);
            receivers.insert(channel, rx);
        }

        tokio::spawn(read_frames(ReaderContext {
            kernel_id: id.clone(),
            stdout_rx: transport.stdout_rx,
            pending: Arc::clone(&pending),
            senders,
            ready_tx,
        }));

        Self {
            id,
            stdin_tx: RwLock::new(Some(transport.stdin_tx)),
            pending,
            channels: Mutex::new(receivers),
            ready_rx,
            process,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn readiness(&self) -> Readiness {
        self.ready_rx.borrow().clone()
    }

    /// Wait until the kernel reports ready. Fails if it goes away first.
    pub async fn ready(&self) -> Result<(), KernelError> {
        let mut rx = self.ready_rx.clone();
        let state = rx
            .wait_for(|s| !matches!(s, Readiness::Starting))
            .await
            .map(|s| s.clone())
            .map_err(|_| self.exited())?;

        match state {
            Readiness::Ready => Ok(()),
            Readiness::Starting | Readiness::Closed { .. } => Err(self.exited()),
        }
    }

    /// Take the single consumer end of a channel's event queue.
    pub fn take_channel(&self, channel: Channel) -> Option<mpsc::UnboundedReceiver<KernelEvent>> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel)
    }

    /// Number of requests still waiting for a reply.
    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn execute(&self, text: &str) -> Result<Value, KernelError> {
        self.request(Method::Execute, json!({ "text": text })).await
    }

    /// Run code without echoing it; the kernel resolves once `resolve_event` fires.
    pub async fn execute_hidden(
        &self,
        code: &str,
        resolve_event: &str,
    ) -> Result<Value, KernelError> {
        self.request(
            Method::ExecuteHidden,
            json!({ "code": code, "resolve_event": resolve_event }),
        )
        .await
    }

    pub async fn eval(&self, text: &str) -> Result<Value, KernelError> {
        self.request(Method::Eval, json!({ "text": text })).await
    }

    pub async fn get_auto_complete(
        &self,
        text: &str,
        cursor_pos: usize,
    ) -> Result<Value, KernelError> {
        self.request_with_deadline(
            Method::GetAutoComplete,
            json!({ "text": text, "cursor_pos": cursor_pos }),
            Some(self.config.autocomplete_timeout),
        )
        .await
    }

    pub async fn get_inspection(
        &self,
        text: &str,
        cursor_pos: usize,
        detail_level: u8,
    ) -> Result<Value, KernelError> {
        self.request(
            Method::GetInspection,
            json!({ "text": text, "cursor_pos": cursor_pos, "detail_level": detail_level }),
        )
        .await
    }

    pub async fn get_status(&self) -> Result<Value, KernelError> {
        self.request(Method::GetStatus, json!({})).await
    }

    pub async fn is_complete(&self, text: &str) -> Result<Value, KernelError> {
        self.request(Method::IsComplete, json!({ "text": text })).await
    }

    /// Interrupt the running execution.
    ///
    /// Process kernels get SIGINT on unix; everything else gets an
    /// `interrupt` request.
    pub async fn interrupt(&self) -> Result<(), KernelError> {
        #[cfg(unix)]
        if let Some(pid) = self.process.as_ref().and_then(KernelProcess::pid) {
            info!(kernel_id = %self.id, pid, "Interrupting kernel");
            return send_signal(&self.id, pid, libc::SIGINT);
        }

        self.request(Method::Interrupt, json!({})).await.map(|_| ())
    }

    /// Send a request bounded by the configured default deadline.
    pub async fn request(&self, method: Method, args: Value) -> Result<Value, KernelError> {
        self.request_with_deadline(method, args, self.config.request_timeout)
            .await
    }

    /// Send a request and wait for its reply, at most `deadline` if given.
    ///
    /// On timeout the request is forgotten (a late reply is discarded) and
    /// the kernel is told to cancel it.
    pub async fn request_with_deadline(
        &self,
        method: Method,
        args: Value,
        deadline: Option<Duration>,
    ) -> Result<Value, KernelError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let line = protocol::encode(&HostFrame::Request {
            id: request_id.clone(),
            method,
            args,
        })
        .map_err(|e| KernelError::Encode(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        // The reader marks the kernel closed before draining `pending`, so a
        // request inserted after the drain is caught here.
        let closed = matches!(*self.ready_rx.borrow(), Readiness::Closed { .. });
        if closed {
            self.forget(&request_id).await;
            return Err(self.exited());
        }

        if let Err(e) = self.write_line(line).await {
            self.forget(&request_id).await;
            return Err(e);
        }
        debug!(kernel_id = %self.id, %request_id, %method, "Request sent");

        let reply = async { rx.await.unwrap_or_else(|_| Err(self.exited())) };
        let Some(after) = deadline else {
            return reply.await;
        };

        if let Ok(result) = tokio::time::timeout(after, reply).await {
            result
        } else {
            self.forget(&request_id).await;
            warn!(kernel_id = %self.id, %request_id, %method, ?after, "Kernel request timed out");
            self.cancel(&request_id).await;
            Err(KernelError::Timeout {
                operation: method,
                after,
            })
        }
    }

    /// Terminate the kernel.
    ///
    /// Closes stdin, sends SIGTERM, and force-kills after the grace period.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn kill(&self) -> Result<(), KernelError> {
        self.stdin_tx.write().await.take();

        let Some(process) = &self.process else {
            info!(kernel_id = %self.id, "Kernel transport closed");
            return Ok(());
        };

        let mut child = process.child.lock().await;
        if let Ok(Some(status)) = child.try_wait() {
            info!(kernel_id = %self.id, ?status, "Kernel already exited");
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = process.pid
            && let Err(e) = send_signal(&self.id, pid, libc::SIGTERM)
        {
            warn!(kernel_id = %self.id, error = %e, "Failed to send SIGTERM");
        }

        match tokio::time::timeout(self.config.terminate_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(kernel_id = %self.id, ?status, "Kernel exited");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(kernel_id = %self.id, error = %e, "Error waiting for kernel, killing");
                force_kill(&self.id, &mut child).await
            }
            Err(_) => {
                warn!(kernel_id = %self.id, "Timeout waiting for graceful shutdown, killing");
                force_kill(&self.id, &mut child).await
            }
        }
    }

    async fn write_line(&self, line: String) -> Result<(), KernelError> {
        let tx = self
            .stdin_tx
            .read()
            .await
            .clone()
            .ok_or_else(|| KernelError::StdinClosed {
                id: self.id.clone(),
            })?;

        tx.send(line).await.map_err(|_| KernelError::StdinClosed {
            id: self.id.clone(),
        })
    }

    async fn forget(&self, request_id: &str) {
        self.pending.lock().await.remove(request_id);
    }

    async fn cancel(&self, request_id: &str) {
        let frame = HostFrame::Cancel {
            id: request_id.to_string(),
        };
        let sent = match protocol::encode(&frame) {
            Ok(line) => self.write_line(line).await.is_ok(),
            Err(_) => false,
        };
        if !sent {
            debug!(kernel_id = %self.id, %request_id, "Could not deliver cancel frame");
        }
    }

    fn exited(&self) -> KernelError {
        KernelError::Exited {
            id: self.id.clone(),
        }
    }
}

async fn force_kill(kernel_id: &str, child: &mut Child) -> Result<(), KernelError> {
    child.kill().await.map_err(|e| KernelError::Terminate {
        id: kernel_id.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(unix)]
fn send_signal(kernel_id: &str, pid: u32, signal: libc::c_int) -> Result<(), KernelError> {
    // SAFETY: pid is a valid process ID obtained from our own Child handle.
    // kill(2) with a standard signal is safe to call on any owned subprocess.
    #[allow(unsafe_code)]
    #[allow(clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(pid as i32, signal) };
    if ret == 0 {
        Ok(())
    } else {
        Err(KernelError::Signal {
            id: kernel_id.to_string(),
            reason: std::io::Error::last_os_error().to_string(),
        })
    }
}

struct ReaderContext {
    kernel_id: String,
    stdout_rx: mpsc::Receiver<String>,
    pending: PendingMap,
    senders: HashMap<Channel, mpsc::UnboundedSender<KernelEvent>>,
    ready_tx: watch::Sender<Readiness>,
}

async fn read_frames(mut ctx: ReaderContext) {
    let kernel_id = ctx.kernel_id.clone();

    while let Some(line) = ctx.stdout_rx.recv().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match protocol::parse_line(line) {
            Ok(KernelFrame::Ready) => {
                let changed = ctx.ready_tx.send_if_modified(|state| {
                    if *state == Readiness::Starting {
                        *state = Readiness::Ready;
                        true
                    } else {
                        false
                    }
                });
                if changed {
                    info!(kernel_id = %kernel_id, "Kernel ready");
                }
            }
            Ok(KernelFrame::Response(response)) => {
                let waiter = ctx.pending.lock().await.remove(&response.id);
                if let Some(tx) = waiter {
                    let reply = response
                        .outcome
                        .map_err(|message| KernelError::Remote { message });
                    let _ = tx.send(reply);
                } else {
                    debug!(
                        kernel_id = %kernel_id,
                        request_id = %response.id,
                        "Discarding reply to unknown or cancelled request"
                    );
                }
            }
            Ok(KernelFrame::Event(event)) => {
                let channel = event.channel;
                let Some(tx) = ctx.senders.get(&channel) else {
                    continue;
                };
                // Unbounded: events are never dropped while a consumer exists.
                if tx.send(event).is_err() {
                    debug!(
                        kernel_id = %kernel_id,
                        %channel,
                        "Channel consumer gone, dropping event"
                    );
                }
            }
            Ok(KernelFrame::Unknown { frame_type, .. }) => {
                warn!(kernel_id = %kernel_id, %frame_type, "Unknown kernel frame type");
            }
            Err(e) => {
                warn!(kernel_id = %kernel_id, error = %e, line, "Unparseable kernel output");
            }
        }
    }

    ctx.ready_tx.send_modify(|state| {
        let reason = if *state == Readiness::Starting {
            "exited before becoming ready"
        } else {
            "exited"
        };
        *state = Readiness::Closed {
            reason: reason.to_string(),
        };
    });

    let drained: Vec<_> = ctx.pending.lock().await.drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(KernelError::Exited {
            id: kernel_id.clone(),
        }));
    }

    info!(kernel_id = %kernel_id, "Kernel output closed");
}
