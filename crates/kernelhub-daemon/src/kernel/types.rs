//! Kernel client types.

use std::time::Duration;

use kernelhub_core::config::KernelConfig;
use kernelhub_core::protocol::Method;

/// Per-client timing and buffering settings.
#[derive(Debug, Clone)]
pub struct KernelClientConfig {
    /// Deadline for auto-complete requests.
    pub autocomplete_timeout: Duration,
    /// Default deadline for every other request (`None` waits forever).
    pub request_timeout: Option<Duration>,
    /// Grace period between SIGTERM and SIGKILL.
    pub terminate_timeout: Duration,
    /// Buffered stdio lines between the client and its kernel.
    pub channel_capacity: usize,
}

impl Default for KernelClientConfig {
    fn default() -> Self {
        Self::from(&KernelConfig::default())
    }
}

impl From<&KernelConfig> for KernelClientConfig {
    fn from(config: &KernelConfig) -> Self {
        Self {
            autocomplete_timeout: config.autocomplete_timeout(),
            request_timeout: config.request_timeout(),
            terminate_timeout: config.terminate_timeout(),
            channel_capacity: config.channel_capacity.max(1),
        }
    }
}

/// Lifecycle of a kernel transport as seen by its client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Starting,
    Ready,
    Closed { reason: String },
}

/// Errors from kernel operations.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("{operation} failed to finish in {after:?}")]
    Timeout { operation: Method, after: Duration },

    #[error("Kernel exited: {id}")]
    Exited { id: String },

    #[error("Kernel reported an error: {message}")]
    Remote { message: String },

    #[error("Failed to spawn kernel: {reason}")]
    SpawnFailed { reason: String },

    #[error("Kernel stdin closed: {id}")]
    StdinClosed { id: String },

    #[error("Failed to encode request: {0}")]
    Encode(String),

    #[error("Failed to signal kernel {id}: {reason}")]
    Signal { id: String, reason: String },

    #[error("Failed to terminate kernel {id}: {reason}")]
    Terminate { id: String, reason: String },
}
