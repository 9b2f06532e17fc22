//! Kernel client adapter.
//!
//! A [`KernelClient`] drives one kernel over the NDJSON protocol: requests
//! are correlated with replies by id, unsolicited events are queued per
//! channel, and the process lifecycle (ready, interrupt, kill) is managed
//! here. [`KernelLauncher`] is the seam that starts kernels.

mod client;
mod launcher;
pub mod loopback;
mod transport;
mod types;

pub use client::{KernelClient, KernelProcess};
pub use launcher::{KernelLauncher, ProcessLauncher};
pub use transport::{KernelPeer, KernelTransport, PeerSender};
pub use types::{KernelClientConfig, KernelError, Readiness};
