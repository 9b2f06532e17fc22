//! Registry types.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use kernelhub_core::{KernelOptions, ValidationError};

use crate::kernel::{KernelClient, KernelError};

/// Bootstrap progress of one instance.
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    Pending,
    Ready(Arc<KernelClient>),
    Failed(String),
}

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Ready,
    Dead,
}

impl From<&Slot> for InstanceState {
    fn from(slot: &Slot) -> Self {
        match slot {
            Slot::Pending => Self::Pending,
            Slot::Ready(_) => Self::Ready,
            Slot::Failed(_) => Self::Dead,
        }
    }
}

/// Summary of a live instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    pub id: String,
    pub state: InstanceState,
    pub options: KernelOptions,
}

/// Returned by `create`: the new id plus a way to await bootstrap.
#[derive(Debug, Clone)]
pub struct KernelHandle {
    pub(crate) id: String,
    pub(crate) slot: watch::Receiver<Slot>,
}

impl KernelHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the kernel to become ready.
    ///
    /// Fails with `Bootstrap` if startup failed, or `NotFound` if the
    /// instance was killed before it got there.
    pub async fn ready(&self) -> Result<(), RegistryError> {
        wait_ready(&self.id, self.slot.clone()).await.map(|_| ())
    }
}

pub(crate) async fn wait_ready(
    id: &str,
    mut slot: watch::Receiver<Slot>,
) -> Result<Arc<KernelClient>, RegistryError> {
    let settled = slot
        .wait_for(|s| !matches!(s, Slot::Pending))
        .await
        .map(|s| s.clone())
        .map_err(|_| RegistryError::NotFound { id: id.to_string() })?;

    match settled {
        Slot::Ready(client) => Ok(client),
        Slot::Failed(reason) => Err(RegistryError::Bootstrap {
            id: id.to_string(),
            reason,
        }),
        Slot::Pending => Err(RegistryError::NotFound { id: id.to_string() }),
    }
}

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Kernel instance not found: {id}")]
    NotFound { id: String },

    #[error("Kernel {id} failed to start: {reason}")]
    Bootstrap { id: String, reason: String },

    #[error(transparent)]
    Kernel(#[from] KernelError),
}
