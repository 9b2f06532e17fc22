//! Named consumer targets.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

use super::types::{Delivery, RoutedEvent};

/// Registry of consumer targets keyed by name.
///
/// A target is the receiving end of a bounded channel. Dropping the receiver
/// makes the target absent; it is pruned on the next delivery.
#[derive(Debug, Clone)]
pub struct TargetRegistry {
    targets: Arc<RwLock<HashMap<String, mpsc::Sender<RoutedEvent>>>>,
    capacity: usize,
}

impl TargetRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            targets: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Register `name`, replacing any previous target with that name.
    pub async fn register(&self, name: &str) -> mpsc::Receiver<RoutedEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let replaced = self
            .targets
            .write()
            .await
            .insert(name.to_string(), tx)
            .is_some();
        info!(target_name = name, replaced, "Target registered");
        rx
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.targets.write().await.remove(name).is_some();
        if removed {
            info!(target_name = name, "Target unregistered");
        }
        removed
    }

    /// Whether `name` exists and is still being read.
    pub async fn contains(&self, name: &str) -> bool {
        self.targets
            .read()
            .await
            .get(name)
            .is_some_and(|tx| !tx.is_closed())
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .targets
            .read()
            .await
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Hand `event` to `name`, waiting for queue space if the target is slow.
    pub async fn deliver(&self, name: &str, event: RoutedEvent) -> Delivery {
        let Some(tx) = self.targets.read().await.get(name).cloned() else {
            return Delivery::NoTarget;
        };

        if tx.send(event).await.is_ok() {
            return Delivery::Delivered;
        }

        // Receiver dropped; forget it unless it has been replaced meanwhile.
        let mut targets = self.targets.write().await;
        if targets.get(name).is_some_and(|current| current.same_channel(&tx)) {
            targets.remove(name);
            debug!(target_name = name, "Pruned closed target");
        }
        Delivery::NoTarget
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}
