//! Kernel instance lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use kernelhub_core::KernelOptions;

use super::types::{InstanceInfo, InstanceState, KernelHandle, RegistryError, Slot, wait_ready};
use crate::kernel::{KernelClient, KernelLauncher};
use crate::router::EventRouter;

struct Entry {
    options: KernelOptions,
    slot: watch::Receiver<Slot>,
    bootstrap: JoinHandle<()>,
}

/// Where newly launched kernels send their events.
#[derive(Debug, Clone)]
struct Subscription {
    router: EventRouter,
    target: String,
}

/// Registry of live kernel instances.
pub struct KernelRegistry {
    instances: Arc<RwLock<HashMap<String, Entry>>>,
    launcher: Arc<dyn KernelLauncher>,
    subscription: Option<Subscription>,
    startup_timeout: Duration,
}

impl KernelRegistry {
    pub fn new(launcher: Arc<dyn KernelLauncher>, startup_timeout: Duration) -> Self {
        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
            launcher,
            subscription: None,
            startup_timeout,
        }
    }

    /// Subscribe every new kernel's channels to `target` on `router`.
    #[must_use]
    pub fn with_router(mut self, router: EventRouter, target: impl Into<String>) -> Self {
        self.subscription = Some(Subscription {
            router,
            target: target.into(),
        });
        self
    }

    /// Start a kernel.
    ///
    /// The id is allocated and registered before this returns; launching and
    /// waiting for readiness happen in the background. Await
    /// [`KernelHandle::ready`] or [`get`](Self::get) to observe the outcome.
    pub async fn create(&self, options: KernelOptions) -> Result<KernelHandle, RegistryError> {
        options.validate()?;

        let id = uuid::Uuid::new_v4().to_string();
        let (slot_tx, slot_rx) = watch::channel(Slot::Pending);

        let bootstrap = Bootstrap {
            id: id.clone(),
            options: options.clone(),
            launcher: Arc::clone(&self.launcher),
            subscription: self.subscription.clone(),
            instances: Arc::clone(&self.instances),
            startup_timeout: self.startup_timeout,
            slot: slot_tx,
        };

        // Hold the write lock across spawn so the entry exists before the
        // bootstrap task can look for it.
        let mut instances = self.instances.write().await;
        let handle = tokio::spawn(bootstrap.run());
        instances.insert(
            id.clone(),
            Entry {
                options,
                slot: slot_rx.clone(),
                bootstrap: handle,
            },
        );
        drop(instances);

        info!(kernel_id = %id, "Kernel instance created");
        Ok(KernelHandle { id, slot: slot_rx })
    }

    /// Start a kernel from untyped options.
    pub async fn create_from_value(&self, options: &Value) -> Result<KernelHandle, RegistryError> {
        let options = KernelOptions::from_value(options)?;
        self.create(options).await
    }

    /// Look up an instance, waiting for it to become ready.
    pub async fn get(&self, id: &str) -> Result<Arc<KernelClient>, RegistryError> {
        let slot = self
            .instances
            .read()
            .await
            .get(id)
            .map(|entry| entry.slot.clone())
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;
        wait_ready(id, slot).await
    }

    /// Remove an instance and terminate its kernel.
    ///
    /// The id is gone even if termination fails.
    pub async fn kill(&self, id: &str) -> Result<(), RegistryError> {
        let entry = self
            .instances
            .write()
            .await
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;

        info!(kernel_id = id, "Killing kernel instance");
        terminate(id, entry).await
    }

    pub async fn state(&self, id: &str) -> Option<InstanceState> {
        self.instances
            .read()
            .await
            .get(id)
            .map(|entry| InstanceState::from(&*entry.slot.borrow()))
    }

    pub async fn list(&self) -> Vec<InstanceInfo> {
        let mut infos: Vec<InstanceInfo> = self
            .instances
            .read()
            .await
            .iter()
            .map(|(id, entry)| InstanceInfo {
                id: id.clone(),
                state: InstanceState::from(&*entry.slot.borrow()),
                options: entry.options.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// Start a throwaway kernel, ask for its status, and kill it.
    ///
    /// The kernel is never registered and its events are not routed.
    pub async fn check(&self, options: KernelOptions) -> Result<Value, RegistryError> {
        options.validate()?;
        let id = format!("check-{}", uuid::Uuid::new_v4());

        let client = self.launcher.launch(&id, &options)?;
        let outcome = match tokio::time::timeout(self.startup_timeout, client.ready()).await {
            Ok(Ok(())) => client.get_status().await.map_err(RegistryError::from),
            Ok(Err(e)) => Err(RegistryError::from(e)),
            Err(_) => Err(RegistryError::Bootstrap {
                id: id.clone(),
                reason: format!("not ready after {:?}", self.startup_timeout),
            }),
        };

        if let Err(e) = client.kill().await {
            warn!(kernel_id = %id, error = %e, "Failed to stop check kernel");
        }
        info!(kernel_id = %id, ok = outcome.is_ok(), "Kernel check finished");
        outcome
    }

    /// Kill every instance. Returns how many there were.
    pub async fn shutdown(&self) -> usize {
        let entries: Vec<(String, Entry)> = self.instances.write().await.drain().collect();
        let count = entries.len();
        for (id, entry) in entries {
            if let Err(e) = terminate(&id, entry).await {
                warn!(kernel_id = %id, error = %e, "Failed to stop kernel during shutdown");
            }
        }
        if count > 0 {
            info!(count, "All kernel instances stopped");
        }
        count
    }

    pub async fn execute(&self, id: &str, text: &str) -> Result<Value, RegistryError> {
        Ok(self.get(id).await?.execute(text).await?)
    }

    pub async fn execute_hidden(
        &self,
        id: &str,
        code: &str,
        resolve_event: &str,
    ) -> Result<Value, RegistryError> {
        Ok(self.get(id).await?.execute_hidden(code, resolve_event).await?)
    }

    pub async fn eval(&self, id: &str, text: &str) -> Result<Value, RegistryError> {
        Ok(self.get(id).await?.eval(text).await?)
    }

    pub async fn get_auto_complete(
        &self,
        id: &str,
        text: &str,
        cursor_pos: usize,
    ) -> Result<Value, RegistryError> {
        Ok(self.get(id).await?.get_auto_complete(text, cursor_pos).await?)
    }

    pub async fn get_inspection(
        &self,
        id: &str,
        text: &str,
        cursor_pos: usize,
        detail_level: u8,
    ) -> Result<Value, RegistryError> {
        Ok(self
            .get(id)
            .await?
            .get_inspection(text, cursor_pos, detail_level)
            .await?)
    }

    pub async fn get_status(&self, id: &str) -> Result<Value, RegistryError> {
        Ok(self.get(id).await?.get_status().await?)
    }

    pub async fn is_complete(&self, id: &str, text: &str) -> Result<Value, RegistryError> {
        Ok(self.get(id).await?.is_complete(text).await?)
    }

    pub async fn interrupt(&self, id: &str) -> Result<(), RegistryError> {
        Ok(self.get(id).await?.interrupt().await?)
    }
}

async fn terminate(id: &str, entry: Entry) -> Result<(), RegistryError> {
    let slot = entry.slot.borrow().clone();
    match slot {
        Slot::Ready(client) => client.kill().await.map_err(RegistryError::from),
        Slot::Pending => {
            // Dropping the half-started client kills its process.
            entry.bootstrap.abort();
            info!(kernel_id = id, "Aborted kernel bootstrap");
            Ok(())
        }
        Slot::Failed(_) => Ok(()),
    }
}

struct Bootstrap {
    id: String,
    options: KernelOptions,
    launcher: Arc<dyn KernelLauncher>,
    subscription: Option<Subscription>,
    instances: Arc<RwLock<HashMap<String, Entry>>>,
    startup_timeout: Duration,
    slot: watch::Sender<Slot>,
}

impl Bootstrap {
    async fn run(self) {
        let client = match self.launcher.launch(&self.id, &self.options) {
            Ok(client) => Arc::new(client),
            Err(e) => return self.fail(e.to_string()).await,
        };

        // Subscribe before readiness so early output is not lost.
        if let Some(sub) = &self.subscription {
            sub.router.subscribe_all(&sub.target, &client);
        }

        match tokio::time::timeout(self.startup_timeout, client.ready()).await {
            Ok(Ok(())) => {
                info!(kernel_id = %self.id, cmd = %self.options.cmd, "Kernel instance ready");
                self.slot.send_replace(Slot::Ready(client));
            }
            Ok(Err(e)) => {
                if let Err(kill_err) = client.kill().await {
                    warn!(
                        kernel_id = %self.id,
                        error = %kill_err,
                        "Failed to stop exited kernel"
                    );
                }
                self.fail(e.to_string()).await;
            }
            Err(_) => {
                if let Err(e) = client.kill().await {
                    warn!(kernel_id = %self.id, error = %e, "Failed to stop unready kernel");
                }
                let reason = format!("not ready after {:?}", self.startup_timeout);
                self.fail(reason).await;
            }
        }
    }

    async fn fail(self, reason: String) {
        self.instances.write().await.remove(&self.id);
        error!(kernel_id = %self.id, cmd = %self.options.cmd, %reason, "Kernel bootstrap failed");
        self.slot.send_replace(Slot::Failed(reason));
    }
}
