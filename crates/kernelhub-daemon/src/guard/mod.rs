//! Single-instance kernel session.
//!
//! A [`KernelSession`] remembers at most one kernel instance and creates it
//! lazily on first use. Concurrent callers serialize on the remembered id so
//! exactly one instance is created.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use kernelhub_core::KernelOptions;

use crate::registry::{KernelRegistry, RegistryError};

/// Executions slower than this are logged at warn level.
const SLOW_EXECUTION: Duration = Duration::from_millis(250);

/// Lazily created, single kernel instance over a shared registry.
pub struct KernelSession {
    registry: Arc<KernelRegistry>,
    defaults: KernelOptions,
    instance: Mutex<Option<String>>,
}

impl KernelSession {
    pub fn new(registry: Arc<KernelRegistry>, defaults: KernelOptions) -> Self {
        Self {
            registry,
            defaults,
            instance: Mutex::new(None),
        }
    }

    pub const fn registry(&self) -> &Arc<KernelRegistry> {
        &self.registry
    }

    /// The remembered instance id, if any.
    pub async fn instance_id(&self) -> Option<String> {
        self.instance.lock().await.clone()
    }

    /// Return the remembered instance, creating one with the default options
    /// if there is none.
    pub async fn ensure_instance(&self) -> Result<String, RegistryError> {
        self.create(self.defaults.clone()).await
    }

    /// Create an instance with `options` unless one is already remembered, in
    /// which case that one is returned unchanged.
    pub async fn create(&self, options: KernelOptions) -> Result<String, RegistryError> {
        let mut instance = self.instance.lock().await;
        if let Some(id) = instance.as_ref() {
            return Ok(id.clone());
        }

        let handle = self.registry.create(options).await?;
        let id = handle.id().to_string();
        *instance = Some(id.clone());
        drop(instance);

        info!(kernel_id = %id, "Session instance created");
        Ok(id)
    }

    /// Kill the remembered instance and forget it. No-op if there is none.
    ///
    /// The instance is forgotten even when termination fails.
    pub async fn kill(&self) -> Result<(), RegistryError> {
        let Some(id) = self.instance.lock().await.take() else {
            debug!("No session instance to kill");
            return Ok(());
        };
        info!(kernel_id = %id, "Killing session instance");
        self.registry.kill(&id).await
    }

    /// Kill the current instance (if any) and start a fresh one.
    pub async fn restart(&self) -> Result<String, RegistryError> {
        if let Err(e) = self.kill().await {
            warn!(error = %e, "Previous instance did not stop cleanly");
        }
        self.ensure_instance().await
    }

    pub async fn execute(&self, text: &str) -> Result<Value, RegistryError> {
        let id = self.ensure_instance().await?;
        timed(&id, "execute", self.registry.execute(&id, text)).await
    }

    pub async fn execute_hidden(
        &self,
        code: &str,
        resolve_event: &str,
    ) -> Result<Value, RegistryError> {
        let id = self.ensure_instance().await?;
        timed(
            &id,
            "execute_hidden",
            self.registry.execute_hidden(&id, code, resolve_event),
        )
        .await
    }

    pub async fn eval(&self, text: &str) -> Result<Value, RegistryError> {
        let id = self.ensure_instance().await?;
        self.registry.eval(&id, text).await
    }

    pub async fn get_auto_complete(
        &self,
        text: &str,
        cursor_pos: usize,
    ) -> Result<Value, RegistryError> {
        let id = self.ensure_instance().await?;
        self.registry.get_auto_complete(&id, text, cursor_pos).await
    }

    pub async fn get_inspection(
        &self,
        text: &str,
        cursor_pos: usize,
        detail_level: u8,
    ) -> Result<Value, RegistryError> {
        let id = self.ensure_instance().await?;
        self.registry
            .get_inspection(&id, text, cursor_pos, detail_level)
            .await
    }

    pub async fn get_status(&self) -> Result<Value, RegistryError> {
        let id = self.ensure_instance().await?;
        self.registry.get_status(&id).await
    }

    pub async fn is_complete(&self, text: &str) -> Result<Value, RegistryError> {
        let id = self.ensure_instance().await?;
        self.registry.is_complete(&id, text).await
    }

    pub async fn interrupt(&self) -> Result<(), RegistryError> {
        let id = self.ensure_instance().await?;
        self.registry.interrupt(&id).await
    }
}

async fn timed<T>(
    id: &str,
    operation: &'static str,
    fut: impl Future<Output = Result<T, RegistryError>>,
) -> Result<T, RegistryError> {
    let started = Instant::now();
    let result = fut.await;
    let elapsed = started.elapsed();
    #[allow(clippy::cast_possible_truncation)]
    let elapsed_ms = elapsed.as_millis() as u64;
    if elapsed > SLOW_EXECUTION {
        warn!(
            kernel_id = id,
            operation,
            elapsed_ms,
            ok = result.is_ok(),
            "Slow kernel execution"
        );
    } else {
        debug!(
            kernel_id = id,
            operation,
            elapsed_ms,
            ok = result.is_ok(),
            "Kernel execution finished"
        );
    }
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::kernel::loopback::LoopbackLauncher;

    fn session(launcher: &LoopbackLauncher) -> KernelSession {
        let registry = KernelRegistry::new(Arc::new(launcher.clone()), Duration::from_secs(5));
        KernelSession::new(Arc::new(registry), KernelOptions::new("python3"))
    }

    #[tokio::test]
    async fn concurrent_ensure_creates_once() {
        let launcher = LoopbackLauncher::default();
        let session = Arc::new(session(&launcher));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let session = Arc::clone(&session);
            tasks.push(tokio::spawn(async move { session.ensure_instance().await.unwrap() }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }

        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(session.registry().len().await, 1);
        session.registry().get(&ids[0]).await.unwrap();
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let launcher = LoopbackLauncher::default();
        let session = session(&launcher);

        let first = session.create(KernelOptions::new("ipython")).await.unwrap();
        let second = session.create(KernelOptions::new("python3")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(session.registry().list().await[0].options.cmd, "ipython");
    }

    #[tokio::test]
    async fn kill_without_instance_is_noop() {
        let session = session(&LoopbackLauncher::default());
        session.kill().await.unwrap();
        assert!(session.instance_id().await.is_none());
    }

    #[tokio::test]
    async fn kill_forgets_instance_even_if_already_gone() {
        let session = session(&LoopbackLauncher::default());
        let id = session.ensure_instance().await.unwrap();
        session.registry().kill(&id).await.unwrap();

        assert!(matches!(session.kill().await, Err(RegistryError::NotFound { .. })));
        assert!(session.instance_id().await.is_none());
    }

    #[tokio::test]
    async fn restart_replaces_instance() {
        let launcher = LoopbackLauncher::default();
        let session = session(&launcher);

        let first = session.ensure_instance().await.unwrap();
        session.registry().get(&first).await.unwrap();

        let second = session.restart().await.unwrap();
        session.registry().get(&second).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(session.instance_id().await.as_deref(), Some(second.as_str()));
        assert!(matches!(
            session.registry().get(&first).await,
            Err(RegistryError::NotFound { .. })
        ));
        assert_eq!(launcher.launch_count(), 2);
    }

    #[tokio::test]
    async fn guarded_ops_create_on_demand() {
        let launcher = LoopbackLauncher::default();
        let session = session(&launcher);
        assert!(session.instance_id().await.is_none());

        let reply = session.execute("1 + 1").await.unwrap();
        assert_eq!(reply["status"], "ok");
        session.execute_hidden("x = 1", "done").await.unwrap();
        session.eval("x").await.unwrap();
        session.get_auto_complete("x", 1).await.unwrap();
        session.get_inspection("x", 1, 1).await.unwrap();
        session.get_status().await.unwrap();
        session.is_complete("x").await.unwrap();
        session.interrupt().await.unwrap();

        assert!(session.instance_id().await.is_some());
        assert_eq!(launcher.launch_count(), 1);
        assert_eq!(launcher.methods().len(), 8);
    }

    #[tokio::test]
    async fn failed_bootstrap_surfaces_on_first_op() {
        let session = session(&LoopbackLauncher::default().failing("python3: not found"));
        let err = session.execute("1").await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Bootstrap { .. } | RegistryError::NotFound { .. }
        ));
    }
}
