//! Per-channel forwarding tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use kernelhub_core::protocol::Channel;

use super::targets::TargetRegistry;
use super::types::{Delivery, RoutedEvent, RouterStats};
use crate::display::DisplayMaterializer;
use crate::kernel::KernelClient;

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    dropped_no_target: AtomicU64,
    dropped_transform_error: AtomicU64,
}

/// Forwards kernel events to consumer targets.
#[derive(Debug, Clone)]
pub struct EventRouter {
    targets: TargetRegistry,
    materializer: Option<DisplayMaterializer>,
    counters: Arc<Counters>,
}

impl EventRouter {
    /// Without a materializer, display events are forwarded unchanged.
    pub fn new(targets: TargetRegistry, materializer: Option<DisplayMaterializer>) -> Self {
        Self {
            targets,
            materializer,
            counters: Arc::default(),
        }
    }

    pub const fn targets(&self) -> &TargetRegistry {
        &self.targets
    }

    /// Forward `channel` of `client` to `target`.
    ///
    /// Returns `None` if the channel already has a consumer.
    pub fn subscribe(
        &self,
        target: &str,
        client: &KernelClient,
        channel: Channel,
    ) -> Option<JoinHandle<()>> {
        let Some(mut events) = client.take_channel(channel) else {
            warn!(
                kernel_id = client.id(),
                %channel,
                "Channel already has a consumer"
            );
            return None;
        };

        let router = self.clone();
        let target = target.to_string();
        let instance_id = client.id().to_string();
        debug!(kernel_id = %instance_id, %channel, target_name = %target, "Subscribed");

        Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let event = match &router.materializer {
                    Some(materializer) => match materializer.materialize(event).await {
                        Ok(event) => event,
                        Err(e) => {
                            router
                                .counters
                                .dropped_transform_error
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(
                                kernel_id = %instance_id,
                                %channel,
                                error = %e,
                                "Dropping event that failed to materialize"
                            );
                            continue;
                        }
                    },
                    None => event,
                };

                let routed = RoutedEvent {
                    instance_id: instance_id.clone(),
                    channel: event.channel,
                    payload: event.payload,
                };
                match router.targets.deliver(&target, routed).await {
                    Delivery::Delivered => {
                        router.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Delivery::NoTarget => {
                        router
                            .counters
                            .dropped_no_target
                            .fetch_add(1, Ordering::Relaxed);
                        debug!(
                            kernel_id = %instance_id,
                            %channel,
                            target_name = %target,
                            "No target, dropping event"
                        );
                    }
                }
            }
            debug!(kernel_id = %instance_id, %channel, "Channel closed");
        }))
    }

    /// Forward every channel of `client` to `target`.
    pub fn subscribe_all(&self, target: &str, client: &KernelClient) -> Vec<JoinHandle<()>> {
        Channel::ALL
            .into_iter()
            .filter_map(|channel| self.subscribe(target, client, channel))
            .collect()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped_no_target: self.counters.dropped_no_target.load(Ordering::Relaxed),
            dropped_transform_error: self
                .counters
                .dropped_transform_error
                .load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::files::FileServer;
    use crate::kernel::{KernelClientConfig, KernelPeer, KernelTransport};
    use kernelhub_core::config::FileServerConfig;
    use serde_json::json;

    fn kernel(id: &str) -> (KernelClient, KernelPeer) {
        let (transport, peer) = KernelTransport::pair(16);
        (
            KernelClient::new(id, transport, None, KernelClientConfig::default()),
            peer,
        )
    }

    #[tokio::test]
    async fn forwards_in_order_to_present_target() {
        let router = EventRouter::new(TargetRegistry::default(), None);
        let mut rx = router.targets().register("mainWindow").await;
        let (client, peer) = kernel("k-1");
        assert_eq!(router.subscribe_all("mainWindow", &client).len(), 6);

        let sender = peer.sender();
        for n in 0..5 {
            sender.emit(Channel::Iopub, json!({ "n": n })).await;
        }
        for n in 0..5 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.instance_id, "k-1");
            assert_eq!(event.channel, Channel::Iopub);
            assert_eq!(event.payload["n"], n);
        }
        assert_eq!(router.stats().delivered, 5);
    }

    #[tokio::test]
    async fn absent_target_drops_silently() {
        let router = EventRouter::new(TargetRegistry::default(), None);
        let (client, peer) = kernel("k-2");
        let handle = router.subscribe("mainWindow", &client, Channel::Error).unwrap();

        peer.sender().emit(Channel::Error, json!({ "ename": "NameError" })).await;
        drop(peer);
        drop(client);
        handle.await.unwrap();

        let stats = router.stats();
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.dropped_no_target, 1);
    }

    #[tokio::test]
    async fn channel_can_only_be_subscribed_once() {
        let router = EventRouter::new(TargetRegistry::default(), None);
        let (client, _peer) = kernel("k-3");
        assert!(router.subscribe("a", &client, Channel::Shell).is_some());
        assert!(router.subscribe("b", &client, Channel::Shell).is_none());
        assert_eq!(router.subscribe_all("b", &client).len(), 5);
    }

    #[tokio::test]
    async fn display_events_are_materialized_before_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(FileServer::new(FileServerConfig::default()));
        let materializer = DisplayMaterializer::new(Arc::clone(&files)).with_temp_dir(dir.path());
        let router = EventRouter::new(TargetRegistry::default(), Some(materializer));
        let mut rx = router.targets().register("mainWindow").await;
        let (client, peer) = kernel("k-4");
        router.subscribe_all("mainWindow", &client);

        let sender = peer.sender();
        sender
            .emit(
                Channel::Iopub,
                json!({ "msg_type": "display_data", "content": { "data": { "image/png": "!!" } } }),
            )
            .await;
        sender
            .emit(
                Channel::Iopub,
                json!({
                    "msg_type": "display_data",
                    "content": { "data": { "text/html": "<b>hi</b>" } },
                }),
            )
            .await;

        // The broken event is dropped; the good one arrives rewritten.
        let event = rx.recv().await.unwrap();
        let route = event.payload["content"]["data"]["text/html"].as_str().unwrap();
        assert!(route.starts_with('/') && route.ends_with(".html"));
        assert_eq!(files.route_count().await, 1);

        let stats = router.stats();
        assert_eq!(stats.dropped_transform_error, 1);
        assert_eq!(stats.delivered, 1);
    }
}
