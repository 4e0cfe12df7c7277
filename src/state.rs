//! Server state management.
//!
//! [`RelayState`] bundles the handles every request and connection task
//! needs. It is constructed once at startup and cloned into each task.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::TokenVerifier;
use crate::chat::ChatPersister;
use crate::hub::{Hub, HubHandle, Registry};
use crate::signaling::SignalingRouter;
use crate::store::MessageStore;

/// Outbound frames buffered per connection before it is treated as stalled.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Pending events per hub input channel.
const DEFAULT_HUB_CHANNEL_CAPACITY: usize = 1024;

/// Chat messages waiting for the persistence workers.
const DEFAULT_PERSIST_QUEUE_CAPACITY: usize = 1024;

const DEFAULT_PERSIST_WORKERS: usize = 2;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub queue_capacity: usize,
    pub hub_channel_capacity: usize,
    pub persist_queue_capacity: usize,
    pub persist_workers: usize,
    /// Allowed CORS origin for the web client.
    pub frontend_url: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            hub_channel_capacity: DEFAULT_HUB_CHANNEL_CAPACITY,
            persist_queue_capacity: DEFAULT_PERSIST_QUEUE_CAPACITY,
            persist_workers: DEFAULT_PERSIST_WORKERS,
            frontend_url: "http://localhost:3000".to_string(),
        }
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    pub config: Arc<RelayConfig>,

    /// Who is online. Read directly by signaling and the stats endpoint.
    pub registry: Registry,

    /// Register/unregister/chat go through the hub loop.
    pub hub: HubHandle,

    pub router: SignalingRouter,

    /// Read side for history sync. Writes go through `persister`.
    pub store: Arc<dyn MessageStore>,

    pub verifier: Arc<dyn TokenVerifier>,

    pub persister: ChatPersister,
}

impl RelayState {
    /// Start the persistence workers and the hub loop. Must be called from
    /// within a Tokio runtime.
    pub fn start(
        config: RelayConfig,
        store: Arc<dyn MessageStore>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        let persister = ChatPersister::start(
            store.clone(),
            config.persist_queue_capacity,
            config.persist_workers,
        );

        let registry = Registry::new();
        let (hub, handle) = Hub::new(
            registry.clone(),
            persister.clone(),
            config.hub_channel_capacity,
        );
        tokio::spawn(hub.run());

        tracing::info!(
            queue_capacity = config.queue_capacity,
            persist_workers = config.persist_workers,
            "Relay state initialized"
        );

        Self {
            config: Arc::new(config),
            router: SignalingRouter::new(registry.clone()),
            registry,
            hub: handle,
            store,
            verifier,
            persister,
        }
    }

    pub fn online_count(&self) -> usize {
        self.registry.online_count()
    }

    /// Stop accepting chat for storage and drain what is queued.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        self.persister.shutdown(deadline).await
    }
}
