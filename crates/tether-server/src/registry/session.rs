//! Device ↔ connection index for online agents.
//!
//! Exactly one session exists per device at a time. A newer connection for
//! the same device replaces the older one without any teardown handshake,
//! and the older connection's later `unregister` becomes a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

use tether_core::db::unix_timestamp;
use tether_core::protocol::ServerMessage;

/// One live agent connection.
#[derive(Debug)]
pub struct AgentSession {
    pub device_id: String,
    pub connection_id: String,
    pub organization_id: String,
    /// Frames queued here are written to the agent by its connection task.
    pub outbound: mpsc::Sender<ServerMessage>,
    pub connected_at: i64,
}

impl AgentSession {
    /// Queue a frame for the agent.
    pub async fn send(
        &self,
        message: ServerMessage,
    ) -> Result<(), mpsc::error::SendError<ServerMessage>> {
        self.outbound.send(message).await
    }
}

#[derive(Default)]
struct Inner {
    by_device: HashMap<String, Arc<AgentSession>>,
    /// connection id -> device id
    by_connection: HashMap<String, String>,
}

/// Thread-safe registry of online agents.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `device_id` as reachable through `connection_id`, replacing any older connection.
    pub async fn register(
        &self,
        device_id: String,
        connection_id: String,
        organization_id: String,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Arc<AgentSession> {
        let session = Arc::new(AgentSession {
            device_id: device_id.clone(),
            connection_id: connection_id.clone(),
            organization_id,
            outbound,
            connected_at: unix_timestamp(),
        });

        let mut inner = self.inner.write().await;
        if let Some(previous) = inner.by_device.insert(device_id.clone(), Arc::clone(&session)) {
            inner.by_connection.remove(&previous.connection_id);
            info!(
                device_id = %device_id,
                old_connection_id = %previous.connection_id,
                connection_id = %connection_id,
                "Agent session replaced by newer connection"
            );
        } else {
            info!(device_id = %device_id, connection_id = %connection_id, "Agent session registered");
        }
        inner.by_connection.insert(connection_id, device_id);
        session
    }

    /// Drop whichever device currently holds `connection_id`.
    ///
    /// Returns `None` when the connection is unknown or already superseded.
    pub async fn unregister(&self, connection_id: &str) -> Option<Arc<AgentSession>> {
        let mut inner = self.inner.write().await;
        let Some(device_id) = inner.by_connection.remove(connection_id) else {
            debug!(connection_id = %connection_id, "Unregister for unknown connection ignored");
            return None;
        };
        let session = inner.by_device.remove(&device_id);
        if session.is_some() {
            info!(device_id = %device_id, connection_id = %connection_id, "Agent session unregistered");
        }
        session
    }

    /// Connection currently serving `device_id`.
    pub async fn lookup_by_device(&self, device_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .by_device
            .get(device_id)
            .map(|s| s.connection_id.clone())
    }

    /// Device served by `connection_id`.
    pub async fn lookup_by_connection(&self, connection_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .by_connection
            .get(connection_id)
            .cloned()
    }

    pub async fn is_online(&self, device_id: &str) -> bool {
        self.inner.read().await.by_device.contains_key(device_id)
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<AgentSession>> {
        self.inner.read().await.by_device.get(device_id).cloned()
    }

    /// Online sessions among `device_ids` that belong to `organization_id`, in input order.
    pub async fn online_in_org(
        &self,
        organization_id: &str,
        device_ids: &[String],
    ) -> Vec<Arc<AgentSession>> {
        let inner = self.inner.read().await;
        let mut seen = std::collections::HashSet::new();
        device_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter_map(|id| inner.by_device.get(id))
            .filter(|s| s.organization_id == organization_id)
            .cloned()
            .collect()
    }

    /// Device IDs online for an organization.
    pub async fn devices_for_org(&self, organization_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .read()
            .await
            .by_device
            .values()
            .filter(|s| s.organization_id == organization_id)
            .map(|s| s.device_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.by_device.len()
    }
}
