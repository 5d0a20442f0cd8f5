use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use scheduling_cell::error::DeliveryError;
use scheduling_cell::models::{Notification, WorkflowEvent};
use scheduling_cell::services::dispatch::{EventBroadcaster, NotificationDispatcher};

pub type RealtimeSender = broadcast::Sender<String>;
pub type RealtimeReceiver = broadcast::Receiver<String>;

const CHANNEL_CAPACITY: usize = 100;
const GLOBAL_CAPACITY: usize = 1000;

/// In-process fan-out of workflow events to tenant dashboards and
/// notifications to individual staff members.
///
/// Channels are created lazily on first subscription. Messages sent while a
/// channel has no subscribers are dropped.
pub struct RealtimeHub {
    tenants: Arc<RwLock<HashMap<Uuid, RealtimeSender>>>,
    users: Arc<RwLock<HashMap<Uuid, RealtimeSender>>>,
    global_sender: RealtimeSender,
}

impl RealtimeHub {
    pub fn new() -> Self {
        let (global_sender, _) = broadcast::channel(GLOBAL_CAPACITY);

        Self {
            tenants: Arc::new(RwLock::new(HashMap::new())),
            users: Arc::new(RwLock::new(HashMap::new())),
            global_sender,
        }
    }

    pub async fn subscribe_tenant(&self, company_id: Uuid) -> RealtimeReceiver {
        let receiver = Self::subscribe(&self.tenants, company_id).await;
        debug!("Subscribed to realtime channel for tenant {}", company_id);
        receiver
    }

    pub async fn subscribe_user(&self, user_id: Uuid) -> RealtimeReceiver {
        let receiver = Self::subscribe(&self.users, user_id).await;
        debug!("Subscribed to realtime channel for user {}", user_id);
        receiver
    }

    /// Every tenant event and user notification, wrapped with its routing key.
    pub fn subscribe_global(&self) -> RealtimeReceiver {
        self.global_sender.subscribe()
    }

    /// Drops channels whose last subscriber has gone away.
    pub async fn prune_idle_channels(&self) -> usize {
        let mut removed = 0;
        for channels in [&self.tenants, &self.users] {
            let mut channels = channels.write().await;
            let before = channels.len();
            channels.retain(|_, sender| sender.receiver_count() > 0);
            removed += before - channels.len();
        }

        if removed > 0 {
            debug!("Pruned {} idle realtime channels", removed);
        }
        removed
    }

    pub async fn active_tenants(&self) -> Vec<Uuid> {
        let tenants = self.tenants.read().await;
        tenants.keys().cloned().collect()
    }

    // Private helper methods

    async fn subscribe(
        channels: &RwLock<HashMap<Uuid, RealtimeSender>>,
        key: Uuid,
    ) -> RealtimeReceiver {
        {
            let channels = channels.read().await;
            if let Some(sender) = channels.get(&key) {
                return sender.subscribe();
            }
        }

        let mut channels = channels.write().await;
        channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    async fn send_to(
        channels: &RwLock<HashMap<Uuid, RealtimeSender>>,
        key: Uuid,
        message: String,
    ) -> bool {
        let channels = channels.read().await;
        match channels.get(&key) {
            Some(sender) => match sender.send(message) {
                Ok(_) => true,
                Err(_) => {
                    debug!("Realtime channel {} has no active subscribers", key);
                    false
                }
            },
            None => false,
        }
    }

    fn send_global(&self, kind: &str, key: Uuid, data: serde_json::Value) {
        let message = json!({
            "type": kind,
            "key": key,
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        })
        .to_string();

        if let Err(e) = self.global_sender.send(message) {
            debug!("Failed to send to global channel: {}", e);
        }
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for RealtimeHub {
    fn clone(&self) -> Self {
        Self {
            tenants: Arc::clone(&self.tenants),
            users: Arc::clone(&self.users),
            global_sender: self.global_sender.clone(),
        }
    }
}

#[async_trait]
impl EventBroadcaster for RealtimeHub {
    async fn broadcast_to_tenant(&self, company_id: Uuid, event: WorkflowEvent) -> Result<(), DeliveryError> {
        let data = serde_json::to_value(&event).map_err(|e| DeliveryError::Rejected(e.to_string()))?;
        let message = json!({ "type": "workflow_event", "data": &data }).to_string();

        let delivered = Self::send_to(&self.tenants, company_id, message).await;
        self.send_global("workflow_event", company_id, data);

        debug!(
            "Broadcast {} for appointment {} to tenant {} (delivered: {})",
            event.event, event.appointment_id, company_id, delivered
        );
        Ok(())
    }
}

#[async_trait]
impl NotificationDispatcher for RealtimeHub {
    async fn notify(&self, user_ids: &[Uuid], notification: Notification) -> Result<(), DeliveryError> {
        let data = serde_json::to_value(&notification).map_err(|e| DeliveryError::Rejected(e.to_string()))?;
        let message = json!({ "type": "notification", "data": &data }).to_string();

        let mut delivered = 0;
        for user_id in user_ids {
            if Self::send_to(&self.users, *user_id, message.clone()).await {
                delivered += 1;
            }
            self.send_global("notification", *user_id, data.clone());
        }

        if delivered < user_ids.len() {
            warn!(
                "Notification for appointment {} reached {} of {} users",
                notification.appointment_id,
                delivered,
                user_ids.len()
            );
        }
        Ok(())
    }
}
