// libs/scheduling-cell/src/services/dispatch.rs
//
// Best-effort side channels. Every call is spawned after the persisting
// write has returned; failures are logged and never reach the caller.
//

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::models::{Appointment, Notification, WaitlistOffer, WorkflowEvent};

#[async_trait]
pub trait EventBroadcaster: Send + Sync {
    /// Fire-and-forget, at-most-once.
    async fn broadcast_to_tenant(&self, company_id: Uuid, event: WorkflowEvent) -> Result<(), DeliveryError>;
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(&self, user_ids: &[Uuid], notification: Notification) -> Result<(), DeliveryError>;
}

/// Patient-facing messaging (reminders, waitlist offers).
#[async_trait]
pub trait CommunicationsGateway: Send + Sync {
    async fn schedule_reminder(&self, appointment: &Appointment) -> Result<(), DeliveryError>;

    async fn offer_waitlist_slot(&self, offer: &WaitlistOffer) -> Result<(), DeliveryError>;
}

/// Bundles the delivery collaborators and launches each call on its own task.
#[derive(Clone)]
pub struct SideEffects {
    broadcaster: Arc<dyn EventBroadcaster>,
    notifier: Arc<dyn NotificationDispatcher>,
    communications: Arc<dyn CommunicationsGateway>,
}

impl SideEffects {
    pub fn new(
        broadcaster: Arc<dyn EventBroadcaster>,
        notifier: Arc<dyn NotificationDispatcher>,
        communications: Arc<dyn CommunicationsGateway>,
    ) -> Self {
        Self {
            broadcaster,
            notifier,
            communications,
        }
    }

    pub fn communications(&self) -> Arc<dyn CommunicationsGateway> {
        Arc::clone(&self.communications)
    }

    pub fn broadcast(&self, event: WorkflowEvent) {
        let broadcaster = Arc::clone(&self.broadcaster);
        tokio::spawn(async move {
            let appointment_id = event.appointment_id;
            let kind = event.event;
            match broadcaster.broadcast_to_tenant(event.company_id, event).await {
                Ok(()) => debug!("Broadcast {} for appointment {}", kind, appointment_id),
                Err(e) => warn!(
                    "Failed to broadcast {} for appointment {}: {}",
                    kind, appointment_id, e
                ),
            }
        });
    }

    pub fn notify(&self, user_ids: Vec<Uuid>, notification: Notification) {
        if user_ids.is_empty() {
            debug!(
                "No recipients for notification on appointment {}",
                notification.appointment_id
            );
            return;
        }

        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            let appointment_id = notification.appointment_id;
            if let Err(e) = notifier.notify(&user_ids, notification).await {
                warn!(
                    "Failed to notify {} users about appointment {}: {}",
                    user_ids.len(),
                    appointment_id,
                    e
                );
            }
        });
    }

    pub fn schedule_reminder(&self, appointment: Appointment) {
        let communications = Arc::clone(&self.communications);
        tokio::spawn(async move {
            if let Err(e) = communications.schedule_reminder(&appointment).await {
                warn!(
                    "Failed to schedule reminder for appointment {}: {}",
                    appointment.id, e
                );
            }
        });
    }
}
