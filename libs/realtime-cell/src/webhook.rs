use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use scheduling_cell::error::DeliveryError;
use scheduling_cell::models::{Appointment, WaitlistOffer};
use scheduling_cell::services::dispatch::CommunicationsGateway;

/// Posts patient-facing messaging jobs to an external communications service.
///
/// Every job goes to the same URL; the `type` field tells the receiver what to
/// send. 4xx responses are treated as rejections, anything else as the
/// channel being unavailable.
pub struct WebhookCommunicationsGateway {
    client: Client,
    url: String,
}

impl WebhookCommunicationsGateway {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }

    async fn post(&self, kind: &str, data: Value) -> Result<(), DeliveryError> {
        let body = json!({
            "type": kind,
            "sent_at": Utc::now().to_rfc3339(),
            "data": data,
        });

        debug!("Posting {} to communications webhook", kind);

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let response_text = response.text().await.unwrap_or_default();
        error!("Communications webhook failed for {}: {} - {}", kind, status, response_text);

        let message = format!("HTTP {}: {}", status, response_text);
        if status.is_client_error() {
            Err(DeliveryError::Rejected(message))
        } else {
            Err(DeliveryError::Unavailable(message))
        }
    }
}

#[async_trait]
impl CommunicationsGateway for WebhookCommunicationsGateway {
    async fn schedule_reminder(&self, appointment: &Appointment) -> Result<(), DeliveryError> {
        self.post(
            "appointment_reminder",
            json!({
                "appointment_id": appointment.id,
                "company_id": appointment.company_id,
                "patient_id": appointment.patient_id,
                "appointment_type": appointment.appointment_type,
                "start_time": appointment.start_time,
                "end_time": appointment.end_time,
                "location": appointment.location,
                "is_virtual": appointment.is_virtual,
            }),
        )
        .await
    }

    async fn offer_waitlist_slot(&self, offer: &WaitlistOffer) -> Result<(), DeliveryError> {
        let data = serde_json::to_value(offer).map_err(|e| DeliveryError::Rejected(e.to_string()))?;
        self.post("waitlist_offer", data).await
    }
}

/// Used when no webhook is configured: jobs are logged and dropped.
#[derive(Debug, Default, Clone)]
pub struct TracingCommunicationsGateway;

#[async_trait]
impl CommunicationsGateway for TracingCommunicationsGateway {
    async fn schedule_reminder(&self, appointment: &Appointment) -> Result<(), DeliveryError> {
        info!(
            "Reminder requested for appointment {} at {}",
            appointment.id, appointment.start_time
        );
        Ok(())
    }

    async fn offer_waitlist_slot(&self, offer: &WaitlistOffer) -> Result<(), DeliveryError> {
        info!(
            "Waitlist entry {} offered slot {} - {} via {:?}",
            offer.entry.id, offer.slot.interval.start, offer.slot.interval.end, offer.entry.contact_method
        );
        Ok(())
    }
}
