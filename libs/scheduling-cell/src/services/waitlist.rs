use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use shared_config::SchedulingSettings;

use crate::error::{SchedulingError, StoreError};
use crate::models::{
    AppointmentType, ContactMethod, FreedSlot, NewWaitlistEntry, WaitlistEntry, WaitlistFilter,
    WaitlistOffer, MAX_FLEXIBILITY_DAYS,
};
use crate::services::dispatch::CommunicationsGateway;
use crate::store::{AppointmentStore, WaitlistStore};

const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$";
const PHONE_PATTERN: &str = r"^\+?[0-9][0-9\s\-\.\(\)]{5,19}$";

/// Waiting candidates for freed capacity, best first: matching type, not
/// fulfilled, date window and time band accept the interval; ordered by
/// priority descending then `created_at` ascending.
pub fn rank_candidates(entries: Vec<WaitlistEntry>, slot: &FreedSlot) -> Vec<WaitlistEntry> {
    let mut candidates: Vec<WaitlistEntry> = entries
        .into_iter()
        .filter(|e| e.company_id == slot.company_id)
        .filter(|e| e.appointment_type == slot.appointment_type)
        .filter(|e| !e.is_fulfilled())
        .filter(|e| e.accepts(&slot.interval))
        .collect();

    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    candidates
}

pub struct WaitlistMatcher {
    waitlist: Arc<dyn WaitlistStore>,
    appointments: Arc<dyn AppointmentStore>,
    communications: Arc<dyn CommunicationsGateway>,
    settings: SchedulingSettings,
    email_regex: Regex,
    phone_regex: Regex,
}

impl WaitlistMatcher {
    pub fn new(
        waitlist: Arc<dyn WaitlistStore>,
        appointments: Arc<dyn AppointmentStore>,
        communications: Arc<dyn CommunicationsGateway>,
        settings: SchedulingSettings,
    ) -> Self {
        Self {
            waitlist,
            appointments,
            communications,
            settings,
            email_regex: Regex::new(EMAIL_PATTERN).expect("email pattern compiles"),
            phone_regex: Regex::new(PHONE_PATTERN).expect("phone pattern compiles"),
        }
    }

    fn validate_contact(&self, method: ContactMethod, value: &str) -> Result<(), SchedulingError> {
        let value = value.trim();
        let valid = match method {
            ContactMethod::Email => self.email_regex.is_match(value) && value.len() <= 254,
            ContactMethod::Sms | ContactMethod::Phone | ContactMethod::Whatsapp => {
                self.phone_regex.is_match(value)
            }
        };

        if valid {
            Ok(())
        } else {
            Err(SchedulingError::Validation(format!(
                "contact_value is not a valid {:?} contact",
                method
            )))
        }
    }

    pub async fn add_to_waitlist(
        &self,
        company_id: Uuid,
        request: NewWaitlistEntry,
    ) -> Result<WaitlistEntry, SchedulingError> {
        let priority = request
            .priority
            .unwrap_or(self.settings.waitlist_default_priority);
        if !(1..=10).contains(&priority) {
            return Err(SchedulingError::Validation(
                "priority must be between 1 and 10".to_string(),
            ));
        }

        let flexibility_days = request
            .flexibility_days
            .unwrap_or(self.settings.waitlist_default_flexibility_days);
        if flexibility_days < 0 {
            return Err(SchedulingError::Validation(
                "flexibility_days cannot be negative".to_string(),
            ));
        }
        if flexibility_days > MAX_FLEXIBILITY_DAYS {
            return Err(SchedulingError::Validation(format!(
                "flexibility_days cannot exceed {}",
                MAX_FLEXIBILITY_DAYS
            )));
        }

        self.validate_contact(request.contact_method, &request.contact_value)?;

        let entry = WaitlistEntry {
            id: Uuid::new_v4(),
            company_id,
            patient_id: request.patient_id,
            appointment_type: request.appointment_type,
            preferred_date: request.preferred_date,
            preferred_time_range: request.preferred_time_range,
            flexibility_days,
            contact_method: request.contact_method,
            contact_value: request.contact_value.trim().to_string(),
            priority,
            notes: request.notes,
            created_at: Utc::now(),
            fulfilled_appointment_id: None,
            fulfilled_at: None,
        };

        let stored = self.waitlist.create(entry).await?;
        info!(
            "Patient {} added to waitlist for {} with priority {}",
            stored.patient_id, stored.appointment_type, stored.priority
        );
        Ok(stored)
    }

    pub async fn list_waitlist(
        &self,
        company_id: Uuid,
        appointment_type: Option<AppointmentType>,
        include_fulfilled: bool,
    ) -> Result<Vec<WaitlistEntry>, SchedulingError> {
        let entries = self
            .waitlist
            .list(WaitlistFilter {
                company_id,
                appointment_type,
                include_fulfilled,
            })
            .await?;
        Ok(entries)
    }

    /// Offers freed capacity to the best waiting candidate. Never books:
    /// the patient's reply goes through `fulfill_waitlist_entry`.
    #[instrument(skip(self, slot), fields(company_id = %slot.company_id))]
    pub async fn on_slot_freed(&self, slot: FreedSlot) -> Result<Option<WaitlistOffer>, SchedulingError> {
        let entries = self
            .list_waitlist(slot.company_id, Some(slot.appointment_type), false)
            .await?;
        let mut ranked = rank_candidates(entries, &slot);

        if ranked.is_empty() {
            debug!(
                "No waitlist candidates for {} slot at {}",
                slot.appointment_type, slot.interval.start
            );
            return Ok(None);
        }

        let top = ranked.remove(0);
        let offer = WaitlistOffer {
            ranked_candidates: ranked.iter().map(|e| e.id).collect(),
            entry: top,
            slot,
        };

        match self.communications.offer_waitlist_slot(&offer).await {
            Ok(()) => info!(
                "Offered freed slot at {} to waitlist entry {}",
                offer.slot.interval.start, offer.entry.id
            ),
            Err(e) => warn!(
                "Failed to offer freed slot to waitlist entry {}: {}",
                offer.entry.id, e
            ),
        }

        Ok(Some(offer))
    }

    /// Runs `on_slot_freed` on its own task; the caller does not wait.
    pub fn offer_in_background(self: &Arc<Self>, slot: FreedSlot) {
        let matcher = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = matcher.on_slot_freed(slot).await {
                warn!("Waitlist matching failed: {}", e);
            }
        });
    }

    /// The entry is linked with a conditional write, so of two racing
    /// fulfilments exactly one succeeds.
    pub async fn fulfill_waitlist_entry(
        &self,
        company_id: Uuid,
        entry_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<WaitlistEntry, SchedulingError> {
        let entry = self.waitlist.get_by_id(company_id, entry_id).await?;
        if let Some(existing) = entry.fulfilled_appointment_id {
            return Err(already_fulfilled(existing));
        }

        let appointment = self.appointments.get_by_id(company_id, appointment_id).await?;
        if appointment.patient_id != entry.patient_id {
            return Err(SchedulingError::Validation(
                "appointment belongs to a different patient".to_string(),
            ));
        }

        let stored = match self
            .waitlist
            .mark_fulfilled(company_id, entry_id, appointment.id, Utc::now())
            .await
        {
            Ok(stored) => stored,
            Err(StoreError::VersionConflict { .. }) => {
                let current = self.waitlist.get_by_id(company_id, entry_id).await?;
                warn!("Waitlist entry {} was fulfilled concurrently", entry_id);
                return Err(already_fulfilled(
                    current.fulfilled_appointment_id.unwrap_or(appointment.id),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            "Waitlist entry {} fulfilled by appointment {}",
            stored.id, appointment.id
        );
        Ok(stored)
    }
}

fn already_fulfilled(appointment_id: Uuid) -> SchedulingError {
    SchedulingError::Validation(format!(
        "waitlist entry already fulfilled by appointment {}",
        appointment_id
    ))
}
