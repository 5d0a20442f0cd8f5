// libs/scheduling-cell/src/services/scheduling.rs
//
// Booking orchestration. Every write that can collide with another booking
// holds the practitioner-day locks of every date its buffered interval
// touches across the conflict check and the store write.
//

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use shared_config::SchedulingSettings;

use crate::error::{LockError, SchedulingError, StoreError};
use crate::models::{
    Appointment, AppointmentFilter, AppointmentStatus, ConflictQuery, CreateAppointmentRequest,
    FreedSlot, Interval, Page, UpdateAppointmentDetails, WorkflowEvent, WorkflowEventKind,
};
use crate::services::conflict::{buffer_duration, ConflictDetectionService};
use crate::services::dispatch::SideEffects;
use crate::services::locking::{acquire_all, HeldLocks, LockKey, SlotLockManager};
use crate::services::waitlist::WaitlistMatcher;
use crate::services::workflow::WorkflowStateMachine;
use crate::store::AppointmentStore;

fn validate_interval(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), SchedulingError> {
    if end <= start {
        return Err(SchedulingError::Validation(
            "end_time must be after start_time".to_string(),
        ));
    }
    Ok(())
}

/// Minutes between `start` and `end`; the interval must be whole minutes.
fn interval_minutes(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<i64, SchedulingError> {
    let span = end - start;
    if span.num_seconds() % 60 != 0 || span.num_milliseconds() % 1000 != 0 {
        return Err(SchedulingError::Validation(
            "appointment times must fall on whole minutes".to_string(),
        ));
    }
    Ok(span.num_minutes())
}

fn booking_lock_error(err: LockError) -> SchedulingError {
    match err {
        LockError::Timeout { key } => {
            warn!("Lost booking race on {}", key);
            SchedulingError::SlotUnavailable(
                "another booking for this practitioner is in progress, retry".to_string(),
            )
        }
        LockError::Backend(msg) => SchedulingError::Persistence(msg),
    }
}

pub struct SchedulingService {
    store: Arc<dyn AppointmentStore>,
    conflicts: Arc<ConflictDetectionService>,
    locks: Arc<dyn SlotLockManager>,
    workflow: Arc<WorkflowStateMachine>,
    waitlist: Arc<WaitlistMatcher>,
    effects: SideEffects,
    settings: SchedulingSettings,
}

impl SchedulingService {
    pub fn new(
        store: Arc<dyn AppointmentStore>,
        conflicts: Arc<ConflictDetectionService>,
        locks: Arc<dyn SlotLockManager>,
        workflow: Arc<WorkflowStateMachine>,
        waitlist: Arc<WaitlistMatcher>,
        effects: SideEffects,
        settings: SchedulingSettings,
    ) -> Self {
        Self {
            store,
            conflicts,
            locks,
            workflow,
            waitlist,
            effects,
            settings,
        }
    }

    async fn lock(&self, keys: Vec<LockKey>) -> Result<HeldLocks, SchedulingError> {
        acquire_all(&self.locks, keys)
            .await
            .map_err(booking_lock_error)
    }

    // ==============================================================================
    // CREATE
    // ==============================================================================

    #[instrument(skip(self, request), fields(practitioner_id = ?request.appointment.practitioner_id))]
    pub async fn create_appointment(
        &self,
        company_id: Uuid,
        request: CreateAppointmentRequest,
        created_by: Uuid,
    ) -> Result<Appointment, SchedulingError> {
        let CreateAppointmentRequest {
            appointment: data,
            options,
        } = request;

        validate_interval(data.start_time, data.end_time)?;
        let actual = interval_minutes(data.start_time, data.end_time)?;
        let duration_minutes = match data.duration_minutes {
            Some(d) if d != actual => {
                return Err(SchedulingError::Validation(format!(
                    "duration_minutes ({}) does not match the interval ({} minutes)",
                    d, actual
                )));
            }
            _ => actual,
        };

        let buffer_minutes = options
            .buffer_minutes
            .unwrap_or(self.settings.default_buffer_minutes);
        let buffer = buffer_duration(buffer_minutes)?;

        let require_confirmation = options
            .require_confirmation
            .unwrap_or(self.settings.require_confirmation);
        let status = if require_confirmation {
            AppointmentStatus::Scheduled
        } else {
            AppointmentStatus::Confirmed
        };

        let now = Utc::now();
        let mut appointment = Appointment {
            id: Uuid::new_v4(),
            company_id,
            patient_id: data.patient_id,
            practitioner_id: data.practitioner_id,
            appointment_type: data.appointment_type,
            start_time: data.start_time,
            end_time: data.end_time,
            duration_minutes,
            status,
            location: data.location,
            is_virtual: data.is_virtual,
            allow_overlap: options.allow_overlapping,
            notes: Vec::new(),
            checked_in_at: None,
            created_by,
            updated_by: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        appointment.append_note(
            created_by,
            WorkflowEventKind::Created,
            data.notes
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| "Appointment booked".to_string()),
        );

        let created = match appointment.practitioner_id {
            Some(practitioner_id) if !options.allow_overlapping => {
                let held = self
                    .lock(LockKey::practitioner_days(
                        company_id,
                        practitioner_id,
                        &appointment.interval(),
                        buffer,
                    ))
                    .await?;

                let result = self
                    .insert_if_clear(appointment, practitioner_id, buffer_minutes)
                    .await;
                held.release().await;
                result?
            }
            _ => {
                debug!("Booking without conflict check (unassigned or overlap allowed)");
                self.store.create(appointment).await?
            }
        };

        info!(
            "Appointment {} booked for patient {} from {} to {}",
            created.id, created.patient_id, created.start_time, created.end_time
        );

        self.effects.broadcast(WorkflowEvent::new(
            &created,
            WorkflowEventKind::Created,
            json!({ "status": created.status, "created_by": created_by }),
        ));
        if options.send_reminders {
            self.effects.schedule_reminder(created.clone());
        }

        Ok(created)
    }

    async fn insert_if_clear(
        &self,
        appointment: Appointment,
        practitioner_id: Uuid,
        buffer_minutes: i64,
    ) -> Result<Appointment, SchedulingError> {
        let conflicts = self
            .conflicts
            .find_conflicts(&ConflictQuery {
                company_id: appointment.company_id,
                practitioner_id,
                start: appointment.start_time,
                end: appointment.end_time,
                buffer_minutes,
                allow_overlapping: false,
                exclude_appointment_id: None,
            })
            .await?;

        if let Some(first) = conflicts.first() {
            return Err(SchedulingError::SlotUnavailable(format!(
                "practitioner already booked from {} to {}",
                first.start_time, first.end_time
            )));
        }

        Ok(self.store.create(appointment).await?)
    }

    // ==============================================================================
    // RESCHEDULE
    // ==============================================================================

    #[instrument(skip(self, reason))]
    pub async fn reschedule_appointment(
        &self,
        company_id: Uuid,
        appointment_id: Uuid,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
        reason: Option<String>,
        updated_by: Uuid,
    ) -> Result<Appointment, SchedulingError> {
        validate_interval(new_start, new_end)?;
        let duration_minutes = interval_minutes(new_start, new_end)?;

        let buffer = buffer_duration(self.settings.default_buffer_minutes)?;
        let current = self.store.get_by_id(company_id, appointment_id).await?;

        let mut keys = vec![LockKey::appointment(company_id, appointment_id)];
        if let Some(practitioner_id) = current.practitioner_id {
            keys.extend(LockKey::practitioner_days(
                company_id,
                practitioner_id,
                &Interval::new(new_start, new_end),
                buffer,
            ));
        }

        let held = self.lock(keys).await?;
        let result = self
            .move_if_clear(
                company_id,
                appointment_id,
                new_start,
                new_end,
                duration_minutes,
                reason,
                updated_by,
            )
            .await;
        held.release().await;
        let (updated, vacated) = result?;

        info!(
            "Appointment {} rescheduled from {} to {}",
            updated.id, vacated.interval.start, updated.start_time
        );

        self.effects.broadcast(WorkflowEvent::new(
            &updated,
            WorkflowEventKind::Rescheduled,
            json!({
                "previous_start_time": vacated.interval.start,
                "previous_end_time": vacated.interval.end,
                "start_time": updated.start_time,
                "end_time": updated.end_time,
            }),
        ));
        if vacated.interval.start > Utc::now() {
            self.waitlist.offer_in_background(vacated);
        }

        Ok(updated)
    }

    #[allow(clippy::too_many_arguments)]
    async fn move_if_clear(
        &self,
        company_id: Uuid,
        appointment_id: Uuid,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
        duration_minutes: i64,
        reason: Option<String>,
        updated_by: Uuid,
    ) -> Result<(Appointment, FreedSlot), SchedulingError> {
        // Re-read under the lock; the copy used to pick the keys may be stale.
        let mut appointment = self.store.get_by_id(company_id, appointment_id).await?;

        if appointment.status.is_terminal() || appointment.status == AppointmentStatus::NoShow {
            return Err(SchedulingError::InvalidTransition {
                action: "reschedule",
                status: appointment.status,
            });
        }

        if let Some(practitioner_id) = appointment.practitioner_id {
            if !appointment.allow_overlap {
                let conflicts = self
                    .conflicts
                    .find_conflicts(&ConflictQuery {
                        company_id,
                        practitioner_id,
                        start: new_start,
                        end: new_end,
                        buffer_minutes: self.settings.default_buffer_minutes,
                        allow_overlapping: false,
                        exclude_appointment_id: Some(appointment_id),
                    })
                    .await?;

                if let Some(first) = conflicts.first() {
                    return Err(SchedulingError::SlotUnavailable(format!(
                        "practitioner already booked from {} to {}",
                        first.start_time, first.end_time
                    )));
                }
            }
        }

        let vacated = FreedSlot {
            company_id,
            practitioner_id: appointment.practitioner_id,
            appointment_type: appointment.appointment_type,
            interval: appointment.interval(),
        };

        let message = match reason.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
            Some(reason) => format!(
                "Rescheduled from {} to {}: {}",
                vacated.interval.start, new_start, reason
            ),
            None => format!("Rescheduled from {} to {}", vacated.interval.start, new_start),
        };

        appointment.start_time = new_start;
        appointment.end_time = new_end;
        appointment.duration_minutes = duration_minutes;
        appointment.append_note(updated_by, WorkflowEventKind::Rescheduled, message);
        appointment.touch(updated_by);

        let updated = self.store.update(appointment).await.map_err(|e| match e {
            StoreError::VersionConflict { .. } => SchedulingError::SlotUnavailable(
                "appointment changed while rescheduling, retry".to_string(),
            ),
            other => other.into(),
        })?;

        Ok((updated, vacated))
    }

    // ==============================================================================
    // CANCEL / READ / DETAILS
    // ==============================================================================

    pub async fn cancel_appointment(
        &self,
        company_id: Uuid,
        appointment_id: Uuid,
        reason: &str,
        cancelled_by: Uuid,
    ) -> Result<Appointment, SchedulingError> {
        self.workflow
            .cancel(company_id, appointment_id, reason, cancelled_by)
            .await
    }

    pub async fn get_appointment(
        &self,
        company_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<Appointment, SchedulingError> {
        Ok(self.store.get_by_id(company_id, appointment_id).await?)
    }

    pub async fn list_appointments(
        &self,
        filter: AppointmentFilter,
    ) -> Result<Page<Appointment>, SchedulingError> {
        Ok(self.store.list(filter).await?)
    }

    /// Changes descriptive fields only. Times move through reschedule and
    /// status through the workflow.
    pub async fn update_details(
        &self,
        company_id: Uuid,
        appointment_id: Uuid,
        changes: UpdateAppointmentDetails,
        updated_by: Uuid,
    ) -> Result<Appointment, SchedulingError> {
        let held = acquire_all(
            &self.locks,
            vec![LockKey::appointment(company_id, appointment_id)],
        )
        .await
        .map_err(|e| SchedulingError::Persistence(e.to_string()))?;

        let result = async {
            let mut appointment = self.store.get_by_id(company_id, appointment_id).await?;
            if appointment.status == AppointmentStatus::Cancelled {
                return Err(SchedulingError::InvalidTransition {
                    action: "update",
                    status: appointment.status,
                });
            }

            let mut changed = Vec::new();
            if let Some(kind) = changes.appointment_type {
                appointment.appointment_type = kind;
                changed.push("appointment_type");
            }
            if let Some(location) = changes.location {
                appointment.location = Some(location).filter(|l| !l.trim().is_empty());
                changed.push("location");
            }
            if let Some(is_virtual) = changes.is_virtual {
                appointment.is_virtual = is_virtual;
                changed.push("is_virtual");
            }

            let note = changes.note.filter(|n| !n.trim().is_empty());
            if changed.is_empty() && note.is_none() {
                return Err(SchedulingError::Validation(
                    "no changes supplied".to_string(),
                ));
            }

            let message = match note {
                Some(note) => note,
                None => format!("Updated {}", changed.join(", ")),
            };
            appointment.append_note(updated_by, WorkflowEventKind::Updated, message);
            appointment.touch(updated_by);

            Ok::<_, SchedulingError>(self.store.update(appointment).await?)
        }
        .await;
        held.release().await;
        let updated = result?;

        self.effects.broadcast(WorkflowEvent::new(
            &updated,
            WorkflowEventKind::Updated,
            json!({ "updated_by": updated_by }),
        ));
        Ok(updated)
    }
}
