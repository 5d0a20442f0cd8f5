// libs/scheduling-cell/src/services/workflow.rs
//
// Drives an appointment through reception -> practitioner -> dispenser.
// Each action runs under the appointment's lock, persists first and only
// then hands events to the side channels.
//

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{LockError, SchedulingError};
use crate::models::{
    Appointment, AppointmentFilter, AppointmentStatus, Examination, ExamCompleteOutcome,
    ExamStartOutcome, FreedSlot, Interval, Notification, PrescriptionStatus, Stage,
    StageQueueEntry, WorkflowEvent, WorkflowEventKind,
};
use crate::services::dispatch::SideEffects;
use crate::services::locking::{acquire_all, HeldLocks, LockKey, SlotLockManager};
use crate::services::waitlist::WaitlistMatcher;
use crate::store::{AppointmentStore, ClinicalRecordStore, StaffDirectory};

/// Stage of an appointment derived from its status and the downstream
/// records, never stored.
pub fn derive_stage(
    appointment: &Appointment,
    has_examination: bool,
    prescription: Option<PrescriptionStatus>,
    has_order: bool,
) -> Option<Stage> {
    match appointment.status {
        AppointmentStatus::InProgress => Some(Stage::InExam),
        AppointmentStatus::Confirmed
            if appointment.checked_in_at.is_some() && !has_examination =>
        {
            Some(Stage::CheckedIn)
        }
        AppointmentStatus::Completed
            if prescription.is_some_and(|p| p.is_released()) && !has_order =>
        {
            Some(Stage::ReadyForDispense)
        }
        _ => None,
    }
}

fn invalid(action: &'static str, status: AppointmentStatus) -> SchedulingError {
    warn!("Invalid workflow action attempted: {} from {}", action, status);
    SchedulingError::InvalidTransition { action, status }
}

pub struct WorkflowStateMachine {
    appointments: Arc<dyn AppointmentStore>,
    records: Arc<dyn ClinicalRecordStore>,
    staff: Arc<dyn StaffDirectory>,
    locks: Arc<dyn SlotLockManager>,
    effects: SideEffects,
    waitlist: Arc<WaitlistMatcher>,
}

impl WorkflowStateMachine {
    pub fn new(
        appointments: Arc<dyn AppointmentStore>,
        records: Arc<dyn ClinicalRecordStore>,
        staff: Arc<dyn StaffDirectory>,
        locks: Arc<dyn SlotLockManager>,
        effects: SideEffects,
        waitlist: Arc<WaitlistMatcher>,
    ) -> Self {
        Self {
            appointments,
            records,
            staff,
            locks,
            effects,
            waitlist,
        }
    }

    async fn lock_appointment(
        &self,
        company_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<HeldLocks, SchedulingError> {
        acquire_all(
            &self.locks,
            vec![LockKey::appointment(company_id, appointment_id)],
        )
        .await
        .map_err(|e| match e {
            LockError::Timeout { .. } => SchedulingError::Persistence(format!(
                "appointment {} is busy, retry the action",
                appointment_id
            )),
            LockError::Backend(msg) => SchedulingError::Persistence(msg),
        })
    }

    /// Acquires the appointment lock, runs `action`, releases the lock.
    async fn locked<T, F, Fut>(
        &self,
        company_id: Uuid,
        appointment_id: Uuid,
        action: F,
    ) -> Result<T, SchedulingError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, SchedulingError>>,
    {
        let held = self.lock_appointment(company_id, appointment_id).await?;
        let result = action().await;
        held.release().await;
        result
    }

    async fn persist(&self, appointment: Appointment) -> Result<Appointment, SchedulingError> {
        Ok(self.appointments.update(appointment).await?)
    }

    fn emit(&self, appointment: &Appointment, kind: WorkflowEventKind, payload: serde_json::Value) {
        self.effects
            .broadcast(WorkflowEvent::new(appointment, kind, payload));
    }

    // ==============================================================================
    // RECEPTION
    // ==============================================================================

    #[instrument(skip(self))]
    pub async fn check_in(
        &self,
        company_id: Uuid,
        appointment_id: Uuid,
        by: Uuid,
    ) -> Result<Appointment, SchedulingError> {
        let updated = self
            .locked(company_id, appointment_id, move || async move {
                let mut appointment = self.appointments.get_by_id(company_id, appointment_id).await?;

                if !matches!(
                    appointment.status,
                    AppointmentStatus::Scheduled | AppointmentStatus::Confirmed
                ) {
                    return Err(invalid("check in", appointment.status));
                }

                appointment.status = AppointmentStatus::Confirmed;
                let arrived_at = *appointment.checked_in_at.get_or_insert_with(Utc::now);
                appointment.append_note(
                    by,
                    WorkflowEventKind::CheckedIn,
                    format!("Patient checked in at {}", arrived_at.format("%H:%M")),
                );
                appointment.touch(by);

                self.persist(appointment).await
            })
            .await?;

        info!("Appointment {} checked in", updated.id);
        self.emit(
            &updated,
            WorkflowEventKind::CheckedIn,
            json!({ "patient_id": updated.patient_id, "checked_in_at": updated.checked_in_at }),
        );
        Ok(updated)
    }

    #[instrument(skip(self, reason))]
    pub async fn cancel(
        &self,
        company_id: Uuid,
        appointment_id: Uuid,
        reason: &str,
        by: Uuid,
    ) -> Result<Appointment, SchedulingError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(SchedulingError::Validation(
                "a cancellation reason is required".to_string(),
            ));
        }

        let (updated, was_active) = self
            .locked(company_id, appointment_id, move || async move {
                let mut appointment = self.appointments.get_by_id(company_id, appointment_id).await?;

                if !appointment.status.can_transition_to(AppointmentStatus::Cancelled) {
                    return Err(invalid("cancel", appointment.status));
                }

                let was_active = appointment.status.is_active();
                appointment.status = AppointmentStatus::Cancelled;
                appointment.append_note(
                    by,
                    WorkflowEventKind::Cancelled,
                    format!("Cancelled: {}", reason),
                );
                appointment.touch(by);

                Ok((self.persist(appointment).await?, was_active))
            })
            .await?;

        info!("Appointment {} cancelled", updated.id);
        self.emit(
            &updated,
            WorkflowEventKind::Cancelled,
            json!({ "reason": reason, "cancelled_by": by }),
        );

        // Only future capacity is worth offering.
        if was_active && updated.start_time > Utc::now() {
            self.waitlist.offer_in_background(FreedSlot {
                company_id: updated.company_id,
                practitioner_id: updated.practitioner_id,
                appointment_type: updated.appointment_type,
                interval: updated.interval(),
            });
        }

        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn mark_no_show(
        &self,
        company_id: Uuid,
        appointment_id: Uuid,
        by: Uuid,
    ) -> Result<Appointment, SchedulingError> {
        let updated = self
            .locked(company_id, appointment_id, move || async move {
                let mut appointment = self.appointments.get_by_id(company_id, appointment_id).await?;

                // An examined patient attended, whatever the record says.
                let examined = self
                    .records
                    .find_examination_for_appointment(company_id, appointment_id)
                    .await?
                    .is_some();
                if !appointment.status.can_transition_to(AppointmentStatus::NoShow) || examined {
                    return Err(invalid("mark as no-show", appointment.status));
                }

                appointment.status = AppointmentStatus::NoShow;
                appointment.append_note(by, WorkflowEventKind::NoShow, "Patient did not attend");
                appointment.touch(by);

                self.persist(appointment).await
            })
            .await?;

        info!("Appointment {} marked as no-show", updated.id);
        self.emit(&updated, WorkflowEventKind::NoShow, json!({ "marked_by": by }));
        Ok(updated)
    }

    // ==============================================================================
    // PRACTITIONER
    // ==============================================================================

    /// Idempotent: repeated calls return the same examination.
    #[instrument(skip(self))]
    pub async fn start_exam(
        &self,
        company_id: Uuid,
        appointment_id: Uuid,
        by: Uuid,
    ) -> Result<ExamStartOutcome, SchedulingError> {
        let outcome = self
            .locked(company_id, appointment_id, move || async move {
                let mut appointment = self.appointments.get_by_id(company_id, appointment_id).await?;
                let existing = self
                    .records
                    .find_examination_for_appointment(company_id, appointment_id)
                    .await?;

                if appointment.status == AppointmentStatus::InProgress {
                    if let Some(examination) = existing {
                        debug!("Exam already started for appointment {}", appointment_id);
                        return Ok(ExamStartOutcome {
                            appointment,
                            examination,
                            already_started: true,
                        });
                    }
                }

                if appointment.status != AppointmentStatus::Confirmed {
                    return Err(invalid("start an exam for", appointment.status));
                }

                let examination = match existing {
                    Some(examination) => examination,
                    None => {
                        self.records
                            .create_examination(Examination {
                                id: Uuid::new_v4(),
                                company_id,
                                appointment_id,
                                patient_id: appointment.patient_id,
                                practitioner_id: appointment.practitioner_id,
                                created_by: by,
                                created_at: Utc::now(),
                            })
                            .await?
                    }
                };

                appointment.status = AppointmentStatus::InProgress;
                appointment.append_note(
                    by,
                    WorkflowEventKind::ExamStarted,
                    format!("Examination {} started", examination.id),
                );
                appointment.touch(by);

                Ok(ExamStartOutcome {
                    appointment: self.persist(appointment).await?,
                    examination,
                    already_started: false,
                })
            })
            .await?;

        if !outcome.already_started {
            info!(
                "Exam {} started for appointment {}",
                outcome.examination.id, outcome.appointment.id
            );
            self.emit(
                &outcome.appointment,
                WorkflowEventKind::ExamStarted,
                json!({ "examination_id": outcome.examination.id }),
            );
        }

        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub async fn complete_exam(
        &self,
        company_id: Uuid,
        appointment_id: Uuid,
        examination_id: Uuid,
        by: Uuid,
    ) -> Result<ExamCompleteOutcome, SchedulingError> {
        let updated = self
            .locked(company_id, appointment_id, move || async move {
                let mut appointment = self.appointments.get_by_id(company_id, appointment_id).await?;

                if appointment.status != AppointmentStatus::InProgress {
                    return Err(invalid("complete an exam for", appointment.status));
                }

                let examination = self.records.get_examination(company_id, examination_id).await?;
                if examination.appointment_id != appointment_id {
                    return Err(SchedulingError::Validation(format!(
                        "examination {} does not belong to appointment {}",
                        examination_id, appointment_id
                    )));
                }

                appointment.status = AppointmentStatus::Completed;
                appointment.append_note(
                    by,
                    WorkflowEventKind::ExamCompleted,
                    format!("Examination {} completed", examination_id),
                );
                appointment.touch(by);

                self.persist(appointment).await
            })
            .await?;

        // The transition is committed; a failed lookup only downgrades the event.
        let prescription = match self
            .records
            .find_prescription_for_examination(company_id, examination_id)
            .await
        {
            Ok(prescription) => prescription,
            Err(e) => {
                warn!(
                    "Could not read prescription for examination {}: {}",
                    examination_id, e
                );
                None
            }
        };
        let ready_for_dispense = prescription.as_ref().is_some_and(|p| p.status.is_released());

        if ready_for_dispense {
            info!("Appointment {} ready for dispense", updated.id);
            self.emit(
                &updated,
                WorkflowEventKind::ReadyForDispense,
                json!({
                    "examination_id": examination_id,
                    "prescription_id": prescription.as_ref().map(|p| p.id),
                }),
            );
            self.notify_dispensers(&updated, examination_id);
        } else {
            info!("Exam completed for appointment {}", updated.id);
            self.emit(
                &updated,
                WorkflowEventKind::ExamCompleted,
                json!({ "examination_id": examination_id }),
            );
        }

        Ok(ExamCompleteOutcome {
            appointment: updated,
            ready_for_dispense,
        })
    }

    fn notify_dispensers(&self, appointment: &Appointment, examination_id: Uuid) {
        let staff = Arc::clone(&self.staff);
        let effects = self.effects.clone();
        let notification = Notification {
            company_id: appointment.company_id,
            appointment_id: appointment.id,
            title: "Ready for dispense".to_string(),
            message: format!(
                "Prescription released for appointment at {}",
                appointment.start_time.format("%H:%M")
            ),
            data: json!({
                "patient_id": appointment.patient_id,
                "examination_id": examination_id,
            }),
        };

        tokio::spawn(async move {
            match staff.active_dispensers(notification.company_id).await {
                Ok(dispensers) => effects.notify(dispensers, notification),
                Err(e) => warn!(
                    "Could not load dispensers for appointment {}: {}",
                    notification.appointment_id, e
                ),
            }
        });
    }

    // ==============================================================================
    // DISPENSER
    // ==============================================================================

    #[instrument(skip(self))]
    pub async fn record_order(
        &self,
        company_id: Uuid,
        appointment_id: Uuid,
        order_id: Uuid,
        by: Uuid,
    ) -> Result<Appointment, SchedulingError> {
        let updated = self
            .locked(company_id, appointment_id, move || async move {
                let mut appointment = self.appointments.get_by_id(company_id, appointment_id).await?;

                if appointment.status != AppointmentStatus::Completed {
                    return Err(invalid("record an order for", appointment.status));
                }

                appointment.append_note(
                    by,
                    WorkflowEventKind::OrderCreated,
                    format!("Order {} created", order_id),
                );
                appointment.touch(by);

                self.persist(appointment).await
            })
            .await?;

        info!("Order {} recorded for appointment {}", order_id, updated.id);
        self.emit(
            &updated,
            WorkflowEventKind::OrderCreated,
            json!({ "order_id": order_id }),
        );
        Ok(updated)
    }

    // ==============================================================================
    // QUEUE VIEW
    // ==============================================================================

    pub async fn stage_of(&self, appointment: &Appointment) -> Result<Option<Stage>, SchedulingError> {
        let company_id = appointment.company_id;
        let examination = self
            .records
            .find_examination_for_appointment(company_id, appointment.id)
            .await?;

        let prescription = match &examination {
            Some(exam) if appointment.status == AppointmentStatus::Completed => self
                .records
                .find_prescription_for_examination(company_id, exam.id)
                .await?
                .map(|p| p.status),
            _ => None,
        };

        let has_order = if prescription.is_some_and(|p| p.is_released()) {
            self.records
                .has_order_for_appointment(company_id, appointment.id)
                .await?
        } else {
            false
        };

        Ok(derive_stage(
            appointment,
            examination.is_some(),
            prescription,
            has_order,
        ))
    }

    /// The day's appointments that are in a stage, ordered by start time.
    pub async fn stage_queue(
        &self,
        company_id: Uuid,
        date: NaiveDate,
        stage: Option<Stage>,
    ) -> Result<Vec<StageQueueEntry>, SchedulingError> {
        let day_start = date.and_hms_opt(0, 0, 0).map(|d| d.and_utc());
        let day_end = day_start.and_then(|start| start.checked_add_signed(Duration::days(1)));
        let (Some(day_start), Some(day_end)) = (day_start, day_end) else {
            return Err(SchedulingError::Validation(format!("invalid date {}", date)));
        };
        let day = Interval::new(day_start, day_end);

        let mut filter = AppointmentFilter::for_company(company_id)
            .overlapping(day)
            .unpaged();
        filter.statuses = vec![
            AppointmentStatus::Confirmed,
            AppointmentStatus::InProgress,
            AppointmentStatus::Completed,
        ];

        let mut appointments = self.appointments.list(filter).await?.items;
        appointments.sort_by_key(|a| a.start_time);

        let mut queue = Vec::new();
        for appointment in appointments {
            if let Some(current) = self.stage_of(&appointment).await? {
                if stage.map_or(true, |wanted| wanted == current) {
                    queue.push(StageQueueEntry {
                        appointment,
                        stage: current,
                    });
                }
            }
        }

        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AppointmentType;
    use chrono::TimeZone;

    fn appointment(status: AppointmentStatus) -> Appointment {
        let start = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();
        Appointment {
            id: Uuid::new_v4(),
            company_id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            practitioner_id: Some(Uuid::new_v4()),
            appointment_type: AppointmentType::Examination,
            start_time: start,
            end_time: start + Duration::minutes(30),
            duration_minutes: 30,
            status,
            location: None,
            is_virtual: false,
            allow_overlap: false,
            notes: vec![],
            checked_in_at: None,
            created_by: Uuid::new_v4(),
            updated_by: None,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_in_progress_is_in_exam() {
        let appt = appointment(AppointmentStatus::InProgress);
        assert_eq!(derive_stage(&appt, true, None, false), Some(Stage::InExam));
    }

    #[test]
    fn test_checked_in_requires_arrival_and_no_exam() {
        let mut appt = appointment(AppointmentStatus::Confirmed);
        assert_eq!(derive_stage(&appt, false, None, false), None);

        appt.checked_in_at = Some(Utc::now());
        assert_eq!(derive_stage(&appt, false, None, false), Some(Stage::CheckedIn));
        assert_eq!(derive_stage(&appt, true, None, false), None);
    }

    #[test]
    fn test_ready_for_dispense_until_order_exists() {
        let appt = appointment(AppointmentStatus::Completed);

        assert_eq!(
            derive_stage(&appt, true, Some(PrescriptionStatus::Signed), false),
            Some(Stage::ReadyForDispense)
        );
        assert_eq!(
            derive_stage(&appt, true, Some(PrescriptionStatus::Verified), false),
            Some(Stage::ReadyForDispense)
        );
        assert_eq!(
            derive_stage(&appt, true, Some(PrescriptionStatus::Draft), false),
            None
        );
        assert_eq!(
            derive_stage(&appt, true, Some(PrescriptionStatus::Signed), true),
            None
        );
    }

    #[test]
    fn test_scheduled_has_no_stage() {
        let appt = appointment(AppointmentStatus::Scheduled);
        assert_eq!(derive_stage(&appt, false, None, false), None);
    }
}
