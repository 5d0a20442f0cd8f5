use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::debug;
use uuid::Uuid;

use shared_config::SchedulingSettings;

use crate::error::SchedulingError;
use crate::models::{
    AppointmentFilter, AvailabilityCheck, AvailableSlots, ConflictQuery, Interval, SlotQuery,
    WorkingHours,
};
use crate::services::conflict::{buffer_duration, ConflictDetectionService};
use crate::services::slots::generate_slots;
use crate::store::AppointmentStore;

/// Working hours minus buffer-padded busy intervals, as ordered disjoint
/// free intervals. Busy time is clipped to the working day, never extended
/// past it.
pub fn compute_free_intervals(working: Interval, busy: &[Interval], buffer: Duration) -> Vec<Interval> {
    if working.is_empty() {
        return Vec::new();
    }

    let mut blocked: Vec<Interval> = busy
        .iter()
        .filter_map(|b| b.padded(buffer).clip(&working))
        .collect();
    blocked.sort();

    let mut merged: Vec<Interval> = Vec::with_capacity(blocked.len());
    for interval in blocked {
        match merged.last_mut() {
            Some(last) if interval.start <= last.end => {
                last.end = last.end.max(interval.end);
            }
            _ => merged.push(interval),
        }
    }

    let mut free = Vec::new();
    let mut cursor = working.start;
    for interval in merged {
        if interval.start > cursor {
            free.push(Interval::new(cursor, interval.start));
        }
        cursor = cursor.max(interval.end);
    }
    if cursor < working.end {
        free.push(Interval::new(cursor, working.end));
    }

    free
}

/// Availability queries. Nothing is cached: every call reads the current
/// bookings.
pub struct AvailabilityService {
    store: Arc<dyn AppointmentStore>,
    conflicts: Arc<ConflictDetectionService>,
    settings: SchedulingSettings,
}

impl AvailabilityService {
    pub fn new(
        store: Arc<dyn AppointmentStore>,
        conflicts: Arc<ConflictDetectionService>,
        settings: SchedulingSettings,
    ) -> Self {
        Self {
            store,
            conflicts,
            settings,
        }
    }

    pub fn default_working_hours(&self) -> WorkingHours {
        WorkingHours::new(self.settings.day_start, self.settings.day_end)
    }

    pub async fn free_intervals(
        &self,
        company_id: Uuid,
        practitioner_id: Uuid,
        date: NaiveDate,
        working_hours: Option<WorkingHours>,
        buffer_minutes: i64,
    ) -> Result<Vec<Interval>, SchedulingError> {
        let buffer = buffer_duration(buffer_minutes)?;
        let hours = working_hours.unwrap_or_else(|| self.default_working_hours());
        if hours.end <= hours.start {
            return Err(SchedulingError::Validation(
                "working hours must end after they start".to_string(),
            ));
        }

        let working = hours.on(date);

        // Bookings just outside the day still reach into it through the buffer.
        let filter = AppointmentFilter::for_company(company_id)
            .practitioner(practitioner_id)
            .active_only()
            .overlapping(working.padded(buffer))
            .unpaged();
        let busy: Vec<Interval> = self
            .store
            .list(filter)
            .await?
            .items
            .iter()
            .filter(|a| a.status.is_active())
            .map(|a| a.interval())
            .collect();

        let free = compute_free_intervals(working, &busy, buffer);
        debug!(
            "Practitioner {} has {} free intervals on {} ({} busy)",
            practitioner_id,
            free.len(),
            date,
            busy.len()
        );

        Ok(free)
    }

    pub async fn available_slots(
        &self,
        company_id: Uuid,
        query: &SlotQuery,
    ) -> Result<AvailableSlots, SchedulingError> {
        if query.duration_minutes <= 0 {
            return Err(SchedulingError::Validation(
                "duration_minutes must be positive".to_string(),
            ));
        }
        let step = query.step_minutes.unwrap_or(self.settings.slot_step_minutes);
        if step <= 0 {
            return Err(SchedulingError::Validation(
                "step_minutes must be positive".to_string(),
            ));
        }

        let defaults = self.default_working_hours();
        let hours = WorkingHours::new(
            query.day_start.unwrap_or(defaults.start),
            query.day_end.unwrap_or(defaults.end),
        );
        let buffer = query
            .buffer_minutes
            .unwrap_or(self.settings.default_buffer_minutes);

        let free_intervals = self
            .free_intervals(company_id, query.practitioner_id, query.date, Some(hours), buffer)
            .await?;

        // Nothing longer than the working day fits; a longer step than the
        // day visits the same single start per interval.
        let day_minutes = (hours.end - hours.start).num_minutes();
        let slots = if query.duration_minutes > day_minutes {
            debug!(
                "{} minute slots cannot fit a {} minute working day",
                query.duration_minutes, day_minutes
            );
            Vec::new()
        } else {
            generate_slots(&free_intervals, query.duration_minutes, step.min(day_minutes))
        };

        Ok(AvailableSlots {
            practitioner_id: query.practitioner_id,
            date: query.date,
            duration_minutes: query.duration_minutes,
            free_intervals,
            slots,
        })
    }

    pub async fn check_availability(
        &self,
        company_id: Uuid,
        practitioner_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        buffer_minutes: Option<i64>,
        exclude_appointment_id: Option<Uuid>,
    ) -> Result<AvailabilityCheck, SchedulingError> {
        let query = ConflictQuery {
            company_id,
            practitioner_id,
            start,
            end,
            buffer_minutes: buffer_minutes.unwrap_or(self.settings.default_buffer_minutes),
            allow_overlapping: false,
            exclude_appointment_id,
        };
        let conflicts = self.conflicts.find_conflicts(&query).await?;

        Ok(AvailabilityCheck {
            available: conflicts.is_empty(),
            conflicts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn test_single_booking_splits_day() {
        let working = Interval::new(at(9, 0), at(12, 0));
        let busy = [Interval::new(at(10, 0), at(10, 30))];

        let free = compute_free_intervals(working, &busy, Duration::minutes(15));
        assert_eq!(
            free,
            vec![
                Interval::new(at(9, 0), at(9, 45)),
                Interval::new(at(10, 45), at(12, 0)),
            ]
        );
    }

    #[test]
    fn test_busy_clipped_at_day_boundary() {
        let working = Interval::new(at(9, 0), at(12, 0));
        let busy = [
            Interval::new(at(8, 30), at(9, 10)),
            Interval::new(at(11, 50), at(12, 30)),
        ];

        let free = compute_free_intervals(working, &busy, Duration::minutes(15));
        assert_eq!(free, vec![Interval::new(at(9, 25), at(11, 35))]);
    }

    #[test]
    fn test_overlapping_busy_intervals_merge() {
        let working = Interval::new(at(9, 0), at(12, 0));
        let busy = [
            Interval::new(at(10, 0), at(10, 30)),
            Interval::new(at(10, 40), at(11, 0)),
            Interval::new(at(10, 10), at(10, 20)),
        ];

        let free = compute_free_intervals(working, &busy, Duration::minutes(10));
        assert_eq!(
            free,
            vec![
                Interval::new(at(9, 0), at(9, 50)),
                Interval::new(at(11, 10), at(12, 0)),
            ]
        );
    }

    #[test]
    fn test_fully_booked_day_has_no_free_time() {
        let working = Interval::new(at(9, 0), at(10, 0));
        let busy = [Interval::new(at(9, 0), at(10, 0))];
        assert!(compute_free_intervals(working, &busy, Duration::zero()).is_empty());
    }

    #[test]
    fn test_busy_outside_day_ignored() {
        let working = Interval::new(at(9, 0), at(12, 0));
        let busy = [Interval::new(at(13, 0), at(14, 0))];

        let free = compute_free_intervals(working, &busy, Duration::minutes(15));
        assert_eq!(free, vec![working]);
    }
}
