use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, warn};

use crate::error::SchedulingError;
use crate::models::{Appointment, AppointmentFilter, ConflictQuery, Interval, MAX_BUFFER_MINUTES};
use crate::store::AppointmentStore;

/// Buffer-aware overlap test between an existing booking and a proposal:
/// `existing.start - buffer < proposed.end && existing.end + buffer > proposed.start`.
pub fn conflicts_with(existing: &Interval, proposed: &Interval, buffer: Duration) -> bool {
    existing.padded(buffer).overlaps(proposed)
}

/// `buffer_minutes` as a duration, rejected outside `0..=MAX_BUFFER_MINUTES`.
pub fn buffer_duration(buffer_minutes: i64) -> Result<Duration, SchedulingError> {
    if buffer_minutes < 0 {
        return Err(SchedulingError::Validation(
            "buffer_minutes cannot be negative".to_string(),
        ));
    }
    if buffer_minutes > MAX_BUFFER_MINUTES {
        return Err(SchedulingError::Validation(format!(
            "buffer_minutes cannot exceed {}",
            MAX_BUFFER_MINUTES
        )));
    }
    Ok(Duration::minutes(buffer_minutes))
}

pub struct ConflictDetectionService {
    store: Arc<dyn AppointmentStore>,
}

impl ConflictDetectionService {
    pub fn new(store: Arc<dyn AppointmentStore>) -> Self {
        Self { store }
    }

    /// Active bookings of the practitioner that block the proposed interval.
    /// With `allow_overlapping` the check is skipped and nothing blocks.
    pub async fn find_conflicts(&self, query: &ConflictQuery) -> Result<Vec<Appointment>, SchedulingError> {
        if query.allow_overlapping {
            debug!(
                "Overlap explicitly allowed for practitioner {}, skipping conflict check",
                query.practitioner_id
            );
            return Ok(Vec::new());
        }

        if query.end <= query.start {
            return Err(SchedulingError::Validation(
                "end_time must be after start_time".to_string(),
            ));
        }
        let buffer = buffer_duration(query.buffer_minutes)?;
        let proposed = Interval::new(query.start, query.end);

        debug!(
            "Checking conflicts for practitioner {} from {} to {}",
            query.practitioner_id, query.start, query.end
        );

        let filter = AppointmentFilter::for_company(query.company_id)
            .practitioner(query.practitioner_id)
            .active_only()
            .overlapping(proposed.padded(buffer))
            .unpaged();

        let candidates = self.store.list(filter).await?.items;

        let conflicting: Vec<Appointment> = candidates
            .into_iter()
            .filter(|a| Some(a.id) != query.exclude_appointment_id)
            .filter(|a| a.status.is_active())
            .filter(|a| conflicts_with(&a.interval(), &proposed, buffer))
            .collect();

        if !conflicting.is_empty() {
            warn!(
                "Conflict detected for practitioner {} - {} conflicting appointments",
                query.practitioner_id,
                conflicting.len()
            );
        }

        Ok(conflicting)
    }

    pub async fn has_conflict(&self, query: &ConflictQuery) -> Result<bool, SchedulingError> {
        Ok(!self.find_conflicts(query).await?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn test_buffer_blocks_adjacent_booking() {
        let existing = Interval::new(at(10, 0), at(10, 30));
        let buffer = Duration::minutes(15);

        assert!(conflicts_with(&existing, &Interval::new(at(10, 15), at(10, 45)), buffer));
        assert!(conflicts_with(&existing, &Interval::new(at(10, 30), at(11, 0)), buffer));
        assert!(conflicts_with(&existing, &Interval::new(at(9, 30), at(9, 50)), buffer));
    }

    #[test]
    fn test_clear_of_padded_window() {
        let existing = Interval::new(at(10, 0), at(10, 30));
        let buffer = Duration::minutes(15);

        assert!(!conflicts_with(&existing, &Interval::new(at(9, 0), at(9, 30)), buffer));
        assert!(!conflicts_with(&existing, &Interval::new(at(9, 15), at(9, 45)), buffer));
        assert!(!conflicts_with(&existing, &Interval::new(at(10, 45), at(11, 15)), buffer));
    }

    #[test]
    fn test_zero_buffer_is_plain_overlap() {
        let existing = Interval::new(at(10, 0), at(10, 30));
        let zero = Duration::zero();

        assert!(!conflicts_with(&existing, &Interval::new(at(10, 30), at(11, 0)), zero));
        assert!(conflicts_with(&existing, &Interval::new(at(10, 29), at(11, 0)), zero));
    }

    #[test]
    fn test_buffer_bounds() {
        assert_eq!(buffer_duration(0).unwrap(), Duration::zero());
        assert_eq!(
            buffer_duration(MAX_BUFFER_MINUTES).unwrap(),
            Duration::minutes(MAX_BUFFER_MINUTES)
        );
        assert!(matches!(buffer_duration(-1), Err(SchedulingError::Validation(_))));
        assert!(matches!(
            buffer_duration(i64::MAX / 1000),
            Err(SchedulingError::Validation(_))
        ));
    }
}
