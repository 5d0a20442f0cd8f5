use chrono::Duration;

use crate::models::{Interval, Slot};

/// Longest duration or step, in minutes, worth slicing with. No free
/// interval comes near it.
const MAX_SLICE_MINUTES: i64 = 366 * 24 * 60;

/// Slices free intervals into slots of exactly `duration_minutes`, stepping
/// the start by `step_minutes`. Only slots that fit entirely inside their
/// source interval are emitted; a non-positive duration or step yields none,
/// and so does a duration longer than any interval.
pub fn generate_slots(free_intervals: &[Interval], duration_minutes: i64, step_minutes: i64) -> Vec<Slot> {
    if duration_minutes <= 0 || step_minutes <= 0 || duration_minutes > MAX_SLICE_MINUTES {
        return Vec::new();
    }

    let duration = Duration::minutes(duration_minutes);
    let step = Duration::minutes(step_minutes.min(MAX_SLICE_MINUTES));
    let mut slots = Vec::new();

    for interval in free_intervals {
        let mut start = interval.start;
        while let Some(end) = start.checked_add_signed(duration) {
            if end > interval.end {
                break;
            }
            slots.push(Slot { start, end });
            match start.checked_add_signed(step) {
                Some(next) => start = next,
                None => break,
            }
        }
    }

    slots
}
