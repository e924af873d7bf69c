use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

/// Find every pending/confirmed appointment on `date` whose occupied interval
/// overlaps the candidate slot. Half-open semantics: touching endpoints are
/// compatible. Service buffer minutes extend the occupied interval past its
/// end on both sides of the comparison. `exclude` lets a reschedule skip the
/// appointment's own row.
///
/// Returns the conflicting appointment ids; non-empty is a hard failure for
/// every caller, never a warning.
pub fn find_conflicts(
    cal: &CalendarState,
    date: NaiveDate,
    slot: &TimeSlot,
    buffer_minutes: u32,
    exclude: Option<Ulid>,
) -> Vec<Ulid> {
    let candidate_start = minute_of_day(slot.start) as i64;
    let candidate_end = minute_of_day(slot.end) as i64 + buffer_minutes as i64;

    let mut conflicts = Vec::new();
    for appt in cal.appointments_on(date) {
        if !appt.status.blocks_slot() {
            continue;
        }
        if exclude == Some(appt.id) {
            continue;
        }
        // Each stored appointment occupies its slot plus its own service buffer.
        let existing_buffer = cal
            .services
            .get(&appt.service_id)
            .map_or(0, |s| s.buffer_minutes) as i64;
        let existing_start = minute_of_day(appt.slot.start) as i64;
        let existing_end = minute_of_day(appt.slot.end) as i64 + existing_buffer;

        if candidate_start < existing_end && existing_start < candidate_end {
            conflicts.push(appt.id);
        }
    }
    conflicts
}
