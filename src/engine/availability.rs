use chrono::Datelike;
use ulid::Ulid;

use crate::error::EngineError;
use crate::limits::*;
use crate::model::*;

// ── Overlap predicate ─────────────────────────────────────────────

/// Reject ranges outside the supported calendar or longer than the limit.
pub fn validate_range(range: &DateRange) -> Result<(), EngineError> {
    if range.start >= range.end {
        return Err(EngineError::Validation(format!(
            "start date {} must be before end date {}",
            range.start, range.end
        )));
    }
    if range.start.year() < MIN_YEAR || range.end.year() > MAX_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    if range.nights() > MAX_RANGE_DAYS {
        return Err(EngineError::LimitExceeded("range too long"));
    }
    Ok(())
}

/// First active reservation or lock overlapping `range`. Reservations are
/// checked before locks. `exclude` skips the reservation being modified.
pub fn find_conflict(state: &EstateState, range: &DateRange, exclude: Option<Ulid>) -> Option<Occupant> {
    if let Some(r) = state
        .active_overlapping(range)
        .find(|r| Some(r.id) != exclude)
    {
        return Some(Occupant::Reservation(r.id));
    }
    state
        .locks_overlapping(range)
        .next()
        .map(|l| Occupant::Lock(l.id))
}

pub fn is_available(state: &EstateState, range: &DateRange, exclude: Option<Ulid>) -> bool {
    find_conflict(state, range, exclude).is_none()
}

/// [`is_available`] as a guard: a taken range is a `Conflict` naming the occupant.
pub fn check_available(
    state: &EstateState,
    range: &DateRange,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(state, range, exclude) {
        None => Ok(()),
        Some(Occupant::Reservation(id)) | Some(Occupant::Lock(id)) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict(id))
        }
    }
}

// ── Calendar views ────────────────────────────────────────────────

fn clamp(range: &DateRange, window: &DateRange) -> DateRange {
    DateRange::new(range.start.max(window.start), range.end.min(window.end))
}

/// Everything occupying `window`, clamped to it and sorted by start.
pub fn calendar(state: &EstateState, window: &DateRange) -> Vec<CalendarEntry> {
    let mut entries: Vec<CalendarEntry> = state
        .active_overlapping(window)
        .map(|r| CalendarEntry {
            range: clamp(&r.range, window),
            occupant: Occupant::Reservation(r.id),
        })
        .chain(state.locks_overlapping(window).map(|l| CalendarEntry {
            range: clamp(&l.range, window),
            occupant: Occupant::Lock(l.id),
        }))
        .collect();
    entries.sort_by_key(|e| e.range.start);
    entries
}

/// Busy days in `window` as disjoint ranges. Back-to-back stays merge.
pub fn occupied_ranges(state: &EstateState, window: &DateRange) -> Vec<DateRange> {
    let ranges: Vec<DateRange> = calendar(state, window).into_iter().map(|e| e.range).collect();
    merge_adjacent(&ranges)
}

/// Bookable stretches of `window`.
pub fn free_ranges(state: &EstateState, window: &DateRange) -> Vec<DateRange> {
    subtract_ranges(&[*window], &occupied_ranges(state, window))
}

/// Merge sorted overlapping/adjacent ranges into disjoint ranges.
pub fn merge_adjacent(sorted: &[DateRange]) -> Vec<DateRange> {
    let mut merged: Vec<DateRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start <= last.end
        {
            last.end = last.end.max(range.end);
            continue;
        }
        merged.push(range);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted and disjoint.
pub fn subtract_ranges(base: &[DateRange], to_remove: &[DateRange]) -> Vec<DateRange> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(DateRange::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(DateRange::new(current_start, b.end));
        }
    }

    result
}
