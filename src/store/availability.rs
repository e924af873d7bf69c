use chrono::{Datelike, NaiveDate};

use crate::model::*;

// ── Window Resolution ────────────────────────────────────────────

/// The open window for one business on one date, or the reason it is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedWindow {
    Open(TimeSlot),
    Closed(String),
}

impl ResolvedWindow {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }
}

/// Resolve the open window for `date`: a date exception is authoritative and
/// overrides the weekly rule entirely; otherwise the weekly rule for the
/// calendar-correct weekday applies. Pure read, no side effects.
pub fn resolve_window(cal: &CalendarState, date: NaiveDate) -> ResolvedWindow {
    if let Some(exception) = cal.exceptions.get(&date) {
        if !exception.available {
            let reason = exception
                .reason
                .clone()
                .unwrap_or_else(|| "closed for the day".into());
            return ResolvedWindow::Closed(reason);
        }
        if let Some(window) = exception.window {
            return ResolvedWindow::Open(window);
        }
        // Open exception without times falls through to the weekly rule.
    }

    match cal.weekly[weekday_index(date)] {
        Some(rule) if rule.available => ResolvedWindow::Open(TimeSlot::new(rule.start, rule.end)),
        _ => ResolvedWindow::Closed(format!("closed on {}", date.weekday())),
    }
}
