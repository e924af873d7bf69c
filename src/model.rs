use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open slot `[start, end)` on a single calendar day, business-local clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeSlot {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeSlot start must be before end");
        Self { start, end }
    }

    pub fn duration_minutes(&self) -> i64 {
        minute_of_day(self.end) as i64 - minute_of_day(self.start) as i64
    }

    /// Half-open overlap: touching endpoints do not conflict.
    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_slot(&self, other: &TimeSlot) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Minutes since midnight. Interval arithmetic runs on these, never on
/// wrapping `NaiveTime` addition.
pub fn minute_of_day(t: NaiveTime) -> u32 {
    t.num_seconds_from_midnight() / 60
}

/// Index into the weekly schedule: Monday = 0 .. Sunday = 6.
pub fn weekday_index(date: NaiveDate) -> usize {
    chrono::Datelike::weekday(&date).num_days_from_monday() as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    /// Only pending and confirmed appointments occupy their slot.
    pub fn blocks_slot(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }

    /// Pending → Confirmed → Completed; Cancelled from Pending or Confirmed.
    pub fn can_transition_to(&self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Confirmed, Completed)
                | (Pending, Cancelled)
                | (Confirmed, Cancelled)
        )
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerContact {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub service_id: Ulid,
    pub customer: CustomerContact,
    pub date: NaiveDate,
    pub slot: TimeSlot,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
    pub confirmation_code: String,
    /// Optimistic concurrency counter, starts at 1, +1 per successful update.
    pub version: u32,
}

/// A bookable service offered by a business. Duration and buffer are immutable
/// inputs to end-time and conflict computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDef {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    /// Extends the occupied interval past `end` for conflict purposes only
    /// (e.g. cleanup time between customers).
    pub buffer_minutes: u32,
    pub price_cents: u64,
    pub active: bool,
}

/// Recurring open hours for one weekday. `available = false` means closed
/// that weekday even if a row exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyRule {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub available: bool,
}

/// Date-specific override of the weekly schedule: a closure, or an ad-hoc
/// window replacing the weekly one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRule {
    pub window: Option<TimeSlot>,
    pub available: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessProfile {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    /// Send the business an immediate notice when a booking lands.
    pub notify_on_booking: bool,
    /// Send the business a day-before reminder entry.
    pub notify_reminders: bool,
}

/// In-memory materialized calendar for one business. One of these sits behind
/// an `Arc<RwLock<..>>` per business; the write lock is the isolation boundary
/// for the booking transaction.
#[derive(Debug, Clone)]
pub struct CalendarState {
    pub profile: BusinessProfile,
    pub services: std::collections::HashMap<Ulid, ServiceDef>,
    /// Indexed by `weekday_index` (Monday = 0).
    pub weekly: [Option<WeeklyRule>; 7],
    pub exceptions: std::collections::HashMap<NaiveDate, ExceptionRule>,
    /// Sorted by `(date, slot.start)`.
    pub appointments: Vec<Appointment>,
}

impl CalendarState {
    pub fn new(profile: BusinessProfile) -> Self {
        Self {
            profile,
            services: std::collections::HashMap::new(),
            weekly: [None; 7],
            exceptions: std::collections::HashMap::new(),
            appointments: Vec::new(),
        }
    }

    /// Insert keeping `(date, start)` sort order.
    pub fn insert_appointment(&mut self, appt: Appointment) {
        let key = (appt.date, appt.slot.start);
        let pos = self
            .appointments
            .partition_point(|a| (a.date, a.slot.start) < key);
        self.appointments.insert(pos, appt);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        self.appointments
            .iter()
            .position(|a| a.id == id)
            .map(|pos| self.appointments.remove(pos))
    }

    pub fn find_appointment(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    /// Appointments on one date, using the sort order to skip other days.
    pub fn appointments_on(&self, date: NaiveDate) -> &[Appointment] {
        let lo = self.appointments.partition_point(|a| a.date < date);
        let hi = self.appointments.partition_point(|a| a.date <= date);
        &self.appointments[lo..hi]
    }
}

// ── Notification queue ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    BookingConfirmation,
    Reminder,
    Cancellation,
    Reschedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipient {
    Customer,
    Business,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    Pending,
    Processed,
    Failed,
}

/// Everything a channel adapter needs to render the message, snapshotted at
/// planning time so delivery never has to read the calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub appointment_id: Ulid,
    pub confirmation_code: String,
    pub business: String,
    pub service: String,
    pub customer_name: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub status: AppointmentStatus,
}

/// A durable, independently retriable unit of outbound communication.
/// Created by the scheduler, resolved by the queue processor, retained after
/// terminal states as an audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Ulid,
    pub kind: NotificationKind,
    pub appointment_id: Ulid,
    pub business_id: Ulid,
    pub recipient: Recipient,
    pub email: String,
    pub phone: Option<String>,
    pub payload: NotificationPayload,
    pub scheduled_for: NaiveDateTime,
    pub status: EntryStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<NaiveDateTime>,
    pub error: Option<String>,
}

// ── WAL record format ────────────────────────────────────────────

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BusinessRegistered {
        id: Ulid,
        name: String,
        email: String,
        phone: Option<String>,
        notify_on_booking: bool,
        notify_reminders: bool,
    },
    ServiceRegistered {
        business_id: Ulid,
        service: ServiceDef,
    },
    WeeklyHoursSet {
        business_id: Ulid,
        /// Monday = 0 .. Sunday = 6.
        weekday: u8,
        start: NaiveTime,
        end: NaiveTime,
        available: bool,
    },
    ExceptionSet {
        business_id: Ulid,
        date: NaiveDate,
        start: Option<NaiveTime>,
        end: Option<NaiveTime>,
        available: bool,
        reason: Option<String>,
    },
    AppointmentBooked {
        business_id: Ulid,
        appointment: Appointment,
    },
    AppointmentUpdated {
        business_id: Ulid,
        id: Ulid,
        date: NaiveDate,
        slot: TimeSlot,
        status: AppointmentStatus,
        notes: Option<String>,
        version: u32,
    },
    NotificationEnqueued {
        entry: QueueEntry,
    },
    NotificationResolved {
        id: Ulid,
        status: EntryStatus,
        attempts: u32,
        last_attempt_at: Option<NaiveDateTime>,
        error: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn appt(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Appointment {
        Appointment {
            id: Ulid::new(),
            service_id: Ulid::new(),
            customer: CustomerContact {
                name: "Ada".into(),
                email: "ada@example.com".into(),
                phone: None,
            },
            date,
            slot: TimeSlot::new(start, end),
            status: AppointmentStatus::Pending,
            notes: None,
            confirmation_code: "BK-TEST0001".into(),
            version: 1,
        }
    }

    fn profile() -> BusinessProfile {
        BusinessProfile {
            id: Ulid::new(),
            name: "Shop".into(),
            email: "shop@example.com".into(),
            phone: None,
            notify_on_booking: false,
            notify_reminders: false,
        }
    }

    #[test]
    fn slot_basics() {
        let s = TimeSlot::new(t(9, 0), t(10, 0));
        assert_eq!(s.duration_minutes(), 60);
        assert!(s.contains_slot(&TimeSlot::new(t(9, 15), t(9, 45))));
        assert!(s.contains_slot(&s)); // self-containment
        assert!(!s.contains_slot(&TimeSlot::new(t(8, 30), t(9, 30))));
    }

    #[test]
    fn slot_overlap_half_open() {
        let a = TimeSlot::new(t(9, 0), t(10, 0));
        let b = TimeSlot::new(t(9, 30), t(10, 30));
        let c = TimeSlot::new(t(10, 0), t(11, 0));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // touching, not overlapping
    }

    #[test]
    fn weekday_index_is_calendar_correct() {
        // 2026-08-31 is a Monday.
        assert_eq!(weekday_index(d(2026, 8, 31)), 0);
        assert_eq!(weekday_index(d(2026, 9, 6)), 6); // Sunday
    }

    #[test]
    fn status_transitions() {
        use AppointmentStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(!Completed.can_transition_to(Cancelled));
    }

    #[test]
    fn blocking_statuses() {
        use AppointmentStatus::*;
        assert!(Pending.blocks_slot());
        assert!(Confirmed.blocks_slot());
        assert!(!Cancelled.blocks_slot());
        assert!(!Completed.blocks_slot());
    }

    #[test]
    fn appointments_kept_sorted() {
        let mut cal = CalendarState::new(profile());
        let day = d(2026, 9, 1);
        cal.insert_appointment(appt(day, t(14, 0), t(15, 0)));
        cal.insert_appointment(appt(day, t(9, 0), t(10, 0)));
        cal.insert_appointment(appt(d(2026, 8, 31), t(16, 0), t(17, 0)));
        let starts: Vec<_> = cal
            .appointments
            .iter()
            .map(|a| (a.date, a.slot.start))
            .collect();
        let mut sorted = starts.clone();
        sorted.sort();
        assert_eq!(starts, sorted);
    }

    #[test]
    fn appointments_on_filters_by_date() {
        let mut cal = CalendarState::new(profile());
        let mon = d(2026, 8, 31);
        let tue = d(2026, 9, 1);
        cal.insert_appointment(appt(mon, t(9, 0), t(10, 0)));
        cal.insert_appointment(appt(tue, t(9, 0), t(10, 0)));
        cal.insert_appointment(appt(tue, t(11, 0), t(12, 0)));
        assert_eq!(cal.appointments_on(mon).len(), 1);
        assert_eq!(cal.appointments_on(tue).len(), 2);
        assert!(cal.appointments_on(d(2026, 9, 2)).is_empty());
    }

    #[test]
    fn remove_appointment_by_id() {
        let mut cal = CalendarState::new(profile());
        let a = appt(d(2026, 9, 1), t(9, 0), t(10, 0));
        let id = a.id;
        cal.insert_appointment(a);
        assert!(cal.remove_appointment(id).is_some());
        assert!(cal.remove_appointment(id).is_none());
        assert!(cal.appointments.is_empty());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AppointmentBooked {
            business_id: Ulid::new(),
            appointment: appt(d(2026, 9, 1), t(9, 0), t(10, 0)),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn queue_entry_roundtrip() {
        let entry = QueueEntry {
            id: Ulid::new(),
            kind: NotificationKind::Reminder,
            appointment_id: Ulid::new(),
            business_id: Ulid::new(),
            recipient: Recipient::Customer,
            email: "ada@example.com".into(),
            phone: Some("+15550100".into()),
            payload: NotificationPayload {
                appointment_id: Ulid::new(),
                confirmation_code: "BK-TEST0001".into(),
                business: "Shop".into(),
                service: "Cut".into(),
                customer_name: "Ada".into(),
                date: d(2026, 9, 1),
                start_time: t(9, 0),
                end_time: t(10, 0),
                status: AppointmentStatus::Pending,
            },
            scheduled_for: d(2026, 9, 1).and_time(t(8, 0)),
            status: EntryStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            error: None,
        };
        let event = Event::NotificationEnqueued { entry };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
