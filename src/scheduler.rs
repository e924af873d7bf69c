//! Translates appointment lifecycle events into queue entries with computed
//! delivery times. Pure planning — no I/O, no clock reads; callers supply
//! `now` and persist the returned entries.

use chrono::{Duration, NaiveDateTime};
use ulid::Ulid;

use crate::model::*;

/// Customer reminder lead times, longest first.
fn reminder_offsets() -> [Duration; 3] {
    [
        Duration::hours(24),
        Duration::hours(2),
        Duration::minutes(30),
    ]
}

/// Business-side reminder lead time.
fn business_reminder_offset() -> Duration {
    Duration::hours(24)
}

/// Planning failed on datetime arithmetic. The caller must enqueue nothing
/// for this appointment and log the error — a partial reminder set is worse
/// than none.
#[derive(Debug)]
pub struct PlanError(pub &'static str);

impl std::fmt::Display for PlanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification planning failed: {}", self.0)
    }
}

impl std::error::Error for PlanError {}

fn payload(
    profile: &BusinessProfile,
    appt: &Appointment,
    service_name: &str,
) -> NotificationPayload {
    NotificationPayload {
        appointment_id: appt.id,
        confirmation_code: appt.confirmation_code.clone(),
        business: profile.name.clone(),
        service: service_name.to_string(),
        customer_name: appt.customer.name.clone(),
        date: appt.date,
        start_time: appt.slot.start,
        end_time: appt.slot.end,
        status: appt.status,
    }
}

fn entry(
    kind: NotificationKind,
    recipient: Recipient,
    profile: &BusinessProfile,
    appt: &Appointment,
    service_name: &str,
    scheduled_for: NaiveDateTime,
) -> QueueEntry {
    let (email, phone) = match recipient {
        Recipient::Customer => (appt.customer.email.clone(), appt.customer.phone.clone()),
        Recipient::Business => (profile.email.clone(), profile.phone.clone()),
    };
    QueueEntry {
        id: Ulid::new(),
        kind,
        appointment_id: appt.id,
        business_id: profile.id,
        recipient,
        email,
        phone,
        payload: payload(profile, appt, service_name),
        scheduled_for,
        status: EntryStatus::Pending,
        attempts: 0,
        last_attempt_at: None,
        error: None,
    }
}

/// Immediate confirmation to the customer, plus one to the business if it
/// opted into booking notices.
pub fn plan_booking_confirmation(
    profile: &BusinessProfile,
    appt: &Appointment,
    service_name: &str,
    now: NaiveDateTime,
) -> Vec<QueueEntry> {
    let mut entries = vec![entry(
        NotificationKind::BookingConfirmation,
        Recipient::Customer,
        profile,
        appt,
        service_name,
        now,
    )];
    if profile.notify_on_booking {
        entries.push(entry(
            NotificationKind::BookingConfirmation,
            Recipient::Business,
            profile,
            appt,
            service_name,
            now,
        ));
    }
    entries
}

/// Customer reminders at 24h/2h/30m before the appointment, each only if that
/// instant is still in the future at planning time; a business reminder at
/// 24h before if opted in. Never plans an entry whose delivery time has
/// already passed.
pub fn plan_reminders(
    profile: &BusinessProfile,
    appt: &Appointment,
    service_name: &str,
    now: NaiveDateTime,
) -> Result<Vec<QueueEntry>, PlanError> {
    let appointment_at = appt.date.and_time(appt.slot.start);

    let mut entries = Vec::new();
    for offset in reminder_offsets() {
        let remind_at = appointment_at
            .checked_sub_signed(offset)
            .ok_or(PlanError("reminder instant out of range"))?;
        if remind_at > now {
            entries.push(entry(
                NotificationKind::Reminder,
                Recipient::Customer,
                profile,
                appt,
                service_name,
                remind_at,
            ));
        }
    }

    if profile.notify_reminders {
        let remind_at = appointment_at
            .checked_sub_signed(business_reminder_offset())
            .ok_or(PlanError("reminder instant out of range"))?;
        if remind_at > now {
            entries.push(entry(
                NotificationKind::Reminder,
                Recipient::Business,
                profile,
                appt,
                service_name,
                remind_at,
            ));
        }
    }

    Ok(entries)
}

/// Immediate cancellation notices to both parties.
pub fn plan_cancellation(
    profile: &BusinessProfile,
    appt: &Appointment,
    service_name: &str,
    now: NaiveDateTime,
) -> Vec<QueueEntry> {
    vec![
        entry(
            NotificationKind::Cancellation,
            Recipient::Customer,
            profile,
            appt,
            service_name,
            now,
        ),
        entry(
            NotificationKind::Cancellation,
            Recipient::Business,
            profile,
            appt,
            service_name,
            now,
        ),
    ]
}

/// Immediate reschedule notices to both parties plus a fresh reminder set for
/// the new time.
pub fn plan_reschedule(
    profile: &BusinessProfile,
    appt: &Appointment,
    service_name: &str,
    now: NaiveDateTime,
) -> Result<Vec<QueueEntry>, PlanError> {
    let mut entries = vec![
        entry(
            NotificationKind::Reschedule,
            Recipient::Customer,
            profile,
            appt,
            service_name,
            now,
        ),
        entry(
            NotificationKind::Reschedule,
            Recipient::Business,
            profile,
            appt,
            service_name,
            now,
        ),
    ];
    entries.extend(plan_reminders(profile, appt, service_name, now)?);
    Ok(entries)
}
