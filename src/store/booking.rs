use std::sync::Arc;

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::scheduler;

use super::availability::{ResolvedWindow, resolve_window};
use super::conflict::find_conflicts;
use super::{Store, StoreError};

/// Logical shape of a booking request, as received from the API layer.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub business_id: Ulid,
    pub service_id: Ulid,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub notes: Option<String>,
}

/// Partial update to an existing appointment. `expected_version`, when
/// supplied, must match the stored version or the update is rejected
/// without applying anything.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub status: Option<AppointmentStatus>,
    /// `None` leaves notes untouched; `Some(None)` clears them.
    pub notes: Option<Option<String>>,
    pub expected_version: Option<u32>,
}

// ── Validation steps ─────────────────────────────────────

fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::Validation("name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(StoreError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), StoreError> {
    if email.is_empty() || !email.contains('@') {
        return Err(StoreError::Validation("invalid email address"));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(StoreError::LimitExceeded("email too long"));
    }
    Ok(())
}

fn validate_phone(phone: Option<&str>) -> Result<(), StoreError> {
    if let Some(p) = phone
        && p.len() > MAX_PHONE_LEN
    {
        return Err(StoreError::LimitExceeded("phone too long"));
    }
    Ok(())
}

fn validate_notes(notes: Option<&str>) -> Result<(), StoreError> {
    if let Some(n) = notes
        && n.len() > MAX_NOTES_LEN
    {
        return Err(StoreError::LimitExceeded("notes too long"));
    }
    Ok(())
}

fn validate_minute_aligned(t: NaiveTime) -> Result<(), StoreError> {
    if t.num_seconds_from_midnight() % 60 != 0 || t.nanosecond() != 0 {
        return Err(StoreError::Validation("start time must be minute-aligned"));
    }
    Ok(())
}

/// `end = start + duration`, minute arithmetic on the business-local clock.
/// Appointments may not cross midnight.
fn compute_slot(start: NaiveTime, duration_minutes: u32) -> Result<TimeSlot, StoreError> {
    let end_minute = minute_of_day(start) + duration_minutes;
    if end_minute >= 24 * 60 {
        return Err(StoreError::Validation("appointment must end before midnight"));
    }
    let end = NaiveTime::from_num_seconds_from_midnight_opt(end_minute * 60, 0)
        .ok_or(StoreError::Validation("appointment must end before midnight"))?;
    Ok(TimeSlot::new(start, end))
}

/// Human-readable confirmation code, derived from the appointment id's random
/// tail so it needs no extra uniqueness bookkeeping.
fn confirmation_code(id: &Ulid) -> String {
    let s = id.to_string();
    format!("BK-{}", &s[s.len() - 8..])
}

impl Store {
    // ── Setup operations ─────────────────────────────────

    pub async fn register_business(&self, profile: BusinessProfile) -> Result<(), StoreError> {
        if self.calendars.len() >= MAX_BUSINESSES {
            return Err(StoreError::LimitExceeded("too many businesses"));
        }
        validate_name(&profile.name)?;
        validate_email(&profile.email)?;
        validate_phone(profile.phone.as_deref())?;
        if self.calendars.contains_key(&profile.id) {
            return Err(StoreError::AlreadyExists(profile.id));
        }

        let event = Event::BusinessRegistered {
            id: profile.id,
            name: profile.name.clone(),
            email: profile.email.clone(),
            phone: profile.phone.clone(),
            notify_on_booking: profile.notify_on_booking,
            notify_reminders: profile.notify_reminders,
        };
        self.wal_append(&event).await?;
        self.calendars
            .insert(profile.id, Arc::new(RwLock::new(CalendarState::new(profile))));
        Ok(())
    }

    pub async fn register_service(
        &self,
        business_id: Ulid,
        service: ServiceDef,
    ) -> Result<(), StoreError> {
        validate_name(&service.name)?;
        if service.duration_minutes == 0 || service.duration_minutes > MAX_SERVICE_DURATION_MINUTES
        {
            return Err(StoreError::Validation("invalid service duration"));
        }
        let cal_arc = self.get_calendar(&business_id).ok_or(StoreError::NotFound {
            kind: "business",
            id: business_id,
        })?;
        let mut cal = cal_arc.write().await;
        if cal.services.len() >= MAX_SERVICES_PER_BUSINESS {
            return Err(StoreError::LimitExceeded("too many services"));
        }
        if cal.services.contains_key(&service.id) {
            return Err(StoreError::AlreadyExists(service.id));
        }

        let event = Event::ServiceRegistered {
            business_id,
            service,
        };
        self.persist_and_apply(&mut cal, &event).await
    }

    pub async fn set_weekly_hours(
        &self,
        business_id: Ulid,
        weekday: u8,
        start: NaiveTime,
        end: NaiveTime,
        available: bool,
    ) -> Result<(), StoreError> {
        if weekday > 6 {
            return Err(StoreError::Validation("weekday must be 0..=6"));
        }
        if start >= end {
            return Err(StoreError::Validation("start must be before end"));
        }
        let cal_arc = self.get_calendar(&business_id).ok_or(StoreError::NotFound {
            kind: "business",
            id: business_id,
        })?;
        let mut cal = cal_arc.write().await;

        let event = Event::WeeklyHoursSet {
            business_id,
            weekday,
            start,
            end,
            available,
        };
        self.persist_and_apply(&mut cal, &event).await
    }

    pub async fn set_exception(
        &self,
        business_id: Ulid,
        date: NaiveDate,
        window: Option<(NaiveTime, NaiveTime)>,
        available: bool,
        reason: Option<String>,
    ) -> Result<(), StoreError> {
        if let Some((start, end)) = window
            && start >= end
        {
            return Err(StoreError::Validation("start must be before end"));
        }
        if let Some(ref r) = reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(StoreError::LimitExceeded("reason too long"));
        }
        let cal_arc = self.get_calendar(&business_id).ok_or(StoreError::NotFound {
            kind: "business",
            id: business_id,
        })?;
        let mut cal = cal_arc.write().await;
        if cal.exceptions.len() >= MAX_EXCEPTIONS_PER_CALENDAR
            && !cal.exceptions.contains_key(&date)
        {
            return Err(StoreError::LimitExceeded("too many exceptions"));
        }

        let event = Event::ExceptionSet {
            business_id,
            date,
            start: window.map(|w| w.0),
            end: window.map(|w| w.1),
            available,
            reason,
        };
        self.persist_and_apply(&mut cal, &event).await
    }

    // ── Booking transaction ──────────────────────────────

    /// Book with the current wall clock as the notification-planning instant.
    pub async fn book(&self, request: BookingRequest) -> Result<Appointment, StoreError> {
        self.book_at(request, Local::now().naive_local()).await
    }

    /// The booking transaction. The per-business calendar write lock held
    /// across conflict check, availability check, and WAL commit is what makes
    /// two concurrent requests for the same slot serialize: one wins, the
    /// other sees the inserted row and fails with `Conflict`.
    ///
    /// Notification scheduling runs after the lock is released and is
    /// best-effort: its failures are logged and never undo the booking.
    pub async fn book_at(
        &self,
        request: BookingRequest,
        now: NaiveDateTime,
    ) -> Result<Appointment, StoreError> {
        validate_name(&request.customer_name)?;
        validate_email(&request.customer_email)?;
        validate_phone(request.customer_phone.as_deref())?;
        validate_notes(request.notes.as_deref())?;
        validate_minute_aligned(request.start_time)?;

        let cal_arc = self
            .get_calendar(&request.business_id)
            .ok_or(StoreError::NotFound {
                kind: "business",
                id: request.business_id,
            })?;
        let mut cal = cal_arc.write().await;

        let service = cal
            .services
            .get(&request.service_id)
            .ok_or(StoreError::NotFound {
                kind: "service",
                id: request.service_id,
            })?;
        if !service.active {
            return Err(StoreError::Validation("service is not active"));
        }
        let duration = service.duration_minutes;
        let buffer = service.buffer_minutes;
        let service_name = service.name.clone();

        if cal.appointments.len() >= MAX_APPOINTMENTS_PER_CALENDAR {
            return Err(StoreError::LimitExceeded("too many appointments"));
        }

        let slot = compute_slot(request.start_time, duration)?;

        let conflicts = find_conflicts(&cal, request.date, &slot, buffer, None);
        if !conflicts.is_empty() {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(StoreError::Conflict(conflicts));
        }

        match resolve_window(&cal, request.date) {
            ResolvedWindow::Closed(reason) => return Err(StoreError::Unavailable(reason)),
            ResolvedWindow::Open(window) => {
                if !window.contains_slot(&slot) {
                    return Err(StoreError::Unavailable("outside business hours".into()));
                }
            }
        }

        let id = Ulid::new();
        let appointment = Appointment {
            id,
            service_id: request.service_id,
            customer: CustomerContact {
                name: request.customer_name,
                email: request.customer_email,
                phone: request.customer_phone,
            },
            date: request.date,
            slot,
            status: AppointmentStatus::Pending,
            notes: request.notes,
            confirmation_code: confirmation_code(&id),
            version: 1,
        };

        let event = Event::AppointmentBooked {
            business_id: request.business_id,
            appointment: appointment.clone(),
        };
        self.persist_and_apply(&mut cal, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_TOTAL).increment(1);

        let profile = cal.profile.clone();
        drop(cal);

        self.notify_booked(&profile, &appointment, &service_name, now)
            .await;

        Ok(appointment)
    }

    // ── Optimistic-locked update ─────────────────────────

    pub async fn update(
        &self,
        id: Ulid,
        changes: UpdateRequest,
    ) -> Result<Appointment, StoreError> {
        self.update_at(id, changes, Local::now().naive_local())
            .await
    }

    /// Reschedule/status-change with optimistic concurrency. A stale
    /// `expected_version` fails without mutating anything; a successful
    /// update increments `version` by exactly 1.
    pub async fn update_at(
        &self,
        id: Ulid,
        changes: UpdateRequest,
        now: NaiveDateTime,
    ) -> Result<Appointment, StoreError> {
        validate_notes(changes.notes.as_ref().and_then(|n| n.as_deref()))?;

        let business_id = self
            .business_for_appointment(&id)
            .ok_or(StoreError::NotFound {
                kind: "appointment",
                id,
            })?;
        let cal_arc = self.get_calendar(&business_id).ok_or(StoreError::NotFound {
            kind: "business",
            id: business_id,
        })?;
        let mut cal = cal_arc.write().await;

        let current = cal
            .find_appointment(&id)
            .ok_or(StoreError::NotFound {
                kind: "appointment",
                id,
            })?
            .clone();

        if let Some(expected) = changes.expected_version
            && expected != current.version
        {
            return Err(StoreError::StaleVersion {
                expected,
                actual: current.version,
            });
        }

        let new_date = changes.date.unwrap_or(current.date);
        let new_start = changes.start_time.unwrap_or(current.slot.start);
        let time_changed = new_date != current.date || new_start != current.slot.start;

        let new_status = match changes.status {
            Some(next) if next != current.status => {
                if !current.status.can_transition_to(next) {
                    return Err(StoreError::Validation("invalid status transition"));
                }
                next
            }
            _ => current.status,
        };

        let service = cal
            .services
            .get(&current.service_id)
            .ok_or(StoreError::NotFound {
                kind: "service",
                id: current.service_id,
            })?;
        let duration = service.duration_minutes;
        let buffer = service.buffer_minutes;
        let service_name = service.name.clone();

        let new_slot = if time_changed {
            if !new_status.blocks_slot() {
                return Err(StoreError::Validation(
                    "only pending or confirmed appointments can be rescheduled",
                ));
            }
            validate_minute_aligned(new_start)?;
            let slot = compute_slot(new_start, duration)?;

            let conflicts = find_conflicts(&cal, new_date, &slot, buffer, Some(id));
            if !conflicts.is_empty() {
                return Err(StoreError::Conflict(conflicts));
            }
            match resolve_window(&cal, new_date) {
                ResolvedWindow::Closed(reason) => return Err(StoreError::Unavailable(reason)),
                ResolvedWindow::Open(window) => {
                    if !window.contains_slot(&slot) {
                        return Err(StoreError::Unavailable("outside business hours".into()));
                    }
                }
            }
            slot
        } else {
            current.slot
        };

        let new_notes = match changes.notes {
            Some(notes) => notes,
            None => current.notes.clone(),
        };

        let event = Event::AppointmentUpdated {
            business_id,
            id,
            date: new_date,
            slot: new_slot,
            status: new_status,
            notes: new_notes,
            version: current.version + 1,
        };
        self.persist_and_apply(&mut cal, &event).await?;
        metrics::counter!(crate::observability::UPDATES_TOTAL).increment(1);

        let updated = cal
            .find_appointment(&id)
            .ok_or(StoreError::NotFound {
                kind: "appointment",
                id,
            })?
            .clone();
        let profile = cal.profile.clone();
        drop(cal);

        let cancelled_now =
            new_status == AppointmentStatus::Cancelled && current.status != new_status;
        if cancelled_now {
            let entries = scheduler::plan_cancellation(&profile, &updated, &service_name, now);
            self.enqueue_entries(entries).await;
        }
        if time_changed {
            match scheduler::plan_reschedule(&profile, &updated, &service_name, now) {
                Ok(entries) => self.enqueue_entries(entries).await,
                Err(e) => {
                    tracing::error!("reschedule notifications skipped for {id}: {e}");
                }
            }
        }

        Ok(updated)
    }

    // ── Post-commit notification scheduling ──────────────

    /// Plan the full confirmation + reminder set, then enqueue. Planned as a
    /// whole so a planning failure enqueues nothing rather than a partial set.
    async fn notify_booked(
        &self,
        profile: &BusinessProfile,
        appointment: &Appointment,
        service_name: &str,
        now: NaiveDateTime,
    ) {
        let mut entries =
            scheduler::plan_booking_confirmation(profile, appointment, service_name, now);
        match scheduler::plan_reminders(profile, appointment, service_name, now) {
            Ok(reminders) => entries.extend(reminders),
            Err(e) => {
                tracing::error!(
                    "notification scheduling aborted for {}: {e}",
                    appointment.id
                );
                return;
            }
        }
        self.enqueue_entries(entries).await;
    }

    /// Best-effort enqueue: a WAL failure here is logged, never propagated to
    /// the booking/update caller.
    pub(super) async fn enqueue_entries(&self, entries: Vec<QueueEntry>) {
        {
            let queue = self.queue.read().await;
            if queue.entries.len() + entries.len() > MAX_QUEUE_ENTRIES {
                tracing::error!("notification queue full, dropping {} entries", entries.len());
                return;
            }
        }
        for entry in entries {
            let id = entry.id;
            let event = Event::NotificationEnqueued { entry };
            if let Err(e) = self.persist_queue_event(&event).await {
                tracing::warn!("failed to enqueue notification {id}: {e}");
                return;
            }
        }
        let pending = self.queue.read().await.pending_count();
        metrics::gauge!(crate::observability::QUEUE_PENDING).set(pending as f64);
    }
}
