mod availability;
mod booking;
mod conflict;
mod error;
mod queries;

pub use availability::{ResolvedWindow, resolve_window};
pub use booking::{BookingRequest, UpdateRequest};
pub use conflict::find_conflicts;
pub use error::StoreError;

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedCalendar = Arc<RwLock<CalendarState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch.len() as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Queue state ──────────────────────────────────────────

/// Materialized notification queue, rebuilt from the WAL. In-flight claims
/// live beside it in `Store::claimed`, not here: claims are transient process
/// state, never persisted.
#[derive(Default)]
pub struct QueueState {
    pub entries: HashMap<Ulid, QueueEntry>,
}

impl QueueState {
    pub(crate) fn apply(&mut self, event: &Event) {
        match event {
            Event::NotificationEnqueued { entry } => {
                self.entries.insert(entry.id, entry.clone());
            }
            Event::NotificationResolved {
                id,
                status,
                attempts,
                last_attempt_at,
                error,
            } => {
                if let Some(entry) = self.entries.get_mut(id) {
                    entry.status = *status;
                    entry.attempts = *attempts;
                    entry.last_attempt_at = *last_attempt_at;
                    entry.error = error.clone();
                }
            }
            _ => {}
        }
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.status == EntryStatus::Pending)
            .count()
    }
}

// ── Store ────────────────────────────────────────────────

/// The store of record: per-business calendars plus the notification queue,
/// all rebuilt from the WAL on startup. Constructed once at process startup
/// and shared by reference.
pub struct Store {
    pub(super) calendars: DashMap<Ulid, SharedCalendar>,
    pub(super) queue: Arc<RwLock<QueueState>>,
    /// Entries currently held by a processing pass. A claimed entry is
    /// invisible to concurrent passes until its outcome is recorded or the
    /// pass drops its claim guard. Sync mutex so release works from `Drop`.
    pub(super) claimed: Arc<Mutex<HashSet<Ulid>>>,
    /// Reverse lookup: appointment id → business id.
    pub(super) appt_index: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

/// Apply a calendar-scoped event directly to a CalendarState (no locking —
/// caller holds the lock).
fn apply_to_calendar(cal: &mut CalendarState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ServiceRegistered { service, .. } => {
            cal.services.insert(service.id, service.clone());
        }
        Event::WeeklyHoursSet {
            weekday,
            start,
            end,
            available,
            ..
        } => {
            cal.weekly[*weekday as usize] = Some(WeeklyRule {
                start: *start,
                end: *end,
                available: *available,
            });
        }
        Event::ExceptionSet {
            date,
            start,
            end,
            available,
            reason,
            ..
        } => {
            let window = match (start, end) {
                (Some(s), Some(e)) => Some(TimeSlot::new(*s, *e)),
                _ => None,
            };
            cal.exceptions.insert(
                *date,
                ExceptionRule {
                    window,
                    available: *available,
                    reason: reason.clone(),
                },
            );
        }
        Event::AppointmentBooked {
            business_id,
            appointment,
        } => {
            index.insert(appointment.id, *business_id);
            cal.insert_appointment(appointment.clone());
        }
        Event::AppointmentUpdated {
            id,
            date,
            slot,
            status,
            notes,
            version,
            ..
        } => {
            // Date may change, so remove and reinsert to keep sort order.
            if let Some(mut appt) = cal.remove_appointment(*id) {
                appt.date = *date;
                appt.slot = *slot;
                appt.status = *status;
                appt.notes = notes.clone();
                appt.version = *version;
                cal.insert_appointment(appt);
            }
        }
        // Business registration and queue events are handled at the Store level.
        _ => {}
    }
}

fn event_business_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ServiceRegistered { business_id, .. }
        | Event::WeeklyHoursSet { business_id, .. }
        | Event::ExceptionSet { business_id, .. }
        | Event::AppointmentBooked { business_id, .. }
        | Event::AppointmentUpdated { business_id, .. } => Some(*business_id),
        _ => None,
    }
}

impl Store {
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            calendars: DashMap::new(),
            queue: Arc::new(RwLock::new(QueueState::default())),
            claimed: Arc::new(Mutex::new(HashSet::new())),
            appt_index: DashMap::new(),
            wal_tx,
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly (no contention). Never use blocking_write here
        // because this may run inside an async context.
        for event in &events {
            match event {
                Event::BusinessRegistered {
                    id,
                    name,
                    email,
                    phone,
                    notify_on_booking,
                    notify_reminders,
                } => {
                    let profile = BusinessProfile {
                        id: *id,
                        name: name.clone(),
                        email: email.clone(),
                        phone: phone.clone(),
                        notify_on_booking: *notify_on_booking,
                        notify_reminders: *notify_reminders,
                    };
                    store
                        .calendars
                        .insert(*id, Arc::new(RwLock::new(CalendarState::new(profile))));
                }
                Event::NotificationEnqueued { .. } | Event::NotificationResolved { .. } => {
                    let mut queue = store
                        .queue
                        .try_write()
                        .expect("replay: uncontended queue write");
                    queue.apply(event);
                }
                other => {
                    if let Some(business_id) = event_business_id(other)
                        && let Some(entry) = store.calendars.get(&business_id)
                    {
                        let cal_arc = entry.clone();
                        let mut guard = cal_arc.try_write().expect("replay: uncontended write");
                        apply_to_calendar(&mut guard, other, &store.appt_index);
                    }
                }
            }
        }

        Ok(store)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub fn get_calendar(&self, business_id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(business_id).map(|e| e.value().clone())
    }

    pub fn business_for_appointment(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appt_index.get(appointment_id).map(|e| *e.value())
    }

    /// WAL-append + apply in one call, for calendar-scoped events.
    pub(super) async fn persist_and_apply(
        &self,
        cal: &mut CalendarState,
        event: &Event,
    ) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        apply_to_calendar(cal, event, &self.appt_index);
        Ok(())
    }

    /// WAL-append + apply for queue-scoped events.
    pub(super) async fn persist_queue_event(&self, event: &Event) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        self.queue.write().await.apply(event);
        Ok(())
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let mut events = Vec::new();

        let business_ids: Vec<Ulid> = self.calendars.iter().map(|e| *e.key()).collect();
        for id in business_ids {
            let Some(cal_arc) = self.get_calendar(&id) else {
                continue;
            };
            let cal = cal_arc.read().await;

            events.push(Event::BusinessRegistered {
                id: cal.profile.id,
                name: cal.profile.name.clone(),
                email: cal.profile.email.clone(),
                phone: cal.profile.phone.clone(),
                notify_on_booking: cal.profile.notify_on_booking,
                notify_reminders: cal.profile.notify_reminders,
            });
            for service in cal.services.values() {
                events.push(Event::ServiceRegistered {
                    business_id: id,
                    service: service.clone(),
                });
            }
            for (weekday, rule) in cal.weekly.iter().enumerate() {
                if let Some(rule) = rule {
                    events.push(Event::WeeklyHoursSet {
                        business_id: id,
                        weekday: weekday as u8,
                        start: rule.start,
                        end: rule.end,
                        available: rule.available,
                    });
                }
            }
            for (date, rule) in &cal.exceptions {
                events.push(Event::ExceptionSet {
                    business_id: id,
                    date: *date,
                    start: rule.window.map(|w| w.start),
                    end: rule.window.map(|w| w.end),
                    available: rule.available,
                    reason: rule.reason.clone(),
                });
            }
            for appt in &cal.appointments {
                events.push(Event::AppointmentBooked {
                    business_id: id,
                    appointment: appt.clone(),
                });
            }
        }

        {
            // Entries carry their status/attempts, so resolved history compacts
            // to a single enqueue event per entry.
            let queue = self.queue.read().await;
            let mut entries: Vec<&QueueEntry> = queue.entries.values().collect();
            entries.sort_by_key(|e| e.id);
            for entry in entries {
                events.push(Event::NotificationEnqueued {
                    entry: entry.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
