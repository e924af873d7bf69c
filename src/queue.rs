//! Notification delivery: channel adapters, the dispatcher that picks one per
//! entry, and the queue processing pass that drains due entries.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use ulid::Ulid;

use crate::limits::MAX_BATCH_LIMIT;
use crate::model::*;
use crate::observability;
use crate::store::Store;

/// One message handed to a channel adapter, fully resolved: the adapter only
/// has to deliver it.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub entry_id: Ulid,
    pub kind: NotificationKind,
    pub recipient: Recipient,
    pub to: String,
    pub payload: NotificationPayload,
}

#[derive(Debug)]
pub struct AdapterError(pub String);

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "delivery failed: {}", self.0)
    }
}

impl std::error::Error for AdapterError {}

/// A delivery channel (email provider, SMS gateway, ...). Implementations must
/// be safe to call concurrently.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), AdapterError>;
    fn name(&self) -> &'static str;
}

/// Development/standalone adapter: logs the message instead of delivering it.
pub struct LogAdapter {
    channel: &'static str,
}

impl LogAdapter {
    pub fn new(channel: &'static str) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ChannelAdapter for LogAdapter {
    async fn send(&self, message: &OutboundMessage) -> Result<(), AdapterError> {
        let body = serde_json::to_string(&message.payload).unwrap_or_default();
        tracing::info!(
            channel = self.channel,
            entry = %message.entry_id,
            kind = ?message.kind,
            to = %message.to,
            %body,
            "outbound notification"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.channel
    }
}

/// Routes each queue entry to a channel adapter and bounds every send with a
/// timeout so one stuck provider can't stall the processing pass.
pub struct Dispatcher {
    email: Arc<dyn ChannelAdapter>,
    messaging: Option<Arc<dyn ChannelAdapter>>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        email: Arc<dyn ChannelAdapter>,
        messaging: Option<Arc<dyn ChannelAdapter>>,
        timeout: Duration,
    ) -> Self {
        Self {
            email,
            messaging,
            timeout,
        }
    }

    /// Customer reminders go over the messaging channel when the customer has
    /// a phone number and a messaging adapter is configured; everything else
    /// goes over email.
    fn route(&self, entry: &QueueEntry) -> (&dyn ChannelAdapter, String) {
        if entry.kind == NotificationKind::Reminder
            && entry.recipient == Recipient::Customer
            && let Some(ref messaging) = self.messaging
            && let Some(ref phone) = entry.phone
        {
            return (messaging.as_ref(), phone.clone());
        }
        (self.email.as_ref(), entry.email.clone())
    }

    pub async fn dispatch(&self, entry: &QueueEntry) -> Result<(), AdapterError> {
        let (adapter, to) = self.route(entry);
        let message = OutboundMessage {
            entry_id: entry.id,
            kind: entry.kind,
            recipient: entry.recipient,
            to,
            payload: entry.payload.clone(),
        };
        let start = std::time::Instant::now();
        let result = match tokio::time::timeout(self.timeout, adapter.send(&message)).await {
            Ok(r) => r,
            Err(_) => Err(AdapterError(format!(
                "timed out after {:?} on {}",
                self.timeout,
                adapter.name()
            ))),
        };
        metrics::histogram!(observability::DISPATCH_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());
        result
    }
}

/// Outcome of one delivery attempt, carried to the WAL as a resolution event.
struct Attempt {
    entry_id: Ulid,
    status: EntryStatus,
    attempts: u32,
    last_attempt_at: Option<NaiveDateTime>,
    error: Option<String>,
}

fn lock_claims(claims: &Mutex<HashSet<Ulid>>) -> MutexGuard<'_, HashSet<Ulid>> {
    claims.lock().unwrap_or_else(|e| e.into_inner())
}

/// Claims held by one processing pass. Dropping the guard releases everything
/// not yet finalized, so an abandoned pass (caller timeout, task abort)
/// returns its entries to the pool instead of leaving them invisible for the
/// life of the process.
struct ClaimGuard {
    claims: Arc<Mutex<HashSet<Ulid>>>,
    held: Vec<Ulid>,
}

impl ClaimGuard {
    fn release(&mut self, id: Ulid) {
        lock_claims(&self.claims).remove(&id);
        self.held.retain(|h| *h != id);
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let mut claims = lock_claims(&self.claims);
        for id in &self.held {
            claims.remove(id);
        }
    }
}

impl Store {
    /// One processing pass over the queue with the current wall clock.
    pub async fn process_pending(&self, dispatcher: &Dispatcher, limit: usize) -> usize {
        self.process_pending_at(dispatcher, limit, Local::now().naive_local())
            .await
    }

    /// Select up to `limit` due pending entries, attempt each once, and record
    /// the outcome. Claim check and insert happen under one lock, so
    /// concurrent passes never pick the same entry; the claim guard hands
    /// everything unfinalized back if the pass is abandoned mid-batch. Each
    /// entry's outcome is independent: one failure never aborts the pass.
    ///
    /// Returns the number of entries marked processed.
    pub async fn process_pending_at(
        &self,
        dispatcher: &Dispatcher,
        limit: usize,
        now: NaiveDateTime,
    ) -> usize {
        let limit = limit.min(MAX_BATCH_LIMIT);
        let (batch, mut claims) = {
            let queue = self.queue.read().await;
            let mut claimed = lock_claims(&self.claimed);
            let mut due: Vec<&QueueEntry> = queue
                .entries
                .values()
                .filter(|e| {
                    e.status == EntryStatus::Pending
                        && e.scheduled_for <= now
                        && !claimed.contains(&e.id)
                })
                .collect();
            due.sort_by_key(|e| (e.scheduled_for, e.id));
            due.truncate(limit);
            let batch: Vec<QueueEntry> = due.into_iter().cloned().collect();
            let held: Vec<Ulid> = batch.iter().map(|e| e.id).collect();
            for id in &held {
                claimed.insert(*id);
            }
            drop(claimed);
            (
                batch,
                ClaimGuard {
                    claims: self.claimed.clone(),
                    held,
                },
            )
        };

        let mut processed = 0usize;
        for entry in batch {
            let attempt = self.attempt_entry(dispatcher, &entry, now).await;
            let ok = attempt.status == EntryStatus::Processed;
            let failed = attempt.status == EntryStatus::Failed;
            let id = attempt.entry_id;
            self.finalize_attempt(attempt).await;
            claims.release(id);
            if ok {
                processed += 1;
                metrics::counter!(observability::QUEUE_PROCESSED_TOTAL).increment(1);
            }
            if failed {
                metrics::counter!(observability::QUEUE_FAILED_TOTAL).increment(1);
            }
        }

        let pending = self.queue.read().await.pending_count();
        metrics::gauge!(observability::QUEUE_PENDING).set(pending as f64);
        processed
    }

    async fn attempt_entry(
        &self,
        dispatcher: &Dispatcher,
        entry: &QueueEntry,
        now: NaiveDateTime,
    ) -> Attempt {
        let Some(status) = self.appointment_status(&entry.appointment_id).await else {
            return Attempt {
                entry_id: entry.id,
                status: EntryStatus::Failed,
                attempts: entry.attempts + 1,
                last_attempt_at: Some(now),
                error: Some("appointment no longer exists".into()),
            };
        };

        // Reminders for appointments that no longer hold their slot are
        // suppressed, not failed: the entry simply outlived its purpose.
        if entry.kind == NotificationKind::Reminder && !status.blocks_slot() {
            return Attempt {
                entry_id: entry.id,
                status: EntryStatus::Processed,
                attempts: entry.attempts,
                last_attempt_at: Some(now),
                error: None,
            };
        }

        match dispatcher.dispatch(entry).await {
            Ok(()) => Attempt {
                entry_id: entry.id,
                status: EntryStatus::Processed,
                attempts: entry.attempts + 1,
                last_attempt_at: Some(now),
                error: None,
            },
            Err(e) => Attempt {
                entry_id: entry.id,
                status: EntryStatus::Failed,
                attempts: entry.attempts + 1,
                last_attempt_at: Some(now),
                error: Some(e.0),
            },
        }
    }

    async fn appointment_status(&self, appointment_id: &Ulid) -> Option<AppointmentStatus> {
        let business_id = self.business_for_appointment(appointment_id)?;
        let cal_arc = self.get_calendar(&business_id)?;
        let cal = cal_arc.read().await;
        cal.find_appointment(appointment_id).map(|a| a.status)
    }

    /// Record the attempt outcome. If the WAL write fails the entry stays
    /// pending and the caller releases its claim anyway, so a later pass
    /// retries it.
    async fn finalize_attempt(&self, attempt: Attempt) {
        let id = attempt.entry_id;
        let event = Event::NotificationResolved {
            id,
            status: attempt.status,
            attempts: attempt.attempts,
            last_attempt_at: attempt.last_attempt_at,
            error: attempt.error,
        };
        match self.wal_append(&event).await {
            Ok(()) => self.queue.write().await.apply(&event),
            Err(e) => {
                tracing::warn!("failed to record outcome for {id}: {e}");
            }
        }
    }

    /// Put one failed entry back in line for the next processing pass.
    /// Attempt history is kept.
    pub async fn retry_entry(&self, id: Ulid) -> Result<(), crate::store::StoreError> {
        use crate::store::StoreError;

        let (attempts, last_attempt_at) = {
            let queue = self.queue.read().await;
            let entry = queue.entries.get(&id).ok_or(StoreError::NotFound {
                kind: "queue entry",
                id,
            })?;
            if entry.status != EntryStatus::Failed {
                return Err(StoreError::Validation("only failed entries can be retried"));
            }
            (entry.attempts, entry.last_attempt_at)
        };

        let event = Event::NotificationResolved {
            id,
            status: EntryStatus::Pending,
            attempts,
            last_attempt_at,
            error: None,
        };
        self.persist_queue_event(&event).await
    }
}
