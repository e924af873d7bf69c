use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Store, StoreError};

impl Store {
    pub fn list_businesses(&self) -> Vec<Ulid> {
        self.calendars.iter().map(|e| *e.key()).collect()
    }

    pub async fn get_business(&self, business_id: &Ulid) -> Option<BusinessProfile> {
        let cal_arc = self.get_calendar(business_id)?;
        let cal = cal_arc.read().await;
        Some(cal.profile.clone())
    }

    pub async fn get_service(
        &self,
        business_id: &Ulid,
        service_id: &Ulid,
    ) -> Option<ServiceDef> {
        let cal_arc = self.get_calendar(business_id)?;
        let cal = cal_arc.read().await;
        cal.services.get(service_id).cloned()
    }

    pub async fn get_appointment(&self, id: &Ulid) -> Result<Appointment, StoreError> {
        let business_id = self
            .business_for_appointment(id)
            .ok_or(StoreError::NotFound {
                kind: "appointment",
                id: *id,
            })?;
        let cal_arc = self
            .get_calendar(&business_id)
            .ok_or(StoreError::NotFound {
                kind: "business",
                id: business_id,
            })?;
        let cal = cal_arc.read().await;
        cal.find_appointment(id)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "appointment",
                id: *id,
            })
    }

    /// All appointments for one business on one date, in start-time order.
    pub async fn appointments_on(
        &self,
        business_id: &Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Appointment>, StoreError> {
        let cal_arc = self
            .get_calendar(business_id)
            .ok_or(StoreError::NotFound {
                kind: "business",
                id: *business_id,
            })?;
        let cal = cal_arc.read().await;
        Ok(cal.appointments_on(date).to_vec())
    }

    pub async fn queue_entry(&self, id: &Ulid) -> Option<QueueEntry> {
        let queue = self.queue.read().await;
        queue.entries.get(id).cloned()
    }

    /// Queue entries for one appointment, in enqueue (id) order.
    pub async fn queue_entries_for_appointment(&self, appointment_id: &Ulid) -> Vec<QueueEntry> {
        let queue = self.queue.read().await;
        let mut entries: Vec<QueueEntry> = queue
            .entries
            .values()
            .filter(|e| e.appointment_id == *appointment_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    pub async fn queue_pending_count(&self) -> usize {
        self.queue.read().await.pending_count()
    }
}
