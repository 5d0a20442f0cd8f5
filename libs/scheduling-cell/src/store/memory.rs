use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    Appointment, AppointmentFilter, Examination, Page, Prescription, WaitlistEntry, WaitlistFilter,
};
use crate::store::{
    paginate, AppointmentStore, ClinicalRecordStore, StaffDirectory, WaitlistStore,
};

/// Process-local store used by tests and by the binary when no database is
/// configured. Implements every store seam of the core.
#[derive(Default)]
pub struct InMemoryStore {
    appointments: RwLock<HashMap<Uuid, Appointment>>,
    waitlist: RwLock<HashMap<Uuid, WaitlistEntry>>,
    examinations: RwLock<HashMap<Uuid, Examination>>,
    prescriptions: RwLock<HashMap<Uuid, Prescription>>,
    // appointment id -> order ids
    orders: RwLock<HashMap<Uuid, Vec<Uuid>>>,
    // company id -> dispenser user ids
    dispensers: RwLock<HashMap<Uuid, Vec<Uuid>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_prescription(&self, prescription: Prescription) {
        self.prescriptions
            .write()
            .await
            .insert(prescription.id, prescription);
    }

    pub async fn insert_order(&self, appointment_id: Uuid, order_id: Uuid) {
        self.orders
            .write()
            .await
            .entry(appointment_id)
            .or_default()
            .push(order_id);
    }

    pub async fn add_dispenser(&self, company_id: Uuid, user_id: Uuid) {
        self.dispensers
            .write()
            .await
            .entry(company_id)
            .or_default()
            .push(user_id);
    }

    pub async fn appointment_count(&self) -> usize {
        self.appointments.read().await.len()
    }
}

#[async_trait]
impl AppointmentStore for InMemoryStore {
    async fn create(&self, mut appointment: Appointment) -> Result<Appointment, StoreError> {
        let mut appointments = self.appointments.write().await;
        if appointments.contains_key(&appointment.id) {
            return Err(StoreError::Backend(format!(
                "duplicate appointment id {}",
                appointment.id
            )));
        }

        appointment.version = 1;
        appointments.insert(appointment.id, appointment.clone());
        debug!("Stored appointment {} in memory", appointment.id);
        Ok(appointment)
    }

    async fn get_by_id(&self, company_id: Uuid, id: Uuid) -> Result<Appointment, StoreError> {
        self.appointments
            .read()
            .await
            .get(&id)
            .filter(|a| a.company_id == company_id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "Appointment",
                id,
            })
    }

    async fn update(&self, mut appointment: Appointment) -> Result<Appointment, StoreError> {
        let mut appointments = self.appointments.write().await;
        let current = appointments
            .get(&appointment.id)
            .filter(|a| a.company_id == appointment.company_id)
            .ok_or(StoreError::NotFound {
                entity: "Appointment",
                id: appointment.id,
            })?;

        if current.version != appointment.version {
            return Err(StoreError::VersionConflict {
                entity: "Appointment",
                id: appointment.id,
            });
        }

        appointment.version += 1;
        appointments.insert(appointment.id, appointment.clone());
        Ok(appointment)
    }

    async fn list(&self, filter: AppointmentFilter) -> Result<Page<Appointment>, StoreError> {
        let mut matching: Vec<Appointment> = self
            .appointments
            .read()
            .await
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        matching.sort_by_key(|a| (a.start_time, a.created_at));

        Ok(paginate(matching, &filter))
    }
}

#[async_trait]
impl WaitlistStore for InMemoryStore {
    async fn create(&self, entry: WaitlistEntry) -> Result<WaitlistEntry, StoreError> {
        self.waitlist.write().await.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get_by_id(&self, company_id: Uuid, id: Uuid) -> Result<WaitlistEntry, StoreError> {
        self.waitlist
            .read()
            .await
            .get(&id)
            .filter(|e| e.company_id == company_id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "Waitlist entry",
                id,
            })
    }

    async fn mark_fulfilled(
        &self,
        company_id: Uuid,
        id: Uuid,
        appointment_id: Uuid,
        fulfilled_at: DateTime<Utc>,
    ) -> Result<WaitlistEntry, StoreError> {
        let mut waitlist = self.waitlist.write().await;
        let entry = waitlist
            .get_mut(&id)
            .filter(|e| e.company_id == company_id)
            .ok_or(StoreError::NotFound {
                entity: "Waitlist entry",
                id,
            })?;

        if entry.is_fulfilled() {
            return Err(StoreError::VersionConflict {
                entity: "Waitlist entry",
                id,
            });
        }

        entry.fulfilled_appointment_id = Some(appointment_id);
        entry.fulfilled_at = Some(fulfilled_at);
        Ok(entry.clone())
    }

    async fn list(&self, filter: WaitlistFilter) -> Result<Vec<WaitlistEntry>, StoreError> {
        let mut entries: Vec<WaitlistEntry> = self
            .waitlist
            .read()
            .await
            .values()
            .filter(|e| e.company_id == filter.company_id)
            .filter(|e| filter.appointment_type.map_or(true, |t| e.appointment_type == t))
            .filter(|e| filter.include_fulfilled || !e.is_fulfilled())
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        Ok(entries)
    }
}

#[async_trait]
impl ClinicalRecordStore for InMemoryStore {
    async fn find_examination_for_appointment(
        &self,
        company_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<Option<Examination>, StoreError> {
        Ok(self
            .examinations
            .read()
            .await
            .values()
            .find(|e| e.company_id == company_id && e.appointment_id == appointment_id)
            .cloned())
    }

    async fn create_examination(&self, examination: Examination) -> Result<Examination, StoreError> {
        let mut examinations = self.examinations.write().await;
        // One examination per appointment.
        if let Some(existing) = examinations
            .values()
            .find(|e| e.appointment_id == examination.appointment_id)
        {
            return Ok(existing.clone());
        }

        examinations.insert(examination.id, examination.clone());
        Ok(examination)
    }

    async fn get_examination(&self, company_id: Uuid, id: Uuid) -> Result<Examination, StoreError> {
        self.examinations
            .read()
            .await
            .get(&id)
            .filter(|e| e.company_id == company_id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "Examination",
                id,
            })
    }

    async fn find_prescription_for_examination(
        &self,
        company_id: Uuid,
        examination_id: Uuid,
    ) -> Result<Option<Prescription>, StoreError> {
        let prescriptions = self.prescriptions.read().await;
        let mut found: Vec<&Prescription> = prescriptions
            .values()
            .filter(|p| p.company_id == company_id && p.examination_id == examination_id)
            .collect();
        found.sort_by_key(|p| std::cmp::Reverse(p.created_at));

        Ok(found.first().map(|p| (*p).clone()))
    }

    async fn has_order_for_appointment(
        &self,
        _company_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<bool, StoreError> {
        Ok(self
            .orders
            .read()
            .await
            .get(&appointment_id)
            .is_some_and(|orders| !orders.is_empty()))
    }
}

#[async_trait]
impl StaffDirectory for InMemoryStore {
    async fn active_dispensers(&self, company_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .dispensers
            .read()
            .await
            .get(&company_id)
            .cloned()
            .unwrap_or_default())
    }
}
