//! Persistence seams of the scheduling core. Every query is scoped by
//! `company_id`; implementations never read across tenants.

pub mod memory;
pub mod supabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    Appointment, AppointmentFilter, Examination, Page, Prescription, WaitlistEntry, WaitlistFilter,
};

pub use memory::InMemoryStore;
pub use supabase::SupabaseSchedulingStore;

#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn create(&self, appointment: Appointment) -> Result<Appointment, StoreError>;

    async fn get_by_id(&self, company_id: Uuid, id: Uuid) -> Result<Appointment, StoreError>;

    /// Writes `appointment` only if the stored version still equals
    /// `appointment.version`; returns the row with the bumped version.
    async fn update(&self, appointment: Appointment) -> Result<Appointment, StoreError>;

    async fn list(&self, filter: AppointmentFilter) -> Result<Page<Appointment>, StoreError>;
}

#[async_trait]
pub trait WaitlistStore: Send + Sync {
    async fn create(&self, entry: WaitlistEntry) -> Result<WaitlistEntry, StoreError>;

    async fn get_by_id(&self, company_id: Uuid, id: Uuid) -> Result<WaitlistEntry, StoreError>;

    /// Links the entry to `appointment_id` only while it is still unfulfilled.
    /// An entry that already carries a link yields `VersionConflict`.
    async fn mark_fulfilled(
        &self,
        company_id: Uuid,
        id: Uuid,
        appointment_id: Uuid,
        fulfilled_at: DateTime<Utc>,
    ) -> Result<WaitlistEntry, StoreError>;

    /// Ordered by priority descending, then `created_at` ascending.
    async fn list(&self, filter: WaitlistFilter) -> Result<Vec<WaitlistEntry>, StoreError>;
}

/// Downstream clinical records the workflow reads and, for examinations,
/// creates.
#[async_trait]
pub trait ClinicalRecordStore: Send + Sync {
    async fn find_examination_for_appointment(
        &self,
        company_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<Option<Examination>, StoreError>;

    async fn create_examination(&self, examination: Examination) -> Result<Examination, StoreError>;

    async fn get_examination(&self, company_id: Uuid, id: Uuid) -> Result<Examination, StoreError>;

    async fn find_prescription_for_examination(
        &self,
        company_id: Uuid,
        examination_id: Uuid,
    ) -> Result<Option<Prescription>, StoreError>;

    async fn has_order_for_appointment(
        &self,
        company_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait StaffDirectory: Send + Sync {
    async fn active_dispensers(&self, company_id: Uuid) -> Result<Vec<Uuid>, StoreError>;
}

/// Pages an in-memory result set the same way PostgREST does.
pub(crate) fn paginate<T>(items: Vec<T>, filter: &AppointmentFilter) -> Page<T> {
    let total = items.len() as u64;
    let limit = filter.effective_limit();
    let items = items
        .into_iter()
        .skip(filter.offset())
        .take(limit as usize)
        .collect();

    Page {
        items,
        total,
        page: filter.page.max(1),
        limit,
    }
}
