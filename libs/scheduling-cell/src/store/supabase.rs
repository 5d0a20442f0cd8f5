// libs/scheduling-cell/src/store/supabase.rs
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use shared_database::supabase::{SupabaseApiError, SupabaseClient};

use crate::error::StoreError;
use crate::models::{
    Appointment, AppointmentFilter, Examination, Page, Prescription, WaitlistEntry, WaitlistFilter,
};
use crate::store::{AppointmentStore, ClinicalRecordStore, StaffDirectory, WaitlistStore};

/// PostgREST-backed implementation of every store seam. Requests run with
/// the service key; tenant isolation comes from the `company_id` filter on
/// every query.
pub struct SupabaseSchedulingStore {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseSchedulingStore {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    async fn select<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, StoreError> {
        self.supabase
            .request::<Vec<T>>(Method::GET, path, None, None)
            .await
            .map_err(backend)
    }

    async fn insert<T: DeserializeOwned>(
        &self,
        table: &str,
        body: Value,
    ) -> Result<Vec<T>, StoreError> {
        self.supabase
            .request_with_headers::<Vec<T>>(
                Method::POST,
                &format!("/rest/v1/{}", table),
                None,
                Some(body),
                Some(SupabaseClient::representation_headers()),
            )
            .await
            .map_err(backend)
    }

    async fn patch<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<Vec<T>, StoreError> {
        self.supabase
            .request_with_headers::<Vec<T>>(
                Method::PATCH,
                path,
                None,
                Some(body),
                Some(SupabaseClient::representation_headers()),
            )
            .await
            .map_err(backend)
    }
}

fn backend(err: anyhow::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn to_body<T: serde::Serialize>(value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Backend(format!("serialization failed: {}", e)))
}

fn timestamp(value: DateTime<Utc>) -> String {
    urlencoding::encode(&value.to_rfc3339()).into_owned()
}

fn appointment_query(filter: &AppointmentFilter) -> String {
    let mut query_parts = vec![format!("company_id=eq.{}", filter.company_id)];

    if let Some(patient_id) = filter.patient_id {
        query_parts.push(format!("patient_id=eq.{}", patient_id));
    }
    if let Some(practitioner_id) = filter.practitioner_id {
        query_parts.push(format!("practitioner_id=eq.{}", practitioner_id));
    }
    if !filter.statuses.is_empty() {
        let statuses: Vec<&str> = filter.statuses.iter().map(|s| s.as_str()).collect();
        query_parts.push(format!("status=in.({})", statuses.join(",")));
    }
    if let Some(range) = filter.overlapping {
        // start < range.end AND end > range.start
        query_parts.push(format!("start_time=lt.{}", timestamp(range.end)));
        query_parts.push(format!("end_time=gt.{}", timestamp(range.start)));
    }

    format!(
        "/rest/v1/appointments?{}&order=start_time.asc&limit={}&offset={}",
        query_parts.join("&"),
        filter.effective_limit(),
        filter.offset()
    )
}

#[async_trait]
impl AppointmentStore for SupabaseSchedulingStore {
    async fn create(&self, mut appointment: Appointment) -> Result<Appointment, StoreError> {
        appointment.version = 1;
        let rows: Vec<Appointment> = self.insert("appointments", to_body(&appointment)?).await?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Backend("Failed to create appointment".to_string()))
    }

    async fn get_by_id(&self, company_id: Uuid, id: Uuid) -> Result<Appointment, StoreError> {
        let path = format!(
            "/rest/v1/appointments?id=eq.{}&company_id=eq.{}&select=*",
            id, company_id
        );
        let rows: Vec<Appointment> = self.select(&path).await?;

        rows.into_iter().next().ok_or(StoreError::NotFound {
            entity: "Appointment",
            id,
        })
    }

    async fn update(&self, appointment: Appointment) -> Result<Appointment, StoreError> {
        let expected_version = appointment.version;
        let mut next = appointment;
        next.version = expected_version + 1;

        let path = format!(
            "/rest/v1/appointments?id=eq.{}&company_id=eq.{}&version=eq.{}",
            next.id, next.company_id, expected_version
        );
        let rows: Vec<Appointment> = self.patch(&path, to_body(&next)?).await?;

        if let Some(updated) = rows.into_iter().next() {
            return Ok(updated);
        }

        // Nothing matched: either the row is gone or the version moved on.
        match AppointmentStore::get_by_id(self, next.company_id, next.id).await {
            Ok(current) => {
                debug!(
                    "Version conflict on appointment {}: expected {}, found {}",
                    next.id, expected_version, current.version
                );
                Err(StoreError::VersionConflict {
                    entity: "Appointment",
                    id: next.id,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn list(&self, filter: AppointmentFilter) -> Result<Page<Appointment>, StoreError> {
        let path = appointment_query(&filter);
        let (items, total) = self
            .supabase
            .select_with_count::<Appointment>(&path, None)
            .await
            .map_err(backend)?;

        Ok(Page {
            total: total.unwrap_or(items.len() as u64),
            items,
            page: filter.page.max(1),
            limit: filter.effective_limit(),
        })
    }
}

#[async_trait]
impl WaitlistStore for SupabaseSchedulingStore {
    async fn create(&self, entry: WaitlistEntry) -> Result<WaitlistEntry, StoreError> {
        let rows: Vec<WaitlistEntry> = self.insert("waitlist_entries", to_body(&entry)?).await?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Backend("Failed to create waitlist entry".to_string()))
    }

    async fn get_by_id(&self, company_id: Uuid, id: Uuid) -> Result<WaitlistEntry, StoreError> {
        let path = format!(
            "/rest/v1/waitlist_entries?id=eq.{}&company_id=eq.{}&select=*",
            id, company_id
        );
        let rows: Vec<WaitlistEntry> = self.select(&path).await?;

        rows.into_iter().next().ok_or(StoreError::NotFound {
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
        let path = format!(
            "/rest/v1/waitlist_entries?id=eq.{}&company_id=eq.{}&fulfilled_appointment_id=is.null",
            id, company_id
        );
        let body = json!({
            "fulfilled_appointment_id": appointment_id,
            "fulfilled_at": fulfilled_at,
        });
        let rows: Vec<WaitlistEntry> = self.patch(&path, body).await?;

        if let Some(updated) = rows.into_iter().next() {
            return Ok(updated);
        }

        // Nothing matched: either the entry is gone or someone linked it first.
        WaitlistStore::get_by_id(self, company_id, id).await?;
        Err(StoreError::VersionConflict {
            entity: "Waitlist entry",
            id,
        })
    }

    async fn list(&self, filter: WaitlistFilter) -> Result<Vec<WaitlistEntry>, StoreError> {
        let mut query_parts = vec![format!("company_id=eq.{}", filter.company_id)];
        if let Some(appointment_type) = filter.appointment_type {
            query_parts.push(format!("appointment_type=eq.{}", appointment_type));
        }
        if !filter.include_fulfilled {
            query_parts.push("fulfilled_appointment_id=is.null".to_string());
        }

        let path = format!(
            "/rest/v1/waitlist_entries?{}&order=priority.desc,created_at.asc",
            query_parts.join("&")
        );
        self.select(&path).await
    }
}

#[derive(Deserialize)]
struct IdRow {
    #[allow(dead_code)]
    id: Uuid,
}

#[derive(Deserialize)]
struct StaffRow {
    user_id: Uuid,
}

#[async_trait]
impl ClinicalRecordStore for SupabaseSchedulingStore {
    async fn find_examination_for_appointment(
        &self,
        company_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<Option<Examination>, StoreError> {
        let path = format!(
            "/rest/v1/examinations?appointment_id=eq.{}&company_id=eq.{}&select=*&limit=1",
            appointment_id, company_id
        );
        let rows: Vec<Examination> = self.select(&path).await?;
        Ok(rows.into_iter().next())
    }

    async fn create_examination(&self, examination: Examination) -> Result<Examination, StoreError> {
        let result = self
            .supabase
            .request_with_headers::<Vec<Examination>>(
                Method::POST,
                "/rest/v1/examinations",
                None,
                Some(to_body(&examination)?),
                Some(SupabaseClient::representation_headers()),
            )
            .await;

        match result {
            Ok(rows) => rows
                .into_iter()
                .next()
                .ok_or_else(|| StoreError::Backend("Failed to create examination".to_string())),
            // Unique constraint on appointment_id: another request created it first.
            Err(e) if is_conflict(&e) => {
                warn!(
                    "Examination for appointment {} already exists, reusing it",
                    examination.appointment_id
                );
                self.find_examination_for_appointment(examination.company_id, examination.appointment_id)
                    .await?
                    .ok_or_else(|| backend(e))
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn get_examination(&self, company_id: Uuid, id: Uuid) -> Result<Examination, StoreError> {
        let path = format!(
            "/rest/v1/examinations?id=eq.{}&company_id=eq.{}&select=*",
            id, company_id
        );
        let rows: Vec<Examination> = self.select(&path).await?;

        rows.into_iter().next().ok_or(StoreError::NotFound {
            entity: "Examination",
            id,
        })
    }

    async fn find_prescription_for_examination(
        &self,
        company_id: Uuid,
        examination_id: Uuid,
    ) -> Result<Option<Prescription>, StoreError> {
        let path = format!(
            "/rest/v1/prescriptions?examination_id=eq.{}&company_id=eq.{}&select=*&order=created_at.desc&limit=1",
            examination_id, company_id
        );
        let rows: Vec<Prescription> = self.select(&path).await?;
        Ok(rows.into_iter().next())
    }

    async fn has_order_for_appointment(
        &self,
        company_id: Uuid,
        appointment_id: Uuid,
    ) -> Result<bool, StoreError> {
        let path = format!(
            "/rest/v1/orders?appointment_id=eq.{}&company_id=eq.{}&select=id&limit=1",
            appointment_id, company_id
        );
        let rows: Vec<IdRow> = self.select(&path).await?;
        Ok(!rows.is_empty())
    }
}

#[async_trait]
impl StaffDirectory for SupabaseSchedulingStore {
    async fn active_dispensers(&self, company_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let path = format!(
            "/rest/v1/staff_members?company_id=eq.{}&role=eq.dispenser&is_active=eq.true&select=user_id",
            company_id
        );
        let rows: Vec<StaffRow> = self.select(&path).await?;
        Ok(rows.into_iter().map(|row| row.user_id).collect())
    }
}

/// Whether a backend failure was a PostgREST 409 (unique violation).
fn is_conflict(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SupabaseApiError>()
        .is_some_and(SupabaseApiError::is_conflict)
}
