// libs/scheduling-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use shared_models::auth::User;
use shared_models::error::AppError;
use shared_utils::extractor::{require_company, require_user_id};

use crate::models::{
    AppointmentFilter, AppointmentStatus, AppointmentType, CancelAppointmentRequest,
    CompleteExamRequest, CreateAppointmentRequest, FulfillWaitlistRequest, Interval,
    NewWaitlistEntry, OrderCreatedRequest, RescheduleAppointmentRequest, SlotQuery, Stage,
    UpdateAppointmentDetails,
};
use crate::state::SchedulingState;

// ==============================================================================
// QUERY PARAMETER STRUCTS
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct AppointmentListQuery {
    pub patient_id: Option<Uuid>,
    pub practitioner_id: Option<Uuid>,
    pub status: Option<AppointmentStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityCheckQuery {
    pub practitioner_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub buffer_minutes: Option<i64>,
    pub exclude_appointment_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct StageQueueQuery {
    pub date: NaiveDate,
    pub stage: Option<Stage>,
}

#[derive(Debug, Deserialize)]
pub struct WaitlistListQuery {
    pub appointment_type: Option<AppointmentType>,
    #[serde(default)]
    pub include_fulfilled: bool,
}

fn caller(user: &User) -> Result<(Uuid, Uuid), AppError> {
    Ok((require_company(user)?, require_user_id(user)?))
}

// ==============================================================================
// APPOINTMENT HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn create_appointment(
    State(state): State<Arc<SchedulingState>>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateAppointmentRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let (company_id, user_id) = caller(&user)?;

    let appointment = state
        .scheduling
        .create_appointment(company_id, request, user_id)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "appointment": appointment,
            "message": "Appointment booked successfully"
        })),
    ))
}

#[axum::debug_handler]
pub async fn list_appointments(
    State(state): State<Arc<SchedulingState>>,
    Extension(user): Extension<User>,
    Query(query): Query<AppointmentListQuery>,
) -> Result<Json<Value>, AppError> {
    let company_id = require_company(&user)?;

    let mut filter = AppointmentFilter::for_company(company_id);
    filter.patient_id = query.patient_id;
    filter.practitioner_id = query.practitioner_id;
    if let Some(status) = query.status {
        filter.statuses = vec![status];
    }
    if let Some(page) = query.page {
        filter.page = page;
    }
    if let Some(limit) = query.limit {
        filter.limit = limit;
    }
    match (query.from, query.to) {
        (Some(from), Some(to)) if to > from => filter.overlapping = Some(Interval::new(from, to)),
        (None, None) => {}
        _ => {
            return Err(AppError::ValidationError(
                "from and to must be given together, with to after from".to_string(),
            ))
        }
    }

    let page = state.scheduling.list_appointments(filter).await?;

    Ok(Json(json!({
        "success": true,
        "appointments": page.items,
        "total": page.total,
        "page": page.page,
        "limit": page.limit
    })))
}

#[axum::debug_handler]
pub async fn get_appointment(
    State(state): State<Arc<SchedulingState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let company_id = require_company(&user)?;

    let appointment = state
        .scheduling
        .get_appointment(company_id, appointment_id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment
    })))
}

#[axum::debug_handler]
pub async fn update_appointment(
    State(state): State<Arc<SchedulingState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(changes): Json<UpdateAppointmentDetails>,
) -> Result<Json<Value>, AppError> {
    let (company_id, user_id) = caller(&user)?;

    let appointment = state
        .scheduling
        .update_details(company_id, appointment_id, changes, user_id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment updated"
    })))
}

#[axum::debug_handler]
pub async fn reschedule_appointment(
    State(state): State<Arc<SchedulingState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<RescheduleAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let (company_id, user_id) = caller(&user)?;

    let appointment = state
        .scheduling
        .reschedule_appointment(
            company_id,
            appointment_id,
            request.start_time,
            request.end_time,
            request.reason,
            user_id,
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment rescheduled"
    })))
}

#[axum::debug_handler]
pub async fn cancel_appointment(
    State(state): State<Arc<SchedulingState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<CancelAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let (company_id, user_id) = caller(&user)?;

    let appointment = state
        .scheduling
        .cancel_appointment(company_id, appointment_id, &request.reason, user_id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment cancelled"
    })))
}

// ==============================================================================
// WORKFLOW HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn check_in(
    State(state): State<Arc<SchedulingState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let (company_id, user_id) = caller(&user)?;

    let appointment = state
        .workflow
        .check_in(company_id, appointment_id, user_id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Patient checked in"
    })))
}

#[axum::debug_handler]
pub async fn start_exam(
    State(state): State<Arc<SchedulingState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let (company_id, user_id) = caller(&user)?;

    let outcome = state
        .workflow
        .start_exam(company_id, appointment_id, user_id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": outcome.appointment,
        "examination": outcome.examination,
        "already_started": outcome.already_started
    })))
}

#[axum::debug_handler]
pub async fn complete_exam(
    State(state): State<Arc<SchedulingState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<CompleteExamRequest>,
) -> Result<Json<Value>, AppError> {
    let (company_id, user_id) = caller(&user)?;

    let outcome = state
        .workflow
        .complete_exam(company_id, appointment_id, request.examination_id, user_id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": outcome.appointment,
        "ready_for_dispense": outcome.ready_for_dispense
    })))
}

#[axum::debug_handler]
pub async fn record_order(
    State(state): State<Arc<SchedulingState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<OrderCreatedRequest>,
) -> Result<Json<Value>, AppError> {
    let (company_id, user_id) = caller(&user)?;

    let appointment = state
        .workflow
        .record_order(company_id, appointment_id, request.order_id, user_id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment
    })))
}

#[axum::debug_handler]
pub async fn mark_no_show(
    State(state): State<Arc<SchedulingState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let (company_id, user_id) = caller(&user)?;

    let appointment = state
        .workflow
        .mark_no_show(company_id, appointment_id, user_id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment
    })))
}

#[axum::debug_handler]
pub async fn stage_queue(
    State(state): State<Arc<SchedulingState>>,
    Extension(user): Extension<User>,
    Query(query): Query<StageQueueQuery>,
) -> Result<Json<Value>, AppError> {
    let company_id = require_company(&user)?;

    let queue = state
        .workflow
        .stage_queue(company_id, query.date, query.stage)
        .await?;

    Ok(Json(json!({
        "success": true,
        "date": query.date,
        "queue": queue,
        "total": queue.len()
    })))
}

// ==============================================================================
// AVAILABILITY HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn check_availability(
    State(state): State<Arc<SchedulingState>>,
    Extension(user): Extension<User>,
    Query(query): Query<AvailabilityCheckQuery>,
) -> Result<Json<Value>, AppError> {
    let company_id = require_company(&user)?;

    let check = state
        .availability
        .check_availability(
            company_id,
            query.practitioner_id,
            query.start_time,
            query.end_time,
            query.buffer_minutes,
            query.exclude_appointment_id,
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "available": check.available,
        "conflicts": check.conflicts
    })))
}

#[axum::debug_handler]
pub async fn available_slots(
    State(state): State<Arc<SchedulingState>>,
    Extension(user): Extension<User>,
    Query(query): Query<SlotQuery>,
) -> Result<Json<Value>, AppError> {
    let company_id = require_company(&user)?;

    let available = state.availability.available_slots(company_id, &query).await?;

    Ok(Json(json!({
        "success": true,
        "availability": available,
        "total_slots": available.slots.len()
    })))
}

// ==============================================================================
// WAITLIST HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn add_to_waitlist(
    State(state): State<Arc<SchedulingState>>,
    Extension(user): Extension<User>,
    Json(request): Json<NewWaitlistEntry>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let company_id = require_company(&user)?;

    let entry = state.waitlist.add_to_waitlist(company_id, request).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "entry": entry,
            "message": "Patient added to waitlist"
        })),
    ))
}

#[axum::debug_handler]
pub async fn list_waitlist(
    State(state): State<Arc<SchedulingState>>,
    Extension(user): Extension<User>,
    Query(query): Query<WaitlistListQuery>,
) -> Result<Json<Value>, AppError> {
    let company_id = require_company(&user)?;

    let entries = state
        .waitlist
        .list_waitlist(company_id, query.appointment_type, query.include_fulfilled)
        .await?;

    Ok(Json(json!({
        "success": true,
        "entries": entries,
        "total": entries.len()
    })))
}

#[axum::debug_handler]
pub async fn fulfill_waitlist_entry(
    State(state): State<Arc<SchedulingState>>,
    Path(entry_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<FulfillWaitlistRequest>,
) -> Result<Json<Value>, AppError> {
    let company_id = require_company(&user)?;

    let entry = state
        .waitlist
        .fulfill_waitlist_entry(company_id, entry_id, request.appointment_id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "entry": entry,
        "message": "Waitlist entry fulfilled"
    })))
}
