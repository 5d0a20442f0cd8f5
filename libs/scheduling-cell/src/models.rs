// libs/scheduling-cell/src/models.rs
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ==============================================================================
// CORE APPOINTMENT MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    pub id: Uuid,
    pub company_id: Uuid,
    pub patient_id: Uuid,
    pub practitioner_id: Option<Uuid>,
    pub appointment_type: AppointmentType,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_minutes: i64,
    pub status: AppointmentStatus,
    pub location: Option<String>,
    #[serde(default)]
    pub is_virtual: bool,
    /// Set when the booking was made with `allow_overlapping`. Rescheduling
    /// such a booking skips the conflict check too.
    #[serde(default)]
    pub allow_overlap: bool,
    #[serde(default)]
    pub notes: Vec<AuditNote>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub created_by: Uuid,
    pub updated_by: Option<Uuid>,
    /// Optimistic concurrency token, bumped by the store on every update.
    #[serde(default)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    pub fn interval(&self) -> Interval {
        Interval::new(self.start_time, self.end_time)
    }

    pub fn append_note(&mut self, by: Uuid, event: WorkflowEventKind, message: impl Into<String>) {
        self.notes.push(AuditNote {
            at: Utc::now(),
            by,
            event,
            message: message.into(),
        });
    }

    /// Marks the record as modified by `by`. The store owns `version`.
    pub fn touch(&mut self, by: Uuid) {
        self.updated_by = Some(by);
        self.updated_at = Utc::now();
    }
}

/// One entry of the append-only handoff trail kept on each appointment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditNote {
    pub at: DateTime<Utc>,
    pub by: Uuid,
    pub event: WorkflowEventKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
    Rescheduled,
}

impl AppointmentStatus {
    /// Legal next states. Completed and cancelled are terminal.
    pub fn valid_transitions(&self) -> &'static [AppointmentStatus] {
        use AppointmentStatus::*;
        match self {
            Scheduled => &[Confirmed, Cancelled, NoShow, Rescheduled],
            Confirmed => &[InProgress, Cancelled, NoShow, Rescheduled],
            InProgress => &[Completed, Cancelled, NoShow, Rescheduled],
            Rescheduled => &[Scheduled, Confirmed, Cancelled, NoShow],
            NoShow => &[Cancelled],
            Completed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: AppointmentStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Active bookings occupy practitioner time.
    pub fn is_active(&self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled | AppointmentStatus::NoShow)
    }

    pub fn is_terminal(&self) -> bool {
        self.valid_transitions().is_empty()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::InProgress => "in_progress",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
            AppointmentStatus::Rescheduled => "rescheduled",
        }
    }

    pub fn active_statuses() -> Vec<AppointmentStatus> {
        use AppointmentStatus::*;
        vec![Scheduled, Confirmed, InProgress, Completed, Rescheduled]
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentType {
    Examination,
    Fitting,
    FollowUp,
    Emergency,
    ContactLensCheck,
    Collection,
    Other,
}

impl AppointmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentType::Examination => "examination",
            AppointmentType::Fitting => "fitting",
            AppointmentType::FollowUp => "follow_up",
            AppointmentType::Emergency => "emergency",
            AppointmentType::ContactLensCheck => "contact_lens_check",
            AppointmentType::Collection => "collection",
            AppointmentType::Other => "other",
        }
    }
}

impl fmt::Display for AppointmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==============================================================================
// TIME MODELS
// ==============================================================================

/// Longest buffer accepted around a booking.
pub const MAX_BUFFER_MINUTES: i64 = 24 * 60;

/// Widest waitlist date window on either side of the preferred date.
pub const MAX_FLEXIBILITY_DAYS: i64 = 365;

/// Half-open `[start, end)` time range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Widened by `buffer` on both sides, saturating at the representable
    /// range.
    pub fn padded(&self, buffer: Duration) -> Interval {
        Interval::new(
            self.start
                .checked_sub_signed(buffer)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            self.end
                .checked_add_signed(buffer)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    pub fn clip(&self, bounds: &Interval) -> Option<Interval> {
        let clipped = Interval::new(self.start.max(bounds.start), self.end.min(bounds.end));
        (!clipped.is_empty()).then_some(clipped)
    }
}

/// Opening hours of a practitioner for one day, in clinic wall-clock time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkingHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl WorkingHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn on(&self, date: NaiveDate) -> Interval {
        Interval::new(
            date.and_time(self.start).and_utc(),
            date.and_time(self.end).and_utc(),
        )
    }
}

/// A bookable candidate of exactly the requested duration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

// ==============================================================================
// REQUEST MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAppointment {
    pub patient_id: Uuid,
    pub practitioner_id: Option<Uuid>,
    pub appointment_type: AppointmentType,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Derived from the interval when omitted.
    pub duration_minutes: Option<i64>,
    pub location: Option<String>,
    #[serde(default)]
    pub is_virtual: bool,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookingOptions {
    #[serde(default)]
    pub allow_overlapping: bool,
    /// Falls back to `SchedulingSettings::require_confirmation`.
    pub require_confirmation: Option<bool>,
    #[serde(default)]
    pub send_reminders: bool,
    /// Falls back to `SchedulingSettings::default_buffer_minutes`.
    pub buffer_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAppointmentRequest {
    #[serde(flatten)]
    pub appointment: NewAppointment,
    #[serde(default)]
    pub options: BookingOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleAppointmentRequest {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelAppointmentRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateAppointmentDetails {
    pub appointment_type: Option<AppointmentType>,
    pub location: Option<String>,
    pub is_virtual: Option<bool>,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppointmentFilter {
    pub company_id: Uuid,
    pub patient_id: Option<Uuid>,
    pub practitioner_id: Option<Uuid>,
    pub statuses: Vec<AppointmentStatus>,
    /// Keeps appointments whose `[start, end)` overlaps this range.
    pub overlapping: Option<Interval>,
    /// 1-based.
    pub page: u32,
    pub limit: u32,
}

impl AppointmentFilter {
    pub const MAX_LIMIT: u32 = 500;

    pub fn for_company(company_id: Uuid) -> Self {
        Self {
            company_id,
            patient_id: None,
            practitioner_id: None,
            statuses: Vec::new(),
            overlapping: None,
            page: 1,
            limit: 50,
        }
    }

    pub fn practitioner(mut self, practitioner_id: Uuid) -> Self {
        self.practitioner_id = Some(practitioner_id);
        self
    }

    pub fn active_only(mut self) -> Self {
        self.statuses = AppointmentStatus::active_statuses();
        self
    }

    pub fn overlapping(mut self, range: Interval) -> Self {
        self.overlapping = Some(range);
        self
    }

    /// One page large enough for a practitioner's day.
    pub fn unpaged(mut self) -> Self {
        self.page = 1;
        self.limit = Self::MAX_LIMIT;
        self
    }

    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, Self::MAX_LIMIT)
    }

    pub fn offset(&self) -> usize {
        (self.page.max(1) as usize - 1) * self.effective_limit() as usize
    }

    pub fn matches(&self, appointment: &Appointment) -> bool {
        appointment.company_id == self.company_id
            && self.patient_id.map_or(true, |id| appointment.patient_id == id)
            && self
                .practitioner_id
                .map_or(true, |id| appointment.practitioner_id == Some(id))
            && (self.statuses.is_empty() || self.statuses.contains(&appointment.status))
            && self
                .overlapping
                .map_or(true, |range| appointment.interval().overlaps(&range))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

// ==============================================================================
// AVAILABILITY MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotQuery {
    pub practitioner_id: Uuid,
    pub date: NaiveDate,
    pub duration_minutes: i64,
    pub step_minutes: Option<i64>,
    pub buffer_minutes: Option<i64>,
    pub day_start: Option<NaiveTime>,
    pub day_end: Option<NaiveTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableSlots {
    pub practitioner_id: Uuid,
    pub date: NaiveDate,
    pub duration_minutes: i64,
    pub free_intervals: Vec<Interval>,
    pub slots: Vec<Slot>,
}

#[derive(Debug, Clone)]
pub struct ConflictQuery {
    pub company_id: Uuid,
    pub practitioner_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub buffer_minutes: i64,
    pub allow_overlapping: bool,
    pub exclude_appointment_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityCheck {
    pub available: bool,
    pub conflicts: Vec<Appointment>,
}

// ==============================================================================
// WAITLIST MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaitlistEntry {
    pub id: Uuid,
    pub company_id: Uuid,
    pub patient_id: Uuid,
    pub appointment_type: AppointmentType,
    pub preferred_date: Option<NaiveDate>,
    pub preferred_time_range: Option<TimeOfDay>,
    pub flexibility_days: i64,
    pub contact_method: ContactMethod,
    pub contact_value: String,
    pub priority: i32,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub fulfilled_appointment_id: Option<Uuid>,
    pub fulfilled_at: Option<DateTime<Utc>>,
}

impl WaitlistEntry {
    pub fn is_fulfilled(&self) -> bool {
        self.fulfilled_appointment_id.is_some()
    }

    /// `preferred_date ± flexibility_days`; `None` means any date.
    pub fn date_window(&self) -> Option<(NaiveDate, NaiveDate)> {
        self.preferred_date.map(|date| {
            let flex = Duration::days(self.flexibility_days.clamp(0, MAX_FLEXIBILITY_DAYS));
            (
                date.checked_sub_signed(flex).unwrap_or(NaiveDate::MIN),
                date.checked_add_signed(flex).unwrap_or(NaiveDate::MAX),
            )
        })
    }

    /// True once `preferred_date + flexibility_days` lies before `today`.
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.date_window().is_some_and(|(_, last)| last < today)
    }

    pub fn accepts(&self, interval: &Interval) -> bool {
        let date_ok = match self.date_window() {
            Some((first, last)) => {
                let start = interval.start.date_naive();
                let end = interval.end.date_naive();
                start <= last && end >= first
            }
            None => true,
        };

        let band_ok = match self.preferred_time_range {
            Some(band) => band.overlaps(interval),
            None => true,
        };

        date_ok && band_ok
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
}

impl TimeOfDay {
    pub fn bounds(&self) -> (NaiveTime, NaiveTime) {
        let at = |h| NaiveTime::from_hms_opt(h, 0, 0).unwrap_or(NaiveTime::MIN);
        match self {
            TimeOfDay::Morning => (at(6), at(12)),
            TimeOfDay::Afternoon => (at(12), at(17)),
            TimeOfDay::Evening => (at(17), at(21)),
        }
    }

    /// Whether the band on the interval's start date overlaps the interval.
    pub fn overlaps(&self, interval: &Interval) -> bool {
        let (start, end) = self.bounds();
        let date = interval.start.date_naive();
        WorkingHours::new(start, end).on(date).overlaps(interval)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContactMethod {
    Email,
    Sms,
    Phone,
    Whatsapp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWaitlistEntry {
    pub patient_id: Uuid,
    pub appointment_type: AppointmentType,
    pub preferred_date: Option<NaiveDate>,
    pub preferred_time_range: Option<TimeOfDay>,
    pub flexibility_days: Option<i64>,
    pub contact_method: ContactMethod,
    pub contact_value: String,
    pub priority: Option<i32>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WaitlistFilter {
    pub company_id: Uuid,
    pub appointment_type: Option<AppointmentType>,
    pub include_fulfilled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfillWaitlistRequest {
    pub appointment_id: Uuid,
}

/// Capacity released by a cancellation or a reschedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreedSlot {
    pub company_id: Uuid,
    pub practitioner_id: Option<Uuid>,
    pub appointment_type: AppointmentType,
    pub interval: Interval,
}

/// What the communications collaborator receives for the top candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitlistOffer {
    pub entry: WaitlistEntry,
    pub slot: FreedSlot,
    /// Remaining candidates in rank order, for staff follow-up.
    pub ranked_candidates: Vec<Uuid>,
}

// ==============================================================================
// WORKFLOW MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEventKind {
    Created,
    Updated,
    Rescheduled,
    Cancelled,
    CheckedIn,
    ExamStarted,
    ExamCompleted,
    ReadyForDispense,
    OrderCreated,
    NoShow,
}

impl WorkflowEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowEventKind::Created => "created",
            WorkflowEventKind::Updated => "updated",
            WorkflowEventKind::Rescheduled => "rescheduled",
            WorkflowEventKind::Cancelled => "cancelled",
            WorkflowEventKind::CheckedIn => "checked_in",
            WorkflowEventKind::ExamStarted => "exam_started",
            WorkflowEventKind::ExamCompleted => "exam_completed",
            WorkflowEventKind::ReadyForDispense => "ready_for_dispense",
            WorkflowEventKind::OrderCreated => "order_created",
            WorkflowEventKind::NoShow => "no_show",
        }
    }
}

impl fmt::Display for WorkflowEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ephemeral event handed to the broadcaster. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub appointment_id: Uuid,
    pub company_id: Uuid,
    pub event: WorkflowEventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    pub fn new(appointment: &Appointment, event: WorkflowEventKind, payload: Value) -> Self {
        Self {
            appointment_id: appointment.id,
            company_id: appointment.company_id,
            event,
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub company_id: Uuid,
    pub appointment_id: Uuid,
    pub title: String,
    pub message: String,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CheckedIn,
    InExam,
    ReadyForDispense,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageQueueEntry {
    pub appointment: Appointment,
    pub stage: Stage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Examination {
    pub id: Uuid,
    pub company_id: Uuid,
    pub appointment_id: Uuid,
    pub patient_id: Uuid,
    pub practitioner_id: Option<Uuid>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrescriptionStatus {
    Draft,
    Verified,
    Signed,
}

impl PrescriptionStatus {
    /// Verified and signed prescriptions can go to the dispenser.
    pub fn is_released(&self) -> bool {
        matches!(self, PrescriptionStatus::Verified | PrescriptionStatus::Signed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prescription {
    pub id: Uuid,
    pub company_id: Uuid,
    pub examination_id: Uuid,
    pub status: PrescriptionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteExamRequest {
    pub examination_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreatedRequest {
    pub order_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamStartOutcome {
    pub appointment: Appointment,
    pub examination: Examination,
    pub already_started: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamCompleteOutcome {
    pub appointment: Appointment,
    pub ready_for_dispense: bool,
}
