#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use uuid::Uuid;

use scheduling_cell::error::{DeliveryError, StoreError};
use scheduling_cell::models::{
    Appointment, AppointmentFilter, AppointmentType, BookingOptions, CreateAppointmentRequest,
    NewAppointment, Notification, Page, WaitlistOffer, WorkflowEvent, WorkflowEventKind,
};
use scheduling_cell::services::dispatch::{
    CommunicationsGateway, EventBroadcaster, NotificationDispatcher, SideEffects,
};
use scheduling_cell::services::locking::{InProcessSlotLocks, SlotLockManager};
use scheduling_cell::store::{AppointmentStore, InMemoryStore};
use scheduling_cell::{SchedulingBackends, SchedulingState};
use shared_config::{AppConfig, SchedulingSettings};
use shared_utils::test_utils::TestConfig;

/// Captures everything the side channels were asked to deliver.
#[derive(Default)]
pub struct RecordingChannels {
    pub events: Mutex<Vec<WorkflowEvent>>,
    pub notifications: Mutex<Vec<(Vec<Uuid>, Notification)>>,
    pub reminders: Mutex<Vec<Uuid>>,
    pub offers: Mutex<Vec<WaitlistOffer>>,
}

impl RecordingChannels {
    pub fn event_kinds(&self, appointment_id: Uuid) -> Vec<WorkflowEventKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.appointment_id == appointment_id)
            .map(|e| e.event)
            .collect()
    }

    pub fn has_event(&self, appointment_id: Uuid, kind: WorkflowEventKind) -> bool {
        self.event_kinds(appointment_id).contains(&kind)
    }
}

#[async_trait]
impl EventBroadcaster for RecordingChannels {
    async fn broadcast_to_tenant(&self, _company_id: Uuid, event: WorkflowEvent) -> Result<(), DeliveryError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingChannels {
    async fn notify(&self, user_ids: &[Uuid], notification: Notification) -> Result<(), DeliveryError> {
        self.notifications
            .lock()
            .unwrap()
            .push((user_ids.to_vec(), notification));
        Ok(())
    }
}

#[async_trait]
impl CommunicationsGateway for RecordingChannels {
    async fn schedule_reminder(&self, appointment: &Appointment) -> Result<(), DeliveryError> {
        self.reminders.lock().unwrap().push(appointment.id);
        Ok(())
    }

    async fn offer_waitlist_slot(&self, offer: &WaitlistOffer) -> Result<(), DeliveryError> {
        self.offers.lock().unwrap().push(offer.clone());
        Ok(())
    }
}

/// The in-memory store, but every listing takes `delay` to answer. Widens
/// the window between a conflict check and the write that follows it.
pub struct SlowListingStore {
    inner: Arc<InMemoryStore>,
    delay: StdDuration,
}

#[async_trait]
impl AppointmentStore for SlowListingStore {
    async fn create(&self, appointment: Appointment) -> Result<Appointment, StoreError> {
        AppointmentStore::create(self.inner.as_ref(), appointment).await
    }

    async fn get_by_id(&self, company_id: Uuid, id: Uuid) -> Result<Appointment, StoreError> {
        AppointmentStore::get_by_id(self.inner.as_ref(), company_id, id).await
    }

    async fn update(&self, appointment: Appointment) -> Result<Appointment, StoreError> {
        AppointmentStore::update(self.inner.as_ref(), appointment).await
    }

    async fn list(&self, filter: AppointmentFilter) -> Result<Page<Appointment>, StoreError> {
        tokio::time::sleep(self.delay).await;
        AppointmentStore::list(self.inner.as_ref(), filter).await
    }
}

pub struct Harness {
    pub config: Arc<AppConfig>,
    pub store: Arc<InMemoryStore>,
    pub locks: Arc<InProcessSlotLocks>,
    pub channels: Arc<RecordingChannels>,
    pub state: SchedulingState,
    pub company_id: Uuid,
    pub practitioner_id: Uuid,
    pub staff_id: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(SchedulingSettings::default())
    }

    pub fn with_settings(settings: SchedulingSettings) -> Self {
        let channels = Arc::new(RecordingChannels::default());
        let effects = SideEffects::new(channels.clone(), channels.clone(), channels.clone());
        Self::with_effects(settings, channels, effects)
    }

    /// Appointment listings answer after `delay`, so concurrent requests
    /// overlap inside their critical sections.
    pub fn with_slow_listing(delay: StdDuration) -> Self {
        let channels = Arc::new(RecordingChannels::default());
        let effects = SideEffects::new(channels.clone(), channels.clone(), channels.clone());
        Self::build(SchedulingSettings::default(), channels, effects, Some(delay))
    }

    pub fn with_effects(
        settings: SchedulingSettings,
        channels: Arc<RecordingChannels>,
        effects: SideEffects,
    ) -> Self {
        Self::build(settings, channels, effects, None)
    }

    fn build(
        settings: SchedulingSettings,
        channels: Arc<RecordingChannels>,
        effects: SideEffects,
        listing_delay: Option<StdDuration>,
    ) -> Self {
        let mut config = TestConfig::default().to_app_config();
        config.scheduling = settings;
        let config = Arc::new(config);

        let store = Arc::new(InMemoryStore::new());
        let locks = Arc::new(InProcessSlotLocks::from_settings(&config.scheduling));
        let lock_manager: Arc<dyn SlotLockManager> = locks.clone();
        let mut backends = SchedulingBackends::in_memory(store.clone(), lock_manager);
        if let Some(delay) = listing_delay {
            backends.appointments = Arc::new(SlowListingStore {
                inner: store.clone(),
                delay,
            });
        }
        let state = SchedulingState::new(config.clone(), backends, effects);

        Self {
            config,
            store,
            locks,
            channels,
            state,
            company_id: Uuid::new_v4(),
            practitioner_id: Uuid::new_v4(),
            staff_id: Uuid::new_v4(),
        }
    }

    pub fn booking(&self, start: DateTime<Utc>, minutes: i64) -> CreateAppointmentRequest {
        CreateAppointmentRequest {
            appointment: NewAppointment {
                patient_id: Uuid::new_v4(),
                practitioner_id: Some(self.practitioner_id),
                appointment_type: AppointmentType::Examination,
                start_time: start,
                end_time: start + Duration::minutes(minutes),
                duration_minutes: Some(minutes),
                location: Some("Room 1".to_string()),
                is_virtual: false,
                notes: None,
            },
            options: BookingOptions::default(),
        }
    }

    pub async fn book(&self, start: DateTime<Utc>, minutes: i64) -> Appointment {
        self.state
            .scheduling
            .create_appointment(self.company_id, self.booking(start, minutes), self.staff_id)
            .await
            .expect("booking should succeed")
    }

    /// Booked and checked in, ready for the exam.
    pub async fn arrived(&self, start: DateTime<Utc>) -> Appointment {
        let appointment = self.book(start, 30).await;
        self.state
            .workflow
            .check_in(self.company_id, appointment.id, self.staff_id)
            .await
            .expect("check-in should succeed")
    }
}

/// A date safely in the future so freed capacity is worth offering.
pub fn future_day(days_ahead: i64) -> NaiveDate {
    Utc::now().date_naive() + Duration::days(days_ahead)
}

pub fn at(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    date.and_hms_opt(hour, minute, 0).unwrap().and_utc()
}

/// Polls `check` until it holds or a second has passed. Side effects run on
/// spawned tasks, so assertions on them have to wait.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    check()
}
