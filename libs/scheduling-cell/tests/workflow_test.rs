mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::Utc;
use mockall::mock;
use shared_config::SchedulingSettings;
use uuid::Uuid;

use scheduling_cell::error::{DeliveryError, SchedulingError};
use scheduling_cell::models::{
    AppointmentStatus, Notification, Prescription, PrescriptionStatus, Stage, WorkflowEvent,
    WorkflowEventKind,
};
use scheduling_cell::services::dispatch::{EventBroadcaster, NotificationDispatcher, SideEffects};
use scheduling_cell::store::AppointmentStore;

use common::{at, eventually, future_day, Harness, RecordingChannels};

mock! {
    pub Broadcaster {}

    #[async_trait]
    impl EventBroadcaster for Broadcaster {
        async fn broadcast_to_tenant(&self, company_id: Uuid, event: WorkflowEvent) -> Result<(), DeliveryError>;
    }
}

mock! {
    pub Notifier {}

    #[async_trait]
    impl NotificationDispatcher for Notifier {
        async fn notify(&self, user_ids: &[Uuid], notification: Notification) -> Result<(), DeliveryError>;
    }
}

async fn release_prescription(h: &Harness, examination_id: Uuid, status: PrescriptionStatus) {
    h.store
        .insert_prescription(Prescription {
            id: Uuid::new_v4(),
            company_id: h.company_id,
            examination_id,
            status,
            created_at: Utc::now(),
        })
        .await;
}

#[tokio::test]
async fn test_full_handoff_reception_to_dispenser() {
    let h = Harness::new();
    let day = future_day(2);
    let dispenser = Uuid::new_v4();
    h.store.add_dispenser(h.company_id, dispenser).await;

    let arrived = h.arrived(at(day, 9, 0)).await;
    assert_eq!(arrived.status, AppointmentStatus::Confirmed);
    assert!(arrived.checked_in_at.is_some());

    let queue = h.state.workflow.stage_queue(h.company_id, day, None).await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].stage, Stage::CheckedIn);

    let started = h
        .state
        .workflow
        .start_exam(h.company_id, arrived.id, h.staff_id)
        .await
        .unwrap();
    assert!(!started.already_started);
    assert_eq!(started.appointment.status, AppointmentStatus::InProgress);

    let queue = h.state.workflow.stage_queue(h.company_id, day, None).await.unwrap();
    assert_eq!(queue[0].stage, Stage::InExam);

    release_prescription(&h, started.examination.id, PrescriptionStatus::Signed).await;

    let completed = h
        .state
        .workflow
        .complete_exam(h.company_id, arrived.id, started.examination.id, h.staff_id)
        .await
        .unwrap();
    assert!(completed.ready_for_dispense);
    assert_eq!(completed.appointment.status, AppointmentStatus::Completed);

    let channels = h.channels.clone();
    assert!(eventually(|| channels.has_event(arrived.id, WorkflowEventKind::ReadyForDispense)).await);
    let channels = h.channels.clone();
    assert!(eventually(|| {
        channels
            .notifications
            .lock()
            .unwrap()
            .iter()
            .any(|(users, n)| users == &vec![dispenser] && n.appointment_id == arrived.id)
    })
    .await);
    assert!(!h.channels.has_event(arrived.id, WorkflowEventKind::ExamCompleted));

    let ready = h
        .state
        .workflow
        .stage_queue(h.company_id, day, Some(Stage::ReadyForDispense))
        .await
        .unwrap();
    assert_eq!(ready.len(), 1);

    let order_id = Uuid::new_v4();
    let after_order = h
        .state
        .workflow
        .record_order(h.company_id, arrived.id, order_id, h.staff_id)
        .await
        .unwrap();
    assert_eq!(after_order.status, AppointmentStatus::Completed);
    assert_eq!(after_order.notes.last().unwrap().event, WorkflowEventKind::OrderCreated);

    h.store.insert_order(arrived.id, order_id).await;
    let queue = h.state.workflow.stage_queue(h.company_id, day, None).await.unwrap();
    assert!(queue.is_empty());

    let trail: Vec<_> = after_order.notes.iter().map(|n| n.event).collect();
    assert_eq!(
        trail,
        vec![
            WorkflowEventKind::Created,
            WorkflowEventKind::CheckedIn,
            WorkflowEventKind::ExamStarted,
            WorkflowEventKind::ExamCompleted,
            WorkflowEventKind::OrderCreated,
        ]
    );
}

#[tokio::test]
async fn test_draft_prescription_only_completes_exam() {
    let h = Harness::new();
    let dispenser = Uuid::new_v4();
    h.store.add_dispenser(h.company_id, dispenser).await;

    let arrived = h.arrived(at(future_day(2), 10, 0)).await;
    let started = h
        .state
        .workflow
        .start_exam(h.company_id, arrived.id, h.staff_id)
        .await
        .unwrap();
    release_prescription(&h, started.examination.id, PrescriptionStatus::Draft).await;

    let completed = h
        .state
        .workflow
        .complete_exam(h.company_id, arrived.id, started.examination.id, h.staff_id)
        .await
        .unwrap();
    assert!(!completed.ready_for_dispense);

    let channels = h.channels.clone();
    assert!(eventually(|| channels.has_event(arrived.id, WorkflowEventKind::ExamCompleted)).await);
    assert!(!h.channels.has_event(arrived.id, WorkflowEventKind::ReadyForDispense));
    assert!(h.channels.notifications.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_exam_complete_from_scheduled_is_invalid() {
    let h = Harness::new();
    let appointment = h.book(at(future_day(2), 11, 0), 30).await;
    assert_eq!(appointment.status, AppointmentStatus::Scheduled);

    let result = h
        .state
        .workflow
        .complete_exam(h.company_id, appointment.id, Uuid::new_v4(), h.staff_id)
        .await;
    assert_matches!(
        result,
        Err(SchedulingError::InvalidTransition {
            status: AppointmentStatus::Scheduled,
            ..
        })
    );

    let unchanged = h
        .state
        .scheduling
        .get_appointment(h.company_id, appointment.id)
        .await
        .unwrap();
    assert_eq!(unchanged.status, AppointmentStatus::Scheduled);
}

#[tokio::test]
async fn test_exam_start_requires_check_in_state() {
    let h = Harness::new();
    let appointment = h.book(at(future_day(2), 11, 0), 30).await;

    let result = h
        .state
        .workflow
        .start_exam(h.company_id, appointment.id, h.staff_id)
        .await;
    assert_matches!(result, Err(SchedulingError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_concurrent_exam_start_creates_one_examination() {
    let h = Harness::new();
    let arrived = h.arrived(at(future_day(2), 12, 0)).await;

    let first = {
        let workflow = Arc::clone(&h.state.workflow);
        let (company_id, id, by) = (h.company_id, arrived.id, h.staff_id);
        tokio::spawn(async move { workflow.start_exam(company_id, id, by).await })
    };
    let second = {
        let workflow = Arc::clone(&h.state.workflow);
        let (company_id, id, by) = (h.company_id, arrived.id, h.staff_id);
        tokio::spawn(async move { workflow.start_exam(company_id, id, by).await })
    };

    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();

    assert_eq!(a.examination.id, b.examination.id);
    assert!(a.already_started ^ b.already_started);
}

#[tokio::test]
async fn test_complete_with_foreign_examination_rejected() {
    let h = Harness::new();
    let day = future_day(2);
    let first = h.arrived(at(day, 9, 0)).await;
    let second = h.arrived(at(day, 11, 0)).await;

    h.state
        .workflow
        .start_exam(h.company_id, first.id, h.staff_id)
        .await
        .unwrap();
    let other = h
        .state
        .workflow
        .start_exam(h.company_id, second.id, h.staff_id)
        .await
        .unwrap();

    let result = h
        .state
        .workflow
        .complete_exam(h.company_id, first.id, other.examination.id, h.staff_id)
        .await;
    assert_matches!(result, Err(SchedulingError::Validation(_)));
}

#[tokio::test]
async fn test_repeat_check_in_keeps_arrival_time() {
    let h = Harness::new();
    let arrived = h.arrived(at(future_day(2), 9, 30)).await;

    let again = h
        .state
        .workflow
        .check_in(h.company_id, arrived.id, h.staff_id)
        .await
        .unwrap();
    assert_eq!(again.checked_in_at, arrived.checked_in_at);
}

#[tokio::test]
async fn test_no_show_blocks_check_in() {
    let h = Harness::new();
    let appointment = h.book(at(future_day(2), 15, 0), 30).await;

    let missed = h
        .state
        .workflow
        .mark_no_show(h.company_id, appointment.id, h.staff_id)
        .await
        .unwrap();
    assert_eq!(missed.status, AppointmentStatus::NoShow);

    let result = h
        .state
        .workflow
        .check_in(h.company_id, appointment.id, h.staff_id)
        .await;
    assert_matches!(
        result,
        Err(SchedulingError::InvalidTransition {
            status: AppointmentStatus::NoShow,
            ..
        })
    );
}

#[tokio::test]
async fn test_no_show_follows_transition_graph() {
    let h = Harness::new();
    let day = future_day(2);

    let examined = h.arrived(at(day, 9, 0)).await;
    h.state
        .workflow
        .start_exam(h.company_id, examined.id, h.staff_id)
        .await
        .unwrap();
    assert_matches!(
        h.state
            .workflow
            .mark_no_show(h.company_id, examined.id, h.staff_id)
            .await,
        Err(SchedulingError::InvalidTransition {
            status: AppointmentStatus::InProgress,
            ..
        })
    );

    // In progress with no examination on record: the patient never showed.
    let stalled = h.book(at(day, 11, 0), 30).await;
    let mut in_progress = stalled.clone();
    in_progress.status = AppointmentStatus::InProgress;
    AppointmentStore::update(h.store.as_ref(), in_progress)
        .await
        .unwrap();

    let missed = h
        .state
        .workflow
        .mark_no_show(h.company_id, stalled.id, h.staff_id)
        .await
        .unwrap();
    assert_eq!(missed.status, AppointmentStatus::NoShow);

    assert_matches!(
        h.state
            .workflow
            .mark_no_show(h.company_id, stalled.id, h.staff_id)
            .await,
        Err(SchedulingError::InvalidTransition {
            status: AppointmentStatus::NoShow,
            ..
        })
    );
}

#[tokio::test]
async fn test_cancel_guards() {
    let h = Harness::new();
    let appointment = h.book(at(future_day(2), 16, 0), 30).await;

    let blank = h
        .state
        .workflow
        .cancel(h.company_id, appointment.id, "   ", h.staff_id)
        .await;
    assert_matches!(blank, Err(SchedulingError::Validation(_)));

    let cancelled = h
        .state
        .workflow
        .cancel(h.company_id, appointment.id, "Unwell", h.staff_id)
        .await
        .unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
    assert!(cancelled.notes.last().unwrap().message.contains("Unwell"));

    let twice = h
        .state
        .workflow
        .cancel(h.company_id, appointment.id, "Again", h.staff_id)
        .await;
    assert_matches!(
        twice,
        Err(SchedulingError::InvalidTransition {
            status: AppointmentStatus::Cancelled,
            ..
        })
    );
}

#[tokio::test]
async fn test_order_requires_completed_exam() {
    let h = Harness::new();
    let arrived = h.arrived(at(future_day(2), 13, 0)).await;

    let result = h
        .state
        .workflow
        .record_order(h.company_id, arrived.id, Uuid::new_v4(), h.staff_id)
        .await;
    assert_matches!(result, Err(SchedulingError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_delivery_failures_do_not_fail_transitions() {
    let mut broadcaster = MockBroadcaster::new();
    broadcaster
        .expect_broadcast_to_tenant()
        .returning(|_, _| Err(DeliveryError::Unavailable("event bus down".to_string())));
    let mut notifier = MockNotifier::new();
    notifier
        .expect_notify()
        .returning(|_, _| Err(DeliveryError::Rejected("no subscribers".to_string())));

    let channels = Arc::new(RecordingChannels::default());
    let effects = SideEffects::new(Arc::new(broadcaster), Arc::new(notifier), channels.clone());
    let h = Harness::with_effects(SchedulingSettings::default(), channels, effects);
    h.store.add_dispenser(h.company_id, Uuid::new_v4()).await;

    let arrived = h.arrived(at(future_day(2), 9, 0)).await;
    let started = h
        .state
        .workflow
        .start_exam(h.company_id, arrived.id, h.staff_id)
        .await
        .unwrap();
    release_prescription(&h, started.examination.id, PrescriptionStatus::Verified).await;

    let completed = h
        .state
        .workflow
        .complete_exam(h.company_id, arrived.id, started.examination.id, h.staff_id)
        .await
        .unwrap();
    assert!(completed.ready_for_dispense);

    let persisted = h
        .state
        .scheduling
        .get_appointment(h.company_id, arrived.id)
        .await
        .unwrap();
    assert_eq!(persisted.status, AppointmentStatus::Completed);
}
