mod common;

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use scheduling_cell::scheduling_routes;
use shared_utils::test_utils::{JwtTestUtils, TestConfig, TestUser};

use common::{at, future_day, Harness};

fn app(h: &Harness) -> Router {
    scheduling_routes(Arc::new(h.state.clone()), h.config.clone())
}

fn token_for(h: &Harness) -> String {
    let mut user = TestUser::receptionist("front-desk@example.com", h.company_id);
    user.id = h.staff_id.to_string();
    JwtTestUtils::create_test_token(&user, &TestConfig::default().jwt_secret, None)
}

async fn send(app: Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn booking_body(h: &Harness, start: &str, end: &str) -> Value {
    json!({
        "patient_id": Uuid::new_v4(),
        "practitioner_id": h.practitioner_id,
        "appointment_type": "examination",
        "start_time": start,
        "end_time": end,
        "options": { "require_confirmation": false }
    })
}

#[tokio::test]
async fn test_requests_without_token_are_rejected() {
    let h = Harness::new();
    let (status, _) = send(app(&h), Method::GET, "/", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        app(&h),
        Method::GET,
        "/",
        Some(&JwtTestUtils::create_malformed_token()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_user_without_tenant_is_rejected() {
    let h = Harness::new();
    let user = TestUser::without_company("nobody@example.com");
    let token = JwtTestUtils::create_test_token(&user, &TestConfig::default().jwt_secret, None);

    let (status, body) = send(app(&h), Method::GET, "/", Some(&token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn test_create_then_conflict() {
    let h = Harness::new();
    let token = token_for(&h);
    let day = future_day(9);
    let start = at(day, 10, 0).to_rfc3339();
    let end = at(day, 10, 30).to_rfc3339();

    let (status, body) = send(
        app(&h),
        Method::POST,
        "/",
        Some(&token),
        Some(booking_body(&h, &start, &end)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["appointment"]["status"], "confirmed");
    assert_eq!(body["appointment"]["created_by"], h.staff_id.to_string());

    let overlapping = at(day, 10, 15).to_rfc3339();
    let later = at(day, 10, 45).to_rfc3339();
    let (status, body) = send(
        app(&h),
        Method::POST,
        "/",
        Some(&token),
        Some(booking_body(&h, &overlapping, &later)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");
}

#[tokio::test]
async fn test_validation_and_not_found_statuses() {
    let h = Harness::new();
    let token = token_for(&h);
    let day = future_day(9);

    let (status, _) = send(
        app(&h),
        Method::POST,
        "/",
        Some(&token),
        Some(booking_body(
            &h,
            &at(day, 11, 0).to_rfc3339(),
            &at(day, 10, 0).to_rfc3339(),
        )),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        app(&h),
        Method::GET,
        &format!("/{}", Uuid::new_v4()),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_exam_complete_before_start_is_conflict() {
    let h = Harness::new();
    let token = token_for(&h);
    let appointment = h.book(at(future_day(9), 9, 0), 30).await;

    let (status, body) = send(
        app(&h),
        Method::POST,
        &format!("/{}/exam/complete", appointment.id),
        Some(&token),
        Some(json!({ "examination_id": Uuid::new_v4() })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("scheduled"));
}

#[tokio::test]
async fn test_check_in_then_queue() {
    let h = Harness::new();
    let token = token_for(&h);
    let day = future_day(9);
    let appointment = h.book(at(day, 9, 0), 30).await;

    let (status, body) = send(
        app(&h),
        Method::POST,
        &format!("/{}/check-in", appointment.id),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["appointment"]["status"], "confirmed");

    let (status, body) = send(
        app(&h),
        Method::GET,
        &format!("/queue?date={}", day),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["queue"][0]["stage"], "checked_in");
}

#[tokio::test]
async fn test_availability_routes() {
    let h = Harness::new();
    let token = token_for(&h);
    let day = future_day(9);
    h.book(at(day, 10, 0), 30).await;

    let uri = format!(
        "/availability/slots?practitioner_id={}&date={}&duration_minutes=30&day_start=09:00:00&day_end=12:00:00",
        h.practitioner_id, day
    );
    let (status, body) = send(app(&h), Method::GET, &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_slots"], 6);

    let start = urlencoding::encode(&at(day, 10, 15).to_rfc3339()).into_owned();
    let end = urlencoding::encode(&at(day, 10, 45).to_rfc3339()).into_owned();
    let uri = format!(
        "/availability/check?practitioner_id={}&start_time={}&end_time={}",
        h.practitioner_id, start, end
    );
    let (status, body) = send(app(&h), Method::GET, &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available"], false);
    assert_eq!(body["conflicts"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_waitlist_routes() {
    let h = Harness::new();
    let token = token_for(&h);

    let (status, body) = send(
        app(&h),
        Method::POST,
        "/waitlist",
        Some(&token),
        Some(json!({
            "patient_id": Uuid::new_v4(),
            "appointment_type": "fitting",
            "preferred_time_range": "morning",
            "contact_method": "email",
            "contact_value": "waiting@example.com",
            "priority": 7
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["entry"]["priority"], 7);

    let (status, body) = send(
        app(&h),
        Method::GET,
        "/waitlist?appointment_type=fitting",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
}
