// libs/scheduling-cell/src/router.rs
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, patch, post},
    Router,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers;
use crate::state::SchedulingState;

pub fn scheduling_routes(state: Arc<SchedulingState>, config: Arc<AppConfig>) -> Router {
    // Every route is tenant-scoped, so all of them sit behind auth
    let protected_routes = Router::new()
        // Appointments
        .route(
            "/",
            post(handlers::create_appointment).get(handlers::list_appointments),
        )
        .route(
            "/{appointment_id}",
            get(handlers::get_appointment).put(handlers::update_appointment),
        )
        .route("/{appointment_id}/reschedule", patch(handlers::reschedule_appointment))
        .route("/{appointment_id}/cancel", post(handlers::cancel_appointment))

        // Workflow handoffs
        .route("/{appointment_id}/check-in", post(handlers::check_in))
        .route("/{appointment_id}/exam/start", post(handlers::start_exam))
        .route("/{appointment_id}/exam/complete", post(handlers::complete_exam))
        .route("/{appointment_id}/orders", post(handlers::record_order))
        .route("/{appointment_id}/no-show", post(handlers::mark_no_show))
        .route("/queue", get(handlers::stage_queue))

        // Availability
        .route("/availability/check", get(handlers::check_availability))
        .route("/availability/slots", get(handlers::available_slots))

        // Waitlist
        .route(
            "/waitlist",
            post(handlers::add_to_waitlist).get(handlers::list_waitlist),
        )
        .route("/waitlist/{entry_id}/fulfill", post(handlers::fulfill_waitlist_entry))

        .layer(middleware::from_fn_with_state(config, auth_middleware));

    Router::new()
        .merge(protected_routes)
        .with_state(state)
}
