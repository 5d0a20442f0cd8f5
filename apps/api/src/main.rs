use std::net::SocketAddr;
use std::sync::Arc;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::{self, TraceLayer};
use tracing::{Level, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use realtime_cell::{RealtimeHub, TracingCommunicationsGateway, WebhookCommunicationsGateway};
use scheduling_cell::services::dispatch::{CommunicationsGateway, SideEffects};
use scheduling_cell::{SchedulingBackends, SchedulingState};
use shared_config::AppConfig;

#[tokio::main]
async fn main() {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting practice API server");

    // Load configuration
    let config = Arc::new(AppConfig::from_env());

    // Delivery collaborators
    let hub = Arc::new(RealtimeHub::new());
    let communications: Arc<dyn CommunicationsGateway> = match &config.communications_webhook_url {
        Some(url) => {
            info!("Patient communications will be posted to {}", url);
            Arc::new(WebhookCommunicationsGateway::new(url.clone()))
        }
        None => {
            warn!("COMMUNICATIONS_WEBHOOK_URL not set, reminders and waitlist offers will only be logged");
            Arc::new(TracingCommunicationsGateway)
        }
    };
    let effects = SideEffects::new(hub.clone(), hub.clone(), communications);

    // Create shared state
    let backends = SchedulingBackends::from_config(&config).await;
    let scheduling = Arc::new(SchedulingState::new(config.clone(), backends, effects));

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the application router
    let app = router::create_router(config.clone(), scheduling, hub)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new()
                    .level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new()
                    .level(Level::INFO)),
        )
        .layer(cors);

    // Run the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Listening on {}", addr);

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
