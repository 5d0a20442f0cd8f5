pub mod error;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;
pub mod state;
pub mod store;

pub use error::*;
pub use models::*;
pub use router::scheduling_routes;
pub use state::{SchedulingBackends, SchedulingState};
