pub mod hub;
pub mod webhook;

pub use hub::{RealtimeHub, RealtimeReceiver, RealtimeSender};
pub use webhook::{TracingCommunicationsGateway, WebhookCommunicationsGateway};
