pub mod availability;
pub mod conflict;
pub mod dispatch;
pub mod locking;
pub mod scheduling;
pub mod slots;
pub mod waitlist;
pub mod workflow;
