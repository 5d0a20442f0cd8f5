// libs/scheduling-cell/src/state.rs
use std::sync::Arc;

use tracing::{info, warn};

use shared_config::AppConfig;
use shared_database::SupabaseClient;

use crate::services::availability::AvailabilityService;
use crate::services::conflict::ConflictDetectionService;
use crate::services::dispatch::SideEffects;
use crate::services::locking::{InProcessSlotLocks, RedisSlotLocks, SlotLockManager};
use crate::services::scheduling::SchedulingService;
use crate::services::waitlist::WaitlistMatcher;
use crate::services::workflow::WorkflowStateMachine;
use crate::store::{
    AppointmentStore, ClinicalRecordStore, InMemoryStore, StaffDirectory, SupabaseSchedulingStore,
    WaitlistStore,
};

/// Storage and locking the services run on.
#[derive(Clone)]
pub struct SchedulingBackends {
    pub appointments: Arc<dyn AppointmentStore>,
    pub waitlist: Arc<dyn WaitlistStore>,
    pub records: Arc<dyn ClinicalRecordStore>,
    pub staff: Arc<dyn StaffDirectory>,
    pub locks: Arc<dyn SlotLockManager>,
}

impl SchedulingBackends {
    pub fn in_memory(store: Arc<InMemoryStore>, locks: Arc<dyn SlotLockManager>) -> Self {
        Self {
            appointments: store.clone(),
            waitlist: store.clone(),
            records: store.clone(),
            staff: store,
            locks,
        }
    }

    /// Supabase stores when the database is configured, Redis locks when
    /// `REDIS_URL` is set; in-memory and in-process otherwise.
    pub async fn from_config(config: &AppConfig) -> Self {
        let locks: Arc<dyn SlotLockManager> = match config.redis_url.as_deref() {
            Some(url) => match RedisSlotLocks::new(url, &config.scheduling).await {
                Ok(locks) => Arc::new(locks),
                Err(e) => {
                    warn!("Redis unavailable ({}), falling back to in-process slot locks", e);
                    Arc::new(InProcessSlotLocks::from_settings(&config.scheduling))
                }
            },
            None => {
                info!("REDIS_URL not set, using in-process slot locks");
                Arc::new(InProcessSlotLocks::from_settings(&config.scheduling))
            }
        };

        if config.is_database_configured() {
            let store = Arc::new(SupabaseSchedulingStore::new(Arc::new(SupabaseClient::new(
                config,
            ))));
            info!("Scheduling stores backed by Supabase at {}", config.supabase_url);
            Self {
                appointments: store.clone(),
                waitlist: store.clone(),
                records: store.clone(),
                staff: store,
                locks,
            }
        } else {
            warn!("Database not configured, scheduling data is kept in memory only");
            Self::in_memory(Arc::new(InMemoryStore::new()), locks)
        }
    }
}

/// Router state: the wired services plus the config the auth layer reads.
#[derive(Clone)]
pub struct SchedulingState {
    pub config: Arc<AppConfig>,
    pub scheduling: Arc<SchedulingService>,
    pub availability: Arc<AvailabilityService>,
    pub waitlist: Arc<WaitlistMatcher>,
    pub workflow: Arc<WorkflowStateMachine>,
}

impl SchedulingState {
    pub fn new(config: Arc<AppConfig>, backends: SchedulingBackends, effects: SideEffects) -> Self {
        let settings = config.scheduling.clone();

        let conflicts = Arc::new(ConflictDetectionService::new(backends.appointments.clone()));
        let availability = Arc::new(AvailabilityService::new(
            backends.appointments.clone(),
            conflicts.clone(),
            settings.clone(),
        ));
        let waitlist = Arc::new(WaitlistMatcher::new(
            backends.waitlist.clone(),
            backends.appointments.clone(),
            effects.communications(),
            settings.clone(),
        ));
        let workflow = Arc::new(WorkflowStateMachine::new(
            backends.appointments.clone(),
            backends.records.clone(),
            backends.staff.clone(),
            backends.locks.clone(),
            effects.clone(),
            waitlist.clone(),
        ));
        let scheduling = Arc::new(SchedulingService::new(
            backends.appointments,
            conflicts,
            backends.locks,
            workflow.clone(),
            waitlist.clone(),
            effects,
            settings,
        ));

        Self {
            config,
            scheduling,
            availability,
            waitlist,
            workflow,
        }
    }
}
