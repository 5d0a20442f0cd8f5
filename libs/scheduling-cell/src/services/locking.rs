// libs/scheduling-cell/src/services/locking.rs
//
// Serialises writers per (tenant, practitioner, date) and per appointment so
// the conflict check and the write that depends on it run as one critical
// section.
//

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use deadpool_redis::{Config, Pool, Runtime};
use rand::Rng;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::SchedulingSettings;

use crate::error::LockError;
use crate::models::Interval;

/// Lock scopes. Both variants carry the tenant so tenants never contend.
/// The derived `Ord` gives the global acquisition order: appointment keys
/// before practitioner-day keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    Appointment {
        company_id: Uuid,
        appointment_id: Uuid,
    },
    PractitionerDay {
        company_id: Uuid,
        practitioner_id: Uuid,
        date: NaiveDate,
    },
}

impl LockKey {
    pub fn appointment(company_id: Uuid, appointment_id: Uuid) -> Self {
        LockKey::Appointment {
            company_id,
            appointment_id,
        }
    }

    pub fn practitioner_day(company_id: Uuid, practitioner_id: Uuid, date: NaiveDate) -> Self {
        LockKey::PractitionerDay {
            company_id,
            practitioner_id,
            date,
        }
    }

    /// One practitioner-day key per calendar date that `span` touches once
    /// padded by `buffer`. Any booking a conflict check can see shares at
    /// least one of these dates with it.
    pub fn practitioner_days(
        company_id: Uuid,
        practitioner_id: Uuid,
        span: &Interval,
        buffer: chrono::Duration,
    ) -> Vec<LockKey> {
        let padded = span.padded(buffer);
        let first = padded.start.date_naive();
        let last = padded
            .end
            .checked_sub_signed(chrono::Duration::nanoseconds(1))
            .map_or(first, |end| end.date_naive())
            .max(first);

        let mut keys = Vec::new();
        let mut date = first;
        loop {
            keys.push(LockKey::practitioner_day(company_id, practitioner_id, date));
            match date.succ_opt() {
                Some(next) if next <= last => date = next,
                _ => break,
            }
        }
        keys
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Appointment {
                company_id,
                appointment_id,
            } => write!(f, "scheduling_lock:{}:appointment:{}", company_id, appointment_id),
            LockKey::PractitionerDay {
                company_id,
                practitioner_id,
                date,
            } => write!(
                f,
                "scheduling_lock:{}:practitioner:{}:{}",
                company_id, practitioner_id, date
            ),
        }
    }
}

/// Proof of ownership handed back to `release`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: LockKey,
    pub token: Uuid,
}

#[async_trait]
pub trait SlotLockManager: Send + Sync {
    /// Waits up to the configured acquire timeout.
    async fn acquire(&self, key: LockKey) -> Result<LockLease, LockError>;

    async fn release(&self, lease: LockLease) -> Result<(), LockError>;
}

/// Leases taken by `acquire_all`. Call `release` on the way out; if the
/// owning future is dropped first, the leases are released on a spawned
/// task instead of being left behind.
pub struct HeldLocks {
    manager: Arc<dyn SlotLockManager>,
    leases: Vec<LockLease>,
}

impl std::fmt::Debug for HeldLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeldLocks")
            .field("leases", &self.leases)
            .finish_non_exhaustive()
    }
}

impl HeldLocks {
    pub fn keys(&self) -> impl Iterator<Item = &LockKey> {
        self.leases.iter().map(|lease| &lease.key)
    }

    pub async fn release(mut self) {
        let leases = std::mem::take(&mut self.leases);
        release_all(self.manager.as_ref(), leases).await;
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        if self.leases.is_empty() {
            return;
        }

        let leases = std::mem::take(&mut self.leases);
        let manager = Arc::clone(&self.manager);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Releasing {} scheduling locks of an abandoned request", leases.len());
                handle.spawn(async move {
                    release_all(manager.as_ref(), leases).await;
                });
            }
            Err(_) => warn!(
                "No runtime to release {} scheduling locks; they stay held until they expire",
                leases.len()
            ),
        }
    }
}

/// Acquires `keys` in sorted order, deduplicated. On failure every lease
/// taken so far is released before the error is returned.
pub async fn acquire_all(
    manager: &Arc<dyn SlotLockManager>,
    mut keys: Vec<LockKey>,
) -> Result<HeldLocks, LockError> {
    keys.sort();
    keys.dedup();

    let mut held = HeldLocks {
        manager: Arc::clone(manager),
        leases: Vec::with_capacity(keys.len()),
    };
    for key in keys {
        match manager.acquire(key).await {
            Ok(lease) => held.leases.push(lease),
            Err(e) => {
                held.release().await;
                return Err(e);
            }
        }
    }

    Ok(held)
}

/// Releases in reverse acquisition order. Failures are logged; an expired
/// or already-released lease is not an error for the caller.
async fn release_all(manager: &dyn SlotLockManager, leases: Vec<LockLease>) {
    for lease in leases.into_iter().rev() {
        let key = lease.key.to_string();
        if let Err(e) = manager.release(lease).await {
            warn!("Failed to release scheduling lock {}: {}", key, e);
        }
    }
}

// ==============================================================================
// IN-PROCESS LOCKS
// ==============================================================================

struct HeldGuard {
    key: LockKey,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

/// Per-key `tokio::sync::Mutex`es. Correct for a single API instance; use
/// `RedisSlotLocks` when more than one instance serves the same tenants.
/// A lease older than `ttl` is taken back by the next acquirer of its key.
pub struct InProcessSlotLocks {
    locks: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
    held: Mutex<HashMap<Uuid, HeldGuard>>,
    acquire_timeout: Duration,
    ttl: Duration,
}

impl InProcessSlotLocks {
    pub fn new(acquire_timeout: Duration, ttl: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            held: Mutex::new(HashMap::new()),
            acquire_timeout,
            ttl,
        }
    }

    pub fn from_settings(settings: &SchedulingSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.lock_acquire_timeout_ms),
            Duration::from_secs(settings.lock_ttl_seconds),
        )
    }

    fn mutex_for(&self, key: &LockKey) -> Result<Arc<tokio::sync::Mutex<()>>, LockError> {
        let mut locks = self.locks.lock().map_err(|_| poisoned())?;
        Ok(locks.entry(key.clone()).or_default().clone())
    }

    /// Drops guards on `key` held for longer than the TTL.
    fn expire_stale(&self, key: &LockKey) -> Result<(), LockError> {
        let mut held = self.held.lock().map_err(|_| poisoned())?;
        let stale: Vec<Uuid> = held
            .iter()
            .filter(|(_, h)| &h.key == key && h.acquired_at.elapsed() >= self.ttl)
            .map(|(token, _)| *token)
            .collect();

        for token in stale {
            held.remove(&token);
            warn!("Scheduling lock {} expired while held", key);
        }
        Ok(())
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

fn poisoned() -> LockError {
    LockError::Backend("lock table poisoned".to_string())
}

#[async_trait]
impl SlotLockManager for InProcessSlotLocks {
    async fn acquire(&self, key: LockKey) -> Result<LockLease, LockError> {
        self.expire_stale(&key)?;
        let mutex = self.mutex_for(&key)?;

        let guard = tokio::time::timeout(self.acquire_timeout, mutex.lock_owned())
            .await
            .map_err(|_| LockError::Timeout {
                key: key.to_string(),
            })?;

        let token = Uuid::new_v4();
        self.held
            .lock()
            .map_err(|_| poisoned())?
            .insert(
                token,
                HeldGuard {
                    key: key.clone(),
                    acquired_at: Instant::now(),
                    _guard: guard,
                },
            );

        debug!("Scheduling lock acquired: {}", key);
        Ok(LockLease { key, token })
    }

    async fn release(&self, lease: LockLease) -> Result<(), LockError> {
        let entry = self.held.lock().map_err(|_| poisoned())?.remove(&lease.token);

        let Some(HeldGuard { key, _guard: guard, .. }) = entry else {
            return Ok(());
        };
        drop(guard);

        // Forget the mutex once nobody holds or waits on it.
        let mut locks = self.locks.lock().map_err(|_| poisoned())?;
        if locks.get(&key).is_some_and(|m| Arc::strong_count(m) == 1) {
            locks.remove(&key);
        }

        debug!("Scheduling lock released: {}", key);
        Ok(())
    }
}

// ==============================================================================
// REDIS LOCKS
// ==============================================================================

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// `SET key token NX PX ttl` locks shared by every API instance. The TTL
/// bounds how long a crashed holder can block a practitioner's day.
pub struct RedisSlotLocks {
    pool: Pool,
    ttl_ms: u64,
    acquire_timeout: Duration,
    retry_interval: Duration,
}

impl RedisSlotLocks {
    pub async fn new(redis_url: &str, settings: &SchedulingSettings) -> Result<Self, LockError> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| LockError::Backend(format!("Pool creation error: {}", e)))?;

        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Redis scheduling locks initialized");

        Ok(Self {
            pool,
            ttl_ms: settings.lock_ttl_seconds * 1000,
            acquire_timeout: Duration::from_millis(settings.lock_acquire_timeout_ms),
            retry_interval: Duration::from_millis(settings.lock_retry_interval_ms.max(1)),
        })
    }

    fn backoff(&self) -> Duration {
        let base = self.retry_interval.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }
}

#[async_trait]
impl SlotLockManager for RedisSlotLocks {
    async fn acquire(&self, key: LockKey) -> Result<LockLease, LockError> {
        let redis_key = key.to_string();
        let token = Uuid::new_v4();
        let deadline = Instant::now() + self.acquire_timeout;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let acquired: Option<String> = {
                let mut conn = self.pool.get().await?;
                redis::cmd("SET")
                    .arg(&redis_key)
                    .arg(token.to_string())
                    .arg("NX")
                    .arg("PX")
                    .arg(self.ttl_ms)
                    .query_async(&mut conn)
                    .await?
            };

            if acquired.is_some() {
                debug!("Scheduling lock acquired: {} (attempt {})", redis_key, attempt);
                return Ok(LockLease { key, token });
            }

            if Instant::now() >= deadline {
                warn!("Gave up on scheduling lock {} after {} attempts", redis_key, attempt);
                return Err(LockError::Timeout { key: redis_key });
            }

            let wait = self.backoff();
            tokio::time::sleep(wait).await;
        }
    }

    async fn release(&self, lease: LockLease) -> Result<(), LockError> {
        let redis_key = lease.key.to_string();
        let mut conn = self.pool.get().await?;

        let deleted: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(&redis_key)
            .arg(lease.token.to_string())
            .invoke_async(&mut conn)
            .await?;

        if deleted == 0 {
            warn!("Scheduling lock {} had expired before release", redis_key);
        } else {
            debug!("Scheduling lock released: {}", redis_key);
        }
        Ok(())
    }
}
