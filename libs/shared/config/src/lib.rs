use std::env;
use std::str::FromStr;

use chrono::NaiveTime;
use tracing::warn;

/// Tunables for the scheduling core. Every value has a default so a bare
/// environment still yields a working configuration.
#[derive(Debug, Clone)]
pub struct SchedulingSettings {
    pub default_buffer_minutes: i64,
    pub slot_step_minutes: i64,
    pub require_confirmation: bool,
    pub day_start: NaiveTime,
    pub day_end: NaiveTime,
    pub lock_ttl_seconds: u64,
    pub lock_acquire_timeout_ms: u64,
    pub lock_retry_interval_ms: u64,
    pub waitlist_default_flexibility_days: i64,
    pub waitlist_default_priority: i32,
}

impl Default for SchedulingSettings {
    fn default() -> Self {
        Self {
            default_buffer_minutes: 15,
            slot_step_minutes: 15,
            require_confirmation: true,
            day_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            day_end: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or(NaiveTime::MIN),
            lock_ttl_seconds: 30,
            lock_acquire_timeout_ms: 2000,
            lock_retry_interval_ms: 50,
            waitlist_default_flexibility_days: 3,
            waitlist_default_priority: 5,
        }
    }
}

impl SchedulingSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            default_buffer_minutes: parse_var("SCHEDULING_BUFFER_MINUTES", defaults.default_buffer_minutes),
            slot_step_minutes: parse_var("SCHEDULING_SLOT_STEP_MINUTES", defaults.slot_step_minutes),
            require_confirmation: parse_var("SCHEDULING_REQUIRE_CONFIRMATION", defaults.require_confirmation),
            day_start: parse_time_var("SCHEDULING_DAY_START", defaults.day_start),
            day_end: parse_time_var("SCHEDULING_DAY_END", defaults.day_end),
            lock_ttl_seconds: parse_var("SCHEDULING_LOCK_TTL_SECONDS", defaults.lock_ttl_seconds),
            lock_acquire_timeout_ms: parse_var("SCHEDULING_LOCK_ACQUIRE_TIMEOUT_MS", defaults.lock_acquire_timeout_ms),
            lock_retry_interval_ms: parse_var("SCHEDULING_LOCK_RETRY_INTERVAL_MS", defaults.lock_retry_interval_ms),
            waitlist_default_flexibility_days: parse_var(
                "SCHEDULING_WAITLIST_FLEXIBILITY_DAYS",
                defaults.waitlist_default_flexibility_days,
            ),
            waitlist_default_priority: parse_var("SCHEDULING_WAITLIST_PRIORITY", defaults.waitlist_default_priority),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_service_role_key: Option<String>,
    pub supabase_jwt_secret: String,
    pub redis_url: Option<String>,
    pub communications_webhook_url: Option<String>,
    pub port: u16,
    pub scheduling: SchedulingSettings,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_service_role_key: optional_var("SUPABASE_SERVICE_ROLE_KEY"),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            redis_url: optional_var("REDIS_URL"),
            communications_webhook_url: optional_var("COMMUNICATIONS_WEBHOOK_URL"),
            port: parse_var("PORT", 3000),
            scheduling: SchedulingSettings::from_env(),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }

    /// Stores talk to PostgREST only when both the URL and a key are present.
    pub fn is_database_configured(&self) -> bool {
        !self.supabase_url.is_empty() && !self.supabase_anon_key.is_empty()
    }

    pub fn is_distributed_locking_configured(&self) -> bool {
        self.redis_url.is_some()
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T>(name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {:?}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}

fn parse_time_var(name: &str, default: NaiveTime) -> NaiveTime {
    match env::var(name) {
        Ok(raw) => NaiveTime::parse_from_str(raw.trim(), "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(raw.trim(), "%H:%M:%S"))
            .unwrap_or_else(|_| {
                warn!("{} has invalid time '{}', using default {}", name, raw, default);
                default
            }),
        Err(_) => default,
    }
}
