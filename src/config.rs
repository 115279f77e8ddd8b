use chrono_tz::Tz;
use log::warn;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, read from the environment once at startup.
///
/// Every key falls back to its default when unset or malformed; a bad value
/// must never prevent the process from starting.
#[derive(Clone, Debug)]
pub struct Config {
    /// Reconnect attempt ceiling. `None` means unlimited retries.
    pub max_reconnect_retries: Option<u32>,
    /// Base delay for exponential reconnect backoff.
    pub reconnect_base: Duration,
    /// Hard cap on the reconnect backoff delay.
    pub reconnect_cap: Duration,
    /// Stagger between session recovery attempts at startup.
    pub session_init_delay: Duration,
    /// Wall-clock hour (0-23) of the daily history prune.
    pub cleanup_hour: u32,
    /// Wall-clock minute (0-59) of the daily history prune.
    pub cleanup_minute: u32,
    /// Backup prune interval in hours. Zero or negative disables it.
    pub cleanup_interval_hours: i64,
    /// Time zone the daily prune slot is resolved in.
    pub timezone: Tz,
    /// Directory holding per-session auth dirs, snapshots and cleanup records.
    pub sessions_dir: PathBuf,
    /// Interval between periodic store snapshot saves.
    pub store_save_interval: Duration,
    /// Webhook endpoint for protocol event notifications, if any.
    pub webhook_url: Option<String>,
    /// Event types forwarded to the webhook. `ALL` matches everything.
    pub webhook_allowed_events: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_reconnect_retries: Some(5),
            reconnect_base: Duration::from_millis(10_000),
            reconnect_cap: Duration::from_millis(120_000),
            session_init_delay: Duration::from_millis(1_000),
            cleanup_hour: 3,
            cleanup_minute: 0,
            cleanup_interval_hours: 24,
            timezone: chrono_tz::UTC,
            sessions_dir: PathBuf::from("sessions"),
            store_save_interval: Duration::from_secs(30),
            webhook_url: None,
            webhook_allowed_events: Vec::new(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(target: "Config", "Invalid value for {key}: {raw:?}, using default");
            default
        }),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        // MAX_RETRIES=-1 enables unlimited reconnects.
        let max_retries_raw = env_parse("MAX_RETRIES", 5i64);
        let max_reconnect_retries = if max_retries_raw < 0 {
            None
        } else {
            Some(max_retries_raw as u32)
        };

        let timezone = match std::env::var("TIMEZONE") {
            Ok(name) => name.parse().unwrap_or_else(|_| {
                warn!(target: "Config", "Unknown TIMEZONE {name:?}, falling back to UTC");
                chrono_tz::UTC
            }),
            Err(_) => chrono_tz::UTC,
        };

        let webhook_url = std::env::var("APP_WEBHOOK_URL")
            .ok()
            .filter(|u| !u.is_empty());
        let webhook_allowed_events = std::env::var("APP_WEBHOOK_ALLOWED_EVENTS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            max_reconnect_retries,
            reconnect_base: Duration::from_millis(env_parse("RECONNECT_INTERVAL", 10_000u64)),
            reconnect_cap: Duration::from_millis(env_parse(
                "MAX_RECONNECT_INTERVAL_ENV",
                120_000u64,
            )),
            session_init_delay: Duration::from_millis(env_parse("SESSION_INIT_DELAY", 1_000u64)),
            cleanup_hour: env_parse("MESSAGE_STORE_CLEANUP_HOUR", 3u32).min(23),
            cleanup_minute: env_parse("MESSAGE_STORE_CLEANUP_MINUTE", 0u32).min(59),
            cleanup_interval_hours: env_parse("MESSAGE_STORE_CLEAR_INTERVAL_HOURS", 24i64),
            timezone,
            sessions_dir: std::env::var("SESSIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.sessions_dir),
            store_save_interval: Duration::from_secs(env_parse("STORE_SAVE_INTERVAL", 30u64)),
            webhook_url,
            webhook_allowed_events,
        }
    }
}
