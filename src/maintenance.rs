//! Per-session maintenance: scheduled history pruning, memory-pressure
//! checks and periodic store snapshot saves.
//!
//! Each session owns one [`MaintenanceHandle`]. Arming it spawns four loops
//! (daily prune, backup interval prune, memory check, snapshot save);
//! cancelling aborts them all. The instant of the last prune is persisted
//! next to the store snapshot so restarts can tell whether a scheduled slot
//! was missed while the process was down.

use crate::config::Config;
use crate::store::MessageStore;
use chrono::{DateTime, Datelike, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Guard between prunes, and the persist throttle for the cleanup record.
const PRUNE_GUARD: TimeDelta = TimeDelta::minutes(5);
/// First memory check shortly after connect, then on a long period.
const MEMORY_CHECK_INITIAL: Duration = Duration::from_secs(5);
const MEMORY_CHECK_PERIOD: Duration = Duration::from_secs(12 * 60 * 60);
const MEMORY_FORCE_PRUNE_PCT: f64 = 98.0;
const MEMORY_WARN_PCT: f64 = 95.0;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CleanupRecord {
    last_cleanup: DateTime<Utc>,
}

#[derive(Default)]
struct CleanupState {
    last_prune: Option<DateTime<Utc>>,
    last_persist: Option<DateTime<Utc>>,
}

pub struct MaintenanceHandle {
    session_id: String,
    store: Arc<MessageStore>,
    store_path: PathBuf,
    cleanup_path: PathBuf,
    auth_dir: PathBuf,
    cfg: Config,
    state: Mutex<CleanupState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    armed: AtomicBool,
}

impl MaintenanceHandle {
    pub fn new(
        session_id: impl Into<String>,
        store: Arc<MessageStore>,
        store_path: PathBuf,
        cleanup_path: PathBuf,
        auth_dir: PathBuf,
        cfg: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.into(),
            store,
            store_path,
            cleanup_path,
            auth_dir,
            cfg,
            state: Mutex::new(CleanupState::default()),
            tasks: Mutex::new(Vec::new()),
            armed: AtomicBool::new(false),
        })
    }

    /// Startup recovery: loads the persisted cleanup record, runs an
    /// immediate prune if a scheduled slot was missed while the process was
    /// down, then arms the loops.
    pub async fn setup(self: &Arc<Self>) {
        let record = load_cleanup_record(&self.cleanup_path).await;
        {
            let mut state = self.state.lock().await;
            state.last_prune = record;
        }

        if needs_startup_prune(
            record,
            Utc::now(),
            self.cfg.timezone,
            self.cfg.cleanup_hour,
            self.cfg.cleanup_minute,
            self.cfg.cleanup_interval_hours,
        ) {
            info!(
                target: "Maintenance",
                "[{}] Missed cleanup slot detected, pruning now", self.session_id
            );
            self.perform_cleanup(true).await;
        }

        self.arm().await;
    }

    /// Spawns the maintenance loops. Idempotent: re-arming on a connection
    /// flap keeps the existing loops.
    pub async fn arm(self: &Arc<Self>) {
        if self.armed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(Arc::clone(self).daily_loop()));
        if self.cfg.cleanup_interval_hours > 0 {
            tasks.push(tokio::spawn(Arc::clone(self).interval_loop()));
        }
        tasks.push(tokio::spawn(Arc::clone(self).memory_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).snapshot_loop()));
        debug!(target: "Maintenance", "[{}] Maintenance loops armed", self.session_id);
    }

    /// Aborts every loop. The handle can be re-armed afterwards, but in
    /// practice cancellation only happens when the session is deleted.
    pub async fn cancel(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        self.armed.store(false, Ordering::SeqCst);
    }

    async fn daily_loop(self: Arc<Self>) {
        loop {
            let now = Utc::now();
            let next = next_daily_occurrence(
                now,
                self.cfg.timezone,
                self.cfg.cleanup_hour,
                self.cfg.cleanup_minute,
            );
            debug!(
                target: "Maintenance",
                "[{}] Next daily cleanup at {}", self.session_id, next
            );
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            sleep(wait).await;
            self.perform_cleanup(false).await;
            // Loop back to re-resolve the slot; DST shifts move it in UTC.
        }
    }

    async fn interval_loop(self: Arc<Self>) {
        let hours = self.cfg.cleanup_interval_hours;
        let period = Duration::from_secs(hours as u64 * 3600);
        loop {
            sleep(period).await;
            let recently_pruned = {
                let state = self.state.lock().await;
                state
                    .last_prune
                    .is_some_and(|last| Utc::now() - last < TimeDelta::hours(hours))
            };
            if recently_pruned {
                debug!(
                    target: "Maintenance",
                    "[{}] Skipping interval cleanup, pruned recently", self.session_id
                );
                continue;
            }
            self.perform_cleanup(false).await;
        }
    }

    async fn memory_loop(self: Arc<Self>) {
        sleep(MEMORY_CHECK_INITIAL).await;
        loop {
            self.check_memory().await;
            sleep(MEMORY_CHECK_PERIOD).await;
        }
    }

    async fn check_memory(&self) {
        let pct = tokio::task::spawn_blocking(memory_utilization_pct)
            .await
            .unwrap_or(0.0);

        if pct > MEMORY_FORCE_PRUNE_PCT {
            warn!(
                target: "Maintenance",
                "[{}] Memory critical at {pct:.1}%, forcing history prune", self.session_id
            );
            self.perform_cleanup(true).await;
        } else if pct > MEMORY_WARN_PCT {
            warn!(
                target: "Maintenance",
                "[{}] Memory high at {pct:.1}%", self.session_id
            );
        } else {
            debug!(
                target: "Maintenance",
                "[{}] Memory at {pct:.1}%", self.session_id
            );
        }
    }

    async fn snapshot_loop(self: Arc<Self>) {
        loop {
            sleep(self.cfg.store_save_interval).await;
            // The auth dir disappears when the session is deleted; stop
            // writing snapshots for a session that no longer exists.
            if !fs::try_exists(&self.auth_dir).await.unwrap_or(false) {
                debug!(
                    target: "Maintenance",
                    "[{}] Auth dir gone, stopping snapshot saves", self.session_id
                );
                break;
            }
            if let Err(e) = self.store.write_to_file(&self.store_path).await {
                warn!(
                    target: "Maintenance",
                    "[{}] Snapshot save failed: {e}", self.session_id
                );
            }
        }
    }

    /// Drops every message bucket of this session's store.
    ///
    /// Unforced calls are skipped when another prune ran within the last
    /// five minutes, so the daily, interval and memory triggers cannot
    /// stack. The snapshot file is rewritten only if it already exists.
    pub async fn perform_cleanup(&self, forced: bool) {
        let now = Utc::now();
        {
            let mut state = self.state.lock().await;
            if !forced
                && let Some(last) = state.last_prune
                && now - last < PRUNE_GUARD
            {
                debug!(
                    target: "Maintenance",
                    "[{}] Skipping cleanup, last prune was {}s ago",
                    self.session_id,
                    (now - last).num_seconds()
                );
                return;
            }
            state.last_prune = Some(now);
        }

        let dropped = self.store.clear_messages().await;
        info!(
            target: "Maintenance",
            "[{}] Cleared message history ({dropped} chats)", self.session_id
        );

        if fs::try_exists(&self.store_path).await.unwrap_or(false)
            && let Err(e) = self.store.write_to_file(&self.store_path).await
        {
            warn!(
                target: "Maintenance",
                "[{}] Failed to rewrite snapshot after cleanup: {e}", self.session_id
            );
        }

        self.persist_cleanup_record(now, forced).await;
    }

    async fn persist_cleanup_record(&self, instant: DateTime<Utc>, forced: bool) {
        {
            let mut state = self.state.lock().await;
            if !forced
                && let Some(last) = state.last_persist
                && instant - last < PRUNE_GUARD
            {
                return;
            }
            state.last_persist = Some(instant);
        }

        let record = CleanupRecord {
            last_cleanup: instant,
        };
        let write = async {
            if let Some(parent) = self.cleanup_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let data = serde_json::to_vec_pretty(&record)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            fs::write(&self.cleanup_path, data).await
        };
        if let Err(e) = write.await {
            warn!(
                target: "Maintenance",
                "[{}] Failed to persist cleanup record: {e}", self.session_id
            );
        }
    }
}

// One shared sysinfo handle; refreshing is cheap, construction is not.
static SYSTEM: once_cell::sync::Lazy<std::sync::Mutex<sysinfo::System>> =
    once_cell::sync::Lazy::new(|| std::sync::Mutex::new(sysinfo::System::new()));

fn memory_utilization_pct() -> f64 {
    let mut sys = SYSTEM.lock().unwrap_or_else(|e| e.into_inner());
    sys.refresh_memory();
    let total = sys.total_memory();
    if total == 0 {
        return 0.0;
    }
    sys.used_memory() as f64 / total as f64 * 100.0
}

async fn load_cleanup_record(path: &Path) -> Option<DateTime<Utc>> {
    let data = match fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(target: "Maintenance", "Failed to read {}: {e}", path.display());
            return None;
        }
    };
    match serde_json::from_slice::<CleanupRecord>(&data) {
        Ok(record) => Some(record.last_cleanup),
        Err(e) => {
            error!(
                target: "Maintenance",
                "Cleanup record {} is corrupt ({e}), removing it", path.display()
            );
            let _ = fs::remove_file(path).await;
            None
        }
    }
}

/// First instant strictly after `after` at which the configured local
/// wall-clock slot occurs. A slot skipped by a DST gap rolls over to the
/// next day; an ambiguous one resolves to its earliest instant.
pub(crate) fn next_daily_occurrence(
    after: DateTime<Utc>,
    tz: Tz,
    hour: u32,
    minute: u32,
) -> DateTime<Utc> {
    let mut date = after.with_timezone(&tz).date_naive();
    for _ in 0..3 {
        if let Some(local) = tz
            .with_ymd_and_hms(date.year(), date.month(), date.day(), hour, minute, 0)
            .earliest()
        {
            let utc = local.with_timezone(&Utc);
            if utc > after {
                return utc;
            }
        }
        date = match date.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    after + TimeDelta::days(1)
}

/// Latest instant at or before `before` at which the slot occurred, if any
/// exists in the preceding few days.
pub(crate) fn most_recent_daily_occurrence(
    before: DateTime<Utc>,
    tz: Tz,
    hour: u32,
    minute: u32,
) -> Option<DateTime<Utc>> {
    let mut date = before.with_timezone(&tz).date_naive();
    for _ in 0..3 {
        if let Some(local) = tz
            .with_ymd_and_hms(date.year(), date.month(), date.day(), hour, minute, 0)
            .earliest()
        {
            let utc = local.with_timezone(&Utc);
            if utc <= before {
                return Some(utc);
            }
        }
        date = date.pred_opt()?;
    }
    None
}

/// Whether startup should prune immediately instead of waiting for the
/// next scheduled slot.
pub(crate) fn needs_startup_prune(
    last_cleanup: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    tz: Tz,
    hour: u32,
    minute: u32,
    interval_hours: i64,
) -> bool {
    let Some(last) = last_cleanup else {
        return true;
    };
    if now - last < PRUNE_GUARD {
        return false;
    }
    let interval_due = interval_hours > 0 && now - last >= TimeDelta::hours(interval_hours);
    let missed_daily =
        most_recent_daily_occurrence(now, tz, hour, minute).is_some_and(|slot| slot > last);
    interval_due || missed_daily
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;
    use chrono_tz::America::Sao_Paulo;
    use chrono_tz::UTC;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn next_occurrence_is_later_today_when_slot_is_ahead() {
        let next = next_daily_occurrence(utc("2026-06-10T01:00:00Z"), UTC, 3, 0);
        assert_eq!(next, utc("2026-06-10T03:00:00Z"));
    }

    #[test]
    fn next_occurrence_rolls_to_tomorrow_when_slot_passed() {
        let next = next_daily_occurrence(utc("2026-06-10T04:00:00Z"), UTC, 3, 0);
        assert_eq!(next, utc("2026-06-11T03:00:00Z"));
    }

    #[test]
    fn slot_exactly_now_counts_as_passed() {
        let next = next_daily_occurrence(utc("2026-06-10T03:00:00Z"), UTC, 3, 0);
        assert_eq!(next, utc("2026-06-11T03:00:00Z"));
    }

    #[test]
    fn occurrences_respect_the_configured_zone() {
        // 03:00 in São Paulo (UTC-3) is 06:00 UTC.
        let next = next_daily_occurrence(utc("2026-06-10T00:00:00Z"), Sao_Paulo, 3, 0);
        assert_eq!(next, utc("2026-06-10T06:00:00Z"));
    }

    #[test]
    fn dst_gap_skips_to_the_next_day() {
        // 2026-03-08 02:30 does not exist in New York; springing forward
        // jumps from 02:00 to 03:00. The slot rolls over to March 9.
        let next = next_daily_occurrence(utc("2026-03-08T05:00:00Z"), New_York, 2, 30);
        // 02:30 EDT on March 9 is 06:30 UTC.
        assert_eq!(next, utc("2026-03-09T06:30:00Z"));
    }

    #[test]
    fn most_recent_occurrence_looks_backwards() {
        let slot = most_recent_daily_occurrence(utc("2026-06-10T04:00:00Z"), UTC, 3, 0);
        assert_eq!(slot, Some(utc("2026-06-10T03:00:00Z")));

        let slot = most_recent_daily_occurrence(utc("2026-06-10T02:00:00Z"), UTC, 3, 0);
        assert_eq!(slot, Some(utc("2026-06-09T03:00:00Z")));
    }

    #[test]
    fn startup_prunes_without_a_record() {
        assert!(needs_startup_prune(
            None,
            utc("2026-06-10T12:00:00Z"),
            UTC,
            3,
            0,
            24
        ));
    }

    #[test]
    fn startup_skips_when_record_is_fresh() {
        let now = utc("2026-06-10T12:00:00Z");
        assert!(!needs_startup_prune(
            Some(now - TimeDelta::minutes(2)),
            now,
            UTC,
            3,
            0,
            24
        ));
    }

    #[test]
    fn startup_prunes_when_a_daily_slot_was_missed() {
        // Last cleanup yesterday evening, slot this morning at 03:00.
        let now = utc("2026-06-10T12:00:00Z");
        let last = utc("2026-06-09T20:00:00Z");
        assert!(needs_startup_prune(Some(last), now, UTC, 3, 0, 0));
    }

    #[test]
    fn startup_skips_when_no_slot_fell_in_between() {
        // Cleaned at 05:00 today, next slot is tomorrow 03:00.
        let now = utc("2026-06-10T12:00:00Z");
        let last = utc("2026-06-10T05:00:00Z");
        assert!(!needs_startup_prune(Some(last), now, UTC, 3, 0, 0));
    }

    #[test]
    fn startup_prunes_when_the_backup_interval_elapsed() {
        let now = utc("2026-06-10T12:00:00Z");
        let last = utc("2026-06-10T04:30:00Z");
        // Inside the daily window but past a 6-hour backup interval.
        assert!(needs_startup_prune(Some(last), now, UTC, 3, 0, 6));
    }

    #[tokio::test]
    async fn missing_cleanup_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_cleanup_record(&dir.path().join("none.json")).await, None);
    }

    #[tokio::test]
    async fn corrupt_cleanup_record_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cleanup.json");
        tokio::fs::write(&path, b"garbage").await.unwrap();
        assert_eq!(load_cleanup_record(&path).await, None);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn cleanup_record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cleanup.json");
        let store = Arc::new(MessageStore::new());
        let handle = MaintenanceHandle::new(
            "test",
            Arc::clone(&store),
            dir.path().join("store.json"),
            path.clone(),
            dir.path().join("auth"),
            Config::default(),
        );

        handle.perform_cleanup(true).await;
        let loaded = load_cleanup_record(&path).await;
        assert!(loaded.is_some());
        assert!(Utc::now() - loaded.unwrap() < TimeDelta::minutes(1));
    }

    #[tokio::test]
    async fn unforced_cleanup_is_guarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MessageStore::new());
        let handle = MaintenanceHandle::new(
            "test",
            Arc::clone(&store),
            dir.path().join("store.json"),
            dir.path().join("cleanup.json"),
            dir.path().join("auth"),
            Config::default(),
        );

        handle.perform_cleanup(true).await;
        store
            .upsert_messages(vec![crate::types::message::StoredMessage::new(
                "c@x", "m1", 1,
            )])
            .await;

        // Within the guard window the unforced prune must not run.
        handle.perform_cleanup(false).await;
        assert_eq!(store.counts().await.messages, 1);

        handle.perform_cleanup(true).await;
        assert_eq!(store.counts().await.messages, 0);
    }
}
