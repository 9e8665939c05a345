//! Local SQLite store for cardgate.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, the settings
//! helpers, and implementations of the card directory, settings store and log
//! sink so the gateway runs without any other service.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::policy::CardRead;
use crate::schedule::{BreakWindow, ScheduleSettings};
use crate::store::{
    CardDirectory, CommandEvent, LogSink, ScheduleUpdate, SettingsStore, ENTITLED_PERMISSIONS,
};

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Settings category holding the schedule keys.
pub const SCHEDULE_CATEGORY: &str = "schedule";
pub const KEY_BREAK_TIMES: &str = "break_times";
pub const KEY_REQUIRE_AUTH: &str = "require_auth";
pub const KEY_DELAY: &str = "delay";

/// Stored form of the manual override.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct RequireAuth {
    manual: bool,
    #[serde(default)]
    value: Option<bool>,
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    poll_interval: Duration,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::Invalid(format!("create {}: {e}", parent.display())))?;
        }
        info!("Opening database at {}", path.display());
        let conn = open_and_configure(path)?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
            poll_interval: Duration::from_secs(2),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
            poll_interval: Duration::from_secs(2),
        })
    }

    /// How often the schedule watcher re-reads the settings.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create or replace a user.
    pub fn upsert_user(
        &self,
        username: &str,
        permissions: &[&str],
        cards: &[&str],
    ) -> Result<(), StoreError> {
        let cards: Vec<String> = cards.iter().map(|c| c.to_ascii_lowercase()).collect();
        self.lock().execute(
            "INSERT INTO users (username, permissions, cards)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(username) DO UPDATE SET
                permissions = excluded.permissions,
                cards = excluded.cards",
            params![
                username,
                serde_json::to_string(permissions)?,
                serde_json::to_string(&cards)?
            ],
        )?;
        Ok(())
    }

    /// Persist a complete schedule.
    pub fn set_schedule(&self, settings: &ScheduleSettings) -> Result<(), StoreError> {
        let conn = self.lock();
        set_setting(
            &conn,
            SCHEDULE_CATEGORY,
            KEY_BREAK_TIMES,
            &serde_json::to_string(&settings.break_windows)?,
        )?;
        let require_auth = RequireAuth {
            manual: settings.manual_override,
            value: settings.manual_value,
        };
        set_setting(
            &conn,
            SCHEDULE_CATEGORY,
            KEY_REQUIRE_AUTH,
            &serde_json::to_string(&require_auth)?,
        )?;
        set_setting(
            &conn,
            SCHEDULE_CATEGORY,
            KEY_DELAY,
            &settings.response_delay.as_secs_f64().to_string(),
        )?;
        Ok(())
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        debug!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    Ok(())
}

/// v1: settings and the card directory.
fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        CREATE TABLE IF NOT EXISTS users (
            username TEXT PRIMARY KEY,
            permissions TEXT NOT NULL DEFAULT '[]',
            cards TEXT NOT NULL DEFAULT '[]'
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;
    info!("Applied migration v1");
    Ok(())
}

/// v2: audit logs.
fn migrate_v2(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS card_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            card TEXT,
            manufacturer_code TEXT NOT NULL,
            auth_mode TEXT NOT NULL,
            success INTEGER NOT NULL,
            raw_block0 TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_card_events_timestamp ON card_events(timestamp);

        CREATE TABLE IF NOT EXISTS command_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            command TEXT NOT NULL,
            arguments TEXT NOT NULL DEFAULT '[]',
            source TEXT NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )?;
    info!("Applied migration v2");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(
    conn: &Connection,
    category: &str,
    key: &str,
) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
            params![category, key],
            |row| row.get(0),
        )
        .optional()?)
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Read the schedule keys. Missing keys take their defaults.
fn load_schedule(conn: &Connection) -> Result<ScheduleSettings, StoreError> {
    let break_windows: Vec<BreakWindow> =
        match get_setting(conn, SCHEDULE_CATEGORY, KEY_BREAK_TIMES)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };
    let require_auth: RequireAuth = match get_setting(conn, SCHEDULE_CATEGORY, KEY_REQUIRE_AUTH)? {
        Some(raw) => serde_json::from_str(&raw)?,
        None => RequireAuth::default(),
    };
    let response_delay = match get_setting(conn, SCHEDULE_CATEGORY, KEY_DELAY)? {
        Some(raw) => parse_delay(&raw)?,
        None => Duration::ZERO,
    };
    Ok(ScheduleSettings {
        break_windows,
        manual_override: require_auth.manual,
        manual_value: require_auth.value,
        response_delay,
    })
}

/// Delay in seconds, fractional allowed.
fn parse_delay(raw: &str) -> Result<Duration, StoreError> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| StoreError::Invalid(format!("delay {raw:?} is not a number")))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| StoreError::Invalid(format!("delay {raw:?} is out of range")))
}

// ---------------------------------------------------------------------------
// Collaborator implementations
// ---------------------------------------------------------------------------

impl CardDirectory for SqliteStore {
    fn count_entitled_cards(&self, uid: &str) -> Result<u64, StoreError> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM users u
             WHERE EXISTS (SELECT 1 FROM json_each(u.cards) c WHERE lower(c.value) = lower(?1))
               AND EXISTS (SELECT 1 FROM json_each(u.permissions) p WHERE p.value IN (?2, ?3))",
            params![uid, ENTITLED_PERMISSIONS[0], ENTITLED_PERMISSIONS[1]],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

impl SettingsStore for SqliteStore {
    fn get_schedule(&self) -> Result<ScheduleSettings, StoreError> {
        load_schedule(&self.lock())
    }

    /// Polls the settings table and sends the schedule whenever it differs
    /// from the last one seen. A failed reload is sent once as `Err`; the
    /// next good read is sent again even if it matches the old schedule.
    /// Stops when the receiver is dropped.
    fn watch_schedule_changes(&self) -> Result<mpsc::Receiver<ScheduleUpdate>, StoreError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| StoreError::Invalid(format!("schedule watcher needs a runtime: {e}")))?;
        let (tx, rx) = mpsc::channel(8);
        let conn = self.conn.clone();
        let poll = self.poll_interval;
        // `None` means the last read failed
        let mut last = load_schedule(&self.lock()).ok();

        runtime.spawn(async move {
            let mut interval = tokio::time::interval(poll);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = interval.tick() => {}
                }
                let conn = conn.clone();
                let loaded = tokio::task::spawn_blocking(move || {
                    load_schedule(&conn.lock().unwrap_or_else(|e| e.into_inner()))
                })
                .await;
                let update = match loaded {
                    Ok(Ok(settings)) if last.as_ref() == Some(&settings) => continue,
                    Ok(Ok(settings)) => {
                        debug!("Schedule settings changed");
                        last = Some(settings.clone());
                        Ok(settings)
                    }
                    Ok(Err(_)) | Err(_) if last.is_none() => continue,
                    Ok(Err(e)) => {
                        warn!(error = %e, "Failed to reload schedule settings");
                        last = None;
                        Err(e)
                    }
                    Err(e) => {
                        warn!(error = %e, "Schedule reload task failed");
                        last = None;
                        Err(StoreError::Invalid(format!("schedule reload task failed: {e}")))
                    }
                };
                if tx.send(update).await.is_err() {
                    break;
                }
            }
            debug!("Schedule watcher stopped");
        });
        Ok(rx)
    }
}

impl LogSink for SqliteStore {
    fn append_card_event(&self, card: &CardRead) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO card_events (timestamp, card, manufacturer_code, auth_mode, success, raw_block0)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                card.timestamp.to_rfc3339(),
                card.extracted_uid,
                card.manufacturer_code,
                card.auth_mode.as_str(),
                card.success,
                card.raw_block0
            ],
        )?;
        Ok(())
    }

    fn append_command_event(&self, event: &CommandEvent) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO command_events (timestamp, command, arguments, source)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.timestamp.to_rfc3339(),
                event.command,
                serde_json::to_string(&event.arguments)?,
                event.source.as_str()
            ],
        )?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
