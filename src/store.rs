//! Interfaces to the gateway's external collaborators.
//!
//! The gateway only ever sees these traits. `db::SqliteStore` implements all
//! three on a local SQLite file; tests use in-memory doubles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::policy::CardRead;
use crate::schedule::ScheduleSettings;

/// Permissions that entitle a card to open the door.
pub const ENTITLED_PERMISSIONS: [&str; 2] = ["enter", "admin"];

/// Who accounts for cards.
pub trait CardDirectory: Send + Sync {
    /// Number of entitled accounts holding a card with this UID.
    fn count_entitled_cards(&self, uid: &str) -> Result<u64, StoreError>;
}

/// One watcher delivery: a full schedule, or the reason it could not be read.
pub type ScheduleUpdate = Result<ScheduleSettings, StoreError>;

/// Source of the break schedule and override.
pub trait SettingsStore: Send + Sync {
    fn get_schedule(&self) -> Result<ScheduleSettings, StoreError>;

    /// Stream of full schedule replacements. Delivery is at-least-once; the
    /// stream ends when the store shuts down. A reload failure is delivered
    /// as `Err` once, until the schedule can be read again.
    fn watch_schedule_changes(&self) -> Result<mpsc::Receiver<ScheduleUpdate>, StoreError>;
}

/// Durable audit log.
pub trait LogSink: Send + Sync {
    fn append_card_event(&self, card: &CardRead) -> Result<(), StoreError>;
    fn append_command_event(&self, event: &CommandEvent) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Command audit
// ---------------------------------------------------------------------------

/// Where a command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandSource {
    /// Received from the reader.
    Serial,
    /// Sent to the reader on behalf of the dashboard.
    Dashboard,
}

impl CommandSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandSource::Serial => "serial",
            CommandSource::Dashboard => "dashboard",
        }
    }
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One command line crossing the link, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEvent {
    pub command: String,
    pub arguments: Vec<String>,
    pub source: CommandSource,
    pub timestamp: DateTime<Utc>,
}

impl CommandEvent {
    /// Split a raw line into command and whitespace-separated arguments.
    pub fn from_line(line: &str, source: CommandSource) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let command = tokens.next()?.to_string();
        Some(Self {
            command,
            arguments: tokens.map(str::to_string).collect(),
            source,
            timestamp: Utc::now(),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_event_from_line() {
        let event = CommandEvent::from_line("CARD  0102030404 ", CommandSource::Serial).unwrap();
        assert_eq!(event.command, "CARD");
        assert_eq!(event.arguments, vec!["0102030404"]);
        assert_eq!(event.source, CommandSource::Serial);
    }

    #[test]
    fn test_blank_line_is_not_an_event() {
        assert!(CommandEvent::from_line("   ", CommandSource::Dashboard).is_none());
    }

    #[test]
    fn test_source_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&CommandSource::Dashboard).unwrap(),
            "\"dashboard\""
        );
        assert_eq!(CommandSource::Serial.to_string(), "serial");
    }
}
