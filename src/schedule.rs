//! Schedule engine: break windows, manual override and the per-second tick.
//!
//! Break windows are time-of-day intervals. Only the time matters, never the
//! calendar date, so they are held as `NaiveTime`. The whole schedule (window
//! set plus override fields) is swapped under one write lock, so readers see
//! either the old or the new set, never a half-applied update.
//!
//! Key design goals:
//! - **Half-open windows**: `from` is inside, `to` is outside; `from > to`
//!   wraps past midnight
//! - **Any window wins**: a time inside any window is a break
//! - **Drift-free**: ticks sleep until the next wall-clock second instead of
//!   running a fixed interval timer

use chrono::{DateTime, NaiveTime, TimeZone, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::link::LinkManager;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A time-of-day interval during which the fallback code is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakWindow {
    #[serde(with = "time_of_day")]
    pub from: NaiveTime,
    #[serde(with = "time_of_day")]
    pub to: NaiveTime,
}

impl BreakWindow {
    pub fn new(from: NaiveTime, to: NaiveTime) -> Self {
        Self { from, to }
    }

    /// Half-open membership test: `[from, to)`.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.from < self.to {
            time >= self.from && time < self.to
        } else if self.from > self.to {
            time >= self.from || time < self.to
        } else {
            false
        }
    }
}

/// Full schedule as delivered by the settings store. Updates replace every
/// field; there are no deltas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleSettings {
    pub break_windows: Vec<BreakWindow>,
    pub manual_override: bool,
    /// With the override active: `true` requires the UID, `false` relaxes to
    /// the fallback code. `None` is treated as `true`.
    pub manual_value: Option<bool>,
    pub response_delay: Duration,
}

/// Snapshot of the policy-relevant schedule state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulePolicy {
    pub manual_override: bool,
    pub manual_value: Option<bool>,
    /// Derived every tick from the break windows.
    pub is_break: bool,
    pub response_delay: Duration,
}

impl SchedulePolicy {
    /// Whether the fallback code is currently acceptable.
    pub fn fallback_allowed(&self) -> bool {
        if self.manual_override {
            !self.manual_value.unwrap_or(true)
        } else {
            self.is_break
        }
    }
}

#[derive(Debug, Default)]
struct ScheduleState {
    windows: Arc<[BreakWindow]>,
    policy: SchedulePolicy,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Owner of the break windows and the schedule policy.
#[derive(Debug, Default)]
pub struct ScheduleEngine {
    state: RwLock<ScheduleState>,
}

impl ScheduleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current policy snapshot.
    pub fn policy(&self) -> SchedulePolicy {
        self.state.read().unwrap_or_else(|e| e.into_inner()).policy
    }

    /// Current window set.
    pub fn windows(&self) -> Arc<[BreakWindow]> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .windows
            .clone()
    }

    pub fn is_break(&self) -> bool {
        self.policy().is_break
    }

    /// Replace the whole schedule from a settings update.
    ///
    /// Returns the new fallback state when the update changed it (the override
    /// was switched or its value flipped), so the caller can notify the reader.
    pub fn apply_settings(&self, settings: ScheduleSettings) -> Option<bool> {
        let windows: Arc<[BreakWindow]> = settings.break_windows.into();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let before = state.policy.fallback_allowed();
        state.windows = windows;
        state.policy.manual_override = settings.manual_override;
        state.policy.manual_value = settings.manual_value;
        state.policy.response_delay = settings.response_delay;
        let after = state.policy.fallback_allowed();
        (before != after).then_some(after)
    }

    /// Drop every window and the override: no break, UID required.
    ///
    /// Returns `Some(false)` when the fallback code was allowed until now.
    pub fn reset_to_safe_defaults(&self) -> Option<bool> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let before = state.policy.fallback_allowed();
        state.windows = Arc::from(Vec::new());
        state.policy = SchedulePolicy::default();
        before.then_some(false)
    }

    /// Re-evaluate `is_break` for `now`.
    ///
    /// Returns `Some(is_break)` when the computed value changed and no manual
    /// override is active, i.e. when the reader must be notified.
    pub fn tick(&self, now: NaiveTime) -> Option<bool> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let is_break = compute_break(&state.windows, now);
        let previous = state.policy.is_break;
        state.policy.is_break = is_break;
        (previous != is_break && !state.policy.manual_override).then_some(is_break)
    }

    #[cfg(test)]
    pub(crate) fn set_break(&self, is_break: bool) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .policy
            .is_break = is_break;
    }
}

/// True when `now` falls inside any window.
pub fn compute_break(windows: &[BreakWindow], now: NaiveTime) -> bool {
    windows.iter().any(|w| w.contains(now))
}

/// Time left until the next whole wall-clock second, and that second's
/// time of day.
pub fn next_second<Tz: TimeZone>(now: &DateTime<Tz>) -> (Duration, NaiveTime) {
    let nanos = u64::from(now.timestamp_subsec_nanos()).min(999_999_999);
    let wait = Duration::from_nanos(1_000_000_000 - nanos);
    let boundary = now.clone() + chrono::Duration::nanoseconds(wait.as_nanos() as i64);
    let time = boundary.time().with_nanosecond(0).unwrap_or_else(|| boundary.time());
    (wait, time)
}

/// Re-evaluate the schedule on every wall-clock second of `clock` and tell
/// the reader when the break state flips. The gateway passes `Local::now`.
pub async fn run_schedule_ticks<Tz, C>(
    engine: &ScheduleEngine,
    link: &LinkManager,
    cancel: &CancellationToken,
    clock: C,
) where
    Tz: TimeZone,
    C: Fn() -> DateTime<Tz>,
{
    loop {
        let (wait, boundary) = next_second(&clock());
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        if let Some(is_break) = engine.tick(boundary) {
            info!(is_break, at = %boundary, "Break state changed");
            if let Err(e) = link.send_ntfy(is_break).await {
                warn!(error = %e, "Break notification not delivered");
            }
        }
    }
    debug!("Schedule ticks stopped");
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

/// `"HH:MM"` or `"HH:MM:SS"`.
pub mod time_of_day {
    use super::*;

    pub fn parse(s: &str) -> Option<NaiveTime> {
        let s = s.trim();
        NaiveTime::parse_from_str(s, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
            .ok()
    }

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M:%S").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid time of day {raw:?}")))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
