//! Heartbeat monitor: periodic `PING`, `PONG` bookkeeping and door status.
//!
//! Every `PING` sent counts as a missed reply until a `PONG` arrives. The
//! number of outstanding pings decides how loudly an outage is reported.
//!
//! Key design goals:
//! - **Escalating severity**: info once a reply is missing, error once the
//!   reader has been silent for a while, then a single "giving up on logging"
//!   line so long outages do not flood the log
//! - **Safe reads**: door status is always answerable; `door_open` keeps the
//!   last reported value while `door_status` turns `Unknown` during an outage

use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::codec::Verb;
use crate::link::LinkManager;

/// Missed replies before the reader is reported as failing.
pub const FAILING_AFTER: u32 = 10;

/// Missed replies after which the monitor stops logging.
pub const SILENCE_AFTER: u32 = 20;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatState {
    pub consecutive_failures: u32,
    pub door_open: bool,
}

/// How loudly the current outage is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTier {
    Quiet,
    Degraded,
    Failing,
    Silenced,
}

impl LogTier {
    pub fn for_failures(failures: u32) -> Self {
        match failures {
            0 => LogTier::Quiet,
            n if n < FAILING_AFTER => LogTier::Degraded,
            n if n <= SILENCE_AFTER => LogTier::Failing,
            _ => LogTier::Silenced,
        }
    }
}

/// Last known door position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DoorStatus {
    Open,
    Closed,
    Unknown,
}

#[derive(Debug, Default)]
pub struct HeartbeatMonitor {
    state: Mutex<HeartbeatState>,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HeartbeatState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start counting afresh on a new link. The door position is kept.
    pub fn reset(&self) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .consecutive_failures = 0;
    }

    /// Account for a `PING` about to be sent. Returns the number of replies
    /// outstanding before this one.
    pub fn record_ping(&self) -> u32 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let missed = state.consecutive_failures;
        state.consecutive_failures = missed.saturating_add(1);
        drop(state);
        log_missed(missed);
        missed
    }

    /// Handle a `PONG <status>` reply. Unparsable status counts as closed.
    pub fn record_pong(&self, status: Option<&str>) {
        let status: i64 = status.and_then(|s| s.trim().parse().ok()).unwrap_or(0);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.consecutive_failures >= FAILING_AFTER {
            info!(missed = state.consecutive_failures, "Reader answering again");
        }
        state.consecutive_failures = 0;
        state.door_open = status > 0;
        debug!(door_open = state.door_open, "PONG");
    }

    pub fn door_status(&self) -> DoorStatus {
        let state = self.snapshot();
        if state.consecutive_failures >= FAILING_AFTER {
            DoorStatus::Unknown
        } else if state.door_open {
            DoorStatus::Open
        } else {
            DoorStatus::Closed
        }
    }

    /// Door open as last reported, even during an outage.
    pub fn door_open(&self) -> bool {
        self.snapshot().door_open
    }
}

fn log_missed(missed: u32) {
    match LogTier::for_failures(missed) {
        LogTier::Quiet => {}
        LogTier::Degraded => info!(missed, "Reader did not answer PING"),
        LogTier::Failing if missed == SILENCE_AFTER => {
            error!(missed, "Reader still not answering, no further heartbeat logs until it recovers")
        }
        LogTier::Failing => error!(missed, "Reader not answering PING"),
        LogTier::Silenced => {}
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Send `PING` every `period` until cancelled.
pub async fn run_heartbeat(
    monitor: &HeartbeatMonitor,
    link: &LinkManager,
    period: Duration,
    cancel: &CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        monitor.record_ping();
        if let Err(e) = link.send_frame(&Verb::Ping, None).await {
            debug!(error = %e, "PING not sent");
        }
    }
    debug!("Heartbeat stopped");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TextEncoding;
    use crate::link::Backoff;
    use crate::testing::MockConnector;
    use std::sync::Arc;

    #[test]
    fn test_tiers() {
        assert_eq!(LogTier::for_failures(0), LogTier::Quiet);
        assert_eq!(LogTier::for_failures(1), LogTier::Degraded);
        assert_eq!(LogTier::for_failures(9), LogTier::Degraded);
        assert_eq!(LogTier::for_failures(10), LogTier::Failing);
        assert_eq!(LogTier::for_failures(20), LogTier::Failing);
        assert_eq!(LogTier::for_failures(21), LogTier::Silenced);
    }

    #[test]
    fn test_pings_count_until_pong() {
        let monitor = HeartbeatMonitor::new();
        assert_eq!(monitor.record_ping(), 0);
        assert_eq!(monitor.record_ping(), 1);
        assert_eq!(monitor.snapshot().consecutive_failures, 2);

        monitor.record_pong(Some("1"));
        assert_eq!(
            monitor.snapshot(),
            HeartbeatState {
                consecutive_failures: 0,
                door_open: true
            }
        );
    }

    #[test]
    fn test_pong_status_sets_door() {
        let monitor = HeartbeatMonitor::new();
        monitor.record_pong(Some("2"));
        assert_eq!(monitor.door_status(), DoorStatus::Open);
        monitor.record_pong(Some("0"));
        assert_eq!(monitor.door_status(), DoorStatus::Closed);
        monitor.record_pong(Some("garbage"));
        assert!(!monitor.door_open());
        monitor.record_pong(None);
        assert!(!monitor.door_open());
    }

    #[test]
    fn test_long_outage_makes_door_unknown() {
        let monitor = HeartbeatMonitor::new();
        monitor.record_pong(Some("1"));
        for _ in 0..FAILING_AFTER - 1 {
            monitor.record_ping();
        }
        assert_eq!(monitor.door_status(), DoorStatus::Open);
        monitor.record_ping();
        assert_eq!(monitor.door_status(), DoorStatus::Unknown);
        assert!(monitor.door_open(), "last known value is kept");
    }

    #[test]
    fn test_silent_after_sustained_outage() {
        let monitor = HeartbeatMonitor::new();
        monitor.record_pong(Some("0"));
        let missed: Vec<u32> = (0..25).map(|_| monitor.record_ping()).collect();

        assert_eq!(missed.last(), Some(&24));
        assert_eq!(LogTier::for_failures(missed[SILENCE_AFTER as usize]), LogTier::Failing);
        assert_eq!(LogTier::for_failures(missed[24]), LogTier::Silenced);
        assert_eq!(monitor.snapshot().consecutive_failures, 25);
        assert!(!monitor.door_open());
        assert_eq!(monitor.door_status(), DoorStatus::Unknown);
    }

    #[test]
    fn test_reset_clears_failures_only() {
        let monitor = HeartbeatMonitor::new();
        monitor.record_pong(Some("1"));
        monitor.record_ping();
        monitor.reset();
        assert_eq!(
            monitor.snapshot(),
            HeartbeatState {
                consecutive_failures: 0,
                door_open: true
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_pings_periodically() {
        let (connector, mut devices) = MockConnector::new(0);
        let link = Arc::new(LinkManager::new(connector, TextEncoding::Utf8, Backoff::default()));
        let monitor = Arc::new(HeartbeatMonitor::new());
        let cancel = CancellationToken::new();
        let _reader = link.open(&cancel).await.unwrap();
        let mut device = devices.recv().await.unwrap();

        let task = tokio::spawn({
            let (link, monitor, cancel) = (link.clone(), monitor.clone(), cancel.clone());
            async move { run_heartbeat(&monitor, &link, Duration::from_secs(1), &cancel).await }
        });

        for _ in 0..3 {
            assert_eq!(device.recv().await.unwrap(), "PING");
        }
        assert!(monitor.snapshot().consecutive_failures >= 3);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_counts_pings_while_disconnected() {
        let (connector, _devices) = MockConnector::new(0);
        let link = LinkManager::new(connector, TextEncoding::Utf8, Backoff::default());
        let monitor = HeartbeatMonitor::new();
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(4500)).await;
            stopper.cancel();
        });
        run_heartbeat(&monitor, &link, Duration::from_secs(1), &cancel).await;

        // ticks at 0s, 1s, 2s, 3s and 4s
        assert_eq!(monitor.snapshot().consecutive_failures, 5);
    }
}
