//! Link manager: owns the serial connection to the reader.
//!
//! Key design goals:
//! - **Never give up**: `open` retries forever with a capped, slowly growing
//!   delay; the reader is expected to come back
//! - **Fail loudly, not forever**: reads and writes surface I/O errors so the
//!   read loop can reconnect, and a lost link wakes a pending read
//! - **One writer at a time**: every outbound frame goes through one async
//!   mutex, whichever task sends it
//! - **Quiet outages**: open failures are logged at info up to a threshold,
//!   then one warning, then nothing until the link is back

use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{encode_frame, encode_raw_line, TextEncoding, Verb, NTFY_BREAK, NTFY_NORMAL};
use crate::config::TimingConfig;
use crate::error::GatewayError;
use crate::gpio::ResetLine;

/// Open failures logged at info before the single warning.
pub const OPEN_FAILURES_LOGGED: u32 = 20;

// ---------------------------------------------------------------------------
// Link state
// ---------------------------------------------------------------------------

/// Connection state of the serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

pub type LinkReader = Box<dyn AsyncBufRead + Send + Unpin>;
pub type LinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Something that can open a byte stream to the reader.
pub trait Connector: Send + Sync {
    /// Open the device once. Retrying is the link manager's job.
    fn connect(&self) -> io::Result<(LinkReader, LinkWriter)>;

    /// Human-readable description of the connection target.
    fn describe(&self) -> String;

    /// Hook called on the first failure of an outage.
    fn on_first_failure(&self) {}
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Linear reconnect backoff: `base + step * (attempt - 1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub step: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn from_timing(timing: &TimingConfig) -> Self {
        Self {
            base: Duration::from_millis(timing.reconnect_base_ms),
            step: Duration::from_millis(timing.reconnect_step_ms),
            cap: Duration::from_millis(timing.reconnect_cap_ms),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let extra = self.step.saturating_mul(attempt.saturating_sub(1));
        self.base.saturating_add(extra).min(self.cap)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_timing(&TimingConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Link manager
// ---------------------------------------------------------------------------

/// Reset line plus the time it is held low.
struct ResetControl {
    line: Box<dyn ResetLine>,
    pulse: Duration,
}

pub struct LinkManager {
    connector: Arc<dyn Connector>,
    encoding: TextEncoding,
    backoff: Backoff,
    writer: Mutex<Option<LinkWriter>>,
    state: watch::Sender<LinkState>,
    reset: Option<ResetControl>,
}

impl LinkManager {
    pub fn new(connector: Arc<dyn Connector>, encoding: TextEncoding, backoff: Backoff) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            connector,
            encoding,
            backoff,
            writer: Mutex::new(None),
            state,
            reset: None,
        }
    }

    /// Attach the reader's reset line.
    pub fn with_reset_line(mut self, line: Box<dyn ResetLine>, pulse: Duration) -> Self {
        self.reset = Some(ResetControl { line, pulse });
        self
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Link state changed");
        }
    }

    /// Open the link, retrying until it succeeds or `cancel` fires.
    ///
    /// Returns the read half; the write half is kept for `write_line`.
    pub async fn open(&self, cancel: &CancellationToken) -> Result<LinkReader, GatewayError> {
        let target = self.connector.describe();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            attempt = attempt.saturating_add(1);
            self.set_state(LinkState::Connecting);

            match self.connector.connect() {
                Ok((reader, writer)) => {
                    *self.writer.lock().await = Some(writer);
                    self.set_state(LinkState::Connected);
                    if attempt > OPEN_FAILURES_LOGGED {
                        info!(port = %target, attempts = attempt, "Serial link restored after long outage");
                    } else {
                        info!(port = %target, attempts = attempt, "Serial link connected");
                    }
                    return Ok(reader);
                }
                Err(e) => {
                    self.set_state(LinkState::Disconnected);
                    if attempt == 1 {
                        self.connector.on_first_failure();
                    }
                    let delay = self.backoff.delay(attempt);
                    log_open_failure(&target, attempt, &e, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Mark the link lost and release the write half.
    async fn mark_lost(&self, reason: &str) {
        self.writer.lock().await.take();
        self.set_state(LinkState::Disconnected);
        warn!(port = %self.connector.describe(), reason, "Serial link lost");
    }

    /// Write one pre-encoded line.
    pub async fn write_line(&self, bytes: &[u8]) -> Result<(), GatewayError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(GatewayError::NotConnected)?;

        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                debug!(line = %String::from_utf8_lossy(bytes).trim_end(), "Serial TX");
                Ok(())
            }
            Err(e) => {
                guard.take();
                drop(guard);
                self.set_state(LinkState::Disconnected);
                warn!(error = %e, "Serial write failed");
                Err(GatewayError::Link(e))
            }
        }
    }

    /// Encode and write a protocol frame.
    pub async fn send_frame(&self, verb: &Verb, argument: Option<&str>) -> Result<(), GatewayError> {
        self.write_line(&encode_frame(verb, argument, self.encoding)).await
    }

    /// Write an operator-supplied line verbatim.
    pub async fn send_raw(&self, text: &str) -> Result<(), GatewayError> {
        self.write_line(&encode_raw_line(text, self.encoding)).await
    }

    /// Tell the reader which mode is in effect: `NTFY 3` (break) or `NTFY 4`.
    pub async fn send_ntfy(&self, fallback_allowed: bool) -> Result<(), GatewayError> {
        let code = if fallback_allowed { NTFY_BREAK } else { NTFY_NORMAL };
        self.send_frame(&Verb::Ntfy, Some(&code.to_string())).await
    }

    /// Read one line, without the terminator.
    ///
    /// Fails when the stream errors or ends, and also when another task
    /// marks the link lost while the read is pending.
    pub async fn read_line(&self, reader: &mut LinkReader) -> Result<String, GatewayError> {
        let mut state = self.state.subscribe();
        let mut buf = Vec::new();

        let read = tokio::select! {
            res = reader.read_until(b'\n', &mut buf) => res,
            _ = async {
                let _ = state.wait_for(|s| *s != LinkState::Connected).await;
            } => {
                return Err(GatewayError::NotConnected);
            }
        };

        match read {
            Ok(0) => {
                self.mark_lost("end of stream").await;
                Err(GatewayError::Link(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "serial link closed",
                )))
            }
            Ok(_) => {
                let line = self.encoding.decode(&buf);
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                debug!(line = %line, "Serial RX");
                Ok(line)
            }
            Err(e) => {
                self.mark_lost("read error").await;
                Err(GatewayError::Link(e))
            }
        }
    }

    /// Release the link. With `power_cycle`, also pulse the reset line.
    pub async fn close(&self, power_cycle: bool) -> Result<(), GatewayError> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.set_state(LinkState::Disconnected);
        info!(port = %self.connector.describe(), "Serial link closed");
        if power_cycle {
            self.reset_device().await?;
        }
        Ok(())
    }

    /// Pulse the reset line low, then high again.
    pub async fn reset_device(&self) -> Result<(), GatewayError> {
        let reset = self.reset.as_ref().ok_or(GatewayError::NoResetLine)?;
        info!(line = %reset.line.describe(), "Resetting reader");
        reset.line.set_level(false).map_err(GatewayError::ResetLine)?;
        tokio::time::sleep(reset.pulse).await;
        reset.line.set_level(true).map_err(GatewayError::ResetLine)?;
        Ok(())
    }
}

fn log_open_failure(target: &str, attempt: u32, error: &io::Error, retry_in: Duration) {
    if attempt <= OPEN_FAILURES_LOGGED {
        info!(
            port = %target,
            attempt,
            error = %error,
            retry_in_ms = retry_in.as_millis() as u64,
            "Serial link unavailable, retrying"
        );
    } else if attempt == OPEN_FAILURES_LOGGED + 1 {
        warn!(
            port = %target,
            attempt,
            error = %error,
            "Serial link still unavailable, further failures will not be logged"
        );
    }
}

// ===========================================================================
// Tests
// ===========================================================================
