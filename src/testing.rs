//! Test doubles shared by the module tests.
//!
//! `MockConnector` hands out in-memory duplex pipes instead of serial ports;
//! the far end of each pipe is delivered to the test as a `MockDevice` that
//! plays the reader's side of the protocol.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    split, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf,
    WriteHalf,
};
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::gpio::ResetLine;
use crate::link::{Connector, LinkReader, LinkWriter};
use crate::policy::CardRead;
use crate::schedule::ScheduleSettings;
use crate::store::{CardDirectory, CommandEvent, LogSink, ScheduleUpdate, SettingsStore};

// ---------------------------------------------------------------------------
// Link doubles
// ---------------------------------------------------------------------------

/// Connector that fails a fixed number of times, then yields duplex pipes.
pub(crate) struct MockConnector {
    failures_left: AtomicU32,
    broken_writers_left: AtomicU32,
    attempts: AtomicU32,
    devices: mpsc::UnboundedSender<MockDevice>,
}

impl MockConnector {
    pub fn new(fail_first: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<MockDevice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            failures_left: AtomicU32::new(fail_first),
            broken_writers_left: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            devices: tx,
        });
        (connector, rx)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The next `count` links get a write half that always fails, as if the
    /// reader stopped taking input.
    pub fn break_writes(&self, count: u32) {
        self.broken_writers_left.store(count, Ordering::SeqCst);
    }
}

impl Connector for MockConnector {
    fn connect(&self) -> io::Result<(LinkReader, LinkWriter)> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let pending = self.failures_left.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures_left.store(pending - 1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
        }
        let (gateway_end, device_end) = tokio::io::duplex(4096);
        let (reader, writer) = split(gateway_end);
        let _ = self.devices.send(MockDevice::new(device_end));
        let broken = self.broken_writers_left.load(Ordering::SeqCst);
        if broken > 0 {
            self.broken_writers_left.store(broken - 1, Ordering::SeqCst);
            return Ok((Box::new(BufReader::new(reader)), Box::new(BrokenWriter)));
        }
        Ok((Box::new(BufReader::new(reader)), Box::new(writer)))
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

/// Write half whose every write fails with `BrokenPipe`.
struct BrokenWriter;

impl AsyncWrite for BrokenWriter {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "reader gone")))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// The reader's side of a mock link.
pub(crate) struct MockDevice {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl MockDevice {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = split(stream);
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    /// Send one line to the gateway.
    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("device write");
    }

    /// Next line written by the gateway, `None` once the link is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.lines.next_line().await.ok().flatten()
    }

    /// Next line that is not a heartbeat `PING`.
    pub async fn recv_non_ping(&mut self) -> Option<String> {
        loop {
            let line = self.recv().await?;
            if line != "PING" {
                return Some(line);
            }
        }
    }

    /// Next line, failing the test if none arrives within `limit`.
    pub async fn expect(&mut self, limit: Duration) -> String {
        tokio::time::timeout(limit, self.recv_non_ping())
            .await
            .expect("timed out waiting for gateway output")
            .expect("link closed")
    }
}

/// Reset line that records every level it is driven to.
#[derive(Default)]
pub(crate) struct RecordingResetLine {
    pub levels: Mutex<Vec<bool>>,
    pub failing: AtomicBool,
}

impl ResetLine for RecordingResetLine {
    fn set_level(&self, high: bool) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "gpio value"));
        }
        self.levels.lock().unwrap().push(high);
        Ok(())
    }

    fn describe(&self) -> String {
        "recording".to_string()
    }
}

impl ResetLine for Arc<RecordingResetLine> {
    fn set_level(&self, high: bool) -> io::Result<()> {
        self.as_ref().set_level(high)
    }

    fn describe(&self) -> String {
        self.as_ref().describe()
    }
}

// ---------------------------------------------------------------------------
// Store doubles
// ---------------------------------------------------------------------------

/// Card directory backed by a map of UID → entitled account count.
#[derive(Default)]
pub(crate) struct MemoryDirectory {
    entitled: Mutex<HashMap<String, u64>>,
    lookups: AtomicU32,
    failing: AtomicBool,
}

impl MemoryDirectory {
    pub fn with_cards(uids: &[&str]) -> Arc<Self> {
        let dir = Self::default();
        for uid in uids {
            dir.entitled.lock().unwrap().insert(uid.to_string(), 1);
        }
        Arc::new(dir)
    }

    pub fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl CardDirectory for MemoryDirectory {
    fn count_entitled_cards(&self, uid: &str) -> Result<u64, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(self.entitled.lock().unwrap().get(uid).copied().unwrap_or(0))
    }
}

/// Settings store whose updates are pushed by the test.
pub(crate) struct MemorySettings {
    current: Mutex<Result<ScheduleSettings, ()>>,
    updates: Mutex<Option<mpsc::Receiver<ScheduleUpdate>>>,
    sender: mpsc::Sender<ScheduleUpdate>,
    panic_on_watch: AtomicBool,
}

impl MemorySettings {
    pub fn new(initial: ScheduleSettings) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(16);
        Arc::new(Self {
            current: Mutex::new(Ok(initial)),
            updates: Mutex::new(Some(rx)),
            sender: tx,
            panic_on_watch: AtomicBool::new(false),
        })
    }

    /// Store whose initial read fails.
    pub fn failing() -> Arc<Self> {
        let store = Self::new(ScheduleSettings::default());
        *store.current.lock().unwrap() = Err(());
        store
    }

    /// Store whose watcher crashes the task that starts it.
    pub fn panicking() -> Arc<Self> {
        let store = Self::new(ScheduleSettings::default());
        store.panic_on_watch.store(true, Ordering::SeqCst);
        store
    }

    pub async fn push(&self, settings: ScheduleSettings) {
        *self.current.lock().unwrap() = Ok(settings.clone());
        self.sender.send(Ok(settings)).await.expect("settings listener gone");
    }

    /// Report a reload that could not be read.
    pub async fn push_failure(&self) {
        *self.current.lock().unwrap() = Err(());
        self.sender
            .send(Err(StoreError::Invalid("break_times is not JSON".into())))
            .await
            .expect("settings listener gone");
    }
}

impl SettingsStore for MemorySettings {
    fn get_schedule(&self) -> Result<ScheduleSettings, StoreError> {
        self.current
            .lock()
            .unwrap()
            .clone()
            .map_err(|_| StoreError::Invalid("settings unavailable".into()))
    }

    fn watch_schedule_changes(&self) -> Result<mpsc::Receiver<ScheduleUpdate>, StoreError> {
        if self.panic_on_watch.load(Ordering::SeqCst) {
            panic!("settings watcher crashed");
        }
        self.updates.lock().unwrap().take().ok_or(StoreError::Closed)
    }
}

/// Log sink that keeps everything in memory.
#[derive(Default)]
pub(crate) struct MemorySink {
    pub cards: Mutex<Vec<CardRead>>,
    pub commands: Mutex<Vec<CommandEvent>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cards(&self) -> Vec<CardRead> {
        self.cards.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<CommandEvent> {
        self.commands.lock().unwrap().clone()
    }
}

impl LogSink for MemorySink {
    fn append_card_event(&self, card: &CardRead) -> Result<(), StoreError> {
        self.cards.lock().unwrap().push(card.clone());
        Ok(())
    }

    fn append_command_event(&self, event: &CommandEvent) -> Result<(), StoreError> {
        self.commands.lock().unwrap().push(event.clone());
        Ok(())
    }
}
