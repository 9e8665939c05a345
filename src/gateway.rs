//! Gateway: wires the link, schedule, heartbeat and policy together.
//!
//! Responsibilities:
//! - On startup: load the schedule, then start the read loop, the settings
//!   listener, the per-second schedule tick and the heartbeat
//! - While running: expose door, reset, card and status operations to the
//!   dashboard layer through `GatewayHandle`
//! - Shutdown: on `EXIT` or `GatewayHandle::shutdown`, stop every task and
//!   close the link

use chrono::Local;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::Verb;
use crate::config::GatewayConfig;
use crate::dispatcher::run_dispatcher;
use crate::error::GatewayError;
use crate::gpio::ResetLine;
use crate::heartbeat::{run_heartbeat, DoorStatus, HeartbeatMonitor};
use crate::link::{Backoff, Connector, LinkManager, LinkState};
use crate::policy::{AuthorizationPolicy, CardRead};
use crate::schedule::{run_schedule_ticks, ScheduleEngine};
use crate::store::{CardDirectory, CommandEvent, CommandSource, LogSink, SettingsStore};

/// External services the gateway talks to.
pub struct Collaborators {
    pub directory: Arc<dyn CardDirectory>,
    pub settings: Arc<dyn SettingsStore>,
    pub sink: Arc<dyn LogSink>,
}

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// State shared by every gateway task.
pub struct GatewayContext {
    pub config: GatewayConfig,
    pub link: LinkManager,
    pub schedule: ScheduleEngine,
    pub heartbeat: HeartbeatMonitor,
    pub policy: AuthorizationPolicy,
    pub settings: Arc<dyn SettingsStore>,
    pub sink: Arc<dyn LogSink>,
    /// Last extracted UID; every card presentation publishes, even a repeat.
    pub last_card: watch::Sender<Option<String>>,
    pub cancel: CancellationToken,
}

impl GatewayContext {
    /// Fire-and-forget entry in the command log.
    pub(crate) fn log_command(&self, line: &str, source: CommandSource) {
        let Some(event) = CommandEvent::from_line(line, source) else {
            return;
        };
        let sink = self.sink.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = sink.append_command_event(&event) {
                warn!(error = %e, command = %event.command, "Failed to log command");
            }
        });
    }

    /// Log a card attempt, then publish its UID.
    pub(crate) async fn record_card(&self, card: CardRead) {
        let uid = card.extracted_uid.clone();
        let sink = self.sink.clone();
        let logged = tokio::task::spawn_blocking(move || {
            let result = sink.append_card_event(&card);
            (result, card)
        })
        .await;

        match logged {
            Ok((Ok(()), _)) => {}
            Ok((Err(e), card)) => error!(error = %e, card = ?card, "Card event could not be logged"),
            Err(e) => error!(error = %e, "Card event logging task failed"),
        }
        self.last_card.send_replace(uid);
    }

    fn load_initial_schedule(&self) {
        match self.settings.get_schedule() {
            Ok(settings) => {
                info!(
                    windows = settings.break_windows.len(),
                    manual_override = settings.manual_override,
                    "Schedule loaded"
                );
                self.schedule.apply_settings(settings);
            }
            Err(e) => {
                error!(error = %e, "Schedule unavailable, requiring UID with no breaks");
                self.schedule.reset_to_safe_defaults();
            }
        }
        self.schedule.tick(Local::now().time());
    }
}

/// Apply settings updates until the stream ends or the gateway stops.
async fn listen_for_settings(ctx: &GatewayContext) {
    let mut updates = match ctx.settings.watch_schedule_changes() {
        Ok(updates) => updates,
        Err(e) => {
            error!(error = %e, "Cannot watch schedule settings, keeping startup schedule");
            return;
        }
    };

    loop {
        let update = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            update = updates.recv() => update,
        };
        let changed = match update {
            None => {
                warn!("Schedule settings stream ended, keeping current schedule");
                break;
            }
            Some(Ok(settings)) => {
                info!(
                    windows = settings.break_windows.len(),
                    manual_override = settings.manual_override,
                    "Schedule updated"
                );
                let before = ctx.schedule.policy().fallback_allowed();
                ctx.schedule.apply_settings(settings);
                ctx.schedule.tick(Local::now().time());
                let after = ctx.schedule.policy().fallback_allowed();
                (before != after).then_some(after)
            }
            Some(Err(e)) => {
                error!(error = %e, "Schedule unreadable, requiring UID with no breaks");
                ctx.schedule.reset_to_safe_defaults()
            }
        };
        if let Some(fallback) = changed {
            if let Err(e) = ctx.link.send_ntfy(fallback).await {
                warn!(error = %e, "Mode notification not delivered");
            }
        }
    }
    debug!("Settings listener stopped");
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

pub struct Gateway {
    ctx: Arc<GatewayContext>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        collaborators: Collaborators,
        reset_line: Option<Box<dyn ResetLine>>,
    ) -> Self {
        let mut link = LinkManager::new(
            connector,
            config.interface.encoding,
            Backoff::from_timing(&config.timing),
        );
        if let Some(line) = reset_line {
            link = link.with_reset_line(line, config.timing.reset_pulse());
        }
        let policy = AuthorizationPolicy::new(&config.manufacturer_codes, collaborators.directory);
        let (last_card, _) = watch::channel(None);

        Self {
            ctx: Arc::new(GatewayContext {
                config,
                link,
                schedule: ScheduleEngine::new(),
                heartbeat: HeartbeatMonitor::new(),
                policy,
                settings: collaborators.settings,
                sink: collaborators.sink,
                last_card,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            ctx: self.ctx.clone(),
        }
    }

    pub fn context(&self) -> &GatewayContext {
        &self.ctx
    }

    /// Run until `EXIT` from the reader or `GatewayHandle::shutdown`.
    pub async fn run(self) -> Result<(), GatewayError> {
        let ctx = self.ctx;
        info!(port = %ctx.link.describe(), "Gateway starting");
        ctx.load_initial_schedule();

        let mut tasks = JoinSet::new();
        tasks.spawn(run_dispatcher(ctx.clone()));
        tasks.spawn({
            let ctx = ctx.clone();
            async move { listen_for_settings(&ctx).await }
        });
        tasks.spawn({
            let ctx = ctx.clone();
            async move {
                run_schedule_ticks(&ctx.schedule, &ctx.link, &ctx.cancel, Local::now).await
            }
        });
        tasks.spawn({
            let ctx = ctx.clone();
            async move {
                let period = ctx.config.timing.heartbeat_interval();
                run_heartbeat(&ctx.heartbeat, &ctx.link, period, &ctx.cancel).await
            }
        });

        // a panicked task stops the whole gateway
        let mut failure = None;
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                Some(joined) = tasks.join_next() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Gateway task failed, stopping");
                        failure = Some(e.to_string());
                        ctx.cancel.cancel();
                        break;
                    }
                }
            }
        }

        info!("Gateway shutting down");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Gateway task failed");
            }
        }
        ctx.link.close(false).await?;
        info!("Gateway stopped");
        match failure {
            Some(reason) => Err(GatewayError::TaskFailed(reason)),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle for the dashboard layer
// ---------------------------------------------------------------------------

/// Aggregate status view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub connected: bool,
    pub door: DoorStatus,
    pub is_break: bool,
    pub fallback_allowed: bool,
    pub missed_heartbeats: u32,
    pub last_uid: Option<String>,
}

/// Cloneable access to a running gateway.
#[derive(Clone)]
pub struct GatewayHandle {
    ctx: Arc<GatewayContext>,
}

impl GatewayHandle {
    /// Send `DOOR 1` (open) or `DOOR 0`.
    pub async fn open_door(&self, open: bool) -> Result<(), GatewayError> {
        let argument = if open { "1" } else { "0" };
        self.ctx.link.send_frame(&Verb::Door, Some(argument)).await?;
        self.ctx
            .log_command(&format!("{} {argument}", Verb::Door), CommandSource::Dashboard);
        Ok(())
    }

    /// Power-cycle the reader through its reset line.
    pub async fn reset_device(&self) -> Result<(), GatewayError> {
        self.ctx.link.reset_device().await
    }

    pub fn last_observed_uid(&self) -> Option<String> {
        self.ctx.last_card.borrow().clone()
    }

    /// Receiver that is marked changed on every card presentation.
    pub fn subscribe_cards(&self) -> watch::Receiver<Option<String>> {
        self.ctx.last_card.subscribe()
    }

    /// Wait for the next card presentation and return its UID.
    pub async fn wait_for_card(&self) -> Option<String> {
        let mut cards = self.subscribe_cards();
        if cards.changed().await.is_err() {
            return None;
        }
        let uid = cards.borrow().clone();
        uid
    }

    pub fn current_door_open(&self) -> bool {
        self.ctx.heartbeat.door_open()
    }

    pub fn door_status(&self) -> DoorStatus {
        self.ctx.heartbeat.door_status()
    }

    pub fn current_is_break(&self) -> bool {
        self.ctx.schedule.is_break()
    }

    pub fn link_state(&self) -> LinkState {
        self.ctx.link.state()
    }

    pub fn status(&self) -> GatewayStatus {
        let policy = self.ctx.schedule.policy();
        GatewayStatus {
            connected: self.link_state() == LinkState::Connected,
            door: self.door_status(),
            is_break: policy.is_break,
            fallback_allowed: policy.fallback_allowed(),
            missed_heartbeats: self.ctx.heartbeat.snapshot().consecutive_failures,
            last_uid: self.last_observed_uid(),
        }
    }

    /// Write an operator-supplied line to the reader.
    pub async fn send_raw_command(&self, text: &str) -> Result<(), GatewayError> {
        self.ctx.link.send_raw(text).await?;
        self.ctx.log_command(text, CommandSource::Dashboard);
        Ok(())
    }

    pub fn shutdown(&self) {
        info!("Gateway shutdown requested");
        self.ctx.cancel.cancel();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
