//! Command dispatcher: the read loop.
//!
//! Owns the read half of the link. Each received line is mirrored to the
//! command log, decoded, and acted on; a lost link sends it back to
//! `LinkManager::open` without stopping the other tasks.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::codec::{decode_frame, Verb};
use crate::error::GatewayError;
use crate::gateway::GatewayContext;
use crate::policy::{required_mode, CardRead};
use crate::store::CommandSource;

/// What the read loop does after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Exit,
}

/// Run until `EXIT` arrives or the gateway is shut down.
pub async fn run_dispatcher(ctx: Arc<GatewayContext>) {
    'connection: loop {
        let mut reader = match ctx.link.open(&ctx.cancel).await {
            Ok(reader) => reader,
            Err(GatewayError::Cancelled) => break,
            Err(e) => {
                error!(error = %e, "Cannot open serial link, dispatcher stopping");
                break;
            }
        };

        ctx.heartbeat.reset();
        let fallback = ctx.schedule.policy().fallback_allowed();
        if let Err(e) = ctx.link.send_ntfy(fallback).await {
            warn!(error = %e, "Could not announce mode to reader");
        }

        loop {
            let line = tokio::select! {
                _ = ctx.cancel.cancelled() => break 'connection,
                line = ctx.link.read_line(&mut reader) => line,
            };
            match line {
                Ok(line) => {
                    if handle_line(&ctx, &line).await == Flow::Exit {
                        ctx.cancel.cancel();
                        break 'connection;
                    }
                }
                Err(e) if e.is_link_failure() => {
                    warn!(error = %e, "Serial read failed, reconnecting");
                    continue 'connection;
                }
                Err(e) => {
                    error!(error = %e, "Unexpected read error, reconnecting");
                    continue 'connection;
                }
            }
        }
    }
    ctx.cancel.cancel();
    debug!("Dispatcher stopped");
}

/// Act on one received line.
pub(crate) async fn handle_line(ctx: &GatewayContext, line: &str) -> Flow {
    ctx.log_command(line, CommandSource::Serial);
    let Some(frame) = decode_frame(line) else {
        return Flow::Continue;
    };

    match frame.verb {
        Verb::Card => handle_card(ctx, frame.argument.as_deref().unwrap_or("")).await,
        Verb::Pong => ctx.heartbeat.record_pong(frame.argument.as_deref()),
        Verb::Exit => {
            info!("EXIT received from reader");
            return Flow::Exit;
        }
        other => {
            debug!(verb = %other, "Ignoring frame");
            return Flow::Continue;
        }
    }

    tokio::time::sleep(ctx.config.timing.frame_pause()).await;
    Flow::Continue
}

/// `CARD <block0>`: authorize, answer `AUTH`, log the attempt.
async fn handle_card(ctx: &GatewayContext, block0: &str) {
    let policy = ctx.schedule.policy();
    let mut card = CardRead::from_block0(block0);
    let granted = ctx.policy.authorize(&mut card, required_mode(&policy)).await;

    if !policy.response_delay.is_zero() {
        tokio::time::sleep(policy.response_delay).await;
    }
    if let Err(e) = ctx
        .link
        .send_frame(&Verb::Auth, Some(if granted { "1" } else { "0" }))
        .await
    {
        warn!(error = %e, "AUTH reply not delivered");
    }

    ctx.record_card(card).await;
}

// ===========================================================================
// Tests
// ===========================================================================
