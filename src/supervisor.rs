// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Peer supervision: removal, handshakes, sender lifecycle.
//!
//! A single periodic loop scans the registry every cycle:
//!
//! 1. Peers marked for removal are disposed — their sending task is aborted
//!    and the registry entry erased.
//! 2. Every remaining peer flagged `needs_sync` with no live sender is
//!    renegotiated: a short-lived control connection carries one
//!    `INTERNALTRYSYNC` exchange, and an `OK` reply clears the flag and
//!    starts the peer's sending loop.
//!
//! The registry lock is only held to snapshot candidates and mutate flags;
//! all network I/O happens between critical sections. A failed handshake
//! leaves `needs_sync` set, so the peer is retried on the next cycle.
//!
//! The handshake connection is closed after the exchange regardless of
//! outcome — streaming uses a separate connection on the data port.

use crate::binlog::BinlogManager;
use crate::cache::ConflictCache;
use crate::codec;
use crate::config::RelaySettings;
use crate::error::{RelayError, Result};
use crate::matrix::RecoverOffsetMatrix;
use crate::metrics;
use crate::net::{Connector, LinkTimeouts};
use crate::registry::{PeerRegistry, SyncTarget};
use crate::sender::run_sender;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything one supervisor cycle needs; senders it spawns borrow from the
/// same set of shared handles.
pub struct SupervisorContext {
    pub local_ip: String,
    pub local_port: u16,
    pub settings: RelaySettings,
    pub registry: Arc<PeerRegistry>,
    pub matrix: Arc<RecoverOffsetMatrix>,
    pub cache: Arc<ConflictCache>,
    pub manager: Arc<dyn BinlogManager>,
    pub connector: Arc<dyn Connector>,
    pub shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

/// Run the supervision loop until shutdown.
pub async fn run_supervisor(ctx: SupervisorContext) {
    let mut shutdown_rx = ctx.shutdown_rx.clone();
    let mut ticker = tokio::time::interval(ctx.settings.sync_interval_duration());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        interval = %ctx.settings.sync_interval,
        "supervisor started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                supervise_once(&ctx).await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!("supervisor stopped");
}

/// One supervision cycle: prune removed peers, then renegotiate peers that
/// need it.
pub async fn supervise_once(ctx: &SupervisorContext) {
    // Pass 1: dispose peers marked for removal. Handles are aborted outside
    // the lock.
    for (server_id, sender) in ctx.registry.take_removed() {
        if let Some(handle) = sender {
            handle.abort();
        }
        metrics::record_peer_removed(server_id);
        info!(peer = server_id, "removed peer and disposed its sender");
    }

    // Pass 2: handshake every candidate, outside the lock.
    for target in ctx.registry.sync_candidates() {
        if *ctx.shutdown_rx.borrow() {
            return;
        }

        match handshake(ctx, &target).await {
            Ok(()) => {
                ctx.registry.clear_needs_sync(target.server_id);
                metrics::record_handshake(target.server_id, true);
                info!(
                    peer = target.server_id,
                    addr = %format!("{}:{}", target.ip, target.port),
                    "handshake succeeded"
                );
                start_sender(ctx, &target);
            }
            Err(e) => {
                metrics::record_handshake(target.server_id, false);
                warn!(
                    peer = target.server_id,
                    addr = %format!("{}:{}", target.ip, target.port),
                    error = %e,
                    "handshake failed, will retry"
                );
            }
        }
    }

    let active = ctx
        .registry
        .snapshot()
        .iter()
        .filter(|p| p.sender_alive)
        .count();
    metrics::set_active_senders(active);
}

/// One `INTERNALTRYSYNC` exchange over a short-lived control connection.
///
/// Dropping the link on return closes the connection in every outcome.
async fn handshake(ctx: &SupervisorContext, target: &SyncTarget) -> Result<()> {
    let timeouts = LinkTimeouts::from(&ctx.settings);
    let mut link = ctx
        .connector
        .connect(target.server_id, &target.ip, target.port, timeouts)
        .await?;

    let mut command = Vec::new();
    codec::encode_command_str(
        &[
            "INTERNALTRYSYNC",
            &ctx.local_ip,
            &ctx.local_port.to_string(),
            &target.receive_number.to_string(),
            &target.receive_offset.to_string(),
        ],
        &mut command,
    );
    link.send_all(&command).await?;

    let reply = link.recv_reply().await?;
    if reply.is_ok() {
        Ok(())
    } else {
        Err(RelayError::handshake(
            target.server_id,
            format!("reply: {}", reply.token()),
        ))
    }
}

/// Spawn the peer's sending loop and park its handle in the registry.
///
/// The registry refuses the handle if the peer vanished or a sender raced us
/// in; the fresh task is then aborted before it does any work.
fn start_sender(ctx: &SupervisorContext, target: &SyncTarget) {
    let handle = tokio::spawn(run_sender(
        target.server_id,
        target.ip.clone(),
        target.port,
        ctx.settings.clone(),
        Arc::clone(&ctx.registry),
        Arc::clone(&ctx.matrix),
        Arc::clone(&ctx.cache),
        Arc::clone(&ctx.manager),
        Arc::clone(&ctx.connector),
        ctx.shutdown_rx.clone(),
    ));

    match ctx.registry.attach_sender(target.server_id, handle) {
        Ok(()) => debug!(peer = target.server_id, "sender started"),
        Err(refused) => {
            refused.abort();
            warn!(peer = target.server_id, "sender not attached, aborted");
        }
    }
}
