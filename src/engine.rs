// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relay engine coordinator.
//!
//! The main orchestrator that ties together:
//! - Shared peer state via [`crate::registry::PeerRegistry`]
//! - Forwarded-offset bookkeeping via [`crate::matrix::RecoverOffsetMatrix`]
//! - Freshness decisions via [`crate::cache::ConflictCache`]
//! - The supervision loop via [`crate::supervisor`]
//! - Per-peer sending loops via [`crate::sender`]
//!
//! # Lifecycle
//!
//! ```text
//!                 start()
//! Created ───────────────────→ Running
//!    │                            │
//!    │ (never started)  shutdown()│
//!    ↓                            ↓
//! Stopped ←──────────────── ShuttingDown
//! ```
//!
//! `start()` spawns the supervisor; the supervisor spawns a sender per peer
//! after each successful handshake. `shutdown()` flips the shared stop signal,
//! waits for the supervisor, then drains remaining sender tasks with a
//! bounded timeout.

use crate::binlog::BinlogManager;
use crate::cache::ConflictCache;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::matrix::RecoverOffsetMatrix;
use crate::metrics;
use crate::net::{Connector, TcpConnector};
use crate::registry::{PeerRegistry, PeerSnapshot};
use crate::supervisor::{run_supervisor, SupervisorContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// How long shutdown waits for each outstanding task before aborting it.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// State of the relay engine.
///
/// See module docs for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    Created,
    /// Supervisor running; senders come and go per handshake outcomes.
    Running,
    /// `shutdown()` called; tasks are draining.
    ShuttingDown,
    /// Shut down cleanly. Safe to drop.
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Point-in-time engine health, collected without network I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    pub peers_total: usize,
    pub senders_active: usize,
    pub peers_needing_sync: usize,
    pub peers_fatal: usize,
    pub peers: Vec<PeerSnapshot>,
    /// Running, with no peer stuck in a fatal diagnostic.
    pub healthy: bool,
}

/// The replication core of a multi-master KV node.
///
/// Construction wires the shared state from configuration; [`start()`]
/// (Self::start) brings up the supervision loop. The change log and the
/// local write path stay external: the engine consumes the log through the
/// [`BinlogManager`] seam and exposes [`conflict_cache()`](Self::conflict_cache)
/// for the write path to populate.
pub struct RelayEngine {
    config: RelayConfig,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    registry: Arc<PeerRegistry>,
    matrix: Arc<RecoverOffsetMatrix>,
    cache: Arc<ConflictCache>,
    manager: Arc<dyn BinlogManager>,
    connector: Arc<dyn Connector>,

    supervisor: Option<tokio::task::JoinHandle<()>>,
}

impl RelayEngine {
    /// Create an engine over the production TCP transport.
    pub fn new(config: RelayConfig, manager: Arc<dyn BinlogManager>) -> Self {
        Self::with_connector(config, manager, Arc::new(TcpConnector))
    }

    /// Create an engine with an explicit transport (used by tests).
    pub fn with_connector(
        config: RelayConfig,
        manager: Arc<dyn BinlogManager>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let registry = Arc::new(PeerRegistry::from_peers(&config.peers));

        // Matrix shape is fixed here: the local node plus every configured
        // peer. Runtime membership changes are out of model.
        let mut server_ids: Vec<i32> =
            config.peers.iter().map(|p| p.server_id).collect();
        server_ids.push(config.local_server_id);
        server_ids.sort_unstable();
        server_ids.dedup();
        let matrix = Arc::new(RecoverOffsetMatrix::new(&server_ids));

        let cache = Arc::new(ConflictCache::new(config.conflict_cache_capacity));

        Self {
            config,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            registry,
            matrix,
            cache,
            manager,
            connector,
            supervisor: None,
        }
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// The shared freshness cache, for the local write path to populate.
    pub fn conflict_cache(&self) -> &Arc<ConflictCache> {
        &self.cache
    }

    /// The shared peer registry (diagnostics, operational tooling).
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// The forwarded-offset matrix (recovery tooling).
    pub fn matrix(&self) -> &Arc<RecoverOffsetMatrix> {
        &self.matrix
    }

    /// The local node's identity.
    pub fn server_id(&self) -> i32 {
        self.config.local_server_id
    }

    /// Flag a peer for renegotiation on the next supervisor cycle.
    pub fn request_sync(&self, server_id: i32) {
        self.registry.request_sync(server_id);
    }

    /// Flag a peer for disposal on the next supervisor cycle.
    pub fn remove_peer(&self, server_id: i32) {
        self.registry.mark_for_removal(server_id);
    }

    /// Start the supervision loop.
    ///
    /// Senders start individually as handshakes succeed; a peer that cannot
    /// be negotiated keeps being retried every cycle without blocking the
    /// rest of the mesh.
    pub fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(RelayError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            server_id = self.config.local_server_id,
            peer_count = self.config.peers.len(),
            "starting relay engine"
        );

        let ctx = SupervisorContext {
            local_ip: self.config.local_ip.clone(),
            local_port: self.config.local_port,
            settings: self.config.settings.clone(),
            registry: Arc::clone(&self.registry),
            matrix: Arc::clone(&self.matrix),
            cache: Arc::clone(&self.cache),
            manager: Arc::clone(&self.manager),
            connector: Arc::clone(&self.connector),
            shutdown_rx: self.shutdown_rx.clone(),
        };
        self.supervisor = Some(tokio::spawn(run_supervisor(ctx)));

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state("Running");
        Ok(())
    }

    /// Shutdown the engine gracefully.
    ///
    /// 1. Signal every loop to stop
    /// 2. Wait for the supervisor
    /// 3. Drain remaining sender tasks (abort on timeout)
    pub async fn shutdown(&mut self) {
        info!("shutting down relay engine");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.supervisor.take() {
            if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("supervisor did not stop in time");
            }
        }

        // Senders clear their own registry handles on exit; whatever is left
        // gets a bounded wait, then the axe.
        for server_id in self.registry.server_ids() {
            if let Some(handle) = self.registry.clear_sender(server_id) {
                match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(peer = server_id, error = %e, "sender task panicked during shutdown")
                    }
                    Err(_) => warn!(peer = server_id, "sender did not stop in time"),
                }
            }
        }

        metrics::set_active_senders(0);
        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!("relay engine stopped");
    }

    /// Comprehensive health status for monitoring endpoints.
    ///
    /// Collected entirely from shared in-memory state.
    pub fn health_check(&self) -> HealthCheck {
        let peers = self.registry.snapshot();
        let peers_total = peers.len();
        let senders_active = peers.iter().filter(|p| p.sender_alive).count();
        let peers_needing_sync = peers.iter().filter(|p| p.needs_sync).count();
        let peers_fatal = peers.iter().filter(|p| p.diagnostic.is_fatal()).count();
        let state = self.state();

        HealthCheck {
            state,
            peers_total,
            senders_active,
            peers_needing_sync,
            peers_fatal,
            peers,
            healthy: state == EngineState::Running && peers_fatal == 0,
        }
    }
}
