//! Shared per-peer replication state.
//!
//! The registry is the single rendezvous point between the supervisor loop
//! and the per-peer sending loops. All access goes through short, await-free
//! critical sections; network I/O is never performed while the lock is held.
//!
//! # Sender Lifecycle Ownership
//!
//! Exactly one sending loop may exist per peer. The supervisor owns the
//! `absent → running` transition ([`PeerRegistry::attach_sender`], only after
//! a successful handshake); a sender owns its own `running → stopped`
//! transition and clears its handle on every self-exit path. The supervisor
//! additionally disposes the handle when a peer is marked for removal
//! ([`PeerRegistry::take_removed`]). Both paths mutate under the registry
//! lock, so the handle cannot be disposed twice.

use crate::config::PeerConfig;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

/// Connection health surfaced for operational visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnDiagnostic {
    /// No connection attempt has concluded yet.
    Unset,
    /// Data channel is up; carries the socket descriptor.
    Connected(i32),
    /// Last transmission failed; the sender is reconnecting.
    SendFailed,
    /// The sender exceeded its retry ceiling and is disabled until the next
    /// successful handshake.
    Fatal,
}

impl ConnDiagnostic {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnDiagnostic::Fatal)
    }
}

/// Replication state for one peer.
#[derive(Debug)]
pub struct PeerReplicationState {
    pub server_id: i32,
    pub ip: String,
    pub port: u16,

    /// Resume point the peer asked for during the last handshake
    /// (what *it* still needs to receive).
    pub receive_number: u64,
    pub receive_offset: u64,

    /// Last position successfully forwarded to this peer. Durably persisted
    /// by an external mechanism; the relay core reads and writes it here.
    pub send_number: u64,
    pub send_offset: u64,

    /// Peer must be (re)negotiated before streaming (re)starts.
    pub needs_sync: bool,

    /// Entry and its sender must be disposed on the next supervisor cycle.
    pub marked_for_removal: bool,

    pub diagnostic: ConnDiagnostic,

    /// Handle to the active sending loop. `Some` iff a loop is alive for this
    /// peer and `marked_for_removal` is false.
    pub sender: Option<JoinHandle<()>>,
}

impl PeerReplicationState {
    /// Fresh entry for a configured peer: needs a handshake, no sender yet.
    pub fn new(config: &PeerConfig) -> Self {
        Self {
            server_id: config.server_id,
            ip: config.ip.clone(),
            port: config.port,
            receive_number: 0,
            receive_offset: 0,
            send_number: 0,
            send_offset: 0,
            needs_sync: true,
            marked_for_removal: false,
            diagnostic: ConnDiagnostic::Unset,
            sender: None,
        }
    }
}

/// A peer due for a handshake, snapshotted out of the lock.
#[derive(Debug, Clone)]
pub struct SyncTarget {
    pub server_id: i32,
    pub ip: String,
    pub port: u16,
    pub receive_number: u64,
    pub receive_offset: u64,
}

/// Observable per-peer state for health reporting (no handles, no lock held
/// by the caller).
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub server_id: i32,
    pub ip: String,
    pub port: u16,
    pub needs_sync: bool,
    pub diagnostic: ConnDiagnostic,
    pub sender_alive: bool,
    pub send_number: u64,
    pub send_offset: u64,
}

/// Mutex-guarded map of peer replication state.
pub struct PeerRegistry {
    peers: Mutex<HashMap<i32, PeerReplicationState>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Build the registry from the configured peer set.
    pub fn from_peers(configs: &[PeerConfig]) -> Self {
        let registry = Self::new();
        for config in configs {
            registry.insert(PeerReplicationState::new(config));
        }
        registry
    }

    pub fn insert(&self, state: PeerReplicationState) {
        self.lock().insert(state.server_id, state);
    }

    pub fn contains(&self, server_id: i32) -> bool {
        self.lock().contains_key(&server_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn server_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Run `f` against one peer's state under the lock. Returns `None` if the
    /// peer is gone. `f` must not block (the lock is held across it).
    pub fn with_peer<R>(
        &self,
        server_id: i32,
        f: impl FnOnce(&mut PeerReplicationState) -> R,
    ) -> Option<R> {
        self.lock().get_mut(&server_id).map(f)
    }

    /// Flag a peer for disposal on the next supervisor cycle.
    pub fn mark_for_removal(&self, server_id: i32) {
        let _ = self.with_peer(server_id, |p| p.marked_for_removal = true);
    }

    /// Flag a peer for (re)negotiation.
    pub fn request_sync(&self, server_id: i32) {
        let _ = self.with_peer(server_id, |p| p.needs_sync = true);
    }

    pub fn clear_needs_sync(&self, server_id: i32) {
        let _ = self.with_peer(server_id, |p| p.needs_sync = false);
    }

    pub fn set_diagnostic(&self, server_id: i32, diagnostic: ConnDiagnostic) {
        let _ = self.with_peer(server_id, |p| p.diagnostic = diagnostic);
    }

    pub fn diagnostic(&self, server_id: i32) -> Option<ConnDiagnostic> {
        self.with_peer(server_id, |p| p.diagnostic)
    }

    /// Persist the forwarded position for a peer; returns the stored
    /// `send_number` so callers can fold their rollback floor forward.
    pub fn update_send_position(&self, server_id: i32, number: u64, offset: u64) -> Option<u64> {
        self.with_peer(server_id, |p| {
            p.send_number = number;
            p.send_offset = offset;
            p.send_number
        })
    }

    pub fn send_position(&self, server_id: i32) -> Option<(u64, u64)> {
        self.with_peer(server_id, |p| (p.send_number, p.send_offset))
    }

    /// Store the handle of a freshly spawned sending loop.
    ///
    /// Refused (returning the handle back) if the peer is gone, marked for
    /// removal, or already has a live sender — the caller must dispose it.
    pub fn attach_sender(
        &self,
        server_id: i32,
        handle: JoinHandle<()>,
    ) -> Result<(), JoinHandle<()>> {
        let mut peers = self.lock();
        match peers.get_mut(&server_id) {
            Some(p) if !p.marked_for_removal && p.sender.is_none() => {
                p.sender = Some(handle);
                Ok(())
            }
            _ => Err(handle),
        }
    }

    /// Detach a peer's sender handle, if any. Used by a sender on self-exit
    /// and by tests; pruning of removed peers goes through
    /// [`take_removed`](Self::take_removed).
    pub fn clear_sender(&self, server_id: i32) -> Option<JoinHandle<()>> {
        self.lock().get_mut(&server_id)?.sender.take()
    }

    pub fn sender_alive(&self, server_id: i32) -> bool {
        self.with_peer(server_id, |p| p.sender.is_some()).unwrap_or(false)
    }

    /// Erase every peer marked for removal, returning their sender handles
    /// for disposal outside the lock.
    pub fn take_removed(&self) -> Vec<(i32, Option<JoinHandle<()>>)> {
        let mut peers = self.lock();
        let doomed: Vec<i32> = peers
            .iter()
            .filter(|(_, p)| p.marked_for_removal)
            .map(|(&id, _)| id)
            .collect();
        doomed
            .into_iter()
            .filter_map(|id| peers.remove(&id).map(|mut p| (id, p.sender.take())))
            .collect()
    }

    /// Peers due for a handshake: flagged `needs_sync`, no live sender, not
    /// marked for removal. Snapshotted so the handshake runs outside the lock.
    pub fn sync_candidates(&self) -> Vec<SyncTarget> {
        self.lock()
            .values()
            .filter(|p| p.needs_sync && p.sender.is_none() && !p.marked_for_removal)
            .map(|p| SyncTarget {
                server_id: p.server_id,
                ip: p.ip.clone(),
                port: p.port,
                receive_number: p.receive_number,
                receive_offset: p.receive_offset,
            })
            .collect()
    }

    /// Point-in-time view of every peer, for health reporting.
    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut rows: Vec<PeerSnapshot> = self
            .lock()
            .values()
            .map(|p| PeerSnapshot {
                server_id: p.server_id,
                ip: p.ip.clone(),
                port: p.port,
                needs_sync: p.needs_sync,
                diagnostic: p.diagnostic,
                sender_alive: p.sender.is_some(),
                send_number: p.send_number,
                send_offset: p.send_offset,
            })
            .collect();
        rows.sort_by_key(|r| r.server_id);
        rows
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i32, PeerReplicationState>> {
        self.peers.lock().expect("peer registry poisoned")
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> PeerRegistry {
        PeerRegistry::from_peers(&[
            PeerConfig::for_testing(2, "10.0.0.2", 6379),
            PeerConfig::for_testing(3, "10.0.0.3", 6379),
        ])
    }

    #[test]
    fn test_from_peers_initial_state() {
        let registry = test_registry();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.server_ids(), vec![2, 3]);
        let snapshot = registry.snapshot();
        assert!(snapshot.iter().all(|p| p.needs_sync));
        assert!(snapshot.iter().all(|p| !p.sender_alive));
        assert!(snapshot.iter().all(|p| p.diagnostic == ConnDiagnostic::Unset));
    }

    #[test]
    fn test_update_send_position_returns_number() {
        let registry = test_registry();
        assert_eq!(registry.update_send_position(2, 7, 4096), Some(7));
        assert_eq!(registry.send_position(2), Some((7, 4096)));
        assert_eq!(registry.update_send_position(99, 1, 1), None);
    }

    #[test]
    fn test_sync_candidates_filters() {
        let registry = test_registry();
        registry.clear_needs_sync(3);
        let candidates = registry.sync_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].server_id, 2);
        assert_eq!(candidates[0].ip, "10.0.0.2");
    }

    #[test]
    fn test_sync_candidates_skips_marked_for_removal() {
        let registry = test_registry();
        registry.mark_for_removal(2);
        let candidates = registry.sync_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].server_id, 3);
    }

    #[tokio::test]
    async fn test_attach_sender_once() {
        let registry = test_registry();
        let handle = tokio::spawn(async {});
        assert!(registry.attach_sender(2, handle).is_ok());
        assert!(registry.sender_alive(2));

        // Second attach refused while a sender is live.
        let second = tokio::spawn(async {});
        let refused = registry.attach_sender(2, second);
        assert!(refused.is_err());
        refused.unwrap_err().abort();
    }

    #[tokio::test]
    async fn test_attach_sender_refused_after_removal_mark() {
        let registry = test_registry();
        registry.mark_for_removal(2);
        let handle = tokio::spawn(async {});
        let refused = registry.attach_sender(2, handle);
        assert!(refused.is_err());
        refused.unwrap_err().abort();
    }

    #[tokio::test]
    async fn test_sync_candidates_skips_live_sender() {
        let registry = test_registry();
        let handle = tokio::spawn(async {});
        registry.attach_sender(2, handle).unwrap();
        let candidates = registry.sync_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].server_id, 3);
    }

    #[tokio::test]
    async fn test_clear_sender_returns_handle() {
        let registry = test_registry();
        let handle = tokio::spawn(async {});
        registry.attach_sender(2, handle).unwrap();

        let taken = registry.clear_sender(2);
        assert!(taken.is_some());
        assert!(!registry.sender_alive(2));
        assert!(registry.clear_sender(2).is_none());
        taken.unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_take_removed_erases_and_yields_handles() {
        let registry = test_registry();
        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        registry.attach_sender(2, handle).unwrap();
        registry.mark_for_removal(2);

        let removed = registry.take_removed();
        assert_eq!(removed.len(), 1);
        let (id, sender) = removed.into_iter().next().unwrap();
        assert_eq!(id, 2);
        let sender = sender.unwrap();
        sender.abort();
        assert!(!registry.contains(2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_take_removed_empty_when_nothing_marked() {
        let registry = test_registry();
        assert!(registry.take_removed().is_empty());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_diagnostic_transitions() {
        let registry = test_registry();
        registry.set_diagnostic(2, ConnDiagnostic::Connected(11));
        assert_eq!(registry.diagnostic(2), Some(ConnDiagnostic::Connected(11)));
        registry.set_diagnostic(2, ConnDiagnostic::SendFailed);
        assert!(!registry.diagnostic(2).unwrap().is_fatal());
        registry.set_diagnostic(2, ConnDiagnostic::Fatal);
        assert!(registry.diagnostic(2).unwrap().is_fatal());
    }

    #[test]
    fn test_request_sync_roundtrip() {
        let registry = test_registry();
        registry.clear_needs_sync(2);
        assert!(registry.sync_candidates().iter().all(|c| c.server_id != 2));
        registry.request_sync(2);
        assert!(registry.sync_candidates().iter().any(|c| c.server_id == 2));
    }
}
