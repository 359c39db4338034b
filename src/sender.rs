//! Outbound streaming: one sending loop per peer.
//!
//! Each peer gets a dedicated task that tails the local change log and
//! forwards surviving records over a persistent data-channel connection:
//!
//! ```text
//! Connecting ──────────► Streaming ──────────► Stopped
//!     ↑                     │  │         (reader exit / shutdown /
//!     │    (send failure,   │  │          retry ceiling / peer gone)
//!     │     read failure)   │  │
//!     └── ResettingReader ◄─┘  │
//!              ▲               │
//!              └───────────────┘
//! ```
//!
//! # Record Filtering
//!
//! For every record read, in order:
//! 1. Records originated by the target peer itself are dropped — a peer must
//!    never get its own writes echoed back.
//! 2. The recover-offset matrix cell for (origin, target) is advanced.
//! 3. The conflict cache decides freshness: a miss drops the record (fail
//!    safe), a cached timestamp newer than the record drops it (superseded),
//!    anything else forwards.
//!
//! # Resume Safety
//!
//! After every successful flush the reader's position is persisted into the
//! registry. On any reset the reader reopens at a rolled-back file index
//! (`send_number - 1` once streaming has advanced) and byte offset 0: the
//! persisted byte offset is not guaranteed to sit on a record boundary, and
//! re-delivered records are absorbed by the receiver's own freshness check.

use crate::binlog::{BinlogManager, BinlogReader, ChangeLogRecord, ReadBatch};
use crate::cache::ConflictCache;
use crate::config::RelaySettings;
use crate::matrix::RecoverOffsetMatrix;
use crate::metrics;
use crate::net::{Connector, Link, LinkTimeouts};
use crate::registry::{ConnDiagnostic, PeerRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

/// Why a record was not forwarded (or that it was).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    /// Accept: append to the outbound buffer.
    Forward,
    /// The target peer originated this write.
    OriginLoop,
    /// No cache entry for the key; freshness cannot be established.
    CacheMiss,
    /// A newer local write to the key supersedes this record.
    Stale,
}

/// Decide whether `record` is forwarded to peer `server_id`, advancing the
/// recover-offset matrix for every record that passes the origin check.
pub fn admit_record(
    record: &ChangeLogRecord,
    server_id: i32,
    matrix: &RecoverOffsetMatrix,
    cache: &ConflictCache,
) -> Admit {
    if record.origin_server_id == server_id {
        return Admit::OriginLoop;
    }

    matrix.advance(record.origin_server_id, server_id, record.file_number);

    match cache.exec_time(&record.key) {
        None => Admit::CacheMiss,
        Some(cached) if record.exec_time < cached => Admit::Stale,
        Some(_) => Admit::Forward,
    }
}

/// Fold the rollback floor forward from the last persisted send position.
///
/// Never moves past what has been durably sent (`send_number - 1`), and never
/// regresses below a previously chosen rollback.
pub fn fold_rollback(send_number: u64, rollback: u64) -> u64 {
    if send_number > rollback + 1 {
        send_number - 1
    } else {
        rollback
    }
}

/// How the sending loop ended, for the final log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SenderExit {
    Shutdown,
    ReaderExit,
    Fatal,
    PeerVanished,
}

/// Run the sending loop for a single peer until it stops.
///
/// Spawned by the supervisor after a successful handshake; the task's
/// `JoinHandle` lives in the registry and is cleared here on every self-exit
/// path (the supervisor only disposes it when the peer is removed).
#[allow(clippy::too_many_arguments)]
pub async fn run_sender(
    server_id: i32,
    ip: String,
    port: u16,
    settings: RelaySettings,
    registry: Arc<PeerRegistry>,
    matrix: Arc<RecoverOffsetMatrix>,
    cache: Arc<ConflictCache>,
    manager: Arc<dyn BinlogManager>,
    connector: Arc<dyn Connector>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("sender", peer = server_id);

    async move {
        let timeouts = LinkTimeouts::from(&settings);
        let data_port = port.saturating_add(settings.data_port_offset);

        metrics::record_sender_state(server_id, "connecting");

        // Resume from the position persisted for this peer.
        let Some((number, offset)) = registry.send_position(server_id) else {
            warn!("peer gone before streaming started");
            finish(&registry, server_id, SenderExit::PeerVanished);
            return;
        };

        let mut reader: Box<dyn BinlogReader> = match manager.open_reader(number, offset).await {
            Ok(reader) => reader,
            Err(e) => {
                error!(error = %e, number, offset, "failed to open initial reader");
                registry.set_diagnostic(server_id, ConnDiagnostic::Fatal);
                finish(&registry, server_id, SenderExit::Fatal);
                return;
            }
        };
        info!(number, offset, "resuming change log");

        let mut link: Option<Box<dyn Link>> = None;
        let mut buffer: Vec<u8> = Vec::new();
        let mut rollback: u64 = 0;
        let mut error_times: u32 = 0;
        let mut reset_reader = false;
        let exit;

        loop {
            if *shutdown_rx.borrow() {
                exit = SenderExit::Shutdown;
                break;
            }

            if reset_reader {
                let Some(send_number) =
                    registry.with_peer(server_id, |p| p.send_number)
                else {
                    exit = SenderExit::PeerVanished;
                    break;
                };
                rollback = fold_rollback(send_number, rollback);
                metrics::record_reader_reset(server_id, rollback);

                // Replacing the handle releases the previous reader; reopen
                // at byte 0 of the rollback file (the persisted byte offset
                // may split a record).
                match manager.open_reader(rollback, 0).await {
                    Ok(new_reader) => {
                        reader = new_reader;
                        reset_reader = false;
                        info!(rollback, "reader reset");
                    }
                    Err(e) => {
                        error!(error = %e, rollback, "failed to reopen reader");
                        registry.set_diagnostic(server_id, ConnDiagnostic::Fatal);
                        exit = SenderExit::Fatal;
                        break;
                    }
                }
            }

            if link.is_none() {
                match connector.connect(server_id, &ip, data_port, timeouts).await {
                    Ok(new_link) => {
                        let descriptor = new_link.descriptor();
                        registry
                            .set_diagnostic(server_id, ConnDiagnostic::Connected(descriptor));
                        metrics::record_connect(server_id, true);
                        metrics::record_sender_state(server_id, "streaming");
                        info!(%ip, data_port, descriptor, "connected to peer");
                        link = Some(new_link);
                    }
                    Err(e) => {
                        // Connect failures retry forever; they never count
                        // toward the fatal ceiling.
                        metrics::record_connect(server_id, false);
                        warn!(error = %e, %ip, data_port, "connect failed");
                        if pause(&mut shutdown_rx, settings.connect_backoff_duration()).await {
                            exit = SenderExit::Shutdown;
                            break;
                        }
                        continue;
                    }
                }
            }

            let batch = tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        exit = SenderExit::Shutdown;
                        break;
                    }
                    continue;
                }

                batch = reader.read_batch() => batch,
            };

            match batch {
                Ok(ReadBatch::Records(records)) => {
                    error_times = 0;
                    metrics::record_records_read(server_id, records.len());

                    let mut accepted = 0usize;
                    for record in &records {
                        match admit_record(record, server_id, &matrix, &cache) {
                            Admit::Forward => {
                                record.encode_wire_command(&mut buffer);
                                accepted += 1;
                            }
                            Admit::OriginLoop => {
                                metrics::record_record_dropped(server_id, "origin_loop");
                            }
                            Admit::CacheMiss => {
                                debug!(key = %record.key, "key not in conflict cache, dropping");
                                metrics::record_record_dropped(server_id, "cache_miss");
                            }
                            Admit::Stale => {
                                metrics::record_record_dropped(server_id, "stale");
                            }
                        }
                    }
                    metrics::record_records_forwarded(server_id, accepted);

                    if !buffer.is_empty() {
                        // The connect block above guarantees a live link here.
                        let Some(active) = link.as_mut() else {
                            continue;
                        };
                        let flush_start = Instant::now();
                        match active.send_all(&buffer).await {
                            Ok(()) => {
                                metrics::record_batch_flush(
                                    server_id,
                                    accepted,
                                    buffer.len(),
                                    flush_start.elapsed(),
                                );
                                buffer.clear();
                            }
                            Err(e) => {
                                warn!(error = %e, "transmission failed, resetting");
                                metrics::record_send_failure(server_id);
                                registry.set_diagnostic(server_id, ConnDiagnostic::SendFailed);
                                link = None;
                                // The buffer regenerates from the rollback
                                // point after the reader reset.
                                buffer.clear();
                                if pause(&mut shutdown_rx, settings.send_retry_delay()).await {
                                    exit = SenderExit::Shutdown;
                                    break;
                                }
                                reset_reader = true;
                                continue;
                            }
                        }
                    }

                    // The whole batch is either on the wire or filtered;
                    // persist the reader position as durably forwarded.
                    let (num, off) = reader.current_offset();
                    if registry.update_send_position(server_id, num, off).is_none() {
                        exit = SenderExit::PeerVanished;
                        break;
                    }
                }
                Ok(ReadBatch::EndOfLog) => {
                    info!("reader exit");
                    exit = SenderExit::ReaderExit;
                    break;
                }
                Err(e) => {
                    error_times += 1;
                    if error_times > settings.max_read_retries {
                        error!(
                            error = %e,
                            error_times,
                            "read retries exhausted, disabling sender"
                        );
                        registry.set_diagnostic(server_id, ConnDiagnostic::Fatal);
                        exit = SenderExit::Fatal;
                        break;
                    }
                    warn!(error = %e, error_times, "read failed, retrying");
                    if pause(&mut shutdown_rx, settings.read_retry_delay()).await {
                        exit = SenderExit::Shutdown;
                        break;
                    }
                    reset_reader = true;
                }
            }
        }

        finish(&registry, server_id, exit);
    }
    .instrument(span)
    .await
}

/// Clear the registry handle and record the terminal state.
fn finish(registry: &PeerRegistry, server_id: i32, exit: SenderExit) {
    // Dropping our own JoinHandle detaches the (already finishing) task.
    let _ = registry.clear_sender(server_id);
    let state = if exit == SenderExit::Fatal { "fatal" } else { "stopped" };
    metrics::record_sender_state(server_id, state);
    match exit {
        SenderExit::Shutdown => info!(peer = server_id, "sender stopped (shutdown)"),
        SenderExit::ReaderExit => info!(peer = server_id, "sender stopped (reader exit)"),
        SenderExit::Fatal => warn!(peer = server_id, "sender disabled until next handshake"),
        SenderExit::PeerVanished => info!(peer = server_id, "sender stopped (peer removed)"),
    }
}

/// Sleep for `duration` unless shutdown is signaled first; returns true on
/// shutdown. A closed channel counts as shutdown (the engine is gone).
async fn pause(shutdown_rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
    }
}
