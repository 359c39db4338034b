//! # Relay Engine
//!
//! The replication core of a multi-master key-value cluster: every node
//! forwards its locally-applied writes (set, delete, expire) to every peer,
//! with loop prevention and last-writer-wins conflict resolution.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            relay-engine                              │
//! │                                                                      │
//! │  ┌───────────────┐   spawns    ┌─────────────────────────────────┐   │
//! │  │ SyncSupervisor│────────────►│ OutboundSender (one per peer)   │   │
//! │  │ (trysync loop)│             │ read → filter → batch → send    │   │
//! │  └───────┬───────┘             └───────┬──────────────┬──────────┘   │
//! │          │                             │              │              │
//! │          ▼                             ▼              ▼              │
//! │  ┌───────────────┐   ┌─────────────────────┐  ┌───────────────────┐  │
//! │  │ PeerRegistry  │   │ RecoverOffsetMatrix │  │ ConflictCache     │  │
//! │  │ (shared state)│   │ (atomic per-cell)   │  │ (LRU, write path) │  │
//! │  └───────────────┘   └─────────────────────┘  └───────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Loops Per Mesh
//!
//! 1. **Supervision (control channel)**: every cycle, peers marked for
//!    removal are disposed and peers flagged `needs_sync` get one
//!    `INTERNALTRYSYNC` exchange; success starts their sending loop.
//! 2. **Streaming (data channel)**: each sender tails the local change log,
//!    drops a peer's own writes and anything the conflict cache calls stale
//!    or unknown, and pipelines the survivors as `SET`/`DEL`/`EXPIREAT`
//!    commands, one flush per batch.
//!
//! Delivery is at-least-once by design: resume points roll back to a safe
//! file boundary after any failure, and receivers apply the same freshness
//! check, so re-delivered commands are harmless.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use relay_engine::{RelayConfig, RelayEngine};
//! use relay_engine::config::PeerConfig;
//! # use relay_engine::binlog::{BinlogManager, BinlogReader, BoxFuture, ReadBatch};
//! # struct MyBinlog;
//! # impl BinlogManager for MyBinlog {
//! #     fn open_reader(&self, _n: u64, _o: u64) -> BoxFuture<'_, Box<dyn BinlogReader>> {
//! #         unimplemented!()
//! #     }
//! # }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RelayConfig {
//!         local_server_id: 1,
//!         peers: vec![PeerConfig::for_testing(2, "10.0.0.2", 6379)],
//!         ..Default::default()
//!     };
//!
//!     let mut engine = RelayEngine::new(config, std::sync::Arc::new(MyBinlog));
//!     engine.start().expect("failed to start");
//!
//!     // The local write path keeps the conflict cache current.
//!     engine.conflict_cache().insert("key", 1_700_000_000);
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await;
//! }
//! ```

pub mod binlog;
pub mod cache;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod matrix;
pub mod metrics;
pub mod net;
pub mod registry;
pub mod sender;
pub mod supervisor;

// Re-exports for convenience
pub use binlog::{BinlogManager, BinlogReader, ChangeLogRecord, ReadBatch, RecordOp};
pub use cache::ConflictCache;
pub use config::{PeerConfig, RelayConfig, RelaySettings};
pub use engine::{EngineState, HealthCheck, RelayEngine};
pub use error::{RelayError, Result};
pub use matrix::RecoverOffsetMatrix;
pub use registry::{ConnDiagnostic, PeerRegistry, PeerReplicationState, PeerSnapshot};
pub use sender::run_sender;
