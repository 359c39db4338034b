// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the relay engine.
//!
//! Errors are categorized by their source (peer connection, change log,
//! handshake, etc.) and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Connection` | Yes | Connect/send/receive failures on a peer link |
//! | `Handshake` | Yes | Bad reply or network failure during trysync |
//! | `LogRead` | Yes (bounded) | Change-log reader failure |
//! | `LogOpen` | No | Change-log reader could not be (re)opened |
//! | `Protocol` | No | Malformed wire reply |
//! | `PeerVanished` | No | Peer removed from the registry mid-operation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`RelayError::is_retryable()`] to determine if an operation should be
//! retried with backoff. Connection errors are retried indefinitely on a fixed
//! backoff; log-read errors are retried up to a configured ceiling before the
//! affected sender is disabled.

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while relaying the change log to peers.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Connect, send, or receive failure on a peer link.
    ///
    /// Retryable: the owning loop backs off and reconnects.
    #[error("Connection error (peer {server_id}): {message}")]
    Connection { server_id: i32, message: String },

    /// Handshake failure: the peer replied with something other than OK,
    /// or the exchange failed at the network level.
    ///
    /// Retryable on the next supervisor cycle.
    #[error("Handshake error (peer {server_id}): {message}")]
    Handshake { server_id: i32, message: String },

    /// Change-log read failure.
    ///
    /// Retried a bounded number of times; exceeding the ceiling disables
    /// the affected sender until the next successful handshake.
    #[error("Change-log read error: {0}")]
    LogRead(String),

    /// Change-log reader could not be opened at the requested position.
    ///
    /// Not retryable: the sender is disabled.
    #[error("Change-log open error (file {file_number}): {message}")]
    LogOpen { file_number: u64, message: String },

    /// Malformed wire reply.
    ///
    /// Not retryable: the data is wrong at the source.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Peer disappeared from the registry mid-operation (concurrent removal).
    ///
    /// Not retryable: the affected loop terminates without side effects.
    #[error("Peer {0} vanished from registry")]
    PeerVanished(i32),

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Engine state machine violation.
    ///
    /// Not retryable: indicates a bug in the caller.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Create a connection error.
    pub fn connection(server_id: i32, message: impl Into<String>) -> Self {
        Self::Connection {
            server_id,
            message: message.into(),
        }
    }

    /// Create a handshake error.
    pub fn handshake(server_id: i32, message: impl Into<String>) -> Self {
        Self::Handshake {
            server_id,
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Handshake { .. } => true,
            Self::LogRead(_) => true, // bounded by the sender's retry ceiling
            Self::LogOpen { .. } => false,
            Self::Protocol(_) => false,
            Self::PeerVanished(_) => false,
            Self::Shutdown => false,
            Self::InvalidState { .. } => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(format!("I/O: {}", e))
    }
}
