use std::io;

use thiserror::Error;

/// Failures raised by ledger operations and the lock protocol.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Account or user lookup failed, or the account is not owned by the caller.
    #[error("account lookup failed")]
    Invalid,
    /// Insufficient balance, or a lock could not be obtained.
    #[error("operation could not be completed")]
    Logic,
    /// The target account of a transfer is invalid.
    #[error("transfer destination is invalid")]
    Destination,
    /// The nonce was already processed for this account.
    #[error("duplicate transaction")]
    DuplicateTransaction { recorded: String },
    /// Raw storage failure. Never shown to clients.
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Failures on a line-delimited socket channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out waiting for a reply")]
    Timeout,
    #[error("connection closed by peer")]
    Closed,
    #[error("peer rejected the handshake: {0}")]
    Rejected(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Timeouts and broken connections are recoverable by reconnecting.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TransportError::Timeout | TransportError::Closed => true,
            TransportError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::ConnectionRefused
            ),
            TransportError::Rejected(_) => false,
        }
    }
}
