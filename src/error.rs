use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::utils::OutcomeKind;

/// Errors produced by the transfer engine.
///
/// Everything except [`TransferError::Io`] on a local source/destination root
/// is contained to a single endpoint and ends up in that endpoint's
/// [`crate::ReceiverOutcome`].
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("no receivers answered within {0:?}")]
    DiscoveryTimeout(Duration),

    #[error("transfer rejected: {0}")]
    HandshakeRejected(String),

    #[error("no decision from receiver within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("stream integrity error: {0}")]
    StreamIntegrity(String),

    #[error("malformed archive: {0}")]
    ArchiveFormat(String),

    #[error("archive entry escapes destination: {0}")]
    PathEscape(String),

    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    #[error("destination already in use: {}", .0.display())]
    DestinationConflict(PathBuf),

    #[error("invalid transfer key: {0}")]
    InvalidKey(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, TransferError>;

impl TransferError {
    /// Wraps a socket-level error. Used at every network boundary so that an
    /// I/O failure on a connection never looks like a local disk failure.
    pub fn connection(err: impl std::fmt::Display) -> Self {
        TransferError::ConnectionFailure(err.to_string())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        TransferError::StreamIntegrity(msg.into())
    }

    /// Outcome category reported for an endpoint that terminated with this error.
    pub fn outcome_kind(&self) -> OutcomeKind {
        match self {
            TransferError::HandshakeRejected(_) | TransferError::InvalidKey(_) => {
                OutcomeKind::Rejected
            }
            TransferError::HandshakeTimeout(_) | TransferError::DiscoveryTimeout(_) => {
                OutcomeKind::TimedOut
            }
            TransferError::StreamIntegrity(_) | TransferError::Protocol(_) => {
                OutcomeKind::IntegrityFailure
            }
            TransferError::ArchiveFormat(_) | TransferError::PathEscape(_) => {
                OutcomeKind::ArchiveFailure
            }
            TransferError::DestinationConflict(_) => OutcomeKind::DestinationConflict,
            TransferError::Cancelled => OutcomeKind::Cancelled,
            TransferError::ConnectionFailure(_) => OutcomeKind::NetworkFailure,
            TransferError::Io(_) => OutcomeKind::LocalFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_kind_mapping() {
        assert_eq!(
            TransferError::HandshakeRejected("declined".into()).outcome_kind(),
            OutcomeKind::Rejected
        );
        assert_eq!(
            TransferError::HandshakeTimeout(Duration::from_secs(1)).outcome_kind(),
            OutcomeKind::TimedOut
        );
        assert_eq!(
            TransferError::integrity("gap").outcome_kind(),
            OutcomeKind::IntegrityFailure
        );
        assert_eq!(
            TransferError::PathEscape("../x".into()).outcome_kind(),
            OutcomeKind::ArchiveFailure
        );
        assert_eq!(
            TransferError::connection("reset").outcome_kind(),
            OutcomeKind::NetworkFailure
        );
        assert_eq!(TransferError::Cancelled.outcome_kind(), OutcomeKind::Cancelled);
    }

    #[test]
    fn test_display_includes_detail() {
        let err = TransferError::DestinationConflict(PathBuf::from("/tmp/photo.jpg"));
        assert_eq!(err.to_string(), "destination already in use: /tmp/photo.jpg");

        let err = TransferError::connection("broken pipe");
        assert_eq!(err.to_string(), "connection failure: broken pipe");
    }
}
