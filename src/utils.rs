use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};

/// Shared data types for a transfer:
/// - what is being sent (`TransferDescriptor`)
/// - who it goes to (`Endpoint`)
/// - how each receiver ended up (`ReceiverOutcome`)
/// - the callbacks through which the engine talks to its front end

/// Immutable description of one outgoing transfer, built before any
/// handshake and shared read-only by every per-receiver pipeline.
#[derive(Debug, Clone)]
pub struct TransferDescriptor {
    /// Local path of the source.
    pub path: PathBuf,
    /// Name offered to receivers.
    pub name: String,
    /// Byte size, or `None` for a streamed directory.
    pub size: Option<u64>,
    pub chunk_size: usize,
    pub compression_level: u32,
    pub stream_count: usize,
    pub fanout: bool,
}

impl TransferDescriptor {
    /// Describes `path` under `config`. Directories are unbounded and
    /// therefore always single-stream.
    pub fn from_path(path: &Path, config: &TransferConfig) -> Result<Self> {
        let metadata = fs::metadata(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                TransferError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("cannot derive a transfer name from {}", path.display()),
                ))
            })?;
        let config = config.clone().normalized();
        let (size, stream_count) = if metadata.is_dir() {
            (None, 1)
        } else {
            (Some(metadata.len()), config.stream_count)
        };
        Ok(TransferDescriptor {
            path: path.to_path_buf(),
            name,
            size,
            chunk_size: config.chunk_size,
            compression_level: config.compression_level,
            stream_count,
            fanout: config.fanout,
        })
    }

    pub fn is_directory(&self) -> bool {
        self.size.is_none()
    }
}

/// A receiver address, discovered or supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub discovered: bool,
}

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Endpoint {
            addr,
            discovered: false,
        }
    }

    pub fn discovered(addr: SocketAddr) -> Self {
        Endpoint {
            addr,
            discovered: true,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

/// Terminal state category for one receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    Success,
    /// Receiver declined, entered a wrong key, or lost the fan-out race.
    Rejected,
    TimedOut,
    DestinationConflict,
    NetworkFailure,
    IntegrityFailure,
    ArchiveFailure,
    /// Local disk or file error while serving this receiver.
    LocalFailure,
    Cancelled,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OutcomeKind::Success => "success",
            OutcomeKind::Rejected => "rejected",
            OutcomeKind::TimedOut => "timed out",
            OutcomeKind::DestinationConflict => "destination conflict",
            OutcomeKind::NetworkFailure => "network failure",
            OutcomeKind::IntegrityFailure => "integrity failure",
            OutcomeKind::ArchiveFailure => "archive failure",
            OutcomeKind::LocalFailure => "local failure",
            OutcomeKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// How one receiver's transfer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverOutcome {
    pub endpoint: Endpoint,
    pub kind: OutcomeKind,
    pub detail: String,
    /// Plaintext bytes delivered.
    pub bytes_transferred: u64,
    /// Streams actually used.
    pub stream_count: usize,
}

impl ReceiverOutcome {
    pub fn success(endpoint: Endpoint, bytes_transferred: u64, stream_count: usize) -> Self {
        ReceiverOutcome {
            endpoint,
            kind: OutcomeKind::Success,
            detail: "transfer complete".into(),
            bytes_transferred,
            stream_count,
        }
    }

    pub fn failed(endpoint: Endpoint, error: &TransferError) -> Self {
        ReceiverOutcome {
            endpoint,
            kind: error.outcome_kind(),
            detail: error.to_string(),
            bytes_transferred: 0,
            stream_count: 0,
        }
    }

    pub fn with_progress(mut self, bytes_transferred: u64, stream_count: usize) -> Self {
        self.bytes_transferred = bytes_transferred;
        self.stream_count = stream_count;
        self
    }

    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }
}

// ============================================================================
// Collaborator callbacks
// ============================================================================

/// Offer details shown to the person deciding on the receiving side.
#[derive(Debug, Clone)]
pub struct IncomingOffer {
    pub sender: SocketAddr,
    pub name: String,
    pub size: Option<u64>,
    pub is_directory: bool,
    pub stream_count: usize,
    pub compression_level: u32,
}

/// Answer from the accept/key prompt.
#[derive(Debug, Clone, Default)]
pub struct UserDecision {
    pub accept: bool,
    pub key: Option<String>,
}

impl UserDecision {
    pub fn accept(key: impl Into<String>) -> Self {
        UserDecision {
            accept: true,
            key: Some(key.into()),
        }
    }

    pub fn decline() -> Self {
        UserDecision::default()
    }
}

/// `(peer, bytes transferred so far, total if known)`, called per chunk.
pub type ProgressCallback = Arc<dyn Fn(&Endpoint, u64, Option<u64>) + Send + Sync>;
/// Called once per incoming offer, on a blocking thread.
pub type DecisionCallback = Arc<dyn Fn(&IncomingOffer) -> UserDecision + Send + Sync>;
/// Called with the final outcome set of a transfer.
pub type CompletionCallback = Arc<dyn Fn(&[ReceiverOutcome]) + Send + Sync>;

/// Hooks connecting the engine to its front end. All optional; a receiver
/// without a decision callback declines every offer.
#[derive(Clone, Default)]
pub struct TransferHooks {
    pub progress: Option<ProgressCallback>,
    pub decision: Option<DecisionCallback>,
    pub completion: Option<CompletionCallback>,
}

impl TransferHooks {
    pub fn report_progress(&self, endpoint: &Endpoint, transferred: u64, total: Option<u64>) {
        if let Some(progress) = &self.progress {
            progress(endpoint, transferred, total);
        }
    }

    pub fn report_completion(&self, outcomes: &[ReceiverOutcome]) {
        if let Some(completion) = &self.completion {
            completion(outcomes);
        }
    }
}

impl fmt::Debug for TransferHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferHooks")
            .field("progress", &self.progress.is_some())
            .field("decision", &self.decision.is_some())
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn endpoint() -> Endpoint {
        Endpoint::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)), 25001))
    }

    #[test]
    fn test_descriptor_for_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.txt");
        let content = b"Test file content for metadata generation";
        fs::write(&path, content).unwrap();

        let config = TransferConfig {
            stream_count: 3,
            ..TransferConfig::default()
        };
        let descriptor = TransferDescriptor::from_path(&path, &config).unwrap();
        assert_eq!(descriptor.name, "test.txt");
        assert_eq!(descriptor.size, Some(content.len() as u64));
        assert_eq!(descriptor.stream_count, 3);
        assert!(!descriptor.is_directory());
    }

    #[test]
    fn test_descriptor_for_directory_is_single_stream() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("my_folder");
        fs::create_dir(&folder).unwrap();

        let config = TransferConfig {
            stream_count: 4,
            ..TransferConfig::default()
        };
        let descriptor = TransferDescriptor::from_path(&folder, &config).unwrap();
        assert_eq!(descriptor.name, "my_folder");
        assert!(descriptor.is_directory());
        assert_eq!(descriptor.stream_count, 1);
    }

    #[test]
    fn test_descriptor_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let result = TransferDescriptor::from_path(&dir.path().join("nope"), &TransferConfig::default());
        assert!(matches!(result, Err(TransferError::Io(_))));
    }

    #[test]
    fn test_outcome_from_error() {
        let outcome = ReceiverOutcome::failed(
            endpoint(),
            &TransferError::HandshakeRejected("wrong key".into()),
        );
        assert_eq!(outcome.kind, OutcomeKind::Rejected);
        assert!(outcome.detail.contains("wrong key"));
        assert!(!outcome.is_success());
        assert!(ReceiverOutcome::success(endpoint(), 10, 1).is_success());
    }

    #[test]
    fn test_hooks_dispatch() {
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        let hooks = TransferHooks {
            progress: Some(Arc::new(move |_: &Endpoint, transferred: u64, _: Option<u64>| {
                counter.store(transferred, Ordering::SeqCst);
            })),
            ..TransferHooks::default()
        };
        hooks.report_progress(&endpoint(), 512, Some(1024));
        assert_eq!(seen.load(Ordering::SeqCst), 512);

        // Absent hooks are a no-op.
        TransferHooks::default().report_completion(&[]);
    }
}
