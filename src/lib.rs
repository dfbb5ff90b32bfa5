//! # beam
//!
//! Serverless file and directory transfer for local networks.
//!
//! Receivers answer UDP discovery queries, senders offer a transfer over TCP
//! together with a one-way verifier of a short shared key, and accepted
//! transfers are streamed as compressed, encrypted chunks over one or more
//! connections per receiver, optionally to several receivers at once.
//!
//! The command-line front end lives in `main.rs`; everything it needs is
//! reachable from [`commands`].

pub mod archive;
pub mod bytes;
pub mod commands;
pub mod config;
pub mod cryptography;
pub mod discovery;
pub mod error;
pub mod handshake;
pub mod networking;
pub mod utils;

pub use commands::fanout::{FanoutCoordinator, FanoutReport};
pub use commands::receive::ReceiveServer;
pub use config::TransferConfig;
pub use error::{Result, TransferError};
pub use utils::{Endpoint, OutcomeKind, ReceiverOutcome, TransferDescriptor, TransferHooks};

/// Version tag carried by discovery queries/replies and transfer offers.
pub const PROTOCOL_VERSION: u16 = 1;

pub const DISCOVERY_PORT: u16 = 25000;
pub const TRANSFER_PORT: u16 = 25001;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const ENCRYPTION_OVERHEAD: usize = 16;

pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;
pub const MIN_CHUNK_SIZE: usize = 1024;
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

pub const MAX_STREAMS: usize = 8;
