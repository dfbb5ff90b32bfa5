use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::{
    DEFAULT_CHUNK_SIZE, DISCOVERY_PORT, MAX_CHUNK_SIZE, MAX_STREAMS, MIN_CHUNK_SIZE, TRANSFER_PORT,
};

/// Runtime knobs consumed by the engine. Built by the CLI (or a test) and
/// passed down read-only.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// UDP port receivers listen on for discovery queries.
    pub discovery_port: u16,
    /// TCP port receivers accept offers and stream connections on.
    pub transfer_port: u16,
    /// Where discovery queries are sent. Broadcast by default.
    pub discovery_addr: IpAddr,
    pub discovery_timeout: Duration,
    /// Upper bound on waiting for the receiver's accept/reject.
    pub handshake_timeout: Duration,
    /// Bound on connecting and on any single socket write.
    pub connection_timeout: Duration,
    /// Plaintext bytes per chunk.
    pub chunk_size: usize,
    /// zlib level, 0 disables compression.
    pub compression_level: u32,
    /// Requested parallel connections per receiver.
    pub stream_count: usize,
    /// Deliver to every verified receiver instead of only the first.
    pub fanout: bool,
    /// Caller-supplied key; generated when absent.
    pub transfer_key: Option<String>,
    /// Chunks buffered between two pipeline stages.
    pub queue_depth: usize,
    /// Static receivers. Discovery is skipped when non-empty.
    pub peers: Vec<SocketAddr>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            discovery_port: DISCOVERY_PORT,
            transfer_port: TRANSFER_PORT,
            discovery_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            discovery_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression_level: 1,
            stream_count: 1,
            fanout: false,
            transfer_key: None,
            queue_depth: 4,
            peers: Vec::new(),
        }
    }
}

impl TransferConfig {
    /// Clamp every numeric knob into the range the wire protocol supports.
    pub fn normalized(mut self) -> Self {
        self.chunk_size = self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self.compression_level = self.compression_level.min(9);
        self.stream_count = self.stream_count.clamp(1, MAX_STREAMS);
        self.queue_depth = self.queue_depth.clamp(1, 64);
        self
    }
}
