//! Key-verification handshake, one instance per connection.
//!
//! The sender offers the transfer together with a
//! [`crate::cryptography::KeyVerifier`], stretched from the key under the
//! offer's transfer id. The receiver stretches the key its user typed the
//! same way, checks it against that verifier locally and answers with a bare
//! accept/reject, so the key itself never crosses the wire in either
//! direction.

use std::net::SocketAddr;
use std::path::PathBuf;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::bytes::validate_segments;
use crate::config::TransferConfig;
use crate::cryptography::{derive_secret, stretch_key_blocking, verify, SessionSecret, TransferKey};
use crate::error::{Result, TransferError};
use crate::networking::{self, Decision, Hello, Offer, RejectReason};
use crate::utils::{Endpoint, IncomingOffer, TransferHooks, UserDecision};
use crate::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE, PROTOCOL_VERSION};

// ============================================================================
// Sender side
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    Connected,
    MetadataSent,
    AwaitingDecision,
    Verified,
    Rejected,
    TimedOut,
}

pub struct SenderHandshake {
    endpoint: Endpoint,
    state: SenderState,
}

impl SenderHandshake {
    pub fn new(endpoint: Endpoint) -> Self {
        SenderHandshake {
            endpoint,
            state: SenderState::Idle,
        }
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    fn advance(&mut self, next: SenderState) {
        debug!("Handshake with {}: {:?} -> {:?}", self.endpoint, self.state, next);
        self.state = next;
    }

    /// Connects, sends the offer and waits for the receiver's decision.
    /// Returns the primary connection once the receiver has verified the key.
    pub async fn run(
        &mut self,
        offer: &Offer,
        config: &TransferConfig,
        cancel: &CancellationToken,
    ) -> Result<TcpStream> {
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            connected = networking::connect(self.endpoint.addr, config.connection_timeout) => connected?,
        };
        self.advance(SenderState::Connected);

        networking::write_message(&mut stream, &Hello::Offer(offer.clone())).await?;
        self.advance(SenderState::MetadataSent);

        self.advance(SenderState::AwaitingDecision);
        let decision = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            answered = tokio::time::timeout(
                config.handshake_timeout,
                networking::read_message::<_, Decision>(&mut stream),
            ) => match answered {
                Ok(decision) => decision?,
                Err(_) => {
                    self.advance(SenderState::TimedOut);
                    return Err(TransferError::HandshakeTimeout(config.handshake_timeout));
                }
            },
        };

        match decision {
            Decision::Accept => {
                self.advance(SenderState::Verified);
                info!("Receiver {} verified the transfer key", self.endpoint);
                Ok(stream)
            }
            Decision::Reject(RejectReason::Conflict) => {
                self.advance(SenderState::Rejected);
                Err(TransferError::DestinationConflict(PathBuf::from(&offer.name)))
            }
            Decision::Reject(reason) => {
                self.advance(SenderState::Rejected);
                info!("Receiver {} rejected the transfer: {}", self.endpoint, reason);
                Err(TransferError::HandshakeRejected(reason.to_string()))
            }
        }
    }
}

// ============================================================================
// Receiver side
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    MetadataReceived,
    AwaitingUserInput,
    Verified,
    Rejected,
}

pub struct ReceiverHandshake {
    sender: SocketAddr,
    state: ReceiverState,
}

impl ReceiverHandshake {
    pub fn new(sender: SocketAddr) -> Self {
        ReceiverHandshake {
            sender,
            state: ReceiverState::Idle,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    fn advance(&mut self, next: ReceiverState) {
        debug!("Handshake from {}: {:?} -> {:?}", self.sender, self.state, next);
        self.state = next;
    }

    /// Checks an offer for anything this receiver cannot honour.
    pub fn metadata_received(&mut self, offer: &Offer) -> Result<()> {
        self.advance(ReceiverState::MetadataReceived);
        if offer.version != PROTOCOL_VERSION {
            return Err(TransferError::Protocol(format!(
                "unsupported protocol version {}",
                offer.version
            )));
        }
        let chunk_size = offer.chunk_size as usize;
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
            return Err(TransferError::Protocol(format!(
                "chunk size {chunk_size} out of range"
            )));
        }
        if offer.compression_level > 9 {
            return Err(TransferError::Protocol(format!(
                "compression level {} out of range",
                offer.compression_level
            )));
        }
        if offer.name.trim().is_empty() {
            return Err(TransferError::Protocol("offer has an empty name".into()));
        }
        validate_segments(&offer.segments, offer.size)
    }

    /// Asks the user, verifies the entered key and sends the decision.
    /// Returns the transfer's session secret once the key matched.
    pub async fn await_user<S>(
        &mut self,
        stream: &mut S,
        offer: &Offer,
        hooks: &TransferHooks,
        cancel: &CancellationToken,
    ) -> Result<SessionSecret>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.advance(ReceiverState::AwaitingUserInput);
        // The sender may give up (timeout, lost fan-out race) while the user
        // is still deciding; its close ends the wait.
        let mut peek = [0u8; 1];
        let decision = tokio::select! {
            decision = self.ask(offer, hooks, cancel) => decision?,
            closed = stream.read(&mut peek) => {
                self.advance(ReceiverState::Rejected);
                return Err(match closed {
                    Ok(0) | Err(_) => TransferError::ConnectionFailure(format!(
                        "{} withdrew the offer", self.sender
                    )),
                    Ok(_) => TransferError::Protocol("unexpected data before decision".into()),
                });
            }
        };

        if !decision.accept {
            return self.reject(stream, "declined by user").await;
        }
        let key = match decision.key.as_deref().map(TransferKey::parse) {
            Some(Ok(key)) => key,
            Some(Err(e)) => return self.reject(stream, &e.to_string()).await,
            None => return self.reject(stream, "no key entered").await,
        };
        let material = match stretch_key_blocking(key, offer.transfer_id.0).await {
            Ok(material) => material,
            Err(e) => return self.reject(stream, &e.to_string()).await,
        };
        if !verify(&material, &offer.verifier) {
            warn!("Key entered for transfer from {} does not match", self.sender);
            return self.reject(stream, "wrong transfer key").await;
        }

        networking::write_message(stream, &Decision::Accept).await?;
        self.advance(ReceiverState::Verified);
        Ok(derive_secret(&material))
    }

    async fn ask(
        &self,
        offer: &Offer,
        hooks: &TransferHooks,
        cancel: &CancellationToken,
    ) -> Result<UserDecision> {
        let Some(callback) = hooks.decision.clone() else {
            return Ok(UserDecision::decline());
        };
        let incoming = IncomingOffer {
            sender: self.sender,
            name: offer.name.clone(),
            size: offer.size,
            is_directory: offer.is_directory(),
            stream_count: offer.segments.len(),
            compression_level: offer.compression_level,
        };
        let prompt = tokio::task::spawn_blocking(move || callback(&incoming));
        tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            answered = prompt => answered.map_err(|e| {
                TransferError::Io(std::io::Error::other(format!("decision callback failed: {e}")))
            }),
        }
    }

    async fn reject<S>(&mut self, stream: &mut S, why: &str) -> Result<SessionSecret>
    where
        S: AsyncWrite + Unpin,
    {
        self.advance(ReceiverState::Rejected);
        networking::write_message(stream, &Decision::Reject(RejectReason::Declined)).await?;
        Err(TransferError::HandshakeRejected(why.to_string()))
    }
}
