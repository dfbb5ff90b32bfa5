use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::bytes::Segment;
use crate::cryptography::KeyVerifier;
use crate::error::{Result, TransferError};
use crate::ENCRYPTION_OVERHEAD;

/// Upper bound for a length-prefixed control message.
pub const MAX_CONTROL_FRAME: u32 = 1024 * 1024;

const FRAME_DATA: u8 = 0x01;
const FRAME_END: u8 = 0x02;

/// Random id tying the extra stream connections of a transfer to its offer.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub [u8; 16]);

impl TransferId {
    pub fn random() -> Self {
        TransferId(rand::random())
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferId({self})")
    }
}

// ============================================================================
// Control messages
// ============================================================================

/// Handshake metadata sent by the sender on the primary connection.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Offer {
    pub version: u16,
    pub transfer_id: TransferId,
    pub name: String,
    /// `None` marks an unbounded (directory archive) transfer.
    pub size: Option<u64>,
    pub verifier: KeyVerifier,
    /// 0 means chunks are not compressed.
    pub compression_level: u32,
    pub chunk_size: u32,
    pub segments: Vec<Segment>,
}

impl Offer {
    pub fn is_directory(&self) -> bool {
        self.size.is_none()
    }

    /// Largest data payload a conforming sender can produce for this offer:
    /// a chunk that did not shrink under zlib plus zlib framing and the tag.
    pub fn max_payload_len(&self) -> usize {
        let chunk = self.chunk_size as usize;
        chunk + chunk / 16 + 1024 + ENCRYPTION_OVERHEAD
    }
}

/// Announces an additional connection for stream `stream_id`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct StreamHello {
    pub transfer_id: TransferId,
    pub stream_id: u32,
}

/// First message on every connection to a receiver.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Hello {
    Offer(Offer),
    Stream(StreamHello),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Declined,
    Conflict,
    InvalidOffer,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectReason::Declined => "declined by receiver",
            RejectReason::Conflict => "destination busy on receiver",
            RejectReason::InvalidOffer => "offer refused as invalid",
        })
    }
}

/// Receiver's answer to an offer. Carries no key material.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject(RejectReason),
}

/// End-of-transfer acknowledgment, sent by the receiver after flushing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Success,
    Failed(String),
}

/// Writes a `u32` length prefix followed by the bincode encoding of `message`.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = bincode::serialize(message)
        .map_err(|e| TransferError::Protocol(format!("cannot encode message: {e}")))?;
    writer
        .write_u32(encoded.len() as u32)
        .await
        .map_err(TransferError::connection)?;
    writer
        .write_all(&encoded)
        .await
        .map_err(TransferError::connection)?;
    writer.flush().await.map_err(TransferError::connection)
}

pub async fn read_message<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await.map_err(TransferError::connection)?;
    if len > MAX_CONTROL_FRAME {
        return Err(TransferError::Protocol(format!(
            "control message of {len} bytes exceeds limit"
        )));
    }
    let mut buffer = vec![0u8; len as usize];
    reader
        .read_exact(&mut buffer)
        .await
        .map_err(TransferError::connection)?;
    bincode::deserialize(&buffer)
        .map_err(|e| TransferError::Protocol(format!("undecodable message: {e}")))
}

// ============================================================================
// Data frames
// ============================================================================

/// One encrypted chunk on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub stream_id: u32,
    pub sequence: u64,
    /// Plaintext length before compression.
    pub plain_len: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(ChunkFrame),
    /// Stream finished after `chunks` data frames.
    End { stream_id: u32, chunks: u64 },
}

pub async fn write_chunk_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &ChunkFrame,
) -> Result<()> {
    let mut header = [0u8; 21];
    header[0] = FRAME_DATA;
    header[1..5].copy_from_slice(&frame.stream_id.to_be_bytes());
    header[5..13].copy_from_slice(&frame.sequence.to_be_bytes());
    header[13..17].copy_from_slice(&frame.plain_len.to_be_bytes());
    header[17..21].copy_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    writer
        .write_all(&header)
        .await
        .map_err(TransferError::connection)?;
    writer
        .write_all(&frame.payload)
        .await
        .map_err(TransferError::connection)
}

pub async fn write_end_marker<W: AsyncWrite + Unpin>(
    writer: &mut W,
    stream_id: u32,
    chunks: u64,
) -> Result<()> {
    writer
        .write_u8(FRAME_END)
        .await
        .map_err(TransferError::connection)?;
    writer
        .write_u32(stream_id)
        .await
        .map_err(TransferError::connection)?;
    writer
        .write_u64(chunks)
        .await
        .map_err(TransferError::connection)?;
    writer.flush().await.map_err(TransferError::connection)
}

/// Reads the next frame. Payloads above `max_payload` are refused before
/// anything is allocated.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_payload: usize) -> Result<Frame> {
    let tag = reader.read_u8().await.map_err(TransferError::connection)?;
    let stream_id = reader.read_u32().await.map_err(TransferError::connection)?;
    match tag {
        FRAME_DATA => {
            let sequence = reader.read_u64().await.map_err(TransferError::connection)?;
            let plain_len = reader.read_u32().await.map_err(TransferError::connection)?;
            let payload_len = reader.read_u32().await.map_err(TransferError::connection)? as usize;
            if payload_len > max_payload {
                return Err(TransferError::integrity(format!(
                    "stream {stream_id}: chunk {sequence} payload of {payload_len} bytes exceeds {max_payload}"
                )));
            }
            let mut payload = vec![0u8; payload_len];
            reader
                .read_exact(&mut payload)
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::UnexpectedEof => TransferError::integrity(format!(
                        "stream {stream_id}: chunk {sequence} truncated"
                    )),
                    _ => TransferError::connection(e),
                })?;
            Ok(Frame::Data(ChunkFrame {
                stream_id,
                sequence,
                plain_len,
                payload,
            }))
        }
        FRAME_END => {
            let chunks = reader.read_u64().await.map_err(TransferError::connection)?;
            Ok(Frame::End { stream_id, chunks })
        }
        other => Err(TransferError::integrity(format!(
            "stream {stream_id}: unknown frame tag {other:#04x}"
        ))),
    }
}

// ============================================================================
// Connections
// ============================================================================

/// Opens a TCP connection within `timeout`, with Nagle disabled since every
/// frame is flushed explicitly.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransferError::ConnectionFailure(format!("connect to {addr} timed out")))?
        .map_err(|e| TransferError::ConnectionFailure(format!("connect to {addr}: {e}")))?;
    stream.set_nodelay(true).map_err(TransferError::connection)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptography::{stretch_key, verifier_of, TransferKey};
    use std::io::Cursor;

    fn sample_offer() -> Offer {
        Offer {
            version: crate::PROTOCOL_VERSION,
            transfer_id: TransferId([7; 16]),
            name: "файл.txt".into(),
            size: Some(12345),
            verifier: verifier_of(&stretch_key(&TransferKey::parse("ABCD12").unwrap(), &[7; 16]).unwrap()),
            compression_level: 1,
            chunk_size: 4096,
            segments: crate::bytes::plan_segments(Some(12345), 2),
        }
    }

    // ============================================================================
    // Control Message Tests
    // ============================================================================

    #[tokio::test]
    async fn test_hello_offer_over_the_wire() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &Hello::Offer(sample_offer()))
            .await
            .unwrap();

        let hello: Hello = read_message(&mut Cursor::new(buffer)).await.unwrap();
        match hello {
            Hello::Offer(offer) => {
                assert_eq!(offer.name, "файл.txt");
                assert_eq!(offer.size, Some(12345));
                assert_eq!(offer.segments.len(), 2);
                assert_eq!(offer.verifier, sample_offer().verifier);
            }
            Hello::Stream(_) => panic!("expected offer"),
        }
    }

    #[tokio::test]
    async fn test_decision_carries_no_key_material() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &Decision::Accept).await.unwrap();
        // length prefix + enum tag only
        assert!(buffer.len() <= 8);
    }

    #[tokio::test]
    async fn test_oversized_control_message_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(MAX_CONTROL_FRAME + 1).to_be_bytes());
        let result: Result<Decision> = read_message(&mut Cursor::new(buffer)).await;
        assert!(matches!(result, Err(TransferError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_read_message_on_closed_connection() {
        let result: Result<Decision> = read_message(&mut Cursor::new(Vec::new())).await;
        assert!(matches!(result, Err(TransferError::ConnectionFailure(_))));
    }

    // ============================================================================
    // Data Frame Tests
    // ============================================================================

    #[tokio::test]
    async fn test_frames_in_sequence() {
        let frame = ChunkFrame {
            stream_id: 2,
            sequence: 9,
            plain_len: 100,
            payload: vec![0xAB; 40],
        };
        let mut buffer = Vec::new();
        write_chunk_frame(&mut buffer, &frame).await.unwrap();
        write_end_marker(&mut buffer, 2, 10).await.unwrap();

        let mut cursor = Cursor::new(buffer);
        assert_eq!(read_frame(&mut cursor, 1024).await.unwrap(), Frame::Data(frame));
        assert_eq!(
            read_frame(&mut cursor, 1024).await.unwrap(),
            Frame::End {
                stream_id: 2,
                chunks: 10
            }
        );
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let frame = ChunkFrame {
            stream_id: 0,
            sequence: 0,
            plain_len: 10,
            payload: vec![0; 2048],
        };
        let mut buffer = Vec::new();
        write_chunk_frame(&mut buffer, &frame).await.unwrap();
        let result = read_frame(&mut Cursor::new(buffer), 1024).await;
        assert!(matches!(result, Err(TransferError::StreamIntegrity(_))));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_integrity_error() {
        let frame = ChunkFrame {
            stream_id: 0,
            sequence: 0,
            plain_len: 10,
            payload: vec![1; 64],
        };
        let mut buffer = Vec::new();
        write_chunk_frame(&mut buffer, &frame).await.unwrap();
        buffer.truncate(buffer.len() - 10);
        let result = read_frame(&mut Cursor::new(buffer), 1024).await;
        assert!(matches!(result, Err(TransferError::StreamIntegrity(_))));
    }

    #[tokio::test]
    async fn test_unknown_tag_rejected() {
        let buffer = vec![0x7F, 0, 0, 0, 0];
        let result = read_frame(&mut Cursor::new(buffer), 1024).await;
        assert!(matches!(result, Err(TransferError::StreamIntegrity(_))));
    }

    #[test]
    fn test_transfer_ids_are_random() {
        assert_ne!(TransferId::random(), TransferId::random());
    }
}
