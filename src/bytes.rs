use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Result, TransferError};
use crate::MAX_STREAMS;

/// Reads up to `size` bytes from a data source (file handle or archive stream).
///
/// Unlike a single `read`, this keeps reading until the buffer is full or the
/// source is exhausted, so every chunk except the last has exactly `size`
/// bytes.
///
/// # Returns
/// The bytes read; an empty vector means the source is exhausted.
pub fn read_chunk<R: Read>(data_source: &mut R, size: usize) -> io::Result<Vec<u8>> {
    let mut buffer = vec![0; size];
    let mut filled = 0;
    while filled < size {
        match data_source.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buffer.truncate(filled);
    Ok(buffer)
}

/// zlib-compresses one chunk. Each chunk is compressed independently so the
/// receiver can decode it without any state from earlier chunks.
pub fn compress_chunk(data: &[u8], level: u32) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inflates one chunk, refusing to produce more than `expected_len` bytes.
pub fn decompress_chunk(payload: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    ZlibDecoder::new(payload)
        .take(expected_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| TransferError::integrity(format!("chunk failed to decompress: {e}")))?;
    if out.len() != expected_len {
        return Err(TransferError::integrity(format!(
            "chunk length mismatch: expected {expected_len}, got {}",
            out.len()
        )));
    }
    Ok(out)
}

// ============================================================================
// Segments
// ============================================================================

/// A contiguous byte range of the source carried by one stream.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub stream_id: u32,
    pub offset: u64,
    pub length: u64,
}

/// Splits a source into per-stream segments.
///
/// Unbounded sources (directory archives) always get a single stream.
/// Otherwise the range is cut into `requested` nearly equal contiguous
/// pieces, never more pieces than there are bytes.
pub fn plan_segments(size: Option<u64>, requested: usize) -> Vec<Segment> {
    let Some(size) = size else {
        return vec![Segment {
            stream_id: 0,
            offset: 0,
            length: 0,
        }];
    };

    let streams = (requested.clamp(1, MAX_STREAMS) as u64).min(size.max(1));
    let base = size.div_ceil(streams);
    let mut segments = Vec::with_capacity(streams as usize);
    let mut offset = 0;
    for stream_id in 0..streams as u32 {
        let length = base.min(size - offset);
        if length == 0 && stream_id > 0 {
            break;
        }
        segments.push(Segment {
            stream_id,
            offset,
            length,
        });
        offset += length;
    }
    segments
}

/// Checks that a segment table received from a peer starts at 0, has
/// sequential stream ids and covers exactly `size` bytes without overlap.
pub fn validate_segments(segments: &[Segment], size: Option<u64>) -> Result<()> {
    if segments.is_empty() || segments.len() > MAX_STREAMS {
        return Err(TransferError::Protocol(format!(
            "offer lists {} streams",
            segments.len()
        )));
    }
    let Some(size) = size else {
        return if segments.len() == 1 {
            Ok(())
        } else {
            Err(TransferError::Protocol(
                "unbounded transfers use a single stream".into(),
            ))
        };
    };

    let mut expected_offset = 0u64;
    for (index, segment) in segments.iter().enumerate() {
        if segment.stream_id as usize != index || segment.offset != expected_offset {
            return Err(TransferError::Protocol(format!(
                "segment {index} is out of place"
            )));
        }
        expected_offset = expected_offset
            .checked_add(segment.length)
            .ok_or_else(|| TransferError::Protocol("segment lengths overflow".into()))?;
    }
    if expected_offset != size {
        return Err(TransferError::Protocol(format!(
            "segments cover {expected_offset} of {size} bytes"
        )));
    }
    Ok(())
}

// ============================================================================
// Channel-backed reader
// ============================================================================

/// Blocking [`Read`] adapter over a bounded channel of byte chunks, for
/// feeding async-received data into synchronous consumers such as the
/// archive extractor. Must be used from a blocking thread.
pub struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    buffer: Vec<u8>,
    position: usize,
}

impl ChannelReader {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        ChannelReader {
            rx,
            buffer: Vec::new(),
            position: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.position >= self.buffer.len() {
            match self.rx.blocking_recv() {
                Some(chunk) => {
                    self.buffer = chunk;
                    self.position = 0;
                }
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.buffer.len() - self.position);
        buf[..n].copy_from_slice(&self.buffer[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // ============================================================================
    // Chunk Reading Tests
    // ============================================================================

    #[test]
    fn test_read_chunk_full() {
        let mut cursor = Cursor::new(vec![0u8; 1024]);
        let buffer = read_chunk(&mut cursor, 1024).expect("Should read chunk");
        assert_eq!(buffer.len(), 1024);
    }

    #[test]
    fn test_read_chunk_partial_then_empty() {
        let mut cursor = Cursor::new(vec![1u8; 100]);
        let buffer = read_chunk(&mut cursor, 1024).unwrap();
        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer[0], 1);
        assert!(read_chunk(&mut cursor, 1024).unwrap().is_empty());
    }

    #[test]
    fn test_read_chunk_fills_from_short_reads() {
        // A reader that hands out at most 7 bytes per call.
        struct Trickle(Cursor<Vec<u8>>);
        impl Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                let n = buf.len().min(7);
                self.0.read(&mut buf[..n])
            }
        }

        let mut source = Trickle(Cursor::new(vec![42u8; 100]));
        assert_eq!(read_chunk(&mut source, 64).unwrap().len(), 64);
        assert_eq!(read_chunk(&mut source, 64).unwrap().len(), 36);
    }

    // ============================================================================
    // Compression Tests
    // ============================================================================

    #[test]
    fn test_compress_decompress_chunk() {
        let data = b"repetitive repetitive repetitive repetitive data".repeat(50);
        let compressed = compress_chunk(&data, 6).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress_chunk(&compressed, data.len()).unwrap(), data);
    }

    #[test]
    fn test_decompress_rejects_wrong_length() {
        let data = vec![7u8; 4096];
        let compressed = compress_chunk(&data, 1).unwrap();
        assert!(decompress_chunk(&compressed, 4000).is_err());
        assert!(decompress_chunk(&compressed, 5000).is_err());
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(decompress_chunk(b"definitely not zlib", 10).is_err());
    }

    // ============================================================================
    // Segment Tests
    // ============================================================================

    #[test]
    fn test_plan_segments_even_split() {
        let segments = plan_segments(Some(10_000_000), 4);
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[0].offset, 0);
        assert_eq!(segments.iter().map(|s| s.length).sum::<u64>(), 10_000_000);
        for pair in segments.windows(2) {
            assert_eq!(pair[0].offset + pair[0].length, pair[1].offset);
        }
        validate_segments(&segments, Some(10_000_000)).unwrap();
    }

    #[test]
    fn test_plan_segments_uneven_split() {
        let segments = plan_segments(Some(10), 4);
        let lengths: Vec<u64> = segments.iter().map(|s| s.length).collect();
        assert_eq!(lengths, vec![3, 3, 3, 1]);
    }

    #[test]
    fn test_plan_segments_tiny_and_empty_files() {
        assert_eq!(plan_segments(Some(2), 4).len(), 2);
        let empty = plan_segments(Some(0), 4);
        assert_eq!(empty.len(), 1);
        assert_eq!(empty[0].length, 0);
        validate_segments(&empty, Some(0)).unwrap();
    }

    #[test]
    fn test_plan_segments_unbounded_falls_back_to_one_stream() {
        let segments = plan_segments(None, 4);
        assert_eq!(segments.len(), 1);
        validate_segments(&segments, None).unwrap();
    }

    #[test]
    fn test_validate_segments_rejects_gaps_and_overlap() {
        let mut segments = plan_segments(Some(100), 2);
        segments[1].offset += 1;
        assert!(validate_segments(&segments, Some(100)).is_err());

        let segments = plan_segments(Some(100), 2);
        assert!(validate_segments(&segments, Some(101)).is_err());
        assert!(validate_segments(&[], Some(0)).is_err());
    }

    // ============================================================================
    // Channel Reader Tests
    // ============================================================================

    #[test]
    fn test_channel_reader_concatenates_chunks() {
        let (tx, rx) = mpsc::channel(4);
        tx.try_send(b"hello ".to_vec()).unwrap();
        tx.try_send(Vec::new()).unwrap();
        tx.try_send(b"world".to_vec()).unwrap();
        drop(tx);

        let mut out = String::new();
        ChannelReader::new(rx).read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }
}
