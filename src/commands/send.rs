use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::archive::{self, ArchiveReader};
use crate::bytes::{compress_chunk, read_chunk, Segment};
use crate::commands::fanout::{FanoutCoordinator, FanoutReport};
use crate::config::TransferConfig;
use crate::cryptography::{open_writer, CipherWriter, SessionSecret, TransferKey};
use crate::discovery;
use crate::error::{Result, TransferError};
use crate::networking::{
    self, write_chunk_frame, write_end_marker, ChunkFrame, Completion, Hello, Offer, StreamHello,
};
use crate::utils::{Endpoint, ReceiverOutcome, TransferDescriptor, TransferHooks};

/// Entry point of `beam send`:
///     - Describe the source
///     - Use the static peers from the config, or discover receivers
///     - Hand everything to the fan-out coordinator
pub async fn run(
    path: &Path,
    key: TransferKey,
    config: TransferConfig,
    hooks: TransferHooks,
    cancel: CancellationToken,
) -> Result<FanoutReport> {
    let config = config.normalized();
    let descriptor = Arc::new(TransferDescriptor::from_path(path, &config)?);
    debug!(
        "Sending {} ({}) over {} stream(s)",
        descriptor.name,
        match descriptor.size {
            Some(size) => format!("{size} bytes"),
            None => "directory".into(),
        },
        descriptor.stream_count
    );

    let endpoints = if config.peers.is_empty() {
        info!("Looking for receivers for {:?}", config.discovery_timeout);
        let found = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            found = discovery::discover(&config) => found?,
        };
        discovery::require_endpoints(found, &config)?
    } else {
        config.peers.iter().copied().map(Endpoint::new).collect()
    };

    FanoutCoordinator::new(config, key, hooks)
        .run(descriptor, endpoints, cancel)
        .await
}

/// Uses the caller's key when one was configured, otherwise a fresh one.
pub fn resolve_key(config: &TransferConfig) -> Result<TransferKey> {
    match &config.transfer_key {
        Some(raw) => TransferKey::parse(raw),
        None => Ok(TransferKey::generate()),
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// A receiver that passed the handshake, holding its primary connection.
pub struct VerifiedReceiver {
    pub endpoint: Endpoint,
    pub stream: TcpStream,
}

/// Plaintext handed from the producer to one stream's encoder.
enum SourceChunk {
    Data(Vec<u8>),
    /// The stream's range is exhausted. Absent when the producer aborted.
    Finished,
}

/// Encoded output handed from an encoder to one receiver's stream writer.
/// Frames are shared between receivers, never re-encrypted.
enum WireMessage {
    Chunk(Arc<ChunkFrame>),
    End { stream_id: u32, chunks: u64 },
}

/// The one open handle on the source.
enum Source {
    File(File),
    Directory(ArchiveReader),
}

impl Source {
    fn open(descriptor: &TransferDescriptor) -> Result<Self> {
        if descriptor.is_directory() {
            Ok(Source::Directory(archive::serialize(&descriptor.path)?))
        } else {
            Ok(Source::File(File::open(&descriptor.path)?))
        }
    }
}

/// Streams the source to every verified receiver.
///
/// The source is opened once and read by a single producer. Each stream has
/// one encoder that compresses and encrypts every chunk exactly once and
/// broadcasts the resulting frame to that stream's writer on every receiver.
/// All hand-offs are bounded, so the slowest live receiver paces the source.
///
/// Returns one outcome per receiver. Only a failure of the local source is
/// an `Err`.
pub async fn run_pipelines(
    descriptor: Arc<TransferDescriptor>,
    offer: Arc<Offer>,
    secret: &SessionSecret,
    receivers: Vec<VerifiedReceiver>,
    config: &TransferConfig,
    hooks: &TransferHooks,
    cancel: &CancellationToken,
) -> Result<Vec<ReceiverOutcome>> {
    if receivers.is_empty() {
        return Ok(Vec::new());
    }
    let source = Source::open(&descriptor)?;
    let depth = config.queue_depth;

    // One sink per (receiver, stream).
    let mut stream_sinks: Vec<Vec<mpsc::Sender<WireMessage>>> =
        offer.segments.iter().map(|_| Vec::new()).collect();
    let mut supervisors = JoinSet::new();
    for (index, receiver) in receivers.into_iter().enumerate() {
        let mut inputs = Vec::with_capacity(offer.segments.len());
        for sinks in stream_sinks.iter_mut() {
            let (tx, rx) = mpsc::channel(depth);
            sinks.push(tx);
            inputs.push(rx);
        }
        let job = ReceiverJob {
            offer: offer.clone(),
            total: descriptor.size,
            config: config.clone(),
            hooks: hooks.clone(),
            cancel: cancel.child_token(),
            outer_cancel: cancel.clone(),
        };
        supervisors.spawn(async move { (index, job.run(receiver, inputs).await) });
    }

    // Task 1: producer reading the source.
    let mut source_channels = Vec::with_capacity(offer.segments.len());
    let mut encoders = Vec::with_capacity(offer.segments.len());
    for (segment, sinks) in offer.segments.iter().zip(stream_sinks) {
        let (tx, rx) = mpsc::channel(depth);
        source_channels.push(tx);
        let cipher = open_writer(secret, segment.stream_id);
        let level = offer.compression_level;
        // Task 2: one encoder per stream.
        encoders.push(tokio::task::spawn_blocking(move || {
            chunk_and_encrypt_task(rx, cipher, level, sinks)
        }));
    }
    let segments = offer.segments.clone();
    let chunk_size = descriptor.chunk_size;
    let producer_cancel = cancel.clone();
    let producer = tokio::task::spawn_blocking(move || {
        read_source_task(source, &segments, chunk_size, source_channels, &producer_cancel)
    });

    // Task 3: per-receiver writers, supervised.
    let mut outcomes = Vec::new();
    while let Some(joined) = supervisors.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => warn!("Receiver pipeline task failed: {}", e),
        }
    }
    outcomes.sort_by_key(|(index, _)| *index);

    for encoder in encoders {
        match encoder.await {
            Ok(Err(e)) => warn!("Encoder stopped: {}", e),
            Err(e) => warn!("Encoder task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }
    match producer.await {
        Ok(Err(TransferError::Cancelled)) | Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(e) => {
            return Err(TransferError::Io(std::io::Error::other(format!(
                "source reader failed: {e}"
            ))))
        }
    }

    Ok(outcomes.into_iter().map(|(_, outcome)| outcome).collect())
}

/// Reads the source once, round-robin across segments so every stream
/// makes progress, and hands plaintext chunks to the per-stream encoders.
fn read_source_task(
    source: Source,
    segments: &[Segment],
    chunk_size: usize,
    channels: Vec<mpsc::Sender<SourceChunk>>,
    cancel: &CancellationToken,
) -> Result<()> {
    match source {
        Source::Directory(mut archive) => {
            let Some(tx) = channels.first() else {
                return Ok(());
            };
            let mut chunk_index: u64 = 0;
            loop {
                if cancel.is_cancelled() {
                    return Err(TransferError::Cancelled);
                }
                let chunk = read_chunk(&mut archive, chunk_size)?;
                if chunk.is_empty() {
                    debug!("Archive fully read, {} chunks", chunk_index);
                    break;
                }
                if tx.blocking_send(SourceChunk::Data(chunk)).is_err() {
                    debug!("All receivers gone, stopping archive reader");
                    return Ok(());
                }
                chunk_index += 1;
            }
            let _ = tx.blocking_send(SourceChunk::Finished);
            Ok(())
        }
        Source::File(mut file) => {
            let mut remaining: Vec<u64> = segments.iter().map(|s| s.length).collect();
            let mut live: Vec<bool> = vec![true; channels.len()];
            loop {
                let mut progressed = false;
                for (index, segment) in segments.iter().enumerate() {
                    if remaining[index] == 0 || !live[index] {
                        continue;
                    }
                    if cancel.is_cancelled() {
                        return Err(TransferError::Cancelled);
                    }
                    let position = segment.offset + (segment.length - remaining[index]);
                    let want = remaining[index].min(chunk_size as u64) as usize;
                    file.seek(SeekFrom::Start(position))?;
                    let chunk = read_chunk(&mut file, want)?;
                    if chunk.len() != want {
                        return Err(TransferError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            format!("source shrank while reading at offset {position}"),
                        )));
                    }
                    remaining[index] -= want as u64;
                    if channels[index].blocking_send(SourceChunk::Data(chunk)).is_err() {
                        debug!("Stream {} has no receivers left", segment.stream_id);
                        live[index] = false;
                    }
                    progressed = true;
                }
                if !progressed {
                    break;
                }
            }
            for (index, tx) in channels.iter().enumerate() {
                if live[index] {
                    let _ = tx.blocking_send(SourceChunk::Finished);
                }
            }
            Ok(())
        }
    }
}

/// Compresses and encrypts one stream's chunks, then fans every frame out
/// to the live receivers. Runs on a blocking thread.
fn chunk_and_encrypt_task(
    mut rx: mpsc::Receiver<SourceChunk>,
    mut cipher: CipherWriter,
    compression_level: u32,
    mut sinks: Vec<mpsc::Sender<WireMessage>>,
) -> Result<()> {
    let stream_id = cipher.stream_id();
    debug!("Starting encoder for stream {}", stream_id);
    while let Some(message) = rx.blocking_recv() {
        let plaintext = match message {
            SourceChunk::Data(plaintext) => plaintext,
            SourceChunk::Finished => {
                let chunks = cipher.chunks_sealed();
                debug!("Stream {} finished after {} chunks", stream_id, chunks);
                for sink in &sinks {
                    let _ = sink.blocking_send(WireMessage::End { stream_id, chunks });
                }
                return Ok(());
            }
        };

        let plain_len = plaintext.len() as u32;
        let payload = if compression_level > 0 {
            compress_chunk(&plaintext, compression_level)?
        } else {
            plaintext
        };
        let sealed = cipher.seal(&payload)?;
        let frame = Arc::new(ChunkFrame {
            stream_id,
            sequence: sealed.sequence,
            plain_len,
            payload: sealed.ciphertext,
        });

        sinks.retain(|sink| sink.blocking_send(WireMessage::Chunk(frame.clone())).is_ok());
        if sinks.is_empty() {
            debug!("Stream {} has no receivers left, stopping encoder", stream_id);
            return Ok(());
        }
    }
    // Producer aborted: dropping the sinks without an end marker fails the
    // writers instead of letting a truncated stream look complete.
    debug!("Stream {} source closed early", stream_id);
    Ok(())
}

// ============================================================================
// Per-receiver supervision
// ============================================================================

struct ReceiverJob {
    offer: Arc<Offer>,
    total: Option<u64>,
    config: TransferConfig,
    hooks: TransferHooks,
    /// Cancels only this receiver.
    cancel: CancellationToken,
    /// The whole transfer's token, to tell user cancellation from failure.
    outer_cancel: CancellationToken,
}

impl ReceiverJob {
    async fn run(
        self,
        receiver: VerifiedReceiver,
        inputs: Vec<mpsc::Receiver<WireMessage>>,
    ) -> ReceiverOutcome {
        let VerifiedReceiver { endpoint, stream } = receiver;
        let stream_count = inputs.len();
        let sent = Arc::new(AtomicU64::new(0));

        let result = self.deliver(endpoint, stream, inputs, sent.clone()).await;
        let bytes = sent.load(Ordering::Relaxed);
        match result {
            Ok(()) => {
                info!("Transfer to {} complete ({} bytes)", endpoint, bytes);
                ReceiverOutcome::success(endpoint, bytes, stream_count)
            }
            Err(e) => {
                let error = if self.outer_cancel.is_cancelled() {
                    TransferError::Cancelled
                } else {
                    e
                };
                warn!("Transfer to {} failed: {}", endpoint, error);
                ReceiverOutcome::failed(endpoint, &error).with_progress(bytes, stream_count)
            }
        }
    }

    async fn deliver(
        &self,
        endpoint: Endpoint,
        stream: TcpStream,
        inputs: Vec<mpsc::Receiver<WireMessage>>,
        sent: Arc<AtomicU64>,
    ) -> Result<()> {
        // Extra connections first; any failure drops the whole receiver.
        let mut extra = Vec::with_capacity(inputs.len().saturating_sub(1));
        for segment in self.offer.segments.iter().skip(1) {
            let mut connection = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                connected = networking::connect(endpoint.addr, self.config.connection_timeout) => connected?,
            };
            let hello = Hello::Stream(StreamHello {
                transfer_id: self.offer.transfer_id,
                stream_id: segment.stream_id,
            });
            networking::write_message(&mut connection, &hello).await?;
            extra.push(connection);
        }
        debug!("Opened {} extra stream(s) to {}", extra.len(), endpoint);

        // Stream 0 rides on the primary connection, whose read half later
        // carries the receiver's completion message.
        let (mut primary_read, primary_write) = stream.into_split();
        let mut writers = JoinSet::new();
        let mut inputs = inputs.into_iter();
        if let Some(input) = inputs.next() {
            writers.spawn(send_task(
                primary_write,
                input,
                self.writer_context(endpoint, sent.clone()),
            ));
        }
        for (connection, input) in extra.into_iter().zip(inputs) {
            writers.spawn(send_task(
                connection,
                input,
                self.writer_context(endpoint, sent.clone()),
            ));
        }

        let mut failure = None;
        while let Some(joined) = writers.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(TransferError::Io(std::io::Error::other(format!(
                    "stream writer failed: {e}"
                ))))
            });
            if let Err(e) = result {
                if failure.is_none() {
                    debug!("Stream to {} failed, stopping the others: {}", endpoint, e);
                    self.cancel.cancel();
                    failure = Some(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        // Every stream ended cleanly; wait for the receiver to flush.
        let completion = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            answered = tokio::time::timeout(
                self.config.handshake_timeout,
                networking::read_message::<_, Completion>(&mut primary_read),
            ) => answered.map_err(|_| {
                TransferError::ConnectionFailure(format!("no completion from {endpoint}"))
            })??,
        };
        match completion {
            Completion::Success => Ok(()),
            Completion::Failed(reason) => Err(TransferError::integrity(format!(
                "receiver reported failure: {reason}"
            ))),
        }
    }

    fn writer_context(&self, endpoint: Endpoint, sent: Arc<AtomicU64>) -> WriterContext {
        WriterContext {
            endpoint,
            sent,
            total: self.total,
            hooks: self.hooks.clone(),
            timeout: self.config.connection_timeout,
            cancel: self.cancel.clone(),
        }
    }
}

struct WriterContext {
    endpoint: Endpoint,
    sent: Arc<AtomicU64>,
    total: Option<u64>,
    hooks: TransferHooks,
    timeout: std::time::Duration,
    cancel: CancellationToken,
}

/// Receives encoded frames from the channel and writes them to one
/// connection, ending with the stream's end marker.
async fn send_task<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<WireMessage>,
    ctx: WriterContext,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(TransferError::Cancelled),
            message = rx.recv() => message,
        };
        let write = async {
            match &message {
                Some(WireMessage::Chunk(frame)) => write_chunk_frame(&mut writer, frame).await,
                Some(WireMessage::End { stream_id, chunks }) => {
                    write_end_marker(&mut writer, *stream_id, *chunks).await
                }
                None => Err(TransferError::Io(std::io::Error::other(
                    "source stopped before the stream was complete",
                ))),
            }
        };
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(TransferError::Cancelled),
            written = tokio::time::timeout(ctx.timeout, write) => written.map_err(|_| {
                TransferError::ConnectionFailure(format!("write to {} timed out", ctx.endpoint))
            })??,
        }

        match message {
            Some(WireMessage::Chunk(frame)) => {
                let total_sent = ctx
                    .sent
                    .fetch_add(frame.plain_len as u64, Ordering::Relaxed)
                    + frame.plain_len as u64;
                ctx.hooks.report_progress(&ctx.endpoint, total_sent, ctx.total);
            }
            _ => return Ok(()),
        }
    }
}
