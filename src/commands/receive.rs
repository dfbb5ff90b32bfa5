use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::archive;
use crate::bytes::{decompress_chunk, ChannelReader, Segment};
use crate::config::TransferConfig;
use crate::cryptography::{open_reader, SessionSecret};
use crate::discovery::DiscoveryResponder;
use crate::error::{Result, TransferError};
use crate::handshake::ReceiverHandshake;
use crate::networking::{
    self, read_frame, Completion, Decision, Frame, Hello, Offer, RejectReason, StreamHello,
    TransferId,
};
use crate::utils::{Endpoint, ReceiverOutcome, TransferHooks};
use crate::MAX_STREAMS;

/// Name used when an offered name has no usable final component.
const FALLBACK_NAME: &str = "received";

/// Entry point of `beam receive`: answers discovery queries and accepts
/// transfers into `download_dir` until `cancel` fires.
pub async fn run(
    download_dir: PathBuf,
    config: TransferConfig,
    hooks: TransferHooks,
    cancel: CancellationToken,
) -> Result<()> {
    let config = config.normalized();
    let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

    let responder =
        DiscoveryResponder::bind(SocketAddr::new(any, config.discovery_port), config.transfer_port)
            .await?;
    let server = ReceiveServer::bind(
        SocketAddr::new(any, config.transfer_port),
        download_dir,
        config,
        hooks,
    )
    .await?;

    let (discovery, transfers) = tokio::join!(responder.serve(cancel.clone()), server.run(cancel));
    discovery?;
    transfers
}

// ============================================================================
// Destination registry
// ============================================================================

/// An extra connection announced with a [`StreamHello`].
pub struct AttachedStream {
    pub stream_id: u32,
    pub stream: TcpStream,
}

/// Paths reserved for one accepted offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claimed {
    pub destination: PathBuf,
    pub staging: PathBuf,
}

pub enum RegistryMessage {
    Claim {
        transfer_id: TransferId,
        name: String,
        attach: mpsc::Sender<AttachedStream>,
        reply: oneshot::Sender<Result<Claimed>>,
    },
    Attach {
        hello: StreamHello,
        stream: TcpStream,
    },
    Release {
        transfer_id: TransferId,
    },
}

struct ActiveTransfer {
    requested: PathBuf,
    claimed: Claimed,
    attach: mpsc::Sender<AttachedStream>,
}

/// Owns every in-flight destination on this receiver. Connection tasks talk
/// to it only through [`RegistryMessage`]s.
pub struct TransferRegistry {
    download_dir: PathBuf,
    active: HashMap<TransferId, ActiveTransfer>,
    receiver_channel: mpsc::Receiver<RegistryMessage>,
}

impl TransferRegistry {
    pub fn new(download_dir: PathBuf, receiver_channel: mpsc::Receiver<RegistryMessage>) -> Self {
        TransferRegistry {
            download_dir,
            active: HashMap::new(),
            receiver_channel,
        }
    }

    pub async fn run(mut self) {
        while let Some(message) = self.receiver_channel.recv().await {
            match message {
                RegistryMessage::Claim {
                    transfer_id,
                    name,
                    attach,
                    reply,
                } => {
                    let claimed = self.claim(transfer_id, &name, attach);
                    let _ = reply.send(claimed);
                }
                RegistryMessage::Attach { hello, stream } => self.attach(hello, stream),
                RegistryMessage::Release { transfer_id } => {
                    if let Some(done) = self.active.remove(&transfer_id) {
                        debug!("Released {:?}", done.claimed.destination);
                    }
                }
            }
        }
        debug!("Transfer registry stopped");
    }

    fn claim(
        &mut self,
        transfer_id: TransferId,
        name: &str,
        attach: mpsc::Sender<AttachedStream>,
    ) -> Result<Claimed> {
        if self.active.contains_key(&transfer_id) {
            return Err(TransferError::Protocol(format!(
                "transfer {transfer_id} offered twice"
            )));
        }
        let name = sanitize_name(name);
        let requested = self.download_dir.join(&name);
        let busy = self.active.values().any(|t| {
            t.requested == requested || t.claimed.destination == requested
        });
        if busy {
            info!("Refusing second concurrent transfer into {:?}", requested);
            return Err(TransferError::DestinationConflict(requested));
        }

        let destination = resolve_destination(&self.download_dir, &name, |candidate| {
            self.active
                .values()
                .any(|t| t.claimed.destination == candidate)
        });
        let claimed = Claimed {
            staging: staging_path(&destination),
            destination,
        };
        debug!("Claimed {:?} for transfer {}", claimed.destination, transfer_id);
        self.active.insert(
            transfer_id,
            ActiveTransfer {
                requested,
                claimed: claimed.clone(),
                attach,
            },
        );
        Ok(claimed)
    }

    fn attach(&mut self, hello: StreamHello, stream: TcpStream) {
        match self.active.get(&hello.transfer_id) {
            Some(transfer) => {
                let attached = AttachedStream {
                    stream_id: hello.stream_id,
                    stream,
                };
                if transfer.attach.try_send(attached).is_err() {
                    warn!(
                        "Transfer {} is not accepting stream {}",
                        hello.transfer_id, hello.stream_id
                    );
                }
            }
            None => debug!(
                "Dropping stream {} for unknown transfer {}",
                hello.stream_id, hello.transfer_id
            ),
        }
    }
}

/// Cheap handle for talking to the registry from connection tasks.
#[derive(Clone)]
pub struct RegistryHandle {
    sender_channel: mpsc::Sender<RegistryMessage>,
}

impl RegistryHandle {
    pub fn new(sender_channel: mpsc::Sender<RegistryMessage>) -> Self {
        RegistryHandle { sender_channel }
    }

    pub async fn claim(
        &self,
        transfer_id: TransferId,
        name: &str,
        attach: mpsc::Sender<AttachedStream>,
    ) -> Result<Claimed> {
        let (reply, answer) = oneshot::channel();
        self.sender_channel
            .send(RegistryMessage::Claim {
                transfer_id,
                name: name.to_string(),
                attach,
                reply,
            })
            .await
            .map_err(|_| registry_gone())?;
        answer.await.map_err(|_| registry_gone())?
    }

    pub async fn attach(&self, hello: StreamHello, stream: TcpStream) {
        if self
            .sender_channel
            .send(RegistryMessage::Attach { hello, stream })
            .await
            .is_err()
        {
            warn!("Registry gone, dropping stream {}", hello.stream_id);
        }
    }

    pub async fn release(&self, transfer_id: TransferId) {
        let _ = self
            .sender_channel
            .send(RegistryMessage::Release { transfer_id })
            .await;
    }
}

fn registry_gone() -> TransferError {
    TransferError::Io(std::io::Error::other("transfer registry stopped"))
}

/// Keeps only the final component of an offered name.
pub fn sanitize_name(offered: &str) -> String {
    let last = offered
        .rsplit(['/', '\\'])
        .map(str::trim)
        .find(|part| !part.is_empty())
        .unwrap_or("");
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    match cleaned.as_str() {
        "" | "." | ".." => FALLBACK_NAME.to_string(),
        _ => cleaned,
    }
}

/// `report.pdf` -> `report_2.pdf`, `photos` -> `photos_2`.
fn numbered(name: &str, n: usize) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{}{}", &name[..dot], n, &name[dot..]),
        _ => format!("{name}_{n}"),
    }
}

/// First of `name`, `name_1`, `name_2`, ... that exists neither on disk
/// (finished or staged) nor among `taken`.
fn resolve_destination(dir: &Path, name: &str, taken: impl Fn(&Path) -> bool) -> PathBuf {
    let free = |candidate: &Path| {
        !candidate.exists() && !staging_path(candidate).exists() && !taken(candidate)
    };
    let first = dir.join(name);
    if free(&first) {
        return first;
    }
    let mut n = 1;
    loop {
        let candidate = dir.join(numbered(name, n));
        if free(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn staging_path(destination: &Path) -> PathBuf {
    let mut staged = OsString::from(destination.as_os_str());
    staged.push(".part");
    PathBuf::from(staged)
}

async fn remove_staging(staging: &Path) {
    let removed = match tokio::fs::metadata(staging).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(staging).await,
        Ok(_) => tokio::fs::remove_file(staging).await,
        Err(_) => return,
    };
    if let Err(e) = removed {
        warn!("Failed to remove {:?}: {}", staging, e);
    }
}

// ============================================================================
// Server
// ============================================================================

struct ServerContext {
    config: TransferConfig,
    hooks: TransferHooks,
    registry: RegistryHandle,
}

/// Accepts offers and stream connections on the transfer port.
pub struct ReceiveServer {
    listener: TcpListener,
    download_dir: PathBuf,
    config: TransferConfig,
    hooks: TransferHooks,
}

impl ReceiveServer {
    pub async fn bind(
        addr: SocketAddr,
        download_dir: PathBuf,
        config: TransferConfig,
        hooks: TransferHooks,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&download_dir).await?;
        let listener = TcpListener::bind(addr).await?;
        info!(
            "Receiving into {:?} on {}",
            download_dir,
            listener.local_addr()?
        );
        Ok(ReceiveServer {
            listener,
            download_dir,
            config: config.normalized(),
            hooks,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until `cancel` fires, then waits for in-flight transfers to
    /// unwind. Each transfer reports through the completion hook.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let (sender_channel, receiver_channel) = mpsc::channel(64);
        let registry = TransferRegistry::new(self.download_dir.clone(), receiver_channel);
        let registry_task = tokio::spawn(registry.run());

        let context = Arc::new(ServerContext {
            config: self.config,
            hooks: self.hooks,
            registry: RegistryHandle::new(sender_channel),
        });

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Connection from {}", peer);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Could not disable Nagle for {}: {}", peer, e);
                        }
                        connections.spawn(handle_connection(
                            stream,
                            peer,
                            context.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        debug!("Receiver shutting down, waiting for {} connection(s)", connections.len());
        while connections.join_next().await.is_some() {}
        drop(context);
        if let Err(e) = registry_task.await {
            warn!("Registry task failed: {}", e);
        }
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    context: Arc<ServerContext>,
    cancel: CancellationToken,
) {
    let hello = tokio::select! {
        _ = cancel.cancelled() => return,
        hello = tokio::time::timeout(
            context.config.handshake_timeout,
            networking::read_message::<_, Hello>(&mut stream),
        ) => hello,
    };
    let hello = match hello {
        Ok(Ok(hello)) => hello,
        Ok(Err(e)) => {
            debug!("Dropping connection from {}: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("Connection from {} sent nothing", peer);
            return;
        }
    };

    match hello {
        Hello::Stream(hello) => context.registry.attach(hello, stream).await,
        Hello::Offer(offer) => {
            let outcome = receive_transfer(stream, peer, offer, &context, &cancel).await;
            context.hooks.report_completion(std::slice::from_ref(&outcome));
        }
    }
}

async fn receive_transfer(
    mut stream: TcpStream,
    peer: SocketAddr,
    offer: Offer,
    context: &ServerContext,
    cancel: &CancellationToken,
) -> ReceiverOutcome {
    let endpoint = Endpoint::new(peer);
    info!("Offer from {}: {:?} ({:?} bytes)", peer, offer.name, offer.size);

    let mut handshake = ReceiverHandshake::new(peer);
    if let Err(e) = handshake.metadata_received(&offer) {
        warn!("Invalid offer from {}: {}", peer, e);
        let _ = networking::write_message(&mut stream, &Decision::Reject(RejectReason::InvalidOffer))
            .await;
        return ReceiverOutcome::failed(endpoint, &e);
    }

    let (attach_tx, attach_rx) = mpsc::channel(MAX_STREAMS);
    let claimed = match context
        .registry
        .claim(offer.transfer_id, &offer.name, attach_tx)
        .await
    {
        Ok(claimed) => claimed,
        Err(e) => {
            let reason = match e {
                TransferError::DestinationConflict(_) => RejectReason::Conflict,
                _ => RejectReason::InvalidOffer,
            };
            let _ = networking::write_message(&mut stream, &Decision::Reject(reason)).await;
            return ReceiverOutcome::failed(endpoint, &e);
        }
    };

    let received = Arc::new(AtomicU64::new(0));
    let result = async {
        let secret = handshake
            .await_user(&mut stream, &offer, &context.hooks, cancel)
            .await?;
        let transfer = IncomingTransfer {
            endpoint,
            offer: &offer,
            secret,
            claimed: &claimed,
            config: &context.config,
            hooks: &context.hooks,
            received: received.clone(),
        };
        transfer.run(stream, attach_rx, cancel).await
    }
    .await;
    context.registry.release(offer.transfer_id).await;

    let bytes = received.load(Ordering::Relaxed);
    match result {
        Ok(()) => {
            info!("Received {:?} from {}", claimed.destination, peer);
            ReceiverOutcome::success(endpoint, bytes, offer.segments.len())
        }
        Err(e) => {
            let e = if cancel.is_cancelled() {
                TransferError::Cancelled
            } else {
                e
            };
            warn!("Transfer from {} failed: {}", peer, e);
            ReceiverOutcome::failed(endpoint, &e).with_progress(bytes, offer.segments.len())
        }
    }
}

// ============================================================================
// Receive pipeline
// ============================================================================

struct IncomingTransfer<'a> {
    endpoint: Endpoint,
    offer: &'a Offer,
    secret: SessionSecret,
    claimed: &'a Claimed,
    config: &'a TransferConfig,
    hooks: &'a TransferHooks,
    received: Arc<AtomicU64>,
}

impl IncomingTransfer<'_> {
    /// Receives every stream into the staging path, moves the result into
    /// place and acknowledges. The staging path never outlives a failure.
    async fn run(
        &self,
        stream: TcpStream,
        attach_rx: mpsc::Receiver<AttachedStream>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let token = cancel.child_token();
        let (primary_read, mut primary_write) = stream.into_split();

        let mut result = if self.offer.is_directory() {
            self.receive_directory(primary_read, &token).await
        } else {
            self.receive_file(primary_read, attach_rx, &token).await
        };
        if result.is_ok() {
            result = tokio::fs::rename(&self.claimed.staging, &self.claimed.destination)
                .await
                .map_err(TransferError::from);
        }

        match result {
            Ok(()) => {
                if let Err(e) = networking::write_message(&mut primary_write, &Completion::Success).await {
                    warn!("Could not acknowledge {}: {}", self.endpoint, e);
                }
                Ok(())
            }
            Err(e) => {
                remove_staging(&self.claimed.staging).await;
                let _ = networking::write_message(
                    &mut primary_write,
                    &Completion::Failed(e.to_string()),
                )
                .await;
                Err(e)
            }
        }
    }

    /// How long a sender may stay silent. A fan-out sender starts streaming
    /// only after every handshake settled, bounded by its handshake timeout.
    fn stall_limit(&self) -> Duration {
        self.config.handshake_timeout + self.config.connection_timeout
    }

    fn stream_job(&self, segment: Segment, sink: ChunkSink, cancel: &CancellationToken) -> StreamJob {
        StreamJob {
            segment,
            bounded: !self.offer.is_directory(),
            secret: self.secret.clone(),
            compression_level: self.offer.compression_level,
            chunk_size: self.offer.chunk_size as usize,
            max_payload: self.offer.max_payload_len(),
            sink,
            endpoint: self.endpoint,
            received: self.received.clone(),
            total: self.offer.size,
            hooks: self.hooks.clone(),
            idle_timeout: self.stall_limit(),
            cancel: cancel.clone(),
        }
    }

    async fn receive_file(
        &self,
        primary: tokio::net::tcp::OwnedReadHalf,
        mut attach_rx: mpsc::Receiver<AttachedStream>,
        token: &CancellationToken,
    ) -> Result<()> {
        let staging = &self.claimed.staging;
        {
            let file = tokio::fs::File::create(staging).await?;
            file.set_len(self.offer.size.unwrap_or(0)).await?;
        }

        let segments = &self.offer.segments;
        let mut streams = JoinSet::new();
        let first = self.stream_job(segments[0], ChunkSink::open_file(staging, &segments[0]).await?, token);
        streams.spawn(first.run(primary));

        let mut pending: HashSet<u32> = segments.iter().skip(1).map(|s| s.stream_id).collect();
        let deadline = Instant::now() + self.stall_limit();
        let mut failure = None;
        while !pending.is_empty() && failure.is_none() {
            tokio::select! {
                _ = token.cancelled() => failure = Some(TransferError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    failure = Some(TransferError::ConnectionFailure(format!(
                        "{} of {} streams never connected",
                        pending.len(),
                        segments.len()
                    )));
                }
                attached = attach_rx.recv() => match attached {
                    Some(attached) if pending.remove(&attached.stream_id) => {
                        debug!("Stream {} attached from {}", attached.stream_id, self.endpoint);
                        let segment = segments[attached.stream_id as usize];
                        let sink = ChunkSink::open_file(staging, &segment).await?;
                        streams.spawn(self.stream_job(segment, sink, token).run(attached.stream));
                    }
                    Some(attached) => {
                        failure = Some(TransferError::integrity(format!(
                            "unexpected stream id {}",
                            attached.stream_id
                        )));
                    }
                    None => failure = Some(TransferError::Protocol("stream registry closed".into())),
                },
                Some(joined) = streams.join_next() => {
                    if let Err(e) = flatten(joined) {
                        failure = Some(e);
                    }
                }
            }
        }
        if failure.is_some() {
            token.cancel();
        }

        while let Some(joined) = streams.join_next().await {
            if let Err(e) = flatten(joined) {
                if failure.is_none() {
                    debug!("Stream from {} failed, stopping the others", self.endpoint);
                    token.cancel();
                    failure = Some(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn receive_directory(
        &self,
        primary: tokio::net::tcp::OwnedReadHalf,
        token: &CancellationToken,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel(self.config.queue_depth);
        let staging = self.claimed.staging.clone();
        let extractor =
            tokio::task::spawn_blocking(move || archive::deserialize(ChannelReader::new(rx), &staging));

        let streamed = self
            .stream_job(self.offer.segments[0], ChunkSink::Archive(tx), token)
            .run(primary)
            .await;
        let extracted = extractor.await.map_err(|e| {
            TransferError::Io(std::io::Error::other(format!("archive extractor failed: {e}")))
        })?;

        match (streamed, extracted) {
            // The network side failed first; the extractor only saw a short stream.
            (Err(e), _) if !matches!(e, TransferError::ArchiveFormat(_)) => Err(e),
            (_, Err(e)) => Err(e),
            (Err(e), Ok(_)) => Err(e),
            (Ok(()), Ok(summary)) => {
                debug!(
                    "Extracted {} directories and {} files ({} bytes)",
                    summary.directories, summary.files, summary.bytes
                );
                Ok(())
            }
        }
    }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.unwrap_or_else(|e| {
        Err(TransferError::Io(std::io::Error::other(format!(
            "stream task failed: {e}"
        ))))
    })
}

/// Where one stream's plaintext goes.
enum ChunkSink {
    /// Positioned writes into the staged file, starting at the segment offset.
    File(tokio::fs::File),
    /// The archive extractor's input.
    Archive(mpsc::Sender<Vec<u8>>),
}

impl ChunkSink {
    async fn open_file(staging: &Path, segment: &Segment) -> Result<Self> {
        let mut file = tokio::fs::OpenOptions::new().write(true).open(staging).await?;
        file.seek(std::io::SeekFrom::Start(segment.offset)).await?;
        Ok(ChunkSink::File(file))
    }

    async fn write(&mut self, plaintext: Vec<u8>) -> Result<()> {
        match self {
            ChunkSink::File(file) => Ok(file.write_all(&plaintext).await?),
            ChunkSink::Archive(tx) => tx.send(plaintext).await.map_err(|_| {
                TransferError::ArchiveFormat("archive ended before the stream did".into())
            }),
        }
    }

    async fn finish(self) -> Result<()> {
        match self {
            ChunkSink::File(mut file) => {
                file.flush().await?;
                file.sync_all().await?;
                Ok(())
            }
            ChunkSink::Archive(_) => Ok(()),
        }
    }
}

struct StreamJob {
    segment: Segment,
    /// File segments must deliver exactly `segment.length` bytes.
    bounded: bool,
    secret: SessionSecret,
    compression_level: u32,
    chunk_size: usize,
    max_payload: usize,
    sink: ChunkSink,
    endpoint: Endpoint,
    received: Arc<AtomicU64>,
    total: Option<u64>,
    hooks: TransferHooks,
    /// Longest silence tolerated between frames.
    idle_timeout: Duration,
    cancel: CancellationToken,
}

impl StreamJob {
    /// Reads one stream until its end marker: de-frame, decrypt in sequence,
    /// inflate, write.
    async fn run<R>(mut self, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let stream_id = self.segment.stream_id;
        let mut cipher = open_reader(&self.secret, stream_id);
        let mut remaining = self.segment.length;

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                frame = tokio::time::timeout(
                    self.idle_timeout,
                    read_frame(&mut reader, self.max_payload),
                ) => frame.map_err(|_| {
                    TransferError::ConnectionFailure(format!(
                        "stream {stream_id}: no data from {} for {:?}",
                        self.endpoint, self.idle_timeout
                    ))
                })??,
            };

            let chunk = match frame {
                Frame::Data(chunk) => chunk,
                Frame::End { stream_id: ended, chunks } => {
                    if ended != stream_id || chunks != cipher.chunks_opened() {
                        return Err(TransferError::integrity(format!(
                            "stream {stream_id}: end marker for stream {ended} after {chunks} chunks, received {}",
                            cipher.chunks_opened()
                        )));
                    }
                    if self.bounded && remaining != 0 {
                        return Err(TransferError::integrity(format!(
                            "stream {stream_id}: ended {remaining} bytes short"
                        )));
                    }
                    debug!("Stream {} complete after {} chunks", stream_id, chunks);
                    return self.sink.finish().await;
                }
            };

            if chunk.stream_id != stream_id {
                return Err(TransferError::integrity(format!(
                    "stream {stream_id}: frame labelled for stream {}",
                    chunk.stream_id
                )));
            }
            let plain_len = chunk.plain_len as usize;
            if plain_len > self.chunk_size || (self.bounded && plain_len as u64 > remaining) {
                return Err(TransferError::integrity(format!(
                    "stream {stream_id}: chunk {} declares {plain_len} bytes",
                    chunk.sequence
                )));
            }

            let opened = cipher.open(chunk.sequence, &chunk.payload)?;
            let plaintext = if self.compression_level > 0 {
                decompress_chunk(&opened, plain_len)?
            } else if opened.len() == plain_len {
                opened
            } else {
                return Err(TransferError::integrity(format!(
                    "stream {stream_id}: chunk {} length mismatch",
                    chunk.sequence
                )));
            };

            self.sink.write(plaintext).await?;
            if self.bounded {
                remaining -= plain_len as u64;
            }
            let so_far = self.received.fetch_add(plain_len as u64, Ordering::Relaxed) + plain_len as u64;
            self.hooks.report_progress(&self.endpoint, so_far, self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================================
    // Naming Tests
    // ============================================================================

    #[test]
    fn test_sanitize_keeps_final_component() {
        assert_eq!(sanitize_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_name("C:\\Users\\me\\notes.txt"), "notes.txt");
        assert_eq!(sanitize_name("photos/"), "photos");
        assert_eq!(sanitize_name(".."), FALLBACK_NAME);
        assert_eq!(sanitize_name("  "), FALLBACK_NAME);
    }

    #[test]
    fn test_numbered_names() {
        assert_eq!(numbered("report.pdf", 1), "report_1.pdf");
        assert_eq!(numbered("archive.tar.gz", 2), "archive.tar_2.gz");
        assert_eq!(numbered("photos", 3), "photos_3");
        assert_eq!(numbered(".bashrc", 1), ".bashrc_1");
    }

    #[test]
    fn test_resolve_destination_skips_existing_and_staged() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"old").unwrap();
        std::fs::write(dir.path().join("a_1.txt.part"), b"staged").unwrap();

        let resolved = resolve_destination(dir.path(), "a.txt", |_| false);
        assert_eq!(resolved, dir.path().join("a_2.txt"));

        let fresh = resolve_destination(dir.path(), "b.txt", |_| false);
        assert_eq!(fresh, dir.path().join("b.txt"));
    }

    #[test]
    fn test_staging_path() {
        assert_eq!(
            staging_path(Path::new("/tmp/x/data.bin")),
            PathBuf::from("/tmp/x/data.bin.part")
        );
    }

    // ============================================================================
    // Registry Tests
    // ============================================================================

    fn spawn_registry(dir: &Path) -> RegistryHandle {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(TransferRegistry::new(dir.to_path_buf(), rx).run());
        RegistryHandle::new(tx)
    }

    #[tokio::test]
    async fn test_concurrent_claims_on_same_name_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let registry = spawn_registry(dir.path());
        let (attach, _keep) = mpsc::channel(1);

        let first = TransferId::random();
        let claimed = registry.claim(first, "movie.mkv", attach.clone()).await.unwrap();
        assert_eq!(claimed.destination, dir.path().join("movie.mkv"));
        assert_eq!(claimed.staging, dir.path().join("movie.mkv.part"));

        let second = registry
            .claim(TransferId::random(), "sub/movie.mkv", attach.clone())
            .await;
        assert!(matches!(second, Err(TransferError::DestinationConflict(_))));

        // A different name is fine meanwhile.
        assert!(registry
            .claim(TransferId::random(), "other.mkv", attach.clone())
            .await
            .is_ok());

        registry.release(first).await;
        let again = registry.claim(TransferId::random(), "movie.mkv", attach).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_existing_file_gets_suffix_not_conflict() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();
        let registry = spawn_registry(dir.path());
        let (attach, _keep) = mpsc::channel(1);

        let claimed = registry
            .claim(TransferId::random(), "notes.txt", attach)
            .await
            .unwrap();
        assert_eq!(claimed.destination, dir.path().join("notes_1.txt"));
    }

    #[tokio::test]
    async fn test_duplicate_transfer_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = spawn_registry(dir.path());
        let (attach, _keep) = mpsc::channel(1);
        let id = TransferId::random();

        registry.claim(id, "a", attach.clone()).await.unwrap();
        assert!(matches!(
            registry.claim(id, "b", attach).await,
            Err(TransferError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_staging_handles_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.part");
        let tree = dir.path().join("d.part");
        std::fs::write(&file, b"x").unwrap();
        std::fs::create_dir_all(tree.join("nested")).unwrap();
        std::fs::write(tree.join("nested/inner"), b"y").unwrap();

        remove_staging(&file).await;
        remove_staging(&tree).await;
        remove_staging(&dir.path().join("missing.part")).await;
        assert!(!file.exists());
        assert!(!tree.exists());
    }
}
