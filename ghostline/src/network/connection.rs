// Copyright (c) 2024 Botho Foundation

//! One peer connection.
//!
//! A connection starts with a key-exchange handshake over the obfuscated
//! stream and only then carries messages:
//!
//! - outbound: rotate the peer's session, send the offer, wait for the
//!   confirm (or win or lose a simultaneous-open tie-break);
//! - inbound: wait for a valid signed offer from a known peer, install it
//!   and confirm.
//!
//! After the handshake the stream is split between a writer task, which owns
//! every outbound unit (messages, key exchange, decoys) and applies jitter
//! before each, and a reader task, which reassembles units, strips cover
//! traffic and delivers plaintext.

use super::obfuscation::{InboundUnit, ObfuscationCodec, ObfuscationError, Obfuscator, OutboundUnit};
use crate::{
    crypto::{CryptoError, MessageCipher},
    envelope::{Envelope, EnvelopeType, SessionId},
    identity::DeviceId,
    session::{KeyExchangeOutcome, SessionError, SessionManager},
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::{
    fmt, io,
    sync::Arc,
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, trace};

/// Default time allowed for the key-exchange handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound commands queued per connection.
const COMMAND_QUEUE: usize = 100;

/// Errors on a single connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Obfuscation(#[from] ObfuscationError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The remote side did not identify itself with a valid offer.
    #[error("remote did not identify")]
    Unidentified,

    #[error("expected {expected}, remote is {actual}")]
    UnexpectedPeer { expected: DeviceId, actual: DeviceId },

    #[error("connection closed")]
    Closed,

    /// A concurrent handshake with the same peer won; this stream is redundant.
    #[error("superseded by a concurrent handshake")]
    Superseded,
}

/// Identifies one connection among successive ones to the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub from: DeviceId,
    pub plaintext: Vec<u8>,
    pub received_at: SystemTime,
    pub session_id: SessionId,
}

/// Which side opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote side closed the stream.
    RemoteClosed,
    /// Closed locally by `disconnect` or shutdown.
    Local,
    /// A newer connection to the same peer took over.
    Replaced,
    /// Stream or protocol error.
    Error(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteClosed => write!(f, "remote closed"),
            Self::Local => write!(f, "closed locally"),
            Self::Replaced => write!(f, "replaced"),
            Self::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Receives what a connection's tasks produce.
pub(crate) trait ConnectionObserver: Send + Sync + 'static {
    fn on_message(&self, message: ReceivedMessage);

    fn on_closed(&self, peer: DeviceId, id: ConnectionId, reason: DisconnectReason);
}

/// State shared by every connection of a node.
pub(crate) struct LinkContext {
    pub local_id: DeviceId,
    pub sessions: Arc<SessionManager>,
    pub cipher: MessageCipher,
    pub obfuscator: Obfuscator,
    pub handshake_timeout: Duration,
}

enum Command {
    Send {
        plaintext: Vec<u8>,
        done: oneshot::Sender<Result<(), ConnectionError>>,
    },
    /// Key-exchange reply produced by the reader.
    Control(Envelope),
}

/// Handle to a running connection.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    id: ConnectionId,
    direction: Direction,
    opened_at: Instant,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    reason: Arc<parking_lot::Mutex<Option<DisconnectReason>>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Queue `plaintext` and wait until it is on the wire.
    pub async fn send(&self, plaintext: Vec<u8>) -> Result<(), ConnectionError> {
        let (done, result) = oneshot::channel();
        self.commands
            .send(Command::Send { plaintext, done })
            .await
            .map_err(|_| ConnectionError::Closed)?;
        result.await.map_err(|_| ConnectionError::Closed)?
    }

    /// Stop both tasks.
    pub fn close(&self, reason: DisconnectReason) {
        self.reason.lock().get_or_insert(reason);
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub(crate) type UnitStream<S> = Framed<S, ObfuscationCodec>;

/// Wrap a raw stream for the obfuscated protocol.
pub(crate) fn frame<S>(stream: S, obfuscator: &Obfuscator) -> UnitStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Framed::new(stream, ObfuscationCodec::new(obfuscator.clone()))
}

async fn send_unit<S>(
    ctx: &LinkContext,
    framed: &mut UnitStream<S>,
    unit: OutboundUnit,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ctx.obfuscator.jitter().wait().await;
    framed.send(unit).await?;
    Ok(())
}

/// Next envelope from the stream, skipping cover units.
async fn next_envelope<S>(framed: &mut UnitStream<S>) -> Result<Envelope, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match framed.next().await {
            Some(Ok(InboundUnit::Envelope(envelope))) => return Ok(envelope),
            Some(Ok(InboundUnit::Decoy | InboundUnit::Malformed)) => trace!("Discarded cover unit"),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ConnectionError::Closed),
        }
    }
}

/// Run the initiator side of the handshake with `peer`.
pub(crate) async fn handshake_outbound<S>(
    ctx: &LinkContext,
    framed: &mut UnitStream<S>,
    peer: DeviceId,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(ctx.handshake_timeout, offer_and_await_confirm(ctx, framed, peer))
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout)?
}

async fn offer_and_await_confirm<S>(
    ctx: &LinkContext,
    framed: &mut UnitStream<S>,
    peer: DeviceId,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session = ctx.sessions.rotate(&peer)?;
    if let Some(offer) = session.offer {
        send_unit(ctx, framed, OutboundUnit::Envelope(offer)).await?;
    }

    loop {
        let envelope = next_envelope(framed).await?;
        if envelope.sender != peer {
            return Err(ConnectionError::UnexpectedPeer {
                expected: peer,
                actual: envelope.sender,
            });
        }
        if envelope.kind != EnvelopeType::KeyExchange {
            trace!(peer = %peer.short(), "Ignoring message before handshake completes");
            continue;
        }

        match ctx.sessions.on_key_exchange_received(&envelope)? {
            KeyExchangeOutcome::Confirmed => return Ok(()),
            KeyExchangeOutcome::Installed { confirm } => {
                // Simultaneous open, the peer's generation won
                send_unit(ctx, framed, OutboundUnit::Envelope(confirm)).await?;
                return Ok(());
            }
            KeyExchangeOutcome::Superseded | KeyExchangeOutcome::Ignored => {}
        }
    }
}

/// Run the responder side of the handshake. Returns the authenticated peer.
///
/// `on_offer` sees the claimed sender of each key exchange before it is
/// processed.
pub(crate) async fn handshake_inbound<S, F>(
    ctx: &LinkContext,
    framed: &mut UnitStream<S>,
    on_offer: F,
) -> Result<DeviceId, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(DeviceId),
{
    tokio::time::timeout(ctx.handshake_timeout, await_offer(ctx, framed, on_offer))
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout)?
}

async fn await_offer<S, F>(
    ctx: &LinkContext,
    framed: &mut UnitStream<S>,
    mut on_offer: F,
) -> Result<DeviceId, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(DeviceId),
{
    loop {
        let envelope = next_envelope(framed).await?;
        if envelope.kind != EnvelopeType::KeyExchange {
            continue;
        }
        on_offer(envelope.sender);
        match ctx.sessions.on_key_exchange_received(&envelope) {
            Ok(KeyExchangeOutcome::Installed { confirm }) => {
                send_unit(ctx, framed, OutboundUnit::Envelope(confirm)).await?;
                return Ok(envelope.sender);
            }
            // Our own offer to this peer is in flight on another stream
            Ok(KeyExchangeOutcome::Superseded) => {
                debug!(peer = %envelope.sender.short(), "Inbound handshake lost to our concurrent offer");
                return Err(ConnectionError::Superseded);
            }
            Ok(_) => {}
            Err(e) => {
                debug!("Rejected inbound key exchange: {}", e);
                return Err(ConnectionError::Unidentified);
            }
        }
    }
}

/// Split a handshaken stream into its reader and writer tasks.
pub(crate) fn spawn<S>(
    ctx: Arc<LinkContext>,
    observer: Arc<dyn ConnectionObserver>,
    id: ConnectionId,
    peer: DeviceId,
    direction: Direction,
    framed: UnitStream<S>,
) -> ConnectionHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (commands, queue) = mpsc::channel(COMMAND_QUEUE);
    let cancel = CancellationToken::new();
    let handle = ConnectionHandle {
        id,
        direction,
        opened_at: Instant::now(),
        commands: commands.clone(),
        cancel: cancel.clone(),
        reason: Arc::new(parking_lot::Mutex::new(None)),
    };

    let (sink, stream) = framed.split();

    let writer = Writer {
        ctx: ctx.clone(),
        peer,
        sink,
        queue,
        cancel: cancel.clone(),
    };
    let writer_task = tokio::spawn(writer.run());

    let reader = Reader {
        ctx,
        peer,
        stream,
        control: commands,
        cancel,
        observer,
    };
    let reason = handle.reason.clone();
    tokio::spawn(async move {
        let observer = reader.observer.clone();
        let cancel = reader.cancel.clone();
        let ended = reader.run().await;
        cancel.cancel();
        let writer_error = writer_task.await.ok().flatten();

        let reason = reason
            .lock()
            .take()
            .or(writer_error)
            .unwrap_or(ended);
        debug!(peer = %peer.short(), connection = %id, "Connection ended: {}", reason);
        observer.on_closed(peer, id, reason);
    });

    handle
}

struct Writer<S> {
    ctx: Arc<LinkContext>,
    peer: DeviceId,
    sink: SplitSink<UnitStream<S>, OutboundUnit>,
    queue: mpsc::Receiver<Command>,
    cancel: CancellationToken,
}

impl<S> Writer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Returns the failure that stopped it, if any.
    async fn run(mut self) -> Option<DisconnectReason> {
        let mut next_cover = self.schedule_cover();

        let failure = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break None,
                command = self.queue.recv() => {
                    let Some(command) = command else { break None };
                    let result = match command {
                        Command::Send { plaintext, done } => {
                            let result = self.transmit(&plaintext).await;
                            let failure = result.as_ref().err().filter(|e| is_stream_error(e)).map(|e| e.to_string());
                            let _ = done.send(result);
                            match failure {
                                Some(failure) => Err(failure),
                                None => self.decoy_burst().await.map_err(|e| e.to_string()),
                            }
                        }
                        Command::Control(envelope) => self
                            .write(OutboundUnit::Envelope(envelope))
                            .await
                            .map_err(|e| e.to_string()),
                    };
                    if let Err(failure) = result {
                        break Some(DisconnectReason::Error(failure));
                    }
                    next_cover = self.schedule_cover();
                }
                _ = sleep_until(next_cover) => {
                    trace!(peer = %self.peer.short(), "Idle cover unit");
                    if let Err(e) = self.write(OutboundUnit::Decoy).await {
                        break Some(DisconnectReason::Error(e.to_string()));
                    }
                    next_cover = self.schedule_cover();
                }
            }
        };

        if failure.is_some() {
            self.cancel.cancel();
        }
        let _ = self.sink.close().await;
        failure
    }

    fn schedule_cover(&self) -> Option<Instant> {
        let delay = self
            .ctx
            .obfuscator
            .decoys()
            .next_cover_delay(&mut rand::thread_rng())?;
        Some(Instant::now() + delay)
    }

    async fn write(&mut self, unit: OutboundUnit) -> Result<(), ConnectionError> {
        self.ctx.obfuscator.jitter().wait().await;
        self.sink.send(unit).await?;
        Ok(())
    }

    /// Encrypt and send one message, offering a fresh key first if the
    /// current one expired.
    async fn transmit(&mut self, plaintext: &[u8]) -> Result<(), ConnectionError> {
        let session = self.ctx.sessions.get_or_create_session(&self.peer)?;
        if let Some(offer) = session.offer {
            debug!(peer = %self.peer.short(), "Rotating session key on live connection");
            self.write(OutboundUnit::Envelope(offer)).await?;
        }
        let envelope = self.ctx.cipher.encrypt(plaintext, &session.key, self.ctx.local_id)?;
        self.write(OutboundUnit::Envelope(envelope)).await
    }

    async fn decoy_burst(&mut self) -> Result<(), ConnectionError> {
        let burst = self
            .ctx
            .obfuscator
            .decoys()
            .burst_after_send(&mut rand::thread_rng());
        for _ in 0..burst {
            self.write(OutboundUnit::Decoy).await?;
        }
        Ok(())
    }
}

/// Errors after which the stream is unusable.
fn is_stream_error(error: &ConnectionError) -> bool {
    matches!(
        error,
        ConnectionError::Io(_) | ConnectionError::Obfuscation(ObfuscationError::Io(_))
    )
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct Reader<S> {
    ctx: Arc<LinkContext>,
    peer: DeviceId,
    stream: SplitStream<UnitStream<S>>,
    control: mpsc::Sender<Command>,
    cancel: CancellationToken,
    observer: Arc<dyn ConnectionObserver>,
}

impl<S> Reader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) -> DisconnectReason {
        loop {
            let unit = tokio::select! {
                _ = self.cancel.cancelled() => return DisconnectReason::Local,
                unit = self.stream.next() => unit,
            };

            match unit {
                None => return DisconnectReason::RemoteClosed,
                Some(Err(e)) => return DisconnectReason::Error(e.to_string()),
                Some(Ok(InboundUnit::Envelope(envelope))) if envelope.sender == self.peer => {
                    self.handle(envelope).await;
                }
                Some(Ok(_)) => trace!("Discarded cover unit"),
            }
        }
    }

    async fn handle(&mut self, envelope: Envelope) {
        match envelope.kind {
            EnvelopeType::Message => match self.ctx.sessions.decrypt_with_any_valid_key(&envelope) {
                Ok((plaintext, session_id)) => {
                    self.observer.on_message(ReceivedMessage {
                        from: self.peer,
                        plaintext,
                        received_at: SystemTime::now(),
                        session_id,
                    });
                }
                Err(_) => {
                    debug!(peer = %self.peer.short(), session = %envelope.session_id, "Discarded undecryptable message");
                }
            },
            EnvelopeType::KeyExchange => match self.ctx.sessions.on_key_exchange_received(&envelope) {
                Ok(outcome) => {
                    if let Some(reply) = outcome.reply() {
                        let _ = self.control.send(Command::Control(reply)).await;
                    }
                }
                Err(e) => debug!(peer = %self.peer.short(), "Rejected key exchange: {}", e),
            },
            EnvelopeType::Decoy => trace!("Discarded cover unit"),
        }
    }
}
