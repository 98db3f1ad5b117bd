//! WebSocket server: accept loop and per-connection protocol engine.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::protocol::CloseFrame;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::{Error as WsError, Message as WsMessage, WebSocket};

use crate::proto::{
    AppCloseCode, FinalMessage, MessageError, REASON_SEQUENCE_COMPLETE, WireMessage,
    decode_message, encode_message, sequence_checksum,
};
use crate::sequence::{MAX_SEQUENCE_NUMBER_VALUE, SequenceSource, random_sequence_count};
use crate::session::{SessionStore, SharedSessionStore, StoreError};

const ACCEPT_POLL: Duration = Duration::from_millis(25);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_DRAIN: Duration = Duration::from_secs(1);
const MAX_IDLE_WAIT: Duration = Duration::from_millis(25);
// Bounds back-to-back emission so inbound acknowledgements are drained
// between bursts even at a zero interval.
const PRODUCE_BATCH_MAX: usize = 64;

type ServerSocket = WebSocket<TcpStream>;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Pause between produced sequence frames.
    pub sequence_message_interval: Duration,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Server<S> {
    store: SharedSessionStore<S>,
    config: ServerConfig,
    source: Arc<dyn SequenceSource>,
}

pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Block until the accept loop exits.
    pub fn wait(self) {
        let _ = self.join.join();
    }

    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.join.join();
    }
}

impl<S> Server<S>
where
    S: SessionStore + Send + 'static,
{
    pub fn new(
        store: SharedSessionStore<S>,
        config: ServerConfig,
        source: Arc<dyn SequenceSource>,
    ) -> Self {
        Self {
            store,
            config,
            source,
        }
    }

    pub fn start(self) -> Result<ServerHandle, ServerError> {
        let listener = TcpListener::bind(&self.config.listen_addr)?;
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let runtime = ConnectionRuntime {
            store: self.store,
            interval: self.config.sequence_message_interval,
            source: self.source,
            shutdown: Arc::clone(&shutdown),
        };

        let join = thread::spawn(move || run_accept_loop(listener, runtime));

        Ok(ServerHandle {
            shutdown,
            join,
            local_addr,
        })
    }
}

struct ConnectionRuntime<S> {
    store: SharedSessionStore<S>,
    interval: Duration,
    source: Arc<dyn SequenceSource>,
    shutdown: Arc<AtomicBool>,
}

impl<S> Clone for ConnectionRuntime<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            interval: self.interval,
            source: Arc::clone(&self.source),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

fn run_accept_loop<S>(listener: TcpListener, runtime: ConnectionRuntime<S>)
where
    S: SessionStore + Send + 'static,
{
    if let Err(err) = listener.set_nonblocking(true) {
        tracing::error!("sequence server failed to set nonblocking: {err}");
        return;
    }

    loop {
        if runtime.shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                let runtime = runtime.clone();
                thread::spawn(move || {
                    if let Err(err) = run_connection(stream, runtime) {
                        tracing::warn!("connection from {peer} failed: {err}");
                    }
                });
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                tracing::warn!("accept error: {err}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

#[derive(Debug, Error)]
enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message encode error: {0}")]
    Message(#[from] MessageError),
}

#[derive(Debug, PartialEq, Eq)]
struct RequestParams {
    client_id: String,
    sequence_count: Option<u32>,
    last_received: Option<u32>,
}

#[derive(Debug, Error, PartialEq, Eq)]
enum RequestError {
    #[error("missing client id")]
    MissingClientId,
    #[error("sequence count must be an integer less than or equal to 0xffff")]
    InvalidSequenceCount,
    #[error("if provided, last received index must be an integer less than or equal to 0xffff")]
    InvalidLastReceived,
}

impl RequestError {
    fn close_code(&self) -> AppCloseCode {
        match self {
            RequestError::MissingClientId => AppCloseCode::MissingClientId,
            RequestError::InvalidSequenceCount => AppCloseCode::InvalidSequenceCount,
            RequestError::InvalidLastReceived => AppCloseCode::InvalidLastReceived,
        }
    }
}

fn parse_request(query: Option<&str>) -> Result<RequestParams, RequestError> {
    let mut client_id = String::new();
    let mut sequence_count_raw = None;
    let mut last_received_raw = None;

    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "clientId" => client_id = value.into_owned(),
                "sequenceCount" => sequence_count_raw = Some(value.into_owned()),
                "lastReceived" => last_received_raw = Some(value.into_owned()),
                _ => {}
            }
        }
    }

    if client_id.is_empty() {
        return Err(RequestError::MissingClientId);
    }
    let sequence_count = match sequence_count_raw {
        None => None,
        Some(raw) => Some(parse_bounded(&raw).ok_or(RequestError::InvalidSequenceCount)?),
    };
    let last_received = match last_received_raw {
        None => None,
        Some(raw) => Some(parse_bounded(&raw).ok_or(RequestError::InvalidLastReceived)?),
    };

    Ok(RequestParams {
        client_id,
        sequence_count,
        last_received,
    })
}

fn parse_bounded(raw: &str) -> Option<u32> {
    raw.parse::<u32>()
        .ok()
        .filter(|value| *value <= MAX_SEQUENCE_NUMBER_VALUE)
}

fn run_connection<S>(
    stream: TcpStream,
    mut runtime: ConnectionRuntime<S>,
) -> Result<(), ConnectionError>
where
    S: SessionStore,
{
    stream.set_nodelay(true)?;
    // Bound the upgrade read so a stalled peer cannot pin this thread.
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

    let mut request_query: Option<String> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        request_query = request.uri().query().map(str::to_owned);
        Ok(response)
    };
    let mut socket = match tungstenite::accept_hdr(stream, callback) {
        Ok(socket) => socket,
        Err(err) => {
            tracing::debug!("websocket upgrade failed: {err}");
            return Ok(());
        }
    };
    socket.get_ref().set_nonblocking(true)?;

    let params = match parse_request(request_query.as_deref()) {
        Ok(params) => params,
        Err(err) => {
            tracing::debug!("rejecting connection: {err}");
            close_with(&mut socket, err.close_code().into(), err.to_string());
            return Ok(());
        }
    };

    let count = params
        .sequence_count
        .map(|count| count as usize)
        .unwrap_or_else(random_sequence_count);
    // If a session already exists for this client id, the store keeps
    // its original sequence and this one is dropped.
    let sequence = runtime.source.generate(count);
    let view = match runtime.store.initialise(&params.client_id, sequence) {
        Ok(view) => view,
        Err(err @ StoreError::Expired { .. }) => {
            tracing::debug!("{err}");
            close_with(
                &mut socket,
                AppCloseCode::ExpiredSession.into(),
                "session has expired".to_string(),
            );
            return Ok(());
        }
        Err(err) => {
            tracing::error!("failed to initialise session: {err}");
            return Ok(());
        }
    };

    let len = view.sequence().len();
    let checksum = sequence_checksum(view.sequence());
    tracing::debug!(
        client_id = %params.client_id,
        sequence_len = len,
        "session ready"
    );

    run_engine(socket, runtime, params, len, checksum)
}

struct Producer {
    first_call: bool,
    offset_override: Option<usize>,
    next_due: Instant,
    done: bool,
}

/// Drives one connection: drains acknowledgements, flushes any queued
/// frame, and emits the next sequence element whenever the interval
/// elapses. Single-threaded over a non-blocking socket so the producer
/// cadence is independent of consumer traffic.
fn run_engine<S>(
    mut socket: ServerSocket,
    mut runtime: ConnectionRuntime<S>,
    params: RequestParams,
    len: usize,
    checksum: String,
) -> Result<(), ConnectionError>
where
    S: SessionStore,
{
    let interval = runtime.interval;
    let mut producer = Producer {
        first_call: true,
        offset_override: params.last_received.map(|value| value as usize),
        next_due: Instant::now(),
        done: false,
    };
    let mut need_flush = false;

    loop {
        if runtime.shutdown.load(Ordering::Relaxed) {
            // Drop the transport; the session stays for resumption.
            return Ok(());
        }

        // Consumer side: drain whatever the client sent.
        loop {
            match socket.read() {
                Ok(WsMessage::Binary(bytes)) => {
                    match handle_client_frame(&mut runtime.store, &params.client_id, &bytes) {
                        FrameDisposition::FinalAck => {
                            close_with(
                                &mut socket,
                                CloseCode::Normal,
                                REASON_SEQUENCE_COMPLETE.to_string(),
                            );
                            return Ok(());
                        }
                        FrameDisposition::Continue => {}
                    }
                }
                Ok(WsMessage::Close(_)) => {
                    drain_close(&mut socket);
                    return Ok(());
                }
                Ok(_) => {}
                Err(WsError::Io(err)) if would_block(&err) => break,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return Ok(()),
                Err(err) => {
                    tracing::debug!(client_id = %params.client_id, "transport read error: {err}");
                    return Ok(());
                }
            }
        }

        if need_flush {
            match socket.flush() {
                Ok(()) => need_flush = false,
                Err(WsError::Io(err)) if would_block(&err) => {}
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return Ok(()),
                Err(err) => {
                    tracing::debug!(client_id = %params.client_id, "transport flush error: {err}");
                    return Ok(());
                }
            }
        }

        // Producer side: emit every frame that has come due.
        let mut emitted = 0;
        while !producer.done
            && !need_flush
            && emitted < PRODUCE_BATCH_MAX
            && Instant::now() >= producer.next_due
        {
            let offset_override = if producer.first_call {
                producer.offset_override
            } else {
                None
            };
            match runtime
                .store
                .next(&params.client_id, offset_override, producer.first_call)
            {
                Ok((value, index)) => {
                    producer.first_call = false;
                    let message = if index + 1 < len {
                        WireMessage::NumberInSequence { number: value }
                    } else {
                        WireMessage::LastNumberInSequence(FinalMessage {
                            number: value,
                            checksum: checksum.clone(),
                        })
                    };
                    let bytes = encode_message(&message)?;
                    match socket.send(WsMessage::Binary(bytes)) {
                        Ok(()) => {}
                        Err(WsError::Io(err)) if would_block(&err) => need_flush = true,
                        Err(WsError::WriteBufferFull(_)) => need_flush = true,
                        Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return Ok(()),
                        Err(err) => {
                            tracing::debug!(
                                client_id = %params.client_id,
                                "transport write error: {err}"
                            );
                            return Ok(());
                        }
                    }
                    emitted += 1;
                    producer.next_due = Instant::now() + interval;
                }
                Err(StoreError::SequenceConsumed { .. }) => {
                    producer.done = true;
                    if len == 0 {
                        // No terminal frame exists for an empty sequence;
                        // complete the session outright.
                        close_with(
                            &mut socket,
                            CloseCode::Normal,
                            REASON_SEQUENCE_COMPLETE.to_string(),
                        );
                        return Ok(());
                    }
                }
                Err(err @ StoreError::Expired { .. }) => {
                    tracing::debug!("{err}");
                    close_with(
                        &mut socket,
                        AppCloseCode::ExpiredSession.into(),
                        "session has expired".to_string(),
                    );
                    return Ok(());
                }
                Err(err) => {
                    tracing::error!(client_id = %params.client_id, "next failed: {err}");
                    return Ok(());
                }
            }
        }

        let wait = if need_flush {
            Duration::from_millis(1)
        } else if producer.done {
            MAX_IDLE_WAIT
        } else {
            producer
                .next_due
                .saturating_duration_since(Instant::now())
                .min(MAX_IDLE_WAIT)
        };
        if !wait.is_zero() {
            thread::sleep(wait);
        }
    }
}

enum FrameDisposition {
    Continue,
    FinalAck,
}

fn handle_client_frame(
    store: &mut impl SessionStore,
    client_id: &str,
    bytes: &[u8],
) -> FrameDisposition {
    let message = match decode_message(bytes) {
        Ok(message) => message,
        Err(err) => {
            tracing::debug!(client_id, "dropping undecodable frame: {err}");
            return FrameDisposition::Continue;
        }
    };

    match message {
        WireMessage::Acknowledgement { index } => {
            match store.ack(client_id, index as usize) {
                Ok(true) => FrameDisposition::FinalAck,
                Ok(false) => FrameDisposition::Continue,
                // A late ack for a discarded session is harmless.
                Err(err @ (StoreError::NotFound { .. } | StoreError::Expired { .. })) => {
                    tracing::debug!("ignoring acknowledgement: {err}");
                    FrameDisposition::Continue
                }
                Err(err) => {
                    tracing::warn!("failed to record acknowledgement: {err}");
                    FrameDisposition::Continue
                }
            }
        }
        other => {
            tracing::debug!(client_id, tag = other.tag(), "ignoring unexpected client frame");
            FrameDisposition::Continue
        }
    }
}

fn close_with(socket: &mut ServerSocket, code: CloseCode, reason: String) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(err) = socket.close(Some(frame)) {
        tracing::debug!("close failed: {err}");
        return;
    }
    drain_close(socket);
}

/// Pump the socket until the close handshake finishes so the peer sees
/// the code, bounded so a vanished peer cannot hold the thread.
fn drain_close(socket: &mut ServerSocket) {
    let deadline = Instant::now() + CLOSE_DRAIN;
    while Instant::now() < deadline {
        let _ = socket.flush();
        match socket.read() {
            Ok(_) => {}
            Err(WsError::Io(err)) if would_block(&err) => {
                thread::sleep(Duration::from_millis(1));
            }
            Err(_) => break,
        }
    }
}

fn would_block(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
