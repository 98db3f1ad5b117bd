//! Reconnecting sequence client.

use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use thiserror::Error;
use tungstenite::protocol::CloseFrame;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Error as WsError, Message as WsMessage, WebSocket};
use url::Url;
use uuid::Uuid;

use crate::proto::{
    MessageError, REASON_SEQUENCE_COMPLETE, WireMessage, close_code_name, decode_message,
    encode_message, is_application_code, sequence_checksum,
};

mod backoff;

pub use backoff::BackoffPolicy;
use backoff::Backoff;

/// How long `result` waits for the run to finish.
pub const RESULT_DEADLINE: Duration = Duration::from_secs(300);

const READ_TICK: Duration = Duration::from_millis(100);

type ClientSocket = WebSocket<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ClientParams {
    pub server_host: String,
    pub server_port: u16,
    /// Sequence length to request; the server picks one at random when
    /// unset.
    pub sequence_count: Option<u32>,
    /// Send `lastReceived` on reconnects so the server resumes past what
    /// this client already holds.
    pub send_last_received_index: bool,
    pub max_reconnect_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Hooks for driving failure scenarios from tests.
    pub override_client_id: Option<String>,
    pub override_last_received: Option<u32>,
}

impl Default for ClientParams {
    fn default() -> Self {
        Self {
            server_host: "localhost".to_string(),
            server_port: 3000,
            sequence_count: None,
            send_last_received_index: false,
            max_reconnect_attempts: 100,
            backoff: BackoffPolicy::default(),
            override_client_id: None,
            override_last_received: None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("server closed with {name}({code}): {reason}")]
    ServerClose {
        code: u16,
        name: &'static str,
        reason: String,
    },
    #[error("final message could not be decoded: {reason}")]
    Decode { reason: String },
    #[error("client checksum {local} does not match one from server {server}")]
    ChecksumMismatch { local: String, server: String },
    #[error("connection attempts exhausted after {attempts} tries: {last_error}")]
    ReconnectBudgetExhausted { attempts: u32, last_error: String },
    #[error("timed out after {0:?} waiting to receive full sequence")]
    DeadlineExceeded(Duration),
    #[error("invalid server address: {0}")]
    InvalidServerAddress(String),
}

/// What a finished (or failed) run looked like.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub checksum: String,
    pub server_checksum: Option<String>,
    pub success: bool,
    pub error: Option<ClientError>,
}

#[derive(Debug, Default)]
struct SessionState {
    client_id: String,
    received: Vec<u32>,
    complete: bool,
    success: bool,
    final_error: Option<ClientError>,
    server_checksum: Option<String>,
}

impl SessionState {
    fn last_received_index(&self) -> Option<usize> {
        self.received.len().checked_sub(1)
    }

    fn finished(&self) -> bool {
        self.complete || self.final_error.is_some()
    }
}

struct ClientShared {
    state: Mutex<SessionState>,
    done_tx: Sender<()>,
}

impl ClientShared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("client state lock poisoned")
    }

    fn notify_done(&self) {
        let _ = self.done_tx.try_send(());
    }

    fn fail(&self, error: ClientError) {
        {
            let mut state = self.state();
            state.success = false;
            if state.final_error.is_none() {
                state.final_error = Some(error);
            }
        }
        self.notify_done();
    }
}

pub struct Client {
    params: ClientParams,
    shared: Arc<ClientShared>,
    shutdown: Arc<AtomicBool>,
    done_rx: Receiver<()>,
    join: Option<JoinHandle<()>>,
}

impl Client {
    pub fn new(params: ClientParams) -> Self {
        let (done_tx, done_rx) = bounded(1);
        Self {
            params,
            shared: Arc::new(ClientShared {
                state: Mutex::new(SessionState::default()),
                done_tx,
            }),
            shutdown: Arc::new(AtomicBool::new(false)),
            done_rx,
            join: None,
        }
    }

    /// Dial the server (bounded exponential retries) and start the
    /// session thread. The dial error propagates when the budget runs
    /// out before the first connection is up.
    pub fn connect(&mut self) -> Result<(), ClientError> {
        {
            let mut state = self.shared.state();
            state.client_id = self
                .params
                .override_client_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
        }

        let socket = dial_with_backoff(&self.params, &self.shared, &self.shutdown)?;

        let params = self.params.clone();
        let shared = Arc::clone(&self.shared);
        let shutdown = Arc::clone(&self.shutdown);
        self.join = Some(thread::spawn(move || {
            run_session_loop(socket, params, shared, shutdown);
        }));

        Ok(())
    }

    /// Block until the run completes, fails, or the deadline passes.
    pub fn result(&self) -> RunResult {
        match self.done_rx.recv_timeout(RESULT_DEADLINE) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                let state = self.shared.state();
                if !state.finished() {
                    return RunResult {
                        checksum: sequence_checksum(&state.received),
                        server_checksum: state.server_checksum.clone(),
                        success: false,
                        error: Some(ClientError::DeadlineExceeded(RESULT_DEADLINE)),
                    };
                }
            }
        }

        let state = self.shared.state();
        RunResult {
            checksum: sequence_checksum(&state.received),
            server_checksum: state.server_checksum.clone(),
            success: state.success,
            error: state.final_error.clone(),
        }
    }

    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn dial_with_backoff(
    params: &ClientParams,
    shared: &Arc<ClientShared>,
    shutdown: &Arc<AtomicBool>,
) -> Result<ClientSocket, ClientError> {
    let url = build_url(params, shared)?;
    let mut backoff = Backoff::new(params.backoff);
    let mut failures = 0u32;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Err(ClientError::ReconnectBudgetExhausted {
                attempts: failures,
                last_error: "client shut down".to_string(),
            });
        }

        match tungstenite::connect(url.as_str()) {
            Ok((socket, _response)) => {
                if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
                    let _ = stream.set_nodelay(true);
                    let _ = stream.set_read_timeout(Some(READ_TICK));
                }
                tracing::debug!(%url, "connected");
                return Ok(socket);
            }
            Err(err) => {
                failures += 1;
                if failures > params.max_reconnect_attempts {
                    return Err(ClientError::ReconnectBudgetExhausted {
                        attempts: failures,
                        last_error: err.to_string(),
                    });
                }
                let delay = backoff.next_delay();
                tracing::debug!("connect failed ({err}); retrying in {delay:?}");
                thread::sleep(delay);
            }
        }
    }
}

fn build_url(params: &ClientParams, shared: &Arc<ClientShared>) -> Result<Url, ClientError> {
    let state = shared.state();
    let base = format!("ws://{}:{}/", params.server_host, params.server_port);
    let mut url =
        Url::parse(&base).map_err(|err| ClientError::InvalidServerAddress(err.to_string()))?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("clientId", &state.client_id);
        if let Some(count) = params.sequence_count {
            query.append_pair("sequenceCount", &count.to_string());
        }
        if params.send_last_received_index {
            if let Some(index) = state.last_received_index() {
                query.append_pair("lastReceived", &index.to_string());
            } else if let Some(index) = params.override_last_received {
                query.append_pair("lastReceived", &index.to_string());
            }
        }
    }

    Ok(url)
}

fn run_session_loop(
    first_socket: ClientSocket,
    params: ClientParams,
    shared: Arc<ClientShared>,
    shutdown: Arc<AtomicBool>,
) {
    let mut socket = Some(first_socket);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let current = match socket.take() {
            Some(socket) => socket,
            None => match dial_with_backoff(&params, &shared, &shutdown) {
                Ok(socket) => socket,
                Err(err) => {
                    shared.fail(err);
                    break;
                }
            },
        };

        match run_session(current, &shared, &shutdown) {
            SessionOutcome::Finished => break,
            SessionOutcome::Reconnect => {
                tracing::debug!("connection lost before completion; reconnecting");
            }
        }
    }

    // Covers every exit path, including shutdown mid-session.
    shared.notify_done();
}

enum SessionOutcome {
    Finished,
    Reconnect,
}

fn run_session(
    mut socket: ClientSocket,
    shared: &Arc<ClientShared>,
    shutdown: &Arc<AtomicBool>,
) -> SessionOutcome {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return SessionOutcome::Finished;
        }

        match socket.read() {
            Ok(WsMessage::Binary(bytes)) => {
                match handle_server_frame(&mut socket, shared, &bytes) {
                    FrameOutcome::Continue => {}
                    FrameOutcome::Complete => return SessionOutcome::Finished,
                }
            }
            Ok(WsMessage::Close(frame)) => return handle_close(frame, shared),
            Ok(_) => {}
            Err(WsError::Io(err)) if would_block(&err) => {}
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                return reconnect_or_finish(shared);
            }
            Err(err) => {
                tracing::debug!("transport read error: {err}");
                return reconnect_or_finish(shared);
            }
        }
    }
}

enum FrameOutcome {
    Continue,
    Complete,
}

fn handle_server_frame(
    socket: &mut ClientSocket,
    shared: &Arc<ClientShared>,
    bytes: &[u8],
) -> FrameOutcome {
    let message = match decode_message(bytes) {
        Ok(message) => message,
        Err(err @ MessageError::FinalPayload(_)) => {
            // A terminal frame that cannot be parsed ends the run.
            shared.fail(ClientError::Decode {
                reason: err.to_string(),
            });
            return FrameOutcome::Complete;
        }
        Err(err) => {
            tracing::debug!("dropping undecodable frame: {err}");
            return FrameOutcome::Continue;
        }
    };

    match message {
        WireMessage::NumberInSequence { number } => {
            let index = {
                let mut state = shared.state();
                state.received.push(number);
                (state.received.len() - 1) as u32
            };
            send_ack(socket, index);
            FrameOutcome::Continue
        }
        WireMessage::LastNumberInSequence(final_message) => {
            let index = {
                let mut state = shared.state();
                state.received.push(final_message.number);
                let local = sequence_checksum(&state.received);
                if local == final_message.checksum {
                    state.success = true;
                } else {
                    state.success = false;
                    state.final_error = Some(ClientError::ChecksumMismatch {
                        local,
                        server: final_message.checksum.clone(),
                    });
                }
                state.server_checksum = Some(final_message.checksum);
                state.complete = true;
                (state.received.len() - 1) as u32
            };
            shared.notify_done();
            // The server closes 1000 on this ack when it arrives; a lost
            // one just lets the session idle out server-side.
            send_ack(socket, index);
            FrameOutcome::Complete
        }
        WireMessage::Acknowledgement { .. } => {
            tracing::debug!("ignoring acknowledgement frame from server");
            FrameOutcome::Continue
        }
    }
}

fn handle_close(frame: Option<CloseFrame>, shared: &Arc<ClientShared>) -> SessionOutcome {
    let Some(frame) = frame else {
        return reconnect_or_finish(shared);
    };
    let code = u16::from(frame.code);
    let reason = frame.reason.into_owned();

    if is_application_code(code) {
        tracing::debug!(code, %reason, "server rejected the session");
        shared.fail(ClientError::ServerClose {
            code,
            name: close_code_name(code),
            reason,
        });
        return SessionOutcome::Finished;
    }

    if reason == REASON_SEQUENCE_COMPLETE {
        return SessionOutcome::Finished;
    }

    reconnect_or_finish(shared)
}

fn reconnect_or_finish(shared: &Arc<ClientShared>) -> SessionOutcome {
    if shared.state().finished() {
        SessionOutcome::Finished
    } else {
        SessionOutcome::Reconnect
    }
}

fn send_ack(socket: &mut ClientSocket, index: u32) {
    let frame = match encode_message(&WireMessage::Acknowledgement { index }) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!("failed to encode acknowledgement {index}: {err}");
            return;
        }
    };
    // A lost ack resurfaces through the resume rules on reconnect.
    if let Err(err) = socket.send(WsMessage::Binary(frame)) {
        tracing::debug!("failed to send acknowledgement {index}: {err}");
    }
}

fn would_block(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Arc<ClientShared> {
        let (done_tx, _done_rx) = bounded(1);
        Arc::new(ClientShared {
            state: Mutex::new(SessionState::default()),
            done_tx,
        })
    }

    fn params() -> ClientParams {
        ClientParams {
            override_client_id: Some("client-1".to_string()),
            ..ClientParams::default()
        }
    }

    #[test]
    fn url_carries_the_client_id_and_requested_count() {
        let shared = shared();
        shared.state().client_id = "client-1".to_string();
        let url = build_url(
            &ClientParams {
                sequence_count: Some(64),
                ..params()
            },
            &shared,
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:3000/?clientId=client-1&sequenceCount=64"
        );
    }

    #[test]
    fn url_omits_last_received_until_something_arrived() {
        let shared = shared();
        shared.state().client_id = "client-1".to_string();
        let resume = ClientParams {
            send_last_received_index: true,
            ..params()
        };

        let url = build_url(&resume, &shared).unwrap();
        assert!(!url.as_str().contains("lastReceived"));

        shared.state().received = vec![5, 6, 7];
        let url = build_url(&resume, &shared).unwrap();
        assert!(url.as_str().contains("lastReceived=2"));
    }

    #[test]
    fn url_ignores_last_received_when_resume_is_disabled() {
        let shared = shared();
        shared.state().client_id = "client-1".to_string();
        shared.state().received = vec![5, 6];
        let url = build_url(&params(), &shared).unwrap();
        assert!(!url.as_str().contains("lastReceived"));
    }

    #[test]
    fn url_falls_back_to_the_override_last_received() {
        let shared = shared();
        shared.state().client_id = "client-1".to_string();
        let url = build_url(
            &ClientParams {
                send_last_received_index: true,
                override_last_received: Some(4),
                ..params()
            },
            &shared,
        )
        .unwrap();
        assert!(url.as_str().contains("lastReceived=4"));
    }

    #[test]
    fn application_close_codes_finish_without_reconnect() {
        let shared = shared();
        let outcome = handle_close(
            Some(CloseFrame {
                code: 4002.into(),
                reason: "missing client id".into(),
            }),
            &shared,
        );
        assert!(matches!(outcome, SessionOutcome::Finished));

        let state = shared.state();
        assert_eq!(
            state.final_error,
            Some(ClientError::ServerClose {
                code: 4002,
                name: "MissingClientID",
                reason: "missing client id".to_string(),
            })
        );
    }

    #[test]
    fn normal_completion_close_finishes() {
        let shared = shared();
        shared.state().complete = true;
        shared.state().success = true;
        let outcome = handle_close(
            Some(CloseFrame {
                code: 1000.into(),
                reason: REASON_SEQUENCE_COMPLETE.into(),
            }),
            &shared,
        );
        assert!(matches!(outcome, SessionOutcome::Finished));
        assert_eq!(shared.state().final_error, None);
    }

    #[test]
    fn abnormal_closes_reconnect_while_unfinished() {
        let shared = shared();
        let outcome = handle_close(
            Some(CloseFrame {
                code: 1006.into(),
                reason: "".into(),
            }),
            &shared,
        );
        assert!(matches!(outcome, SessionOutcome::Reconnect));
        assert!(shared.state().final_error.is_none());

        shared.state().complete = true;
        let outcome = handle_close(None, &shared);
        assert!(matches!(outcome, SessionOutcome::Finished));
    }

    #[test]
    fn first_error_wins() {
        let shared = shared();
        shared.fail(ClientError::Decode {
            reason: "truncated".to_string(),
        });
        shared.fail(ClientError::DeadlineExceeded(RESULT_DEADLINE));
        assert_eq!(
            shared.state().final_error,
            Some(ClientError::Decode {
                reason: "truncated".to_string()
            })
        );
    }
}
