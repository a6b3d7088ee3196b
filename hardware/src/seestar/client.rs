//! Protocol client for the smart-telescope control service.
//!
//! One TCP session carries both correlated command traffic and unsolicited
//! telemetry. A single background reader task consumes every inbound line:
//!
//! - Responses are matched to the outstanding [`PendingCommand`] with the same
//!   correlation id, which wakes only the caller that sent it.
//! - Everything else is telemetry and is merged into the status cell.
//!
//! The reader owns the sending side of the status cell, so it is the only
//! writer. [`ProtocolClient::status`] hands out cloned snapshots and never
//! touches the socket.
//!
//! # Example
//!
//! ```no_run
//! use hardware::seestar::ProtocolClient;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), hardware::seestar::ClientError> {
//! let mut client = ProtocolClient::default();
//! client.connect("192.168.1.100", 4700, Duration::from_secs(10)).await?;
//!
//! let info = client.get_system_info().await?;
//! println!("Firmware: {:?}", info.firmware_version);
//! println!("State: {}", client.status().state);
//!
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::protocol::{
    decode_line, InboundFrame, Request, Response, INVALID_PARAMS_CODE, MALFORMED_FRAME_CODE,
};
use super::status::{ConnectionState, DeviceStatus};

/// Default per-command response budget.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur talking to the device.
///
/// None of these poison the client: callers may retry the verb or reconnect.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// No session, handshake failure, or transport failure.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The device answered with a non-zero code, or the frame was malformed.
    #[error("Command {method} failed (code {code}): {message}")]
    Command {
        method: String,
        code: i64,
        message: String,
    },

    /// No response arrived within the command budget.
    #[error("Timeout after {timeout:?} waiting for {method}")]
    Timeout { method: String, timeout: Duration },
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Connection(err.to_string())
    }
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Client-side settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub command_timeout: Duration,
    /// Name presented in the `verify` handshake step
    pub client_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            client_name: "sequencer".to_string(),
        }
    }
}

/// A command waiting for its response.
struct PendingCommand {
    method: String,
    submitted_at: Instant,
    slot: oneshot::Sender<ClientResult<Response>>,
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingCommand>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, PendingCommand>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Live transport plus its reader task.
struct Session {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    reader: JoinHandle<()>,
    /// Set by the reader before it fails the pending commands
    closed: Arc<AtomicBool>,
    shutdown: oneshot::Sender<Option<String>>,
    peer: String,
}

/// Stateful client for one device connection.
pub struct ProtocolClient {
    config: ClientConfig,
    next_id: AtomicU64,
    pending: PendingMap,
    status: watch::Receiver<DeviceStatus>,
    session: Option<Session>,
}

impl Default for ProtocolClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl ProtocolClient {
    pub fn new(config: ClientConfig) -> Self {
        // Sender is dropped immediately; the receiver still yields the default snapshot
        let (_, status) = watch::channel(DeviceStatus::default());
        Self {
            config,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            status,
            session: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open the transport and complete the challenge/verify handshake.
    ///
    /// The whole sequence shares one `timeout` budget. Any existing session is
    /// closed first.
    ///
    /// # Errors
    ///
    /// [`ClientError::Connection`] with "connection timeout" if the budget
    /// elapses, "handshake failed" if the device rejects the session, or the
    /// transport error if the connection is refused.
    pub async fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> ClientResult<()> {
        self.disconnect().await;

        let deadline = Instant::now() + timeout;
        let peer = format!("{host}:{port}");
        info!("Connecting to {peer}");

        let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Err(_) => return Err(ClientError::Connection("connection timeout".to_string())),
            Ok(Err(e)) => {
                return Err(ClientError::Connection(format!(
                    "failed to connect to {peer}: {e}"
                )))
            }
            Ok(Ok(stream)) => stream,
        };
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let (status_tx, status_rx) = watch::channel(DeviceStatus::connecting());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(run_reader(
            read_half,
            self.pending.clone(),
            closed.clone(),
            status_tx,
            shutdown_rx,
        ));

        self.status = status_rx;
        self.session = Some(Session {
            writer: tokio::sync::Mutex::new(write_half),
            reader,
            closed,
            shutdown: shutdown_tx,
            peer: peer.clone(),
        });

        match self.handshake(deadline).await {
            Ok(()) => {
                info!("Session established with {peer}");
                Ok(())
            }
            Err(e) => {
                self.teardown(Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, deadline: Instant) -> ClientResult<()> {
        let result = self.handshake_step("getChallenge", None, deadline).await?;
        let challenge = result
            .as_str()
            .or_else(|| result.get("challenge").and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| {
                warn!("Handshake challenge missing from {result}");
                ClientError::Connection("handshake failed".to_string())
            })?;

        let params = json!({
            "challenge": challenge,
            "client": self.config.client_name,
        });
        self.handshake_step("verify", Some(params), deadline).await?;
        Ok(())
    }

    async fn handshake_step(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Instant,
    ) -> ClientResult<Value> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ClientError::Connection("connection timeout".to_string()));
        }

        match self.send_with_timeout(method, params, remaining).await {
            Ok(response) if response.is_success() => Ok(response.result),
            Ok(response) => {
                warn!("Handshake {method} rejected: {}", response.error_message());
                Err(ClientError::Connection("handshake failed".to_string()))
            }
            Err(ClientError::Timeout { .. }) => {
                Err(ClientError::Connection("connection timeout".to_string()))
            }
            Err(ClientError::Command { message, .. }) => {
                warn!("Handshake {method} returned a bad frame: {message}");
                Err(ClientError::Connection("handshake failed".to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Close the session. Calling this while disconnected is a no-op.
    pub async fn disconnect(&mut self) {
        self.teardown(None).await;
    }

    async fn teardown(&mut self, reason: Option<String>) {
        let Some(session) = self.session.take() else {
            return;
        };
        let Session {
            writer,
            reader,
            shutdown,
            peer,
            ..
        } = session;

        let _ = shutdown.send(reason);
        let mut writer = writer.into_inner();
        let _ = writer.shutdown().await;
        if let Err(e) = reader.await {
            warn!("Reader task for {peer} ended abnormally: {e}");
        }
        info!("Disconnected from {peer}");
    }

    fn live_session(&self) -> ClientResult<&Session> {
        match &self.session {
            Some(session) if !session.reader.is_finished() => Ok(session),
            _ => Err(ClientError::Connection("not connected".to_string())),
        }
    }

    /// True once the handshake has completed and the transport is still up.
    pub fn is_connected(&self) -> bool {
        self.live_session().is_ok() && self.status.borrow().connected
    }

    /// Current status snapshot. Never blocks and never performs I/O.
    pub fn status(&self) -> DeviceStatus {
        self.status.borrow().clone()
    }

    /// Receiver that is notified on every status change of the current session.
    pub fn subscribe(&self) -> watch::Receiver<DeviceStatus> {
        self.status.clone()
    }

    /// Send a command and wait for its response with the default budget.
    ///
    /// The returned [`Response`] may carry a non-zero code; the typed verbs
    /// turn that into [`ClientError::Command`].
    pub async fn send(&self, method: &str, params: Option<Value>) -> ClientResult<Response> {
        self.send_with_timeout(method, params, self.config.command_timeout)
            .await
    }

    /// Send a command with an explicit response budget.
    ///
    /// Only the calling task waits; other commands may be in flight at the
    /// same time and are matched purely by correlation id.
    pub async fn send_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> ClientResult<Response> {
        let session = self.live_session()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = Request::new(method, id, params)
            .encode()
            .map_err(|e| ClientError::Command {
                method: method.to_string(),
                code: INVALID_PARAMS_CODE,
                message: format!("cannot encode request: {e}"),
            })?;

        let (slot, completion) = oneshot::channel();
        lock(&self.pending).insert(
            id,
            PendingCommand {
                method: method.to_string(),
                submitted_at: Instant::now(),
                slot,
            },
        );
        // The reader may have drained the map between live_session and here
        if session.closed.load(Ordering::SeqCst) {
            lock(&self.pending).remove(&id);
            return Err(ClientError::Connection("not connected".to_string()));
        }

        debug!("send {method} id={id}");
        trace!("frame out: {}", line.trim_end());
        let written = {
            let mut writer = session.writer.lock().await;
            match writer.write_all(line.as_bytes()).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            lock(&self.pending).remove(&id);
            return Err(ClientError::Connection(format!("write failed: {e}")));
        }

        match tokio::time::timeout(timeout, completion).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::Connection("connection closed".to_string())),
            Err(_) => {
                lock(&self.pending).remove(&id);
                warn!("{method} id={id} timed out after {timeout:?}");
                Err(ClientError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Send and require a zero result code.
    pub(crate) async fn call(&self, method: &str, params: Option<Value>) -> ClientResult<Value> {
        let response = self.send(method, params).await?;
        if response.is_success() {
            Ok(response.result)
        } else {
            Err(ClientError::Command {
                method: method.to_string(),
                code: response.code,
                message: response.error_message(),
            })
        }
    }
}

/// Demultiplex inbound frames until EOF, a read error, or shutdown.
async fn run_reader(
    read_half: OwnedReadHalf,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    status: watch::Sender<DeviceStatus>,
    mut shutdown: oneshot::Receiver<Option<String>>,
) {
    let mut reader = BufReader::new(read_half);
    // Partial bytes survive a cancelled read_until, so the buffer is only
    // cleared once a full frame has been handled.
    let mut buf = Vec::new();

    let reason = loop {
        tokio::select! {
            requested = &mut shutdown => break requested.ok().flatten(),
            read = reader.read_until(b'\n', &mut buf) => match read {
                Ok(0) => break Some("connection closed by device".to_string()),
                Ok(_) => {
                    handle_frame(&buf, &pending, &status);
                    buf.clear();
                }
                Err(e) => break Some(format!("read error: {e}")),
            },
        }
    };

    let message = reason.clone().unwrap_or_else(|| "disconnected".to_string());
    status.send_modify(|s| {
        s.connected = false;
        s.exposing = false;
        s.state = ConnectionState::Disconnected;
        if reason.is_some() {
            s.last_error = reason;
        }
    });

    closed.store(true, Ordering::SeqCst);
    let orphaned: Vec<PendingCommand> = lock(&pending).drain().map(|(_, cmd)| cmd).collect();
    for cmd in orphaned {
        debug!("Failing pending {} ({message})", cmd.method);
        let _ = cmd.slot.send(Err(ClientError::Connection(message.clone())));
    }
}

fn handle_frame(bytes: &[u8], pending: &PendingMap, status: &watch::Sender<DeviceStatus>) {
    let frame = match std::str::from_utf8(bytes) {
        Ok(text) => {
            let line = text.trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() {
                return;
            }
            trace!("frame in: {line}");
            decode_line(line)
        }
        Err(e) => InboundFrame::Malformed {
            id: None,
            reason: format!("frame is not valid UTF-8: {e}"),
        },
    };

    match frame {
        InboundFrame::Response(response) => {
            let Some(cmd) = lock(pending).remove(&response.id) else {
                debug!("Dropping response for unknown or expired id {}", response.id);
                return;
            };
            debug!(
                "recv {} id={} code={} after {:?}",
                cmd.method,
                response.id,
                response.code,
                cmd.submitted_at.elapsed()
            );
            status.send_modify(|s| s.apply_ack(&cmd.method, &response));
            let _ = cmd.slot.send(Ok(response));
        }
        InboundFrame::Telemetry(frame) => {
            status.send_modify(|s| s.apply_telemetry(&frame));
        }
        InboundFrame::Malformed { id: Some(id), reason } => {
            if let Some(cmd) = lock(pending).remove(&id) {
                warn!("Malformed response to {} id={id}: {reason}", cmd.method);
                let _ = cmd.slot.send(Err(ClientError::Command {
                    method: cmd.method,
                    code: MALFORMED_FRAME_CODE,
                    message: reason,
                }));
            }
        }
        InboundFrame::Malformed { id: None, reason } => {
            warn!("Dropping malformed frame: {reason}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal scripted device: answers the handshake, then hands the
    /// connection to `script`.
    async fn spawn_device<F, Fut>(script: F) -> u16
    where
        F: FnOnce(BufReader<tokio::net::tcp::OwnedReadHalf>, tokio::net::tcp::OwnedWriteHalf) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            for result in [r#""abc123""#, r#""ok""#] {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                let req: Value = serde_json::from_str(&line).unwrap();
                let reply = format!("{{\"id\":{},\"code\":0,\"result\":{}}}\n", req["id"], result);
                write.write_all(reply.as_bytes()).await.unwrap();
            }
            script(reader, write).await;
        });
        port
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails_fast() {
        let client = ProtocolClient::default();
        let err = client.send("getSystemInfo", None).await.unwrap_err();
        assert_eq!(err, ClientError::Connection("not connected".to_string()));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut client = ProtocolClient::default();
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = ProtocolClient::default();
        let err = client
            .connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Connection(_)));
    }

    #[tokio::test]
    async fn test_handshake_silence_is_connection_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut client = ProtocolClient::default();
        let err = client
            .connect("127.0.0.1", port, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::Connection("connection timeout".to_string()));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_rejected_verify_is_handshake_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            for reply in [r#"{"code":0,"result":"abc"}"#, r#"{"code":401,"error":"denied"}"#] {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                let req: Value = serde_json::from_str(&line).unwrap();
                let mut reply: Value = serde_json::from_str(reply).unwrap();
                reply["id"] = req["id"].clone();
                write
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .unwrap();
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let mut client = ProtocolClient::default();
        let err = client
            .connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::Connection("handshake failed".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_commands_matched_by_id() {
        // Answers two requests in reverse order
        let port = spawn_device(|mut reader, mut write| async move {
            let mut first = String::new();
            let mut second = String::new();
            reader.read_line(&mut first).await.unwrap();
            reader.read_line(&mut second).await.unwrap();
            for line in [second, first] {
                let req: Value = serde_json::from_str(&line).unwrap();
                let reply = serde_json::json!({"id": req["id"], "code": 0, "result": req["method"]});
                write
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .unwrap();
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await;

        let mut client = ProtocolClient::default();
        client
            .connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(client.is_connected());

        let (a, b) = tokio::join!(client.send("alpha", None), client.send("beta", None));
        assert_eq!(a.unwrap().result, "alpha");
        assert_eq!(b.unwrap().result, "beta");
    }

    #[tokio::test]
    async fn test_telemetry_updates_status_and_timeout_is_recoverable() {
        let port = spawn_device(|mut reader, mut write| async move {
            write
                .write_all(b"{\"Event\":\"PiStatus\",\"state\":\"tracking\",\"temp\":12.5}\n")
                .await
                .unwrap();
            // Swallow the first command, answer the second
            let mut ignored = String::new();
            reader.read_line(&mut ignored).await.unwrap();
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            let reply = serde_json::json!({"id": req["id"], "code": 0, "result": null});
            write
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await;

        let mut client = ProtocolClient::default();
        client
            .connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();

        let mut updates = client.subscribe();
        updates
            .wait_for(|s| s.state == ConnectionState::Tracking)
            .await
            .unwrap();
        assert_eq!(client.status().temperature, Some(12.5));

        let err = client
            .send_with_timeout("getStackedImage", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout { .. }));

        let response = client.send("getStackedImage", None).await.unwrap();
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_device_hangup_fails_pending_and_marks_disconnected() {
        let port = spawn_device(|mut reader, write| async move {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            drop(write);
            drop(reader);
        })
        .await;

        let mut client = ProtocolClient::default();
        client
            .connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();

        let err = client.send("park", None).await.unwrap_err();
        assert!(matches!(err, ClientError::Connection(_)));

        let mut updates = client.subscribe();
        updates.wait_for(|s| !s.connected).await.unwrap();
        assert_eq!(client.status().state, ConnectionState::Disconnected);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_non_utf8_frame_is_dropped_and_session_survives() {
        let port = spawn_device(|mut reader, mut write| async move {
            write.write_all(b"\xff\xfe garbage\n").await.unwrap();
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            let reply = serde_json::json!({"id": req["id"], "code": 0, "result": "still here"});
            write
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await;

        let mut client = ProtocolClient::default();
        client
            .connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();

        let response = client.send("getSystemInfo", None).await.unwrap();
        assert_eq!(response.result, "still here");
        assert!(client.is_connected());
        assert_eq!(client.status().last_error, None);
    }

    #[tokio::test]
    async fn test_malformed_response_with_id_is_command_error() {
        let port = spawn_device(|mut reader, mut write| async move {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            // No result code
            let reply = serde_json::json!({"id": req["id"], "result": 1});
            write
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await;

        let mut client = ProtocolClient::default();
        client
            .connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();

        let err = client.send("getSystemInfo", None).await.unwrap_err();
        match err {
            ClientError::Command { method, code, .. } => {
                assert_eq!(method, "getSystemInfo");
                assert_eq!(code, MALFORMED_FRAME_CODE);
            }
            other => panic!("expected a command error, got {other:?}"),
        }
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_send_after_reader_drain_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, _accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (_read, write) = stream.unwrap().into_split();
        let (shutdown, _shutdown_rx) = oneshot::channel();

        // Reader has already failed the pending commands but not yet exited
        let mut client = ProtocolClient::default();
        client.session = Some(Session {
            writer: tokio::sync::Mutex::new(write),
            reader: tokio::spawn(std::future::pending()),
            closed: Arc::new(AtomicBool::new(true)),
            shutdown,
            peer: addr.to_string(),
        });

        let err = client
            .send_with_timeout("park", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::Connection("not connected".to_string()));
        assert!(lock(&client.pending).is_empty());
    }
}
