//! Playback server: emulates the device end of a recorded session.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Direction, RecordingError, RecordingMetadata, SessionRecording};
use crate::seestar::protocol::{frame_id, frame_method, EVENT_MARKER, METHOD_NOT_FOUND_CODE};

/// One recorded response and the telemetry the device sent after it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedReply {
    pub response: Value,
    /// Uncorrelated frames received before the next indexed response
    pub telemetry: Vec<Value>,
}

/// Recorded responses grouped by method, with a replay cursor per method.
///
/// Responses for a method are handed out in recorded order. Once a method's
/// queue is exhausted its last response is repeated, so a replay that calls a
/// method more often than the recording did still gets an answer.
#[derive(Debug, Clone, Default)]
pub struct ResponseIndex {
    queues: BTreeMap<String, Vec<RecordedReply>>,
    cursors: HashMap<String, usize>,
}

impl ResponseIndex {
    /// Pair each recorded command with the received frame carrying its id.
    ///
    /// Received frames with an unmatched id fall back to their own `method`
    /// field. Telemetry is attached to the most recently indexed response;
    /// telemetry seen before any response is dropped.
    pub fn build(recording: &SessionRecording) -> Self {
        let mut queues: BTreeMap<String, Vec<RecordedReply>> = BTreeMap::new();
        let mut awaiting: HashMap<u64, String> = HashMap::new();
        let mut last: Option<(String, usize)> = None;

        for interaction in &recording.interactions {
            let payload = &interaction.payload;
            match interaction.direction {
                Direction::Sent => {
                    if let (Some(method), Some(id)) = (frame_method(payload), frame_id(payload)) {
                        awaiting.insert(id, method.to_string());
                    }
                }
                Direction::Received => {
                    let id = match frame_id(payload) {
                        Some(id) if payload.get(EVENT_MARKER).is_none() => id,
                        _ => {
                            if let Some((method, i)) = &last {
                                if let Some(reply) = queues.get_mut(method).and_then(|q| q.get_mut(*i)) {
                                    reply.telemetry.push(payload.clone());
                                }
                            }
                            continue;
                        }
                    };
                    let method = awaiting
                        .remove(&id)
                        .or_else(|| frame_method(payload).map(str::to_string));
                    if let Some(method) = method {
                        let queue = queues.entry(method.clone()).or_default();
                        queue.push(RecordedReply {
                            response: payload.clone(),
                            telemetry: Vec::new(),
                        });
                        last = Some((method, queue.len() - 1));
                    }
                }
            }
        }

        Self {
            queues,
            cursors: HashMap::new(),
        }
    }

    /// Indexed method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        self.queues.keys().map(String::as_str).collect()
    }

    pub fn response_count(&self, method: &str) -> usize {
        self.queues.get(method).map_or(0, Vec::len)
    }

    /// Next recorded response for `command`, with its id rewritten to the
    /// command's id. `None` if the method was never recorded.
    ///
    /// Deterministic: the same sequence of calls on a fresh index always
    /// yields the same sequence of responses.
    pub fn find_response(&mut self, command: &Value) -> Option<Value> {
        self.find_reply(command).map(|reply| reply.response)
    }

    /// Like [`find_response`](Self::find_response), with the telemetry that
    /// followed the response. A repeated last response carries no telemetry.
    pub fn find_reply(&mut self, command: &Value) -> Option<RecordedReply> {
        let method = frame_method(command)?;
        let queue = self.queues.get(method)?;
        let last = queue.len().checked_sub(1)?;

        let cursor = self.cursors.entry(method.to_string()).or_insert(0);
        let fresh = *cursor <= last;
        let position = (*cursor).min(last);
        if fresh {
            *cursor += 1;
        }

        let recorded = &queue[position];
        let mut response = recorded.response.clone();
        if let (Some(frame), Some(id)) = (response.as_object_mut(), command.get("id")) {
            frame.insert("id".to_string(), id.clone());
        }
        Some(RecordedReply {
            response,
            telemetry: if fresh {
                recorded.telemetry.clone()
            } else {
                Vec::new()
            },
        })
    }

    /// Rewind every method to its first recorded response.
    pub fn reset(&mut self) {
        self.cursors.clear();
    }
}

/// Serves a recording over TCP as if it were the device.
///
/// Each accepted connection replays from the start of the recording. One
/// connection is served at a time.
pub struct PlaybackServer {
    recording: SessionRecording,
    index: ResponseIndex,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl PlaybackServer {
    pub fn new(recording: SessionRecording) -> Self {
        let index = ResponseIndex::build(&recording);
        debug!(
            "Indexed {} methods from {} interactions",
            index.queues.len(),
            recording.interactions.len()
        );
        Self {
            recording,
            index,
            task: None,
            local_addr: None,
        }
    }

    /// Load a recording file and index it.
    pub fn from_recording(path: impl AsRef<Path>) -> Result<Self, RecordingError> {
        let path = path.as_ref();
        let recording = SessionRecording::load_from_file(path)?;
        info!(
            "Loaded recording {} ({} interactions)",
            path.display(),
            recording.interactions.len()
        );
        Ok(Self::new(recording))
    }

    pub fn metadata(&self) -> &RecordingMetadata {
        &self.recording.metadata
    }

    pub fn recording(&self) -> &SessionRecording {
        &self.recording
    }

    pub fn methods(&self) -> Vec<&str> {
        self.index.methods()
    }

    /// Socket-free lookup against this server's own cursor state.
    ///
    /// Connections accepted by [`serve`](Self::serve) use independent cursors.
    pub fn find_response(&mut self, command: &Value) -> Option<Value> {
        self.index.find_response(command)
    }

    /// Rewind the cursors used by [`find_response`](Self::find_response).
    pub fn reset(&mut self) {
        self.index.reset();
    }

    /// Serve on an ephemeral loopback port.
    pub async fn serve(&mut self) -> Result<SocketAddr, RecordingError> {
        self.serve_on(0).await
    }

    /// Serve on a fixed loopback port (0 picks one).
    pub async fn serve_on(&mut self, port: u16) -> Result<SocketAddr, RecordingError> {
        if let (Some(addr), Some(task)) = (self.local_addr, &self.task) {
            if !task.is_finished() {
                return Err(RecordingError::AlreadyRunning(addr));
            }
        }

        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let local_addr = listener.local_addr()?;

        let mut template = self.index.clone();
        template.reset();
        self.task = Some(tokio::spawn(accept_loop(listener, template)));
        self.local_addr = Some(local_addr);

        info!(
            "Playback of {:?} listening on {local_addr}",
            self.recording.metadata.device_label
        );
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Close the listener and any open connection. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("Playback server stopped");
        }
        self.local_addr = None;
    }
}

impl Drop for PlaybackServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, template: ResponseIndex) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!("Playback client {peer} connected");
                let mut index = template.clone();
                if let Err(e) = serve_connection(stream, &mut index).await {
                    warn!("Playback connection {peer} failed: {e}");
                }
                info!("Playback client {peer} disconnected");
            }
            Err(e) => {
                warn!("Accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, index: &mut ResponseIndex) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command: Value = match serde_json::from_str(&line) {
            Ok(command) => command,
            Err(e) => {
                warn!("Ignoring undecodable command: {e}");
                continue;
            }
        };

        let reply = index.find_reply(&command).unwrap_or_else(|| {
            let method = frame_method(&command).unwrap_or("<none>");
            debug!("No recorded response for {method}");
            RecordedReply {
                response: json!({
                    "id": command.get("id").cloned().unwrap_or(Value::Null),
                    "code": METHOD_NOT_FOUND_CODE,
                    "error": format!("no recorded response for {method}"),
                }),
                telemetry: Vec::new(),
            }
        });

        let mut out = String::new();
        for frame in std::iter::once(&reply.response).chain(&reply.telemetry) {
            out.push_str(&serde_json::to_string(frame)?);
            out.push('\n');
        }
        write.write_all(out.as_bytes()).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordedInteraction;

    fn frame(direction: Direction, payload: Value) -> RecordedInteraction {
        RecordedInteraction {
            direction,
            payload,
            offset_seconds: 0.0,
        }
    }

    fn recording() -> SessionRecording {
        SessionRecording {
            metadata: RecordingMetadata::default(),
            interactions: vec![
                frame(Direction::Sent, json!({"method": "goto", "id": 1})),
                frame(Direction::Received, json!({"Event": "PiStatus", "id": 1})),
                frame(Direction::Received, json!({"id": 1, "code": 0, "result": "first"})),
                frame(Direction::Sent, json!({"method": "goto", "id": 2})),
                frame(Direction::Received, json!({"state": "slewing"})),
                frame(Direction::Received, json!({"id": 2, "code": 0, "result": "second"})),
                // Unmatched id, but the frame names its method
                frame(
                    Direction::Received,
                    json!({"id": 99, "method": "park", "code": 0, "result": null}),
                ),
            ],
        }
    }

    #[test]
    fn test_index_pairs_by_id() {
        let index = ResponseIndex::build(&recording());
        assert_eq!(index.methods(), vec!["goto", "park"]);
        assert_eq!(index.response_count("goto"), 2);
        assert_eq!(index.response_count("park"), 1);
        assert_eq!(index.response_count("verify"), 0);
    }

    #[test]
    fn test_telemetry_follows_its_response_once() {
        let mut index = ResponseIndex::build(&recording());
        let goto = json!({"method": "goto", "id": 7});

        // The PiStatus event precedes every response and is dropped
        let first = index.find_reply(&goto).unwrap();
        assert_eq!(first.response["id"], 7);
        assert_eq!(first.telemetry, vec![json!({"state": "slewing"})]);

        assert!(index.find_reply(&goto).unwrap().telemetry.is_empty());
        index.reset();
        assert_eq!(index.find_reply(&goto).unwrap().telemetry.len(), 1);
    }

    #[test]
    fn test_fifo_then_repeat_last() {
        let mut index = ResponseIndex::build(&recording());
        let results: Vec<Value> = (0..4)
            .map(|i| {
                index
                    .find_response(&json!({"method": "goto", "id": 100 + i}))
                    .unwrap()
            })
            .collect();

        assert_eq!(results[0]["result"], "first");
        assert_eq!(results[1]["result"], "second");
        assert_eq!(results[2]["result"], "second");
        assert_eq!(results[3]["result"], "second");
        assert_eq!(results[3]["id"], 103);
    }

    #[test]
    fn test_unknown_method_has_no_response() {
        let mut index = ResponseIndex::build(&recording());
        assert!(index.find_response(&json!({"method": "verify", "id": 1})).is_none());
        assert!(index.find_response(&json!({"id": 1})).is_none());
    }

    #[test]
    fn test_reset_rewinds() {
        let mut server = PlaybackServer::new(recording());
        let command = json!({"method": "goto", "id": 5});
        let first = server.find_response(&command);
        server.find_response(&command);
        server.reset();
        assert_eq!(server.find_response(&command), first);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut server = PlaybackServer::new(recording());
        let addr = server.serve().await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        assert!(matches!(
            server.serve().await,
            Err(RecordingError::AlreadyRunning(_))
        ));

        server.stop();
        server.stop();
        assert_eq!(server.local_addr(), None);
    }
}
