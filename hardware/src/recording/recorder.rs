//! Recording proxy: relays a client to a real device and writes down every frame.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    decode_frame, Direction, RecordedInteraction, RecordingError, RecordingMetadata,
    SessionRecording,
};

/// Frames captured so far, in observed order.
struct Capture {
    started: Instant,
    stopped_after: Option<Duration>,
    interactions: Vec<RecordedInteraction>,
}

type SharedCapture = Arc<Mutex<Capture>>;

fn lock(capture: &SharedCapture) -> MutexGuard<'_, Capture> {
    capture.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Transparent intercepting proxy that records a protocol session.
///
/// Only one client connection is relayed at a time; further clients queue in
/// the listen backlog until the current one disconnects.
///
/// # Example
///
/// ```no_run
/// use hardware::recording::SessionRecorder;
/// use std::path::Path;
///
/// # async fn run() -> Result<(), hardware::recording::RecordingError> {
/// let mut recorder = SessionRecorder::new("S50 backyard", "evening session");
/// let local = recorder.intercept("192.168.1.100", 4700).await?;
/// println!("Point the client at {local}");
/// // ... drive the client ...
/// recorder.stop();
/// recorder.save(Path::new("session.json"))?;
/// # Ok(())
/// # }
/// ```
pub struct SessionRecorder {
    device_label: String,
    description: String,
    target: Option<(String, u16)>,
    capture: SharedCapture,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl SessionRecorder {
    pub fn new(device_label: &str, description: &str) -> Self {
        Self {
            device_label: device_label.to_string(),
            description: description.to_string(),
            target: None,
            capture: Arc::new(Mutex::new(Capture {
                started: Instant::now(),
                stopped_after: None,
                interactions: Vec::new(),
            })),
            task: None,
            local_addr: None,
        }
    }

    /// Start relaying to the real device.
    ///
    /// Binds an ephemeral port on the loopback interface and returns its
    /// address for the client to dial instead of the hardware. Starting a new
    /// intercept clears anything captured before.
    pub async fn intercept(
        &mut self,
        real_host: &str,
        real_port: u16,
    ) -> Result<SocketAddr, RecordingError> {
        if let (Some(addr), Some(task)) = (self.local_addr, &self.task) {
            if !task.is_finished() {
                return Err(RecordingError::AlreadyRunning(addr));
            }
        }

        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_addr = listener.local_addr()?;

        {
            let mut capture = lock(&self.capture);
            capture.started = Instant::now();
            capture.stopped_after = None;
            capture.interactions.clear();
        }

        self.task = Some(tokio::spawn(accept_loop(
            listener,
            real_host.to_string(),
            real_port,
            self.capture.clone(),
        )));
        self.target = Some((real_host.to_string(), real_port));
        self.local_addr = Some(local_addr);

        info!("Recording proxy on {local_addr} -> {real_host}:{real_port}");
        Ok(local_addr)
    }

    /// Address clients should dial, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Snapshot of the frames captured so far.
    pub fn interactions(&self) -> Vec<RecordedInteraction> {
        lock(&self.capture).interactions.clone()
    }

    /// The capture so far, with metadata.
    pub fn recording(&self) -> SessionRecording {
        let capture = lock(&self.capture);
        let duration = capture
            .stopped_after
            .unwrap_or_else(|| capture.started.elapsed());
        let (host, port) = self.target.clone().unwrap_or_default();

        SessionRecording {
            metadata: RecordingMetadata {
                device_label: self.device_label.clone(),
                host,
                port,
                description: self.description.clone(),
                duration_seconds: duration.as_secs_f64(),
            },
            interactions: capture.interactions.clone(),
        }
    }

    /// Write metadata and the ordered interaction list to `path`.
    pub fn save(&self, path: &Path) -> Result<(), RecordingError> {
        let recording = self.recording();
        recording.save_to_file(path)?;
        info!(
            "Saved {} interactions to {}",
            recording.interactions.len(),
            path.display()
        );
        Ok(())
    }

    /// Close the listener and any relayed connection. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let mut capture = lock(&self.capture);
            capture.stopped_after = Some(capture.started.elapsed());
            info!(
                "Recording stopped after {} interactions",
                capture.interactions.len()
            );
        }
        self.local_addr = None;
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, host: String, port: u16, capture: SharedCapture) {
    loop {
        let (client, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        info!("Client {peer} connected, dialing {host}:{port}");
        let device = match TcpStream::connect((host.as_str(), port)).await {
            Ok(device) => device,
            Err(e) => {
                warn!("Cannot reach device at {host}:{port}: {e}");
                continue;
            }
        };

        relay(client, device, &capture).await;
        info!("Client {peer} session ended");
    }
}

/// Relay both directions until either side closes.
async fn relay(client: TcpStream, device: TcpStream, capture: &SharedCapture) {
    let (client_read, client_write) = client.into_split();
    let (device_read, device_write) = device.into_split();

    tokio::select! {
        result = pump(client_read, device_write, Direction::Sent, capture) => {
            if let Err(e) = result {
                warn!("Client to device relay failed: {e}");
            }
        }
        result = pump(device_read, client_write, Direction::Received, capture) => {
            if let Err(e) = result {
                warn!("Device to client relay failed: {e}");
            }
        }
    }
}

/// Copy LF-delimited frames from `read` to `write`, recording each one first.
async fn pump(
    read: OwnedReadHalf,
    mut write: OwnedWriteHalf,
    direction: Direction,
    capture: &SharedCapture,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(read);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        record(capture, direction, &buf);
        write.write_all(&buf).await?;
    }
}

fn record(capture: &SharedCapture, direction: Direction, bytes: &[u8]) {
    let text = String::from_utf8_lossy(bytes);
    let line = text.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return;
    }

    let mut capture = lock(capture);
    let offset_seconds = capture.started.elapsed().as_secs_f64();
    capture.interactions.push(RecordedInteraction {
        direction,
        payload: decode_frame(line),
        offset_seconds,
    });
    debug!(
        "Recorded {direction:?} frame #{} at {offset_seconds:.3}s",
        capture.interactions.len()
    );
}
