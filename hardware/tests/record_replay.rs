//! Records a session through the proxy, then replays the capture.

use std::path::PathBuf;
use std::time::Duration;

use hardware::recording::{Direction, PlaybackServer, SessionRecorder, SessionRecording};
use hardware::seestar::protocol::frame_method;
use hardware::seestar::ProtocolClient;
use tokio_test::assert_ok;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

#[tokio::test]
async fn test_recorded_session_round_trips() {
    // Playback stands in for the real device
    let mut device = PlaybackServer::from_recording(fixture("handshake_session.json")).unwrap();
    let device_addr = device.serve().await.unwrap();

    let mut recorder = SessionRecorder::new("bench S50", "proxy round trip");
    let proxy_addr = recorder
        .intercept("127.0.0.1", device_addr.port())
        .await
        .unwrap();

    let mut client = ProtocolClient::default();
    assert_ok!(
        client
            .connect("127.0.0.1", proxy_addr.port(), Duration::from_secs(2))
            .await
    );
    let info = client.get_system_info().await.unwrap();
    assert_eq!(info.serial.as_deref(), Some("S50-0042"));
    client.disconnect().await;

    let captured = recorder.interactions();
    assert_eq!(captured.len(), 6);
    assert_eq!(captured[0].direction, Direction::Sent);
    assert_eq!(frame_method(&captured[0].payload), Some("getChallenge"));
    assert_eq!(captured[1].direction, Direction::Received);
    assert!(captured
        .windows(2)
        .all(|pair| pair[0].offset_seconds <= pair[1].offset_seconds));

    recorder.stop();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recordings").join("round_trip.json");
    recorder.save(&path).unwrap();

    let loaded = SessionRecording::load_from_file(&path).unwrap();
    assert_eq!(loaded.interactions.len(), 6);
    assert_eq!(loaded.metadata.device_label, "bench S50");
    assert_eq!(loaded.metadata.description, "proxy round trip");
    assert_eq!(loaded.metadata.host, "127.0.0.1");
    assert_eq!(loaded.metadata.port, device_addr.port());
    assert!(loaded.metadata.duration_seconds >= 0.0);

    // The capture is itself replayable
    device.stop();
    let mut replay = PlaybackServer::new(loaded);
    let replay_addr = replay.serve().await.unwrap();

    let mut client = ProtocolClient::default();
    assert_ok!(
        client
            .connect("127.0.0.1", replay_addr.port(), Duration::from_secs(2))
            .await
    );
    assert_eq!(
        client.get_system_info().await.unwrap().firmware_version.as_deref(),
        Some("2.4.1")
    );
    client.disconnect().await;
}

#[tokio::test]
async fn test_unreachable_device_records_nothing() {
    let mut recorder = SessionRecorder::new("nowhere", "");
    let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = closed.local_addr().unwrap().port();
    drop(closed);

    let proxy_addr = recorder.intercept("127.0.0.1", dead_port).await.unwrap();

    let mut client = ProtocolClient::default();
    let result = client
        .connect("127.0.0.1", proxy_addr.port(), Duration::from_millis(500))
        .await;
    assert!(result.is_err());
    assert!(recorder.interactions().is_empty());
    recorder.stop();
}
