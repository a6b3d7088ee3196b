//! Full stack without hardware: orchestrator -> adapter -> client -> playback.

use std::path::PathBuf;

use chrono::Utc;
use hardware::recording::PlaybackServer;
use hardware::seestar::{ConnectionState, Coordinates};
use hardware::telescope::AdapterRegistry;
use sequencer::{ExecutionOrchestrator, ExecutionState, Phase, ScheduledTarget, Target};
use shared::{ConfigStorage, ExecutionConfig, ObservatoryConfig, ObservatoryContext};
use tokio_test::assert_ok;

fn imaging_fixture() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("hardware")
        .join("tests")
        .join("fixtures")
        .join("imaging_session.json")
}

fn m42_plan() -> Vec<ScheduledTarget> {
    let start_time = Utc::now();
    vec![ScheduledTarget {
        target: Target {
            name: "M42".to_string(),
            coordinates: Coordinates::new(5.5883, -5.391),
            filter: None,
        },
        start_time,
        end_time: start_time + chrono::Duration::minutes(20),
        recommended_exposure_seconds: 10.0,
        recommended_frame_count: 2,
        score: 1.0,
    }]
}

/// Connect an orchestrator to a playback server through the adapter registry.
async fn replay_orchestrator(
    server: &mut PlaybackServer,
    execution: ExecutionConfig,
) -> (ExecutionOrchestrator, tempfile::TempDir) {
    let addr = server.serve().await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut config = ObservatoryConfig::default();
    config.device.host = "127.0.0.1".to_string();
    config.device.port = addr.port();
    config.device.connect_timeout_secs = 2.0;
    config.device.command_timeout_secs = 2.0;
    config.execution = execution;
    let context = ObservatoryContext::new(config, ConfigStorage::with_path(dir.path().into()));

    let device = &context.config.device;
    let mut adapter = AdapterRegistry::with_defaults().create(device).unwrap();
    assert!(adapter.connect(&device.host, device.port).await);

    (ExecutionOrchestrator::from_context(adapter, &context), dir)
}

#[tokio::test]
async fn test_plan_runs_against_recorded_session() {
    let mut server = PlaybackServer::from_recording(imaging_fixture()).unwrap();
    let execution = ExecutionConfig {
        phase_retries: 0,
        retry_delay_secs: 0.0,
        wait_for_exposure: false,
        ..Default::default()
    };
    let (orchestrator, _dir) = replay_orchestrator(&mut server, execution).await;

    let result = assert_ok!(orchestrator.execute("replay", &m42_plan()).await);

    assert_eq!(result.state, ExecutionState::Completed);
    assert_eq!(result.progress.targets_completed, 1);
    assert_eq!(result.targets[0].phases_completed, Phase::TARGET_PHASES.to_vec());
    assert!(result.errors.is_empty());

    // The recording's first park was refused; the second one succeeds
    assert!(!result.parked);
    assert!(orchestrator.park_telescope().await);
    assert_eq!(
        orchestrator.adapter().lock().await.get_status().state,
        ConnectionState::Parked
    );

    orchestrator.adapter().lock().await.disconnect().await;
    server.stop();
}

#[tokio::test]
async fn test_exposure_wait_ends_on_replayed_telemetry() {
    let mut server = PlaybackServer::from_recording(imaging_fixture()).unwrap();
    let execution = ExecutionConfig {
        phase_retries: 0,
        retry_delay_secs: 0.0,
        phase_timeout_secs: 5.0,
        wait_for_exposure: true,
        exposure_poll_secs: 0.05,
        ..Default::default()
    };
    let (orchestrator, _dir) = replay_orchestrator(&mut server, execution).await;

    let result = assert_ok!(orchestrator.execute("replay-wait", &m42_plan()).await);

    assert_eq!(result.state, ExecutionState::Completed);
    assert_eq!(result.progress.targets_completed, 1);
    assert!(result.errors.is_empty());
    // An overrun would only give up after 20s of exposure plus the phase timeout
    assert!(result.duration_seconds() < 10.0);
    assert!(!orchestrator.adapter().lock().await.get_status().exposing);

    orchestrator.adapter().lock().await.disconnect().await;
    server.stop();
}
