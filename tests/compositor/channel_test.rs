//! Correlation, ordering, timeout and cancellation over a live worker pipe.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{echo, eventually, FakeWorker};
use compositor_bridge::compositor::SupervisorState;
use compositor_bridge::ErrorKind;

#[tokio::test]
async fn test_echo_round_trip() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;
    assert_eq!(compositor.state(), SupervisorState::Running);

    let reply = compositor.echo("ping").await.unwrap();
    assert_eq!(reply, Bytes::from_static(b"ping"));
    assert_eq!(compositor.pending_count(), 0);

    compositor.shutdown().await.unwrap();
    assert_eq!(compositor.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let worker = FakeWorker::new();
    let compositor = Arc::new(worker.start().await);

    let held = {
        let compositor = compositor.clone();
        tokio::spawn(async move { compositor.execute_command(echo("hold")).await })
    };
    assert!(eventually(|| compositor.pending_count() == 1).await);

    // The worker answers "release" first, then the parked "hold".
    let released = compositor.execute_command(echo("release")).await.unwrap();
    assert_eq!(released, Bytes::from_static(b"released"));

    let held = held.await.unwrap().unwrap();
    assert_eq!(held, Bytes::from_static(b"held"));
    assert_eq!(compositor.pending_count(), 0);
}

#[tokio::test]
async fn test_concurrent_callers_get_their_own_results() {
    let worker = FakeWorker::new();
    let compositor = Arc::new(worker.start().await);

    let calls = (0..16).map(|i| {
        let compositor = compositor.clone();
        async move {
            let message = format!("message-{i}");
            let reply = compositor.echo(message.clone()).await.unwrap();
            (message, reply)
        }
    });

    for (sent, reply) in futures::future::join_all(calls).await {
        assert_eq!(reply, Bytes::from(sent));
    }
    assert_eq!(worker.count("Echo"), 16);
}

#[tokio::test]
async fn test_timeout_resolves_locally() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;

    let err = compositor
        .execute_command_with_timeout(echo("hold"), Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(compositor.pending_count(), 0);

    // The worker is still healthy.
    assert_eq!(compositor.echo("after").await.unwrap(), Bytes::from_static(b"after"));
}

#[tokio::test]
async fn test_late_response_after_timeout_is_discarded() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;

    let err = compositor
        .execute_command_with_timeout(echo("slow"), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    // The "slow" answer arrives with no one waiting for it; the next call is unaffected.
    let reply = compositor.echo("next").await.unwrap();
    assert_eq!(reply, Bytes::from_static(b"next"));
    assert_eq!(compositor.state(), SupervisorState::Running);
}

#[tokio::test]
async fn test_abandoned_call_is_cleaned_up() {
    let worker = FakeWorker::new();
    let compositor = Arc::new(worker.start().await);

    let task = {
        let compositor = compositor.clone();
        tokio::spawn(async move { compositor.execute_command(echo("hold")).await })
    };
    assert!(eventually(|| compositor.pending_count() == 1).await);

    task.abort();
    assert!(eventually(|| compositor.pending_count() == 0).await);

    // Releasing the parked request resolves a slot nobody observes.
    let released = compositor.execute_command(echo("release")).await.unwrap();
    assert_eq!(released, Bytes::from_static(b"released"));
}

#[tokio::test]
async fn test_malformed_frame_fails_only_its_caller() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;

    let err = compositor.execute_command(echo("garbage")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);

    assert_eq!(compositor.echo("fine").await.unwrap(), Bytes::from_static(b"fine"));
}

#[tokio::test]
async fn test_unmatched_and_chatter_output_is_contained() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;

    assert_eq!(
        compositor.execute_command(echo("stray")).await.unwrap(),
        Bytes::from_static(b"stray")
    );
    assert_eq!(
        compositor.execute_command(echo("chatter")).await.unwrap(),
        Bytes::from_static(b"chatter")
    );
    assert_eq!(compositor.state(), SupervisorState::Running);
}

#[tokio::test]
async fn test_unknown_raw_command_keeps_diagnostic() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;

    let err = compositor
        .execute_raw("Transmogrify", serde_json::json!({"level": 3}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unknown);
    assert_eq!(err.message(), "Unknown command: Transmogrify");
}

#[tokio::test]
async fn test_typed_helpers() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;

    let stats = compositor.get_open_video_stats().await.unwrap();
    assert_eq!(stats.open_streams, 2);

    let silences = compositor
        .get_silences(compositor_bridge::compositor::protocol::GetSilencesParams {
            src: "a.wav".to_string(),
            noise_threshold_in_decibels: -30.0,
            minimum_duration_in_seconds: 1.0,
        })
        .await
        .unwrap();
    assert_eq!(silences.silent_parts.len(), 1);
    assert_eq!(silences.silent_parts[0].end_in_seconds, 1.5);

    compositor.extract_audio("in.mp4", "out.wav").await.unwrap();
    compositor.close_all_videos().await.unwrap();
}

#[tokio::test]
async fn test_commands_after_shutdown_fail() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;
    compositor.shutdown().await.unwrap();

    let err = compositor.echo("late").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WorkerCrashed);
}

/// A worker that never reads its input and ignores the shutdown line.
fn unresponsive_settings() -> compositor_bridge::CompositorSettings {
    compositor_bridge::CompositorSettings {
        binary_path: Some("/bin/sh".to_string()),
        extra_args: vec!["-c".to_string(), "exec sleep 30".to_string()],
        shutdown_timeout_ms: 200,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_timeout_holds_when_worker_stops_reading() {
    let compositor = compositor_bridge::start_compositor(&unresponsive_settings())
        .await
        .unwrap();
    let large = "x".repeat(1024 * 1024);

    let outcome = tokio::time::timeout(
        Duration::from_secs(3),
        compositor.execute_command_with_timeout(echo(&large), Some(Duration::from_millis(200))),
    )
    .await
    .expect("command timeout must fire even while input is blocked");
    assert_eq!(outcome.unwrap_err().kind(), ErrorKind::Timeout);
    assert_eq!(compositor.pending_count(), 0);
}

#[tokio::test]
async fn test_shutdown_is_bounded_with_blocked_input() {
    let compositor = Arc::new(
        compositor_bridge::start_compositor(&unresponsive_settings())
            .await
            .unwrap(),
    );
    let large = "x".repeat(1024 * 1024);

    let blocked = {
        let compositor = compositor.clone();
        tokio::spawn(async move { compositor.execute_command(echo(&large)).await })
    };
    assert!(eventually(|| compositor.pending_count() == 1).await);

    tokio::time::timeout(Duration::from_secs(3), compositor.shutdown())
        .await
        .expect("shutdown must kill a worker that ignores EOF")
        .unwrap();
    assert_eq!(compositor.state(), SupervisorState::Stopped);

    let result = tokio::time::timeout(Duration::from_secs(3), blocked)
        .await
        .expect("waiting caller must be released by shutdown")
        .unwrap();
    assert_eq!(result.unwrap_err().kind(), ErrorKind::WorkerCrashed);
}
