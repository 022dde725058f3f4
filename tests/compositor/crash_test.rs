//! Worker crashes must fail every waiting caller promptly.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{echo, eventually, FakeWorker};
use compositor_bridge::compositor::SupervisorState;
use compositor_bridge::ErrorKind;

#[tokio::test]
async fn test_crash_fails_all_outstanding_commands() {
    let worker = FakeWorker::new();
    let compositor = Arc::new(worker.start().await);

    let waiting: Vec<_> = (0..3)
        .map(|_| {
            let compositor = compositor.clone();
            tokio::spawn(async move { compositor.execute_command(echo("hold")).await })
        })
        .collect();
    assert!(eventually(|| compositor.pending_count() == 3).await);

    let err = compositor.execute_command(echo("crash")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WorkerCrashed);

    // Well within any timeout: the crash itself resolves them.
    for task in waiting {
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("crash must resolve pending calls")
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), ErrorKind::WorkerCrashed);
    }
    assert_eq!(compositor.pending_count(), 0);
    assert_eq!(compositor.state(), SupervisorState::Crashed);
}

#[tokio::test]
async fn test_crash_message_carries_exit_code_and_stderr() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;

    let err = compositor.execute_command(echo("crash")).await.unwrap_err();
    assert!(err.message().contains("code 7"), "{}", err.message());
    assert!(err.message().contains("boom: worker panicked"), "{}", err.message());
}

#[tokio::test]
async fn test_commands_fail_until_restart() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;

    let _ = compositor.execute_command(echo("crash")).await;
    assert!(eventually(|| compositor.state() == SupervisorState::Crashed).await);

    let err = compositor.echo("anyone there").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WorkerCrashed);

    compositor.restart().await.unwrap();
    assert_eq!(compositor.state(), SupervisorState::Running);
    assert_eq!(compositor.echo("back").await.unwrap(), Bytes::from_static(b"back"));
}

#[tokio::test]
async fn test_restart_fails_calls_to_previous_worker() {
    let worker = FakeWorker::new();
    let compositor = Arc::new(worker.start().await);

    let parked = {
        let compositor = compositor.clone();
        tokio::spawn(async move { compositor.execute_command(echo("hold")).await })
    };
    assert!(eventually(|| compositor.pending_count() == 1).await);

    compositor.restart().await.unwrap();
    let result = parked.await.unwrap();
    assert_eq!(result.unwrap_err().kind(), ErrorKind::WorkerCrashed);
    assert_eq!(compositor.echo("fresh").await.unwrap(), Bytes::from_static(b"fresh"));
}

#[tokio::test]
async fn test_state_changes_are_observable() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;
    let mut states = compositor.subscribe();
    assert_eq!(*states.borrow_and_update(), SupervisorState::Running);

    let _ = compositor.execute_command(echo("crash")).await;
    tokio::time::timeout(
        Duration::from_secs(2),
        states.wait_for(|s| *s == SupervisorState::Crashed),
    )
    .await
    .unwrap()
    .unwrap();
}
