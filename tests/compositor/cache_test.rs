//! Frame cache integration: hits never reach the worker.

#![cfg(unix)]

mod common;

use bytes::Bytes;
use common::{echo, eventually, FakeWorker};
use compositor_bridge::compositor::protocol::ExtractFrameParams;
use compositor_bridge::compositor::SupervisorState;
use compositor_bridge::{CompositorSettings, ErrorKind};

fn frame_at(time: f64) -> ExtractFrameParams {
    ExtractFrameParams {
        src: "/tmp/video.mp4".to_string(),
        original_src: "https://example.com/video.mp4".to_string(),
        time,
        transparent: false,
        tone_mapped: false,
    }
}

#[tokio::test]
async fn test_repeated_metadata_request_is_served_from_cache() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;

    let first = compositor
        .get_video_metadata("/resources/framer-24fps.mp4")
        .await
        .unwrap();
    let second = compositor
        .get_video_metadata("/resources/framer-24fps.mp4")
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(worker.count("GetVideoMetadata"), 1);
    assert_eq!(compositor.cache().stats().hits, 1);
}

#[tokio::test]
async fn test_frames_are_evicted_by_budget() {
    let worker = FakeWorker::new();
    // "FRAME@1.0" is 9 bytes: two frames do not fit.
    let settings = CompositorSettings {
        maximum_frame_cache_items_in_bytes: Some(16),
        ..worker.settings()
    };
    let compositor = worker.start_with(settings).await;

    let one = compositor.extract_frame(frame_at(1.0)).await.unwrap();
    assert_eq!(one, Bytes::from_static(b"FRAME@1.0"));
    compositor.extract_frame(frame_at(1.0)).await.unwrap();
    assert_eq!(worker.count("ExtractFrame"), 1);

    compositor.extract_frame(frame_at(2.0)).await.unwrap();
    assert!(compositor.cache().total_bytes() <= 16);

    // 1.0 was evicted, so it goes back to the worker.
    compositor.extract_frame(frame_at(1.0)).await.unwrap();
    assert_eq!(worker.count("ExtractFrame"), 3);
}

#[tokio::test]
async fn test_distinct_flags_do_not_share_entries() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;

    compositor.extract_frame(frame_at(0.5)).await.unwrap();
    compositor
        .extract_frame(ExtractFrameParams {
            transparent: true,
            ..frame_at(0.5)
        })
        .await
        .unwrap();
    assert_eq!(worker.count("ExtractFrame"), 2);
    assert_eq!(compositor.cache().len(), 2);
}

#[tokio::test]
async fn test_free_up_memory_shrinks_local_cache() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;

    compositor.extract_frame(frame_at(1.0)).await.unwrap();
    compositor.extract_frame(frame_at(2.0)).await.unwrap();
    assert_eq!(compositor.cache().len(), 2);

    compositor.free_up_memory(0).await.unwrap();
    assert!(compositor.cache().is_empty());
    assert_eq!(worker.count("FreeUpMemory"), 1);
}

#[tokio::test]
async fn test_cached_results_are_refused_after_shutdown() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;

    compositor
        .get_video_metadata("/resources/framer-24fps.mp4")
        .await
        .unwrap();
    compositor.shutdown().await.unwrap();

    let err = compositor
        .get_video_metadata("/resources/framer-24fps.mp4")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WorkerCrashed);
}

#[tokio::test]
async fn test_cached_results_are_refused_after_crash() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;

    compositor.extract_frame(frame_at(1.0)).await.unwrap();
    let _ = compositor.execute_command(echo("crash")).await;
    assert!(eventually(|| compositor.state() == SupervisorState::Crashed).await);

    let err = compositor.extract_frame(frame_at(1.0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WorkerCrashed);

    compositor.restart().await.unwrap();
    assert_eq!(
        compositor.extract_frame(frame_at(1.0)).await.unwrap(),
        Bytes::from_static(b"FRAME@1.0")
    );
    assert_eq!(worker.count("ExtractFrame"), 1);
}

#[tokio::test]
async fn test_raw_known_command_uses_cache() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;
    let params = serde_json::json!({"src": "/resources/framer-24fps.mp4"});

    let first = compositor
        .execute_raw("GetVideoMetadata", params.clone())
        .await
        .unwrap();
    let second = compositor
        .execute_raw("GetVideoMetadata", params)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(worker.count("GetVideoMetadata"), 1);
}

#[tokio::test]
async fn test_raw_close_all_videos_clears_cache() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;

    compositor.extract_frame(frame_at(1.0)).await.unwrap();
    compositor
        .execute_raw("CloseAllVideos", serde_json::Value::Null)
        .await
        .unwrap();
    assert!(compositor.cache().is_empty());
}

#[tokio::test]
async fn test_raw_known_command_with_bad_params_fails_locally() {
    let worker = FakeWorker::new();
    let compositor = worker.start().await;

    let err = compositor
        .execute_raw("GetVideoMetadata", serde_json::json!({"path": "a.mp4"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unknown);
    assert!(err.message().starts_with("invalid parameters for GetVideoMetadata"));
    assert_eq!(worker.count("GetVideoMetadata"), 0);
}
