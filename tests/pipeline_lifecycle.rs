//! Pipeline lifecycle, settings and data access against the mock camera.
#![cfg(feature = "mock")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use frame_acq::buffer::MAX_BUFFERS;
use frame_acq::error::AcqResult;
use frame_acq::hooks::FrameTransform;
use frame_acq::mock::{MockCamera, MockHealth};
use frame_acq::settings::Roi;
use frame_acq::sink::{CollectingSink, FrameSink, StampedFrame};
use frame_acq::{
    AcqConfig, AcqError, CameraSettings, Frame, Pipeline, SessionState, StorageMode, TickOutcome,
};

const WIDTH: u32 = 8;
const HEIGHT: u32 = 6;

fn manual_config() -> AcqConfig {
    let mut config = AcqConfig::default();
    config.scheduler.manual = true;
    config.scheduler.period = Duration::from_millis(1);
    config.scheduler.poll_wait = Duration::ZERO;
    config.scheduler.health_check_interval = Duration::from_secs(3600);
    config.camera.roi = Roi::full(WIDTH, HEIGHT);
    config
}

fn build(config: AcqConfig, camera: &Arc<MockCamera>, health: &Arc<MockHealth>) -> Pipeline {
    Pipeline::new(config, camera.clone(), camera.clone(), health.clone()).unwrap()
}

fn auto_camera() -> Arc<MockCamera> {
    Arc::new(
        MockCamera::builder()
            .sensor(WIDTH, HEIGHT)
            .auto_produce(true)
            .build(),
    )
}

/// Sink that never completes a send.
struct StuckSink;

#[async_trait]
impl FrameSink for StuckSink {
    async fn send(&self, _frame: StampedFrame) -> AcqResult<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn arm_rejects_unhealthy_camera() {
    let camera = auto_camera();
    let health = Arc::new(MockHealth::new());
    health.set_errors(0x0000_0008);
    let pipeline = build(manual_config(), &camera, &health);

    let err = pipeline.arm().await.unwrap_err();
    assert!(matches!(err, AcqError::NotHealthy { ref errors } if errors == &["sensor_temperature"]));
    assert_eq!(pipeline.state().await.unwrap(), SessionState::Idle);

    health.set_errors(0);
    health.set_warnings(0x0000_0020);
    let snapshot = pipeline.arm().await.unwrap();
    assert_eq!(snapshot.warnings, vec!["offset_regulation_range"]);
    assert_eq!(pipeline.state().await.unwrap(), SessionState::Armed);
}

#[tokio::test]
async fn stop_from_armed_returns_to_idle() {
    let camera = auto_camera();
    let health = Arc::new(MockHealth::new());
    let pipeline = build(manual_config(), &camera, &health);
    pipeline.arm().await.unwrap();

    let snapshot = pipeline.stop().await.unwrap();
    assert!(!snapshot.is_fatal());
    assert_eq!(pipeline.state().await.unwrap(), SessionState::Idle);
}

#[tokio::test]
async fn start_allocates_default_buffers_and_stop_drains_inline() {
    let camera = Arc::new(
        MockCamera::builder()
            .sensor(WIDTH, HEIGHT)
            .build(),
    );
    let health = Arc::new(MockHealth::new());
    let pipeline = build(manual_config(), &camera, &health);
    let starts = Arc::new(AtomicUsize::new(0));
    {
        let starts = starts.clone();
        pipeline.on_start(move |_, _| {
            starts.fetch_add(1, Ordering::SeqCst);
        });
    }

    pipeline.arm().await.unwrap();
    pipeline.start().await.unwrap();
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.buffer_ids().await.unwrap().len(), 4);
    assert!(camera.recording());

    camera.produce(2);
    assert_eq!(pipeline.tick().await, TickOutcome::Progress { frames: 2 });

    pipeline.stop().await.unwrap();
    assert_eq!(pipeline.state().await.unwrap(), SessionState::Idle);
    assert!(pipeline.buffer_ids().await.unwrap().is_empty());
    assert_eq!(camera.live_handles(), 0);
    assert_eq!(pipeline.stats().await.unwrap().frames_acquired, 2);
}

#[tokio::test]
async fn scheduler_task_runs_until_stop() {
    let camera = auto_camera();
    let health = Arc::new(MockHealth::new());
    let mut config = manual_config();
    config.scheduler.manual = false;
    config.scheduler.period = Duration::from_millis(5);
    let pipeline = build(config, &camera, &health);
    let stops = Arc::new(AtomicUsize::new(0));
    {
        let stops = stops.clone();
        pipeline.on_stop(move |_, _| {
            stops.fetch_add(1, Ordering::SeqCst);
        });
    }

    pipeline.arm().await.unwrap();
    pipeline.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    pipeline.stop().await.unwrap();

    let stats = pipeline.stats().await.unwrap();
    assert_eq!(stats.session, SessionState::Idle);
    assert!(stats.frames_acquired > 0);
    assert!(stats.ticks_run >= 2);
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert_eq!(stats.stored_frames as u64, stats.frames_acquired);
}

#[tokio::test]
async fn stop_times_out_and_tears_down() {
    let camera = Arc::new(MockCamera::new(WIDTH, HEIGHT));
    let health = Arc::new(MockHealth::new());
    let mut config = manual_config();
    config.camera.storage_mode = StorageMode::RecorderSequence;
    config.session.stop_timeout = Duration::from_millis(100);
    let pipeline = build(config, &camera, &health);
    pipeline.set_sink(Some(Arc::new(StuckSink))).await.unwrap();

    pipeline.allocate_buffers(2, 1).await.unwrap();
    pipeline.start().await.unwrap();
    assert_eq!(pipeline.tick().await, TickOutcome::Progress { frames: 0 });
    camera.record_without_transfer(2);

    let err = pipeline.stop().await.unwrap_err();
    assert!(matches!(err, AcqError::Timeout));
    assert_eq!(pipeline.state().await.unwrap(), SessionState::Idle);
    assert_eq!(camera.live_handles(), 0);
}

#[tokio::test]
async fn settings_are_locked_while_running() {
    let camera = auto_camera();
    let health = Arc::new(MockHealth::new());
    let pipeline = build(manual_config(), &camera, &health);
    pipeline.arm().await.unwrap();

    let mut settings = pipeline.settings().await.unwrap();
    settings.exposure = Duration::from_millis(20);
    pipeline.set_settings(settings.clone()).await.unwrap();
    assert_eq!(pipeline.state().await.unwrap(), SessionState::Idle);

    pipeline.arm().await.unwrap();
    pipeline.start().await.unwrap();
    let err = pipeline.set_settings(settings).await.unwrap_err();
    assert!(matches!(
        err,
        AcqError::InvalidState {
            state: SessionState::Running,
            ..
        }
    ));
    let ids = pipeline.buffer_ids().await.unwrap();
    assert!(pipeline.free_buffers(&ids).await.is_err());
    assert!(pipeline.allocate_buffers(1, 1).await.is_err());
}

#[tokio::test]
async fn invalid_settings_are_rejected_up_front() {
    let camera = auto_camera();
    let health = Arc::new(MockHealth::new());
    let pipeline = build(manual_config(), &camera, &health);
    let settings = CameraSettings {
        bit_depth: 0,
        ..CameraSettings::default()
    };
    assert!(matches!(
        pipeline.set_settings(settings).await,
        Err(AcqError::Configuration(_))
    ));
}

#[tokio::test]
async fn sync_reports_clamped_bit_depth() {
    let camera = Arc::new(
        MockCamera::builder()
            .sensor(WIDTH, HEIGHT)
            .max_bit_depth(12)
            .build(),
    );
    let health = Arc::new(MockHealth::new());
    let pipeline = build(manual_config(), &camera, &health);
    pipeline.arm().await.unwrap();

    let report = pipeline.sync_settings().await.unwrap();
    assert!(!report.in_sync);
    assert_eq!(report.mismatched, vec!["bit_depth"]);
    assert_eq!(report.settings.bit_depth, 12);
}

#[tokio::test]
async fn allocation_is_capped() {
    let camera = auto_camera();
    let health = Arc::new(MockHealth::new());
    let pipeline = build(manual_config(), &camera, &health);
    pipeline.allocate_buffers(MAX_BUFFERS - 1, 1).await.unwrap();
    assert!(matches!(
        pipeline.allocate_buffers(2, 1).await,
        Err(AcqError::CapacityExceeded { .. })
    ));
    assert_eq!(pipeline.buffer_ids().await.unwrap().len(), MAX_BUFFERS - 1);
}

#[tokio::test]
async fn get_data_consumes_selected_frames() {
    let camera = Arc::new(MockCamera::new(WIDTH, HEIGHT));
    let health = Arc::new(MockHealth::new());
    let pipeline = build(manual_config(), &camera, &health);
    pipeline.allocate_buffers(5, 1).await.unwrap();
    pipeline.start().await.unwrap();
    camera.produce(5);
    assert_eq!(pipeline.tick().await, TickOutcome::Progress { frames: 5 });
    assert!(pipeline.memory_usage_mib() > 0.0);

    let (frames, timestamps) = pipeline.get_data(Some(&[2])).await.unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(timestamps.len(), 1);
    assert_eq!(frames[0].image_number, 3);
    assert_eq!(pipeline.stats().await.unwrap().stored_frames, 4);

    assert_eq!(pipeline.flush_data().await.unwrap(), 4);
    assert_eq!(pipeline.memory_usage_mib(), 0.0);
    let (frames, _) = pipeline.get_data(None).await.unwrap();
    assert!(frames.is_empty());
}

#[tokio::test]
async fn transform_and_sink_see_every_frame() {
    let camera = Arc::new(MockCamera::new(WIDTH, HEIGHT));
    let health = Arc::new(MockHealth::new());
    let mut config = manual_config();
    config.store.store_in_memory = false;
    let pipeline = build(config, &camera, &health);

    let sink = Arc::new(CollectingSink::new());
    let transform: FrameTransform = Arc::new(|mut frame: Frame| {
        frame.image_number += 1000;
        frame
    });
    pipeline.set_sink(Some(sink.clone())).await.unwrap();
    pipeline.set_transform(Some(transform)).await.unwrap();

    pipeline.allocate_buffers(2, 1).await.unwrap();
    pipeline.start().await.unwrap();
    camera.produce(2);
    assert_eq!(pipeline.tick().await, TickOutcome::Progress { frames: 2 });

    let sent: Vec<u64> = sink.take().iter().map(|s| s.frame.image_number).collect();
    assert_eq!(sent, vec![1001, 1002]);
    assert_eq!(pipeline.stats().await.unwrap().stored_frames, 0);
}

#[tokio::test]
async fn each_start_gets_a_fresh_run() {
    let camera = Arc::new(MockCamera::new(WIDTH, HEIGHT));
    let health = Arc::new(MockHealth::new());
    let pipeline = build(manual_config(), &camera, &health);

    pipeline.arm().await.unwrap();
    pipeline.start().await.unwrap();
    camera.produce(1);
    pipeline.tick().await;
    pipeline.stop().await.unwrap();
    let first = pipeline.stats().await.unwrap();

    pipeline.arm().await.unwrap();
    pipeline.start().await.unwrap();
    let second = pipeline.stats().await.unwrap();
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.frames_acquired, 0);
    assert_eq!(second.frames_total, 1);
    assert!(second.run_started_at.is_some());
}
