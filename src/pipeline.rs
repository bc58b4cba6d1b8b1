//! Public acquisition API.
//!
//! [`Pipeline`] ties a camera driver to a [`BufferPool`], a [`FrameStore`]
//! and the periodic drain task. It is a cheap handle (`Clone` shares the
//! same pipeline) and every method takes `&self`.
//!
//! All mutable state lives behind one [`AcqLock`]. Foreground calls retry
//! the lock a bounded number of times and fail with [`AcqError::Busy`];
//! scheduler ticks never wait for it. Hooks run after the lock is released.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use frame_acq::config::AcqConfig;
//! use frame_acq::mock::{MockCamera, MockHealth};
//! use frame_acq::Pipeline;
//!
//! # async fn run() -> Result<(), frame_acq::error::AcqError> {
//! let camera = Arc::new(MockCamera::new(640, 480));
//! let pipeline = Pipeline::new(
//!     AcqConfig::default(),
//!     camera.clone(),
//!     camera,
//!     Arc::new(MockHealth::new()),
//! )?;
//! pipeline.arm().await?;
//! pipeline.start().await?;
//! tokio::time::sleep(std::time::Duration::from_secs(2)).await;
//! pipeline.stop().await?;
//! let (frames, timestamps) = pipeline.get_data(None).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::buffer::BufferId;
use crate::buffer_pool::{BufferPool, PoolMetrics};
use crate::config::AcqConfig;
use crate::driver::{CameraDevice, HealthSource, TransferDriver};
use crate::error::{AcqError, AcqResult};
use crate::frame::{Frame, FrameTimestamp};
use crate::frame_store::FrameStore;
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::hooks::{FrameTransform, Hook, HookKind, HookPayload, Hooks};
use crate::lock::AcqLock;
use crate::scheduler::{self, TickOutcome};
use crate::session::{AcquisitionSession, SessionState};
use crate::settings::{CameraSettings, SettingsCache, SyncReport};
use crate::sink::FrameSink;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Counters that survive across runs.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Totals {
    pub ticks_run: u64,
    pub frames_total: u64,
    pub self_heals_total: u64,
}

/// Everything guarded by the pipeline lock.
pub(crate) struct PipelineState {
    pub session: AcquisitionSession,
    pub pool: BufferPool,
    pub store: FrameStore,
    pub health: HealthMonitor,
    pub settings: SettingsCache,
    pub transform: Option<FrameTransform>,
    pub sink: Option<Arc<dyn FrameSink>>,
    /// Image slots per buffer of the last allocation; reused by rebuilds.
    pub images_per_buffer: usize,
    pub totals: Totals,
}

pub(crate) struct PipelineInner {
    pub config: AcqConfig,
    pub state: AcqLock<PipelineState>,
    pub device: Arc<dyn CameraDevice>,
    pub health_source: Arc<dyn HealthSource>,
    pub hooks: RwLock<Hooks>,
    pub task: Mutex<Option<JoinHandle<()>>>,
    pub skipped_ticks: AtomicU64,
    pub memory_bytes: AtomicU64,
}

/// Snapshot of pipeline counters.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    /// Current session state.
    pub session: SessionState,
    /// Id of the current or last run.
    pub run_id: Uuid,
    /// When the run started.
    pub run_started_at: Option<DateTime<Utc>>,
    /// Frames acquired in this run.
    pub frames_acquired: u64,
    /// Frames acquired across all runs.
    pub frames_total: u64,
    /// Ticks that ran to completion.
    pub ticks_run: u64,
    /// Ticks skipped because the lock was busy.
    pub ticks_skipped: u64,
    /// Consecutive ticks without a frame.
    pub stall_ticks: u32,
    /// Buffer rebuilds in this run.
    pub self_heals: u32,
    /// Buffer rebuilds across all runs.
    pub self_heals_total: u64,
    /// Buffers in the pool.
    pub buffers: usize,
    /// Buffers currently lent to the driver.
    pub queued_buffers: usize,
    /// Frames waiting in the store.
    pub stored_frames: usize,
    /// Memory held by buffers and store.
    pub memory_mib: f64,
    /// Pool lifetime counters.
    pub pool: PoolMetrics,
}

/// Handle to a camera acquisition pipeline.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("manual", &self.inner.config.scheduler.manual)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Build a pipeline around a driver, its device control and health source.
    ///
    /// The configuration is validated; the camera settings in it become the
    /// requested settings.
    pub fn new(
        config: AcqConfig,
        driver: Arc<dyn TransferDriver>,
        device: Arc<dyn CameraDevice>,
        health_source: Arc<dyn HealthSource>,
    ) -> AcqResult<Self> {
        config.validate()?;

        let store = FrameStore::new(config.store.initial_capacity, config.store.extension_chunk);
        let state = PipelineState {
            session: AcquisitionSession::new(),
            pool: BufferPool::new(driver, config.camera.image_descriptor()),
            store,
            health: HealthMonitor::new(config.scheduler.health_check_interval),
            settings: SettingsCache::new(config.camera.clone()),
            transform: None,
            sink: None,
            images_per_buffer: config.pool.images_per_buffer,
            totals: Totals::default(),
        };
        let lock = AcqLock::new(state, config.lock.retries, config.lock.retry_interval);

        Ok(Self {
            inner: Arc::new(PipelineInner {
                config,
                state: lock,
                device,
                health_source,
                hooks: RwLock::new(Hooks::default()),
                task: Mutex::new(None),
                skipped_ticks: AtomicU64::new(0),
                memory_bytes: AtomicU64::new(0),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<PipelineInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<PipelineInner> {
        &self.inner
    }

    /// Configuration the pipeline was built with.
    pub fn config(&self) -> &AcqConfig {
        &self.inner.config
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Push the requested settings to the camera and check its health.
    ///
    /// Idle/Armed -> Armed. Fails with [`AcqError::NotHealthy`] when the
    /// camera reports error flags.
    #[instrument(skip(self))]
    pub async fn arm(&self) -> AcqResult<HealthSnapshot> {
        let mut state = self.inner.state.lock().await?;
        self.arm_locked(&mut state).await
    }

    async fn arm_locked(&self, st: &mut PipelineState) -> AcqResult<HealthSnapshot> {
        st.session.ensure_editable("arm")?;
        let report = st.settings.apply(self.inner.device.as_ref()).await?;
        st.pool.set_descriptor(report.settings.image_descriptor());

        let snapshot = st.health.snapshot(self.inner.health_source.as_ref()).await?;
        if snapshot.is_fatal() {
            st.session.disarm();
            return Err(AcqError::NotHealthy {
                errors: snapshot.error_names(),
            });
        }
        st.session.arm()?;
        info!(
            in_sync = report.in_sync,
            storage_mode = %report.settings.storage_mode,
            "Camera armed"
        );
        Ok(snapshot)
    }

    /// Allocate `n` buffers of `images_per_buffer` images each.
    ///
    /// Arms the camera first when it is not armed.
    pub async fn allocate_buffers(&self, n: usize, images_per_buffer: usize) -> AcqResult<Vec<BufferId>> {
        let mut state = self.inner.state.lock().await?;
        state.session.ensure_editable("allocate buffers")?;
        if state.session.state() != SessionState::Armed {
            warn!("Allocating buffers on an unarmed camera, arming first");
            self.arm_locked(&mut state).await?;
        }
        let ids = state.pool.allocate(n, images_per_buffer).await?;
        state.images_per_buffer = images_per_buffer;
        Ok(ids)
    }

    /// Free buffers by id. Returns the ids that remain allocated.
    pub async fn free_buffers(&self, ids: &[BufferId]) -> AcqResult<Vec<BufferId>> {
        let mut state = self.inner.state.lock().await?;
        state.session.ensure_editable("free buffers")?;
        state.pool.free(ids).await
    }

    /// Ids of the allocated buffers.
    pub async fn buffer_ids(&self) -> AcqResult<Vec<BufferId>> {
        Ok(self.inner.state.lock().await?.pool.ids())
    }

    /// Armed -> Running.
    ///
    /// Allocates the default buffers when none exist (otherwise resizes the
    /// existing ones to the current image size), turns recording on and
    /// starts the periodic task unless the scheduler is manual.
    #[instrument(skip(self))]
    pub async fn start(&self) -> AcqResult<HealthSnapshot> {
        let snapshot = {
            let mut state = self.inner.state.lock().await?;
            if state.session.state() != SessionState::Armed {
                return Err(AcqError::InvalidState {
                    operation: "start",
                    state: state.session.state(),
                });
            }

            if state.pool.is_empty() {
                let pool = &self.inner.config.pool;
                state
                    .pool
                    .allocate(pool.default_buffer_count, pool.images_per_buffer)
                    .await?;
                state.images_per_buffer = pool.images_per_buffer;
            } else {
                let ids = state.pool.ids();
                state.pool.reallocate(&ids).await?;
            }

            self.inner.device.set_recording(true).await?;
            state.session.start()?;
            state.health.reset();
            let snapshot = state.health.snapshot(self.inner.health_source.as_ref()).await?;
            let run = state.session.run();
            info!(run_id = %run.run_id, buffers = state.pool.len(), "Acquisition started");
            snapshot
        };

        if !self.inner.config.scheduler.manual {
            let handle = scheduler::spawn(self);
            if let Some(previous) = self.inner.task.lock().replace(handle) {
                previous.abort();
            }
        }
        self.fire(HookKind::Start, Some(&HookPayload::Health(snapshot.clone())));
        Ok(snapshot)
    }

    /// Ask a running acquisition to drain and wait for it to finish.
    ///
    /// Armed -> Idle immediately. Running -> Draining: recording is turned
    /// off and the call waits up to `session.stop_timeout` for the drain.
    /// When the drain does not finish in time the run is torn down and
    /// [`AcqError::Timeout`] is returned.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> AcqResult<HealthSnapshot> {
        let previous = self.request_stop().await?;
        if previous.is_active() {
            self.wait_for_drain().await?;
        }
        self.health().await
    }

    /// Advisory stop: Running -> Draining (recording off), Armed -> Idle.
    ///
    /// Returns the state before the call and does not wait.
    pub async fn request_stop(&self) -> AcqResult<SessionState> {
        let mut state = self.inner.state.lock().await?;
        let previous = state.session.request_stop();
        if previous == SessionState::Running {
            info!(frames = state.session.run().frames_acquired, "Stop requested, draining");
            self.inner.device.set_recording(false).await?;
        }
        Ok(previous)
    }

    async fn wait_for_drain(&self) -> AcqResult<()> {
        let timeout = self.inner.config.session.stop_timeout;
        let handle = self.inner.task.lock().take();
        let drained = match handle {
            Some(mut handle) => match tokio::time::timeout(timeout, &mut handle).await {
                Ok(_) => true,
                Err(_) => {
                    handle.abort();
                    false
                }
            },
            None => tokio::time::timeout(timeout, self.drive_ticks()).await.is_ok(),
        };
        if drained {
            return Ok(());
        }

        warn!(?timeout, "Drain did not finish in time, tearing down");
        let mut state = self.inner.state.lock().await?;
        if state.session.state().is_active() {
            scheduler::abort_locked(&self.inner, &mut state).await;
        }
        Err(AcqError::Timeout)
    }

    /// Tick inline until the run ends (no periodic task running).
    async fn drive_ticks(&self) {
        loop {
            if self.tick().await.is_terminal() {
                return;
            }
            tokio::time::sleep(self.inner.config.scheduler.period).await;
        }
    }

    /// Run one scheduler tick now.
    pub async fn tick(&self) -> TickOutcome {
        scheduler::run_tick(self).await
    }

    // ---------------------------------------------------------------------
    // Data
    // ---------------------------------------------------------------------

    /// Remove frames from the store, all of them or the given indices.
    pub async fn get_data(&self, indices: Option<&[usize]>) -> AcqResult<(Vec<Frame>, Vec<FrameTimestamp>)> {
        let mut state = self.inner.state.lock().await?;
        let data = state.store.get(indices);
        self.inner
            .memory_bytes
            .store(state.store.memory_bytes() as u64, Ordering::Relaxed);
        Ok(data)
    }

    /// Drop every stored frame. Returns how many were dropped.
    pub async fn flush_data(&self) -> AcqResult<usize> {
        let mut state = self.inner.state.lock().await?;
        let dropped = state.store.count();
        state.store.reset();
        self.inner.memory_bytes.store(0, Ordering::Relaxed);
        debug!(dropped, "Frame store flushed");
        Ok(dropped)
    }

    /// Payload held by the frame store in MiB, as of the last tick or read.
    ///
    /// Lock-free.
    pub fn memory_usage_mib(&self) -> f64 {
        self.inner.memory_bytes.load(Ordering::Relaxed) as f64 / BYTES_PER_MIB
    }

    // ---------------------------------------------------------------------
    // Settings and health
    // ---------------------------------------------------------------------

    /// Replace the requested settings. Disarms the camera.
    pub async fn set_settings(&self, settings: CameraSettings) -> AcqResult<()> {
        settings.validate()?;
        let mut state = self.inner.state.lock().await?;
        state.session.ensure_editable("change settings")?;
        state.settings.set(settings);
        state.session.disarm();
        Ok(())
    }

    /// Requested settings.
    pub async fn settings(&self) -> AcqResult<CameraSettings> {
        Ok(self.inner.state.lock().await?.settings.requested().clone())
    }

    /// Read the camera settings back and compare with the requested ones.
    pub async fn sync_settings(&self) -> AcqResult<SyncReport> {
        let mut state = self.inner.state.lock().await?;
        state.settings.sync(self.inner.device.as_ref()).await
    }

    /// Read the camera health now.
    pub async fn health(&self) -> AcqResult<HealthSnapshot> {
        let mut state = self.inner.state.lock().await?;
        state.health.snapshot(self.inner.health_source.as_ref()).await
    }

    /// Current session state.
    pub async fn state(&self) -> AcqResult<SessionState> {
        Ok(self.inner.state.lock().await?.session.state())
    }

    /// Snapshot of counters.
    pub async fn stats(&self) -> AcqResult<PipelineStats> {
        let state = self.inner.state.lock().await?;
        let run = state.session.run();
        Ok(PipelineStats {
            session: state.session.state(),
            run_id: run.run_id,
            run_started_at: run.started_at,
            frames_acquired: run.frames_acquired,
            frames_total: state.totals.frames_total,
            ticks_run: state.totals.ticks_run,
            ticks_skipped: self.inner.skipped_ticks.load(Ordering::Relaxed),
            stall_ticks: run.stall_ticks,
            self_heals: run.self_heals,
            self_heals_total: state.totals.self_heals_total,
            buffers: state.pool.len(),
            queued_buffers: state.pool.pending_count(),
            stored_frames: state.store.count(),
            memory_mib: state.store.memory_mib(),
            pool: state.pool.metrics(),
        })
    }

    // ---------------------------------------------------------------------
    // Transform, sink and hooks
    // ---------------------------------------------------------------------

    /// Set or clear the per-frame transform.
    pub async fn set_transform(&self, transform: Option<FrameTransform>) -> AcqResult<()> {
        self.inner.state.lock().await?.transform = transform;
        Ok(())
    }

    /// Set or clear the downstream sink.
    pub async fn set_sink(&self, sink: Option<Arc<dyn FrameSink>>) -> AcqResult<()> {
        self.inner.state.lock().await?.sink = sink;
        Ok(())
    }

    /// Called after a session starts.
    pub fn on_start(&self, hook: impl Fn(&Pipeline, Option<&HookPayload>) + Send + Sync + 'static) {
        self.set_hook(HookKind::Start, Some(Arc::new(hook)));
    }

    /// Called after a session ends normally.
    pub fn on_stop(&self, hook: impl Fn(&Pipeline, Option<&HookPayload>) + Send + Sync + 'static) {
        self.set_hook(HookKind::Stop, Some(Arc::new(hook)));
    }

    /// Called once when a fatal error ends a session.
    pub fn on_error(&self, hook: impl Fn(&Pipeline, Option<&HookPayload>) + Send + Sync + 'static) {
        self.set_hook(HookKind::Error, Some(Arc::new(hook)));
    }

    /// Called after each tick that drained frames.
    pub fn on_frames_acquired(&self, hook: impl Fn(&Pipeline, Option<&HookPayload>) + Send + Sync + 'static) {
        self.set_hook(HookKind::FramesAcquired, Some(Arc::new(hook)));
    }

    /// Called after every tick.
    pub fn on_tick(&self, hook: impl Fn(&Pipeline, Option<&HookPayload>) + Send + Sync + 'static) {
        self.set_hook(HookKind::Tick, Some(Arc::new(hook)));
    }

    /// Install or clear a hook.
    pub fn set_hook(&self, kind: HookKind, hook: Option<Hook>) {
        self.inner.hooks.write().set(kind, hook);
    }

    pub(crate) fn fire(&self, kind: HookKind, payload: Option<&HookPayload>) {
        let hook = self.inner.hooks.read().get(kind);
        if let Some(hook) = hook {
            hook(self, payload);
        }
    }
}
