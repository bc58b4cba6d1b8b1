//! Periodic drain task.
//!
//! One tick:
//!
//! 1. `try_lock` the pipeline state; on contention the tick is dropped.
//! 2. Check health when the interval elapsed; a fatal error aborts the run.
//! 3. Idle sessions report `Waiting` (no frames yet) or `Finished`.
//! 4. Detect the natural end of a running acquisition.
//! 5. Enqueue every buffer on the first tick of a run.
//! 6. Poll and drain up to `buffer_runs` times, re-queueing while running.
//! 7. Count stalled ticks and rebuild the buffers past the threshold.
//! 8. Complete a draining session according to its storage mode.
//! 9. Release the lock, then call the hooks.
//!
//! Timeouts and other non-fatal errors only cost the tick; a drained buffer
//! is re-queued and its frames are counted even when storing or streaming
//! one of them failed. A fatal error
//! (driver failure, camera health error, corrupt trailer) unwinds the session
//! to `Idle`, frees the buffers and reaches `on_error` once.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, debug_span, error, info, warn, Instrument};

use crate::buffer::BufferId;
use crate::error::{AcqError, AcqResult};
use crate::frame::split_region;
use crate::health::HealthSnapshot;
use crate::hooks::{HookKind, HookPayload};
use crate::pipeline::{Pipeline, PipelineInner, PipelineState};
use crate::session::{DrainPhase, SessionState};
use crate::sink::StampedFrame;

/// Result of one scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The lock was held elsewhere; nothing was done.
    Skipped,
    /// No run in progress and no frames acquired yet.
    Waiting,
    /// A run is in progress; `frames` were drained this tick.
    Progress {
        /// Frames drained by this tick.
        frames: usize,
    },
    /// The run is over; `frames` were acquired in total.
    Finished {
        /// Frames acquired in the run.
        frames: u64,
    },
    /// A fatal error ended the run.
    Aborted,
}

impl TickOutcome {
    /// Whether the periodic task should stop after this tick.
    pub fn is_terminal(self) -> bool {
        matches!(self, TickOutcome::Finished { .. } | TickOutcome::Aborted)
    }
}

#[derive(Debug, Default)]
struct TickReport {
    frames: usize,
    finished: bool,
    stop_health: Option<HealthSnapshot>,
}

struct TickFailure {
    error: AcqError,
    health: Option<HealthSnapshot>,
    /// Frames already committed to the run before the failure.
    frames: usize,
}

impl From<AcqError> for TickFailure {
    fn from(error: AcqError) -> Self {
        Self {
            error,
            health: None,
            frames: 0,
        }
    }
}

/// Spawn the periodic task. It stops after a terminal tick or when the
/// pipeline is dropped.
pub(crate) fn spawn(pipeline: &Pipeline) -> JoinHandle<()> {
    let weak = Arc::downgrade(pipeline.inner());
    let period = pipeline.config().scheduler.period;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let Some(inner) = weak.upgrade() else {
                debug!("Pipeline dropped, scheduler exiting");
                break;
            };
            let outcome = Pipeline::from_inner(inner).tick().await;
            if outcome.is_terminal() {
                debug!(?outcome, "Scheduler finished");
                break;
            }
        }
    })
}

/// Run one tick against `pipeline`.
pub(crate) async fn run_tick(pipeline: &Pipeline) -> TickOutcome {
    let inner = pipeline.inner();
    let Some(mut state) = inner.state.try_lock() else {
        inner.skipped_ticks.fetch_add(1, Ordering::Relaxed);
        debug!("Pipeline busy, tick dropped");
        return TickOutcome::Skipped;
    };

    state.totals.ticks_run += 1;
    let span = debug_span!("tick", n = state.totals.ticks_run, session = %state.session.state());
    let result = step(inner, &mut state).instrument(span).await;

    let outcome = match result {
        Ok(outcome) => Ok(outcome),
        Err(failure) if !failure.error.is_fatal() => {
            warn!(error = %failure.error, frames = failure.frames, "Tick failed, retrying on the next tick");
            let report = TickReport {
                frames: failure.frames,
                ..Default::default()
            };
            Ok((
                TickOutcome::Progress {
                    frames: failure.frames,
                },
                report,
            ))
        }
        Err(failure) => {
            error!(error = %failure.error, "Acquisition aborted");
            abort_locked(inner, &mut state).await;
            Err(failure)
        }
    };
    inner
        .memory_bytes
        .store(state.store.memory_bytes() as u64, Ordering::Relaxed);
    let run_total = state.session.run().frames_acquired;
    drop(state);

    match outcome {
        Err(failure) => {
            pipeline.fire(
                HookKind::Error,
                Some(&HookPayload::Error {
                    message: failure.error.to_string(),
                    health: failure.health,
                }),
            );
            TickOutcome::Aborted
        }
        Ok((outcome, report)) => {
            if report.frames > 0 {
                pipeline.fire(
                    HookKind::FramesAcquired,
                    Some(&HookPayload::Frames {
                        count: report.frames,
                        run_total,
                    }),
                );
            }
            pipeline.fire(HookKind::Tick, None);
            if report.finished {
                let payload = report.stop_health.map(HookPayload::Health);
                pipeline.fire(HookKind::Stop, payload.as_ref());
            }
            outcome
        }
    }
}

async fn step(
    inner: &PipelineInner,
    st: &mut PipelineState,
) -> Result<(TickOutcome, TickReport), TickFailure> {
    let config = &inner.config;
    let mut report = TickReport::default();

    if st.health.is_due(Instant::now()) {
        match st.health.check(inner.health_source.as_ref()).await {
            Ok(snapshot) if snapshot.is_fatal() && st.session.state().is_active() => {
                return Err(TickFailure {
                    error: AcqError::Health {
                        errors: snapshot.error_names(),
                    },
                    health: Some(snapshot),
                    frames: 0,
                });
            }
            Ok(_) => {}
            Err(err) if err.is_fatal() && st.session.state().is_active() => {
                return Err(err.into());
            }
            Err(err) => warn!(error = %err, "Health check failed"),
        }
    }

    let state = st.session.state();
    if !state.is_active() {
        let frames = st.session.run().frames_acquired;
        return Ok(if frames == 0 {
            (TickOutcome::Waiting, report)
        } else {
            (TickOutcome::Finished { frames }, report)
        });
    }

    let mode = st.settings.requested().storage_mode;
    if state == SessionState::Running && !inner.device.is_recording().await.map_err(AcqError::from)? {
        info!(
            frames = st.session.run().frames_acquired,
            "Camera stopped producing, draining"
        );
        st.session.request_stop();
        if mode.stops_recording_at_end() {
            inner.device.set_recording(false).await.map_err(AcqError::from)?;
        }
    }

    // The first tick of a run queues every buffer. Later ticks pick up any
    // buffer a rejected re-queue left behind.
    if st.session.state() == SessionState::Running {
        let queued = st.pool.enqueue_all().await?;
        if !st.session.run().first_enqueue_done {
            debug!(queued, "Initial buffers queued");
        } else if queued > 0 {
            debug!(queued, "Idle buffers re-queued");
        }
    }
    st.session.run_mut().first_enqueue_done = true;

    let drained = drain_ready(inner, st, &mut report.frames).await;
    st.session.run_mut().frames_acquired += report.frames as u64;
    st.totals.frames_total += report.frames as u64;
    if report.frames > 0 {
        st.store.check_memory_limit(config.store.memory_limit_mib);
    }
    if let Err(error) = drained {
        return Err(TickFailure {
            error,
            health: None,
            frames: report.frames,
        });
    }

    let max_frames = config.session.max_frames;
    if st.session.state() == SessionState::Running
        && max_frames > 0
        && st.session.run().frames_acquired >= max_frames
    {
        info!(max_frames, "Frame limit reached, draining");
        st.session.request_stop();
        inner.device.set_recording(false).await.map_err(AcqError::from)?;
    }

    match st.session.state() {
        SessionState::Running => track_stall(inner, st, report.frames).await?,
        SessionState::Draining => {
            if complete_drain(inner, st, report.frames).await? {
                report.finished = true;
                report.stop_health = teardown(inner, st).await;
                let frames = st.session.run().frames_acquired;
                info!(frames, "Acquisition finished");
                return Ok((TickOutcome::Finished { frames }, report));
            }
        }
        SessionState::Idle | SessionState::Armed => {}
    }

    Ok((
        TickOutcome::Progress {
            frames: report.frames,
        },
        report,
    ))
}

/// Poll, drain and re-queue ready buffers, adding kept frames to `frames`.
///
/// A non-fatal failure while handling one buffer is logged and the buffer is
/// still re-queued; only fatal errors end the loop early.
async fn drain_ready(inner: &PipelineInner, st: &mut PipelineState, frames: &mut usize) -> AcqResult<()> {
    let config = &inner.config;
    let max_frames = config.session.max_frames;

    for _ in 0..config.scheduler.buffer_runs {
        if max_frames > 0 && st.session.run().frames_acquired + *frames as u64 >= max_frames {
            break;
        }
        let ids = st.pool.ids();
        let ready = st.pool.poll(&ids, config.scheduler.poll_wait).await?;
        if ready.is_empty() {
            break;
        }

        for id in ready {
            tolerate(id, deliver(inner, st, id, frames).await)?;
            tolerate(id, requeue(st, id).await)?;
        }
    }
    Ok(())
}

fn tolerate(id: BufferId, result: AcqResult<()>) -> AcqResult<()> {
    match result {
        Err(err) if !err.is_fatal() => {
            warn!(buffer_id = %id, error = %err, "Buffer handling failed, continuing");
            Ok(())
        }
        other => other,
    }
}

/// Decode one ready buffer and hand its frames to the store and the sink.
///
/// Every decoded frame is kept even when the sink rejects it; the first sink
/// error is returned after the whole buffer was processed.
async fn deliver(
    inner: &PipelineInner,
    st: &mut PipelineState,
    id: BufferId,
    frames: &mut usize,
) -> AcqResult<()> {
    let config = &inner.config;
    let max_frames = config.session.max_frames;
    let drained = st.pool.drain(id)?;
    let descriptor = *st.pool.descriptor();
    let decoded = split_region(&drained.content, &descriptor, drained.images, Utc::now())?;

    let mut sink_error = None;
    for (frame, timestamp) in decoded {
        let acquired = st.session.run().frames_acquired + *frames as u64;
        if max_frames > 0 && acquired >= max_frames {
            debug!(image_number = frame.image_number, "Frame beyond limit dropped");
            continue;
        }
        let frame = match &st.transform {
            Some(transform) => transform(frame),
            None => frame,
        };
        if let Some(sink) = st.sink.clone() {
            let sent = sink
                .send(StampedFrame {
                    frame: frame.clone(),
                    timestamp,
                })
                .await;
            if let Err(err) = sent {
                sink_error.get_or_insert(err);
            }
        }
        if config.store.store_in_memory {
            st.store.append(frame, timestamp);
        }
        *frames += 1;
    }
    sink_error.map_or(Ok(()), Err)
}

async fn requeue(st: &mut PipelineState, id: BufferId) -> AcqResult<()> {
    match (st.session.state(), st.session.phase()) {
        (SessionState::Running, _) => st.pool.enqueue(id, 0, 0).await,
        (SessionState::Draining, DrainPhase::FinalReadout { .. }) => {
            enqueue_readout(st, id).await.map(|_| ())
        }
        _ => Ok(()),
    }
}

/// Queue the next slice of the final readout into `id`. Returns false when
/// nothing is left to read.
async fn enqueue_readout(st: &mut PipelineState, id: BufferId) -> AcqResult<bool> {
    let phase = st.session.phase();
    let DrainPhase::FinalReadout { last, .. } = phase else {
        return Ok(false);
    };
    let images = u32::try_from(st.pool.get(id).map_or(1, |b| b.images())).unwrap_or(u32::MAX);
    let Some((start, end)) = phase.next_slice(images) else {
        return Ok(false);
    };
    st.pool.enqueue(id, start, end).await?;
    st.session.set_phase(DrainPhase::FinalReadout {
        next: u64::from(end) + 1,
        last,
    });
    Ok(true)
}

async fn track_stall(inner: &PipelineInner, st: &mut PipelineState, frames: usize) -> AcqResult<()> {
    if frames > 0 {
        st.session.run_mut().stall_ticks = 0;
        return Ok(());
    }
    let threshold = inner.config.scheduler.buffer_fix_threshold;
    let run = st.session.run_mut();
    run.stall_ticks += 1;
    if threshold == 0 || run.stall_ticks <= threshold {
        return Ok(());
    }

    let stall_ticks = run.stall_ticks;
    let count = st.pool.len().max(1);
    warn!(stall_ticks, buffers = count, "No frames received, rebuilding buffers");
    st.pool.free_all().await;
    st.pool.allocate(count, st.images_per_buffer).await?;
    st.pool.enqueue_all().await?;
    let run = st.session.run_mut();
    run.stall_ticks = 0;
    run.self_heals += 1;
    st.totals.self_heals_total += 1;
    Ok(())
}

/// Decide whether a draining session is done. May start the final readout.
async fn complete_drain(inner: &PipelineInner, st: &mut PipelineState, frames: usize) -> AcqResult<bool> {
    match st.session.phase() {
        DrainPhase::Collecting => {
            if frames > 0 {
                return Ok(false);
            }
            let mode = st.settings.requested().storage_mode;
            if !mode.final_readout() {
                return Ok(true);
            }
            let recorded = inner.device.recorded_image_count().await?;
            let acquired = st.session.run().frames_acquired;
            if recorded <= acquired {
                return Ok(true);
            }
            start_final_readout(st, acquired, recorded).await?;
            Ok(false)
        }
        DrainPhase::FinalReadout { next, last } => {
            if next > last && st.pool.pending_count() == 0 {
                return Ok(true);
            }
            if frames > 0 {
                st.session.run_mut().stall_ticks = 0;
                return Ok(false);
            }
            let limit = inner.config.scheduler.buffer_fix_threshold.max(1);
            let run = st.session.run_mut();
            run.stall_ticks += 1;
            if run.stall_ticks > limit {
                warn!(next, last, "Final readout stalled, finishing without remaining images");
                return Ok(true);
            }
            Ok(false)
        }
    }
}

async fn start_final_readout(st: &mut PipelineState, acquired: u64, recorded: u64) -> AcqResult<()> {
    // Recorder indices are 32-bit on the wire.
    let first = acquired + 1;
    let last = recorded.min(u64::from(u32::MAX));
    info!(first, last, "Reading remaining images from camera memory");

    let count = st.pool.len().max(1);
    st.pool.free_all().await;
    st.pool.allocate(count, st.images_per_buffer).await?;
    st.session.begin_final_readout(first, last)?;
    st.session.run_mut().stall_ticks = 0;
    for id in st.pool.ids() {
        if !enqueue_readout(st, id).await? {
            break;
        }
    }
    Ok(())
}

/// Draining -> Idle: free buffers and capture the final health.
async fn teardown(inner: &PipelineInner, st: &mut PipelineState) -> Option<HealthSnapshot> {
    st.pool.free_all().await;
    st.session.finish();
    match st.health.snapshot(inner.health_source.as_ref()).await {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            warn!(error = %err, "Health read after run failed");
            None
        }
    }
}

/// Any state -> Idle after a fatal error. Cleanup failures are logged only.
pub(crate) async fn abort_locked(inner: &PipelineInner, st: &mut PipelineState) {
    st.session.abort();
    st.pool.free_all().await;
    if let Err(err) = inner.device.set_recording(false).await {
        warn!(error = %err, "Failed to stop recording during abort");
    }
}
