//! Simulated camera: transfer driver plus control surface.
//!
//! Production is deterministic. Live transfers complete only when the camera
//! is recording and production credit is available, either granted with
//! [`MockCamera::produce`] or unlimited with `auto_produce`. Transfers settle
//! whenever the pipeline polls, oldest first. Reads from the recorder segment
//! (`start_index > 0`) complete on the next poll regardless of credit.
//!
//! # Example
//!
//! ```rust,ignore
//! let camera = MockCamera::builder().sensor(64, 48).frame_budget(10).build();
//! camera.produce(2);
//! ```

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::buffer::Region;
use crate::driver::{
    codes, CameraDevice, DriverError, DriverHandle, EnqueueRejected, TransferDriver,
    TransferStatus,
};
use crate::frame::FrameTrailer;
use crate::settings::{CameraSettings, ImageDescriptor, Roi};

use super::pattern::write_pattern;

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    /// Region allocation.
    Allocate,
    /// Transfer enqueue.
    Enqueue,
    /// `poll_status` and `wait_any`
    Poll,
    /// Taking back a completed region.
    TakeRegion,
    /// Handle release.
    Free,
    /// Writing settings.
    ApplySettings,
    /// Recording on or off.
    SetRecording,
}

/// Driver calls recorded for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    /// Handle and size in bytes.
    Allocate(DriverHandle, usize),
    /// Transfer queued for a handle.
    Enqueue {
        /// Target buffer.
        handle: DriverHandle,
        /// First recorder index, 0 for live images.
        start_index: u32,
        /// Last recorder index.
        end_index: u32,
    },
    /// Handle released.
    Free(DriverHandle),
    /// Recording switched.
    SetRecording(bool),
}

#[derive(Debug)]
struct Failure {
    op: MockOp,
    skip: u32,
    code: u32,
    persistent: bool,
}

#[derive(Debug)]
enum Slot {
    Held,
    InFlight {
        region: Region,
        start_index: u32,
        end_index: u32,
        descriptor: ImageDescriptor,
    },
    Done(Region),
}

#[derive(Debug)]
struct MockState {
    next_handle: u64,
    slots: HashMap<DriverHandle, Slot>,
    in_flight: VecDeque<DriverHandle>,
    completed: VecDeque<DriverHandle>,
    credits: u64,
    image_counter: u64,
    live_images: u64,
    recording: bool,
    settings: CameraSettings,
    failures: Vec<Failure>,
    calls: Vec<DriverCall>,
}

/// Simulated camera implementing [`TransferDriver`] and [`CameraDevice`].
pub struct MockCamera {
    sensor: (u32, u32),
    auto_produce: bool,
    frame_budget: Option<u64>,
    stamp_timestamps: bool,
    max_bit_depth: u8,
    state: Mutex<MockState>,
    notify: Notify,
}

/// Builder for [`MockCamera`].
#[derive(Debug, Clone)]
pub struct MockCameraBuilder {
    sensor: (u32, u32),
    auto_produce: bool,
    frame_budget: Option<u64>,
    stamp_timestamps: bool,
    max_bit_depth: u8,
}

impl MockCameraBuilder {
    /// Builder for a sensor of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            sensor: (width, height),
            auto_produce: false,
            frame_budget: None,
            stamp_timestamps: true,
            max_bit_depth: 16,
        }
    }

    /// Override the sensor size.
    pub fn sensor(mut self, width: u32, height: u32) -> Self {
        self.sensor = (width, height);
        self
    }

    /// Complete every queued live transfer on each poll.
    pub fn auto_produce(mut self, enabled: bool) -> Self {
        self.auto_produce = enabled;
        self
    }

    /// Stop producing after this many live images.
    pub fn frame_budget(mut self, images: u64) -> Self {
        self.frame_budget = Some(images);
        self
    }

    /// Leave trailer timestamps at zero (host time is used instead).
    pub fn without_timestamps(mut self) -> Self {
        self.stamp_timestamps = false;
        self
    }

    /// Clamp the bit depth the camera accepts; readback then differs from requests above it.
    pub fn max_bit_depth(mut self, bits: u8) -> Self {
        self.max_bit_depth = bits;
        self
    }

    /// Finish the camera.
    pub fn build(self) -> MockCamera {
        let settings = CameraSettings {
            roi: Roi::full(self.sensor.0, self.sensor.1),
            ..Default::default()
        };
        MockCamera {
            sensor: self.sensor,
            auto_produce: self.auto_produce,
            frame_budget: self.frame_budget,
            stamp_timestamps: self.stamp_timestamps,
            max_bit_depth: self.max_bit_depth,
            state: Mutex::new(MockState {
                next_handle: 1,
                slots: HashMap::new(),
                in_flight: VecDeque::new(),
                completed: VecDeque::new(),
                credits: 0,
                image_counter: 0,
                live_images: 0,
                recording: false,
                settings,
                failures: Vec::new(),
                calls: Vec::new(),
            }),
            notify: Notify::new(),
        }
    }
}

impl MockCamera {
    /// Camera with a `width` x `height` sensor and manual production.
    pub fn new(width: u32, height: u32) -> Self {
        MockCameraBuilder::new(width, height).build()
    }

    /// Builder with a 640x480 sensor.
    pub fn builder() -> MockCameraBuilder {
        MockCameraBuilder::new(640, 480)
    }

    /// Sensor width and height.
    pub fn sensor(&self) -> (u32, u32) {
        self.sensor
    }

    /// Grant credit for `buffers` more live transfer completions.
    pub fn produce(&self, buffers: u64) {
        self.state.lock().credits += buffers;
        self.notify.notify_waiters();
    }

    /// Record `images` into camera memory without transferring them.
    pub fn record_without_transfer(&self, images: u64) {
        self.state.lock().image_counter += images;
    }

    /// Fail the next call of `op` with `code`.
    pub fn fail_next(&self, op: MockOp, code: u32) {
        self.fail_nth(op, 1, code);
    }

    /// Fail the `n`-th next call (1-based) of `op` with `code`.
    pub fn fail_nth(&self, op: MockOp, n: u32, code: u32) {
        self.state.lock().failures.push(Failure {
            op,
            skip: n.saturating_sub(1),
            code,
            persistent: false,
        });
    }

    /// Fail every call of `op` with `code` until [`MockCamera::clear_failures`].
    pub fn fail_always(&self, op: MockOp, code: u32) {
        self.state.lock().failures.push(Failure {
            op,
            skip: 0,
            code,
            persistent: true,
        });
    }

    /// Drop every pending injected failure.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Calls recorded so far.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded calls matching `pred`.
    pub fn count_calls(&self, pred: impl Fn(&DriverCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Handles allocated and not yet freed.
    pub fn live_handles(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Transfers queued and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Live images produced so far.
    pub fn images_produced(&self) -> u64 {
        self.state.lock().live_images
    }

    /// Whether recording is on.
    pub fn recording(&self) -> bool {
        self.state.lock().recording
    }

    fn budget_exhausted(&self, state: &MockState) -> bool {
        self.frame_budget
            .is_some_and(|budget| state.live_images >= budget)
    }

    fn take_failure(state: &mut MockState, op: MockOp) -> Option<DriverError> {
        let index = state.failures.iter().position(|f| f.op == op)?;
        let failure = &mut state.failures[index];
        if failure.skip > 0 {
            failure.skip -= 1;
            return None;
        }
        let code = failure.code;
        if !failure.persistent {
            state.failures.remove(index);
        }
        Some(DriverError::new(code))
    }

    /// Complete whatever transfers can complete right now, oldest first.
    fn settle(&self, state: &mut MockState) {
        let mut remaining = VecDeque::with_capacity(state.in_flight.len());
        let mut live_blocked = false;
        while let Some(handle) = state.in_flight.pop_front() {
            let Some(Slot::InFlight {
                start_index,
                end_index,
                ..
            }) = state.slots.get(&handle)
            else {
                continue;
            };
            let (start_index, end_index) = (*start_index, *end_index);
            let segment = start_index > 0;

            if !segment {
                let can_produce = !live_blocked
                    && state.recording
                    && !self.budget_exhausted(state)
                    && (self.auto_produce || state.credits > 0);
                if !can_produce {
                    live_blocked = true;
                    remaining.push_back(handle);
                    continue;
                }
                if !self.auto_produce {
                    state.credits -= 1;
                }
            }

            let Some(Slot::InFlight {
                mut region,
                descriptor,
                ..
            }) = state.slots.remove(&handle)
            else {
                continue;
            };
            self.fill(state, &mut region, &descriptor, segment.then_some((start_index, end_index)));
            state.slots.insert(handle, Slot::Done(region));
            state.completed.push_back(handle);
        }
        state.in_flight = remaining;
    }

    fn fill(
        &self,
        state: &mut MockState,
        region: &mut Region,
        descriptor: &ImageDescriptor,
        segment: Option<(u32, u32)>,
    ) {
        let slot = descriptor.slot_bytes();
        let image_bytes = descriptor.image_bytes();
        let slots = region.len() / slot;
        let data = region.as_mut_slice();
        data.fill(0);

        for index in 0..slots {
            let image_number = match segment {
                Some((start, end)) => {
                    let n = u64::from(start) + index as u64;
                    if n > u64::from(end) || n > state.image_counter {
                        break;
                    }
                    n
                }
                None => {
                    if self.budget_exhausted(state) {
                        break;
                    }
                    state.image_counter += 1;
                    state.live_images += 1;
                    state.image_counter
                }
            };
            let base = index * slot;
            write_pattern(&mut data[base..base + image_bytes], descriptor, image_number);
            let trailer = if self.stamp_timestamps {
                FrameTrailer::stamped(image_number, Utc::now())
            } else {
                FrameTrailer {
                    image_number,
                    timestamp_us: 0,
                }
            };
            // Trailer slice is exactly TRAILER_LEN bytes.
            trailer.encode(&mut data[base + image_bytes..base + slot]).ok();
        }
    }
}

#[async_trait]
impl TransferDriver for MockCamera {
    async fn allocate_region(&self, size: usize) -> Result<(DriverHandle, Region), DriverError> {
        let mut state = self.state.lock();
        if let Some(err) = Self::take_failure(&mut state, MockOp::Allocate) {
            return Err(err);
        }
        let handle = DriverHandle(state.next_handle);
        state.next_handle += 1;
        state.slots.insert(handle, Slot::Held);
        state.calls.push(DriverCall::Allocate(handle, size));
        Ok((handle, Region::zeroed(size)))
    }

    async fn enqueue(
        &self,
        handle: DriverHandle,
        region: Region,
        start_index: u32,
        end_index: u32,
        descriptor: ImageDescriptor,
    ) -> Result<(), EnqueueRejected> {
        let mut state = self.state.lock();
        if let Some(error) = Self::take_failure(&mut state, MockOp::Enqueue) {
            return Err(EnqueueRejected { error, region });
        }
        if !matches!(state.slots.get(&handle), Some(Slot::Held)) {
            return Err(EnqueueRejected {
                error: DriverError::new(codes::INVALID_HANDLE),
                region,
            });
        }
        if region.len() < descriptor.slot_bytes() || start_index > end_index {
            return Err(EnqueueRejected {
                error: DriverError::new(codes::INVALID_PARAMETER),
                region,
            });
        }
        state.calls.push(DriverCall::Enqueue {
            handle,
            start_index,
            end_index,
        });
        state.slots.insert(
            handle,
            Slot::InFlight {
                region,
                start_index,
                end_index,
                descriptor,
            },
        );
        state.in_flight.push_back(handle);
        Ok(())
    }

    async fn poll_status(&self, handle: DriverHandle) -> Result<TransferStatus, DriverError> {
        let mut state = self.state.lock();
        if let Some(err) = Self::take_failure(&mut state, MockOp::Poll) {
            return Err(err);
        }
        self.settle(&mut state);
        match state.slots.get(&handle) {
            None => Err(DriverError::new(codes::INVALID_HANDLE)),
            Some(Slot::InFlight { .. }) => Ok(TransferStatus {
                queued: true,
                ..Default::default()
            }),
            Some(Slot::Done(_)) => Ok(TransferStatus {
                ready: true,
                ..Default::default()
            }),
            Some(Slot::Held) => Ok(TransferStatus::default()),
        }
    }

    async fn wait_any(
        &self,
        handles: &[DriverHandle],
        timeout: Duration,
    ) -> Result<Vec<DriverHandle>, DriverError> {
        let ready_now = |camera: &Self| -> Result<Vec<DriverHandle>, DriverError> {
            let mut state = camera.state.lock();
            if let Some(err) = Self::take_failure(&mut state, MockOp::Poll) {
                return Err(err);
            }
            camera.settle(&mut state);
            Ok(state
                .completed
                .iter()
                .filter(|h| handles.contains(h))
                .copied()
                .collect())
        };

        let notified = self.notify.notified();
        let ready = ready_now(self)?;
        if !ready.is_empty() {
            return Ok(ready);
        }
        if tokio::time::timeout(timeout, notified).await.is_err() {
            return Err(DriverError::timeout());
        }
        let ready = ready_now(self)?;
        if ready.is_empty() {
            Err(DriverError::timeout())
        } else {
            Ok(ready)
        }
    }

    async fn take_region(&self, handle: DriverHandle) -> Result<Region, DriverError> {
        let mut state = self.state.lock();
        if let Some(err) = Self::take_failure(&mut state, MockOp::TakeRegion) {
            return Err(err);
        }
        match state.slots.remove(&handle) {
            Some(Slot::Done(region)) => {
                state.slots.insert(handle, Slot::Held);
                state.completed.retain(|h| *h != handle);
                Ok(region)
            }
            Some(other) => {
                state.slots.insert(handle, other);
                Err(DriverError::new(codes::BUFFER_UNAVAILABLE))
            }
            None => Err(DriverError::new(codes::INVALID_HANDLE)),
        }
    }

    async fn free(&self, handle: DriverHandle) -> Result<Option<Region>, DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::Free(handle));
        if let Some(err) = Self::take_failure(&mut state, MockOp::Free) {
            return Err(err);
        }
        match state.slots.remove(&handle) {
            None => Err(DriverError::new(codes::BUFFER_UNAVAILABLE)),
            Some(Slot::Held) => Ok(None),
            Some(Slot::Done(region)) => {
                state.completed.retain(|h| *h != handle);
                Ok(Some(region))
            }
            Some(Slot::InFlight { .. }) => {
                state.in_flight.retain(|h| *h != handle);
                debug!(handle = %handle, "Queued transfer cancelled by free");
                Err(DriverError::new(codes::BUFFER_CANCELLED))
            }
        }
    }
}

#[async_trait]
impl CameraDevice for MockCamera {
    async fn apply_settings(&self, settings: &CameraSettings) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if let Some(err) = Self::take_failure(&mut state, MockOp::ApplySettings) {
            return Err(err);
        }
        if !settings.roi.fits(self.sensor.0, self.sensor.1) {
            return Err(DriverError::new(codes::INVALID_PARAMETER));
        }
        let mut applied = settings.clone();
        applied.bit_depth = applied.bit_depth.min(self.max_bit_depth);
        state.settings = applied;
        Ok(())
    }

    async fn read_settings(&self) -> Result<CameraSettings, DriverError> {
        Ok(self.state.lock().settings.clone())
    }

    async fn set_recording(&self, on: bool) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if let Some(err) = Self::take_failure(&mut state, MockOp::SetRecording) {
            return Err(err);
        }
        state.recording = on;
        state.calls.push(DriverCall::SetRecording(on));
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn is_recording(&self) -> Result<bool, DriverError> {
        let state = self.state.lock();
        Ok(state.recording && !self.budget_exhausted(&state))
    }

    async fn recorded_image_count(&self) -> Result<u64, DriverError> {
        Ok(self.state.lock().image_counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::split_region;
    use bytes::Bytes;

    fn desc() -> ImageDescriptor {
        ImageDescriptor {
            width: 4,
            height: 2,
            bit_depth: 16,
        }
    }

    async fn queued(camera: &MockCamera, start: u32, end: u32) -> DriverHandle {
        let (handle, region) = camera.allocate_region(desc().slot_bytes()).await.unwrap();
        camera.enqueue(handle, region, start, end, desc()).await.unwrap();
        handle
    }

    #[tokio::test]
    async fn live_transfers_need_recording_and_credit() {
        let camera = MockCamera::new(4, 2);
        let h = queued(&camera, 0, 0).await;

        camera.produce(1);
        assert!(camera.poll_status(h).await.unwrap().queued);

        camera.set_recording(true).await.unwrap();
        assert!(camera.poll_status(h).await.unwrap().ready);

        let region = camera.take_region(h).await.unwrap();
        let frames = split_region(&Bytes::copy_from_slice(region.as_slice()), &desc(), 1, Utc::now())
            .unwrap();
        assert_eq!(frames[0].0.image_number, 1);
    }

    #[tokio::test]
    async fn completions_follow_enqueue_order() {
        let camera = MockCamera::new(4, 2);
        camera.set_recording(true).await.unwrap();
        let a = queued(&camera, 0, 0).await;
        let b = queued(&camera, 0, 0).await;
        camera.produce(1);
        let ready = camera
            .wait_any(&[b, a], Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(ready, vec![a]);
    }

    #[tokio::test]
    async fn wait_any_times_out() {
        let camera = MockCamera::new(4, 2);
        let h = queued(&camera, 0, 0).await;
        let err = camera
            .wait_any(&[h], Duration::from_millis(2))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn budget_ends_recording() {
        let camera = MockCameraBuilder::new(4, 2)
            .auto_produce(true)
            .frame_budget(1)
            .build();
        camera.set_recording(true).await.unwrap();
        let a = queued(&camera, 0, 0).await;
        let b = queued(&camera, 0, 0).await;
        assert!(camera.poll_status(a).await.unwrap().ready);
        assert!(camera.poll_status(b).await.unwrap().queued);
        assert!(!camera.is_recording().await.unwrap());
    }

    #[tokio::test]
    async fn segment_reads_complete_without_recording() {
        let camera = MockCamera::new(4, 2);
        camera.record_without_transfer(3);
        let h = queued(&camera, 2, 2).await;
        assert!(camera.poll_status(h).await.unwrap().ready);
        let region = camera.take_region(h).await.unwrap();
        let frames = split_region(&Bytes::copy_from_slice(region.as_slice()), &desc(), 1, Utc::now())
            .unwrap();
        assert_eq!(frames[0].0.image_number, 2);
        assert_eq!(camera.recorded_image_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn free_reports_cancel_and_unknown() {
        let camera = MockCamera::new(4, 2);
        let h = queued(&camera, 0, 0).await;
        assert_eq!(
            camera.free(h).await.unwrap_err().code,
            codes::BUFFER_CANCELLED
        );
        assert_eq!(
            camera.free(h).await.unwrap_err().code,
            codes::BUFFER_UNAVAILABLE
        );
        assert_eq!(camera.live_handles(), 0);
    }

    #[tokio::test]
    async fn injected_failure_hits_nth_call() {
        let camera = MockCamera::new(4, 2);
        camera.fail_nth(MockOp::Allocate, 2, codes::HARDWARE_FAULT);
        assert!(camera.allocate_region(8).await.is_ok());
        assert_eq!(
            camera.allocate_region(8).await.unwrap_err().code,
            codes::HARDWARE_FAULT
        );
        assert!(camera.allocate_region(8).await.is_ok());
    }

    #[tokio::test]
    async fn persistent_failure_until_cleared() {
        let camera = MockCamera::new(4, 2);
        let h = queued(&camera, 0, 0).await;
        camera.fail_always(MockOp::Poll, codes::TIMEOUT);
        for _ in 0..3 {
            assert!(camera.poll_status(h).await.unwrap_err().is_timeout());
        }
        assert!(camera
            .wait_any(&[h], Duration::from_millis(1))
            .await
            .unwrap_err()
            .is_timeout());
        camera.clear_failures();
        assert!(camera.poll_status(h).await.unwrap().queued);
    }

    #[tokio::test]
    async fn settings_are_clamped_to_camera_limits() {
        let camera = MockCameraBuilder::new(64, 64).max_bit_depth(12).build();
        let settings = CameraSettings {
            roi: Roi::full(64, 64),
            bit_depth: 16,
            ..Default::default()
        };
        camera.apply_settings(&settings).await.unwrap();
        assert_eq!(camera.read_settings().await.unwrap().bit_depth, 12);

        let too_big = CameraSettings {
            roi: Roi::full(65, 64),
            ..Default::default()
        };
        assert_eq!(
            camera.apply_settings(&too_big).await.unwrap_err().code,
            codes::INVALID_PARAMETER
        );
    }
}
