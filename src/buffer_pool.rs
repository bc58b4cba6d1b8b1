//! Bounded pool of transfer buffers.
//!
//! The pool owns up to [`MAX_BUFFERS`] buffers, keyed by a monotonically
//! increasing [`BufferId`]. It drives the transfer driver for every buffer
//! state change:
//!
//! ```text
//! allocate -> Allocated --enqueue--> Queued --poll--> Ready --drain--> Allocated
//!                                                                   \--free--> removed
//! ```
//!
//! `pending_count` tracks how many buffers are currently queued with the
//! driver. Regions of queued buffers live inside the driver. The driver
//! completes transfers in queue order, so ready buffers are reported in the
//! order they were queued.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::buffer::{Buffer, BufferId, BufferState, MAX_BUFFERS};
use crate::driver::{DriverError, DriverHandle, TransferDriver};
use crate::error::{AcqError, AcqResult};
use crate::settings::ImageDescriptor;

/// Content of one drained buffer.
#[derive(Debug, Clone)]
pub struct Drained {
    /// Buffer the frames came from.
    pub id: BufferId,
    /// Image slots the buffer was sized for.
    pub images: usize,
    /// Region content as transferred.
    pub content: Bytes,
}

/// Running totals over the pool's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetrics {
    /// Handles allocated since the pool was created.
    pub allocated: u64,
    /// Handles released.
    pub freed: u64,
    /// Transfers queued.
    pub enqueued: u64,
    /// Completed transfers taken back.
    pub drained: u64,
}

/// Pool of buffers bound to one transfer driver.
pub struct BufferPool {
    driver: Arc<dyn TransferDriver>,
    buffers: BTreeMap<BufferId, Buffer>,
    descriptor: ImageDescriptor,
    next_id: u32,
    pending_count: usize,
    /// Queue sequence number of each queued buffer.
    queue_order: BTreeMap<BufferId, u64>,
    next_seq: u64,
    metrics: PoolMetrics,
}

impl BufferPool {
    /// Empty pool for images of `descriptor`.
    pub fn new(driver: Arc<dyn TransferDriver>, descriptor: ImageDescriptor) -> Self {
        Self {
            driver,
            buffers: BTreeMap::new(),
            descriptor,
            next_id: 1,
            pending_count: 0,
            queue_order: BTreeMap::new(),
            next_seq: 0,
            metrics: PoolMetrics::default(),
        }
    }

    /// Geometry buffers are sized for.
    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    /// Change the image geometry used for future allocations and `reallocate`.
    pub fn set_descriptor(&mut self, descriptor: ImageDescriptor) {
        self.descriptor = descriptor;
    }

    /// Number of buffers in the pool.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the pool holds no buffers.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Number of buffers currently queued with the driver.
    pub fn pending_count(&self) -> usize {
        self.pending_count
    }

    /// Lifetime counters.
    pub fn metrics(&self) -> PoolMetrics {
        self.metrics
    }

    /// All buffer ids in ascending order.
    pub fn ids(&self) -> Vec<BufferId> {
        self.buffers.keys().copied().collect()
    }

    /// Look up a buffer by id.
    pub fn get(&self, id: BufferId) -> Option<&Buffer> {
        self.buffers.get(&id)
    }

    /// Total bytes of all regions, lent out or not.
    pub fn region_bytes(&self) -> usize {
        self.buffers.values().map(Buffer::region_len).sum()
    }

    /// Allocate `n` buffers of `images_per_buffer` image slots each.
    ///
    /// The pool is left unchanged when the request would exceed the limit or
    /// when the driver fails part way.
    pub async fn allocate(&mut self, n: usize, images_per_buffer: usize) -> AcqResult<Vec<BufferId>> {
        if images_per_buffer == 0 {
            return Err(AcqError::Configuration(
                "images_per_buffer must be at least 1".to_string(),
            ));
        }
        let available = MAX_BUFFERS - self.buffers.len();
        if n > available {
            return Err(AcqError::CapacityExceeded {
                requested: n,
                available,
            });
        }

        let size = self.descriptor.region_bytes(images_per_buffer);
        let mut created = Vec::with_capacity(n);
        for _ in 0..n {
            match self.driver.allocate_region(size).await {
                Ok((handle, region)) => {
                    let id = BufferId(self.next_id);
                    self.next_id += 1;
                    self.buffers
                        .insert(id, Buffer::new(id, handle, images_per_buffer, region));
                    created.push(id);
                }
                Err(err) => {
                    warn!(error = %err, allocated = created.len(), "Buffer allocation failed, rolling back");
                    for id in &created {
                        if let Some(buffer) = self.buffers.remove(id) {
                            self.release_handle(buffer.handle()).await.ok();
                        }
                    }
                    return Err(err.into());
                }
            }
        }

        self.metrics.allocated += created.len() as u64;
        info!(
            count = created.len(),
            images_per_buffer,
            region_bytes = size,
            total_mb = (size * created.len()) as f64 / (1024.0 * 1024.0),
            "Buffers allocated"
        );
        Ok(created)
    }

    /// Resize buffers whose region no longer matches the descriptor.
    ///
    /// Queued buffers are skipped. Returns the ids that were resized.
    pub async fn reallocate(&mut self, ids: &[BufferId]) -> AcqResult<Vec<BufferId>> {
        let mut resized = Vec::new();
        for &id in ids {
            let (state, images, len, handle) = match self.buffers.get(&id) {
                Some(buf) => (buf.state(), buf.images(), buf.region_len(), buf.handle()),
                None => return Err(AcqError::NotAllocated(id)),
            };
            if state == BufferState::Queued {
                debug!(buffer_id = %id, "Skipping reallocation of queued buffer");
                continue;
            }
            let required = self.descriptor.region_bytes(images);
            if len == required {
                continue;
            }

            // The old handle stays valid until its replacement exists.
            let (new_handle, region) = self.driver.allocate_region(required).await?;
            if let Some(buf) = self.buffers.get_mut(&id) {
                buf.replace(new_handle, images, region);
            }
            if let Err(err) = self.release_handle(handle).await {
                warn!(buffer_id = %id, handle = %handle, error = %err, "Failed to release replaced region");
            }
            debug!(buffer_id = %id, from = len, to = required, "Buffer reallocated");
            resized.push(id);
        }
        Ok(resized)
    }

    /// Queue a transfer into buffer `id`.
    ///
    /// `(0, 0)` requests live images; otherwise a 1-based recorder range.
    pub async fn enqueue(&mut self, id: BufferId, start_index: u32, end_index: u32) -> AcqResult<()> {
        let descriptor = self.descriptor;
        let buffer = self
            .buffers
            .get_mut(&id)
            .ok_or(AcqError::NotAllocated(id))?;
        let handle = buffer.handle();
        let region = buffer.lend().ok_or(AcqError::NotAllocated(id))?;

        match self
            .driver
            .enqueue(handle, region, start_index, end_index, descriptor)
            .await
        {
            Ok(()) => {
                self.pending_count += 1;
                self.queue_order.insert(id, self.next_seq);
                self.next_seq += 1;
                self.metrics.enqueued += 1;
                debug!(buffer_id = %id, start_index, end_index, "Buffer queued");
                Ok(())
            }
            Err(rejected) => {
                if let Some(buffer) = self.buffers.get_mut(&id) {
                    buffer.reclaim(rejected.region);
                }
                Err(rejected.error.into())
            }
        }
    }

    /// Queue every `Allocated` buffer for live transfer, in id order.
    pub async fn enqueue_all(&mut self) -> AcqResult<usize> {
        let ids: Vec<BufferId> = self
            .buffers
            .values()
            .filter(|b| b.state() == BufferState::Allocated)
            .map(Buffer::id)
            .collect();
        for &id in &ids {
            self.enqueue(id, 0, 0).await?;
        }
        Ok(ids.len())
    }

    /// Find buffers among `ids` whose transfer completed.
    ///
    /// A zero `timeout` checks each queued buffer without blocking; otherwise
    /// the driver waits up to `timeout` for any of them. A driver timeout
    /// yields an empty result. Ready buffers get their regions back.
    pub async fn poll(&mut self, ids: &[BufferId], timeout: Duration) -> AcqResult<Vec<BufferId>> {
        let mut queued: Vec<(BufferId, DriverHandle)> = ids
            .iter()
            .filter_map(|id| self.buffers.get(id))
            .filter(|b| b.state() == BufferState::Queued)
            .map(|b| (b.id(), b.handle()))
            .collect();
        queued.sort_by_key(|(id, _)| self.queue_order.get(id).copied().unwrap_or(u64::MAX));
        if queued.is_empty() {
            return Ok(Vec::new());
        }

        let ready: Vec<(BufferId, DriverHandle)> = if timeout.is_zero() {
            let mut ready = Vec::new();
            for &(id, handle) in &queued {
                let status = match self.driver.poll_status(handle).await {
                    Ok(status) => status,
                    Err(err) if err.is_timeout() => {
                        debug!(buffer_id = %id, "Status check timed out");
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };
                if let Some(err) = status.error {
                    if !err.is_timeout() {
                        return Err(err.into());
                    }
                }
                if status.ready {
                    ready.push((id, handle));
                }
            }
            ready
        } else {
            let handles: Vec<DriverHandle> = queued.iter().map(|(_, h)| *h).collect();
            match self.driver.wait_any(&handles, timeout).await {
                Ok(done) => queued
                    .iter()
                    .filter(|(_, h)| done.contains(h))
                    .copied()
                    .collect(),
                Err(err) if err.is_timeout() => {
                    debug!(queued = queued.len(), "Poll timed out");
                    Vec::new()
                }
                Err(err) => return Err(err.into()),
            }
        };

        let mut ready_ids = Vec::with_capacity(ready.len());
        for (id, handle) in ready {
            let region = self.driver.take_region(handle).await?;
            if let Some(buffer) = self.buffers.get_mut(&id) {
                buffer.restore(region);
                self.pending_count = self.pending_count.saturating_sub(1);
                self.queue_order.remove(&id);
                ready_ids.push(id);
            }
        }
        Ok(ready_ids)
    }

    /// Copy out the content of a ready buffer and return it to `Allocated`.
    pub fn drain(&mut self, id: BufferId) -> AcqResult<Drained> {
        let buffer = self
            .buffers
            .get_mut(&id)
            .ok_or(AcqError::NotAllocated(id))?;
        let images = buffer.images();
        let content = buffer.drain().ok_or(AcqError::NotAllocated(id))?;
        self.metrics.drained += 1;
        Ok(Drained { id, images, content })
    }

    /// Free the given buffers. Absent ids are ignored without a driver call.
    ///
    /// "Buffer unavailable" and "buffer cancelled" count as already free.
    /// Any other driver error is returned after every id was processed; the
    /// failing buffer is removed from the pool regardless. Returns the ids
    /// still in the pool.
    pub async fn free(&mut self, ids: &[BufferId]) -> AcqResult<Vec<BufferId>> {
        let mut first_error: Option<DriverError> = None;
        for &id in ids {
            if let Err(err) = self.free_one(id).await {
                warn!(buffer_id = %id, error = %err, "Failed to free buffer");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(self.ids()),
        }
    }

    /// Free every buffer. Errors are logged, never returned.
    pub async fn free_all(&mut self) -> usize {
        let ids = self.ids();
        let count = ids.len();
        for id in ids {
            if let Err(err) = self.free_one(id).await {
                warn!(buffer_id = %id, error = %err, "Best-effort free failed");
            }
        }
        if count > 0 {
            info!(count, "All buffers freed");
        }
        count
    }

    async fn free_one(&mut self, id: BufferId) -> Result<(), DriverError> {
        let Some(mut buffer) = self.buffers.remove(&id) else {
            return Ok(());
        };
        if buffer.state() == BufferState::Queued {
            self.pending_count = self.pending_count.saturating_sub(1);
        }
        self.queue_order.remove(&id);
        drop(buffer.mark_pending_free());
        self.metrics.freed += 1;
        self.release_handle(buffer.handle()).await
    }

    async fn release_handle(&self, handle: DriverHandle) -> Result<(), DriverError> {
        match self.driver.free(handle).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_benign_on_free() => {
                debug!(handle = %handle, error = %err, "Handle already free");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::driver::{codes, CameraDevice};
    use crate::mock::{DriverCall, MockCamera, MockOp};

    fn descriptor() -> ImageDescriptor {
        ImageDescriptor {
            width: 4,
            height: 4,
            bit_depth: 16,
        }
    }

    fn pool(camera: &Arc<MockCamera>) -> BufferPool {
        BufferPool::new(camera.clone(), descriptor())
    }

    #[tokio::test]
    async fn allocate_assigns_monotonic_ids() {
        let camera = Arc::new(MockCamera::new(4, 4));
        let mut pool = pool(&camera);
        let first = pool.allocate(2, 1).await.unwrap();
        let second = pool.allocate(1, 2).await.unwrap();
        assert_eq!(first, vec![BufferId(1), BufferId(2)]);
        assert_eq!(second, vec![BufferId(3)]);
        assert_eq!(
            pool.get(BufferId(3)).unwrap().region_len(),
            descriptor().region_bytes(2)
        );
    }

    #[tokio::test]
    async fn allocate_beyond_limit_leaves_pool_unchanged() {
        let camera = Arc::new(MockCamera::new(4, 4));
        let mut pool = pool(&camera);
        pool.allocate(15, 1).await.unwrap();
        let err = pool.allocate(2, 1).await.unwrap_err();
        assert!(matches!(
            err,
            AcqError::CapacityExceeded {
                requested: 2,
                available: 1
            }
        ));
        assert_eq!(pool.len(), 15);
        pool.allocate(1, 1).await.unwrap();
        assert_eq!(pool.len(), MAX_BUFFERS);
    }

    #[tokio::test]
    async fn failed_allocation_rolls_back() {
        let camera = Arc::new(MockCamera::new(4, 4));
        let mut pool = pool(&camera);
        camera.fail_nth(MockOp::Allocate, 2, codes::HARDWARE_FAULT);
        assert!(pool.allocate(3, 1).await.is_err());
        assert!(pool.is_empty());
        assert_eq!(camera.live_handles(), 0);
    }

    #[tokio::test]
    async fn free_is_idempotent() {
        let camera = Arc::new(MockCamera::new(4, 4));
        let mut pool = pool(&camera);
        let ids = pool.allocate(2, 1).await.unwrap();

        let remaining = pool.free(&ids[..1]).await.unwrap();
        assert_eq!(remaining, vec![ids[1]]);
        let frees_before = camera.count_calls(|c| matches!(c, DriverCall::Free(_)));

        let remaining = pool.free(&ids[..1]).await.unwrap();
        assert_eq!(remaining, vec![ids[1]]);
        let frees_after = camera.count_calls(|c| matches!(c, DriverCall::Free(_)));
        assert_eq!(frees_before, frees_after);
    }

    #[tokio::test]
    async fn free_of_queued_buffer_treats_cancel_as_success() {
        let camera = Arc::new(MockCamera::new(4, 4));
        let mut pool = pool(&camera);
        let ids = pool.allocate(1, 1).await.unwrap();
        pool.enqueue(ids[0], 0, 0).await.unwrap();
        assert_eq!(pool.pending_count(), 1);

        pool.free(&ids).await.unwrap();
        assert!(pool.is_empty());
        assert_eq!(pool.pending_count(), 0);
    }

    #[tokio::test]
    async fn free_surfaces_non_benign_errors_but_removes_buffer() {
        let camera = Arc::new(MockCamera::new(4, 4));
        let mut pool = pool(&camera);
        let ids = pool.allocate(2, 1).await.unwrap();
        camera.fail_next(MockOp::Free, codes::HARDWARE_FAULT);

        let err = pool.free(&ids).await.unwrap_err();
        assert!(matches!(err, AcqError::Driver(e) if e.code == codes::HARDWARE_FAULT));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn enqueue_requires_allocated_state() {
        let camera = Arc::new(MockCamera::new(4, 4));
        let mut pool = pool(&camera);
        let ids = pool.allocate(1, 1).await.unwrap();
        pool.enqueue(ids[0], 0, 0).await.unwrap();
        assert!(matches!(
            pool.enqueue(ids[0], 0, 0).await,
            Err(AcqError::NotAllocated(id)) if id == ids[0]
        ));
        assert!(matches!(
            pool.enqueue(BufferId(99), 0, 0).await,
            Err(AcqError::NotAllocated(_))
        ));
    }

    #[tokio::test]
    async fn rejected_enqueue_returns_region() {
        let camera = Arc::new(MockCamera::new(4, 4));
        let mut pool = pool(&camera);
        let ids = pool.allocate(1, 1).await.unwrap();
        camera.fail_next(MockOp::Enqueue, codes::TRANSFER_FAILED);

        assert!(pool.enqueue(ids[0], 0, 0).await.is_err());
        let buffer = pool.get(ids[0]).unwrap();
        assert_eq!(buffer.state(), BufferState::Allocated);
        assert!(buffer.holds_region());
        assert_eq!(pool.pending_count(), 0);
    }

    #[tokio::test]
    async fn poll_and_drain_follow_completion_order() {
        let camera = Arc::new(MockCamera::new(4, 4));
        let mut pool = pool(&camera);
        let ids = pool.allocate(3, 1).await.unwrap();
        pool.enqueue_all().await.unwrap();
        camera.set_recording(true).await.unwrap();
        camera.produce(2);

        let ready = pool.poll(&ids, Duration::ZERO).await.unwrap();
        assert_eq!(ready, vec![ids[0], ids[1]]);
        assert_eq!(pool.pending_count(), 1);

        let drained = pool.drain(ready[0]).unwrap();
        assert_eq!(drained.content.len(), descriptor().slot_bytes());
        assert_eq!(pool.get(ids[0]).unwrap().state(), BufferState::Allocated);
        assert!(pool.drain(ids[2]).is_err());
    }

    #[tokio::test]
    async fn requeued_buffer_reports_after_earlier_queued_ones() {
        let camera = Arc::new(MockCamera::new(4, 4));
        let mut pool = pool(&camera);
        let ids = pool.allocate(2, 1).await.unwrap();
        pool.enqueue_all().await.unwrap();
        camera.set_recording(true).await.unwrap();

        camera.produce(1);
        assert_eq!(pool.poll(&ids, Duration::ZERO).await.unwrap(), vec![ids[0]]);
        pool.drain(ids[0]).unwrap();
        pool.enqueue(ids[0], 0, 0).await.unwrap();

        camera.produce(2);
        let ready = pool.poll(&ids, Duration::ZERO).await.unwrap();
        assert_eq!(ready, vec![ids[1], ids[0]]);
    }

    #[tokio::test]
    async fn waiting_poll_times_out_empty() {
        let camera = Arc::new(MockCamera::new(4, 4));
        let mut pool = pool(&camera);
        let ids = pool.allocate(1, 1).await.unwrap();
        pool.enqueue_all().await.unwrap();

        let ready = pool.poll(&ids, Duration::from_millis(5)).await.unwrap();
        assert!(ready.is_empty());
        assert_eq!(pool.pending_count(), 1);
    }

    #[tokio::test]
    async fn reallocate_skips_queued_and_matching_buffers() {
        let camera = Arc::new(MockCamera::new(8, 8));
        let mut pool = pool(&camera);
        let ids = pool.allocate(3, 1).await.unwrap();
        pool.enqueue(ids[0], 0, 0).await.unwrap();

        assert!(pool.reallocate(&ids).await.unwrap().is_empty());

        pool.set_descriptor(ImageDescriptor {
            width: 8,
            height: 8,
            bit_depth: 16,
        });
        let resized = pool.reallocate(&ids).await.unwrap();
        assert_eq!(resized, vec![ids[1], ids[2]]);
        assert_eq!(
            pool.get(ids[1]).unwrap().region_len(),
            pool.descriptor().slot_bytes()
        );
        assert_eq!(
            pool.get(ids[0]).unwrap().region_len(),
            descriptor().slot_bytes()
        );
    }
    #[tokio::test]
    async fn zero_wait_poll_treats_timeout_as_not_ready() {
        let camera = Arc::new(MockCamera::new(4, 4));
        let mut pool = pool(&camera);
        let ids = pool.allocate(2, 1).await.unwrap();
        pool.enqueue_all().await.unwrap();
        camera.set_recording(true).await.unwrap();
        camera.produce(2);
        camera.fail_next(MockOp::Poll, codes::TIMEOUT);

        let ready = pool.poll(&ids, Duration::ZERO).await.unwrap();
        assert_eq!(ready, vec![ids[1]]);
        assert_eq!(pool.pending_count(), 1);
        assert_eq!(pool.poll(&ids, Duration::ZERO).await.unwrap(), vec![ids[0]]);

        pool.drain(ids[0]).unwrap();
        pool.enqueue(ids[0], 0, 0).await.unwrap();
        camera.fail_next(MockOp::Poll, codes::HARDWARE_FAULT);
        assert!(matches!(
            pool.poll(&ids, Duration::ZERO).await,
            Err(AcqError::Driver(e)) if e.code == codes::HARDWARE_FAULT
        ));
    }

    #[tokio::test]
    async fn failed_reallocation_keeps_the_old_handle() {
        let camera = Arc::new(MockCamera::new(8, 8));
        let mut pool = pool(&camera);
        let ids = pool.allocate(1, 1).await.unwrap();
        let old_handle = pool.get(ids[0]).unwrap().handle();

        pool.set_descriptor(ImageDescriptor {
            width: 8,
            height: 8,
            bit_depth: 16,
        });
        camera.fail_next(MockOp::Allocate, codes::HARDWARE_FAULT);
        assert!(pool.reallocate(&ids).await.is_err());

        let buffer = pool.get(ids[0]).unwrap();
        assert_eq!(buffer.handle(), old_handle);
        assert_eq!(buffer.state(), BufferState::Allocated);
        assert_eq!(buffer.region_len(), descriptor().slot_bytes());
        assert_eq!(camera.live_handles(), 1);
        assert_eq!(camera.count_calls(|c| matches!(c, DriverCall::Free(_))), 0);

        assert_eq!(pool.reallocate(&ids).await.unwrap(), ids);
        assert_ne!(pool.get(ids[0]).unwrap().handle(), old_handle);
        assert_eq!(camera.live_handles(), 1);
        pool.enqueue(ids[0], 0, 0).await.unwrap();
    }
}
