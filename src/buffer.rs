//! A single transfer buffer and the raw region it owns.
//!
//! The region is owned by the [`Buffer`] while it is `Allocated` or `Ready`
//! and moved out to the transfer driver while `Queued`. A queued buffer has
//! no region on the host side, so it cannot be read, resized or freed by
//! accident.

use bytes::Bytes;

use crate::driver::DriverHandle;

/// Hard limit on buffers per pool.
pub const MAX_BUFFERS: usize = 16;

/// Stable buffer identifier, monotonically increasing per pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Host holds the region; the buffer can be queued, resized or freed.
    Allocated,
    /// The region is lent to the driver for a transfer.
    Queued,
    /// The transfer completed and the region is back on the host.
    Ready,
    /// Removed from the pool; the handle is being released.
    PendingFree,
}

impl std::fmt::Display for BufferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            BufferState::Allocated => "allocated",
            BufferState::Queued => "queued",
            BufferState::Ready => "ready",
            BufferState::PendingFree => "pending_free",
        };
        write!(f, "{}", label)
    }
}

/// Raw byte region a driver transfers images into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    data: Vec<u8>,
}

impl Region {
    /// Zero-filled region of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            data: vec![0u8; len],
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the region has no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read-only view of the bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view of the bytes, for drivers filling the region.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// One buffer bound to a driver handle.
#[derive(Debug)]
pub struct Buffer {
    id: BufferId,
    handle: DriverHandle,
    images: usize,
    state: BufferState,
    region: Option<Region>,
    len: usize,
}

impl Buffer {
    pub(crate) fn new(id: BufferId, handle: DriverHandle, images: usize, region: Region) -> Self {
        Self {
            id,
            handle,
            images,
            state: BufferState::Allocated,
            len: region.len(),
            region: Some(region),
        }
    }

    /// Pool-assigned identifier.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Driver handle backing the region.
    pub fn handle(&self) -> DriverHandle {
        self.handle
    }

    /// Image slots the region holds.
    pub fn images(&self) -> usize {
        self.images
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Region length in bytes, known even while the region is lent out.
    pub fn region_len(&self) -> usize {
        self.len
    }

    /// Whether the host currently holds the region.
    pub fn holds_region(&self) -> bool {
        self.region.is_some()
    }

    /// Move the region out for a transfer. `None` unless `Allocated`.
    pub(crate) fn lend(&mut self) -> Option<Region> {
        if self.state != BufferState::Allocated {
            return None;
        }
        let region = self.region.take()?;
        self.state = BufferState::Queued;
        Some(region)
    }

    /// Put back a region the driver refused to queue.
    pub(crate) fn reclaim(&mut self, region: Region) {
        self.region = Some(region);
        self.state = BufferState::Allocated;
    }

    /// Put back a region whose transfer completed.
    pub(crate) fn restore(&mut self, region: Region) {
        self.len = region.len();
        self.region = Some(region);
        self.state = BufferState::Ready;
    }

    /// Copy the region content out and return to `Allocated`.
    pub(crate) fn drain(&mut self) -> Option<Bytes> {
        if self.state != BufferState::Ready {
            return None;
        }
        let content = Bytes::copy_from_slice(self.region.as_ref()?.as_slice());
        self.state = BufferState::Allocated;
        Some(content)
    }

    /// Swap in a new region of a different size. Only legal while the host holds it.
    pub(crate) fn replace(&mut self, handle: DriverHandle, images: usize, region: Region) {
        self.handle = handle;
        self.images = images;
        self.len = region.len();
        self.region = Some(region);
        self.state = BufferState::Allocated;
    }

    /// Take the region back for release and mark the buffer as leaving the pool.
    pub(crate) fn mark_pending_free(&mut self) -> Option<Region> {
        self.state = BufferState::PendingFree;
        self.region.take()
    }
}
