//! Streaming outputs for drained frames.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::AcqResult;
use crate::frame::{Frame, FrameTimestamp};

/// A frame together with its acquisition time.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedFrame {
    /// The frame after the transform.
    pub frame: Frame,
    /// When the frame was drained.
    pub timestamp: FrameTimestamp,
}

/// A consumer of drained frames.
///
/// Called from inside a scheduler tick, in drain order.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Deliver one frame. An error is logged and the tick carries on.
    async fn send(&self, frame: StampedFrame) -> AcqResult<()>;
}

/// Fans frames out over a tokio broadcast channel.
///
/// Receivers that fall behind lose frames (`RecvError::Lagged`); the pipeline
/// is never blocked by a slow subscriber.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Arc<StampedFrame>>,
}

impl BroadcastSink {
    /// Channel that keeps the last `capacity` frames for slow receivers.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New receiver for frames sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StampedFrame>> {
        self.tx.subscribe()
    }

    /// Live receivers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl FrameSink for BroadcastSink {
    async fn send(&self, frame: StampedFrame) -> AcqResult<()> {
        if self.tx.send(Arc::new(frame)).is_err() {
            trace!("No frame subscribers, frame dropped");
        }
        Ok(())
    }
}

/// Keeps every frame in memory.
#[derive(Default)]
pub struct CollectingSink {
    frames: Mutex<Vec<StampedFrame>>,
}

impl CollectingSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames received.
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// Whether nothing was received.
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Take everything collected so far.
    pub fn take(&self) -> Vec<StampedFrame> {
        std::mem::take(&mut *self.frames.lock())
    }
}

#[async_trait]
impl FrameSink for CollectingSink {
    async fn send(&self, frame: StampedFrame) -> AcqResult<()> {
        self.frames.lock().push(frame);
        Ok(())
    }
}
