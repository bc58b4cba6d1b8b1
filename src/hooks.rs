//! User callbacks and the frame transform.
//!
//! Hooks are always invoked with the pipeline lock released, so a hook may
//! call back into the [`Pipeline`] (for example `get_data`).

use std::sync::Arc;

use crate::frame::Frame;
use crate::health::HealthSnapshot;
use crate::pipeline::Pipeline;

/// Data handed to a hook.
#[derive(Debug, Clone)]
pub enum HookPayload {
    /// Frames drained by the last tick.
    Frames {
        /// Frames drained by this tick.
        count: usize,
        /// Frames acquired in the run so far.
        run_total: u64,
    },
    /// A fatal error ended the session.
    Error {
        /// Rendered error.
        message: String,
        /// Health read after the failure, if any.
        health: Option<HealthSnapshot>,
    },
    /// Health at session start or end.
    Health(HealthSnapshot),
}

/// User callback.
pub type Hook = Arc<dyn Fn(&Pipeline, Option<&HookPayload>) + Send + Sync>;

/// Applied to every drained frame before it is stored or streamed.
pub type FrameTransform = Arc<dyn Fn(Frame) -> Frame + Send + Sync>;

/// Selects one of the hook slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Session started.
    Start,
    /// Session ended normally.
    Stop,
    /// Session ended by a fatal error.
    Error,
    /// A tick drained frames.
    FramesAcquired,
    /// Every scheduler tick.
    Tick,
}

/// Registered hooks, one slot per kind.
#[derive(Default, Clone)]
pub struct Hooks {
    on_start: Option<Hook>,
    on_stop: Option<Hook>,
    on_error: Option<Hook>,
    on_frames_acquired: Option<Hook>,
    on_tick: Option<Hook>,
}

impl Hooks {
    /// Install or clear a hook.
    pub fn set(&mut self, kind: HookKind, hook: Option<Hook>) {
        *self.slot(kind) = hook;
    }

    /// Clone of the hook in a slot.
    pub fn get(&self, kind: HookKind) -> Option<Hook> {
        match kind {
            HookKind::Start => self.on_start.clone(),
            HookKind::Stop => self.on_stop.clone(),
            HookKind::Error => self.on_error.clone(),
            HookKind::FramesAcquired => self.on_frames_acquired.clone(),
            HookKind::Tick => self.on_tick.clone(),
        }
    }

    fn slot(&mut self, kind: HookKind) -> &mut Option<Hook> {
        match kind {
            HookKind::Start => &mut self.on_start,
            HookKind::Stop => &mut self.on_stop,
            HookKind::Error => &mut self.on_error,
            HookKind::FramesAcquired => &mut self.on_frames_acquired,
            HookKind::Tick => &mut self.on_tick,
        }
    }
}
