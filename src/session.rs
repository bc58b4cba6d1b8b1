//! Acquisition session state machine.
//!
//! ```text
//!          arm            start          stop / natural end
//!   Idle ------> Armed ---------> Running -------------------> Draining
//!    ^  <------    |                 |                            |
//!    |  settings   | stop            | fatal error                | drain finished
//!    +-------------+-----------------+----------------------------+
//! ```
//!
//! The session itself does no I/O; the pipeline and scheduler drive the
//! device and call the transitions here.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AcqError, AcqResult};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SessionState {
    /// No settings applied.
    #[default]
    Idle,
    /// Settings applied and buffers allocated.
    Armed,
    /// Recording and draining.
    Running,
    /// Recording stopped; collecting the remaining frames.
    Draining,
}

impl SessionState {
    /// Running or draining: buffers are in use and settings are locked.
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Draining)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::Armed => "armed",
            SessionState::Running => "running",
            SessionState::Draining => "draining",
        };
        write!(f, "{}", label)
    }
}

/// Progress of a draining session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainPhase {
    /// Collecting transfers that were already in flight.
    #[default]
    Collecting,
    /// Reading hardware-resident images `next..=last` (1-based).
    FinalReadout {
        /// First image not yet queued.
        next: u64,
        /// Last image to read.
        last: u64,
    },
}

impl DrainPhase {
    /// Next recorder range of at most `images` images, or `None` once the
    /// final readout has nothing left to queue.
    pub fn next_slice(self, images: u32) -> Option<(u32, u32)> {
        let DrainPhase::FinalReadout { next, last } = self else {
            return None;
        };
        if next > last {
            return None;
        }
        let end = next.saturating_add(u64::from(images.max(1)) - 1).min(last);
        Some((u32::try_from(next).ok()?, u32::try_from(end).ok()?))
    }
}

/// Per-run counters, reset on every start.
#[derive(Debug, Clone, Serialize)]
pub struct RunCounters {
    /// Fresh for every start.
    pub run_id: Uuid,
    /// Wall-clock start.
    pub started_at: Option<DateTime<Utc>>,
    /// Frames drained so far.
    pub frames_acquired: u64,
    /// Consecutive ticks without a frame.
    pub stall_ticks: u32,
    /// Buffer rebuilds so far.
    pub self_heals: u32,
    /// Set once the first tick of the run queued the pool.
    #[serde(skip)]
    pub first_enqueue_done: bool,
}

impl Default for RunCounters {
    fn default() -> Self {
        Self {
            run_id: Uuid::nil(),
            started_at: None,
            frames_acquired: 0,
            stall_ticks: 0,
            self_heals: 0,
            first_enqueue_done: false,
        }
    }
}

impl RunCounters {
    fn fresh() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }
}

/// One acquisition session per pipeline.
#[derive(Debug, Default)]
pub struct AcquisitionSession {
    state: SessionState,
    phase: DrainPhase,
    run: RunCounters,
}

impl AcquisitionSession {
    /// Idle session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drain phase; meaningful while draining.
    pub fn phase(&self) -> DrainPhase {
        self.phase
    }

    /// Counters of the current run.
    pub fn run(&self) -> &RunCounters {
        &self.run
    }

    /// Mutable run counters.
    pub fn run_mut(&mut self) -> &mut RunCounters {
        &mut self.run
    }

    /// Idle or Armed -> Armed.
    pub fn arm(&mut self) -> AcqResult<()> {
        match self.state {
            SessionState::Idle | SessionState::Armed => {
                self.state = SessionState::Armed;
                Ok(())
            }
            state => Err(AcqError::InvalidState {
                operation: "arm",
                state,
            }),
        }
    }

    /// Armed -> Idle. Used when settings change.
    pub fn disarm(&mut self) {
        if self.state == SessionState::Armed {
            self.state = SessionState::Idle;
        }
    }

    /// Armed -> Running with fresh run counters.
    pub fn start(&mut self) -> AcqResult<()> {
        if self.state != SessionState::Armed {
            return Err(AcqError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        self.state = SessionState::Running;
        self.phase = DrainPhase::Collecting;
        self.run = RunCounters::fresh();
        Ok(())
    }

    /// Running -> Draining, Armed -> Idle, otherwise no change.
    ///
    /// Returns the state that was left.
    pub fn request_stop(&mut self) -> SessionState {
        let previous = self.state;
        match previous {
            SessionState::Running => {
                self.state = SessionState::Draining;
                self.phase = DrainPhase::Collecting;
            }
            SessionState::Armed => self.state = SessionState::Idle,
            SessionState::Idle | SessionState::Draining => {}
        }
        previous
    }

    /// Switch a draining session to reading images `next..=last` from camera memory.
    pub fn begin_final_readout(&mut self, next: u64, last: u64) -> AcqResult<()> {
        if self.state != SessionState::Draining {
            return Err(AcqError::InvalidState {
                operation: "begin final readout",
                state: self.state,
            });
        }
        self.phase = DrainPhase::FinalReadout { next, last };
        Ok(())
    }

    pub(crate) fn set_phase(&mut self, phase: DrainPhase) {
        self.phase = phase;
    }

    /// Draining -> Idle after a completed drain.
    pub fn finish(&mut self) {
        self.state = SessionState::Idle;
        self.phase = DrainPhase::Collecting;
    }

    /// Any state -> Idle on a fatal error.
    pub fn abort(&mut self) {
        self.state = SessionState::Idle;
        self.phase = DrainPhase::Collecting;
    }

    /// Fail when settings or buffers cannot be changed in the current state.
    pub fn ensure_editable(&self, operation: &'static str) -> AcqResult<()> {
        if self.state.is_active() {
            return Err(AcqError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }
}
