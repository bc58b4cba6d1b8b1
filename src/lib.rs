//! # frame_acq
//!
//! Camera frame acquisition: a fixed pool of driver-backed transfer buffers
//! is drained by a periodic scheduler into an in-memory frame store, while a
//! health monitor watches the camera and a session state machine guards the
//! settings.
//!
//! ## Crate Structure
//!
//! - **`pipeline`**: the public [`Pipeline`] handle (arm, start, stop, data access, hooks).
//! - **`scheduler`**: one drain tick and the periodic task that runs it.
//! - **`buffer_pool`** / **`buffer`**: transfer buffers lent to the driver and reclaimed on completion.
//! - **`frame`**: image trailers and splitting a drained region into frames.
//! - **`frame_store`**: growable store with consuming reads.
//! - **`health`**: decoding of the camera's error, warning and status flags.
//! - **`session`**: Idle / Armed / Running / Draining state machine.
//! - **`settings`**: camera settings, validation and read-back comparison.
//! - **`driver`**: traits a camera backend implements, plus driver error codes.
//! - **`sink`**, **`hooks`**: streaming outputs and user callbacks.
//! - **`config`**, **`logging`**, **`error`**: ambient configuration, tracing setup and errors.
//! - **`mock`** (feature `mock`): a simulated camera and health source.

pub mod buffer;
pub mod buffer_pool;
pub mod config;
pub mod driver;
pub mod error;
pub mod frame;
pub mod frame_store;
pub mod health;
pub mod hooks;
pub mod lock;
pub mod logging;
pub mod pipeline;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod sink;

#[cfg(feature = "mock")]
pub mod mock;

pub use config::AcqConfig;
pub use error::{AcqError, AcqResult};
pub use frame::{Frame, FrameTimestamp};
pub use health::HealthSnapshot;
pub use hooks::{HookKind, HookPayload};
pub use pipeline::{Pipeline, PipelineStats};
pub use scheduler::TickOutcome;
pub use session::SessionState;
pub use settings::{CameraSettings, StorageMode};
