//! In-crate simulated devices for tests and the CLI.

pub mod camera;
pub mod health;
pub mod pattern;

pub use camera::{DriverCall, MockCamera, MockCameraBuilder, MockOp};
pub use health::MockHealth;
pub use pattern::generate_test_pattern;
