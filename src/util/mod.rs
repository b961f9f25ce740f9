/// Tracing subscriber setup.
pub mod telemetry;

pub use telemetry::*;
