//! Diagnostics: per-system profiling and the editor debugger endpoint.

pub mod debugger;
pub mod profiler;

pub use debugger::handle_request;
pub use profiler::{SystemMetrics, WorldMetrics, world_metrics};
