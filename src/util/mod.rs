//! General utility code
// (c) 2025 Ross Younger

pub(crate) mod process;
mod tracing;

pub use self::tracing::tracing_is_initialised;
pub(crate) use self::tracing::{setup_tracing, trace_level};
