//! Error types.
//!
//! The runtime itself raises exactly one error: [`ClearingError`], injected
//! into every coroutine that wakes while the driver is tearing the world
//! down. Task bodies propagate it with `?`, which unwinds their frames and
//! forwards the error to any awaiter — the chain of awaiting coroutines
//! collapses one frame at a time until everything parked on the cleared
//! driver has been reclaimed.
//!
//! Application-level failures are ordinary values: a task that can fail
//! returns its own `Result` as its output type.

/// Raised at an await site when the coroutine is resumed while the driver
/// is clearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("driver is clearing; coroutine unwound")]
pub struct ClearingError;

/// Result alias for task bodies and await sites.
pub type Result<T> = std::result::Result<T, ClearingError>;
