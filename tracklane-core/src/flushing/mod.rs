//! Flushing of pending records
//!
//! [`FlushingManager`] owns the flush lock and the per-record retry policy;
//! the scheduling half (immediate, periodic, manual) lives in `schedule`.

mod manager;
mod schedule;

pub use manager::{CustomerIdentifiedHandler, FlushingManager};
