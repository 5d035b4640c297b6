//! Domain types shared between the store, the scheduler, and the API layer.

pub mod artifact;
pub mod gpu;
pub mod job;

/// Current wall-clock time as fractional seconds since the Unix epoch.
///
/// All job timestamps are stored in this form (REAL columns in the store).
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
