use thiserror::Error;

/// Failure classes surfaced at the engine boundary.
///
/// Internal degradation (bad rows, sanity clamps, orphan drops) never becomes
/// an `Err`; it lands in logs and in the result set's `warnings`.
#[derive(Debug, Error)]
pub enum CostError {
    #[error("fatal input error: {0}")]
    FatalInput(String),

    #[error("accumulation error: {0}")]
    Accumulation(String),

    #[error("invalid window: {0}")]
    InvalidWindow(String),

    #[error("computation cancelled")]
    Cancelled,
}
