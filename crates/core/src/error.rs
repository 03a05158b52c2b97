//! Engine-level errors.
//!
//! Job failures never surface here; they are reported through the
//! terminal [`ExecutedCmd`](crate::domain::ExecutedCmd). An
//! [`EngineError`] means the caller misused the executor and no
//! terminal status was published.

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `start()` was invoked on an executor that already ran. An
    /// executor instance is single-shot.
    #[error("executor for cmd {0} has already been started")]
    AlreadyStarted(String),
}
