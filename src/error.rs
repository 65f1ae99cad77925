use thiserror::Error;

/// Errors surfaced by configuration validation or by a broken simulator invariant.
///
/// `Configuration` errors are raised before a single event is scheduled.
/// `InvariantViolation` errors are raised mid-run and always abort the simulation,
/// since they indicate a bug in the scheduler rather than a reachable runtime state.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl SimError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        SimError::Configuration(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        SimError::InvariantViolation(msg.into())
    }
}
