use std::time::Duration;

/// The main error type for keystep operations.
#[derive(Debug, thiserror::Error)]
pub enum MfaError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("MFA is not set up for this account")]
    NotSetUp,

    #[error("MFA is already enabled for this account")]
    AlreadyEnabled,

    #[error("Too many failed attempts; retry in {} seconds", retry_after.as_secs())]
    RateLimited {
        /// How long until verification is allowed again.
        retry_after: Duration,
    },

    #[error("Stored MFA secret could not be decrypted")]
    Decrypt,

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl MfaError {
    /// Whether the caller may retry the same call once the infrastructure
    /// recovers. `RateLimited` is deliberately not retriable: it clears on
    /// its own schedule, not on retry.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, MfaError::Persistence(_))
    }

    /// Whether this error was caused by the submitted value rather than the
    /// system. Keeps user failures and infrastructure failures apart in
    /// security dashboards.
    #[must_use]
    pub fn is_user_caused(&self) -> bool {
        matches!(
            self,
            MfaError::InvalidInput(_) | MfaError::NotSetUp | MfaError::AlreadyEnabled
        )
    }
}

/// A specialized Result type for keystep operations.
pub type Result<T> = std::result::Result<T, MfaError>;
