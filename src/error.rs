use std::time::Duration;

/// Typed failures surfaced by the store, the authenticator and the module registry
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Key not found: {bucket}/{key}")]
    KeyNotFound { bucket: String, key: String },

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No active session")]
    SessionNotFound,

    #[error("Session expired")]
    SessionExpired,

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("No credential registered for user {0}")]
    CredentialNotFound(String),

    #[error("Challenge expired or not found")]
    ChallengeExpired,

    #[error("Challenge mismatch")]
    ChallengeMismatch,

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Sign count replay detected (stored {stored}, received {received})")]
    SignCountReplay { stored: u32, received: u32 },

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Module disabled: {0}")]
    ModuleDisabled(String),

    #[error("Module already loaded: {0}")]
    ModuleAlreadyLoaded(String),

    #[error("Module {module} failed to initialize: {reason}")]
    ModuleInitialization { module: String, reason: String },

    #[error("Action not found: {module}.{action}")]
    ActionNotFound { module: String, action: String },

    #[error("Action failed: {module}.{action}: {reason}")]
    ActionFailed {
        module: String,
        action: String,
        reason: String,
    },

    #[error("Action timeout after {}ms: {module}.{action}", .after.as_millis())]
    Timeout {
        module: String,
        action: String,
        after: Duration,
    },
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Whether this error originates from a failed ceremony or session lookup
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            AgentError::SessionNotFound
                | AgentError::SessionExpired
                | AgentError::InvalidCredentials(_)
                | AgentError::CredentialNotFound(_)
                | AgentError::ChallengeExpired
                | AgentError::ChallengeMismatch
                | AgentError::RegistrationFailed(_)
                | AgentError::SignCountReplay { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use predicates::prelude::*;

    #[test]
    fn timeout_message_mentions_timeout() {
        let err = AgentError::Timeout {
            module: "system".to_string(),
            action: "sleep".to_string(),
            after: Duration::from_millis(1000),
        };

        let message = err.to_string();
        assert!(predicate::str::contains("timeout").eval(&message));
        assert!(predicate::str::contains("1000ms").eval(&message));
        assert!(predicate::str::contains("system.sleep").eval(&message));
    }

    #[test]
    fn auth_failures_are_classified() {
        assert!(AgentError::SessionExpired.is_auth_failure());
        assert!(AgentError::SignCountReplay { stored: 3, received: 3 }.is_auth_failure());
        assert!(!AgentError::ModuleNotFound("x".to_string()).is_auth_failure());
        assert!(!AgentError::BucketNotFound("x".to_string()).is_auth_failure());
    }
}
