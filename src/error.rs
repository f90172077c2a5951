use thiserror::Error;

/// Convenience type alias for Results with StratoError
pub type Result<T> = std::result::Result<T, StratoError>;

/// Main error type for Strato Core
///
/// This enum represents all possible errors that can occur within
/// the orchestration engine and session store, providing detailed
/// error context for debugging and error handling.
#[derive(Error, Debug)]
pub enum StratoError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cloud provider error: {message}")]
    Provider { message: String },

    #[error("Node agent error: {message}")]
    NodeAgent { message: String },

    #[error("Task execution error: {task_id} - {message}")]
    TaskExecution { task_id: String, message: String },

    #[error("Provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("Workspace failed: {0}")]
    WorkspaceFailed(String),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Timeout error: {message}")]
    Timeout { message: String },

    #[error("Corrupt state: {0}")]
    CorruptState(String),

    #[error("Session store error: {message}")]
    SessionStore { message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,
}

/// How a step failure is treated by the orchestrator retry machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with exponential backoff within the current step.
    Transient,
    /// Fail the task; no retry will change the outcome.
    Permanent,
}

/// Message substrings that always indicate a permanent failure.
const PERMANENT_MARKERS: &[&str] = &[
    "not found",
    "limit_exceeded",
    "invalid",
    "forbidden",
    "unauthorized",
];

/// Message substrings that indicate a transient external condition.
const TRANSIENT_MARKERS: &[&str] = &[
    "fetch failed",
    "network",
    "timeout",
    "econnrefused",
    "enotfound",
    "500",
    "502",
    "503",
    "504",
    "429",
    "rate limit",
];

impl StratoError {
    /// Classify an error as transient or permanent for step retry purposes.
    ///
    /// Variants that carry an inherent class (limits, corrupt state, auth)
    /// short-circuit; everything else is classified by message content.
    /// Unknown errors default to transient so a flaky dependency gets the
    /// benefit of the retry budget.
    pub fn classify(&self) -> ErrorClass {
        match self {
            StratoError::LimitExceeded(_)
            | StratoError::CorruptState(_)
            | StratoError::NotFound(_)
            | StratoError::Validation(_)
            | StratoError::ProvisioningFailed(_)
            | StratoError::WorkspaceFailed(_)
            | StratoError::Unauthorized => ErrorClass::Permanent,
            // Step wall-clock deadlines; network timeouts surface as Http or
            // marker-matched messages and stay transient.
            StratoError::Timeout { .. } => ErrorClass::Permanent,
            StratoError::Http(e) => {
                if e.is_timeout() || e.is_connect() {
                    ErrorClass::Transient
                } else {
                    classify_message(&e.to_string())
                }
            }
            other => classify_message(&other.to_string()),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.classify() == ErrorClass::Permanent
    }
}

fn classify_message(message: &str) -> ErrorClass {
    let lowered = message.to_lowercase();

    if PERMANENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return ErrorClass::Permanent;
    }
    if TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return ErrorClass::Transient;
    }

    // Default when unknown: transient
    ErrorClass::Transient
}
