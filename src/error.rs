use thiserror::Error;

/// Failures surfaced by the reconciliation engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// No stored credentials for the environment; the connection check stops here
    #[error("no credentials configured for environment '{environment}'")]
    NoCredentials { environment: String },

    #[error("connection failed: {0}")]
    ConnectionFailure(String),

    #[error("not connected to Vault")]
    ConnectionRequired,

    #[error("failed to read secret '{name}': {message}")]
    ReadFailure { name: String, message: String },

    #[error("failed to write secret '{name}': {message}")]
    WriteFailure { name: String, message: String },

    #[error("invalid input: {0}")]
    Validation(String),
}

impl SyncError {
    /// Errors that the user can fix by editing configuration rather than retrying
    pub fn is_user_actionable(&self) -> bool {
        matches!(self, SyncError::NoCredentials { .. } | SyncError::Validation(_))
    }
}

/// Render an anyhow chain on one line, as surfaced to the user
pub(crate) fn describe(err: &anyhow::Error) -> String {
    format!("{:#}", err)
}
