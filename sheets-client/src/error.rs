use shared_types::DecodeError;

/// Errors surfaced to collaborators of the sync core.
///
/// Transport failures are not in here: the connection loop recovers from
/// them on its own and reports progress through status callbacks.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid connection direction: {0:?} (expected \"up\", \"down\" or none)")]
    InvalidDirection(String),
    #[error("Not a command: {0}")]
    InvalidCommand(#[source] DecodeError),
    #[error("Not connected to the execution backend")]
    NotConnected,
    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse env var {key}={value}: {reason}")]
    Parse {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("Invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
