use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("private key must be 64 hex characters")]
    InvalidKey,

    #[error("relay error: {0}")]
    Relay(String),

    #[error("no relay acknowledged the event")]
    NoRelayAcknowledged,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("provider reported an error notification: {0}")]
    Notification(String),

    #[error("encryption required but target server does not support it")]
    EncryptionUnsupported,

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("execution timed out")]
    ExecutionTimeout,

    #[error("execution cancelled")]
    Cancelled,

    #[error("payment error: {0}")]
    Payment(String),

    #[error("capability validation failed: {0}")]
    Validation(String),

    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("local endpoint error: {0}")]
    Endpoint(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<nostr_sdk::client::Error> for Error {
    fn from(e: nostr_sdk::client::Error) -> Self {
        Error::Relay(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(format!("invalid JSON payload: {e}"))
    }
}
