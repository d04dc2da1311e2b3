use thiserror::Error;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection not established within {timeout_ms} ms")]
    ConnectTimeout { timeout_ms: u64 },

    #[error("Invalid realtime endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Preference storage error: {0}")]
    Preference(String),
}
