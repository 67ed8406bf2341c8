use thiserror::Error;

#[derive(Error, Debug)]
pub enum EntityDataError {
    #[error("Missing WebSocket URL")]
    MissingUrl,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Max reconnection attempts reached ({0})")]
    MaxReconnectAttempts(u32),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel error: {0}")]
    ChannelError(String),
}

/// Failure of a user supplied data key function.
///
/// Never surfaced to subscription owners: the key falls back to running
/// without the function and the error is logged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    #[error("Compile error: {0}")]
    Compile(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}
