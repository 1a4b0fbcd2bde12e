use std::process::ExitStatus;

use thiserror::Error;

pub type BrowserResult<T> = Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("no devtools page target on port {port} after {timeout_s}s")]
    ConnectTimeout { port: u16, timeout_s: u64 },
    #[error("timeout waiting for response to {0}")]
    CommandTimeout(String),
    #[error("devtools error: {0}")]
    Protocol(String),
    #[error("timeout waiting for page load")]
    LoadTimeout,
    #[error("chrome failed to start ({status}): {stderr}")]
    LaunchFailed { status: ExitStatus, stderr: String },
    #[error("no devtools port available")]
    PortsExhausted,
    #[error("browser session already exists: {0}")]
    SessionExists(String),
    #[error("browser session not found: {0}")]
    SessionNotFound(String),
    #[error("not connected to devtools")]
    NotConnected,
    #[error("devtools connection closed")]
    Disconnected,
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("decode error: {0}")]
    Decode(#[from] base64::DecodeError),
}
