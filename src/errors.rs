use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("API {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Spooler query failed: {0}")]
    Spooler(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("No previous document available to reprint.")]
    NoPreviousJob,

    #[error("No printer selected.")]
    NoPrinter,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

}

/// Request URLs may carry presigned credentials, so they are dropped from
/// the message.
impl From<reqwest::Error> for DaemonError {
    fn from(e: reqwest::Error) -> Self {
        let e = e.without_url();
        if e.is_timeout() {
            DaemonError::Network(format!("request timed out: {}", e))
        } else {
            DaemonError::Network(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
