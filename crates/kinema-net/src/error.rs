use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("Request timed out")]
    Timeout,

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for NetError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            NetError::Timeout
        } else if let Some(status) = e.status() {
            NetError::Status(status.as_u16())
        } else {
            NetError::Transport(e.to_string())
        }
    }
}
