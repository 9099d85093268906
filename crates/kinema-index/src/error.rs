use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Malformed segment index: {0}")]
    Malformed(String),

    #[error("Unexpected end of data at offset {0}")]
    UnexpectedEof(usize),

    #[error("Unsupported segment index feature: {0}")]
    Unsupported(String),
}
