use thiserror::Error;

#[derive(Debug, Error)]
pub enum MpdError {
    #[error("MPD parse error: {0}")]
    Parse(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported MPD feature: {0}")]
    Unsupported(String),
}

impl From<quick_xml::Error> for MpdError {
    fn from(e: quick_xml::Error) -> Self {
        MpdError::Parse(e.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for MpdError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        MpdError::Parse(e.to_string())
    }
}

impl From<std::str::Utf8Error> for MpdError {
    fn from(e: std::str::Utf8Error) -> Self {
        MpdError::Parse(e.to_string())
    }
}
