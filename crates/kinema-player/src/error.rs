use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("Network error: {0}")]
    Net(#[from] kinema_net::NetError),

    #[error("Manifest error: {0}")]
    Mpd(#[from] kinema_mpd::MpdError),

    #[error("Segment index error: {0}")]
    Index(#[from] kinema_index::IndexError),

    #[error("Representation \"{id}\" is not usable: {reason}")]
    BadRepresentation { id: String, reason: String },

    #[error("DRM error: {0}")]
    Drm(String),

    #[error("No manifest loaded")]
    NotLoaded,

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Player is shutting down")]
    ShuttingDown,
}

pub type PlayerResult<T> = Result<T, PlayerError>;
