use std::fmt;

/// Elementary stream categories the player schedules independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamType {
    Video,
    Audio,
    Subtitle,
}

impl StreamType {
    pub const ALL: [StreamType; 3] = [StreamType::Video, StreamType::Audio, StreamType::Subtitle];
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::Video => write!(f, "video"),
            StreamType::Audio => write!(f, "audio"),
            StreamType::Subtitle => write!(f, "subtitle"),
        }
    }
}

/// Media container of a representation's segments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContainerFormat {
    /// Fragmented MP4 (ISO/IEC 14496-12).
    #[default]
    IsoBmff,
    /// Matroska / WebM.
    Matroska,
}

/// Codec description carried on segment requests for decoder setup.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CodecInfo {
    /// RFC 6381 codec string, e.g. "avc1.64001f".
    pub name: String,
    pub mime_type: String,
    pub bitrate: u32,
}

impl CodecInfo {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bitrate: u32) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bitrate,
        }
    }
}

/// Identifies which logical track a decoded buffer belongs to. Attached to
/// every segment request so downstream buffers can demux per track.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BufferSourceInfo {
    pub kind: String,
    pub language: String,
    pub codec: String,
    /// Index of the adaptation set within its stream type.
    pub hard_index: usize,
    pub period_id: String,
    pub period_adaptation_set_id: String,
}

/// Track description announced through `TracksChanged`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackMetadata {
    pub kind: String,
    pub language: String,
    pub codec: CodecInfo,
    pub stream_type: Option<StreamType>,
}
