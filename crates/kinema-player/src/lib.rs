#![forbid(unsafe_code)]

//! Adaptive streaming player core.
//!
//! The heart of this crate is the segment search engine: given a parsed MPD
//! snapshot, a period-local time and a search type, it resolves the exact
//! byte range of the exact URL to fetch next, across the four DASH
//! addressing modes. Around it sit the play period (track selection and
//! request construction), the manifest facade (period lookup, live timing)
//! and the player worker (seek/pause/track-switch command loop feeding the
//! stream reader).

pub mod error;
pub mod events;
pub mod manifest;
pub mod period;
pub mod player;
pub mod search;
pub mod segment;
pub mod services;
pub mod state;

pub use error::{PlayerError, PlayerResult};
pub use events::{EventEmitter, PlayerEvent};
pub use manifest::{ManifestDash, PeriodLookup};
pub use period::{
    PlayPeriod, PeriodReadyState, PlayStartOptions, PlayStartPosition, SegmentLookup,
    StreamPreferences, TrackChangeOutcome,
};
pub use player::{
    AdaptivePlayer, PlayerCommand, PlayerHandle, PlayerWorkerOptions, SeekParams,
};
pub use search::{
    SearchOptions, SearchOutcome, SearchStateTable, SearchType, SegmentSearchEngine,
};
pub use segment::{
    DownloadStats, LoadRequest, LoadRequestKind, SegmentInfo, SegmentRequest, SegmentUrl,
};
pub use services::{
    DrmCandidate, DrmClient, DrmManager, ManifestReader, ManifestUpdateType, NoopDrmManager,
    NullStreamReader, SessionOptions, SessionServices, StreamReader, SyncClock, SystemClock,
};
pub use state::{BufferingReason, PlaybackSnapshot, PlaybackState, PlayerState};
