use kinema_core::{MediaTime, StreamType, TrackMetadata};
use tokio::sync::broadcast;

use crate::state::{BufferingReason, PlayerState};

/// Player events. Delivery is lossy (broadcast ring); consumers that fall
/// behind miss events rather than stall playback.
#[derive(Clone, Debug)]
pub enum PlayerEvent {
    StateChanged {
        from: PlayerState,
        to: PlayerState,
    },
    TracksChanged {
        tracks: Vec<TrackMetadata>,
    },
    BufferingBegin {
        reason: BufferingReason,
    },
    BufferingEnd {
        reason: BufferingReason,
    },
    SeekCompleted {
        position: MediaTime,
    },
    SegmentRequested {
        stream_type: StreamType,
        number: i64,
        url: Option<String>,
    },
    /// A timeline hole is being bridged with filler data.
    SegmentUnavailable {
        stream_type: StreamType,
        number: i64,
    },
    QualityChanged {
        stream_type: StreamType,
        from_bitrate: u32,
        to_bitrate: u32,
    },
    PlaylistRefreshRequested,
    EndOfStream,
    Error {
        message: String,
    },
}

#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<PlayerEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn with_sender(tx: broadcast::Sender<PlayerEvent>) -> Self {
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PlayerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(32)
    }
}
