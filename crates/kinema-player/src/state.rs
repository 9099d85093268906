//! Shared playback state: the explicit mutual-exclusion boundary between
//! the worker thread (sole writer) and the public API (reader).

use kinema_core::{MediaTime, TimeRange, TrackMetadata};
use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    ParsingManifest,
    PreparingStreams,
    Ready,
    Buffering,
    Playing,
    Paused,
    Rebuffering,
    Seeking,
    Error,
}

impl PlayerState {
    pub fn name(&self) -> &'static str {
        match self {
            PlayerState::Idle => "Idle",
            PlayerState::ParsingManifest => "Parsing manifest",
            PlayerState::PreparingStreams => "Preparing streams",
            PlayerState::Ready => "Ready",
            PlayerState::Buffering => "Buffering",
            PlayerState::Playing => "Playing",
            PlayerState::Paused => "Paused",
            PlayerState::Rebuffering => "Rebuffering",
            PlayerState::Seeking => "Seeking",
            PlayerState::Error => "Error",
        }
    }
}

/// Why the player is buffering. Only the initial buffering re-announces
/// track metadata: availability may differ from the manifest's declared
/// defaults once playback actually starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferingReason {
    Initial,
    Seeking,
    Rebuffering,
}

/// Snapshot of playback state readable from any thread.
#[derive(Clone, Debug)]
pub struct PlaybackSnapshot {
    pub state: PlayerState,
    pub duration: MediaTime,
    pub seekable_range: TimeRange,
    pub position: MediaTime,
    pub playback_rate: f64,
    pub is_looping: bool,
    pub loop_count: u64,
    pub has_ended: bool,
    pub tracks: Vec<TrackMetadata>,
    pub current_live_latency: MediaTime,
}

impl Default for PlaybackSnapshot {
    fn default() -> Self {
        Self {
            state: PlayerState::Idle,
            duration: MediaTime::invalid(),
            seekable_range: TimeRange::default(),
            position: MediaTime::invalid(),
            playback_rate: 0.0,
            is_looping: false,
            loop_count: 0,
            has_ended: false,
            tracks: Vec::new(),
            current_live_latency: MediaTime::invalid(),
        }
    }
}

/// Lock-protected playback state. The worker writes, API threads read.
#[derive(Default)]
pub struct PlaybackState {
    inner: Mutex<PlaybackSnapshot>,
}

impl PlaybackState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.inner.lock().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut PlaybackSnapshot)) {
        f(&mut self.inner.lock());
    }

    pub fn state(&self) -> PlayerState {
        self.inner.lock().state
    }

    pub fn position(&self) -> MediaTime {
        self.inner.lock().position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_a_copy() {
        let state = PlaybackState::new();
        state.update(|s| {
            s.state = PlayerState::Playing;
            s.position = MediaTime::from_seconds(12);
        });
        let snap = state.snapshot();
        state.update(|s| s.position = MediaTime::from_seconds(13));
        assert_eq!(snap.position, MediaTime::from_seconds(12));
        assert_eq!(state.position(), MediaTime::from_seconds(13));
        assert_eq!(snap.state, PlayerState::Playing);
    }
}
