#![forbid(unsafe_code)]

//! kinema: an adaptive DASH streaming engine.
//!
//! Given an MPD manifest, a playback position and a track selection, kinema
//! deterministically resolves which exact byte range of which exact URL must
//! be fetched next, and drives an adaptive player's segment-request state
//! machine around that core. Decoding, rendering and the HTTP transport are
//! collaborators behind traits, injected per session.
//!
//! Entry point: [`create_player`] with a [`PlayerConfig`].

mod clock;
mod config;
mod factory;
mod reader;

pub use clock::FixedClock;
pub use config::PlayerConfig;
pub use factory::{create_player, Player, SessionDeps};
pub use reader::HttpManifestReader;

// The engine types sessions interact with.
pub use kinema_core::{MediaTime, SequenceState, StreamType, TimeRange, TrackMetadata};
pub use kinema_net::{HttpClient, Net, NetOptions};
pub use kinema_player::{
    BufferingReason, PlaybackSnapshot, PlayerError, PlayerEvent, PlayerHandle, PlayerResult,
    PlayerState, SeekParams, SessionOptions, StreamPreferences,
};
