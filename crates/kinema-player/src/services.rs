//! Collaborator boundaries of the player core.
//!
//! Everything the engine needs from the outside world arrives through these
//! traits, owned by a [`SessionServices`] bundle that is constructed once
//! per player and passed by reference. No process-wide singletons.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kinema_core::MediaTime;
use kinema_index::EntityCache;
use kinema_mpd::{ContentSteering, DefaultSteering, MpdDocument};
use parking_lot::Mutex;

use crate::error::{PlayerError, PlayerResult};
use crate::search::SearchStateTable;
use crate::segment::{LoadRequest, SegmentRequest};

/// Synchronized wallclock. Live manifests compare segment availability
/// against this, so tests inject fixed clocks.
pub trait SyncClock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl SyncClock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Out-of-band manifest refresh flavors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManifestUpdateType {
    /// Re-fetch the whole MPD.
    Full,
    /// Refresh to learn about the latest published segment.
    LatestSegment,
}

/// The manifest reader owns fetching and re-fetching the MPD document and
/// executing remote element loads (segment indexes, xlink). The core only
/// ever sees immutable snapshots.
pub trait ManifestReader: Send + Sync {
    fn current_document(&self) -> Option<Arc<MpdDocument>>;
    fn add_element_load_requests(&self, requests: Vec<LoadRequest>);
    fn request_update(&self, request_type: ManifestUpdateType);
    fn request_clock_resync(&self);
}

/// Consumes one segment request at a time; completion is reported back
/// asynchronously through the player's event queue.
pub trait StreamReader: Send + Sync {
    fn add_request(&self, request: Arc<SegmentRequest>);
}

/// Stream reader that drops requests; placeholder for sessions that only
/// resolve segments (tests, tooling).
#[derive(Debug, Default)]
pub struct NullStreamReader;

impl StreamReader for NullStreamReader {
    fn add_request(&self, _request: Arc<SegmentRequest>) {}
}

/// One content-protection scheme option collected from the manifest.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DrmCandidate {
    pub scheme_id_uri: String,
    pub value: String,
    pub common_scheme: bool,
    pub default_kids: Vec<String>,
}

/// Opaque decryption session handle attached to every segment request of a
/// protected period. Key exchange happens outside this library.
#[derive(Debug)]
pub struct DrmClient {
    pub candidates: Vec<DrmCandidate>,
}

/// Creates at most one DRM client per period from the union of the selected
/// adaptation sets' content protections.
pub trait DrmManager: Send + Sync {
    fn create_client(&self, candidates: &[DrmCandidate]) -> PlayerResult<Arc<DrmClient>>;
}

/// Accepts any protection setup without doing key exchange. Sessions
/// playing clear content never call it.
#[derive(Debug, Default)]
pub struct NoopDrmManager;

impl DrmManager for NoopDrmManager {
    fn create_client(&self, candidates: &[DrmCandidate]) -> PlayerResult<Arc<DrmClient>> {
        if candidates.is_empty() {
            return Err(PlayerError::Drm("no content protection candidates".into()));
        }
        Ok(Arc::new(DrmClient {
            candidates: candidates.to_vec(),
        }))
    }
}

/// Per-session tunables read by the period/search code.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Average starting video bitrate used to pick the first representation.
    pub starting_bitrate: u32,
    /// Audio/subtitle bandwidth cap during startup.
    pub non_video_bandwidth_cap: u32,
    /// Codec-class priorities: `(codec prefix, priority)`, higher wins.
    pub codec_class_priorities: Vec<(String, i32)>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            starting_bitrate: 2_000_000,
            non_video_bandwidth_cap: 256_000,
            codec_class_priorities: Vec::new(),
        }
    }
}

impl SessionOptions {
    pub fn class_priority(&self, codec: &str) -> i32 {
        self.codec_class_priorities
            .iter()
            .find(|(prefix, _)| codec.starts_with(prefix.as_str()))
            .map(|(_, p)| *p)
            .unwrap_or(-1)
    }
}

/// Everything the period/search/player code needs, bundled. One per player
/// session; the worker task is the only caller into the manifest-touching
/// parts.
pub struct SessionServices {
    pub manifest_reader: Arc<dyn ManifestReader>,
    pub stream_reader: Arc<dyn StreamReader>,
    pub entity_cache: Arc<EntityCache>,
    pub drm: Arc<dyn DrmManager>,
    pub steering: Arc<dyn ContentSteering>,
    pub clock: Arc<dyn SyncClock>,
    pub search_state: Arc<SearchStateTable>,
    pub options: SessionOptions,
    /// Producer-reference-time id used for latency measurement; set while a
    /// low-latency period is active.
    latency_reference_id: Mutex<Option<i64>>,
    /// Accumulated delay applied to segment availability when fetches keep
    /// arriving early (clock drift compensation).
    segment_fetch_delay: Mutex<MediaTime>,
}

impl SessionServices {
    pub fn new(
        manifest_reader: Arc<dyn ManifestReader>,
        stream_reader: Arc<dyn StreamReader>,
        entity_cache: Arc<EntityCache>,
        drm: Arc<dyn DrmManager>,
        steering: Arc<dyn ContentSteering>,
        clock: Arc<dyn SyncClock>,
        options: SessionOptions,
    ) -> Self {
        Self {
            manifest_reader,
            stream_reader,
            entity_cache,
            drm,
            steering,
            clock,
            search_state: Arc::new(SearchStateTable::new()),
            options,
            latency_reference_id: Mutex::new(None),
            segment_fetch_delay: Mutex::new(MediaTime::ZERO),
        }
    }

    /// Minimal services over the defaults; used by tests and tooling.
    pub fn with_reader(manifest_reader: Arc<dyn ManifestReader>) -> Self {
        Self::new(
            manifest_reader,
            Arc::new(NullStreamReader),
            Arc::new(EntityCache::new()),
            Arc::new(NoopDrmManager),
            Arc::new(DefaultSteering),
            Arc::new(SystemClock),
            SessionOptions::default(),
        )
    }

    pub fn latency_reference_id(&self) -> Option<i64> {
        *self.latency_reference_id.lock()
    }

    pub fn set_latency_reference_id(&self, id: Option<i64>) {
        *self.latency_reference_id.lock() = id;
    }

    pub fn segment_fetch_delay(&self) -> MediaTime {
        *self.segment_fetch_delay.lock()
    }

    pub fn set_segment_fetch_delay(&self, delay: MediaTime) {
        *self.segment_fetch_delay.lock() = delay;
    }
}
