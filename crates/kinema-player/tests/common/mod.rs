//! Shared fixtures: a manifest reader over a fixed document, a recording
//! stream reader and a settable clock.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kinema_mpd::{parse_mpd, MpdDocument, RepresentationAddress};
use kinema_player::{
    LoadRequest, ManifestReader, ManifestUpdateType, SegmentRequest, SessionServices, StreamReader,
    SyncClock,
};
use parking_lot::{Mutex, RwLock};
use url::Url;

pub fn manifest_url() -> Url {
    Url::parse("https://cdn.example.com/content/manifest.mpd").unwrap()
}

/// Serves a fixed document and records load/update requests.
#[derive(Default)]
pub struct StaticManifestReader {
    document: RwLock<Option<Arc<MpdDocument>>>,
    pub load_requests: Mutex<Vec<LoadRequest>>,
    pub update_requests: Mutex<Vec<ManifestUpdateType>>,
    pub clock_resyncs: Mutex<usize>,
}

impl StaticManifestReader {
    pub fn with_document(doc: MpdDocument) -> Arc<Self> {
        let reader = Arc::new(Self::default());
        reader.install(doc);
        reader
    }

    pub fn install(&self, doc: MpdDocument) {
        *self.document.write() = Some(Arc::new(doc));
    }

    pub fn take_load_requests(&self) -> Vec<LoadRequest> {
        std::mem::take(&mut self.load_requests.lock())
    }
}

impl ManifestReader for StaticManifestReader {
    fn current_document(&self) -> Option<Arc<MpdDocument>> {
        self.document.read().clone()
    }

    fn add_element_load_requests(&self, requests: Vec<LoadRequest>) {
        self.load_requests.lock().extend(requests);
    }

    fn request_update(&self, request_type: ManifestUpdateType) {
        self.update_requests.lock().push(request_type);
    }

    fn request_clock_resync(&self) {
        *self.clock_resyncs.lock() += 1;
    }
}

/// Records every dispatched segment request.
#[derive(Default)]
pub struct RecordingStreamReader {
    pub requests: Mutex<Vec<Arc<SegmentRequest>>>,
}

impl RecordingStreamReader {
    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn take(&self) -> Vec<Arc<SegmentRequest>> {
        std::mem::take(&mut self.requests.lock())
    }
}

impl StreamReader for RecordingStreamReader {
    fn add_request(&self, request: Arc<SegmentRequest>) {
        self.requests.lock().push(request);
    }
}

pub struct TestClock {
    now: Mutex<DateTime<Utc>>,
}

impl TestClock {
    pub fn at(now: &str) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(now.parse().unwrap()),
        })
    }

    pub fn set(&self, now: &str) {
        *self.now.lock() = now.parse().unwrap();
    }
}

impl SyncClock for TestClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

pub fn parse(xml: &str, generation: u64) -> MpdDocument {
    parse_mpd(xml, manifest_url(), generation).unwrap()
}

pub fn services_over(reader: Arc<StaticManifestReader>) -> Arc<SessionServices> {
    Arc::new(SessionServices::with_reader(reader))
}

pub fn services_full(
    reader: Arc<StaticManifestReader>,
    stream_reader: Arc<RecordingStreamReader>,
    clock: Arc<TestClock>,
) -> Arc<SessionServices> {
    Arc::new(SessionServices::new(
        reader,
        stream_reader,
        Arc::new(kinema_index::EntityCache::new()),
        Arc::new(kinema_player::NoopDrmManager),
        Arc::new(kinema_mpd::DefaultSteering),
        clock,
        kinema_player::SessionOptions::default(),
    ))
}

pub fn rep_addr(doc: &MpdDocument, period: usize, aset: usize, rep: usize) -> RepresentationAddress {
    RepresentationAddress {
        generation: doc.generation,
        period,
        adaptation_set: aset,
        representation: rep,
    }
}
