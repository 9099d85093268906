//! Manifest reader: fetches and re-fetches the MPD and executes remote
//! element loads (segment indexes, init segments) on behalf of the engine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use kinema_core::ContainerFormat;
use kinema_index::{find_sidx, CachedEntity, MatroskaIndex};
use kinema_mpd::{parse_mpd, MpdDocument};
use kinema_net::{Net, NetError, RangeSpec};
use kinema_player::{
    LoadRequest, LoadRequestKind, ManifestReader, ManifestUpdateType, PlayerError, PlayerResult,
    SessionServices,
};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// HTTP-backed [`ManifestReader`]. Documents are immutable snapshots; a
/// refresh replaces the whole tree under a new generation, never mutating
/// in place.
pub struct HttpManifestReader {
    net: Arc<dyn Net>,
    manifest_url: Url,
    document: RwLock<Option<Arc<MpdDocument>>>,
    next_generation: AtomicU64,
    /// Weakly bound after construction to avoid a cycle with the session
    /// that owns this reader.
    session: RwLock<Weak<SessionServices>>,
    weak_self: Weak<Self>,
    update_notify: Notify,
    clock_resync_requested: AtomicBool,
}

impl HttpManifestReader {
    pub fn new(net: Arc<dyn Net>, manifest_url: Url) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            net,
            manifest_url,
            document: RwLock::new(None),
            next_generation: AtomicU64::new(1),
            session: RwLock::new(Weak::new()),
            weak_self: weak.clone(),
            update_notify: Notify::new(),
            clock_resync_requested: AtomicBool::new(false),
        })
    }

    /// Wire the session so completed element loads can land in its entity
    /// cache and search state.
    pub fn bind_session(&self, session: &Arc<SessionServices>) {
        *self.session.write() = Arc::downgrade(session);
    }

    /// Fetch and parse the MPD, replacing the current snapshot.
    pub async fn refresh(&self) -> PlayerResult<Arc<MpdDocument>> {
        let bytes = self.net.get_bytes(self.manifest_url.clone(), None).await?;
        let xml = std::str::from_utf8(&bytes)
            .map_err(|e| PlayerError::Playback(format!("MPD is not UTF-8: {e}")))?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let doc = Arc::new(parse_mpd(xml, self.manifest_url.clone(), generation)?);
        debug!(generation, periods = doc.periods.len(), "manifest refreshed");
        *self.document.write() = Some(doc.clone());
        Ok(doc)
    }

    /// Install an already parsed document (tests, side channels).
    pub fn install_document(&self, doc: Arc<MpdDocument>) {
        *self.document.write() = Some(doc);
    }

    /// Next generation number for documents parsed outside [`Self::refresh`].
    pub fn allocate_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    pub fn clock_resync_was_requested(&self) -> bool {
        self.clock_resync_requested.swap(false, Ordering::Relaxed)
    }

    /// Background refresh loop driven by [`ManifestReader::request_update`].
    pub async fn run_update_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.update_notify.notified() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "manifest refresh failed");
                    }
                }
            }
        }
    }

    async fn fetch(&self, request: &LoadRequest) -> Result<bytes::Bytes, NetError> {
        let mut headers = None;
        if let Some(header_line) = &request.custom_header {
            if let Some((name, value)) = header_line.split_once(':') {
                let mut h = kinema_net::Headers::new();
                h.insert(name.trim(), value.trim());
                headers = Some(h);
            }
        }
        match request.range.as_deref().and_then(RangeSpec::parse) {
            Some(range) => self.net.get_range(request.url.clone(), range, headers).await,
            None => self.net.get_bytes(request.url.clone(), headers).await,
        }
    }

    async fn execute_load(self: Arc<Self>, request: LoadRequest) {
        let Some(session) = self.session.read().upgrade() else {
            return;
        };
        let payload = self.fetch(&request).await;
        match &request.kind {
            LoadRequestKind::SegmentIndex {
                representation,
                container,
                ..
            } => {
                let entity = payload.ok().and_then(|data| match container {
                    ContainerFormat::IsoBmff => find_sidx(&data)
                        .map(|sidx| CachedEntity::Sidx(Arc::new(sidx)))
                        .map_err(|e| warn!(error = %e, "sidx parse failed"))
                        .ok(),
                    ContainerFormat::Matroska => MatroskaIndex::parse(&data)
                        .map(|index| CachedEntity::Matroska(Arc::new(index)))
                        .map_err(|e| warn!(error = %e, "matroska index parse failed"))
                        .ok(),
                });
                if let Some(entity) = &entity {
                    session.entity_cache.put(
                        request.url.as_str(),
                        request.range.as_deref(),
                        entity.clone(),
                    );
                }
                session
                    .search_state
                    .complete_index_load(*representation, entity);
            }
            LoadRequestKind::InitSegment { .. } => {
                // Init segments are cached raw; track parsing happens in the
                // stream reader when the segment is actually consumed.
                if let Ok(data) = payload {
                    session.entity_cache.put(
                        request.url.as_str(),
                        request.range.as_deref(),
                        CachedEntity::Raw(data),
                    );
                }
            }
        }
    }
}

impl ManifestReader for HttpManifestReader {
    fn current_document(&self) -> Option<Arc<MpdDocument>> {
        self.document.read().clone()
    }

    fn add_element_load_requests(&self, requests: Vec<LoadRequest>) {
        let Some(reader) = self.weak_self.upgrade() else {
            return;
        };
        for request in requests {
            tokio::spawn(reader.clone().execute_load(request));
        }
    }

    fn request_update(&self, request_type: ManifestUpdateType) {
        debug!(?request_type, "manifest update requested");
        self.update_notify.notify_one();
    }

    fn request_clock_resync(&self) {
        self.clock_resync_requested.store(true, Ordering::Relaxed);
    }
}
