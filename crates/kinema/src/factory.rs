//! Session assembly: the module entry point creating one player instance
//! with explicitly injected collaborators. No process-wide state.

use std::sync::Arc;

use kinema_core::MediaTime;
use kinema_index::EntityCache;
use kinema_mpd::{ContentSteering, DefaultSteering};
use kinema_net::{HttpClient, Net};
use kinema_player::{
    AdaptivePlayer, DrmManager, ManifestDash, NoopDrmManager, NullStreamReader, PlayerHandle,
    PlayerResult, PlayerWorkerOptions, SessionServices, StreamReader, SyncClock, SystemClock,
};
use tokio_util::sync::CancellationToken;

use crate::config::PlayerConfig;
use crate::reader::HttpManifestReader;

/// Collaborator overrides; anything left `None` gets the default
/// implementation (reqwest client, no-op DRM, priority-based steering,
/// system clock, discard stream reader).
#[derive(Default)]
pub struct SessionDeps {
    pub net: Option<Arc<dyn Net>>,
    pub stream_reader: Option<Arc<dyn StreamReader>>,
    pub drm: Option<Arc<dyn DrmManager>>,
    pub steering: Option<Arc<dyn ContentSteering>>,
    pub clock: Option<Arc<dyn SyncClock>>,
}

/// One player session: the worker handle plus its manifest reader.
pub struct Player {
    handle: PlayerHandle,
    reader: Arc<HttpManifestReader>,
    services: Arc<SessionServices>,
    cancel: CancellationToken,
}

impl Player {
    /// Fetch the manifest and begin playback at the default position (live
    /// edge minus desired latency, or the playback range start for VoD).
    pub async fn open(&self) -> PlayerResult<()> {
        self.open_at(None).await
    }

    pub async fn open_at(&self, position: Option<MediaTime>) -> PlayerResult<()> {
        self.reader.refresh().await?;
        self.handle.open(position).await;
        Ok(())
    }

    pub fn handle(&self) -> &PlayerHandle {
        &self.handle
    }

    pub fn reader(&self) -> &Arc<HttpManifestReader> {
        &self.reader
    }

    pub fn manifest(&self) -> ManifestDash {
        ManifestDash::new(self.services.clone())
    }

    pub fn services(&self) -> &Arc<SessionServices> {
        &self.services
    }

    /// Cancel all work and wait for the worker to finish. Outstanding
    /// element loads are abandoned with it.
    pub async fn close(&self) {
        self.handle.close().await;
        self.cancel.cancel();
    }
}

/// Create a player session. Must run inside a tokio runtime: the worker
/// task and the manifest update loop are spawned here.
pub fn create_player(config: PlayerConfig, deps: SessionDeps) -> PlayerResult<Player> {
    let net: Arc<dyn Net> = match deps.net {
        Some(net) => net,
        None => Arc::new(HttpClient::new(&config.net)?),
    };
    let reader = HttpManifestReader::new(net, config.url.clone());
    let stream_reader = deps
        .stream_reader
        .unwrap_or_else(|| Arc::new(NullStreamReader));
    let drm = deps.drm.unwrap_or_else(|| Arc::new(NoopDrmManager));
    let steering = deps.steering.unwrap_or_else(|| Arc::new(DefaultSteering));
    let clock = deps.clock.unwrap_or_else(|| Arc::new(SystemClock));

    let services = Arc::new(SessionServices::new(
        reader.clone(),
        stream_reader,
        Arc::new(EntityCache::new()),
        drm,
        steering,
        clock,
        config.session.clone(),
    ));
    reader.bind_session(&services);

    let cancel = config.cancel.clone().unwrap_or_default();
    tokio::spawn(reader.clone().run_update_loop(cancel.clone()));

    let handle = AdaptivePlayer::spawn(
        services.clone(),
        PlayerWorkerOptions {
            command_capacity: config.command_channel_capacity,
            event_capacity: config.events_channel_capacity,
            seek_epsilon: config.seek_epsilon,
            cancel: Some(cancel.clone()),
            events: config.events_tx.clone(),
        },
    );

    Ok(Player {
        handle,
        reader,
        services,
        cancel,
    })
}
