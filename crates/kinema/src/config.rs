use kinema_core::MediaTime;
use kinema_net::NetOptions;
use kinema_player::{PlayerEvent, SessionOptions};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Configuration for one player session.
#[derive(Clone)]
pub struct PlayerConfig {
    /// MPD manifest URL.
    pub url: Url,
    /// Network configuration.
    pub net: NetOptions,
    /// Track/bitrate selection tunables.
    pub session: SessionOptions,
    /// Seeks closer than this to the last finished seek are no-ops.
    pub seek_epsilon: MediaTime,
    /// Capacity of the command channel into the worker.
    pub command_channel_capacity: usize,
    /// Capacity of the events broadcast channel (when no sender is given).
    pub events_channel_capacity: usize,
    /// Cancellation token for graceful shutdown.
    pub cancel: Option<CancellationToken>,
    /// External events sender; one is created internally if not provided.
    pub events_tx: Option<broadcast::Sender<PlayerEvent>>,
}

impl PlayerConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            net: NetOptions::default(),
            session: SessionOptions::default(),
            seek_epsilon: MediaTime::from_millis(300),
            command_channel_capacity: 32,
            events_channel_capacity: 32,
            cancel: None,
            events_tx: None,
        }
    }

    pub fn with_net(mut self, net: NetOptions) -> Self {
        self.net = net;
        self
    }

    pub fn with_session(mut self, session: SessionOptions) -> Self {
        self.session = session;
        self
    }

    pub fn with_seek_epsilon(mut self, epsilon: MediaTime) -> Self {
        self.seek_epsilon = epsilon;
        self
    }

    pub fn with_command_channel_capacity(mut self, capacity: usize) -> Self {
        self.command_channel_capacity = capacity;
        self
    }

    pub fn with_events_channel_capacity(mut self, capacity: usize) -> Self {
        self.events_channel_capacity = capacity;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_events(mut self, events_tx: broadcast::Sender<PlayerEvent>) -> Self {
        self.events_tx = Some(events_tx);
        self
    }
}
