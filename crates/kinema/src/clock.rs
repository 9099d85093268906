use chrono::{DateTime, Utc};
use kinema_player::SyncClock;
use parking_lot::Mutex;

/// Settable clock for tests: live-edge math and dynamic-event end checks
/// become deterministic.
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock();
        *now = *now + duration;
    }
}

impl SyncClock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
