//! Manifest facade: period lookup by time, live timing, refresh triggers.

use std::sync::Arc;
use std::time::Duration;

use kinema_core::{MediaTime, StreamType, TimeRange, TrackMetadata};
use kinema_mpd::MpdDocument;
use tracing::debug;

use crate::period::{PlayPeriod, PlayStartPosition};
use crate::search::SearchType;
use crate::segment::SegmentRequest;
use crate::services::{ManifestUpdateType, SessionServices};

/// Result of a period lookup.
pub enum PeriodLookup {
    Found(PlayPeriod),
    /// Time is at or beyond the end of the presentation.
    PastEos,
    /// Transient condition (no periods yet, concurrent update, unresolved
    /// xlink); retry after the given delay.
    TryAgainLater(Duration),
    NotLoaded,
}

/// Facade over the current MPD snapshot. Obtains a fresh snapshot from the
/// manifest reader on every call, so holders never observe a half-updated
/// tree.
pub struct ManifestDash {
    services: Arc<SessionServices>,
}

impl ManifestDash {
    pub fn new(services: Arc<SessionServices>) -> Self {
        Self { services }
    }

    pub fn current_document(&self) -> Option<Arc<MpdDocument>> {
        self.services.manifest_reader.current_document()
    }

    /// Presentation anchor: all externally visible times are offset by the
    /// availability start time of a dynamic presentation.
    pub fn anchor_time(&self) -> MediaTime {
        self.current_document()
            .map(|doc| anchor_time(&doc))
            .unwrap_or(MediaTime::ZERO)
    }

    pub fn is_live(&self) -> bool {
        self.current_document().is_some_and(|d| !d.is_static())
    }

    pub fn duration(&self) -> MediaTime {
        match self.current_document() {
            Some(doc) => {
                if doc.is_static() || doc.is_dynamic_event() {
                    doc.last_period_end(true)
                } else {
                    MediaTime::pos_infinity()
                }
            }
            None => MediaTime::invalid(),
        }
    }

    pub fn min_buffer_time(&self) -> MediaTime {
        self.current_document()
            .map(|d| d.min_buffer_time)
            .unwrap_or_default()
    }

    /// Full presentation range on the player timeline (anchor included).
    pub fn total_time_range(&self) -> TimeRange {
        let Some(doc) = self.current_document() else {
            return TimeRange::default();
        };
        let anchor = anchor_time(&doc);
        let start = doc
            .periods
            .first()
            .map(|p| anchor + p.start)
            .unwrap_or(anchor);
        let end = if doc.is_static() || doc.is_dynamic_event() {
            anchor + doc.last_period_end(true)
        } else {
            self.wallclock_now()
        };
        TimeRange::new(start, end)
    }

    /// Where seeks may land. Live presentations clamp to the timeshift
    /// window and keep the desired latency away from the live edge.
    pub fn seekable_time_range(&self) -> TimeRange {
        let Some(doc) = self.current_document() else {
            return TimeRange::default();
        };
        let total = self.total_time_range();
        if doc.is_static() || doc.is_dynamic_event() {
            return total;
        }
        let now = self.wallclock_now();
        let mut start = total.start;
        if doc.time_shift_buffer_depth.is_valid() {
            let tsb_start = now - doc.time_shift_buffer_depth;
            if !start.is_valid() || tsb_start > start {
                start = tsb_start;
            }
        }
        TimeRange::new(start, now - self.desired_live_latency())
    }

    /// Distance from the live edge playback should settle at.
    pub fn desired_live_latency(&self) -> MediaTime {
        let Some(doc) = self.current_document() else {
            return MediaTime::invalid();
        };
        if let Some(ll) = &doc.low_latency {
            if ll.target.is_valid() {
                return ll.target;
            }
        }
        if doc.suggested_presentation_delay.is_valid()
            && !doc.suggested_presentation_delay.is_zero()
        {
            return doc.suggested_presentation_delay;
        }
        // No declared delay: stay a conservative distance behind the edge.
        MediaTime::from_seconds(6)
    }

    /// `UTCNow - position`, optionally corrected by the encoder-reported
    /// latency when the low-latency descriptor's producer reference time
    /// resolves.
    pub fn calculate_current_live_latency(
        &self,
        position: MediaTime,
        encoder_latency: MediaTime,
        via_latency_element: bool,
    ) -> MediaTime {
        let Some(doc) = self.current_document() else {
            return MediaTime::invalid();
        };
        if doc.is_static() {
            return MediaTime::invalid();
        }
        let mut latency = self.wallclock_now() - position;
        if via_latency_element {
            if let Some(ll) = &doc.low_latency {
                if doc.producer_reference_time(ll.reference_id).is_some()
                    && encoder_latency.is_valid()
                {
                    latency += encoder_latency;
                }
            }
        }
        latency
    }

    /// Request an out-of-band refresh, but only when scheduled updates are
    /// not expected to be timely: a minimumUpdatePeriod of zero means
    /// "refresh on demand", and a very large one is too infrequent to track
    /// segment availability.
    pub fn trigger_playlist_refresh(&self) -> bool {
        let Some(doc) = self.current_document() else {
            return false;
        };
        let mup = doc.minimum_update_period;
        if doc.updates_expected() && (mup.is_zero() || mup > MediaTime::from_seconds(10)) {
            self.services
                .manifest_reader
                .request_update(ManifestUpdateType::LatestSegment);
            return true;
        }
        false
    }

    pub fn trigger_clock_sync(&self) {
        self.services.manifest_reader.request_clock_resync();
    }

    /// Track metadata of the first period. Periods can differ arbitrarily,
    /// so there is no cross-period commonality to report.
    pub fn track_metadata(&self, stream_type: Option<StreamType>) -> Vec<TrackMetadata> {
        let Some(doc) = self.current_document() else {
            return Vec::new();
        };
        let Some(period) = doc.periods.first() else {
            return Vec::new();
        };
        period
            .adaptation_sets
            .iter()
            .filter(|a| stream_type.is_none() || a.stream_type == stream_type)
            .map(|a| {
                let best = a.representations.last();
                TrackMetadata {
                    kind: a
                        .stream_type
                        .map(|t| t.to_string())
                        .unwrap_or_default(),
                    language: a.language.clone(),
                    codec: kinema_core::CodecInfo::new(
                        best.map(|r| r.codecs.clone()).unwrap_or_default(),
                        best.map(|r| r.mime_type.clone()).unwrap_or_default(),
                        best.map(|r| r.bandwidth).unwrap_or(0),
                    ),
                    stream_type: a.stream_type,
                }
            })
            .collect()
    }

    /// Find the period containing `position.time`.
    ///
    /// A time before the first period snaps into the first period. A time
    /// at or past the end of the last period (or the playback range end)
    /// is `PastEos`. A "dynamic event" additionally ends when wallclock now
    /// passes the presentation end, regardless of the nominal duration.
    pub fn find_play_period(
        &self,
        position: &PlayStartPosition,
        search_type: SearchType,
    ) -> PeriodLookup {
        let Some(doc) = self.current_document() else {
            return PeriodLookup::NotLoaded;
        };
        if doc.periods.is_empty() {
            return PeriodLookup::TryAgainLater(Duration::from_millis(1000));
        }
        let anchor = anchor_time(&doc);

        let mut start_time = position.time - anchor;
        let play_range_end = position.options.playback_range.end - anchor;

        let mut total_end = doc.last_period_end(true);
        if play_range_end.is_valid() && total_end.is_valid() && play_range_end < total_end {
            total_end = play_range_end;
        }
        if start_time.is_valid() && total_end.is_valid() && start_time >= total_end {
            return PeriodLookup::PastEos;
        }
        if start_time < doc.periods[0].start {
            debug!("start time before the first period, using the first period");
            start_time = doc.periods[0].start;
        }

        let mut selected: Option<usize> = None;
        for (i, period) in doc.periods.iter().enumerate() {
            if period.is_early {
                continue;
            }
            let period_start = period.start;
            let period_end = if period.end().is_valid() {
                period.end()
            } else {
                // Only the last period of a live presentation has no end.
                MediaTime::pos_infinity()
            };
            if !(start_time >= period_start && start_time < period_end) {
                continue;
            }
            match search_type {
                // For a period there is no real choice: segments for the
                // search time only exist in the period containing it.
                SearchType::Closest
                | SearchType::Before
                | SearchType::Same
                | SearchType::After => selected = Some(i),
                SearchType::StrictlyAfter => {
                    if doc.periods.get(i + 1).is_some_and(|p| !p.is_early) {
                        selected = Some(i + 1);
                    }
                }
                SearchType::StrictlyBefore => {
                    if i > 0 {
                        selected = Some(i - 1);
                    }
                }
            }
            break;
        }

        let Some(index) = selected else {
            // The time is past the last period: the real duration is
            // shorter than the MPD declared. The end, either way.
            return PeriodLookup::PastEos;
        };
        let period = &doc.periods[index];

        if total_end.is_valid() && total_end <= period.start {
            return PeriodLookup::PastEos;
        }
        if doc.is_dynamic_event() {
            let end = anchor + doc.last_period_end(true);
            if end.is_valid() && self.wallclock_now() >= end {
                return PeriodLookup::PastEos;
            }
        }
        if period.is_early || (period.xlink_href.is_some() && period.adaptation_sets.is_empty()) {
            debug!(period = %period.id, "period requires xlink resolution, trying again later");
            return PeriodLookup::TryAgainLater(Duration::from_millis(100));
        }

        PeriodLookup::Found(PlayPeriod::new(self.services.clone(), period.id.clone()))
    }

    /// Locate the period following the one `current` was fetched from,
    /// based on the actual media time of that request so an MPD update with
    /// different periods still lands correctly.
    pub fn find_next_play_period(&self, current: &SegmentRequest) -> PeriodLookup {
        let search_time = current.ast + current.period_start + current.continuation_time();
        if !search_time.is_valid() {
            return PeriodLookup::PastEos;
        }
        let position = PlayStartPosition {
            time: search_time,
            options: Default::default(),
        };
        self.find_play_period(&position, SearchType::StrictlyAfter)
    }

    fn wallclock_now(&self) -> MediaTime {
        let now = self.services.clock.now_utc();
        MediaTime::from_millis(now.timestamp_millis())
    }
}

/// Anchor of a document: the availability start time of a dynamic
/// presentation, zero for static content.
pub fn anchor_time(doc: &MpdDocument) -> MediaTime {
    match (&doc.availability_start_time, doc.is_static()) {
        (Some(ast), false) => MediaTime::from_millis(ast.timestamp_millis()),
        _ => MediaTime::ZERO,
    }
}
