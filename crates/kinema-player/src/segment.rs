//! Resolved segment descriptors and fetch requests.

use std::sync::Arc;

use kinema_core::{
    BufferSourceInfo, CodecInfo, ContainerFormat, MediaTime, SequenceIndex, StreamType,
};
use kinema_mpd::{EventStreamInfo, ProducerReferenceTime, RepresentationAddress};
use url::Url;

use crate::services::DrmClient;

/// Where one resource of a segment lives after steering selection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SegmentUrl {
    pub url: Option<Url>,
    /// Byte range in the manifest `s-e` form, when ranged.
    pub range: Option<String>,
    /// Extra request header line granted by the steering decision.
    pub custom_header: Option<String>,
    pub steering_id: String,
}

/// The fully resolved descriptor for exactly one segment: the output of the
/// segment search engine and the input to request construction.
///
/// `time`, `duration` and `pto` are all expressed in `timescale` units;
/// `pto` maps media-internal time onto the period's zero point.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SegmentInfo {
    pub time: i64,
    pub pto: i64,
    pub ept_delta: i64,
    pub duration: i64,
    pub number: i64,
    pub sub_index: i64,
    pub timescale: u32,
    pub first_byte_offset: u64,
    pub number_of_bytes: u64,
    /// First access unit the consumer should emit (frame-accurate trims).
    pub media_local_first_au_time: i64,
    pub media_local_first_pts: i64,
    pub media_local_last_au_time: i64,
    /// Accumulated availability time offset (MPD levels plus steering).
    pub ato: MediaTime,
    pub container: ContainerFormat,
    pub media_url: SegmentUrl,
    pub init_url: SegmentUrl,
    pub inband_event_streams: Vec<EventStreamInfo>,
    pub producer_reference_times: Vec<ProducerReferenceTime>,
    /// Producer-reference-time id used for latency measurement, -1 if none.
    pub latency_reference_id: i64,
    /// Set when the timeline declares a hole where this segment should be;
    /// the request is served with filler data instead of a fetch.
    pub is_missing: bool,
    /// Set when the segment may not exist (e.g. last computed number of a
    /// fixed-duration template that can overshoot the period end).
    pub may_be_missing: bool,
    pub is_last_in_period: bool,
    pub is_sideload: bool,
    pub frame_accuracy_required: bool,
    /// Stream reader saw the `lmsg` brand: no further segments follow.
    pub saw_lmsg: bool,
    pub low_latency_chunked: bool,
}

impl SegmentInfo {
    /// Period-local start time of this segment.
    pub fn period_local_start(&self) -> MediaTime {
        MediaTime::from_nd(self.time - self.pto, self.timescale)
    }

    pub fn duration_time(&self) -> MediaTime {
        MediaTime::from_nd(self.duration, self.timescale)
    }

    /// Earliest wallclock time the whole segment is available on the
    /// origin. Static presentations are fully available from the anchor.
    pub fn availability_start(
        &self,
        ast: MediaTime,
        period_start: MediaTime,
        is_static: bool,
    ) -> MediaTime {
        if is_static {
            return ast + period_start;
        }
        ast + period_start
            + MediaTime::from_nd(self.time - self.pto + self.duration, self.timescale)
            - self.ato
    }

    /// Wallclock time after which the segment may fall out of the timeshift
    /// window.
    pub fn availability_end(
        &self,
        ast: MediaTime,
        period_start: MediaTime,
        availability_end_time: MediaTime,
        timeshift_buffer_depth: MediaTime,
        is_static: bool,
    ) -> MediaTime {
        if is_static {
            return MediaTime::pos_infinity();
        }
        let mut end = self.availability_start(ast, period_start, false) + self.duration_time();
        if timeshift_buffer_depth.is_valid() {
            end += timeshift_buffer_depth;
        }
        if availability_end_time.is_valid() && availability_end_time < end {
            end = availability_end_time;
        }
        end
    }
}

/// Remote element fetches the search engine needs before it can answer
/// (segment indexes today, resolved xlink periods tomorrow). Submitted via
/// the manifest reader and completed asynchronously.
#[derive(Clone, Debug)]
pub struct LoadRequest {
    pub url: Url,
    pub range: Option<String>,
    pub custom_header: Option<String>,
    pub kind: LoadRequestKind,
    pub stream_type: StreamType,
    pub quality_index: usize,
}

#[derive(Clone, Debug)]
pub enum LoadRequestKind {
    /// A `sidx` or Matroska index for the given representation. For
    /// Matroska a follow-up fetch of `chained_init_range` completes the
    /// header data the cue parse needs.
    SegmentIndex {
        representation: RepresentationAddress,
        container: ContainerFormat,
        chained_init_range: Option<String>,
    },
    /// An init segment preload; parsed and dropped into the entity cache.
    InitSegment {
        representation: RepresentationAddress,
        container: ContainerFormat,
    },
}

/// Failure counters surfaced to the stream reader's retry logic.
#[derive(Clone, Debug, Default)]
pub struct DownloadStats {
    pub num_retries: u32,
    pub http_status: Option<u16>,
    pub failure_reason: Option<String>,
    pub waiting_for_remote_retry_element: bool,
}

/// One concrete fetch request handed to the stream reader.
///
/// Created by the play period, consumed exactly once; only `download_stats`
/// mutates after handoff. The very first request of a playback start is a
/// composite carrying one dependent request per active stream type.
#[derive(Clone, Debug, Default)]
pub struct SegmentRequest {
    pub stream_type: Option<StreamType>,
    pub quality_index: usize,
    pub max_quality_index: usize,
    pub codec_info: CodecInfo,
    pub representation: Option<RepresentationAddress>,
    pub period_id: String,
    /// Period start on the presentation timeline (anchor-relative).
    pub period_start: MediaTime,
    /// Presentation anchor (availability start time) as media time.
    pub ast: MediaTime,
    /// Availability window of the segment, when the manifest uses one.
    pub availability_start: MediaTime,
    pub availability_end: MediaTime,
    pub segment: SegmentInfo,
    pub dependent_streams: Vec<SegmentRequest>,
    pub is_initial_start_request: bool,
    /// This stream already ended; the request is a marker, not a fetch.
    pub is_eos_segment: bool,
    pub insert_filler_data: bool,
    pub num_overall_retries: u32,
    pub timestamp_sequence_index: SequenceIndex,
    /// Exact requested time for frame-accurate starts; decode-and-discard
    /// downstream trims up to it.
    pub frame_accurate_time: MediaTime,
    pub warned_about_timescale: bool,
    pub drm_client: Option<Arc<DrmClient>>,
    pub drm_mime_type: String,
    pub buffer_source: Option<BufferSourceInfo>,
    pub download_stats: DownloadStats,
}

impl SegmentRequest {
    /// First presentation timestamp this request will produce, on the
    /// player timeline.
    pub fn first_pts(&self) -> MediaTime {
        if self.segment.timescale == 0 {
            return MediaTime::invalid();
        }
        self.ast
            + self.period_start
            + MediaTime::from_nd(
                self.segment.time.max(self.segment.media_local_first_au_time) - self.segment.pto,
                self.segment.timescale,
            )
    }

    /// Period-local media time used to continue from this request after a
    /// manifest update (clamped so a large PTO cannot go negative).
    pub fn continuation_time(&self) -> MediaTime {
        if self.segment.timescale == 0 {
            return MediaTime::invalid();
        }
        let media = (self.segment.time - self.segment.pto).max(0);
        MediaTime::from_nd(media, self.segment.timescale)
    }
}
