//! Arena document model for a parsed MPD.

use chrono::{DateTime, Utc};
use kinema_core::{ContainerFormat, MediaTime, StreamType};
use url::Url;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentationType {
    Static,
    Dynamic,
}

/// One `<BaseURL>` element with the DVB-DASH selection attributes.
#[derive(Clone, Debug, PartialEq)]
pub struct BaseUrl {
    pub url: String,
    pub service_location: Option<String>,
    pub priority: u32,
    pub weight: u32,
}

impl Default for BaseUrl {
    fn default() -> Self {
        Self {
            url: String::new(),
            service_location: None,
            priority: 1,
            weight: 1,
        }
    }
}

/// `<Initialization>` / `<RepresentationIndex>` style URL-plus-range.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UrlRange {
    pub source_url: Option<String>,
    pub range: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SegmentBase {
    pub timescale: Option<u32>,
    pub presentation_time_offset: Option<u64>,
    pub index_range: Option<String>,
    pub index_range_exact: bool,
    pub initialization: Option<UrlRange>,
    pub representation_index: Option<UrlRange>,
    pub availability_time_offset: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SegmentTemplate {
    pub timescale: Option<u32>,
    pub presentation_time_offset: Option<u64>,
    pub media: Option<String>,
    pub initialization_template: Option<String>,
    pub initialization: Option<UrlRange>,
    pub start_number: Option<u32>,
    pub end_number: Option<u32>,
    pub duration: Option<u32>,
    /// Difference between the first segment's earliest presentation time and
    /// the period start, in timescale units. Usually zero or negative.
    pub ept_delta: Option<i64>,
    pub availability_time_offset: Option<f64>,
    pub timeline: Option<SegmentTimeline>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SegmentTimeline {
    pub elements: Vec<SElement>,
}

/// One `<S>` element. `r == -1` repeats until the next element's `t` or the
/// period end.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SElement {
    pub t: Option<u64>,
    pub n: Option<u64>,
    pub d: Option<u64>,
    pub r: i64,
    pub k: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContentProtection {
    pub scheme_id_uri: String,
    pub value: String,
    pub default_kid: String,
    /// True for `urn:mpeg:dash:mp4protection:2011`.
    pub common_scheme: bool,
}

/// `<EventStream>` / `<InbandEventStream>` descriptor.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventStreamInfo {
    pub scheme_id_uri: String,
    pub value: String,
    pub timescale: u32,
    pub presentation_time_offset: i64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProducerReferenceTime {
    pub id: i64,
    pub wall_clock_time: Option<DateTime<Utc>>,
    pub presentation_time: u64,
}

/// `<ServiceDescription><Latency>` low-latency parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct LowLatencyDescriptor {
    pub reference_id: i64,
    pub target: MediaTime,
    pub min: MediaTime,
    pub max: MediaTime,
}

#[derive(Clone, Debug)]
pub struct Representation {
    pub id: String,
    pub bandwidth: u32,
    pub codecs: String,
    pub mime_type: String,
    pub container: ContainerFormat,
    pub selection_priority: u32,
    pub base_urls: Vec<BaseUrl>,
    pub segment_base: Option<SegmentBase>,
    pub segment_template: Option<SegmentTemplate>,
    pub has_segment_list: bool,
    pub inband_event_streams: Vec<EventStreamInfo>,
    /// Non-standard attributes (`presentationTimeOffset`, `timescale`)
    /// tolerated on side-loaded subtitle representations.
    pub other_attributes: Vec<(String, String)>,
}

impl Representation {
    /// A side-loaded subtitle file: a text track with no segment addressing
    /// anywhere, fetched whole.
    pub fn is_sideloaded_text(&self) -> bool {
        (self.mime_type.starts_with("text/")
            || self.mime_type.starts_with("application/ttml"))
            && self.segment_base.is_none()
            && self.segment_template.is_none()
    }
}

#[derive(Clone, Debug)]
pub struct AdaptationSet {
    pub id: String,
    pub stream_type: Option<StreamType>,
    pub language: String,
    pub codecs: String,
    pub mime_type: String,
    pub selection_priority: u32,
    pub base_urls: Vec<BaseUrl>,
    pub segment_base: Option<SegmentBase>,
    pub segment_template: Option<SegmentTemplate>,
    pub has_segment_list: bool,
    pub content_protections: Vec<ContentProtection>,
    pub inband_event_streams: Vec<EventStreamInfo>,
    /// IDs of adaptation sets this one switches to
    /// (`urn:mpeg:dash:adaptation-set-switching:2016`).
    pub switch_to_ids: Vec<String>,
    /// Set when another adaptation set lists this one as a switch target;
    /// such sets are hidden from direct selection.
    pub in_switch_group: bool,
    pub representations: Vec<Representation>,
}

impl AdaptationSet {
    pub fn is_usable(&self) -> bool {
        !self.representations.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct Period {
    pub id: String,
    /// Start relative to the presentation anchor. Resolved during
    /// finalization from `@start` or the previous period's end.
    pub start: MediaTime,
    /// Invalid when open-ended (last period of a live presentation).
    pub duration: MediaTime,
    /// An early-available period whose timing cannot be resolved yet.
    pub is_early: bool,
    pub base_urls: Vec<BaseUrl>,
    pub segment_base: Option<SegmentBase>,
    pub segment_template: Option<SegmentTemplate>,
    pub has_segment_list: bool,
    pub event_streams: Vec<EventStreamInfo>,
    pub xlink_href: Option<String>,
    pub adaptation_sets: Vec<AdaptationSet>,
}

impl Period {
    pub fn end(&self) -> MediaTime {
        if self.duration.is_valid() {
            self.start + self.duration
        } else {
            MediaTime::invalid()
        }
    }

    pub fn adaptation_sets_of_type(
        &self,
        stream_type: StreamType,
    ) -> impl Iterator<Item = (usize, &AdaptationSet)> {
        self.adaptation_sets
            .iter()
            .enumerate()
            .filter(move |(_, a)| a.stream_type == Some(stream_type))
    }
}

#[derive(Clone, Debug)]
pub struct MpdDocument {
    /// Distinct per parsed document; addresses embed it for Gone detection.
    pub generation: u64,
    pub document_url: Url,
    pub presentation_type: PresentationType,
    pub availability_start_time: Option<DateTime<Utc>>,
    pub availability_end_time: Option<DateTime<Utc>>,
    pub publish_time: Option<DateTime<Utc>>,
    pub media_presentation_duration: MediaTime,
    pub minimum_update_period: MediaTime,
    pub time_shift_buffer_depth: MediaTime,
    pub suggested_presentation_delay: MediaTime,
    pub min_buffer_time: MediaTime,
    pub base_urls: Vec<BaseUrl>,
    pub producer_reference_times: Vec<ProducerReferenceTime>,
    pub low_latency: Option<LowLatencyDescriptor>,
    pub periods: Vec<Period>,
}

impl MpdDocument {
    pub fn is_static(&self) -> bool {
        self.presentation_type == PresentationType::Static
    }

    /// Dynamic presentation with a fixed published end and no scheduled
    /// updates: an event that ends at a known wallclock time.
    pub fn is_dynamic_event(&self) -> bool {
        self.presentation_type == PresentationType::Dynamic
            && self.media_presentation_duration.is_valid()
            && !self.minimum_update_period.is_valid()
    }

    /// Whether the manifest is expected to be refreshed over time.
    pub fn updates_expected(&self) -> bool {
        self.presentation_type == PresentationType::Dynamic
            && self.minimum_update_period.is_valid()
    }

    pub fn uses_availability_start_time(&self) -> bool {
        self.presentation_type == PresentationType::Dynamic
            && self.availability_start_time.is_some()
    }

    /// End of the last period relative to the anchor. With
    /// `fallback_to_declared` the MPD-declared presentation duration stands
    /// in for an open-ended last period.
    pub fn last_period_end(&self, fallback_to_declared: bool) -> MediaTime {
        let last = match self.periods.last() {
            Some(p) => p,
            None => return MediaTime::invalid(),
        };
        let end = last.end();
        if end.is_valid() {
            end
        } else if fallback_to_declared && self.media_presentation_duration.is_valid() {
            self.media_presentation_duration
        } else {
            MediaTime::pos_infinity()
        }
    }

    pub fn producer_reference_time(&self, id: i64) -> Option<&ProducerReferenceTime> {
        self.producer_reference_times.iter().find(|p| p.id == id)
    }

    pub fn period_index_by_id(&self, id: &str) -> Option<usize> {
        self.periods.iter().position(|p| p.id == id)
    }

    // Address resolution. A mismatched generation means the caller holds an
    // address into a replaced document: the node is Gone.

    pub fn period(&self, addr: PeriodAddress) -> Option<&Period> {
        if addr.generation != self.generation {
            return None;
        }
        self.periods.get(addr.period)
    }

    pub fn adaptation_set(&self, addr: AdaptationSetAddress) -> Option<&AdaptationSet> {
        self.period(addr.period_address())?
            .adaptation_sets
            .get(addr.adaptation_set)
    }

    pub fn representation(&self, addr: RepresentationAddress) -> Option<&Representation> {
        self.adaptation_set(addr.adaptation_set_address())?
            .representations
            .get(addr.representation)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeriodAddress {
    pub generation: u64,
    pub period: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AdaptationSetAddress {
    pub generation: u64,
    pub period: usize,
    pub adaptation_set: usize,
}

impl AdaptationSetAddress {
    pub fn period_address(&self) -> PeriodAddress {
        PeriodAddress {
            generation: self.generation,
            period: self.period,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RepresentationAddress {
    pub generation: u64,
    pub period: usize,
    pub adaptation_set: usize,
    pub representation: usize,
}

impl RepresentationAddress {
    pub fn adaptation_set_address(&self) -> AdaptationSetAddress {
        AdaptationSetAddress {
            generation: self.generation,
            period: self.period,
            adaptation_set: self.adaptation_set,
        }
    }

    pub fn period_address(&self) -> PeriodAddress {
        PeriodAddress {
            generation: self.generation,
            period: self.period,
        }
    }
}
