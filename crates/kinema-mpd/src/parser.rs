//! quick-xml pull parser building the arena document model.
//!
//! Tolerant of unknown elements and attributes: everything the engine does
//! not consume is skipped. Defaults follow ISO/IEC 23009-1 (timescale 1,
//! startNumber 1, presentationTimeOffset 0, BaseURL priority/weight 1).

use chrono::{DateTime, Utc};
use kinema_core::{ContainerFormat, MediaTime, StreamType};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;
use url::Url;

use crate::error::MpdError;
use crate::model::*;

const SWITCHING_SCHEME: &str = "urn:mpeg:dash:adaptation-set-switching:2016";
const COMMON_PROTECTION_SCHEME: &str = "urn:mpeg:dash:mp4protection:2011";

/// Hierarchy level a `<SegmentBase>`/`<SegmentTemplate>` attaches to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Level {
    Period,
    AdaptationSet,
    Representation,
}

#[derive(Default)]
struct ParseState {
    period: Option<Period>,
    adaptation_set: Option<AdaptationSet>,
    representation: Option<Representation>,
    segment_base: Option<(SegmentBase, Level)>,
    segment_template: Option<(SegmentTemplate, Level)>,
    timeline: Option<SegmentTimeline>,
    base_url: Option<BaseUrl>,
    in_service_description: bool,
}

impl ParseState {
    fn current_level(&self) -> Level {
        if self.representation.is_some() {
            Level::Representation
        } else if self.adaptation_set.is_some() {
            Level::AdaptationSet
        } else {
            Level::Period
        }
    }
}

struct Attrs {
    pairs: Vec<(String, String)>,
}

impl Attrs {
    fn read(e: &BytesStart) -> Result<Self, MpdError> {
        let mut pairs = Vec::new();
        for attr in e.attributes() {
            let attr = attr?;
            let key = std::str::from_utf8(attr.key.as_ref())?.to_string();
            let value = attr
                .unescape_value()
                .map_err(|e| MpdError::Parse(e.to_string()))?
                .to_string();
            pairs.push((key, value));
        }
        Ok(Self { pairs })
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == name || k.rsplit(':').next() == Some(name))
            .map(|(_, v)| v.as_str())
    }

    fn parse<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(|v| v.parse::<T>().ok())
    }

    fn duration(&self, name: &str) -> MediaTime {
        self.get(name).map(parse_iso_duration).unwrap_or_default()
    }

    fn date_time(&self, name: &str) -> Option<DateTime<Utc>> {
        self.get(name)
            .and_then(|v| v.parse::<DateTime<Utc>>().ok())
    }
}

fn parse_iso_duration(value: &str) -> MediaTime {
    match iso8601_duration::Duration::parse(value) {
        Ok(iso) => match iso.to_std() {
            Some(d) => MediaTime::from_duration(d),
            None => MediaTime::invalid(),
        },
        Err(_) => MediaTime::invalid(),
    }
}

fn infer_stream_type(content_type: &str, mime_type: &str) -> Option<StreamType> {
    let ct = if content_type.is_empty() {
        mime_type
    } else {
        content_type
    };
    if ct.starts_with("video") {
        Some(StreamType::Video)
    } else if ct.starts_with("audio") {
        Some(StreamType::Audio)
    } else if ct.starts_with("text") || ct.starts_with("application/ttml") {
        Some(StreamType::Subtitle)
    } else {
        None
    }
}

fn infer_container(mime_type: &str) -> ContainerFormat {
    if mime_type.contains("webm") || mime_type.contains("matroska") {
        ContainerFormat::Matroska
    } else {
        ContainerFormat::IsoBmff
    }
}

fn parse_url_range(attrs: &Attrs) -> UrlRange {
    UrlRange {
        source_url: attrs.get("sourceURL").map(str::to_string),
        range: attrs.get("range").map(str::to_string),
    }
}

fn parse_segment_base(attrs: &Attrs) -> SegmentBase {
    SegmentBase {
        timescale: attrs.parse("timescale"),
        presentation_time_offset: attrs.parse("presentationTimeOffset"),
        index_range: attrs.get("indexRange").map(str::to_string),
        index_range_exact: attrs.parse("indexRangeExact").unwrap_or(false),
        initialization: None,
        representation_index: None,
        availability_time_offset: attrs.parse("availabilityTimeOffset"),
    }
}

fn parse_segment_template(attrs: &Attrs) -> SegmentTemplate {
    SegmentTemplate {
        timescale: attrs.parse("timescale"),
        presentation_time_offset: attrs.parse("presentationTimeOffset"),
        media: attrs.get("media").map(str::to_string),
        initialization_template: attrs.get("initialization").map(str::to_string),
        initialization: None,
        start_number: attrs.parse("startNumber"),
        end_number: attrs.parse("endNumber"),
        duration: attrs.parse("duration"),
        ept_delta: attrs.parse("eptDelta"),
        availability_time_offset: attrs.parse("availabilityTimeOffset"),
        timeline: None,
    }
}

fn parse_event_stream(attrs: &Attrs) -> EventStreamInfo {
    EventStreamInfo {
        scheme_id_uri: attrs.get("schemeIdUri").unwrap_or_default().to_string(),
        value: attrs.get("value").unwrap_or_default().to_string(),
        timescale: attrs.parse("timescale").unwrap_or(1),
        presentation_time_offset: attrs.parse("presentationTimeOffset").unwrap_or(0),
    }
}

fn parse_base_url_start(attrs: &Attrs) -> BaseUrl {
    BaseUrl {
        url: String::new(),
        service_location: attrs.get("serviceLocation").map(str::to_string),
        priority: attrs.parse("priority").unwrap_or(1),
        weight: attrs.parse("weight").unwrap_or(1),
    }
}

/// Parse an MPD document. `generation` must be distinct per parsed snapshot;
/// the manifest reader hands out increasing values.
pub fn parse_mpd(xml: &str, document_url: Url, generation: u64) -> Result<MpdDocument, MpdError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut doc = MpdDocument {
        generation,
        document_url,
        presentation_type: PresentationType::Static,
        availability_start_time: None,
        availability_end_time: None,
        publish_time: None,
        media_presentation_duration: MediaTime::invalid(),
        minimum_update_period: MediaTime::invalid(),
        time_shift_buffer_depth: MediaTime::invalid(),
        suggested_presentation_delay: MediaTime::invalid(),
        min_buffer_time: MediaTime::invalid(),
        base_urls: Vec::new(),
        producer_reference_times: Vec::new(),
        low_latency: None,
        periods: Vec::new(),
    };
    let mut st = ParseState::default();
    let mut saw_mpd_element = false;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| MpdError::Parse(e.to_string()))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let empty = matches!(event, Event::Empty(_));
                let name = e.local_name();
                let tag = std::str::from_utf8(name.as_ref())?.to_string();
                let attrs = Attrs::read(e)?;
                match tag.as_str() {
                    "MPD" => {
                        saw_mpd_element = true;
                        if attrs.get("type") == Some("dynamic") {
                            doc.presentation_type = PresentationType::Dynamic;
                        }
                        doc.availability_start_time = attrs.date_time("availabilityStartTime");
                        doc.availability_end_time = attrs.date_time("availabilityEndTime");
                        doc.publish_time = attrs.date_time("publishTime");
                        doc.media_presentation_duration =
                            attrs.duration("mediaPresentationDuration");
                        doc.minimum_update_period = attrs.duration("minimumUpdatePeriod");
                        doc.time_shift_buffer_depth = attrs.duration("timeShiftBufferDepth");
                        doc.suggested_presentation_delay =
                            attrs.duration("suggestedPresentationDelay");
                        doc.min_buffer_time = attrs.duration("minBufferTime");
                    }
                    "Period" => {
                        st.period = Some(Period {
                            id: attrs.get("id").unwrap_or_default().to_string(),
                            start: attrs.duration("start"),
                            duration: attrs.duration("duration"),
                            is_early: false,
                            base_urls: Vec::new(),
                            segment_base: None,
                            segment_template: None,
                            has_segment_list: false,
                            event_streams: Vec::new(),
                            xlink_href: attrs.get("href").map(str::to_string),
                            adaptation_sets: Vec::new(),
                        });
                        if empty {
                            finish_period(&mut doc, &mut st);
                        }
                    }
                    "AdaptationSet" if st.period.is_some() => {
                        let mime = attrs.get("mimeType").unwrap_or_default().to_string();
                        let content_type = attrs.get("contentType").unwrap_or_default();
                        st.adaptation_set = Some(AdaptationSet {
                            id: attrs.get("id").unwrap_or_default().to_string(),
                            stream_type: infer_stream_type(content_type, &mime),
                            language: attrs.get("lang").unwrap_or_default().to_string(),
                            codecs: attrs.get("codecs").unwrap_or_default().to_string(),
                            mime_type: mime,
                            selection_priority: attrs.parse("selectionPriority").unwrap_or(1),
                            base_urls: Vec::new(),
                            segment_base: None,
                            segment_template: None,
                            has_segment_list: false,
                            content_protections: Vec::new(),
                            inband_event_streams: Vec::new(),
                            switch_to_ids: Vec::new(),
                            in_switch_group: false,
                            representations: Vec::new(),
                        });
                        if empty {
                            finish_adaptation_set(&mut st);
                        }
                    }
                    "Representation" if st.adaptation_set.is_some() => {
                        let aset = st.adaptation_set.as_ref().expect("checked");
                        let mime = attrs
                            .get("mimeType")
                            .map(str::to_string)
                            .unwrap_or_else(|| aset.mime_type.clone());
                        let codecs = attrs
                            .get("codecs")
                            .map(str::to_string)
                            .unwrap_or_else(|| aset.codecs.clone());
                        st.representation = Some(Representation {
                            id: attrs.get("id").unwrap_or_default().to_string(),
                            bandwidth: attrs.parse("bandwidth").unwrap_or(0),
                            codecs,
                            container: infer_container(&mime),
                            mime_type: mime,
                            selection_priority: attrs.parse("selectionPriority").unwrap_or(1),
                            base_urls: Vec::new(),
                            segment_base: None,
                            segment_template: None,
                            has_segment_list: false,
                            inband_event_streams: Vec::new(),
                            other_attributes: attrs.pairs.clone(),
                        });
                        if empty {
                            finish_representation(&mut st);
                        }
                    }
                    "SegmentBase" => {
                        let sb = parse_segment_base(&attrs);
                        let level = st.current_level();
                        if empty {
                            attach_segment_base(&mut st, sb, level);
                        } else {
                            st.segment_base = Some((sb, level));
                        }
                    }
                    "SegmentTemplate" => {
                        let tpl = parse_segment_template(&attrs);
                        let level = st.current_level();
                        if empty {
                            attach_segment_template(&mut st, tpl, level);
                        } else {
                            st.segment_template = Some((tpl, level));
                        }
                    }
                    "SegmentList" => {
                        // Unsupported addressing mode; recorded so the search
                        // engine can reject the representation.
                        match st.current_level() {
                            Level::Representation => {
                                if let Some(r) = st.representation.as_mut() {
                                    r.has_segment_list = true;
                                }
                            }
                            Level::AdaptationSet => {
                                if let Some(a) = st.adaptation_set.as_mut() {
                                    a.has_segment_list = true;
                                }
                            }
                            Level::Period => {
                                if let Some(p) = st.period.as_mut() {
                                    p.has_segment_list = true;
                                }
                            }
                        }
                    }
                    "SegmentTimeline" => {
                        st.timeline = Some(SegmentTimeline::default());
                    }
                    "S" => {
                        if let Some(tl) = st.timeline.as_mut() {
                            tl.elements.push(SElement {
                                t: attrs.parse("t"),
                                n: attrs.parse("n"),
                                d: attrs.parse("d"),
                                r: attrs.parse("r").unwrap_or(0),
                                k: attrs.parse("k"),
                            });
                        }
                    }
                    "Initialization" => {
                        let ur = parse_url_range(&attrs);
                        if let Some((sb, _)) = st.segment_base.as_mut() {
                            sb.initialization = Some(ur);
                        } else if let Some((tpl, _)) = st.segment_template.as_mut() {
                            tpl.initialization = Some(ur);
                        }
                    }
                    "RepresentationIndex" => {
                        if let Some((sb, _)) = st.segment_base.as_mut() {
                            sb.representation_index = Some(parse_url_range(&attrs));
                        }
                    }
                    "BaseURL" => {
                        if empty {
                            debug!("kinema-mpd: empty BaseURL element ignored");
                        } else {
                            st.base_url = Some(parse_base_url_start(&attrs));
                        }
                    }
                    "ContentProtection" => {
                        let scheme = attrs.get("schemeIdUri").unwrap_or_default().to_string();
                        let cp = ContentProtection {
                            common_scheme: scheme.eq_ignore_ascii_case(COMMON_PROTECTION_SCHEME),
                            value: attrs.get("value").unwrap_or_default().to_string(),
                            default_kid: attrs.get("default_KID").unwrap_or_default().to_string(),
                            scheme_id_uri: scheme,
                        };
                        if let Some(a) = st.adaptation_set.as_mut() {
                            a.content_protections.push(cp);
                        }
                    }
                    "SupplementalProperty" => {
                        if attrs.get("schemeIdUri") == Some(SWITCHING_SCHEME) {
                            if let Some(a) = st.adaptation_set.as_mut() {
                                a.switch_to_ids.extend(
                                    attrs
                                        .get("value")
                                        .unwrap_or_default()
                                        .split(',')
                                        .map(|s| s.trim().to_string())
                                        .filter(|s| !s.is_empty()),
                                );
                            }
                        }
                    }
                    "EventStream" => {
                        if let Some(p) = st.period.as_mut() {
                            p.event_streams.push(parse_event_stream(&attrs));
                        }
                    }
                    "InbandEventStream" => {
                        let ev = parse_event_stream(&attrs);
                        if let Some(r) = st.representation.as_mut() {
                            r.inband_event_streams.push(ev);
                        } else if let Some(a) = st.adaptation_set.as_mut() {
                            a.inband_event_streams.push(ev);
                        }
                    }
                    "ProducerReferenceTime" => {
                        doc.producer_reference_times.push(ProducerReferenceTime {
                            id: attrs.parse("id").unwrap_or(-1),
                            wall_clock_time: attrs.date_time("wallClockTime"),
                            presentation_time: attrs.parse("presentationTime").unwrap_or(0),
                        });
                    }
                    "ServiceDescription" => {
                        st.in_service_description = true;
                    }
                    "Latency" if st.in_service_description => {
                        doc.low_latency = Some(LowLatencyDescriptor {
                            reference_id: attrs.parse("referenceId").unwrap_or(-1),
                            target: attrs
                                .parse::<i64>("target")
                                .map(MediaTime::from_millis)
                                .unwrap_or_default(),
                            min: attrs
                                .parse::<i64>("min")
                                .map(MediaTime::from_millis)
                                .unwrap_or_default(),
                            max: attrs
                                .parse::<i64>("max")
                                .map(MediaTime::from_millis)
                                .unwrap_or_default(),
                        });
                    }
                    _ => {}
                }
            }
            Event::Text(ref t) => {
                if let Some(base) = st.base_url.as_mut() {
                    base.url = t
                        .unescape()
                        .map_err(|e| MpdError::Parse(e.to_string()))?
                        .trim()
                        .to_string();
                }
            }
            Event::End(ref e) => {
                let name = e.local_name();
                let tag = std::str::from_utf8(name.as_ref())?;
                match tag {
                    "Period" => finish_period(&mut doc, &mut st),
                    "AdaptationSet" => finish_adaptation_set(&mut st),
                    "Representation" => finish_representation(&mut st),
                    "SegmentBase" => {
                        if let Some((sb, level)) = st.segment_base.take() {
                            attach_segment_base(&mut st, sb, level);
                        }
                    }
                    "SegmentTemplate" => {
                        if let Some((mut tpl, level)) = st.segment_template.take() {
                            tpl.timeline = st.timeline.take();
                            attach_segment_template(&mut st, tpl, level);
                        }
                    }
                    "BaseURL" => {
                        if let Some(base) = st.base_url.take() {
                            if base.url.is_empty() {
                                debug!("kinema-mpd: BaseURL without text content ignored");
                            } else if let Some(r) = st.representation.as_mut() {
                                r.base_urls.push(base);
                            } else if let Some(a) = st.adaptation_set.as_mut() {
                                a.base_urls.push(base);
                            } else if let Some(p) = st.period.as_mut() {
                                p.base_urls.push(base);
                            } else {
                                doc.base_urls.push(base);
                            }
                        }
                    }
                    "ServiceDescription" => st.in_service_description = false,
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_mpd_element {
        return Err(MpdError::Parse("document has no <MPD> root element".into()));
    }

    finalize(&mut doc);
    Ok(doc)
}

fn attach_segment_base(st: &mut ParseState, sb: SegmentBase, level: Level) {
    match level {
        Level::Representation => {
            if let Some(r) = st.representation.as_mut() {
                r.segment_base = Some(sb);
            }
        }
        Level::AdaptationSet => {
            if let Some(a) = st.adaptation_set.as_mut() {
                a.segment_base = Some(sb);
            }
        }
        Level::Period => {
            if let Some(p) = st.period.as_mut() {
                p.segment_base = Some(sb);
            }
        }
    }
}

fn attach_segment_template(st: &mut ParseState, tpl: SegmentTemplate, level: Level) {
    match level {
        Level::Representation => {
            if let Some(r) = st.representation.as_mut() {
                r.segment_template = Some(tpl);
            }
        }
        Level::AdaptationSet => {
            if let Some(a) = st.adaptation_set.as_mut() {
                a.segment_template = Some(tpl);
            }
        }
        Level::Period => {
            if let Some(p) = st.period.as_mut() {
                p.segment_template = Some(tpl);
            }
        }
    }
}

fn finish_representation(st: &mut ParseState) {
    if let (Some(rep), Some(aset)) = (st.representation.take(), st.adaptation_set.as_mut()) {
        aset.representations.push(rep);
    }
}

fn finish_adaptation_set(st: &mut ParseState) {
    if let (Some(mut aset), Some(period)) = (st.adaptation_set.take(), st.period.as_mut()) {
        // Keep representations ordered by ascending bandwidth so quality
        // indices are stable.
        aset.representations.sort_by_key(|r| r.bandwidth);
        period.adaptation_sets.push(aset);
    }
}

fn finish_period(doc: &mut MpdDocument, st: &mut ParseState) {
    if let Some(mut period) = st.period.take() {
        if period.xlink_href.is_some() && period.adaptation_sets.is_empty() {
            period.is_early = true;
        }
        doc.periods.push(period);
    }
}

/// Resolve period starts/durations and cross-references after parsing.
fn finalize(doc: &mut MpdDocument) {
    // Period timing: explicit @start wins, otherwise a period begins at the
    // previous period's end. Durations fall back to the gap to the next
    // period and finally to the declared presentation duration.
    let mut prev_end = MediaTime::ZERO;
    let count = doc.periods.len();
    for i in 0..count {
        if !doc.periods[i].start.is_valid() {
            if prev_end.is_valid() {
                doc.periods[i].start = prev_end;
            } else {
                doc.periods[i].is_early = true;
            }
        }
        prev_end = doc.periods[i].end();
    }
    for i in 0..count {
        if !doc.periods[i].duration.is_valid() {
            let next_start = doc
                .periods
                .get(i + 1)
                .map(|p| p.start)
                .unwrap_or(MediaTime::invalid());
            let own_start = doc.periods[i].start;
            if next_start.is_valid() && own_start.is_valid() {
                doc.periods[i].duration = next_start - own_start;
            } else if i + 1 == count
                && doc.media_presentation_duration.is_valid()
                && own_start.is_valid()
            {
                doc.periods[i].duration = doc.media_presentation_duration - own_start;
            }
        }
    }

    // Mark adaptation sets referenced as switch targets.
    for period in doc.periods.iter_mut() {
        let mut targets: Vec<String> = Vec::new();
        for aset in period.adaptation_sets.iter() {
            targets.extend(aset.switch_to_ids.iter().cloned());
        }
        for aset in period.adaptation_sets.iter_mut() {
            if targets.iter().any(|t| *t == aset.id) {
                aset.in_switch_group = true;
            }
        }
    }
}
