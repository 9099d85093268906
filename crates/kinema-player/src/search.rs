//! The segment search engine.
//!
//! Maps `(period-local search time, search type)` onto one concrete
//! [`SegmentInfo`] for a representation, across the four DASH addressing
//! modes: `SegmentBase`+sidx, `SegmentBase` for Matroska, fixed-duration
//! `SegmentTemplate`, and `SegmentTemplate`+`SegmentTimeline`. Follows the
//! DASH-IF-IOP timing model, which is stricter than the base standard and
//! removes its ambiguities.

use std::collections::HashMap;
use std::sync::Arc;

use kinema_core::{ContainerFormat, MediaTime, StreamType};
use kinema_index::{CachedEntity, CueSearchMode, MatroskaIndex, SidxBox};
use kinema_mpd::{
    apply_annex_e_byte_range, collect_base_url_candidates, substitute_template, AdaptationSet,
    CandidateUrl, MpdDocument, Period, Representation, RepresentationAddress, SegmentBase,
    SegmentTemplate, SelectFor, TemplateVars, UrlRange,
};
use kinema_net::RangeSpec;
use parking_lot::Mutex;
use tracing::warn;

use crate::segment::{LoadRequest, LoadRequestKind, SegmentInfo, SegmentUrl};
use crate::services::SessionServices;

/// Matroska cue lookups are reported in 100ns ticks.
const MKV_TIMESCALE: u32 = 10_000_000;

/// Gap/overlap tolerance before timeline repair kicks in, in milliseconds.
/// Rounding errors in encoder pipelines below this are ignored.
const TIMELINE_TOLERANCE_MS: i64 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchType {
    /// Whichever of the candidate and its predecessor starts nearer.
    Closest,
    /// The segment containing the search time.
    Before,
    /// Alias of `Before`: the segment containing the search time.
    Same,
    /// The next segment; the caller pre-biases the search time into the
    /// current segment's body.
    After,
    /// The segment preceding the one containing the search time.
    StrictlyBefore,
    /// Like `After`; distinct for period-level searches.
    StrictlyAfter,
}

#[derive(Clone, Debug)]
pub struct SearchOptions {
    pub period_local_time: MediaTime,
    pub period_duration: MediaTime,
    /// Playback-range end, period-local. Caps the resolvable timeline.
    pub period_presentation_end: MediaTime,
    pub has_following_period: bool,
    pub search_type: SearchType,
    pub frame_accurate: bool,
    pub quality_index: usize,
    pub max_quality_index: usize,
    pub stream_type: StreamType,
    /// Only resolve the init/media URLs, no timeline search.
    pub init_segment_setup_only: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            period_local_time: MediaTime::ZERO,
            period_duration: MediaTime::invalid(),
            period_presentation_end: MediaTime::pos_infinity(),
            has_following_period: false,
            search_type: SearchType::Same,
            frame_accurate: false,
            quality_index: 0,
            max_quality_index: 0,
            stream_type: StreamType::Video,
            init_segment_setup_only: false,
        }
    }
}

#[derive(Debug)]
pub enum SearchOutcome {
    /// Segment resolved and ready to become a request.
    Found(Box<SegmentInfo>),
    /// A remote element must be loaded first; submit the requests (possibly
    /// none, when a load is already in flight) and retry later.
    NeedElement(Vec<LoadRequest>),
    /// At or beyond the resolvable end of the period/presentation.
    PastEos,
    /// The manifest node behind the address vanished; retry against a fresh
    /// snapshot.
    Gone,
    /// The representation violates DASH/IOP constraints and is permanently
    /// unusable; pick another one.
    BadType,
}

/// Per-representation mutable search state: the lazily loaded segment
/// index, the usability flag and one-shot warning latches. Lives beside the
/// immutable document arena; accessed only from the player worker.
#[derive(Debug, Default)]
pub struct RepresentationSearchState {
    usable: bool,
    needs_index: bool,
    pending_index_load: bool,
    sidx: Option<Arc<SidxBox>>,
    matroska: Option<Arc<MatroskaIndex>>,
    index_range_start: u64,
    index_range_size: u64,
    warned_timescale: bool,
    warned_timeline_start_gap: bool,
    warned_timeline_overlap: bool,
    warned_inconsistent_numbering: bool,
    warned_no_t_after_repeat: bool,
}

impl RepresentationSearchState {
    fn new() -> Self {
        Self {
            usable: true,
            needs_index: true,
            ..Default::default()
        }
    }
}

/// Table of per-representation search state, keyed by arena address. A new
/// manifest generation produces new addresses and naturally orphans stale
/// entries.
#[derive(Default)]
pub struct SearchStateTable {
    inner: Mutex<HashMap<RepresentationAddress, RepresentationSearchState>>,
}

impl SearchStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(
        &self,
        addr: RepresentationAddress,
        f: impl FnOnce(&mut RepresentationSearchState) -> R,
    ) -> R {
        let mut map = self.inner.lock();
        let state = map
            .entry(addr)
            .or_insert_with(RepresentationSearchState::new);
        f(state)
    }

    pub fn is_usable(&self, addr: RepresentationAddress) -> bool {
        self.with(addr, |s| s.usable)
    }

    pub fn mark_unusable(&self, addr: RepresentationAddress) {
        self.with(addr, |s| s.usable = false);
    }

    pub fn has_pending_index_load(&self, addr: RepresentationAddress) -> bool {
        self.with(addr, |s| s.pending_index_load)
    }

    /// Average segment duration from a loaded `sidx`, when one is present.
    pub fn average_sidx_duration(&self, addr: RepresentationAddress) -> Option<MediaTime> {
        self.with(addr, |s| {
            let sidx = s.sidx.as_ref()?;
            if sidx.entries.is_empty() {
                return None;
            }
            let sum = sidx.total_duration() as i64;
            Some(MediaTime::from_nd(
                sum / sidx.entries.len() as i64,
                sidx.timescale,
            ))
        })
    }

    /// Install the result of a segment-index load. A failed load marks the
    /// representation unusable for the rest of this manifest's life.
    pub fn complete_index_load(
        &self,
        addr: RepresentationAddress,
        entity: Option<CachedEntity>,
    ) {
        self.with(addr, |s| {
            s.pending_index_load = false;
            match entity {
                Some(CachedEntity::Sidx(sidx)) => {
                    s.sidx = Some(sidx);
                    s.usable = true;
                }
                Some(CachedEntity::Matroska(index)) => {
                    s.matroska = Some(index);
                    s.usable = true;
                }
                Some(CachedEntity::Raw(_)) | None => {
                    warn!("segment index load failed, marking representation as unusable");
                    s.usable = false;
                }
            }
        });
    }
}

struct Levels<'a> {
    representation: &'a Representation,
    adaptation_set: &'a AdaptationSet,
    period: &'a Period,
    bases: Vec<&'a SegmentBase>,
    templates: Vec<&'a SegmentTemplate>,
}

fn attr<'a, L, T>(levels: &'a [&'a L], get: impl Fn(&'a L) -> Option<T>) -> Option<T> {
    levels.iter().find_map(|l| get(l))
}

fn sum_ato<L>(levels: &[&L], get: impl Fn(&L) -> Option<f64>) -> MediaTime {
    let sum: f64 = levels.iter().filter_map(|l| get(l)).sum();
    MediaTime::from_seconds_f64(sum)
}

/// The engine itself is stateless; mutable per-representation state lives
/// in the session's [`SearchStateTable`].
#[derive(Debug, Default)]
pub struct SegmentSearchEngine;

impl SegmentSearchEngine {
    pub fn new() -> Self {
        Self
    }

    /// Resolve one segment for `addr` per the search options.
    pub fn find_segment(
        &self,
        services: &SessionServices,
        doc: &MpdDocument,
        addr: RepresentationAddress,
        options: &SearchOptions,
    ) -> SearchOutcome {
        let levels = match gather_levels(doc, addr) {
            Some(l) => l,
            None => return SearchOutcome::Gone,
        };

        // SegmentList anywhere in the hierarchy means SegmentList all the
        // way down (5.3.9.1), which is not supported.
        if levels.representation.has_segment_list
            || levels.adaptation_set.has_segment_list
            || levels.period.has_segment_list
        {
            services.search_state.mark_unusable(addr);
            return SearchOutcome::BadType;
        }

        // A single hierarchy level may carry at most one addressing scheme.
        let level_conflict = [
            (
                levels.representation.segment_base.is_some(),
                levels.representation.segment_template.is_some(),
            ),
            (
                levels.adaptation_set.segment_base.is_some(),
                levels.adaptation_set.segment_template.is_some(),
            ),
            (
                levels.period.segment_base.is_some(),
                levels.period.segment_template.is_some(),
            ),
        ];
        let mut seen_any = false;
        for (has_base, has_template) in level_conflict {
            if !seen_any && has_base && has_template {
                warn!(
                    representation = %levels.representation.id,
                    "representation carries both SegmentBase and SegmentTemplate on one level"
                );
                services.search_state.mark_unusable(addr);
                return SearchOutcome::BadType;
            }
            seen_any = seen_any || has_base || has_template;
        }

        if levels.representation.is_sideloaded_text() {
            return self.setup_sideloaded(services, doc, addr, &levels, options);
        }

        if levels.bases.is_empty() && levels.templates.is_empty() {
            warn!(
                representation = %levels.representation.id,
                "neither SegmentBase nor SegmentTemplate anywhere in the MPD hierarchy"
            );
            services.search_state.mark_unusable(addr);
            return SearchOutcome::BadType;
        }

        if options.init_segment_setup_only {
            let mut info = SegmentInfo::default();
            let ok = if !levels.bases.is_empty() {
                self.prepare_download_urls_base(services, doc, addr, &levels, &mut info)
            } else {
                self.prepare_download_urls_template(services, doc, addr, &levels, &mut info)
            };
            return if ok {
                SearchOutcome::Found(Box::new(info))
            } else {
                services.search_state.mark_unusable(addr);
                SearchOutcome::BadType
            };
        }

        if !levels.bases.is_empty() {
            match levels.representation.container {
                ContainerFormat::IsoBmff => {
                    self.find_segment_base_mp4(services, doc, addr, &levels, options)
                }
                ContainerFormat::Matroska => {
                    self.find_segment_base_mkv(services, doc, addr, &levels, options)
                }
            }
        } else {
            let has_timeline = attr(&levels.templates, |t| t.timeline.as_ref()).is_some();
            if has_timeline {
                self.find_segment_timeline(services, doc, addr, &levels, options)
            } else {
                self.find_segment_template(services, doc, addr, &levels, options)
            }
        }
    }

    // Segment index loading (SegmentBase modes)

    /// Idempotent per representation: while a load is outstanding repeated
    /// calls return `NeedElement` without issuing another request.
    fn prepare_segment_index(
        &self,
        services: &SessionServices,
        doc: &MpdDocument,
        addr: RepresentationAddress,
        levels: &Levels<'_>,
        options: &SearchOptions,
    ) -> Result<(), SearchOutcome> {
        let (pending, have_index, needs_index) = services.search_state.with(addr, |s| {
            (
                s.pending_index_load,
                s.sidx.is_some() || s.matroska.is_some(),
                s.needs_index,
            )
        });
        if pending {
            return Err(SearchOutcome::NeedElement(Vec::new()));
        }
        if have_index || !needs_index {
            return Ok(());
        }
        services.search_state.with(addr, |s| s.needs_index = false);

        let rep = levels.representation;
        let representation_index =
            attr(&levels.bases, |b| b.representation_index.clone()).unwrap_or_default();
        let mut index_url_range = representation_index.range.clone().unwrap_or_default();
        if representation_index
            .source_url
            .as_deref()
            .is_some_and(|u| !u.is_empty())
        {
            // A RepresentationIndex URL makes the byte addressing of the
            // following moof boxes undefined (ISO/IEC 23009-1 8.3.3);
            // ignore the URL and keep the range.
            warn!(
                representation = %rep.id,
                "RepresentationIndex specifies a URL, ignoring it"
            );
        }
        let index_range_attr = attr(&levels.bases, |b| b.index_range.clone()).unwrap_or_default();
        if !index_url_range.is_empty()
            && !index_range_attr.is_empty()
            && index_url_range != index_range_attr
        {
            warn!(
                representation = %rep.id,
                "RepresentationIndex range differs from @indexRange"
            );
            services.search_state.mark_unusable(addr);
            return Err(SearchOutcome::BadType);
        }
        if index_url_range.is_empty() {
            index_url_range = index_range_attr;
        }
        if index_url_range.is_empty() {
            warn!(
                representation = %rep.id,
                "SegmentBase does not specify a byte range for the index"
            );
            services.search_state.mark_unusable(addr);
            return Err(SearchOutcome::BadType);
        }

        let Some(range) = RangeSpec::parse(&index_url_range) else {
            services.search_state.mark_unusable(addr);
            return Err(SearchOutcome::BadType);
        };
        let range_size = range.len().unwrap_or(0);
        services.search_state.with(addr, |s| {
            s.index_range_start = range.start;
            s.index_range_size = range_size;
        });

        // Choose the CDN for the index fetch.
        let candidates = collect_base_url_candidates(doc, addr);
        let decision = services.steering.select(SelectFor::Segment, &candidates);
        let Some(chosen) = decision.url else {
            services.search_state.mark_unusable(addr);
            return Err(SearchOutcome::BadType);
        };

        // The Matroska header data (EBML head through Cues) must be parsed
        // as one prefix; merge the init range into the fetch.
        let init_range = attr(&levels.bases, |b| b.initialization.clone())
            .and_then(|i| i.range)
            .and_then(|r| RangeSpec::parse(&r).map(|_| r));
        let (fetch_range, chained) = match rep.container {
            ContainerFormat::IsoBmff => (index_url_range.clone(), None),
            ContainerFormat::Matroska => {
                let end = range.end.unwrap_or(range.start + range_size);
                (format!("0-{end}"), init_range)
            }
        };

        // Already fetched and parsed before?
        if let Some(entity) = services.entity_cache.get(chosen.as_str(), Some(&fetch_range)) {
            let matches_container = matches!(
                (&entity, rep.container),
                (CachedEntity::Sidx(_), ContainerFormat::IsoBmff)
                    | (CachedEntity::Matroska(_), ContainerFormat::Matroska)
            );
            if matches_container {
                services
                    .search_state
                    .complete_index_load(addr, Some(entity));
                return Ok(());
            }
        }

        let url = apply_annex_e_byte_range(
            &chosen,
            &fetch_range,
            decision.byte_range_query_param.as_deref(),
        );
        let request = LoadRequest {
            url,
            range: Some(fetch_range),
            custom_header: decision.custom_header,
            kind: LoadRequestKind::SegmentIndex {
                representation: addr,
                container: rep.container,
                chained_init_range: chained,
            },
            stream_type: options.stream_type,
            quality_index: options.quality_index,
        };
        services.search_state.with(addr, |s| s.pending_index_load = true);
        Err(SearchOutcome::NeedElement(vec![request]))
    }

    // SegmentBase + fmp4 sidx

    fn find_segment_base_mp4(
        &self,
        services: &SessionServices,
        doc: &MpdDocument,
        addr: RepresentationAddress,
        levels: &Levels<'_>,
        options: &SearchOptions,
    ) -> SearchOutcome {
        if !services.search_state.is_usable(addr) {
            return SearchOutcome::BadType;
        }
        if let Err(outcome) = self.prepare_segment_index(services, doc, addr, levels, options) {
            return outcome;
        }
        let (sidx, index_range_start, index_range_size) = services
            .search_state
            .with(addr, |s| (s.sidx.clone(), s.index_range_start, s.index_range_size));
        let Some(sidx) = sidx else {
            warn!(representation = %levels.representation.id, "a segment index is required");
            services.search_state.mark_unusable(addr);
            return SearchOutcome::BadType;
        };
        let sidx_timescale = sidx.timescale;

        // Map the period-local search time onto the media-internal timeline.
        let pto = attr(&levels.bases, |b| b.presentation_time_offset).unwrap_or(0) as i64;
        let mpd_timescale = attr(&levels.bases, |b| b.timescale).unwrap_or(1);
        if pto != 0 && mpd_timescale != sidx_timescale {
            let first = services
                .search_state
                .with(addr, |s| !std::mem::replace(&mut s.warned_timescale, true));
            if first {
                warn!(
                    representation = %levels.representation.id,
                    mpd_timescale,
                    sidx_timescale,
                    "MPD timescale differs from segment index timescale"
                );
            }
        }
        let ato = sum_ato(&levels.bases, |b| b.availability_time_offset);

        let search_time =
            (options.period_local_time.as_timebase(sidx_timescale) + pto).max(0);
        let media_local_end = media_local_end(options, sidx_timescale, pto);
        if search_time >= media_local_end {
            return SearchOutcome::PastEos;
        }

        let start_number: i64 = 0;
        let end_number = sidx.entries.len() as i64;
        let mut current_t = sidx.earliest_presentation_time as i64;
        let mut current_n: i64 = 0;
        let mut current_d: i64 = 0;
        let mut current_offset: i64 = 0;
        let mut previous_t = current_t;
        let mut previous_d: i64 = 0;
        let mut previous_offset: i64 = 0;
        let mut found = false;

        while current_n < end_number {
            let entry = sidx.entries[current_n as usize];
            if entry.is_reference_type {
                warn!(
                    representation = %levels.representation.id,
                    "segment index must reference media directly, not another index"
                );
                services.search_state.mark_unusable(addr);
                return SearchOutcome::BadType;
            }
            if !entry.starts_with_sap {
                warn!(representation = %levels.representation.id, "segment index entry without starts_with_sap");
                services.search_state.mark_unusable(addr);
                return SearchOutcome::BadType;
            }
            if entry.sap_type != 1 && entry.sap_type != 2 {
                warn!(
                    representation = %levels.representation.id,
                    sap_type = entry.sap_type,
                    "segment index requires SAP type 1 or 2"
                );
                services.search_state.mark_unusable(addr);
                return SearchOutcome::BadType;
            }
            current_d = entry.subsegment_duration as i64;
            if current_t >= search_time {
                found = true;
                match options.search_type {
                    SearchType::Closest => {
                        if current_n > start_number
                            && search_time - previous_t < current_t - search_time
                        {
                            current_n -= 1;
                            current_d = previous_d;
                            current_t = previous_t;
                            current_offset = previous_offset;
                        }
                    }
                    SearchType::After | SearchType::StrictlyAfter => {
                        if current_t >= media_local_end {
                            return SearchOutcome::PastEos;
                        }
                    }
                    SearchType::Same | SearchType::Before => {
                        if current_t > search_time && current_n > start_number {
                            current_n -= 1;
                            current_d = previous_d;
                            current_t = previous_t;
                            current_offset = previous_offset;
                        }
                    }
                    SearchType::StrictlyBefore => {
                        if current_n > start_number {
                            current_n -= 1;
                            current_d = previous_d;
                            current_t = previous_t;
                            current_offset = previous_offset;
                        }
                    }
                }
                break;
            }
            previous_t = current_t;
            previous_d = current_d;
            previous_offset = current_offset;
            current_t += current_d;
            current_offset += entry.referenced_size as i64;
            current_n += 1;
        }

        // A search time inside the last segment falls out of the loop.
        if !found && current_t >= search_time && current_n == end_number {
            if matches!(
                options.search_type,
                SearchType::Closest
                    | SearchType::Same
                    | SearchType::Before
                    | SearchType::StrictlyBefore
            ) {
                current_n -= 1;
                current_d = previous_d;
                current_t = previous_t;
                current_offset -= sidx.entries[current_n as usize].referenced_size as i64;
                found = true;
            }
        }

        if !(found && current_t < media_local_end) {
            return SearchOutcome::PastEos;
        }

        let entry = sidx.entries[current_n as usize];
        let mut info = SegmentInfo {
            time: current_t,
            pto,
            duration: current_d,
            number: current_n,
            timescale: sidx_timescale,
            number_of_bytes: entry.referenced_size as u64,
            first_byte_offset: (sidx.first_offset as i64
                + index_range_start as i64
                + index_range_size as i64
                + current_offset) as u64,
            media_local_first_au_time: search_time,
            media_local_first_pts: search_time,
            media_local_last_au_time: media_local_end,
            ato,
            is_last_in_period: current_t + current_d >= media_local_end,
            frame_accuracy_required: options.frame_accurate,
            ..Default::default()
        };
        self.attach_common(services, doc, levels, &mut info);
        if self.prepare_download_urls_base(services, doc, addr, levels, &mut info) {
            SearchOutcome::Found(Box::new(info))
        } else {
            services.search_state.mark_unusable(addr);
            SearchOutcome::BadType
        }
    }

    // SegmentBase + Matroska cues

    fn find_segment_base_mkv(
        &self,
        services: &SessionServices,
        doc: &MpdDocument,
        addr: RepresentationAddress,
        levels: &Levels<'_>,
        options: &SearchOptions,
    ) -> SearchOutcome {
        if !services.search_state.is_usable(addr) {
            return SearchOutcome::BadType;
        }
        if let Err(outcome) = self.prepare_segment_index(services, doc, addr, levels, options) {
            return outcome;
        }
        let index = services.search_state.with(addr, |s| s.matroska.clone());
        let Some(index) = index else {
            warn!(representation = %levels.representation.id, "a segment index is required");
            services.search_state.mark_unusable(addr);
            return SearchOutcome::BadType;
        };
        if index.num_tracks == 0 {
            warn!(representation = %levels.representation.id, "no usable track");
            services.search_state.mark_unusable(addr);
            return SearchOutcome::BadType;
        }
        if index.num_tracks > 1 {
            warn!(representation = %levels.representation.id, "more than one track");
            services.search_state.mark_unusable(addr);
            return SearchOutcome::BadType;
        }

        // PTO is given in the MPD timescale; cue lookups run in HNS.
        let mpd_timescale = attr(&levels.bases, |b| b.timescale).unwrap_or(1);
        let pto_raw = attr(&levels.bases, |b| b.presentation_time_offset).unwrap_or(0);
        let pto = MediaTime::from_nd(pto_raw as i64, mpd_timescale).as_timebase(MKV_TIMESCALE);
        let ato = sum_ato(&levels.bases, |b| b.availability_time_offset);

        let search_time = (options.period_local_time.as_hns() + pto).max(0);
        let media_local_end = media_local_end(options, MKV_TIMESCALE, pto);
        if search_time >= media_local_end {
            return SearchOutcome::PastEos;
        }

        let mode = match options.search_type {
            SearchType::After | SearchType::StrictlyAfter => CueSearchMode::After,
            SearchType::Before | SearchType::StrictlyBefore => CueSearchMode::Before,
            SearchType::Same => CueSearchMode::Before,
            SearchType::Closest => CueSearchMode::Closest,
        };
        let Some(hit) = index.find_cue(search_time, mode) else {
            return SearchOutcome::PastEos;
        };
        if matches!(mode, CueSearchMode::After) && hit.time_hns >= media_local_end {
            return SearchOutcome::PastEos;
        }

        let mut info = SegmentInfo {
            time: hit.time_hns,
            pto,
            duration: hit.duration_hns,
            number: hit.index as i64,
            timescale: MKV_TIMESCALE,
            number_of_bytes: hit.cluster_size.unwrap_or(0),
            first_byte_offset: hit.cluster_offset,
            media_local_first_au_time: search_time,
            media_local_first_pts: search_time,
            media_local_last_au_time: media_local_end,
            ato,
            is_last_in_period: hit.is_last
                || hit.time_hns + hit.duration_hns >= media_local_end,
            frame_accuracy_required: options.frame_accurate,
            ..Default::default()
        };
        self.attach_common(services, doc, levels, &mut info);
        if self.prepare_download_urls_base(services, doc, addr, levels, &mut info) {
            SearchOutcome::Found(Box::new(info))
        } else {
            services.search_state.mark_unusable(addr);
            SearchOutcome::BadType
        }
    }

    // Fixed-duration SegmentTemplate

    fn find_segment_template(
        &self,
        services: &SessionServices,
        doc: &MpdDocument,
        addr: RepresentationAddress,
        levels: &Levels<'_>,
        options: &SearchOptions,
    ) -> SearchOutcome {
        let rep_id = &levels.representation.id;
        let pto = attr(&levels.templates, |t| t.presentation_time_offset).unwrap_or(0) as i64;
        let timescale = attr(&levels.templates, |t| t.timescale).unwrap_or(1);
        let start_number = attr(&levels.templates, |t| t.start_number).unwrap_or(1) as i64;
        let end_number = attr(&levels.templates, |t| t.end_number);
        let duration = attr(&levels.templates, |t| t.duration);
        let ept_delta = attr(&levels.templates, |t| t.ept_delta).unwrap_or(0);
        let ato = sum_ato(&levels.templates, |t| t.availability_time_offset);

        if timescale == 0 {
            warn!(representation = %rep_id, "timescale is invalid");
            services.search_state.mark_unusable(addr);
            return SearchOutcome::BadType;
        }
        if timescale == 1 {
            let first = services
                .search_state
                .with(addr, |s| !std::mem::replace(&mut s.warned_timescale, true));
            if first {
                warn!(representation = %rep_id, "timescale of 1, is this intended?");
            }
        }
        let Some(segment_duration) = duration.filter(|d| *d != 0).map(|d| d as i64) else {
            warn!(representation = %rep_id, "no valid segment duration");
            services.search_state.mark_unusable(addr);
            return SearchOutcome::BadType;
        };

        // The EPT delta shifts the timeline so 0 lands on the first
        // segment's earliest presentation time; PTO does not enter the
        // index computation.
        let search_time =
            (options.period_local_time.as_timebase(timescale) - ept_delta).max(0);
        let media_local_period_end =
            if options.period_duration.is_valid() && !options.period_duration.is_infinity() {
                options
                    .period_duration
                    .as_timebase(timescale)
                    .saturating_sub(ept_delta)
            } else {
                i64::MAX
            };
        let media_local_presentation_end = if options.period_presentation_end.is_valid()
            && !options.period_presentation_end.is_infinity()
        {
            options.period_presentation_end.as_timebase(timescale)
        } else {
            i64::MAX
        };
        let media_local_end = media_local_period_end.min(media_local_presentation_end);
        let mut max_segments = if media_local_end == i64::MAX {
            i64::MAX
        } else {
            (media_local_end + segment_duration - 1) / segment_duration
        };
        // @endNumber is inclusive: startNumber == endNumber is one segment.
        if let Some(end_number) = end_number {
            max_segments = max_segments.min(end_number as i64 - start_number + 1);
        }

        let mut segment_num = search_time / segment_duration;
        let remainder = search_time - segment_num * segment_duration;
        match options.search_type {
            SearchType::Closest => {
                // Truncating division already landed in the containing
                // segment, so only the next one can be nearer.
                if remainder > segment_duration / 2 && segment_num + 1 < max_segments {
                    segment_num += 1;
                }
            }
            SearchType::After | SearchType::StrictlyAfter => {
                // The caller biased the time into the current segment; a
                // zero remainder means the bias already crossed into the
                // next one.
                if remainder != 0 {
                    segment_num += 1;
                }
            }
            SearchType::Same | SearchType::Before => {}
            SearchType::StrictlyBefore => {
                if segment_num > 0 {
                    segment_num -= 1;
                }
            }
        }

        if segment_num >= max_segments {
            return SearchOutcome::PastEos;
        }

        let mut info = SegmentInfo {
            time: pto + ept_delta + segment_num * segment_duration,
            pto,
            ept_delta,
            duration: segment_duration,
            number: start_number + segment_num,
            timescale,
            media_local_first_au_time: search_time + pto,
            media_local_first_pts: search_time + pto,
            media_local_last_au_time: media_local_end.saturating_add(pto),
            ato,
            may_be_missing: segment_num + 1 >= max_segments,
            frame_accuracy_required: options.frame_accurate,
            ..Default::default()
        };
        info.is_last_in_period = info.may_be_missing && options.has_following_period;
        self.attach_common(services, doc, levels, &mut info);
        if self.prepare_download_urls_template(services, doc, addr, levels, &mut info) {
            SearchOutcome::Found(Box::new(info))
        } else {
            services.search_state.mark_unusable(addr);
            SearchOutcome::BadType
        }
    }

    // SegmentTemplate + SegmentTimeline

    fn find_segment_timeline(
        &self,
        services: &SessionServices,
        doc: &MpdDocument,
        addr: RepresentationAddress,
        levels: &Levels<'_>,
        options: &SearchOptions,
    ) -> SearchOutcome {
        let rep_id = levels.representation.id.clone();
        let timeline = attr(&levels.templates, |t| t.timeline.clone()).unwrap_or_default();
        let elements = &timeline.elements;
        if elements.is_empty() {
            warn!(representation = %rep_id, "empty SegmentTimeline");
            services.search_state.mark_unusable(addr);
            return SearchOutcome::BadType;
        }
        if elements[0].d.is_none() {
            warn!(representation = %rep_id, "SegmentTimeline without mandatory 'd'");
            services.search_state.mark_unusable(addr);
            return SearchOutcome::BadType;
        }

        let pto = attr(&levels.templates, |t| t.presentation_time_offset).unwrap_or(0) as i64;
        let timescale = attr(&levels.templates, |t| t.timescale).unwrap_or(1);
        let start_number = attr(&levels.templates, |t| t.start_number).unwrap_or(1) as i64;
        let ato = sum_ato(&levels.templates, |t| t.availability_time_offset);

        if timescale == 0 {
            warn!(representation = %rep_id, "timescale is invalid");
            services.search_state.mark_unusable(addr);
            return SearchOutcome::BadType;
        }

        let search_time = (options.period_local_time.as_timebase(timescale) + pto).max(0);
        let media_local_end = media_local_end(options, timescale, pto);
        let tolerance = timescale as i64 * TIMELINE_TOLERANCE_MS / 1_000;

        let mut current_t = elements[0].t.unwrap_or(0) as i64;
        let mut current_n = elements[0].n.map(|n| n as i64).unwrap_or(start_number);
        let mut current_d = elements[0].d.unwrap_or(0) as i64;
        let mut is_gap = false;
        let mut found = false;

        if current_t > search_time {
            // The timeline starts in the future; use the first segment and
            // let downstream skip over the hole.
            let missing = MediaTime::from_nd(current_t - search_time, timescale).as_seconds_f64();
            if missing > 0.1 {
                let first = services.search_state.with(addr, |s| {
                    !std::mem::replace(&mut s.warned_timeline_start_gap, true)
                });
                if first {
                    warn!(
                        representation = %rep_id,
                        missing_seconds = missing,
                        "SegmentTimeline starts with missing content that will be skipped"
                    );
                }
            }
            found = true;
        } else {
            let mut previous_t = current_t - current_d;
            let mut previous_n = current_n - 1;
            let mut previous_d = current_d;
            let mut idx = 0usize;
            while !found && idx < elements.len() {
                let el = &elements[idx];
                let Some(d) = el.d else {
                    warn!(representation = %rep_id, "SegmentTimeline without mandatory 'd'");
                    services.search_state.mark_unusable(addr);
                    return SearchOutcome::BadType;
                };
                if !is_gap {
                    current_t = el.t.map(|t| t as i64).unwrap_or(current_t);
                    current_n = el.n.map(|n| n as i64).unwrap_or(current_n);
                }
                let mut current_r = if is_gap { 0 } else { el.r };
                current_d = if is_gap { current_d } else { d as i64 };

                if current_d == 0 {
                    warn!(representation = %rep_id, "SegmentTimeline entry with 'd'=0");
                    services.search_state.mark_unusable(addr);
                    return SearchOutcome::BadType;
                }
                if !is_gap && current_n != previous_n + 1 {
                    let first = services.search_state.with(addr, |s| {
                        !std::mem::replace(&mut s.warned_inconsistent_numbering, true)
                    });
                    if first {
                        warn!(
                            representation = %rep_id,
                            n = current_n,
                            expected = previous_n + 1,
                            "SegmentTimeline 'n' is not the expected value"
                        );
                    }
                }

                // Gap and overlap repair. Small discrepancies are encoder
                // rounding noise and ignored.
                if !is_gap {
                    let expected_t = previous_t + previous_d;
                    if current_t != expected_t && (current_t - expected_t).abs() >= tolerance {
                        if current_t < expected_t {
                            // Overlap: the later entry wins; nothing else
                            // we can do.
                            let first = services.search_state.with(addr, |s| {
                                !std::mem::replace(&mut s.warned_timeline_overlap, true)
                            });
                            if first {
                                warn!(
                                    representation = %rep_id,
                                    t = current_t,
                                    previous_end = expected_t,
                                    "SegmentTimeline 't' overlaps the preceding segment"
                                );
                            }
                        } else {
                            // A hole: synthesize a filler segment covering
                            // it, then revisit this element.
                            current_d = current_t - expected_t;
                            current_t = expected_t;
                            current_n -= 1;
                            current_r = 0;
                            is_gap = true;
                        }
                    }
                }

                if current_r < 0 {
                    // Unbounded repeat: runs until the next element's 't'
                    // or the end of the period.
                    let mut end_time = media_local_end;
                    if let Some(next) = elements.get(idx + 1) {
                        match next.t {
                            Some(t) => end_time = t as i64,
                            None => {
                                let first = services.search_state.with(addr, |s| {
                                    !std::mem::replace(&mut s.warned_no_t_after_repeat, true)
                                });
                                if first {
                                    warn!(
                                        representation = %rep_id,
                                        "element after an 'r'=-1 repeat has no 't'"
                                    );
                                }
                            }
                        }
                    }
                    if end_time == i64::MAX {
                        warn!(
                            representation = %rep_id,
                            "SegmentTimeline repeats to infinity in an open-ended period"
                        );
                        services.search_state.mark_unusable(addr);
                        return SearchOutcome::BadType;
                    }
                    current_r = (end_time - current_t + current_d - 1) / current_d - 1;
                    if current_r < 0 {
                        warn!(
                            representation = %rep_id,
                            "'r'=-1 did not resolve to a non-negative repeat count"
                        );
                        services.search_state.mark_unusable(addr);
                        return SearchOutcome::BadType;
                    }
                }

                while !found && current_r >= 0 {
                    if current_t >= search_time {
                        found = true;
                        if el.k.is_some() {
                            warn!(representation = %rep_id, "'k' subsegments are not supported");
                            services.search_state.mark_unusable(addr);
                            return SearchOutcome::BadType;
                        }
                        match options.search_type {
                            SearchType::Closest => {
                                if current_n > start_number
                                    && search_time - previous_t < current_t - search_time
                                {
                                    current_n -= 1;
                                    current_d = previous_d;
                                    current_t = previous_t;
                                }
                            }
                            SearchType::After | SearchType::StrictlyAfter => {
                                if current_t >= media_local_end {
                                    return SearchOutcome::PastEos;
                                }
                            }
                            SearchType::Same | SearchType::Before => {
                                if current_t > search_time && current_n > start_number {
                                    current_n -= 1;
                                    current_d = previous_d;
                                    current_t = previous_t;
                                }
                            }
                            SearchType::StrictlyBefore => {
                                if current_n > start_number {
                                    current_n -= 1;
                                    current_d = previous_d;
                                    current_t = previous_t;
                                }
                            }
                        }
                        break;
                    }
                    previous_t = current_t;
                    previous_n = current_n;
                    previous_d = current_d;
                    current_t += current_d;
                    current_n += 1;
                    current_r -= 1;
                }

                if found {
                    break;
                }

                // A search time inside the very last segment falls through.
                if !is_gap && current_t >= search_time && idx + 1 == elements.len() {
                    if matches!(
                        options.search_type,
                        SearchType::Closest
                            | SearchType::Same
                            | SearchType::Before
                            | SearchType::StrictlyBefore
                    ) {
                        current_n -= 1;
                        current_d = previous_d;
                        current_t = previous_t;
                        found = true;
                        break;
                    }
                }

                if is_gap && current_t >= elements[idx].t.map(|t| t as i64).unwrap_or(current_t) {
                    // The synthetic gap has been walked; revisit the real
                    // element.
                    is_gap = false;
                } else if !is_gap {
                    idx += 1;
                }
            }
        }

        if !(found && current_t < media_local_end) {
            return SearchOutcome::PastEos;
        }

        let mut info = SegmentInfo {
            time: current_t,
            pto,
            duration: current_d,
            number: current_n,
            timescale,
            media_local_first_au_time: search_time,
            media_local_first_pts: search_time,
            media_local_last_au_time: media_local_end,
            ato,
            may_be_missing: current_t + current_d >= media_local_end,
            frame_accuracy_required: options.frame_accurate,
            ..Default::default()
        };
        info.is_last_in_period = info.may_be_missing && options.has_following_period;
        if is_gap {
            info.may_be_missing = true;
            info.is_missing = true;
            warn!(
                representation = %rep_id,
                t = current_t,
                "SegmentTimeline gap, replacing with an empty filler segment"
            );
        }
        self.attach_common(services, doc, levels, &mut info);
        if self.prepare_download_urls_template(services, doc, addr, levels, &mut info) {
            SearchOutcome::Found(Box::new(info))
        } else {
            services.search_state.mark_unusable(addr);
            SearchOutcome::BadType
        }
    }

    // Side-loaded subtitle files

    /// Per DASH-IF-IOP 4.3 §6.4.5 a side-loaded TTML/WebVTT file is one
    /// segment spanning the whole period. `presentationTimeOffset` and
    /// `timescale` are not defined on `<Representation>` but tolerated.
    fn setup_sideloaded(
        &self,
        services: &SessionServices,
        doc: &MpdDocument,
        addr: RepresentationAddress,
        levels: &Levels<'_>,
        options: &SearchOptions,
    ) -> SearchOutcome {
        let rep = levels.representation;
        let mut timescale: u32 = 1_000;
        let mut pto: i64 = 0;
        for (name, value) in rep.other_attributes.iter() {
            match name.as_str() {
                "presentationTimeOffset" => pto = value.parse().unwrap_or(0),
                "timescale" => timescale = value.parse().unwrap_or(1_000),
                _ => {}
            }
        }
        if timescale == 0 {
            timescale = 1;
        }

        let search_time = options.period_local_time.as_timebase(timescale).max(0);
        let media_local_period_end =
            if options.period_duration.is_valid() && !options.period_duration.is_infinity() {
                options.period_duration.as_timebase(timescale)
            } else {
                i64::MAX
            };
        if search_time >= media_local_period_end {
            return SearchOutcome::PastEos;
        }

        let mut info = SegmentInfo {
            // Time equals PTO so next-period searches that subtract the PTO
            // land on zero.
            time: pto,
            pto,
            duration: media_local_period_end,
            number: 0,
            timescale,
            media_local_first_au_time: search_time,
            media_local_first_pts: search_time,
            media_local_last_au_time: media_local_period_end,
            is_sideload: true,
            is_last_in_period: true,
            ..Default::default()
        };
        if self.prepare_download_urls_base(services, doc, addr, levels, &mut info) {
            SearchOutcome::Found(Box::new(info))
        } else {
            services.search_state.mark_unusable(addr);
            SearchOutcome::BadType
        }
    }

    // URL preparation

    fn attach_common(
        &self,
        services: &SessionServices,
        doc: &MpdDocument,
        levels: &Levels<'_>,
        info: &mut SegmentInfo,
    ) {
        info.inband_event_streams = levels
            .representation
            .inband_event_streams
            .iter()
            .chain(levels.adaptation_set.inband_event_streams.iter())
            .cloned()
            .collect();
        info.producer_reference_times = doc.producer_reference_times.clone();
        info.latency_reference_id = services.latency_reference_id().unwrap_or(-1);
        info.low_latency_chunked = doc.low_latency.is_some();
    }

    /// Resolve media and init URLs for `SegmentBase` (and side-loaded)
    /// addressing: the media is the base URL itself, ranges address into it.
    fn prepare_download_urls_base(
        &self,
        services: &SessionServices,
        doc: &MpdDocument,
        addr: RepresentationAddress,
        levels: &Levels<'_>,
        info: &mut SegmentInfo,
    ) -> bool {
        let initialization = attr(&levels.bases, |b| b.initialization.clone());
        let candidates = collect_base_url_candidates(doc, addr);
        let decision = services.steering.select(SelectFor::Segment, &candidates);
        let Some(media_url) = decision.url.clone() else {
            warn!(representation = %levels.representation.id, "no usable base URL candidate");
            return false;
        };

        info.media_url = SegmentUrl {
            url: Some(media_url.clone()),
            range: None,
            custom_header: decision.custom_header.clone(),
            steering_id: decision.steering_id.clone(),
        };
        if info.number_of_bytes != 0 {
            let range = RangeSpec::new(
                info.first_byte_offset,
                Some(info.first_byte_offset + info.number_of_bytes - 1),
            )
            .to_range_string();
            info.media_url.url = Some(apply_annex_e_byte_range(
                &media_url,
                &range,
                decision.byte_range_query_param.as_deref(),
            ));
            info.media_url.range = Some(range);
        }

        match initialization {
            Some(UrlRange {
                source_url: Some(src),
                range,
            }) if !src.is_empty() => {
                let init_candidates = resolve_candidates(&candidates, &src);
                let init_decision = services.steering.select(SelectFor::Segment, &init_candidates);
                let Some(init_url) = init_decision.url else {
                    return false;
                };
                let rewritten = match &range {
                    Some(r) => apply_annex_e_byte_range(
                        &init_url,
                        r,
                        init_decision.byte_range_query_param.as_deref(),
                    ),
                    None => init_url,
                };
                info.init_url = SegmentUrl {
                    url: Some(rewritten),
                    range,
                    custom_header: init_decision.custom_header,
                    steering_id: init_decision.steering_id,
                };
            }
            Some(UrlRange { range, .. }) => {
                // Init data lives in the media file under its own range.
                info.init_url = info.media_url.clone();
                info.init_url.range = range.clone();
                if let Some(r) = &range {
                    info.init_url.url = Some(apply_annex_e_byte_range(
                        &media_url,
                        r,
                        decision.byte_range_query_param.as_deref(),
                    ));
                }
            }
            None => {
                // Self-initializing media (or a side-loaded file).
                if levels.representation.container == ContainerFormat::Matroska {
                    info.init_url = info.media_url.clone();
                    info.init_url.range = None;
                }
            }
        }

        info.ato += decision.availability_time_offset;
        info.container = levels.representation.container;
        true
    }

    /// Resolve media and init URLs for template addressing: substitute the
    /// `$...$` tokens, then run the candidates through steering.
    fn prepare_download_urls_template(
        &self,
        services: &SessionServices,
        doc: &MpdDocument,
        addr: RepresentationAddress,
        levels: &Levels<'_>,
        info: &mut SegmentInfo,
    ) -> bool {
        let rep = levels.representation;
        let Some(media_template) = attr(&levels.templates, |t| t.media.clone()) else {
            warn!(representation = %rep.id, "no media template");
            return false;
        };
        let mut init_range: Option<String> = None;
        let init_template = match attr(&levels.templates, |t| t.initialization_template.clone()) {
            Some(t) => Some(t),
            None => match attr(&levels.templates, |t| t.initialization.clone()) {
                Some(UrlRange { source_url, range }) => {
                    init_range = range;
                    match source_url {
                        Some(src) if !src.is_empty() => Some(src),
                        _ => {
                            warn!(representation = %rep.id, "no initialization segment");
                            return false;
                        }
                    }
                }
                None => None,
            },
        };

        let vars = TemplateVars {
            representation_id: &rep.id,
            number: info.number,
            bandwidth: rep.bandwidth as i64,
            time: info.time,
            sub_number: info.sub_index,
        };
        let Some(media_rel) = substitute_template(&media_template, &vars) else {
            warn!(representation = %rep.id, template = %media_template, "bad media template");
            return false;
        };
        let init_rel = match &init_template {
            Some(t) => match substitute_template(t, &vars) {
                Some(rel) => Some(rel),
                None => {
                    warn!(representation = %rep.id, template = %t, "bad initialization template");
                    return false;
                }
            },
            None => None,
        };

        let candidates = collect_base_url_candidates(doc, addr);
        let media_candidates = resolve_candidates(&candidates, &media_rel);
        let decision = services.steering.select(SelectFor::Segment, &media_candidates);
        let Some(media_url) = decision.url else {
            warn!(representation = %rep.id, "no usable base URL candidate");
            return false;
        };
        info.media_url = SegmentUrl {
            url: Some(media_url),
            range: None,
            custom_header: decision.custom_header,
            steering_id: decision.steering_id,
        };

        if let Some(init_rel) = init_rel {
            let init_candidates = resolve_candidates(&candidates, &init_rel);
            let init_decision = services.steering.select(SelectFor::Segment, &init_candidates);
            let Some(init_url) = init_decision.url else {
                return false;
            };
            // Media segments under a template cannot be ranged, but the
            // init segment can (through an <Initialization> element).
            let rewritten = match &init_range {
                Some(r) => apply_annex_e_byte_range(
                    &init_url,
                    r,
                    init_decision.byte_range_query_param.as_deref(),
                ),
                None => init_url,
            };
            info.init_url = SegmentUrl {
                url: Some(rewritten),
                range: init_range,
                custom_header: init_decision.custom_header,
                steering_id: init_decision.steering_id,
            };
        }

        info.ato += decision.availability_time_offset;
        info.container = rep.container;
        true
    }
}

fn gather_levels(doc: &MpdDocument, addr: RepresentationAddress) -> Option<Levels<'_>> {
    let representation = doc.representation(addr)?;
    let adaptation_set = doc.adaptation_set(addr.adaptation_set_address())?;
    let period = doc.period(addr.period_address())?;
    let bases = [
        representation.segment_base.as_ref(),
        adaptation_set.segment_base.as_ref(),
        period.segment_base.as_ref(),
    ]
    .into_iter()
    .flatten()
    .collect();
    let templates = [
        representation.segment_template.as_ref(),
        adaptation_set.segment_template.as_ref(),
        period.segment_template.as_ref(),
    ]
    .into_iter()
    .flatten()
    .collect();
    Some(Levels {
        representation,
        adaptation_set,
        period,
        bases,
        templates,
    })
}

/// Period end mapped into media-local time: the tighter of the period
/// duration and the playback-range end, plus the PTO.
fn media_local_end(options: &SearchOptions, timescale: u32, pto: i64) -> i64 {
    let period_end = if options.period_duration.is_valid()
        && !options.period_duration.is_infinity()
    {
        options
            .period_duration
            .as_timebase(timescale)
            .saturating_add(pto)
    } else {
        i64::MAX
    };
    let presentation_end = if options.period_presentation_end.is_valid()
        && !options.period_presentation_end.is_infinity()
    {
        options
            .period_presentation_end
            .as_timebase(timescale)
            .saturating_add(pto)
    } else {
        i64::MAX
    };
    period_end.min(presentation_end)
}

fn resolve_candidates(candidates: &[CandidateUrl], relative: &str) -> Vec<CandidateUrl> {
    if relative.is_empty() {
        return candidates.to_vec();
    }
    candidates
        .iter()
        .filter_map(|c| {
            c.url.join(relative).ok().map(|url| CandidateUrl {
                url,
                cdn: c.cdn.clone(),
                priority: c.priority,
                weight: c.weight,
            })
        })
        .collect()
}
