//! One playable period: track selection, DRM binding and segment request
//! construction on top of the segment search engine.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use kinema_core::{BufferSourceInfo, CodecInfo, MediaTime, SequenceIndex, StreamType, TimeRange};
use kinema_index::CachedEntity;
use kinema_mpd::{AdaptationSet, MpdDocument, Period, RepresentationAddress};
use tracing::{debug, warn};

use crate::manifest::anchor_time;
use crate::search::{SearchOptions, SearchOutcome, SearchType, SegmentSearchEngine};
use crate::segment::{LoadRequest, LoadRequestKind, SegmentInfo, SegmentRequest};
use crate::services::{DrmCandidate, DrmClient, SessionServices};

/// User preferences for one stream type.
#[derive(Clone, Debug, Default)]
pub struct StreamPreferences {
    /// RFC 4647 language range, e.g. "de" or "en-*".
    pub language_rfc4647: Option<String>,
    pub kind: Option<String>,
    /// Preferred codec name, used to break ties between language matches.
    pub codec: Option<String>,
    /// Explicit adaptation-set index within the stream type. Takes
    /// precedence even over a language match.
    pub override_index: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct PlayStartOptions {
    pub playback_range: TimeRange,
    pub frame_accuracy: bool,
}

impl Default for PlayStartOptions {
    fn default() -> Self {
        Self {
            playback_range: TimeRange::new(MediaTime::ZERO, MediaTime::pos_infinity()),
            frame_accuracy: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PlayStartPosition {
    pub time: MediaTime,
    pub options: PlayStartOptions,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeriodReadyState {
    NotLoaded,
    Loading,
    Loaded,
    Preparing,
    IsReady,
}

/// Result of asking the period for a segment.
#[derive(Debug)]
pub enum SegmentLookup {
    Found(Box<SegmentRequest>),
    /// Transient; retry after the delay (zero means immediately, e.g. after
    /// a representation was disqualified and another must be picked).
    TryAgainLater(Duration),
    PastEos,
    /// The manifest changed in a way that invalidates this period.
    NotFound(String),
}

/// What a track preference change requires from the player.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackChangeOutcome {
    /// Video cannot switch mid-period; restart period resolution at the
    /// current position.
    StartOver,
    /// Audio/subtitle switch cleanly at the next period boundary or via a
    /// continuation segment.
    NewPeriodNeeded,
}

#[derive(Clone, Debug, Default)]
struct ActiveSelection {
    adaptation_set_id: String,
    representation_id: String,
    quality_index: usize,
    max_quality_index: usize,
}

enum NextSegmentKind {
    SamePeriodNext,
    SamePeriodRetry,
    SamePeriodStartOver,
    NextPeriod,
}

/// A selected, loadable period. Holds only IDs into the manifest; every
/// call re-resolves them against the current snapshot, so a concurrent
/// manifest update surfaces as a normal "not found" instead of a dangling
/// reference.
pub struct PlayPeriod {
    services: Arc<SessionServices>,
    engine: SegmentSearchEngine,
    period_id: String,
    ready_state: PeriodReadyState,
    video_prefs: StreamPreferences,
    audio_prefs: StreamPreferences,
    subtitle_prefs: StreamPreferences,
    video: ActiveSelection,
    audio: ActiveSelection,
    subtitle: ActiveSelection,
    buffer_source_video: Option<BufferSourceInfo>,
    buffer_source_audio: Option<BufferSourceInfo>,
    buffer_source_subtitle: Option<BufferSourceInfo>,
    drm_client: Option<Arc<DrmClient>>,
    preloaded_init_segments: HashSet<String>,
}

struct PrioritizedCandidate {
    index: usize,
    priority: i32,
    bitrate: u32,
    codec: String,
}

impl PlayPeriod {
    pub fn new(services: Arc<SessionServices>, period_id: String) -> Self {
        Self {
            services,
            engine: SegmentSearchEngine::new(),
            period_id,
            ready_state: PeriodReadyState::NotLoaded,
            video_prefs: StreamPreferences::default(),
            audio_prefs: StreamPreferences::default(),
            subtitle_prefs: StreamPreferences::default(),
            video: ActiveSelection::default(),
            audio: ActiveSelection::default(),
            subtitle: ActiveSelection::default(),
            buffer_source_video: None,
            buffer_source_audio: None,
            buffer_source_subtitle: None,
            drm_client: None,
            preloaded_init_segments: HashSet::new(),
        }
    }

    pub fn period_id(&self) -> &str {
        &self.period_id
    }

    pub fn ready_state(&self) -> PeriodReadyState {
        self.ready_state
    }

    pub fn set_stream_preferences(&mut self, stream_type: StreamType, prefs: StreamPreferences) {
        match stream_type {
            StreamType::Video => self.video_prefs = prefs,
            StreamType::Audio => self.audio_prefs = prefs,
            StreamType::Subtitle => self.subtitle_prefs = prefs,
        }
    }

    pub fn selected_buffer_source(&self, stream_type: StreamType) -> Option<&BufferSourceInfo> {
        match stream_type {
            StreamType::Video => self.buffer_source_video.as_ref(),
            StreamType::Audio => self.buffer_source_audio.as_ref(),
            StreamType::Subtitle => self.buffer_source_subtitle.as_ref(),
        }
    }

    pub fn selected_adaptation_set_id(&self, stream_type: StreamType) -> &str {
        &self.selection(stream_type).adaptation_set_id
    }

    fn selection(&self, stream_type: StreamType) -> &ActiveSelection {
        match stream_type {
            StreamType::Video => &self.video,
            StreamType::Audio => &self.audio,
            StreamType::Subtitle => &self.subtitle,
        }
    }

    fn current_document(&self) -> Option<Arc<MpdDocument>> {
        self.services.manifest_reader.current_document()
    }

    fn period_index(&self, doc: &MpdDocument) -> Option<usize> {
        doc.period_index_by_id(&self.period_id)
    }

    /// Select adaptation sets per stream type and create the period's DRM
    /// client from the union of their content protections.
    pub fn load(&mut self) {
        let Some(doc) = self.current_document() else {
            self.ready_state = PeriodReadyState::Loading;
            return;
        };
        let Some(period_index) = self.period_index(&doc) else {
            self.ready_state = PeriodReadyState::Loading;
            return;
        };
        let period = &doc.periods[period_index];

        let mut protections: Vec<DrmCandidate> = Vec::new();
        for stream_type in StreamType::ALL {
            let prefs = match stream_type {
                StreamType::Video => self.video_prefs.clone(),
                StreamType::Audio => self.audio_prefs.clone(),
                StreamType::Subtitle => self.subtitle_prefs.clone(),
            };
            let Some((index, buffer_source)) =
                self.select_adaptation_set_by_attributes(period, stream_type, &prefs)
            else {
                continue;
            };
            let aset = &period.adaptation_sets[index];
            let selection = match stream_type {
                StreamType::Video => &mut self.video,
                StreamType::Audio => &mut self.audio,
                StreamType::Subtitle => &mut self.subtitle,
            };
            selection.adaptation_set_id = aset.id.clone();
            match stream_type {
                StreamType::Video => self.buffer_source_video = Some(buffer_source),
                StreamType::Audio => self.buffer_source_audio = Some(buffer_source),
                StreamType::Subtitle => self.buffer_source_subtitle = Some(buffer_source),
            }

            // A switch-group head contributes its members' protections.
            if !aset.switch_to_ids.is_empty() {
                for id in aset.switch_to_ids.iter() {
                    if let Some(member) = period.adaptation_sets.iter().find(|a| &a.id == id) {
                        protections.extend(content_protections_of(member));
                    }
                }
            } else {
                protections.extend(content_protections_of(aset));
            }
        }

        if self.prepare_drm(&protections) {
            self.ready_state = PeriodReadyState::Loaded;
        } else {
            // Hold in Loading so the player cannot progress while the
            // posted error unwinds.
            self.ready_state = PeriodReadyState::Loading;
        }
    }

    /// Pick the starting representations and preload video init segments.
    pub fn prepare_for_play(&mut self) {
        let Some(doc) = self.current_document() else {
            self.ready_state = PeriodReadyState::Preparing;
            return;
        };
        let Some(period_index) = self.period_index(&doc) else {
            self.ready_state = PeriodReadyState::Preparing;
            return;
        };
        let period = &doc.periods[period_index];
        let generation = doc.generation;

        let starting_bitrate = self.services.options.starting_bitrate;
        let non_video_cap = self.services.options.non_video_bandwidth_cap;

        if let Some((aset_index, aset)) =
            find_adaptation_set(period, &self.video.adaptation_set_id)
        {
            if let Some(rep_index) = self.pick_by_max_bandwidth(
                generation,
                period_index,
                aset_index,
                aset,
                starting_bitrate,
            ) {
                self.video.representation_id = aset.representations[rep_index].id.clone();
            }
            self.preload_init_segments(&doc, period_index, aset_index);
        }
        if let Some((aset_index, aset)) =
            find_adaptation_set(period, &self.audio.adaptation_set_id)
        {
            if let Some(rep_index) = self.pick_by_priority_and_bandwidth(
                generation,
                period_index,
                aset_index,
                aset,
                non_video_cap,
            ) {
                self.audio.representation_id = aset.representations[rep_index].id.clone();
            }
        }
        if let Some((aset_index, aset)) =
            find_adaptation_set(period, &self.subtitle.adaptation_set_id)
        {
            if let Some(rep_index) = self.pick_by_priority_and_bandwidth(
                generation,
                period_index,
                aset_index,
                aset,
                non_video_cap,
            ) {
                self.subtitle.representation_id = aset.representations[rep_index].id.clone();
            }
        }

        // Publish the low-latency reference id for request setup.
        let latency_id = doc
            .low_latency
            .as_ref()
            .filter(|ll| ll.reference_id >= 0)
            .map(|ll| ll.reference_id);
        self.services.set_latency_reference_id(latency_id);

        self.ready_state = PeriodReadyState::IsReady;
    }

    /// Adaptation-set choice: (1) extended-filtering language match ranked
    /// by configured codec-class priority, preferred codec breaking ties;
    /// (2) explicit override index, even over a language match; (3) first
    /// usable set, except subtitles which are never auto-selected.
    fn select_adaptation_set_by_attributes(
        &self,
        period: &Period,
        stream_type: StreamType,
        prefs: &StreamPreferences,
    ) -> Option<(usize, BufferSourceInfo)> {
        let candidates: Vec<(usize, &AdaptationSet)> =
            period.adaptation_sets_of_type(stream_type).collect();
        if candidates.is_empty() {
            return None;
        }

        let mut chosen: Option<usize> = None;

        if let Some(language_range) = prefs.language_rfc4647.as_deref() {
            let mut matches: Vec<PrioritizedCandidate> = candidates
                .iter()
                .filter(|(_, a)| {
                    a.is_usable()
                        && !a.in_switch_group
                        && language_matches(language_range, &a.language)
                })
                .map(|(i, a)| self.prioritized(*i, a))
                .collect();
            sort_by_priority(&mut matches);
            if let Some(best) = matches.first() {
                let mut pick = best.index;
                if let Some(preferred_codec) = prefs.codec.as_deref() {
                    if !preferred_codec.is_empty() {
                        if let Some(m) = matches
                            .iter()
                            .find(|m| m.codec.starts_with(preferred_codec))
                        {
                            pick = m.index;
                        }
                    }
                }
                chosen = Some(pick);
            }
        }

        // An explicit override is applied even when a language matched;
        // it exists to force a specific set for that language.
        if let Some(override_index) = prefs.override_index {
            if let Some((i, _)) = candidates.get(override_index) {
                chosen = Some(*i);
            }
        }

        if chosen.is_none() && stream_type != StreamType::Subtitle {
            let mut all: Vec<PrioritizedCandidate> = candidates
                .iter()
                .filter(|(_, a)| a.is_usable() && !a.in_switch_group)
                .map(|(i, a)| self.prioritized(*i, a))
                .collect();
            sort_by_priority(&mut all);
            chosen = all.first().map(|c| c.index);
        }

        let index = chosen?;
        let aset = &period.adaptation_sets[index];
        let hard_index = candidates
            .iter()
            .position(|(i, _)| *i == index)
            .unwrap_or(0);
        let best = aset.representations.last();
        Some((
            index,
            BufferSourceInfo {
                kind: stream_type.to_string(),
                language: aset.language.clone(),
                codec: best.map(|r| r.codecs.clone()).unwrap_or_default(),
                hard_index,
                period_id: period.id.clone(),
                period_adaptation_set_id: format!("{}/{}", period.id, aset.id),
            },
        ))
    }

    fn prioritized(&self, index: usize, aset: &AdaptationSet) -> PrioritizedCandidate {
        let codec = aset
            .representations
            .last()
            .map(|r| r.codecs.clone())
            .unwrap_or_else(|| aset.codecs.clone());
        let configured = self.services.options.class_priority(&codec);
        let priority = if configured >= 0 {
            configured
        } else {
            aset.selection_priority as i32
        };
        PrioritizedCandidate {
            index,
            priority,
            bitrate: 0,
            codec,
        }
    }

    fn prepare_drm(&mut self, protections: &[DrmCandidate]) -> bool {
        if protections.is_empty() {
            return true;
        }
        match self.services.drm.create_client(protections) {
            Ok(client) => {
                self.drm_client = Some(client);
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to create DRM client");
                false
            }
        }
    }

    /// Highest bandwidth not exceeding the cap; the lowest one when
    /// everything exceeds it.
    fn pick_by_max_bandwidth(
        &self,
        generation: u64,
        period_index: usize,
        aset_index: usize,
        aset: &AdaptationSet,
        not_exceeding: u32,
    ) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        let mut worst: Option<(usize, u32)> = None;
        for (i, rep) in aset.representations.iter().enumerate() {
            let addr = RepresentationAddress {
                generation,
                period: period_index,
                adaptation_set: aset_index,
                representation: i,
            };
            if !self.services.search_state.is_usable(addr) {
                continue;
            }
            if worst.is_none_or(|(_, bw)| rep.bandwidth < bw) {
                worst = Some((i, rep.bandwidth));
            }
            if rep.bandwidth <= not_exceeding && best.is_none_or(|(_, bw)| rep.bandwidth > bw) {
                best = Some((i, rep.bandwidth));
            }
        }
        best.or(worst).map(|(i, _)| i)
    }

    /// Highest configured priority first, then bandwidth descending under
    /// the cap; the last candidate when everything exceeds it.
    fn pick_by_priority_and_bandwidth(
        &self,
        generation: u64,
        period_index: usize,
        aset_index: usize,
        aset: &AdaptationSet,
        not_exceeding: u32,
    ) -> Option<usize> {
        let mut candidates: Vec<PrioritizedCandidate> = aset
            .representations
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                let addr = RepresentationAddress {
                    generation,
                    period: period_index,
                    adaptation_set: aset_index,
                    representation: *i,
                };
                self.services.search_state.is_usable(addr)
            })
            .map(|(i, r)| {
                let configured = self.services.options.class_priority(&r.codecs);
                PrioritizedCandidate {
                    index: i,
                    priority: if configured >= 0 {
                        configured
                    } else {
                        r.selection_priority as i32
                    },
                    bitrate: r.bandwidth,
                    codec: r.codecs.clone(),
                }
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| b.bitrate.cmp(&a.bitrate));
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
        candidates
            .iter()
            .find(|c| {
                aset.representations[c.index].bandwidth <= not_exceeding
            })
            .or(candidates.last())
            .map(|c| c.index)
    }

    /// Kick off init-segment loads for every playable representation of the
    /// adaptation set, deduplicated and entity-cache aware.
    fn preload_init_segments(&mut self, doc: &MpdDocument, period_index: usize, aset_index: usize) {
        let aset = &doc.periods[period_index].adaptation_sets[aset_index];
        let mut loads = Vec::new();
        for (i, rep) in aset.representations.iter().enumerate() {
            if !self.preloaded_init_segments.insert(rep.id.clone()) {
                continue;
            }
            let addr = RepresentationAddress {
                generation: doc.generation,
                period: period_index,
                adaptation_set: aset_index,
                representation: i,
            };
            if !self.services.search_state.is_usable(addr) {
                continue;
            }
            let options = SearchOptions {
                init_segment_setup_only: true,
                ..Default::default()
            };
            let SearchOutcome::Found(info) =
                self.engine
                    .find_segment(&self.services, doc, addr, &options)
            else {
                continue;
            };
            let Some(url) = info.init_url.url.clone() else {
                continue;
            };
            let range = info.init_url.range.clone();
            if self
                .services
                .entity_cache
                .get(url.as_str(), range.as_deref())
                .is_some()
            {
                continue;
            }
            loads.push(LoadRequest {
                url,
                range,
                custom_header: info.init_url.custom_header.clone(),
                kind: LoadRequestKind::InitSegment {
                    representation: addr,
                    container: info.container,
                },
                stream_type: StreamType::Video,
                quality_index: i,
            });
        }
        if !loads.is_empty() {
            debug!(count = loads.len(), "preloading init segments");
            self.services.manifest_reader.add_element_load_requests(loads);
        }
    }

    /// The ABR may only switch representations within the active sets.
    pub fn select_stream(
        &mut self,
        adaptation_set_id: &str,
        representation_id: &str,
        quality_index: usize,
        max_quality_index: usize,
    ) {
        let selection = if adaptation_set_id == self.video.adaptation_set_id {
            &mut self.video
        } else if adaptation_set_id == self.audio.adaptation_set_id {
            &mut self.audio
        } else if adaptation_set_id == self.subtitle.adaptation_set_id {
            &mut self.subtitle
        } else {
            warn!("ABR tried to activate a stream from an inactive adaptation set");
            return;
        };
        selection.representation_id = representation_id.to_string();
        selection.quality_index = quality_index;
        selection.max_quality_index = max_quality_index;
    }

    /// A track change is requested at the current playback position, which
    /// may already lie in a later period; comparing against this period
    /// makes no sense, so video always starts over.
    pub fn change_track_preference(
        &mut self,
        stream_type: StreamType,
        prefs: StreamPreferences,
    ) -> TrackChangeOutcome {
        self.set_stream_preferences(stream_type, prefs);
        if stream_type == StreamType::Video {
            TrackChangeOutcome::StartOver
        } else {
            TrackChangeOutcome::NewPeriodNeeded
        }
    }

    /// Build the composite starting request: one dependent sub-request per
    /// active stream type, resolved at the same position.
    pub fn get_starting_segment(
        &mut self,
        sequence_index: SequenceIndex,
        position: &PlayStartPosition,
        search_type: SearchType,
    ) -> SegmentLookup {
        let Some(doc) = self.current_document() else {
            return SegmentLookup::NotFound("manifest has disappeared".into());
        };
        let Some(period_index) = self.period_index(&doc) else {
            // An MPD update removed the period. Rare but possible.
            return SegmentLookup::NotFound("period has disappeared".into());
        };
        let period = &doc.periods[period_index];
        let anchor = anchor_time(&doc);

        let frame_accurate = position.options.frame_accuracy;
        let mut search_type = if frame_accurate {
            // The segment that starts on or before the target.
            SearchType::Before
        } else {
            search_type
        };

        let mut start_time = position.time - anchor;
        let mut play_range_end = position.options.playback_range.end;
        play_range_end -= anchor;

        // Period search slack can put the time slightly outside the period.
        if start_time < period.start {
            start_time = period.start;
        } else if period.end().is_valid() && start_time >= period.end() {
            start_time = period.end();
        }
        start_time -= period.start;
        play_range_end -= period.start;

        let uses_ast = doc.uses_availability_start_time();
        let is_static_like = doc.is_static() || doc.is_dynamic_event();
        let fetch_delay = self.services.segment_fetch_delay();

        let mut composite = SegmentRequest {
            is_initial_start_request: true,
            timestamp_sequence_index: sequence_index,
            ..Default::default()
        };

        let mut selections: Vec<(StreamType, ActiveSelection)> = Vec::new();
        for stream_type in StreamType::ALL {
            let s = self.selection(stream_type);
            if !s.adaptation_set_id.is_empty() && !s.representation_id.is_empty() {
                selections.push((stream_type, s.clone()));
            }
        }

        let mut did_adjust_start_time = false;
        let mut try_again_later = false;
        let mut any_stream_at_eos = false;
        let mut all_streams_at_eos = true;

        for (stream_type, selection) in selections {
            let Some(resolved) = resolve_selection(&doc, period_index, &selection) else {
                return SegmentLookup::NotFound(
                    "period no longer has the selected adaptation set or representation".into(),
                );
            };
            let (addr, codec_info) = resolved;

            let options = SearchOptions {
                period_local_time: start_time,
                period_duration: effective_period_duration(&doc, period_index),
                period_presentation_end: play_range_end,
                has_following_period: has_following_period(&doc, period_index),
                search_type,
                frame_accurate,
                quality_index: selection.quality_index,
                max_quality_index: selection.max_quality_index,
                stream_type,
                init_segment_setup_only: false,
            };
            match self
                .engine
                .find_segment(&self.services, &doc, addr, &options)
            {
                SearchOutcome::NeedElement(requests) => {
                    self.services
                        .manifest_reader
                        .add_element_load_requests(requests);
                    try_again_later = true;
                }
                SearchOutcome::PastEos => {
                    let mut request = self.base_request(
                        &doc,
                        stream_type,
                        &selection,
                        addr,
                        codec_info,
                        SegmentInfo::default(),
                        sequence_index,
                    );
                    request.is_eos_segment = true;
                    composite.dependent_streams.push(request);
                    any_stream_at_eos = true;
                }
                SearchOutcome::Gone => {
                    // Intermittent during a manifest refresh.
                    try_again_later = true;
                }
                SearchOutcome::BadType => {
                    // Representation disabled; an immediate retry picks a
                    // different one (or the posted error ends playback).
                    return SegmentLookup::TryAgainLater(Duration::ZERO);
                }
                SearchOutcome::Found(mut info) => {
                    if !frame_accurate
                        && stream_type == StreamType::Video
                        && !did_adjust_start_time
                    {
                        did_adjust_start_time = true;
                        // Start decoding at the segment boundary holding the
                        // IDR and align the other streams to it; audio and
                        // subtitles are SAP 1 and can start anywhere.
                        info.media_local_first_au_time = info.time;
                        start_time =
                            MediaTime::from_nd(info.time - info.pto, info.timescale);
                        search_type = SearchType::Before;
                    }

                    let mut request = self.base_request(
                        &doc,
                        stream_type,
                        &selection,
                        addr,
                        codec_info,
                        *info,
                        sequence_index,
                    );
                    if uses_ast {
                        let period_start = doc.periods[period_index].start;
                        request.availability_start = request.segment.availability_start(
                            anchor,
                            period_start,
                            is_static_like,
                        ) + fetch_delay;
                        request.availability_end = request.segment.availability_end(
                            anchor,
                            period_start,
                            availability_end_time(&doc),
                            doc.time_shift_buffer_depth,
                            is_static_like,
                        );
                    }
                    if request.segment.is_missing {
                        request.insert_filler_data = true;
                    }
                    if frame_accurate {
                        request.frame_accurate_time = position.time;
                    }

                    // The composite must answer for the first PTS (that is
                    // what the player sets the position to).
                    if !composite.first_pts().is_valid() {
                        composite.ast = request.ast;
                        composite.period_start = request.period_start;
                        composite.segment = request.segment.clone();
                    }
                    if uses_ast && !composite.availability_start.is_valid() {
                        composite.availability_start = request.availability_start;
                        composite.availability_end = request.availability_end;
                    }

                    composite.dependent_streams.push(request);
                    all_streams_at_eos = false;
                }
            }
        }

        if try_again_later {
            return SegmentLookup::TryAgainLater(Duration::from_millis(100));
        }
        if any_stream_at_eos && all_streams_at_eos {
            return SegmentLookup::PastEos;
        }
        SegmentLookup::Found(Box::new(composite))
    }

    /// Starting segment for one stream only, used after a live track switch
    /// at the current playback position.
    pub fn get_continuation_segment(
        &mut self,
        stream_type: StreamType,
        sequence_index: SequenceIndex,
        position: &PlayStartPosition,
    ) -> SegmentLookup {
        let mut current = SegmentRequest {
            stream_type: Some(stream_type),
            period_start: position.time,
            timestamp_sequence_index: sequence_index,
            ..Default::default()
        };
        current.segment.timescale = 1;
        self.get_next_or_retry_segment(
            &current,
            NextSegmentKind::SamePeriodStartOver,
            &position.options,
        )
    }

    pub fn get_next_segment(
        &mut self,
        current: &SegmentRequest,
        options: &PlayStartOptions,
    ) -> SegmentLookup {
        if current.period_id == self.period_id {
            // An 'lmsg' brand on the current segment ends the stream.
            if current.segment.saw_lmsg {
                return SegmentLookup::PastEos;
            }
            self.get_next_or_retry_segment(current, NextSegmentKind::SamePeriodNext, options)
        } else {
            // The request came from a previous period; this period is new.
            self.get_next_or_retry_segment(current, NextSegmentKind::NextPeriod, options)
        }
    }

    pub fn get_retry_segment(
        &mut self,
        current: &SegmentRequest,
        options: &PlayStartOptions,
        replace_with_filler_data: bool,
    ) -> SegmentLookup {
        if replace_with_filler_data {
            let mut request = current.clone();
            request.insert_filler_data = true;
            // Replacing with filler still counts as a retry.
            request.num_overall_retries += 1;
            return SegmentLookup::Found(Box::new(request));
        }
        self.get_next_or_retry_segment(current, NextSegmentKind::SamePeriodRetry, options)
    }

    pub fn get_looping_segment(
        &mut self,
        sequence_index: SequenceIndex,
        position: &PlayStartPosition,
        search_type: SearchType,
    ) -> SegmentLookup {
        self.get_starting_segment(sequence_index, position, search_type)
    }

    fn get_next_or_retry_segment(
        &mut self,
        current: &SegmentRequest,
        kind: NextSegmentKind,
        options: &PlayStartOptions,
    ) -> SegmentLookup {
        if current.is_initial_start_request {
            return SegmentLookup::NotFound(
                "the next segment can only be located for a media request".into(),
            );
        }
        let Some(stream_type) = current.stream_type else {
            return SegmentLookup::NotFound("request has no stream type".into());
        };
        let Some(doc) = self.current_document() else {
            return SegmentLookup::NotFound("manifest has disappeared".into());
        };
        let Some(period_index) = self.period_index(&doc) else {
            return SegmentLookup::NotFound("period has disappeared".into());
        };
        let period = &doc.periods[period_index];
        let anchor = anchor_time(&doc);

        let selection = self.selection(stream_type).clone();
        let Some((addr, codec_info)) = resolve_selection(&doc, period_index, &selection) else {
            return SegmentLookup::NotFound("no active stream to get the next segment for".into());
        };
        let sideloaded = doc
            .representation(addr)
            .is_some_and(|r| r.is_sideloaded_text());

        let mut frame_accurate = options.frame_accuracy;
        let mut play_range_end = options.playback_range.end;
        play_range_end -= anchor;
        play_range_end -= period.start;

        let cur = &current.segment;
        let (period_local_time, search_type) = match kind {
            NextSegmentKind::SamePeriodNext => {
                frame_accurate = false;
                // Probe three quarters into the current segment so timescale
                // rounding cannot land on the wrong side of the boundary.
                let probe = if sideloaded {
                    // Nothing further to fetch for a side-loaded file.
                    MediaTime::pos_infinity()
                } else {
                    MediaTime::from_nd(
                        cur.time - cur.pto + cur.duration * 3 / 4,
                        cur.timescale,
                    )
                };
                (probe, SearchType::After)
            }
            NextSegmentKind::SamePeriodRetry => {
                let probe =
                    MediaTime::from_nd(cur.time - cur.pto + cur.duration / 10, cur.timescale);
                let st = if frame_accurate {
                    SearchType::Before
                } else {
                    SearchType::Closest
                };
                (probe, st)
            }
            NextSegmentKind::SamePeriodStartOver => {
                let mut start_time = current.period_start - anchor;
                if start_time < period.start {
                    start_time = period.start;
                } else if period.end().is_valid() && start_time >= period.end() {
                    start_time = period.end();
                }
                start_time -= period.start;
                (start_time, SearchType::Before)
            }
            NextSegmentKind::NextPeriod => {
                let st = if frame_accurate {
                    SearchType::Before
                } else {
                    SearchType::Closest
                };
                (MediaTime::ZERO, st)
            }
        };

        let search_options = SearchOptions {
            period_local_time,
            period_duration: effective_period_duration(&doc, period_index),
            period_presentation_end: play_range_end,
            has_following_period: has_following_period(&doc, period_index),
            search_type,
            frame_accurate,
            quality_index: selection.quality_index,
            max_quality_index: selection.max_quality_index,
            stream_type,
            init_segment_setup_only: false,
        };
        match self
            .engine
            .find_segment(&self.services, &doc, addr, &search_options)
        {
            SearchOutcome::NeedElement(requests) => {
                self.services
                    .manifest_reader
                    .add_element_load_requests(requests);
                SegmentLookup::TryAgainLater(Duration::from_millis(100))
            }
            SearchOutcome::PastEos => {
                // Either the period really ended or a live manifest has not
                // published the next segment yet.
                if !doc.updates_expected() {
                    return SegmentLookup::PastEos;
                }
                if has_following_period(&doc, period_index) {
                    return SegmentLookup::PastEos;
                }
                self.services
                    .manifest_reader
                    .request_update(crate::services::ManifestUpdateType::LatestSegment);
                SegmentLookup::TryAgainLater(Duration::from_millis(250))
            }
            SearchOutcome::Gone => SegmentLookup::TryAgainLater(Duration::from_millis(100)),
            SearchOutcome::BadType => SegmentLookup::TryAgainLater(Duration::ZERO),
            SearchOutcome::Found(info) => {
                let mut request = self.base_request(
                    &doc,
                    stream_type,
                    &selection,
                    addr,
                    codec_info,
                    *info,
                    current.timestamp_sequence_index,
                );
                let uses_ast = doc.uses_availability_start_time();
                if uses_ast {
                    let is_static_like = doc.is_static() || doc.is_dynamic_event();
                    let period_start = doc.periods[period_index].start;
                    request.availability_start = request.segment.availability_start(
                        anchor,
                        period_start,
                        is_static_like,
                    ) + self.services.segment_fetch_delay();
                    request.availability_end = request.segment.availability_end(
                        anchor,
                        period_start,
                        availability_end_time(&doc),
                        doc.time_shift_buffer_depth,
                        is_static_like,
                    );
                }
                if request.segment.is_missing {
                    request.insert_filler_data = true;
                }
                if matches!(
                    kind,
                    NextSegmentKind::SamePeriodNext | NextSegmentKind::SamePeriodRetry
                ) {
                    // Keep the original first-AU time: template segment
                    // durations may vary up to ±50% from the declared value
                    // and the current segment may not have contained the
                    // access units we wanted. Translate across timescales
                    // and local media times.
                    request.segment.media_local_first_au_time =
                        MediaTime::from_nd(
                            cur.media_local_first_au_time - cur.pto,
                            cur.timescale,
                        )
                        .as_timebase(request.segment.timescale)
                            + request.segment.pto;
                }
                if matches!(kind, NextSegmentKind::SamePeriodRetry) {
                    request.num_overall_retries = current.num_overall_retries + 1;
                }
                if request.representation == current.representation {
                    request.warned_about_timescale = current.warned_about_timescale;
                }
                SegmentLookup::Found(Box::new(request))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn base_request(
        &self,
        doc: &MpdDocument,
        stream_type: StreamType,
        selection: &ActiveSelection,
        addr: RepresentationAddress,
        codec_info: CodecInfo,
        segment: SegmentInfo,
        sequence_index: SequenceIndex,
    ) -> SegmentRequest {
        let period = &doc.periods[addr.period];
        SegmentRequest {
            stream_type: Some(stream_type),
            quality_index: selection.quality_index,
            max_quality_index: selection.max_quality_index,
            drm_mime_type: codec_info.mime_type.clone(),
            codec_info,
            representation: Some(addr),
            period_id: period.id.clone(),
            period_start: period.start,
            ast: anchor_time(doc),
            segment,
            timestamp_sequence_index: sequence_index,
            drm_client: self.drm_client.clone(),
            buffer_source: self.selected_buffer_source(stream_type).cloned(),
            ..Default::default()
        }
    }

    /// Grow the availability delay when segments keep arriving early; past
    /// half a second the clock has probably drifted and a resync resets it.
    pub fn increase_segment_fetch_delay(&self, amount: MediaTime) {
        let new_delay = self.services.segment_fetch_delay() + amount;
        self.services.set_segment_fetch_delay(new_delay);
        if new_delay > MediaTime::from_millis(500) {
            self.services.manifest_reader.request_clock_resync();
        }
    }

    /// Average segment duration of a representation, for buffer planning.
    pub fn average_segment_duration(
        &self,
        adaptation_set_id: &str,
        representation_id: &str,
    ) -> MediaTime {
        let Some(doc) = self.current_document() else {
            return MediaTime::invalid();
        };
        let Some(period_index) = self.period_index(&doc) else {
            return MediaTime::invalid();
        };
        let period = &doc.periods[period_index];
        let Some((aset_index, aset)) = find_adaptation_set(period, adaptation_set_id) else {
            return MediaTime::invalid();
        };
        let Some(rep_index) = aset
            .representations
            .iter()
            .position(|r| r.id == representation_id)
        else {
            return MediaTime::invalid();
        };
        let rep = &aset.representations[rep_index];

        if rep.segment_base.is_some()
            || aset.segment_base.is_some()
            || period.segment_base.is_some()
        {
            // Any representation of the set is segmented the same, so any
            // loaded index gives the durations.
            for i in 0..aset.representations.len() {
                let addr = RepresentationAddress {
                    generation: doc.generation,
                    period: period_index,
                    adaptation_set: aset_index,
                    representation: i,
                };
                if let Some(avg) = self.services.search_state.average_sidx_duration(addr) {
                    return avg;
                }
            }
            return MediaTime::from_millis(4_000);
        }

        let templates = [
            rep.segment_template.as_ref(),
            aset.segment_template.as_ref(),
            period.segment_template.as_ref(),
        ];
        let templates: Vec<_> = templates.into_iter().flatten().collect();
        let timescale = templates
            .iter()
            .find_map(|t| t.timescale)
            .unwrap_or(1)
            .max(1);
        if let Some(timeline) = templates.iter().find_map(|t| t.timeline.as_ref()) {
            let mut duration_sum: i64 = 0;
            let mut count: i64 = 0;
            for s in timeline.elements.iter() {
                // r = -1 repeats an unknown number of times; weigh it as 10
                // so one open repeat cannot skew the average.
                let repeats = if s.r >= 0 { s.r + 1 } else { 10 };
                duration_sum += s.d.unwrap_or(0) as i64 * repeats;
                count += repeats;
            }
            if count > 0 {
                return MediaTime::from_nd(duration_sum / count, timescale);
            }
        } else if let Some(duration) = templates.iter().find_map(|t| t.duration) {
            if duration > 0 {
                return MediaTime::from_nd(duration as i64, timescale);
            }
        }
        MediaTime::from_millis(4_000)
    }

    /// Install a completed segment-index or init-segment load.
    pub fn complete_element_load(
        &self,
        request: &LoadRequest,
        entity: Option<CachedEntity>,
    ) {
        if let LoadRequestKind::SegmentIndex { representation, .. } = request.kind {
            if let Some(entity) = &entity {
                self.services.entity_cache.put(
                    request.url.as_str(),
                    request.range.as_deref(),
                    entity.clone(),
                );
            }
            self.services
                .search_state
                .complete_index_load(representation, entity);
        }
    }
}

fn content_protections_of(aset: &AdaptationSet) -> Vec<DrmCandidate> {
    aset.content_protections
        .iter()
        .map(|cp| DrmCandidate {
            scheme_id_uri: cp.scheme_id_uri.clone(),
            value: cp.value.clone(),
            common_scheme: cp.common_scheme,
            default_kids: cp
                .default_kid
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        })
        .collect()
}

fn find_adaptation_set<'a>(
    period: &'a Period,
    adaptation_set_id: &str,
) -> Option<(usize, &'a AdaptationSet)> {
    if adaptation_set_id.is_empty() {
        return None;
    }
    period
        .adaptation_sets
        .iter()
        .enumerate()
        .find(|(_, a)| a.id == adaptation_set_id)
}

fn resolve_selection(
    doc: &MpdDocument,
    period_index: usize,
    selection: &ActiveSelection,
) -> Option<(RepresentationAddress, CodecInfo)> {
    let period = &doc.periods[period_index];
    let (aset_index, aset) = find_adaptation_set(period, &selection.adaptation_set_id)?;
    let rep_index = aset
        .representations
        .iter()
        .position(|r| r.id == selection.representation_id)?;
    let rep = &aset.representations[rep_index];
    Some((
        RepresentationAddress {
            generation: doc.generation,
            period: period_index,
            adaptation_set: aset_index,
            representation: rep_index,
        },
        CodecInfo::new(rep.codecs.clone(), rep.mime_type.clone(), rep.bandwidth),
    ))
}

/// Period duration with the open-ended live fallback: the distance to the
/// presentation's last known end.
fn effective_period_duration(doc: &MpdDocument, period_index: usize) -> MediaTime {
    let period = &doc.periods[period_index];
    if period.duration.is_valid() && !period.duration.is_pos_infinity() {
        return period.duration;
    }
    let last_end = doc.last_period_end(false);
    if last_end.is_valid() && !last_end.is_pos_infinity() {
        last_end - period.start
    } else {
        MediaTime::invalid()
    }
}

fn has_following_period(doc: &MpdDocument, period_index: usize) -> bool {
    doc.periods
        .iter()
        .skip(period_index + 1)
        .any(|p| !p.is_early)
}

fn availability_end_time(doc: &MpdDocument) -> MediaTime {
    doc.availability_end_time
        .map(|t| MediaTime::from_millis(t.timestamp_millis()))
        .unwrap_or_else(MediaTime::invalid)
}

/// RFC 4647 extended filtering, reduced to what track selection needs:
/// subtag-wise comparison where `*` matches anything and a missing trailing
/// range subtag matches the rest.
fn language_matches(range: &str, tag: &str) -> bool {
    if range.is_empty() || range == "*" {
        return true;
    }
    if tag.is_empty() {
        return false;
    }
    let range_subtags: Vec<&str> = range.split('-').collect();
    let tag_subtags: Vec<&str> = tag.split('-').collect();
    let mut ti = 0;
    for (ri, r) in range_subtags.iter().enumerate() {
        if ri == 0 {
            // The primary subtags must match (or the range is a wildcard).
            if !r.eq_ignore_ascii_case(tag_subtags.first().unwrap_or(&""))
                && *r != "*"
            {
                return false;
            }
            ti = 1;
            continue;
        }
        if *r == "*" {
            continue;
        }
        // Scan forward through the tag for the next matching subtag;
        // single-character subtags stop the scan (they begin extensions).
        loop {
            match tag_subtags.get(ti) {
                None => return false,
                Some(t) if t.eq_ignore_ascii_case(r) => {
                    ti += 1;
                    break;
                }
                Some(t) if t.len() == 1 => return false,
                Some(_) => ti += 1,
            }
        }
    }
    true
}

fn sort_by_priority(candidates: &mut [PrioritizedCandidate]) {
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
}
