//! Play-period behavior: track selection, composite starting requests,
//! next/retry sequencing.

mod common;

use std::sync::Arc;

use common::*;
use kinema_core::{MediaTime, SequenceState, StreamType};
use kinema_player::{
    PlayPeriod, PlayStartOptions, PlayStartPosition, SearchType, SegmentLookup, SegmentRequest,
    SessionServices, StreamPreferences, TrackChangeOutcome,
};

const MULTI_TRACK_VOD: &str = r#"<MPD type="static" mediaPresentationDuration="PT10S">
  <Period id="p0" start="PT0S">
    <AdaptationSet id="v" contentType="video" mimeType="video/mp4" codecs="avc1.64001f">
      <SegmentTemplate timescale="1000" duration="2000" startNumber="1"
                       media="$RepresentationID$/seg-$Number$.m4s" initialization="$RepresentationID$/init.mp4"/>
      <Representation id="v-low" bandwidth="800000"/>
      <Representation id="v-mid" bandwidth="1800000"/>
      <Representation id="v-high" bandwidth="4500000"/>
    </AdaptationSet>
    <AdaptationSet id="a-de" contentType="audio" mimeType="audio/mp4" lang="de" codecs="mp4a.40.2">
      <SegmentTemplate timescale="1000" duration="2000" startNumber="1"
                       media="a-de/$Number$.m4s" initialization="a-de/init.mp4"/>
      <Representation id="a-de-0" bandwidth="128000"/>
    </AdaptationSet>
    <AdaptationSet id="a-en" contentType="audio" mimeType="audio/mp4" lang="en" codecs="mp4a.40.2">
      <SegmentTemplate timescale="1000" duration="2000" startNumber="1"
                       media="a-en/$Number$.m4s" initialization="a-en/init.mp4"/>
      <Representation id="a-en-0" bandwidth="128000"/>
    </AdaptationSet>
    <AdaptationSet id="s-en" contentType="text" mimeType="text/vtt" lang="en">
      <Representation id="sub-en" bandwidth="256">
        <BaseURL>subs_en.vtt</BaseURL>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

fn start_at(seconds: i64) -> PlayStartPosition {
    PlayStartPosition {
        time: MediaTime::from_seconds(seconds),
        options: PlayStartOptions::default(),
    }
}

fn loaded_period(services: &Arc<SessionServices>) -> PlayPeriod {
    let mut period = PlayPeriod::new(services.clone(), "p0".to_string());
    period.set_stream_preferences(
        StreamType::Audio,
        StreamPreferences {
            language_rfc4647: Some("en".to_string()),
            ..Default::default()
        },
    );
    period.load();
    period.prepare_for_play();
    period
}

fn expect_found(lookup: SegmentLookup) -> Box<SegmentRequest> {
    match lookup {
        SegmentLookup::Found(request) => request,
        other => panic!("expected Found, got {other:?}"),
    }
}

#[test]
fn load_selects_tracks_by_language_and_leaves_subtitles_off() {
    let doc = parse(MULTI_TRACK_VOD, 1);
    let services = services_over(StaticManifestReader::with_document(doc));
    let period = loaded_period(&services);

    assert_eq!(period.selected_adaptation_set_id(StreamType::Video), "v");
    assert_eq!(period.selected_adaptation_set_id(StreamType::Audio), "a-en");
    // Subtitles require explicit selection.
    assert_eq!(period.selected_adaptation_set_id(StreamType::Subtitle), "");

    let audio_source = period.selected_buffer_source(StreamType::Audio).unwrap();
    assert_eq!(audio_source.language, "en");
    assert_eq!(audio_source.period_adaptation_set_id, "p0/a-en");
}

#[test]
fn prepare_for_play_picks_starting_bitrates() {
    let doc = parse(MULTI_TRACK_VOD, 1);
    let services = services_over(StaticManifestReader::with_document(doc));
    let period = loaded_period(&services);

    // Default starting bitrate is 2 Mbps: v-mid (1.8M) is the best fit.
    let composite = {
        let mut period = period;
        expect_found(period.get_starting_segment(
            SequenceState::new().index(),
            &start_at(0),
            SearchType::Closest,
        ))
    };
    let video = composite
        .dependent_streams
        .iter()
        .find(|r| r.stream_type == Some(StreamType::Video))
        .unwrap();
    assert_eq!(video.codec_info.bitrate, 1_800_000);
    assert!(video
        .segment
        .media_url
        .url
        .as_ref()
        .unwrap()
        .as_str()
        .contains("v-mid/"));
}

#[test]
fn starting_segment_is_a_composite_of_active_streams() {
    let doc = parse(MULTI_TRACK_VOD, 1);
    let services = services_over(StaticManifestReader::with_document(doc));
    let mut period = loaded_period(&services);

    let sequence = SequenceState::new();
    let composite = expect_found(period.get_starting_segment(
        sequence.index(),
        &start_at(5),
        SearchType::Closest,
    ));
    assert!(composite.is_initial_start_request);
    assert_eq!(composite.dependent_streams.len(), 2); // video + audio
    assert!(composite.first_pts().is_valid());
    for request in composite.dependent_streams.iter() {
        assert_eq!(request.timestamp_sequence_index, sequence.index());
        assert_eq!(request.period_id, "p0");
        assert!(!request.is_eos_segment);
    }
    // All sub-requests resolved at the same aligned position.
    let video = &composite.dependent_streams[0];
    let audio = &composite.dependent_streams[1];
    assert_eq!(
        video.segment.period_local_start(),
        audio.segment.period_local_start()
    );
    // Video starts decode at its segment boundary (no trimming).
    assert_eq!(
        video.segment.media_local_first_au_time,
        video.segment.time
    );
}

#[test]
fn frame_accurate_start_keeps_target_time() {
    let doc = parse(MULTI_TRACK_VOD, 1);
    let services = services_over(StaticManifestReader::with_document(doc));
    let mut period = loaded_period(&services);

    let position = PlayStartPosition {
        time: MediaTime::from_millis(5_300),
        options: PlayStartOptions {
            frame_accuracy: true,
            ..Default::default()
        },
    };
    let composite = expect_found(period.get_starting_segment(
        SequenceState::new().index(),
        &position,
        SearchType::Closest,
    ));
    let video = &composite.dependent_streams[0];
    // The segment containing 5.3s starts at 4s; the exact target rides
    // along for decode-and-discard.
    assert_eq!(video.segment.time, 4_000);
    assert_eq!(video.frame_accurate_time, MediaTime::from_millis(5_300));
    // Frame accuracy keeps the trim point at the requested time.
    assert_eq!(video.segment.media_local_first_au_time, 5_300);
}

#[test]
fn subtitle_eos_is_partial_not_fatal() {
    // Subtitle track covers only the first 4 seconds of a 10s period.
    let xml = r#"<MPD type="static" mediaPresentationDuration="PT10S">
      <Period id="p0" start="PT0S">
        <AdaptationSet id="v" contentType="video" mimeType="video/mp4">
          <SegmentTemplate timescale="1000" duration="2000" startNumber="1"
                           media="v/$Number$.m4s" initialization="v/init.mp4"/>
          <Representation id="v0" bandwidth="1000000"/>
        </AdaptationSet>
        <AdaptationSet id="s" contentType="text" mimeType="application/mp4" lang="en">
          <SegmentTemplate timescale="1000" duration="2000" startNumber="1" endNumber="2"
                           media="s/$Number$.m4s" initialization="s/init.mp4"/>
          <Representation id="s0" bandwidth="256"/>
        </AdaptationSet>
      </Period>
    </MPD>"#;
    let doc = parse(xml, 1);
    let services = services_over(StaticManifestReader::with_document(doc));
    let mut period = PlayPeriod::new(services.clone(), "p0".to_string());
    period.set_stream_preferences(
        StreamType::Subtitle,
        StreamPreferences {
            language_rfc4647: Some("en".to_string()),
            override_index: Some(0),
            ..Default::default()
        },
    );
    period.load();
    period.prepare_for_play();

    // At 6s the subtitle track (ends at 4s) is done but video continues.
    let composite = expect_found(period.get_starting_segment(
        SequenceState::new().index(),
        &start_at(6),
        SearchType::Closest,
    ));
    let video = composite
        .dependent_streams
        .iter()
        .find(|r| r.stream_type == Some(StreamType::Video))
        .unwrap();
    assert!(!video.is_eos_segment);
    let subtitle = composite
        .dependent_streams
        .iter()
        .find(|r| r.stream_type == Some(StreamType::Subtitle))
        .unwrap();
    assert!(subtitle.is_eos_segment);
}

#[test]
fn next_segment_advances_and_past_eos_at_period_end() {
    let doc = parse(MULTI_TRACK_VOD, 1);
    let services = services_over(StaticManifestReader::with_document(doc));
    let mut period = loaded_period(&services);

    let composite = expect_found(period.get_starting_segment(
        SequenceState::new().index(),
        &start_at(0),
        SearchType::Closest,
    ));
    let mut current = composite.dependent_streams[0].clone();
    let options = PlayStartOptions::default();

    let mut numbers = vec![current.segment.number];
    loop {
        match period.get_next_segment(&current, &options) {
            SegmentLookup::Found(next) => {
                numbers.push(next.segment.number);
                current = *next;
            }
            SegmentLookup::PastEos => break,
            other => panic!("unexpected lookup {other:?}"),
        }
    }
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
}

#[test]
fn retry_segment_bumps_counter_and_filler_reuses_request() {
    let doc = parse(MULTI_TRACK_VOD, 1);
    let services = services_over(StaticManifestReader::with_document(doc));
    let mut period = loaded_period(&services);

    let composite = expect_found(period.get_starting_segment(
        SequenceState::new().index(),
        &start_at(4),
        SearchType::Closest,
    ));
    let current = composite.dependent_streams[0].clone();
    let options = PlayStartOptions::default();

    let retry = expect_found(period.get_retry_segment(&current, &options, false));
    assert_eq!(retry.segment.number, current.segment.number);
    assert_eq!(retry.num_overall_retries, current.num_overall_retries + 1);

    let filler = expect_found(period.get_retry_segment(&current, &options, true));
    assert!(filler.insert_filler_data);
    assert_eq!(filler.segment, current.segment);
    assert_eq!(filler.num_overall_retries, current.num_overall_retries + 1);
}

#[test]
fn video_track_change_forces_start_over() {
    let doc = parse(MULTI_TRACK_VOD, 1);
    let services = services_over(StaticManifestReader::with_document(doc));
    let mut period = loaded_period(&services);

    assert_eq!(
        period.change_track_preference(StreamType::Video, StreamPreferences::default()),
        TrackChangeOutcome::StartOver
    );
    assert_eq!(
        period.change_track_preference(
            StreamType::Audio,
            StreamPreferences {
                language_rfc4647: Some("de".to_string()),
                ..Default::default()
            }
        ),
        TrackChangeOutcome::NewPeriodNeeded
    );
}

#[test]
fn drm_protections_attach_to_requests() {
    let xml = r#"<MPD type="static" mediaPresentationDuration="PT10S">
      <Period id="p0" start="PT0S">
        <AdaptationSet id="v" contentType="video" mimeType="video/mp4">
          <ContentProtection schemeIdUri="urn:mpeg:dash:mp4protection:2011" value="cenc"
                             cenc:default_KID="00000000-0000-0000-0000-000000000001"/>
          <ContentProtection schemeIdUri="urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed"/>
          <SegmentTemplate timescale="1000" duration="2000" startNumber="1"
                           media="v/$Number$.m4s" initialization="v/init.mp4"/>
          <Representation id="v0" bandwidth="1000000"/>
        </AdaptationSet>
      </Period>
    </MPD>"#;
    let doc = parse(xml, 1);
    let services = services_over(StaticManifestReader::with_document(doc));
    let mut period = PlayPeriod::new(services, "p0".to_string());
    period.load();
    period.prepare_for_play();

    let composite = expect_found(period.get_starting_segment(
        SequenceState::new().index(),
        &start_at(0),
        SearchType::Closest,
    ));
    let video = &composite.dependent_streams[0];
    let drm = video.drm_client.as_ref().expect("DRM client attached");
    assert_eq!(drm.candidates.len(), 2);
    assert!(drm.candidates[0].common_scheme);
    assert_eq!(
        drm.candidates[0].default_kids,
        vec!["00000000-0000-0000-0000-000000000001".to_string()]
    );
}

#[test]
fn init_segment_preload_is_deduplicated() {
    let doc = parse(MULTI_TRACK_VOD, 1);
    let reader = StaticManifestReader::with_document(doc);
    let services = services_over(reader.clone());

    let mut period = PlayPeriod::new(services.clone(), "p0".to_string());
    period.load();
    period.prepare_for_play();
    let first_batch = reader.take_load_requests();
    // One init per video representation.
    assert_eq!(first_batch.len(), 3);

    // Preparing again does not re-request.
    period.prepare_for_play();
    assert!(reader.take_load_requests().is_empty());
}

#[test]
fn average_segment_duration_from_template_and_timeline() {
    let doc = parse(MULTI_TRACK_VOD, 1);
    let services = services_over(StaticManifestReader::with_document(doc));
    let period = loaded_period(&services);
    assert_eq!(
        period.average_segment_duration("v", "v-mid"),
        MediaTime::from_seconds(2)
    );

    let xml = r#"<MPD type="static" mediaPresentationDuration="PT9S">
      <Period id="p0" start="PT0S">
        <AdaptationSet id="v" contentType="video" mimeType="video/mp4">
          <SegmentTemplate timescale="1000" media="s-$Time$.m4s" initialization="init.mp4">
            <SegmentTimeline>
              <S t="0" d="2000" r="2"/>
              <S d="3000"/>
            </SegmentTimeline>
          </SegmentTemplate>
          <Representation id="v0" bandwidth="1"/>
        </AdaptationSet>
      </Period>
    </MPD>"#;
    let doc = parse(xml, 1);
    let services = services_over(StaticManifestReader::with_document(doc));
    let period = PlayPeriod::new(services, "p0".to_string());
    // (3*2000 + 1*3000) / 4 = 2250ms.
    assert_eq!(
        period.average_segment_duration("v", "v0"),
        MediaTime::from_millis(2_250)
    );
}

#[test]
fn fetch_delay_growth_triggers_clock_resync() {
    let doc = parse(MULTI_TRACK_VOD, 1);
    let reader = StaticManifestReader::with_document(doc);
    let services = services_over(reader.clone());
    let period = PlayPeriod::new(services, "p0".to_string());

    period.increase_segment_fetch_delay(MediaTime::from_millis(200));
    assert_eq!(*reader.clock_resyncs.lock(), 0);
    period.increase_segment_fetch_delay(MediaTime::from_millis(400));
    assert_eq!(*reader.clock_resyncs.lock(), 1);
}
