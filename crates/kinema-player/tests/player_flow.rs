//! Worker state machine: open, segment chaining, seek, end of stream.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use kinema_core::{MediaTime, StreamType};
use kinema_player::{
    AdaptivePlayer, PlayerEvent, PlayerState, PlayerWorkerOptions, SeekParams,
};

const SHORT_VOD: &str = r#"<MPD type="static" mediaPresentationDuration="PT6S">
  <Period id="p0" start="PT0S">
    <AdaptationSet id="v" contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1000" duration="2000" startNumber="1"
                       media="v/$Number$.m4s" initialization="v/init.mp4"/>
      <Representation id="v0" bandwidth="1000000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

struct Fixture {
    handle: kinema_player::PlayerHandle,
    stream_reader: Arc<RecordingStreamReader>,
}

fn fixture(xml: &str) -> Fixture {
    let reader = StaticManifestReader::with_document(parse(xml, 1));
    let stream_reader = Arc::new(RecordingStreamReader::default());
    let services = services_full(
        reader,
        stream_reader.clone(),
        TestClock::at("2025-05-01T00:00:00Z"),
    );
    let handle = AdaptivePlayer::spawn(services, PlayerWorkerOptions::default());
    Fixture {
        handle,
        stream_reader,
    }
}

async fn wait_for_requests(stream_reader: &RecordingStreamReader, count: usize) {
    for _ in 0..200 {
        if stream_reader.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "timed out waiting for {count} stream requests, have {}",
        stream_reader.len()
    );
}

async fn wait_for_event(
    rx: &mut tokio::sync::broadcast::Receiver<PlayerEvent>,
    matcher: impl Fn(&PlayerEvent) -> bool,
) -> PlayerEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.expect("event channel open");
            if matcher(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn open_dispatches_the_starting_segment() {
    let fx = fixture(SHORT_VOD);
    let mut events = fx.handle.subscribe_events();

    assert!(fx.handle.open(None).await);
    wait_for_requests(&fx.stream_reader, 1).await;

    let requests = fx.stream_reader.take();
    assert_eq!(requests.len(), 1);
    let video = &requests[0];
    assert_eq!(video.stream_type, Some(StreamType::Video));
    assert_eq!(video.segment.number, 1);
    assert!(video
        .segment
        .media_url
        .url
        .as_ref()
        .unwrap()
        .as_str()
        .ends_with("v/1.m4s"));

    wait_for_event(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::StateChanged {
                to: PlayerState::Playing,
                ..
            }
        )
    })
    .await;
    assert_eq!(fx.handle.snapshot().state, PlayerState::Playing);
    assert_eq!(fx.handle.snapshot().duration, MediaTime::from_seconds(6));

    fx.handle.close().await;
}

#[tokio::test]
async fn tracks_are_announced_once_on_initial_buffering() {
    let fx = fixture(SHORT_VOD);
    let mut events = fx.handle.subscribe_events();

    fx.handle.open(None).await;
    let event = wait_for_event(&mut events, |e| matches!(e, PlayerEvent::TracksChanged { .. })).await;
    match event {
        PlayerEvent::TracksChanged { tracks } => {
            assert_eq!(tracks.len(), 1);
            assert_eq!(tracks[0].stream_type, Some(StreamType::Video));
        }
        _ => unreachable!(),
    }

    fx.handle.close().await;
}

#[tokio::test]
async fn segment_completion_drives_the_chain_to_end_of_stream() {
    let fx = fixture(SHORT_VOD);
    let mut events = fx.handle.subscribe_events();

    fx.handle.open(None).await;
    wait_for_requests(&fx.stream_reader, 1).await;

    // Feed completions back; the worker must walk segments 1..3 and then
    // report end of stream.
    let mut seen_numbers = Vec::new();
    loop {
        let requests = fx.stream_reader.take();
        let mut progressed = false;
        for request in requests {
            seen_numbers.push(request.segment.number);
            progressed = true;
            fx.handle
                .notify_segment_completed(Box::new((*request).clone()));
        }
        if seen_numbers.len() >= 3 {
            break;
        }
        if !progressed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    assert_eq!(seen_numbers, vec![1, 2, 3]);

    wait_for_event(&mut events, |e| matches!(e, PlayerEvent::EndOfStream)).await;
    let snapshot = fx.handle.snapshot();
    assert!(snapshot.has_ended);
    assert_eq!(snapshot.state, PlayerState::Paused);

    fx.handle.close().await;
}

#[tokio::test]
async fn seek_restarts_with_a_new_sequence_epoch() {
    let fx = fixture(SHORT_VOD);
    let mut events = fx.handle.subscribe_events();

    fx.handle.open(None).await;
    wait_for_requests(&fx.stream_reader, 1).await;
    let first = fx.stream_reader.take().remove(0);

    fx.handle
        .seek_to(SeekParams {
            time: MediaTime::from_seconds(4),
            scrubbing: false,
        })
        .await;
    wait_for_event(&mut events, |e| matches!(e, PlayerEvent::SeekCompleted { .. })).await;
    wait_for_requests(&fx.stream_reader, 1).await;

    let seeked = fx.stream_reader.take().remove(0);
    assert_eq!(seeked.segment.number, 3);
    // A seek is a timeline discontinuity: the sequence index must differ.
    assert_ne!(
        seeked.timestamp_sequence_index,
        first.timestamp_sequence_index
    );

    fx.handle.close().await;
}

#[tokio::test]
async fn pause_and_resume_toggle_state() {
    let fx = fixture(SHORT_VOD);
    let mut events = fx.handle.subscribe_events();

    fx.handle.open(None).await;
    wait_for_event(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::StateChanged {
                to: PlayerState::Playing,
                ..
            }
        )
    })
    .await;

    fx.handle.pause().await;
    wait_for_event(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::StateChanged {
                to: PlayerState::Paused,
                ..
            }
        )
    })
    .await;
    assert_eq!(fx.handle.snapshot().playback_rate, 0.0);

    fx.handle.resume().await;
    wait_for_event(&mut events, |e| {
        matches!(
            e,
            PlayerEvent::StateChanged {
                to: PlayerState::Playing,
                ..
            }
        )
    })
    .await;

    fx.handle.close().await;
}

#[tokio::test]
async fn failed_segment_is_replaced_with_filler() {
    let fx = fixture(SHORT_VOD);

    fx.handle.open(None).await;
    wait_for_requests(&fx.stream_reader, 1).await;
    let first = fx.stream_reader.take().remove(0);

    fx.handle
        .notify_segment_failed(Box::new((*first).clone()), true);
    wait_for_requests(&fx.stream_reader, 1).await;

    let replacement = fx.stream_reader.take().remove(0);
    assert!(replacement.insert_filler_data);
    assert_eq!(replacement.segment.number, first.segment.number);
    assert_eq!(replacement.num_overall_retries, 1);

    fx.handle.close().await;
}
