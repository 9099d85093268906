//! End-to-end session tests: manifest fetch over the injected network,
//! segment-index loads through the reader, worker lifecycle.

use std::sync::Arc;
use std::time::Duration;

use kinema::{create_player, FixedClock, MediaTime, PlayerConfig, SessionDeps};
use kinema_net::mock::StaticNet;
use kinema_player::{PlayerState, SegmentRequest, StreamReader};
use parking_lot::Mutex;
use url::Url;

const MANIFEST_URL: &str = "https://cdn.example.com/live/manifest.mpd";

const TEMPLATE_VOD: &str = r#"<MPD type="static" mediaPresentationDuration="PT8S">
  <Period id="p0" start="PT0S">
    <AdaptationSet id="v" contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1000" duration="2000" startNumber="1"
                       media="v/$Number$.m4s" initialization="v/init.mp4"/>
      <Representation id="v0" bandwidth="1000000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

const SIDX_VOD: &str = r#"<MPD type="static" mediaPresentationDuration="PT8S">
  <Period id="p0" start="PT0S">
    <AdaptationSet id="v" contentType="video" mimeType="video/mp4">
      <Representation id="v0" bandwidth="800000">
        <BaseURL>video.mp4</BaseURL>
        <SegmentBase timescale="1" indexRange="32-87">
          <Initialization range="0-31"/>
        </SegmentBase>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

#[derive(Default)]
struct CollectingStreamReader {
    requests: Mutex<Vec<Arc<SegmentRequest>>>,
}

impl CollectingStreamReader {
    fn len(&self) -> usize {
        self.requests.lock().len()
    }
}

impl StreamReader for CollectingStreamReader {
    fn add_request(&self, request: Arc<SegmentRequest>) {
        self.requests.lock().push(request);
    }
}

/// A fake media file head: 32 bytes of init data followed by the sidx box
/// at the offset the manifest's `@indexRange` declares.
fn media_file_head() -> Vec<u8> {
    let mut out = vec![0u8; 32];
    out.extend_from_slice(&sidx_bytes());
    out
}

/// Version-0 sidx: two 4s entries of 1000/1200 bytes, timescale 1.
fn sidx_bytes() -> Vec<u8> {
    let entries: &[(u32, u32)] = &[(1_000, 4), (1_200, 4)];
    let size = 32 + entries.len() * 12;
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&(size as u32).to_be_bytes());
    out.extend_from_slice(b"sidx");
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(&1u32.to_be_bytes()); // reference_ID
    out.extend_from_slice(&1u32.to_be_bytes()); // timescale
    out.extend_from_slice(&0u32.to_be_bytes()); // EPT
    out.extend_from_slice(&0u32.to_be_bytes()); // first_offset
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&(entries.len() as u16).to_be_bytes());
    for (bytes, duration) in entries {
        out.extend_from_slice(&(bytes & 0x7FFF_FFFF).to_be_bytes());
        out.extend_from_slice(&duration.to_be_bytes());
        out.extend_from_slice(&(0x9000_0000u32).to_be_bytes()); // SAP 1
    }
    out
}

fn deps_with(net: Arc<StaticNet>, stream_reader: Arc<CollectingStreamReader>) -> SessionDeps {
    SessionDeps {
        net: Some(net),
        stream_reader: Some(stream_reader),
        clock: Some(Arc::new(FixedClock::new(
            "2025-05-01T00:00:00Z".parse().unwrap(),
        ))),
        ..Default::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for condition");
}

#[tokio::test]
async fn open_fetches_manifest_and_starts_playback() {
    init_tracing();
    let net = Arc::new(StaticNet::new());
    net.insert(MANIFEST_URL, TEMPLATE_VOD.as_bytes());
    let stream_reader = Arc::new(CollectingStreamReader::default());

    let config = PlayerConfig::new(Url::parse(MANIFEST_URL).unwrap());
    let player = create_player(config, deps_with(net.clone(), stream_reader.clone())).unwrap();

    player.open().await.unwrap();
    wait_until(|| stream_reader.len() >= 1).await;

    let request = stream_reader.requests.lock()[0].clone();
    assert_eq!(request.segment.number, 1);
    assert_eq!(
        request.segment.media_url.url.as_ref().unwrap().as_str(),
        "https://cdn.example.com/live/v/1.m4s"
    );
    assert_eq!(net.hits(MANIFEST_URL), 1);

    wait_until(|| player.handle().snapshot().state == PlayerState::Playing).await;
    assert_eq!(
        player.handle().snapshot().duration,
        MediaTime::from_seconds(8)
    );

    player.close().await;
}

#[tokio::test]
async fn segment_index_loads_flow_through_the_reader() {
    init_tracing();
    let net = Arc::new(StaticNet::new());
    net.insert(MANIFEST_URL, SIDX_VOD.as_bytes());
    net.insert("https://cdn.example.com/live/video.mp4", media_file_head());
    let stream_reader = Arc::new(CollectingStreamReader::default());

    let config = PlayerConfig::new(Url::parse(MANIFEST_URL).unwrap());
    let player = create_player(config, deps_with(net.clone(), stream_reader.clone())).unwrap();

    player.open().await.unwrap();
    // The worker needs the sidx first; the reader fetches it, then the
    // retried search resolves the first segment.
    wait_until(|| stream_reader.len() >= 1).await;

    let request = stream_reader.requests.lock()[0].clone();
    assert_eq!(request.segment.number, 0);
    assert_eq!(request.segment.number_of_bytes, 1_000);
    // first_offset(0) + index start(32) + index size(56).
    assert_eq!(request.segment.first_byte_offset, 88);
    assert_eq!(request.segment.media_url.range.as_deref(), Some("88-1087"));
    assert!(net.hits("https://cdn.example.com/live/video.mp4") >= 1);

    player.close().await;
}

#[tokio::test]
async fn missing_manifest_fails_open() {
    let net = Arc::new(StaticNet::new());
    let stream_reader = Arc::new(CollectingStreamReader::default());
    let config = PlayerConfig::new(Url::parse(MANIFEST_URL).unwrap());
    let player = create_player(config, deps_with(net, stream_reader)).unwrap();

    assert!(player.open().await.is_err());
    player.close().await;
}

#[tokio::test]
async fn seek_after_open_lands_on_the_right_segment() {
    let net = Arc::new(StaticNet::new());
    net.insert(MANIFEST_URL, TEMPLATE_VOD.as_bytes());
    let stream_reader = Arc::new(CollectingStreamReader::default());

    let config = PlayerConfig::new(Url::parse(MANIFEST_URL).unwrap());
    let player = create_player(config, deps_with(net, stream_reader.clone())).unwrap();

    player.open().await.unwrap();
    wait_until(|| stream_reader.len() >= 1).await;

    player
        .handle()
        .seek_to(kinema::SeekParams {
            time: MediaTime::from_seconds(5),
            scrubbing: false,
        })
        .await;
    wait_until(|| stream_reader.len() >= 2).await;

    let request = stream_reader.requests.lock()[1].clone();
    // 5s lies in segment 3 ([4,6)).
    assert_eq!(request.segment.number, 3);

    player.close().await;
}
