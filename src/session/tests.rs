//! Scenario tests for complete sessions
//!
//! These run both workers against scripted servers and local resources and
//! check what the application observes: frames at the sink, cache status,
//! requests on the wire and events.

use super::*;
use crate::config::NotifyPolicy;
use crate::protocol::EorReason;
use crate::test_utils::{
    MockCodec, RecordingSink, ScriptedConnector, ScriptedResponse, init_tracing, main_header,
    precinct,
};
use crate::types::{ResolutionLevel, SubRegion};
use std::time::Duration;

fn param(level: u8, frame: u32) -> ImageParameter {
    ImageParameter::new(
        SubRegion::new(0, 0, 16, 16),
        ResolutionLevel::new(level, 256 >> level, 256 >> level),
        3,
        frame,
    )
}

fn remote(frames: FrameRange) -> ResourceInfo {
    ResourceInfo { endpoint: Some(Endpoint::parse("jpip://server.test/jpip?movie.jpx").unwrap()), frames }
}

fn local(frames: FrameRange) -> ResourceInfo {
    ResourceInfo { endpoint: None, frames }
}

fn open(
    config: StreamConfig,
    resource: ResourceInfo,
    connector: ScriptedConnector,
    codec: MockCodec,
) -> (StreamSession, Arc<RecordingSink>) {
    init_tracing();
    let sink = RecordingSink::new();
    let session = StreamSession::open(
        config,
        resource,
        connector,
        crate::codec::shared(codec),
        sink.clone(),
        Capabilities::default(),
    )
    .unwrap();
    (session, sink)
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn resolution_change_never_decodes_from_stale_data() {
    let connector = ScriptedConnector::new();
    connector.push_response(ScriptedResponse::handshake("JPH_1", vec![main_header(0), main_header(1)]));
    connector.push_response(ScriptedResponse::data(
        vec![precinct(0, 0, 64), precinct(1, 0, 64)],
        EorReason::WindowDone,
    ));
    connector.push_response(ScriptedResponse::stall(vec![]));
    let codec = MockCodec::new(1);
    let log = codec.log();
    let (mut session, sink) =
        open(StreamConfig::default(), remote(FrameRange::new(0, 1)), connector.clone(), codec);

    session.set_parameter(param(1, 0));
    assert!(sink.wait_for(1, Duration::from_secs(2)).await);
    assert_eq!(session.status(0), CacheStatus::Complete);
    assert_eq!(session.status(1), CacheStatus::Complete);

    session.set_parameter(param(2, 0));
    assert!(eventually(|| connector.requests().len() == 3).await);
    assert_eq!(session.status(0), CacheStatus::Header);
    assert_eq!(session.status(1), CacheStatus::Header);
    assert!(connector.requests()[2].contains("fsiz=64,64,closest"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(log.records().iter().all(|r| r.level == 1), "{:?}", log.records());
    assert_eq!(sink.len(), 1);

    session.abolish().await;
}

#[tokio::test]
async fn abolish_while_reader_is_blocked_is_bounded() {
    let connector = ScriptedConnector::new();
    connector.push_response(ScriptedResponse::handshake("JPH_2", vec![]));
    connector.push_response(ScriptedResponse::stall(vec![precinct(0, 0, 8)]));
    let mut config = StreamConfig::default();
    config.session.notify = NotifyPolicy::OnNewData;
    let codec = MockCodec::new(3);
    let log = codec.log();
    let (mut session, sink) = open(config, remote(FrameRange::new(0, 3)), connector.clone(), codec);

    session.set_parameter(param(0, 0));
    assert!(sink.wait_for(1, Duration::from_secs(2)).await);

    tokio::time::timeout(Duration::from_secs(3), session.abolish())
        .await
        .expect("abolish must not hang on a blocked read");
    session.abolish().await;

    let requests = connector.requests().len();
    let decodes = log.len();
    session.set_parameter(param(1, 1));
    session.play();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.requests().len(), requests);
    assert_eq!(log.len(), decodes);
}

#[tokio::test]
async fn unreachable_server_is_retried() {
    let connector = ScriptedConnector::new();
    connector.fail_next_connects(2);
    connector.push_response(ScriptedResponse::handshake("JPH_3", vec![]));
    connector.push_response(ScriptedResponse::data(vec![precinct(0, 0, 8)], EorReason::ImageDone));
    let (mut session, sink) =
        open(StreamConfig::default(), remote(FrameRange::single(0)), connector.clone(), MockCodec::new(1));
    let mut events = session.events();

    session.set_parameter(param(0, 0));
    assert!(sink.wait_for(1, Duration::from_secs(3)).await);
    assert_eq!(connector.connect_count(), 1);
    assert!(matches!(events.recv().await, Ok(StreamEvent::ConnectionLost { .. })));

    session.abolish().await;
}

#[tokio::test]
async fn offline_session_never_touches_the_network() {
    let connector = ScriptedConnector::new();
    let mut config = StreamConfig::default();
    config.session.offline = true;
    let (mut session, sink) = open(config, remote(FrameRange::new(0, 1)), connector.clone(), MockCodec::new(1));

    session.set_parameter(param(0, 0));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.connect_count(), 0);
    assert!(connector.requests().is_empty());
    assert!(sink.is_empty());

    session.abolish().await;
}

#[tokio::test]
async fn local_movie_loops_until_paused() {
    let (mut session, sink) =
        open(StreamConfig::default(), local(FrameRange::new(0, 2)), ScriptedConnector::new(), MockCodec::new(3));
    session.set_parameter(param(0, 0));
    assert!(sink.wait_for(1, Duration::from_secs(1)).await);

    session.set_pacing(Pacing::Relative { fps: 200 });
    session.play();
    assert!(session.playback().movie);
    assert!(sink.wait_for(8, Duration::from_secs(2)).await);

    session.pause();
    assert!(!session.playback().movie);
    tokio::time::sleep(Duration::from_millis(30)).await;
    let shown = sink.len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.len(), shown);

    let frames = sink.frame_numbers();
    assert!(frames.windows(6).any(|w| w == [0, 1, 2, 0, 1, 2]), "{:?}", frames);

    session.abolish().await;
}

#[tokio::test]
async fn local_movie_in_stop_mode_ends_on_first_frame() {
    let (mut session, sink) =
        open(StreamConfig::default(), local(FrameRange::new(0, 3)), ScriptedConnector::new(), MockCodec::new(1));
    session.set_parameter(param(0, 1));
    session.set_animation_mode(AnimationMode::Stop);
    session.set_pacing(Pacing::Relative { fps: 200 });
    session.play();

    assert!(eventually(|| !session.playback().movie).await);
    assert!(eventually(|| sink.frame_numbers().starts_with(&[1, 2, 3, 0])).await);
    assert_eq!(session.current_frame(), Some(0));

    session.abolish().await;
}

#[tokio::test]
async fn frame_range_clamps_current_frame() {
    let (mut session, _sink) =
        open(StreamConfig::default(), local(FrameRange::new(0, 9)), ScriptedConnector::new(), MockCodec::new(1));
    session.set_parameter(param(0, 8));
    assert_eq!(session.current_frame(), Some(8));

    session.set_frame_range(FrameRange::new(2, 20));
    assert_eq!(session.frame_range(), FrameRange::new(2, 9));

    session.set_frame_range(FrameRange::new(2, 5));
    assert_eq!(session.current_frame(), Some(5));
    assert_eq!(session.accessible_until(), Some(5));

    session.abolish().await;
}

#[tokio::test]
async fn invalid_configuration_is_rejected() {
    let mut config = StreamConfig::default();
    config.render.max_render_samples = 0;
    let result = StreamSession::open(
        config,
        local(FrameRange::single(0)),
        ScriptedConnector::new(),
        crate::codec::shared(MockCodec::new(1)),
        RecordingSink::new(),
        Capabilities::default(),
    );
    assert!(matches!(result, Err(crate::StreamError::Config { .. })));
}
