//! Offer/answer between two webrtc-rs transports
//!
//! Only descriptions are exchanged; no ICE connectivity is required.

use std::sync::Arc;

use depthrelay_core::{FrameRelayQueue, SyntheticTrack};
use depthrelay_webrtc::peer::{PeerTransport, PeerTransportFactory};
use depthrelay_webrtc::signaling::SdpType;
use depthrelay_webrtc::testing::RawCodecFactory;
use depthrelay_webrtc::{RelayConfig, RtcPeerTransport, RtcTransportFactory};

fn offline_config() -> RelayConfig {
    RelayConfig {
        stun_servers: vec![],
        ..Default::default()
    }
}

fn relay_track(name: &str) -> Arc<SyntheticTrack> {
    let queue = Arc::new(FrameRelayQueue::new(name, 60).unwrap());
    Arc::new(SyntheticTrack::video(name, queue, 30, false).unwrap())
}

#[tokio::test]
async fn test_offer_advertises_configured_video_codecs() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let factory = RtcTransportFactory::new(&offline_config(), Arc::new(RawCodecFactory)).unwrap();
    let forwarder = factory.create("server").await.unwrap();

    forwarder.transport.add_track(relay_track("original")).await.unwrap();
    forwarder.transport.add_track(relay_track("transformed")).await.unwrap();

    let offer = forwarder.transport.create_offer().await.unwrap();
    assert_eq!(offer.sdp_type, SdpType::Offer);
    assert_eq!(offer.sdp.matches("m=video").count(), 2);
    assert!(offer.sdp.contains("VP8/90000"));
    assert!(offer.sdp.contains("H264/90000"));
    assert!(offer.sdp.contains("nack pli"));

    forwarder.transport.close().await.unwrap();
}

#[tokio::test]
async fn test_answer_accepts_relay_offer() {
    let factory = RtcTransportFactory::new(&offline_config(), Arc::new(RawCodecFactory)).unwrap();
    let forwarder = factory.create("server").await.unwrap();
    let viewer = factory.create("viewer").await.unwrap();

    forwarder.transport.add_track(relay_track("original")).await.unwrap();
    let offer = forwarder.transport.create_offer().await.unwrap();
    forwarder.transport.set_local_description(&offer).await.unwrap();

    viewer.transport.set_remote_description(&offer).await.unwrap();
    let answer = viewer.transport.create_answer().await.unwrap();
    assert_eq!(answer.sdp_type, SdpType::Answer);
    assert!(answer.sdp.contains("m=video"));
    viewer.transport.set_local_description(&answer).await.unwrap();

    forwarder.transport.set_remote_description(&answer).await.unwrap();

    forwarder.transport.close().await.unwrap();
    viewer.transport.close().await.unwrap();
    // Closing twice is harmless
    viewer.transport.close().await.unwrap();
}

#[tokio::test]
async fn test_answer_without_offer_fails() {
    let factory = RtcTransportFactory::new(&offline_config(), Arc::new(RawCodecFactory)).unwrap();
    let receiver = factory.create("server-in").await.unwrap();

    let err = receiver.transport.create_answer().await.unwrap_err();
    assert!(err.is_session_fatal(), "unexpected error class: {}", err);

    receiver.transport.close().await.unwrap();
}

#[test]
fn test_transport_type_is_exported() {
    fn assert_transport<T: PeerTransport>() {}
    assert_transport::<RtcPeerTransport>();
}
