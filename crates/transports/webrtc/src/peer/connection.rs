//! webrtc-rs backed peer transport

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{ConnectionState, PeerHandle, PeerTransport, PeerTransportFactory, TransportEvent};
use crate::config::{RelayConfig, VideoCodecPreference};
use crate::media::{MediaCodecFactory, RtpFrameSource, SamplePump};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};

const OPUS_PAYLOAD_TYPE: u8 = 111;

/// Creates [`RtcPeerTransport`]s sharing one configured webrtc-rs API
pub struct RtcTransportFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    outbound_codec: VideoCodecPreference,
    codecs: Arc<dyn MediaCodecFactory>,
}

impl RtcTransportFactory {
    /// Build the media engine from the configured codec preferences
    pub fn new(config: &RelayConfig, codecs: Arc<dyn MediaCodecFactory>) -> Result<Self> {
        let outbound_codec = config
            .video_codecs
            .first()
            .cloned()
            .ok_or_else(|| Error::InvalidConfig("video_codecs must not be empty".to_string()))?;

        let mut media_engine = MediaEngine::default();
        for pref in &config.video_codecs {
            media_engine
                .register_codec(codec_parameters(pref), RTPCodecType::Video)
                .map_err(|e| {
                    Error::WebRtcError(format!(
                        "Failed to register {} codec: {}",
                        pref.codec.mime_type(),
                        e
                    ))
                })?;
        }
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: OPUS_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| Error::WebRtcError(format!("Failed to register Opus codec: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        Ok(Self {
            api,
            ice_servers,
            outbound_codec,
            codecs,
        })
    }
}

#[async_trait]
impl PeerTransportFactory for RtcTransportFactory {
    #[instrument(skip(self))]
    async fn create(&self, label: &str) -> Result<PeerHandle> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        let (events_tx, events) = mpsc::unbounded_channel();
        install_callbacks(&pc, label, events_tx, Arc::clone(&self.codecs));

        info!(label, "Created peer connection");

        let transport = RtcPeerTransport {
            label: label.to_string(),
            pc,
            outbound_codec: self.outbound_codec.clone(),
            codecs: Arc::clone(&self.codecs),
            pumps: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        };

        Ok(PeerHandle {
            transport: Arc::new(transport),
            events,
        })
    }
}

fn codec_parameters(pref: &VideoCodecPreference) -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: codec_capability(pref),
        payload_type: pref.payload_type,
        ..Default::default()
    }
}

fn codec_capability(pref: &VideoCodecPreference) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: pref.codec.mime_type().to_owned(),
        clock_rate: depthrelay_core::VIDEO_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: pref.sdp_fmtp_line.clone(),
        rtcp_feedback: pref
            .feedback_pairs()
            .into_iter()
            .map(|(typ, parameter)| RTCPFeedback { typ, parameter })
            .collect(),
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting | RTCPeerConnectionState::Disconnected => {
            Some(ConnectionState::Connecting)
        }
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

fn install_callbacks(
    pc: &Arc<RTCPeerConnection>,
    label: &str,
    events: mpsc::UnboundedSender<TransportEvent>,
    codecs: Arc<dyn MediaCodecFactory>,
) {
    let state_tx = events.clone();
    let state_label = label.to_string();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        if let Some(state) = map_state(s) {
            debug!(label = %state_label, "Peer connection state: {}", state);
            let _ = state_tx.send(TransportEvent::StateChanged(state));
        }
        Box::pin(async {})
    }));

    let ice_tx = events.clone();
    let ice_label = label.to_string();
    pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
        let event = match c {
            None => Some(TransportEvent::IceGatheringComplete),
            Some(c) => match c.to_json() {
                Ok(init) => Some(TransportEvent::IceCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                })),
                Err(e) => {
                    warn!(label = %ice_label, "Failed to serialize local ICE candidate: {}", e);
                    None
                }
            },
        };
        if let Some(event) = event {
            let _ = ice_tx.send(event);
        }
        Box::pin(async {})
    }));

    let track_label = label.to_string();
    let pc_weak = Arc::downgrade(pc);
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let mime_type = track.codec().capability.mime_type;
        info!(
            label = %track_label,
            track = %track.id(),
            kind = %track.kind(),
            "Remote track added ({})",
            mime_type
        );

        if track.kind() == RTPCodecType::Video {
            request_keyframe(pc_weak.clone(), track.ssrc());
        }

        match codecs.decoder(&mime_type) {
            Ok(decoder) => {
                let source = RtpFrameSource::new(track, decoder);
                let _ = events.send(TransportEvent::RemoteTrack(Box::new(source)));
            }
            Err(e) => {
                warn!(label = %track_label, "No decoder for {}, draining track: {}", mime_type, e);
                tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
            }
        }
        Box::pin(async {})
    }));
}

fn request_keyframe(pc: std::sync::Weak<RTCPeerConnection>, media_ssrc: u32) {
    tokio::spawn(async move {
        let Some(pc) = pc.upgrade() else { return };
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
            debug!("Failed to send PLI: {}", e);
        }
    });
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    };
    parsed.map_err(|e| Error::SdpError(format!("Invalid {:?} SDP: {}", desc.sdp_type, e)))
}

/// [`PeerTransport`] over a webrtc-rs peer connection
pub struct RtcPeerTransport {
    label: String,
    pc: Arc<RTCPeerConnection>,
    outbound_codec: VideoCodecPreference,
    codecs: Arc<dyn MediaCodecFactory>,
    pumps: Mutex<Vec<SamplePump>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl RtcPeerTransport {
    /// Number of outbound sample pumps still running
    pub fn active_pumps(&self) -> usize {
        self.pumps.lock().iter().filter(|p| !p.is_finished()).count()
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    fn label(&self) -> &str {
        &self.label
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    #[instrument(skip(self, track), fields(label = %self.label, track = %track.id()))]
    async fn add_track(&self, track: Arc<depthrelay_core::SyntheticTrack>) -> Result<()> {
        let encoder = self.codecs.encoder(&self.outbound_codec)?;

        let local = Arc::new(TrackLocalStaticSample::new(
            codec_capability(&self.outbound_codec),
            track.id().to_string(),
            format!("depthrelay-{}", self.label),
        ));

        let sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::TrackError(format!("Failed to add track {}: {}", track.id(), e)))?;

        // RTCP must be read for interceptors (NACK, PLI) to work
        let rtcp_cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                tokio::select! {
                    _ = rtcp_cancel.cancelled() => break,
                    read = sender.read(&mut buf) => if read.is_err() { break },
                }
            }
        });

        let pump = SamplePump::spawn(track, local, encoder, self.cancel.child_token());
        self.pumps.lock().push(pump);

        debug!("Outbound track attached");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.cancel.cancel();
        for pump in self.pumps.lock().drain(..) {
            pump.abort();
        }

        info!(label = %self.label, "Closing peer connection");
        self.pc
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}
