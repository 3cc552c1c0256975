//! Bridges between webrtc-rs tracks and relay frames

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use depthrelay_core::{Error as CoreError, Frame, FrameSource, SyntheticTrack, TrackKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::codec::{FrameDecoder, FrameEncoder};

/// Received track that yields decoded frames
pub struct RtpFrameSource {
    id: String,
    kind: TrackKind,
    track: Arc<TrackRemote>,
    decoder: Box<dyn FrameDecoder>,
    packets: u64,
}

impl RtpFrameSource {
    /// Wrap a remote track with its decoder
    pub fn new(track: Arc<TrackRemote>, decoder: Box<dyn FrameDecoder>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        Self {
            id: track.id(),
            kind,
            track,
            decoder,
            packets: 0,
        }
    }

    /// RTP packets read so far
    pub fn packets_read(&self) -> u64 {
        self.packets
    }
}

#[async_trait]
impl FrameSource for RtpFrameSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn next_frame(&mut self) -> depthrelay_core::Result<Option<Frame>> {
        loop {
            let (packet, _) = self
                .track
                .read_rtp()
                .await
                .map_err(|e| CoreError::TrackEnded(format!("{}: {}", self.id, e)))?;
            self.packets += 1;

            match self.decoder.push_packet(
                &packet.payload,
                packet.header.timestamp,
                packet.header.marker,
            ) {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => {}
                Err(e) => warn!(track = %self.id, "Dropping undecodable packet: {}", e),
            }
        }
    }
}

/// Task that drains a synthetic track into a local sample track
pub struct SamplePump {
    handle: JoinHandle<()>,
}

impl SamplePump {
    /// Start pumping until `cancel` fires or the synthetic track's queue closes
    pub fn spawn(
        source: Arc<SyntheticTrack>,
        sink: Arc<TrackLocalStaticSample>,
        mut encoder: Box<dyn FrameEncoder>,
        cancel: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let duration = source.frame_duration();
            let mut written: u64 = 0;

            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = source.recv() => frame,
                };
                let Some(frame) = frame else { break };

                let data = match encoder.encode(&frame) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(track = %source.id(), "Failed to encode frame: {}", e);
                        continue;
                    }
                };

                let sample = Sample {
                    data,
                    duration,
                    timestamp: SystemTime::now(),
                    ..Default::default()
                };
                if let Err(e) = sink.write_sample(&sample).await {
                    debug!(track = %source.id(), "Failed to write sample: {}", e);
                    continue;
                }
                written += 1;
            }

            info!(track = %source.id(), written, "Sample pump stopped");
        });

        Self { handle }
    }

    /// Whether the pump has stopped
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Abort the pump
    pub fn abort(&self) {
        self.handle.abort();
    }
}
