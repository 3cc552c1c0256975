//! Fakes for the transport and track seams
//!
//! Available to this crate's tests and, with the `test-util` feature, to
//! downstream crates that want to drive a session without a network.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use depthrelay_core::{Frame, FrameSource, PixelFormat, SyntheticTrack, TrackKind};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::VideoCodecPreference;
use crate::media::{FrameDecoder, FrameEncoder, MediaCodecFactory};
use crate::peer::{
    ConnectionState, PeerHandle, PeerTransport, PeerTransportFactory, TransportEvent,
    TransportEvents,
};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};

/// Transport operation that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    /// `set_remote_description`
    SetRemoteDescription,
    /// `create_offer`
    CreateOffer,
    /// `create_answer`
    CreateAnswer,
    /// `set_local_description`
    SetLocalDescription,
    /// `add_track`
    AddTrack,
}

#[derive(Default)]
struct FakeState {
    remote: Option<SessionDescription>,
    local: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    rejected: HashSet<String>,
    premature: usize,
    tracks: Vec<Arc<SyntheticTrack>>,
    failing: HashSet<FakeOp>,
    close_calls: usize,
}

/// Scriptable in-memory [`PeerTransport`]
///
/// Records every call. Like a real connection it refuses candidates before a
/// remote description is set, and counts such attempts.
pub struct FakePeerTransport {
    label: String,
    state: Mutex<FakeState>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<TransportEvents>>,
    descriptions: AtomicU64,
}

impl FakePeerTransport {
    /// New transport with an empty event stream
    pub fn new(label: impl Into<String>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            label: label.into(),
            state: Mutex::new(FakeState::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            descriptions: AtomicU64::new(0),
        }
    }

    /// Take the event stream (once)
    pub fn take_events(&self) -> Option<TransportEvents> {
        self.events_rx.lock().take()
    }

    /// Make `op` fail from now on
    pub fn fail_on(&self, op: FakeOp) {
        self.state.lock().failing.insert(op);
    }

    /// Reject this candidate string when applied
    pub fn reject_candidate(&self, candidate: &str) {
        self.state.lock().rejected.insert(candidate.to_string());
    }

    /// Push a transport callback
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Report a connection state change
    pub fn set_connection_state(&self, state: ConnectionState) {
        self.emit(TransportEvent::StateChanged(state));
    }

    /// Report a gathered local candidate
    pub fn gather(&self, candidate: IceCandidate) {
        self.emit(TransportEvent::IceCandidate(candidate));
    }

    /// Report a remote track
    pub fn add_remote_track(&self, track: impl FrameSource + 'static) {
        self.emit(TransportEvent::RemoteTrack(Box::new(track)));
    }

    /// Remote description applied, if any
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// Local description applied, if any
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    /// Candidates accepted, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    /// Candidates offered before a remote description existed
    pub fn premature_candidates(&self) -> usize {
        self.state.lock().premature
    }

    /// Synthetic tracks attached
    pub fn tracks(&self) -> Vec<Arc<SyntheticTrack>> {
        self.state.lock().tracks.clone()
    }

    /// Times `close` was called
    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    fn check(&self, op: FakeOp) -> Result<()> {
        if self.state.lock().failing.contains(&op) {
            return Err(Error::SdpError(format!("{}: injected {:?} failure", self.label, op)));
        }
        Ok(())
    }

    fn next_sdp(&self, kind: &str) -> String {
        let n = self.descriptions.fetch_add(1, Ordering::SeqCst);
        format!("v=0\r\ns=fake-{}-{}-{}\r\n", kind, self.label, n)
    }
}

#[async_trait]
impl PeerTransport for FakePeerTransport {
    fn label(&self) -> &str {
        &self.label
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        self.check(FakeOp::SetRemoteDescription)?;
        self.state.lock().remote = Some(desc.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.check(FakeOp::CreateOffer)?;
        Ok(SessionDescription::offer(self.next_sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.check(FakeOp::CreateAnswer)?;
        match self.state.lock().remote.as_ref().map(|d| d.sdp_type) {
            Some(SdpType::Offer) => {}
            _ => {
                return Err(Error::SdpError(format!(
                    "{}: no remote offer to answer",
                    self.label
                )))
            }
        }
        Ok(SessionDescription::answer(self.next_sdp("answer")))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        self.check(FakeOp::SetLocalDescription)?;
        self.state.lock().local = Some(desc.clone());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            state.premature += 1;
            return Err(Error::IceCandidateError(format!(
                "{}: remote description not set",
                self.label
            )));
        }
        if state.rejected.contains(&candidate.candidate) {
            return Err(Error::IceCandidateError(format!(
                "{}: rejected {}",
                self.label, candidate.candidate
            )));
        }
        state.applied.push(candidate.clone());
        Ok(())
    }

    async fn add_track(&self, track: Arc<SyntheticTrack>) -> Result<()> {
        self.check(FakeOp::AddTrack)?;
        self.state.lock().tracks.push(track);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().close_calls += 1;
        Ok(())
    }
}

/// Factory handing out [`FakePeerTransport`]s and remembering them
#[derive(Default)]
pub struct FakeTransportFactory {
    created: Mutex<Vec<Arc<FakePeerTransport>>>,
}

impl FakeTransportFactory {
    /// Empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transport created so far, in creation order
    pub fn created(&self) -> Vec<Arc<FakePeerTransport>> {
        self.created.lock().clone()
    }

    /// Most recent transport with `label`
    pub fn transport(&self, label: &str) -> Option<Arc<FakePeerTransport>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|t| t.label() == label)
            .cloned()
    }
}

#[async_trait]
impl PeerTransportFactory for FakeTransportFactory {
    async fn create(&self, label: &str) -> Result<PeerHandle> {
        let transport = Arc::new(FakePeerTransport::new(label));
        let events = transport
            .take_events()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("fake transport events already taken")))?;
        self.created.lock().push(Arc::clone(&transport));
        Ok(PeerHandle {
            transport,
            events,
        })
    }
}

/// Received track fed from a channel
///
/// Dropping the sender ends the track normally.
pub struct FakeFrameSource {
    id: String,
    kind: TrackKind,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl FakeFrameSource {
    /// Video track and the sender that feeds it
    pub fn video(id: impl Into<String>) -> (Self, mpsc::UnboundedSender<Frame>) {
        Self::with_kind(id, TrackKind::Video)
    }

    /// Track of any kind and the sender that feeds it
    pub fn with_kind(
        id: impl Into<String>,
        kind: TrackKind,
    ) -> (Self, mpsc::UnboundedSender<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: id.into(),
                kind,
                rx,
            },
            tx,
        )
    }
}

#[async_trait]
impl FrameSource for FakeFrameSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn next_frame(&mut self) -> depthrelay_core::Result<Option<Frame>> {
        Ok(self.rx.recv().await)
    }
}

/// Gray8 test frame whose first byte carries `id`
pub fn numbered_frame(id: u8, pts: i64) -> Frame {
    let mut data = vec![0u8; 16];
    data[0] = id;
    Frame::new(4, 4, PixelFormat::Gray8, pts, Bytes::from(data)).expect("valid 4x4 gray8 frame")
}

/// Codec that writes frames uncompressed behind a small header
///
/// Stands in for a real video codec when exercising track plumbing. The
/// decoder expects the whole frame in one payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodecFactory;

const RAW_HEADER_LEN: usize = 9;

fn format_tag(format: PixelFormat) -> u8 {
    match format {
        PixelFormat::Yuv420p => 0,
        PixelFormat::Nv12 => 1,
        PixelFormat::Rgb24 => 2,
        PixelFormat::Rgba32 => 3,
        PixelFormat::Gray8 => 4,
    }
}

fn format_from_tag(tag: u8) -> Option<PixelFormat> {
    Some(match tag {
        0 => PixelFormat::Yuv420p,
        1 => PixelFormat::Nv12,
        2 => PixelFormat::Rgb24,
        3 => PixelFormat::Rgba32,
        4 => PixelFormat::Gray8,
        _ => return None,
    })
}

struct RawEncoder;

impl FrameEncoder for RawEncoder {
    fn encode(&mut self, frame: &Frame) -> depthrelay_core::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(RAW_HEADER_LEN + frame.data().len());
        buf.put_u32(frame.width());
        buf.put_u32(frame.height());
        buf.put_u8(format_tag(frame.format()));
        buf.put_slice(frame.data());
        Ok(buf.freeze())
    }
}

struct RawDecoder;

impl FrameDecoder for RawDecoder {
    fn push_packet(
        &mut self,
        payload: &[u8],
        timestamp: u32,
        _marker: bool,
    ) -> depthrelay_core::Result<Option<Frame>> {
        if payload.len() < RAW_HEADER_LEN {
            return Err(depthrelay_core::Error::InvalidFrame(format!(
                "raw payload too short: {} bytes",
                payload.len()
            )));
        }
        let width = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let height = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let format = format_from_tag(payload[8]).ok_or_else(|| {
            depthrelay_core::Error::InvalidFrame(format!("unknown format tag {}", payload[8]))
        })?;
        let data = Bytes::copy_from_slice(&payload[RAW_HEADER_LEN..]);
        Frame::new(width, height, format, i64::from(timestamp), data).map(Some)
    }
}

impl MediaCodecFactory for RawCodecFactory {
    fn decoder(&self, mime_type: &str) -> Result<Box<dyn FrameDecoder>> {
        if mime_type.to_ascii_lowercase().starts_with("video/") {
            Ok(Box::new(RawDecoder))
        } else {
            Err(Error::TrackError(format!("no raw decoder for {}", mime_type)))
        }
    }

    fn encoder(&self, _codec: &VideoCodecPreference) -> Result<Box<dyn FrameEncoder>> {
        Ok(Box::new(RawEncoder))
    }
}
