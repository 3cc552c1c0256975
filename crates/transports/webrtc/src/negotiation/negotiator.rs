//! Single-connection negotiation state machine

use std::sync::Arc;

use depthrelay_core::{FrameSource, SyntheticTrack};
use tracing::{debug, info, instrument, warn};

use super::ice::IceTrickleBuffer;
use super::{NegotiationState, NegotiatorId, NegotiatorRole};
use crate::peer::{ConnectionState, PeerTransport, TransportEvent};
use crate::signaling::{
    IceCandidate, OfferAvailable, PublishAnswer, SdpType, SendIceCandidate, SessionDescription,
};
use crate::{Error, Result};

/// What the orchestrator should do after a transport event
pub enum NegotiatorOutcome {
    /// Nothing
    None,
    /// Publish a locally gathered candidate
    SendCandidate(SendIceCandidate),
    /// The connection just became connected
    Connected,
    /// The connection failed
    Failed,
    /// The transport closed without being asked to
    RemoteClosed,
    /// The remote side added a track
    RemoteTrack(Box<dyn FrameSource>),
}

impl std::fmt::Debug for NegotiatorOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiatorOutcome::None => f.write_str("None"),
            NegotiatorOutcome::SendCandidate(c) => f.debug_tuple("SendCandidate").field(c).finish(),
            NegotiatorOutcome::Connected => f.write_str("Connected"),
            NegotiatorOutcome::Failed => f.write_str("Failed"),
            NegotiatorOutcome::RemoteClosed => f.write_str("RemoteClosed"),
            NegotiatorOutcome::RemoteTrack(t) => f
                .debug_struct("RemoteTrack")
                .field("id", &t.id())
                .field("kind", &t.kind())
                .finish(),
        }
    }
}

/// Where a remote candidate went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Held until the remote description is set
    Buffered,
    /// Handed to the transport
    Applied,
    /// Dropped because the negotiator is finished
    Ignored,
}

/// Drives one peer connection through offer/answer and trickle ICE
///
/// Methods take `&mut self`; the owning session serializes all calls, so a
/// remote description is always set before any candidate reaches the
/// transport.
pub struct SessionNegotiator {
    id: NegotiatorId,
    label: String,
    authorized_offerer: Option<String>,
    transport: Arc<dyn PeerTransport>,
    ice: Arc<IceTrickleBuffer>,
    state: NegotiationState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    candidates_applied: u64,
    candidates_sent: u64,
}

impl SessionNegotiator {
    /// Create a negotiator in `Idle`
    ///
    /// `label` is the peer id published with local candidates.
    pub fn new(
        id: NegotiatorId,
        label: impl Into<String>,
        transport: Arc<dyn PeerTransport>,
        ice: Arc<IceTrickleBuffer>,
    ) -> Self {
        Self {
            id,
            label: label.into(),
            authorized_offerer: None,
            transport,
            ice,
            state: NegotiationState::Idle,
            local_description: None,
            remote_description: None,
            candidates_applied: 0,
            candidates_sent: 0,
        }
    }

    /// Only accept offers declaring `offerer` as their originator
    pub fn with_authorized_offerer(mut self, offerer: impl Into<String>) -> Self {
        self.authorized_offerer = Some(offerer.into());
        self
    }

    /// Negotiator identity
    pub fn id(&self) -> NegotiatorId {
        self.id
    }

    /// Role within the session
    pub fn role(&self) -> NegotiatorRole {
        self.id.role
    }

    /// Peer label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current state
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Applied local description
    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    /// Applied remote description
    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    /// Remote candidates handed to the transport so far
    pub fn candidates_applied(&self) -> u64 {
        self.candidates_applied
    }

    /// Local candidates surfaced for publishing so far
    pub fn candidates_sent(&self) -> u64 {
        self.candidates_sent
    }

    /// Underlying transport
    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    fn expect_state(&self, expected: NegotiationState, step: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::NegotiationError(format!(
                "{}: cannot {} in state {} (expected {})",
                self.id, step, self.state, expected
            )))
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        warn!(negotiator = %self.id, "Negotiation failed: {}", err);
        self.state = NegotiationState::Failed;
        err
    }

    async fn apply_remote(&mut self, desc: &SessionDescription) -> Result<()> {
        if let Err(e) = self.transport.set_remote_description(desc).await {
            return Err(self.fail(e));
        }
        self.remote_description = Some(desc.clone());

        let report = self.ice.flush(self.id, self.transport.as_ref()).await;
        self.candidates_applied += report.applied as u64;
        Ok(())
    }

    /// Answer a remote offer
    ///
    /// Returns the payload to publish. An offer from anyone but the authorized
    /// offerer fails with `UnauthorizedOffer` and leaves the negotiator
    /// untouched.
    #[instrument(skip(self, offer), fields(negotiator = %self.id, offerer = %offer.offerer_id))]
    pub async fn handle_remote_offer(&mut self, offer: &OfferAvailable) -> Result<PublishAnswer> {
        if let Some(expected) = &self.authorized_offerer {
            if offer.offerer_id != *expected {
                return Err(Error::UnauthorizedOffer {
                    offerer: offer.offerer_id.clone(),
                    expected: expected.clone(),
                });
            }
        }
        self.expect_state(NegotiationState::Idle, "handle remote offer")?;
        if offer.offer.sdp_type != SdpType::Offer {
            return Err(Error::NegotiationError(format!(
                "{}: remote offer carries type {:?}",
                self.id, offer.offer.sdp_type
            )));
        }

        self.apply_remote(&offer.offer).await?;
        self.state = NegotiationState::HaveRemoteOffer;

        let answer = match self.transport.create_answer().await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail(e)),
        };
        if let Err(e) = self.transport.set_local_description(&answer).await {
            return Err(self.fail(e));
        }
        self.local_description = Some(answer.clone());
        self.state = NegotiationState::HaveLocalAnswer;

        info!("Answer ready for {}", offer.offerer_id);
        Ok(PublishAnswer {
            offerer_id: offer.offerer_id.clone(),
            answer,
        })
    }

    /// Attach a synthetic track before offering
    pub async fn add_track(&mut self, track: Arc<SyntheticTrack>) -> Result<()> {
        self.expect_state(NegotiationState::Idle, "add track")?;
        self.transport.add_track(track).await
    }

    /// Create and apply a local offer
    ///
    /// Returns the offer to publish. Call [`Self::mark_offer_published`] once
    /// it has been sent.
    #[instrument(skip(self), fields(negotiator = %self.id))]
    pub async fn create_offer(&mut self) -> Result<SessionDescription> {
        self.expect_state(NegotiationState::Idle, "create offer")?;

        let offer = match self.transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail(e)),
        };
        if let Err(e) = self.transport.set_local_description(&offer).await {
            return Err(self.fail(e));
        }
        self.local_description = Some(offer.clone());
        self.state = NegotiationState::HaveLocalOffer;

        info!("Local offer ready");
        Ok(offer)
    }

    /// The local offer went out; start accepting an answer
    pub fn mark_offer_published(&mut self) -> Result<()> {
        self.expect_state(NegotiationState::HaveLocalOffer, "mark offer published")?;
        self.state = NegotiationState::AwaitingAnswer;
        Ok(())
    }

    /// Apply the answer to our offer
    #[instrument(skip(self, answer), fields(negotiator = %self.id))]
    pub async fn handle_remote_answer(&mut self, answer: &SessionDescription) -> Result<()> {
        self.expect_state(NegotiationState::AwaitingAnswer, "handle remote answer")?;
        if answer.sdp_type != SdpType::Answer {
            return Err(self.fail(Error::NegotiationError(format!(
                "{}: remote answer carries type {:?}",
                self.id, answer.sdp_type
            ))));
        }

        self.apply_remote(answer).await?;
        self.state = NegotiationState::HaveRemoteAnswer;
        info!("Remote answer applied");
        Ok(())
    }

    /// Apply or buffer a remote candidate
    ///
    /// Candidates are buffered until the remote description is set.
    pub async fn add_remote_ice_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateOutcome> {
        if self.state.is_terminal() {
            return Ok(CandidateOutcome::Ignored);
        }

        if self.remote_description.is_none() {
            self.ice.buffer(self.id, candidate);
            return Ok(CandidateOutcome::Buffered);
        }

        self.transport.add_ice_candidate(&candidate).await?;
        self.candidates_applied += 1;
        debug!(negotiator = %self.id, "Applied remote ICE candidate");
        Ok(CandidateOutcome::Applied)
    }

    /// Interpret one transport callback
    pub fn handle_transport_event(&mut self, event: TransportEvent) -> NegotiatorOutcome {
        if self.state == NegotiationState::Closed {
            return NegotiatorOutcome::None;
        }

        match event {
            TransportEvent::IceCandidate(candidate) => {
                self.candidates_sent += 1;
                NegotiatorOutcome::SendCandidate(SendIceCandidate {
                    did_offer: self.role().did_offer(),
                    peer_id: self.label.clone(),
                    ice_candidate: candidate,
                })
            }
            TransportEvent::IceGatheringComplete => {
                debug!(negotiator = %self.id, sent = self.candidates_sent, "ICE gathering complete");
                NegotiatorOutcome::None
            }
            TransportEvent::StateChanged(ConnectionState::Connected) => {
                if self.state.is_terminal() || self.state == NegotiationState::Connected {
                    return NegotiatorOutcome::None;
                }
                info!(negotiator = %self.id, "Peer connection connected");
                self.state = NegotiationState::Connected;
                NegotiatorOutcome::Connected
            }
            TransportEvent::StateChanged(ConnectionState::Failed) => {
                if self.state == NegotiationState::Failed {
                    return NegotiatorOutcome::None;
                }
                warn!(negotiator = %self.id, "Peer connection failed");
                self.state = NegotiationState::Failed;
                NegotiatorOutcome::Failed
            }
            TransportEvent::StateChanged(ConnectionState::Closed) => NegotiatorOutcome::RemoteClosed,
            TransportEvent::StateChanged(state) => {
                debug!(negotiator = %self.id, "Peer connection {}", state);
                NegotiatorOutcome::None
            }
            TransportEvent::RemoteTrack(track) => NegotiatorOutcome::RemoteTrack(track),
        }
    }

    /// Tear down; later calls are no-ops
    pub async fn close(&mut self) -> Result<()> {
        if self.state == NegotiationState::Closed {
            return Ok(());
        }
        self.state = NegotiationState::Closed;

        let dropped = self.ice.discard(self.id);
        if dropped > 0 {
            debug!(negotiator = %self.id, dropped, "Discarded unapplied ICE candidates");
        }

        info!(negotiator = %self.id, "Closing negotiator");
        self.transport.close().await
    }
}

impl std::fmt::Debug for SessionNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionNegotiator")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use crate::testing::{FakeOp, FakePeerTransport};

    fn negotiator(
        role: NegotiatorRole,
        label: &str,
    ) -> (SessionNegotiator, Arc<FakePeerTransport>) {
        let transport = Arc::new(FakePeerTransport::new(label));
        let negotiator = SessionNegotiator::new(
            NegotiatorId::new(SessionId::new(), role),
            label,
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
            Arc::new(IceTrickleBuffer::new()),
        );
        (negotiator, transport)
    }

    fn offer_from(offerer: &str) -> OfferAvailable {
        OfferAvailable {
            offerer_id: offerer.to_string(),
            offer: SessionDescription::offer("v=0 camera"),
        }
    }

    #[tokio::test]
    async fn test_answering_path() {
        let (negotiator, transport) = negotiator(NegotiatorRole::Receiver, "server-in");
        let mut negotiator = negotiator.with_authorized_offerer("camera-module");

        let publish = negotiator
            .handle_remote_offer(&offer_from("camera-module"))
            .await
            .unwrap();

        assert_eq!(publish.offerer_id, "camera-module");
        assert_eq!(publish.answer.sdp_type, SdpType::Answer);
        assert_eq!(negotiator.state(), NegotiationState::HaveLocalAnswer);
        assert_eq!(transport.local_description(), Some(publish.answer.clone()));

        let outcome =
            negotiator.handle_transport_event(TransportEvent::StateChanged(ConnectionState::Connected));
        assert!(matches!(outcome, NegotiatorOutcome::Connected));
        assert_eq!(negotiator.state(), NegotiationState::Connected);
    }

    #[tokio::test]
    async fn test_unauthorized_offer_has_no_side_effects() {
        let (negotiator, transport) = negotiator(NegotiatorRole::Receiver, "server-in");
        let mut negotiator = negotiator.with_authorized_offerer("camera-module");

        let err = negotiator
            .handle_remote_offer(&offer_from("intruder"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnauthorizedOffer { .. }));
        assert!(err.is_session_fatal());
        assert_eq!(negotiator.state(), NegotiationState::Idle);
        assert!(negotiator.local_description().is_none());
        assert!(transport.remote_description().is_none());
        assert!(transport.local_description().is_none());
    }

    #[tokio::test]
    async fn test_offer_outside_idle_is_rejected() {
        let (mut negotiator, _) = negotiator(NegotiatorRole::Receiver, "server-in");
        negotiator.handle_remote_offer(&offer_from("camera-module")).await.unwrap();

        let err = negotiator
            .handle_remote_offer(&offer_from("camera-module"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NegotiationError(_)));
        assert_eq!(negotiator.state(), NegotiationState::HaveLocalAnswer);
    }

    #[tokio::test]
    async fn test_offering_path() {
        let (mut negotiator, transport) = negotiator(NegotiatorRole::Forwarder, "server");

        let offer = negotiator.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert_eq!(negotiator.state(), NegotiationState::HaveLocalOffer);

        negotiator.mark_offer_published().unwrap();
        assert_eq!(negotiator.state(), NegotiationState::AwaitingAnswer);

        negotiator
            .handle_remote_answer(&SessionDescription::answer("v=0 viewer"))
            .await
            .unwrap();
        assert_eq!(negotiator.state(), NegotiationState::HaveRemoteAnswer);
        assert_eq!(
            transport.remote_description(),
            Some(SessionDescription::answer("v=0 viewer"))
        );
    }

    #[tokio::test]
    async fn test_answer_outside_awaiting_is_rejected() {
        let (mut negotiator, _) = negotiator(NegotiatorRole::Forwarder, "server");
        let err = negotiator
            .handle_remote_answer(&SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NegotiationError(_)));
        assert_eq!(negotiator.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_remote_description() {
        let (mut negotiator, transport) = negotiator(NegotiatorRole::Receiver, "server-in");

        let outcome = negotiator
            .add_remote_ice_candidate(IceCandidate::new("candidate:early"))
            .await
            .unwrap();
        assert_eq!(outcome, CandidateOutcome::Buffered);
        assert!(transport.applied_candidates().is_empty());

        negotiator.handle_remote_offer(&offer_from("camera-module")).await.unwrap();
        assert_eq!(transport.applied_candidates().len(), 1);
        assert_eq!(transport.premature_candidates(), 0);

        let outcome = negotiator
            .add_remote_ice_candidate(IceCandidate::new("candidate:late"))
            .await
            .unwrap();
        assert_eq!(outcome, CandidateOutcome::Applied);
        assert_eq!(negotiator.candidates_applied(), 2);
    }

    #[tokio::test]
    async fn test_local_candidate_carries_role() {
        let (mut receiver, _) = negotiator(NegotiatorRole::Receiver, "server-in");
        let (mut forwarder, _) = negotiator(NegotiatorRole::Forwarder, "server");

        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        match receiver.handle_transport_event(TransportEvent::IceCandidate(candidate.clone())) {
            NegotiatorOutcome::SendCandidate(send) => {
                assert!(!send.did_offer);
                assert_eq!(send.peer_id, "server-in");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        match forwarder.handle_transport_event(TransportEvent::IceCandidate(candidate)) {
            NegotiatorOutcome::SendCandidate(send) => {
                assert!(send.did_offer);
                assert_eq!(send.peer_id, "server");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_failure_marks_failed() {
        let (mut negotiator, transport) = negotiator(NegotiatorRole::Receiver, "server-in");
        transport.fail_on(FakeOp::CreateAnswer);

        let err = negotiator
            .handle_remote_offer(&offer_from("camera-module"))
            .await
            .unwrap_err();
        assert!(err.is_session_fatal());
        assert_eq!(negotiator.state(), NegotiationState::Failed);

        let outcome = negotiator
            .add_remote_ice_candidate(IceCandidate::new("candidate:x"))
            .await
            .unwrap();
        assert_eq!(outcome, CandidateOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut negotiator, transport) = negotiator(NegotiatorRole::Forwarder, "server");
        negotiator.close().await.unwrap();
        negotiator.close().await.unwrap();

        assert_eq!(negotiator.state(), NegotiationState::Closed);
        assert_eq!(transport.close_calls(), 1);

        let outcome =
            negotiator.handle_transport_event(TransportEvent::StateChanged(ConnectionState::Failed));
        assert!(matches!(outcome, NegotiatorOutcome::None));
    }
}
