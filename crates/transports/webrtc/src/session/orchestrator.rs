//! Session orchestration
//!
//! A [`SessionOrchestrator`] owns everything one relay session needs: the
//! receiver and forwarder negotiators, their transports' event streams, the
//! transform stage and the two relay queues. It runs as a single task that
//! serializes every state change, so the negotiators never race each other.
//! Work that may block (acknowledged signaling calls, frame relaying, emits)
//! runs in supervised tasks whose results come back into the same loop.
//!
//! ```text
//!  inbound peer ──> receiver ──> relay task ──> TransformStage
//!                                   │                 │
//!                                   ▼                 ▼
//!                         "original" queue   "transformed" queue
//!                                   │                 │
//!                                   └──> forwarder ───┴──> consumers
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use depthrelay_core::{
    FrameRelayQueue, FrameSource, FrameTransform, SyntheticTrack, TransformStage,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{CloseReason, SessionId, SessionState, SessionStatus, StatusEvent};
use crate::config::RelayConfig;
use crate::negotiation::{
    CandidateOutcome, IceTrickleBuffer, NegotiationState, NegotiatorId, NegotiatorOutcome,
    NegotiatorRole, SessionNegotiator,
};
use crate::peer::{is_relayable, PeerTransportFactory, TransportEvents};
use crate::signaling::protocol::{parse_answer_ack, to_value};
use crate::signaling::{events, IceCandidate, OfferAvailable, SessionDescription, SignalingChannel};
use crate::{Error, Result};

/// Queue and synthetic track carrying the unmodified inbound frames
pub const ORIGINAL_TRACK_ID: &str = "original";

/// Queue and synthetic track carrying the transform output
pub const TRANSFORMED_TRACK_ID: &str = "transformed";

const PROGRESS_LOG_INTERVAL: u64 = 30;

/// Input to a running session
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Remote offer for the receiver
    Offer(OfferAvailable),
    /// Remote answer for the forwarder
    Answer(SessionDescription),
    /// Remote ICE candidate
    IceCandidate(IceCandidate),
    /// Tear the session down
    Close(CloseReason),
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Lifecycle state
    pub state: SessionState,
    /// Receiver negotiation state
    pub receiver: NegotiationState,
    /// Forwarder negotiation state
    pub forwarder: NegotiationState,
}

/// Summary returned when a session finishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Session id
    pub session_id: SessionId,
    /// Why it closed
    pub reason: CloseReason,
    /// Inbound frames pushed into the relay queues
    pub frames_relayed: u64,
    /// Frames passed through untransformed
    pub transform_failures: u64,
    /// Frames evicted from both queues
    pub frames_evicted: u64,
    /// Offerer candidates applied from the `publish-answer` acknowledgment
    pub ack_candidates_applied: u64,
    /// Remote candidates applied to the receiver
    pub receiver_candidates_applied: u64,
    /// Remote candidates applied to the forwarder
    pub forwarder_candidates_applied: u64,
}

enum TaskOutcome {
    Relay { track_id: String, result: Result<()> },
    Drained { track_id: String },
    AnswerAck(Result<serde_json::Value>),
    Emitted { event: &'static str, result: Result<()> },
}

/// Cheap handle for feeding and observing a running session
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Latest snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        *self.snapshot.borrow()
    }

    /// Latest lifecycle state
    pub fn state(&self) -> SessionState {
        self.snapshot().state
    }

    /// Whether the session has finished
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed || self.commands.is_closed()
    }

    /// Send a command; false if the session is gone
    pub fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Deliver a remote offer
    pub fn offer(&self, offer: OfferAvailable) -> bool {
        self.send(SessionCommand::Offer(offer))
    }

    /// Deliver a remote answer
    pub fn answer(&self, answer: SessionDescription) -> bool {
        self.send(SessionCommand::Answer(answer))
    }

    /// Deliver a remote ICE candidate
    pub fn ice_candidate(&self, candidate: IceCandidate) -> bool {
        self.send(SessionCommand::IceCandidate(candidate))
    }

    /// Request teardown; repeated requests are no-ops
    pub fn close(&self, reason: CloseReason) -> bool {
        self.send(SessionCommand::Close(reason))
    }

    /// Wait until the session reaches `target` (or closes first)
    ///
    /// Returns the state actually reached.
    pub async fn wait_for_state(&self, target: SessionState) -> SessionState {
        let mut rx = self.snapshot.clone();
        let reached = rx
            .wait_for(|s| s.state == target || s.state == SessionState::Closed)
            .await
            .map(|s| s.state);
        reached.unwrap_or(SessionState::Closed)
    }

    /// Wait until a snapshot satisfies `predicate`; false if the session ended first
    pub async fn wait_until(&self, predicate: impl Fn(&SessionSnapshot) -> bool) -> bool {
        let mut rx = self.snapshot.clone();
        let reached = rx
            .wait_for(|s| predicate(s) || s.state == SessionState::Closed)
            .await
            .map(|s| predicate(&s));
        reached.unwrap_or(false)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Runs one relay session from first offer to teardown
pub struct SessionOrchestrator {
    id: SessionId,
    config: Arc<RelayConfig>,
    signaling: Arc<dyn SignalingChannel>,
    receiver: SessionNegotiator,
    forwarder: SessionNegotiator,
    receiver_events: TransportEvents,
    forwarder_events: TransportEvents,
    stage: Arc<TransformStage>,
    original: Arc<FrameRelayQueue>,
    transformed: Arc<FrameRelayQueue>,
    state: SessionState,
    relay_track: Option<String>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    status_tx: broadcast::Sender<StatusEvent>,
    tasks: JoinSet<TaskOutcome>,
    cancel: CancellationToken,
    frames_relayed: Arc<AtomicU64>,
    ack_candidates_applied: u64,
    close_reason: Option<CloseReason>,
}

impl SessionOrchestrator {
    /// Create both peer connections and the relay queues
    ///
    /// The session does nothing until [`Self::run`] is polled and an offer is
    /// delivered through the returned handle.
    pub async fn new(
        config: Arc<RelayConfig>,
        signaling: Arc<dyn SignalingChannel>,
        factory: &dyn PeerTransportFactory,
        transform: Arc<dyn FrameTransform>,
        status_tx: broadcast::Sender<StatusEvent>,
    ) -> Result<(Self, SessionHandle)> {
        let id = SessionId::new();
        let ice = Arc::new(IceTrickleBuffer::new());

        let inbound = factory.create(&config.receiver_label).await?;
        let outbound = match factory.create(&config.forwarder_label).await {
            Ok(handle) => handle,
            Err(e) => {
                let _ = inbound.transport.close().await;
                return Err(e);
            }
        };

        let receiver = SessionNegotiator::new(
            NegotiatorId::new(id, NegotiatorRole::Receiver),
            config.receiver_label.clone(),
            inbound.transport,
            Arc::clone(&ice),
        )
        .with_authorized_offerer(config.authorized_offerer.clone());

        let forwarder = SessionNegotiator::new(
            NegotiatorId::new(id, NegotiatorRole::Forwarder),
            config.forwarder_label.clone(),
            outbound.transport,
            ice,
        );

        let original = Arc::new(FrameRelayQueue::new(ORIGINAL_TRACK_ID, config.queue_capacity)?);
        let transformed =
            Arc::new(FrameRelayQueue::new(TRANSFORMED_TRACK_ID, config.queue_capacity)?);
        let stage = Arc::new(TransformStage::with_timeout(
            transform,
            config.transform_timeout(),
        ));

        let initial = SessionSnapshot {
            state: SessionState::Negotiating,
            receiver: NegotiationState::Idle,
            forwarder: NegotiationState::Idle,
        };
        let (snapshot_tx, snapshot) = watch::channel(initial);
        let (commands_tx, commands) = mpsc::unbounded_channel();

        let orchestrator = Self {
            id,
            config,
            signaling,
            receiver,
            forwarder,
            receiver_events: inbound.events,
            forwarder_events: outbound.events,
            stage,
            original,
            transformed,
            state: SessionState::Negotiating,
            relay_track: None,
            commands,
            snapshot_tx,
            status_tx,
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
            frames_relayed: Arc::new(AtomicU64::new(0)),
            ack_candidates_applied: 0,
            close_reason: None,
        };

        let handle = SessionHandle {
            id,
            commands: commands_tx,
            snapshot,
        };

        Ok((orchestrator, handle))
    }

    /// Session id
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Run on a new task
    pub fn spawn(self) -> JoinHandle<SessionReport> {
        tokio::spawn(self.run())
    }

    /// Drive the session until it closes
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn run(mut self) -> SessionReport {
        info!("Session started");
        self.publish_status(SessionStatus::Negotiating, None);

        while self.state != SessionState::Closed {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.close(CloseReason::Shutdown).await,
                },
                Some(event) = self.receiver_events.recv() => {
                    let outcome = self.receiver.handle_transport_event(event);
                    self.handle_outcome(NegotiatorRole::Receiver, outcome).await;
                }
                Some(event) = self.forwarder_events.recv() => {
                    let outcome = self.forwarder.handle_transport_event(event);
                    self.handle_outcome(NegotiatorRole::Forwarder, outcome).await;
                }
                Some(joined) = self.tasks.join_next() => self.handle_task(joined).await,
            }
            self.update_snapshot();
        }

        let report = self.report();
        info!(
            reason = %report.reason,
            frames = report.frames_relayed,
            transform_failures = report.transform_failures,
            evicted = report.frames_evicted,
            "Session finished"
        );
        report
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Offer(offer) => self.on_offer(offer).await,
            SessionCommand::Answer(answer) => self.on_answer(answer).await,
            SessionCommand::IceCandidate(candidate) => self.on_remote_candidate(candidate).await,
            SessionCommand::Close(reason) => self.close(reason).await,
        }
    }

    async fn on_offer(&mut self, offer: OfferAvailable) {
        if self.receiver.state() != NegotiationState::Idle {
            debug!(offerer = %offer.offerer_id, "Ignoring offer, receiver already negotiating");
            return;
        }

        match self.receiver.handle_remote_offer(&offer).await {
            Ok(publish) => match to_value(&publish) {
                Ok(payload) => {
                    let signaling = Arc::clone(&self.signaling);
                    let timeout = self.config.ack_timeout();
                    self.tasks.spawn(async move {
                        let ack = signaling.call(events::PUBLISH_ANSWER, payload, timeout).await;
                        TaskOutcome::AnswerAck(ack)
                    });
                }
                Err(e) => self.close(CloseReason::NegotiationFailed(e.to_string())).await,
            },
            Err(e @ Error::UnauthorizedOffer { .. }) => warn!("Rejected offer: {}", e),
            Err(e) => self.close(CloseReason::NegotiationFailed(e.to_string())).await,
        }
    }

    async fn on_answer(&mut self, answer: SessionDescription) {
        if self.forwarder.state() != NegotiationState::AwaitingAnswer {
            debug!(forwarder = %self.forwarder.state(), "Ignoring unexpected answer");
            return;
        }
        if let Err(e) = self.forwarder.handle_remote_answer(&answer).await {
            self.close(CloseReason::NegotiationFailed(e.to_string())).await;
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.state != SessionState::Negotiating && self.state != SessionState::Forwarding {
            return;
        }

        // Candidates are not addressed to a connection, so both get them; the
        // forwarder only once it has started negotiating.
        if let Err(e) = self.receiver.add_remote_ice_candidate(candidate.clone()).await {
            debug!("Receiver did not accept candidate: {}", e);
        }
        if self.forwarder.state() != NegotiationState::Idle {
            if let Err(e) = self.forwarder.add_remote_ice_candidate(candidate).await {
                debug!("Forwarder did not accept candidate: {}", e);
            }
        }
    }

    async fn handle_outcome(&mut self, role: NegotiatorRole, outcome: NegotiatorOutcome) {
        match outcome {
            NegotiatorOutcome::None => {}
            NegotiatorOutcome::SendCandidate(send) => match to_value(&send) {
                Ok(payload) => self.spawn_emit(events::SEND_ICE_CANDIDATE, payload),
                Err(e) => warn!(%role, "Dropping local candidate: {}", e),
            },
            NegotiatorOutcome::Connected => {
                info!(%role, "Peer connected");
                if role == NegotiatorRole::Receiver {
                    self.maybe_start_forwarding().await;
                }
            }
            NegotiatorOutcome::Failed => self.close(CloseReason::TransportFailed(role)).await,
            NegotiatorOutcome::RemoteClosed => self.close(CloseReason::RemoteClosed(role)).await,
            NegotiatorOutcome::RemoteTrack(track) => self.on_remote_track(role, track).await,
        }
    }

    async fn on_remote_track(&mut self, role: NegotiatorRole, track: Box<dyn FrameSource>) {
        if self.state == SessionState::Closing || self.state == SessionState::Closed {
            return;
        }

        let relay = role == NegotiatorRole::Receiver
            && is_relayable(track.kind())
            && self.relay_track.is_none();

        if !relay {
            debug!(%role, track = %track.id(), kind = %track.kind(), "Draining track that is not relayed");
            let cancel = self.cancel.child_token();
            self.tasks.spawn(drain_track(track, cancel));
            return;
        }

        info!(track = %track.id(), "Relaying inbound video track");
        self.relay_track = Some(track.id().to_string());
        self.tasks.spawn(relay_frames(
            track,
            Arc::clone(&self.stage),
            Arc::clone(&self.original),
            Arc::clone(&self.transformed),
            Arc::clone(&self.frames_relayed),
            self.cancel.child_token(),
        ));

        self.maybe_start_forwarding().await;
    }

    async fn maybe_start_forwarding(&mut self) {
        if self.state != SessionState::Negotiating
            || self.receiver.state() != NegotiationState::Connected
            || self.relay_track.is_none()
        {
            return;
        }

        match self.start_forwarding().await {
            Ok(()) => self.set_state(SessionState::Forwarding, None),
            Err(e) if e.is_process_fatal() => self.close(CloseReason::SignalingLost).await,
            Err(e) => self.close(CloseReason::NegotiationFailed(e.to_string())).await,
        }
    }

    async fn start_forwarding(&mut self) -> Result<()> {
        for queue in [&self.original, &self.transformed] {
            let track = SyntheticTrack::video(
                queue.name(),
                Arc::clone(queue),
                self.config.outgoing_framerate,
                self.config.pace_outgoing,
            )?;
            self.forwarder.add_track(Arc::new(track)).await?;
        }

        let offer = self.forwarder.create_offer().await?;
        // A viewer may answer as soon as the offer is out
        self.forwarder.mark_offer_published()?;
        self.update_snapshot();
        self.signaling
            .emit(events::PUBLISH_OFFER, to_value(&offer)?)
            .await?;

        info!("Outbound offer published");
        Ok(())
    }

    fn spawn_emit(&mut self, event: &'static str, payload: serde_json::Value) {
        let signaling = Arc::clone(&self.signaling);
        self.tasks.spawn(async move {
            let result = signaling.emit(event, payload).await;
            TaskOutcome::Emitted { event, result }
        });
    }

    async fn handle_task(&mut self, joined: std::result::Result<TaskOutcome, JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                error!("Session task panicked: {}", e);
                self.close(CloseReason::TaskFailed(e.to_string())).await;
                return;
            }
        };

        match outcome {
            TaskOutcome::AnswerAck(ack) => self.on_answer_ack(ack).await,
            TaskOutcome::Emitted { event, result } => match result {
                Ok(()) => {}
                Err(e) if e.is_process_fatal() => self.close(CloseReason::SignalingLost).await,
                Err(e) => warn!(event, "Signaling emit failed: {}", e),
            },
            TaskOutcome::Relay { track_id, result } => {
                match result {
                    Ok(()) => info!(track = %track_id, "Inbound track ended"),
                    Err(e) if e.is_normal_termination() => {
                        info!(track = %track_id, "Inbound track ended: {}", e)
                    }
                    Err(e) => warn!(track = %track_id, "Inbound track stopped: {}", e),
                }
                self.close(CloseReason::TrackEnded).await;
            }
            TaskOutcome::Drained { track_id } => debug!(track = %track_id, "Drained track ended"),
        }
    }

    async fn on_answer_ack(&mut self, ack: Result<serde_json::Value>) {
        match ack.and_then(parse_answer_ack) {
            Ok(candidates) => {
                let received = candidates.len();
                let mut applied = 0u64;
                for candidate in candidates {
                    match self.receiver.add_remote_ice_candidate(candidate).await {
                        Ok(CandidateOutcome::Applied) => applied += 1,
                        Ok(_) => {}
                        Err(e) => warn!("Offerer candidate rejected: {}", e),
                    }
                }
                self.ack_candidates_applied += applied;
                info!(received, applied, "Answer acknowledged");
            }
            Err(e) if e.is_process_fatal() => self.close(CloseReason::SignalingLost).await,
            Err(e) if e.is_degraded() => warn!(
                "Answer not acknowledged, continuing without offerer candidates: {}",
                e
            ),
            Err(e) => warn!(
                "Answer acknowledgment rejected, continuing without offerer candidates: {}",
                e
            ),
        }
    }

    /// Tear down both connections and the queues; later calls are no-ops
    async fn close(&mut self, reason: CloseReason) {
        if self.state == SessionState::Closing || self.state == SessionState::Closed {
            return;
        }

        if reason.is_failure() {
            error!(%reason, "Session failed");
            self.publish_status(SessionStatus::Failed, Some(reason.to_string()));
        } else {
            info!(%reason, "Closing session");
        }
        self.set_state(SessionState::Closing, Some(reason.to_string()));

        self.cancel.cancel();
        let discarded = self.original.close() + self.transformed.close();
        if discarded > 0 {
            debug!(discarded, "Discarded queued frames");
        }

        let (receiver, forwarder) = tokio::join!(self.receiver.close(), self.forwarder.close());
        if let Err(e) = receiver {
            warn!("Receiver close failed: {}", e);
        }
        if let Err(e) = forwarder {
            warn!("Forwarder close failed: {}", e);
        }

        self.tasks.shutdown().await;

        self.set_state(SessionState::Closed, Some(reason.to_string()));
        self.close_reason = Some(reason);
    }

    fn set_state(&mut self, state: SessionState, detail: Option<String>) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "Session state change");
        self.state = state;
        self.publish_status(state.into(), detail);
        self.update_snapshot();
    }

    fn publish_status(&self, status: SessionStatus, detail: Option<String>) {
        // No subscribers is fine
        let _ = self.status_tx.send(StatusEvent {
            session_id: self.id,
            status,
            at: SystemTime::now(),
            detail,
        });
    }

    fn update_snapshot(&self) {
        let snapshot = SessionSnapshot {
            state: self.state,
            receiver: self.receiver.state(),
            forwarder: self.forwarder.state(),
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn report(&self) -> SessionReport {
        SessionReport {
            session_id: self.id,
            reason: self.close_reason.clone().unwrap_or(CloseReason::Shutdown),
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
            transform_failures: self.stage.failure_count(),
            frames_evicted: self.original.evicted_count() + self.transformed.evicted_count(),
            ack_candidates_applied: self.ack_candidates_applied,
            receiver_candidates_applied: self.receiver.candidates_applied(),
            forwarder_candidates_applied: self.forwarder.candidates_applied(),
        }
    }
}

async fn relay_frames(
    mut source: Box<dyn FrameSource>,
    stage: Arc<TransformStage>,
    original: Arc<FrameRelayQueue>,
    transformed: Arc<FrameRelayQueue>,
    relayed: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> TaskOutcome {
    let track_id = source.id().to_string();

    let result = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            next = source.next_frame() => next,
        };

        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break Err(Error::from(e)),
        };

        original.push(frame.clone());
        let output = stage.apply(frame).await;
        transformed.push(output);

        let count = relayed.fetch_add(1, Ordering::Relaxed) + 1;
        if count % PROGRESS_LOG_INTERVAL == 0 {
            info!(
                track = %track_id,
                frames = count,
                transform_failures = stage.failure_count(),
                evicted = original.evicted_count() + transformed.evicted_count(),
                "Relay progress"
            );
        }
    };

    TaskOutcome::Relay { track_id, result }
}

async fn drain_track(mut source: Box<dyn FrameSource>, cancel: CancellationToken) -> TaskOutcome {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = source.next_frame() => match next {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            },
        }
    }
    TaskOutcome::Drained {
        track_id: source.id().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ConnectionState;
    use crate::signaling::InMemorySignaling;
    use crate::testing::{numbered_frame, FakeFrameSource, FakeTransportFactory};
    use depthrelay_core::PassthroughTransform;
    use std::time::Duration;

    struct Fixture {
        signaling: Arc<InMemorySignaling>,
        factory: FakeTransportFactory,
        handle: SessionHandle,
        task: JoinHandle<SessionReport>,
        status: broadcast::Receiver<StatusEvent>,
    }

    async fn start() -> Fixture {
        start_with(RelayConfig::default().with_pacing(false), Arc::new(PassthroughTransform)).await
    }

    async fn start_with(config: RelayConfig, transform: Arc<dyn FrameTransform>) -> Fixture {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();

        let signaling = Arc::new(InMemorySignaling::new());
        let factory = FakeTransportFactory::new();
        let (status_tx, status) = broadcast::channel(64);

        let (orchestrator, handle) = SessionOrchestrator::new(
            Arc::new(config),
            Arc::clone(&signaling) as Arc<dyn SignalingChannel>,
            &factory,
            transform,
            status_tx,
        )
        .await
        .unwrap();

        Fixture {
            signaling,
            factory,
            handle,
            task: orchestrator.spawn(),
            status,
        }
    }

    fn camera_offer() -> OfferAvailable {
        OfferAvailable {
            offerer_id: "camera-module".to_string(),
            offer: SessionDescription::offer("v=0 camera"),
        }
    }

    #[tokio::test]
    async fn test_offer_publishes_answer() {
        let fx = start().await;
        fx.handle.offer(camera_offer());

        let published = fx
            .signaling
            .wait_for_emits(events::PUBLISH_ANSWER, 1, Duration::from_secs(5))
            .await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["offererId"], "camera-module");
        assert_eq!(published[0]["answer"]["type"], "answer");

        fx.handle.close(CloseReason::Shutdown);
        let report = fx.task.await.unwrap();
        assert_eq!(report.reason, CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn test_forwarding_needs_connection_and_video_track() {
        let fx = start().await;
        fx.handle.offer(camera_offer());
        fx.signaling
            .wait_for_emits(events::PUBLISH_ANSWER, 1, Duration::from_secs(5))
            .await;

        let receiver = fx.factory.transport("server-in").unwrap();
        receiver.set_connection_state(ConnectionState::Connected);
        assert!(
            fx.handle
                .wait_until(|s| s.receiver == NegotiationState::Connected)
                .await
        );
        assert_eq!(fx.handle.state(), SessionState::Negotiating);
        assert!(fx.signaling.emitted_for(events::PUBLISH_OFFER).is_empty());

        let (track, _frames) = FakeFrameSource::video("camera-video");
        receiver.add_remote_track(track);

        assert_eq!(
            fx.handle.wait_for_state(SessionState::Forwarding).await,
            SessionState::Forwarding
        );
        let offers = fx.signaling.emitted_for(events::PUBLISH_OFFER);
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0]["type"], "offer");

        let forwarder = fx.factory.transport("server").unwrap();
        let ids: Vec<_> = forwarder.tracks().iter().map(|t| t.id().to_string()).collect();
        assert_eq!(ids, vec![ORIGINAL_TRACK_ID, TRANSFORMED_TRACK_ID]);

        fx.handle.close(CloseReason::Shutdown);
        fx.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_reach_both_queues() {
        let fx = start().await;
        fx.handle.offer(camera_offer());
        fx.signaling
            .wait_for_emits(events::PUBLISH_ANSWER, 1, Duration::from_secs(5))
            .await;

        let receiver = fx.factory.transport("server-in").unwrap();
        receiver.set_connection_state(ConnectionState::Connected);
        let (track, frames) = FakeFrameSource::video("camera-video");
        receiver.add_remote_track(track);
        fx.handle.wait_for_state(SessionState::Forwarding).await;

        for i in 0..5u8 {
            frames.send(numbered_frame(i, i64::from(i) * 3000)).unwrap();
        }

        let forwarder = fx.factory.transport("server").unwrap();
        let tracks = forwarder.tracks();
        for track in &tracks {
            for i in 0..5u8 {
                let frame = tokio::time::timeout(Duration::from_secs(5), track.recv())
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(frame.data()[0], i);
            }
        }

        drop(frames);
        let report = fx.task.await.unwrap();
        assert_eq!(report.reason, CloseReason::TrackEnded);
        assert_eq!(report.frames_relayed, 5);
        assert_eq!(report.transform_failures, 0);
    }

    #[tokio::test]
    async fn test_original_frame_does_not_wait_for_transform() {
        let slow = depthrelay_core::FnTransform::new("slow-model", |f: &depthrelay_core::Frame| {
            std::thread::sleep(Duration::from_millis(800));
            Ok(f.clone())
        });
        let config = RelayConfig::default()
            .with_pacing(false)
            .with_transform_timeout(Duration::from_secs(2));
        let fx = start_with(config, Arc::new(slow)).await;
        fx.handle.offer(camera_offer());
        fx.signaling
            .wait_for_emits(events::PUBLISH_ANSWER, 1, Duration::from_secs(5))
            .await;

        let receiver = fx.factory.transport("server-in").unwrap();
        receiver.set_connection_state(ConnectionState::Connected);
        let (track, frames) = FakeFrameSource::video("camera-video");
        receiver.add_remote_track(track);
        fx.handle.wait_for_state(SessionState::Forwarding).await;

        frames.send(numbered_frame(7, 0)).unwrap();

        let forwarder = fx.factory.transport("server").unwrap();
        let tracks = forwarder.tracks();
        let original = tokio::time::timeout(Duration::from_millis(200), tracks[0].recv())
            .await
            .expect("original frame held back by the transform")
            .unwrap();
        assert_eq!(original.data()[0], 7);

        let transformed = tokio::time::timeout(Duration::from_secs(5), tracks[1].recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transformed.data()[0], 7);

        fx.handle.close(CloseReason::Shutdown);
        fx.task.await.unwrap();
    }

    /// Records the session's forwarder state at the moment each offer is emitted
    struct OfferObserver {
        inner: InMemorySignaling,
        handle: parking_lot::Mutex<Option<SessionHandle>>,
        at_offer: parking_lot::Mutex<Vec<NegotiationState>>,
    }

    #[async_trait::async_trait]
    impl SignalingChannel for OfferObserver {
        async fn emit(&self, event: &str, payload: serde_json::Value) -> Result<()> {
            if event == events::PUBLISH_OFFER {
                if let Some(handle) = self.handle.lock().as_ref() {
                    self.at_offer.lock().push(handle.snapshot().forwarder);
                }
            }
            self.inner.emit(event, payload).await
        }

        async fn call(
            &self,
            event: &str,
            payload: serde_json::Value,
            timeout: Duration,
        ) -> Result<serde_json::Value> {
            self.inner.call(event, payload, timeout).await
        }

        fn subscribe(&self, event: &str) -> crate::signaling::EventStream {
            self.inner.subscribe(event)
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        async fn disconnect(&self) -> Result<()> {
            self.inner.disconnect().await
        }
    }

    #[tokio::test]
    async fn test_answer_accepted_as_soon_as_offer_is_out() {
        let signaling = Arc::new(OfferObserver {
            inner: InMemorySignaling::new(),
            handle: parking_lot::Mutex::new(None),
            at_offer: parking_lot::Mutex::new(Vec::new()),
        });
        let factory = FakeTransportFactory::new();
        let (status_tx, _status) = broadcast::channel(64);
        let (orchestrator, handle) = SessionOrchestrator::new(
            Arc::new(RelayConfig::default().with_pacing(false)),
            Arc::clone(&signaling) as Arc<dyn SignalingChannel>,
            &factory,
            Arc::new(PassthroughTransform),
            status_tx,
        )
        .await
        .unwrap();
        *signaling.handle.lock() = Some(handle.clone());
        let task = orchestrator.spawn();

        handle.offer(camera_offer());
        signaling
            .inner
            .wait_for_emits(events::PUBLISH_ANSWER, 1, Duration::from_secs(5))
            .await;
        let receiver = factory.transport("server-in").unwrap();
        receiver.set_connection_state(ConnectionState::Connected);
        let (track, _frames) = FakeFrameSource::video("camera-video");
        receiver.add_remote_track(track);
        handle.wait_for_state(SessionState::Forwarding).await;

        assert_eq!(
            *signaling.at_offer.lock(),
            vec![NegotiationState::AwaitingAnswer]
        );

        handle.answer(SessionDescription::answer("v=0 viewer"));
        assert!(
            handle
                .wait_until(|s| s.forwarder == NegotiationState::HaveRemoteAnswer)
                .await
        );

        handle.close(CloseReason::Shutdown);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_audio_track_does_not_start_forwarding() {
        let fx = start().await;
        fx.handle.offer(camera_offer());
        fx.signaling
            .wait_for_emits(events::PUBLISH_ANSWER, 1, Duration::from_secs(5))
            .await;

        let receiver = fx.factory.transport("server-in").unwrap();
        receiver.set_connection_state(ConnectionState::Connected);
        let (audio, _tx) = FakeFrameSource::with_kind("mic", depthrelay_core::TrackKind::Audio);
        receiver.add_remote_track(audio);
        receiver.gather(IceCandidate::new("candidate:sync"));

        fx.signaling
            .wait_for_emits(events::SEND_ICE_CANDIDATE, 1, Duration::from_secs(5))
            .await;
        assert_eq!(fx.handle.state(), SessionState::Negotiating);

        fx.handle.close(CloseReason::Shutdown);
        fx.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_status_events_in_order() {
        let mut fx = start().await;
        fx.handle.close(CloseReason::Shutdown);
        fx.handle.close(CloseReason::Shutdown);
        fx.task.await.unwrap();

        let mut statuses = Vec::new();
        while let Ok(event) = fx.status.try_recv() {
            statuses.push(event.status);
        }
        assert_eq!(
            statuses,
            vec![
                SessionStatus::Negotiating,
                SessionStatus::Closing,
                SessionStatus::Closed
            ]
        );
    }

    #[tokio::test]
    async fn test_transport_failure_reports_failed() {
        let mut fx = start().await;
        fx.handle.offer(camera_offer());
        fx.signaling
            .wait_for_emits(events::PUBLISH_ANSWER, 1, Duration::from_secs(5))
            .await;

        fx.factory
            .transport("server-in")
            .unwrap()
            .set_connection_state(ConnectionState::Failed);

        let report = fx.task.await.unwrap();
        assert_eq!(
            report.reason,
            CloseReason::TransportFailed(NegotiatorRole::Receiver)
        );

        let mut saw_failed = false;
        while let Ok(event) = fx.status.try_recv() {
            saw_failed |= event.status == SessionStatus::Failed;
        }
        assert!(saw_failed);
    }
}
