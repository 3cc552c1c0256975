//! Routes signaling events to sessions
//!
//! The router is the only reader of the shared [`SignalingChannel`]. It turns
//! authorized offers into sessions and forwards answers and ICE candidates to
//! the session they belong to.

use std::collections::HashMap;
use std::sync::Arc;

use depthrelay_core::FrameTransform;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::orchestrator::{SessionHandle, SessionOrchestrator, SessionReport};
use super::{CloseReason, StatusEvent};
use crate::config::RelayConfig;
use crate::negotiation::NegotiationState;
use crate::peer::PeerTransportFactory;
use crate::signaling::{
    events, AnswerReceived, IceCandidateReceived, InboundEvent, OfferAvailable, SignalingChannel,
};
use crate::{Error, Result};

const STATUS_CHANNEL_CAPACITY: usize = 256;

struct RoutedSession {
    handle: SessionHandle,
    task: JoinHandle<SessionReport>,
}

/// Demultiplexes one signaling channel across concurrent sessions
pub struct SessionRouter {
    config: Arc<RelayConfig>,
    signaling: Arc<dyn SignalingChannel>,
    factory: Arc<dyn PeerTransportFactory>,
    transform: Arc<dyn FrameTransform>,
    status_tx: broadcast::Sender<StatusEvent>,
    sessions: HashMap<String, RoutedSession>,
    shutdown: CancellationToken,
}

impl SessionRouter {
    /// Create a router; nothing happens until [`Self::run`]
    pub fn new(
        config: RelayConfig,
        signaling: Arc<dyn SignalingChannel>,
        factory: Arc<dyn PeerTransportFactory>,
        transform: Arc<dyn FrameTransform>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config),
            signaling,
            factory,
            transform,
            status_tx,
            sessions: HashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Status events of every session
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    /// Cancelling this token closes every session and ends [`Self::run`]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Sessions currently tracked
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Route events until shutdown or signaling loss
    ///
    /// Returns the reports of the sessions still open at shutdown. Losing the
    /// signaling channel closes every session and fails with
    /// `ConnectionError`.
    #[instrument(skip(self), fields(offerer = %self.config.authorized_offerer))]
    pub async fn run(mut self) -> Result<Vec<SessionReport>> {
        let mut offers = self.signaling.subscribe(events::OFFER_AVAILABLE);
        let mut new_offers = self.signaling.subscribe(events::NEW_OFFER);
        let mut answers = self.signaling.subscribe(events::ANSWER_RECEIVED);
        let mut candidates = self.signaling.subscribe(events::ICE_CANDIDATE_RECEIVED);

        self.signaling
            .emit(events::REQUEST_OFFERS, serde_json::Value::Null)
            .await?;
        info!("Session router started, requested available offers");

        let outcome = loop {
            let (event, payload) = tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                payload = offers.recv() => (events::OFFER_AVAILABLE, payload),
                payload = new_offers.recv() => (events::NEW_OFFER, payload),
                payload = answers.recv() => (events::ANSWER_RECEIVED, payload),
                payload = candidates.recv() => (events::ICE_CANDIDATE_RECEIVED, payload),
            };

            let Some(payload) = payload else {
                break Err(Error::ConnectionError(
                    "signaling channel disconnected".to_string(),
                ));
            };

            self.reap_finished().await;

            match InboundEvent::parse(event, payload) {
                Ok(inbound) => self.dispatch(inbound).await,
                Err(e) => warn!(event, "Ignoring malformed signaling event: {}", e),
            }
        };

        let reason = match &outcome {
            Ok(()) => CloseReason::Shutdown,
            Err(e) => {
                error!("Signaling lost: {}", e);
                CloseReason::SignalingLost
            }
        };
        let reports = self.close_all(reason).await;
        outcome.map(|()| reports)
    }

    async fn dispatch(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Offers(offers) => {
                for offer in offers {
                    self.route_offer(offer).await;
                }
            }
            InboundEvent::Answer(answer) => self.route_answer(answer),
            InboundEvent::IceCandidate(candidate) => self.route_candidate(candidate),
        }
    }

    async fn route_offer(&mut self, offer: OfferAvailable) {
        if offer.offerer_id != self.config.authorized_offerer {
            warn!(offerer = %offer.offerer_id, "Dropping offer from unauthorized peer");
            return;
        }

        if let Some(existing) = self.sessions.get(&offer.offerer_id) {
            if !existing.handle.is_closed() {
                existing.handle.offer(offer);
                return;
            }
        }

        let active = self.sessions.values().filter(|s| !s.handle.is_closed()).count();
        if active >= self.config.max_sessions {
            let err = Error::SessionLimitExceeded(format!(
                "{} active sessions (max {})",
                active, self.config.max_sessions
            ));
            warn!(offerer = %offer.offerer_id, "Dropping offer: {}", err);
            return;
        }

        let created = SessionOrchestrator::new(
            Arc::clone(&self.config),
            Arc::clone(&self.signaling),
            self.factory.as_ref(),
            Arc::clone(&self.transform),
            self.status_tx.clone(),
        )
        .await;

        match created {
            Ok((orchestrator, handle)) => {
                info!(session_id = %handle.id(), offerer = %offer.offerer_id, "Session created");
                let offerer = offer.offerer_id.clone();
                handle.offer(offer);
                let task = orchestrator.spawn();
                if let Some(previous) = self.sessions.insert(offerer, RoutedSession { handle, task }) {
                    Self::log_report(previous.task.await);
                }
            }
            Err(e) => error!(offerer = %offer.offerer_id, "Failed to create session: {}", e),
        }
    }

    fn route_answer(&self, answer: AnswerReceived) {
        let target = self
            .sessions
            .values()
            .find(|s| s.handle.snapshot().forwarder == NegotiationState::AwaitingAnswer);

        match target {
            Some(session) => {
                debug!(session_id = %session.handle.id(), answerer = %answer.answerer_id, "Routing answer");
                session.handle.answer(answer.answer);
            }
            None => debug!(answerer = %answer.answerer_id, "No session awaiting an answer"),
        }
    }

    fn route_candidate(&self, received: IceCandidateReceived) {
        let addressed = received
            .peer_id
            .as_deref()
            .and_then(|peer| self.sessions.get(peer))
            .filter(|s| !s.handle.is_closed());

        match addressed {
            Some(session) => {
                session.handle.ice_candidate(received.candidate);
            }
            None => {
                for session in self.sessions.values().filter(|s| !s.handle.is_closed()) {
                    session.handle.ice_candidate(received.candidate.clone());
                }
            }
        }
    }

    async fn reap_finished(&mut self) {
        let finished: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.task.is_finished())
            .map(|(offerer, _)| offerer.clone())
            .collect();

        for offerer in finished {
            if let Some(session) = self.sessions.remove(&offerer) {
                Self::log_report(session.task.await);
            }
        }
    }

    async fn close_all(&mut self, reason: CloseReason) -> Vec<SessionReport> {
        for session in self.sessions.values() {
            session.handle.close(reason.clone());
        }

        let mut reports = Vec::with_capacity(self.sessions.len());
        for (_, session) in self.sessions.drain() {
            match session.task.await {
                Ok(report) => reports.push(report),
                Err(e) => error!("Session task failed: {}", e),
            }
        }
        info!(sessions = reports.len(), %reason, "All sessions closed");
        reports
    }

    fn log_report(joined: std::result::Result<SessionReport, tokio::task::JoinError>) {
        match joined {
            Ok(report) => info!(
                session_id = %report.session_id,
                reason = %report.reason,
                frames = report.frames_relayed,
                "Session reaped"
            ),
            Err(e) => error!("Session task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use crate::signaling::{IceCandidate, InMemorySignaling};
    use crate::testing::FakeTransportFactory;
    use depthrelay_core::PassthroughTransform;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        signaling: Arc<InMemorySignaling>,
        factory: Arc<FakeTransportFactory>,
        shutdown: CancellationToken,
        status: broadcast::Receiver<StatusEvent>,
        task: JoinHandle<Result<Vec<SessionReport>>>,
    }

    async fn start() -> Fixture {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();

        let signaling = Arc::new(InMemorySignaling::new());
        let factory = Arc::new(FakeTransportFactory::new());
        let router = SessionRouter::new(
            RelayConfig::default().with_pacing(false),
            Arc::clone(&signaling) as Arc<dyn SignalingChannel>,
            Arc::clone(&factory) as Arc<dyn PeerTransportFactory>,
            Arc::new(PassthroughTransform),
        );
        let shutdown = router.shutdown_token();
        let status = router.subscribe_status();
        let task = tokio::spawn(router.run());

        let requested = signaling
            .wait_for_emits(events::REQUEST_OFFERS, 1, Duration::from_secs(5))
            .await;
        assert_eq!(requested.len(), 1);

        Fixture {
            signaling,
            factory,
            shutdown,
            status,
            task,
        }
    }

    fn offer_from(offerer: &str) -> serde_json::Value {
        json!({ "offererId": offerer, "offer": { "type": "offer", "sdp": "v=0" } })
    }

    #[tokio::test]
    async fn test_unauthorized_offer_is_dropped() {
        let fx = start().await;
        fx.signaling
            .inject(events::OFFER_AVAILABLE, json!([offer_from("intruder")]));

        let published = fx
            .signaling
            .wait_for_emits(events::PUBLISH_ANSWER, 1, Duration::from_millis(200))
            .await;
        assert!(published.is_empty());
        assert!(fx.factory.created().is_empty());

        fx.shutdown.cancel();
        let reports = fx.task.await.unwrap().unwrap();
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn test_authorized_offer_creates_session() {
        let fx = start().await;
        fx.signaling.inject(events::NEW_OFFER, offer_from("camera-module"));

        let published = fx
            .signaling
            .wait_for_emits(events::PUBLISH_ANSWER, 1, Duration::from_secs(5))
            .await;
        assert_eq!(published.len(), 1);
        assert_eq!(fx.factory.created().len(), 2);

        fx.shutdown.cancel();
        let reports = fx.task.await.unwrap().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].reason, CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn test_addressed_candidate_reaches_receiver() {
        let fx = start().await;
        fx.signaling.inject(events::NEW_OFFER, offer_from("camera-module"));
        fx.signaling
            .wait_for_emits(events::PUBLISH_ANSWER, 1, Duration::from_secs(5))
            .await;

        let candidate = IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host");
        let mut payload = serde_json::to_value(&candidate).unwrap();
        payload["peerId"] = json!("camera-module");
        fx.signaling.inject(events::ICE_CANDIDATE_RECEIVED, payload);

        let receiver = fx.factory.transport("server-in").unwrap();
        let applied = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let applied = receiver.applied_candidates();
                if !applied.is_empty() {
                    return applied;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(applied, vec![candidate]);

        fx.shutdown.cancel();
        fx.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_signaling_loss_closes_sessions() {
        let mut fx = start().await;
        fx.signaling.inject(events::NEW_OFFER, offer_from("camera-module"));
        fx.signaling
            .wait_for_emits(events::PUBLISH_ANSWER, 1, Duration::from_secs(5))
            .await;

        fx.signaling.disconnect().await.unwrap();
        let result = fx.task.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionError(_))));

        let mut closed = None;
        while let Ok(event) = fx.status.try_recv() {
            if event.status == SessionStatus::Closed {
                closed = event.detail;
            }
        }
        assert_eq!(closed.as_deref(), Some("signaling_lost"));
        for transport in fx.factory.created() {
            assert_eq!(transport.close_calls(), 1);
        }
    }
}
