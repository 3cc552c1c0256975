//! Trickle ICE buffering
//!
//! Candidates for a negotiator whose remote description is not yet set are
//! held here and applied, in arrival order, right after the description lands.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::NegotiatorId;
use crate::peer::PeerTransport;
use crate::signaling::IceCandidate;

#[derive(Default)]
struct Buffers {
    pending: HashMap<NegotiatorId, Vec<IceCandidate>>,
    flushed: HashSet<NegotiatorId>,
}

/// Result of flushing one negotiator's buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Candidates the transport accepted
    pub applied: usize,
    /// Candidates the transport rejected
    pub rejected: usize,
}

/// Ordered per-negotiator candidate buffer
#[derive(Default)]
pub struct IceTrickleBuffer {
    buffers: Mutex<Buffers>,
}

impl IceTrickleBuffer {
    /// Empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a candidate for `id`
    pub fn buffer(&self, id: NegotiatorId, candidate: IceCandidate) {
        let mut buffers = self.buffers.lock();
        if buffers.flushed.contains(&id) {
            warn!(negotiator = %id, "Candidate buffered after flush, it will not be applied");
        }
        let queue = buffers.pending.entry(id).or_default();
        queue.push(candidate);
        debug!(negotiator = %id, buffered = queue.len(), "Buffered remote ICE candidate");
    }

    /// Candidates currently held for `id`
    pub fn buffered_len(&self, id: NegotiatorId) -> usize {
        self.buffers.lock().pending.get(&id).map_or(0, Vec::len)
    }

    /// Whether `id` has already been flushed
    pub fn is_flushed(&self, id: NegotiatorId) -> bool {
        self.buffers.lock().flushed.contains(&id)
    }

    /// Apply every buffered candidate for `id` in arrival order, then drop the buffer
    ///
    /// Rejected candidates are logged and counted; the rest are still applied.
    /// Flushing an id with nothing buffered is a no-op.
    pub async fn flush(&self, id: NegotiatorId, transport: &dyn PeerTransport) -> FlushReport {
        let candidates = {
            let mut buffers = self.buffers.lock();
            buffers.flushed.insert(id);
            buffers.pending.remove(&id).unwrap_or_default()
        };

        let mut report = FlushReport::default();
        for candidate in &candidates {
            match transport.add_ice_candidate(candidate).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!(negotiator = %id, "Buffered ICE candidate rejected: {}", e);
                    report.rejected += 1;
                }
            }
        }

        if !candidates.is_empty() {
            debug!(
                negotiator = %id,
                applied = report.applied,
                rejected = report.rejected,
                "Flushed buffered ICE candidates"
            );
        }
        report
    }

    /// Drop everything held for `id` without applying it
    pub fn discard(&self, id: NegotiatorId) -> usize {
        let mut buffers = self.buffers.lock();
        buffers.flushed.insert(id);
        buffers.pending.remove(&id).map_or(0, |c| c.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::NegotiatorRole;
    use crate::session::SessionId;
    use crate::signaling::SessionDescription;
    use crate::testing::FakePeerTransport;

    async fn ready_transport() -> FakePeerTransport {
        let transport = FakePeerTransport::new("server-in");
        transport
            .set_remote_description(&SessionDescription::offer("v=0"))
            .await
            .unwrap();
        transport
    }

    fn ids() -> (NegotiatorId, NegotiatorId) {
        let session = SessionId::new();
        (
            NegotiatorId::new(session, NegotiatorRole::Receiver),
            NegotiatorId::new(session, NegotiatorRole::Forwarder),
        )
    }

    #[tokio::test]
    async fn test_flush_applies_in_arrival_order() {
        let (receiver, _) = ids();
        let buffer = IceTrickleBuffer::new();
        let transport = ready_transport().await;

        for i in 0..3 {
            buffer.buffer(receiver, IceCandidate::new(format!("candidate:{}", i)));
        }
        assert_eq!(buffer.buffered_len(receiver), 3);

        let report = buffer.flush(receiver, &transport).await;
        assert_eq!(report.applied, 3);
        assert_eq!(buffer.buffered_len(receiver), 0);

        let applied: Vec<_> = transport
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, vec!["candidate:0", "candidate:1", "candidate:2"]);
    }

    #[tokio::test]
    async fn test_flush_empty_is_noop() {
        let (receiver, _) = ids();
        let buffer = IceTrickleBuffer::new();
        let transport = FakePeerTransport::new("server-in");

        let report = buffer.flush(receiver, &transport).await;
        assert_eq!(report, FlushReport::default());
        assert!(buffer.is_flushed(receiver));
        assert!(transport.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn test_buffers_are_keyed_by_negotiator() {
        let (receiver, forwarder) = ids();
        let buffer = IceTrickleBuffer::new();
        let transport = ready_transport().await;

        buffer.buffer(receiver, IceCandidate::new("candidate:r"));
        buffer.buffer(forwarder, IceCandidate::new("candidate:f"));

        buffer.flush(receiver, &transport).await;
        assert_eq!(transport.applied_candidates().len(), 1);
        assert_eq!(buffer.buffered_len(forwarder), 1);
        assert_eq!(buffer.discard(forwarder), 1);
    }

    #[tokio::test]
    async fn test_rejected_candidate_does_not_stop_flush() {
        let (receiver, _) = ids();
        let buffer = IceTrickleBuffer::new();
        let transport = ready_transport().await;
        transport.reject_candidate("candidate:bad");

        buffer.buffer(receiver, IceCandidate::new("candidate:bad"));
        buffer.buffer(receiver, IceCandidate::new("candidate:good"));

        let report = buffer.flush(receiver, &transport).await;
        assert_eq!(report.applied, 1);
        assert_eq!(report.rejected, 1);
    }
}
