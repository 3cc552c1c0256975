//! Fan-out of inbound events to subscribers

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Stream of payloads for one event name
///
/// Payloads published after subscription are buffered until read.
#[derive(Debug)]
pub struct EventStream {
    event: String,
    rx: mpsc::UnboundedReceiver<serde_json::Value>,
}

impl EventStream {
    /// Event name this stream carries
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Next payload, or `None` once the channel disconnected
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = serde_json::Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Default)]
struct Subscribers {
    by_event: HashMap<String, Vec<mpsc::UnboundedSender<serde_json::Value>>>,
    closed: bool,
}

/// Per-event subscriber registry shared by the signaling adapters
#[derive(Default)]
pub struct EventDispatcher {
    inner: Mutex<Subscribers>,
}

impl EventDispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for `event`
    pub fn subscribe(&self, event: &str) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.by_event.entry(event.to_string()).or_default().push(tx);
        }
        // When closed, `tx` is dropped here and the stream ends immediately

        EventStream {
            event: event.to_string(),
            rx,
        }
    }

    /// Deliver a payload to every live subscriber of `event`
    ///
    /// Returns the number of subscribers reached.
    pub fn publish(&self, event: &str, payload: serde_json::Value) -> usize {
        let mut inner = self.inner.lock();
        let Some(subscribers) = inner.by_event.get_mut(event) else {
            debug!("No subscriber for signaling event '{}', dropping", event);
            return 0;
        };

        subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
        trace!(event, delivered = subscribers.len(), "Signaling event dispatched");
        subscribers.len()
    }

    /// End every stream and refuse new subscribers
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.by_event.clear();
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let dispatcher = EventDispatcher::new();
        let mut a = dispatcher.subscribe("new-offer");
        let mut b = dispatcher.subscribe("new-offer");

        assert_eq!(dispatcher.publish("new-offer", json!(1)), 2);
        assert_eq!(a.recv().await, Some(json!(1)));
        assert_eq!(b.next().await, Some(json!(1)));
    }

    #[test]
    fn test_recv_pends_until_publish() {
        let dispatcher = EventDispatcher::new();
        let mut stream = dispatcher.subscribe("ice-candidate-received");
        let mut recv = task::spawn(stream.recv());

        assert_pending!(recv.poll());
        dispatcher.publish("ice-candidate-received", json!({"candidate": "c"}));
        assert!(recv.is_woken());
        assert_ready_eq!(recv.poll(), Some(json!({"candidate": "c"})));
    }

    #[tokio::test]
    async fn test_close_ends_streams_for_good() {
        let dispatcher = EventDispatcher::new();
        let mut stream = dispatcher.subscribe("answer-received");
        dispatcher.publish("answer-received", json!("buffered"));
        dispatcher.close();

        // Buffered payload is still delivered, then the stream ends
        assert_eq!(stream.recv().await, Some(json!("buffered")));
        assert_eq!(stream.recv().await, None);

        let mut late = dispatcher.subscribe("answer-received");
        assert_eq!(late.recv().await, None);
        assert_eq!(dispatcher.publish("answer-received", json!(2)), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let dispatcher = EventDispatcher::new();
        let stream = dispatcher.subscribe("x");
        drop(stream);
        assert_eq!(dispatcher.publish("x", json!(null)), 0);
    }
}
