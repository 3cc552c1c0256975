//! In-process signaling channel
//!
//! Records everything emitted, lets the caller inject inbound events and
//! scripts how acknowledged calls are answered. Used by the test suite and by
//! embedders that bridge signaling themselves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::dispatch::{EventDispatcher, EventStream};
use super::SignalingChannel;
use crate::{Error, Result};

/// How an acknowledged call is answered
#[derive(Debug, Clone, PartialEq)]
pub enum CallBehavior {
    /// Acknowledge immediately with this payload
    Respond(serde_json::Value),
    /// Never acknowledge (the caller's timeout fires)
    NeverRespond,
    /// Reject the call with a signaling error
    Fail(String),
}

/// One recorded emission
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedEvent {
    /// Event name
    pub event: String,
    /// Payload
    pub payload: serde_json::Value,
    /// Whether it went through `call` rather than `emit`
    pub acknowledged: bool,
}

/// Deterministic in-memory [`SignalingChannel`]
pub struct InMemorySignaling {
    dispatcher: EventDispatcher,
    connected: AtomicBool,
    emitted: Mutex<Vec<EmittedEvent>>,
    emitted_changed: Notify,
    behaviors: Mutex<HashMap<String, CallBehavior>>,
    default_behavior: CallBehavior,
    shutdown: CancellationToken,
}

impl Default for InMemorySignaling {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySignaling {
    /// Connected channel whose calls acknowledge with `null`
    pub fn new() -> Self {
        Self {
            dispatcher: EventDispatcher::new(),
            connected: AtomicBool::new(true),
            emitted: Mutex::new(Vec::new()),
            emitted_changed: Notify::new(),
            behaviors: Mutex::new(HashMap::new()),
            default_behavior: CallBehavior::Respond(serde_json::Value::Null),
            shutdown: CancellationToken::new(),
        }
    }

    /// Script the acknowledgment for calls to `event`
    pub fn set_call_behavior(&self, event: &str, behavior: CallBehavior) {
        self.behaviors.lock().insert(event.to_string(), behavior);
    }

    /// Deliver an inbound event to subscribers; returns subscribers reached
    pub fn inject(&self, event: &str, payload: serde_json::Value) -> usize {
        self.dispatcher.publish(event, payload)
    }

    /// Everything emitted so far, in order
    pub fn emitted(&self) -> Vec<EmittedEvent> {
        self.emitted.lock().clone()
    }

    /// Payloads emitted under `event`, in order
    pub fn emitted_for(&self, event: &str) -> Vec<serde_json::Value> {
        self.emitted
            .lock()
            .iter()
            .filter(|e| e.event == event)
            .map(|e| e.payload.clone())
            .collect()
    }

    /// Wait until at least `count` payloads were emitted under `event`
    ///
    /// Returns whatever was emitted if `timeout` elapses first.
    pub async fn wait_for_emits(
        &self,
        event: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<serde_json::Value> {
        let wait = async {
            loop {
                let changed = self.emitted_changed.notified();
                tokio::pin!(changed);
                changed.as_mut().enable();

                let current = self.emitted_for(event);
                if current.len() >= count {
                    return current;
                }
                changed.await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(found) => found,
            Err(_) => self.emitted_for(event),
        }
    }

    fn record(&self, event: &str, payload: serde_json::Value, acknowledged: bool) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ConnectionError(format!(
                "signaling channel disconnected, cannot send '{}'",
                event
            )));
        }

        debug!(event, acknowledged, "In-memory signaling emit");
        self.emitted.lock().push(EmittedEvent {
            event: event.to_string(),
            payload,
            acknowledged,
        });
        self.emitted_changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl SignalingChannel for InMemorySignaling {
    async fn emit(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        self.record(event, payload, false)
    }

    async fn call(
        &self,
        event: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        self.record(event, payload, true)?;

        let behavior = self
            .behaviors
            .lock()
            .get(event)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.clone());

        match behavior {
            CallBehavior::Respond(value) => Ok(value),
            CallBehavior::Fail(msg) => Err(Error::SignalingError(msg)),
            CallBehavior::NeverRespond => {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => Err(Error::TimeoutError(format!(
                        "no acknowledgment for '{}' within {:?}",
                        event, timeout
                    ))),
                    _ = self.shutdown.cancelled() => Err(Error::ConnectionError(format!(
                        "signaling channel disconnected while awaiting '{}'",
                        event
                    ))),
                }
            }
        }
    }

    fn subscribe(&self, event: &str) -> EventStream {
        self.dispatcher.subscribe(event)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!("In-memory signaling disconnected");
            self.dispatcher.close();
            self.shutdown.cancel();
        }
        Ok(())
    }
}
