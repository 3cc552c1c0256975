//! WebSocket signaling client (JSON-RPC 2.0)
//!
//! Every event is a JSON-RPC message whose `method` is the event name and
//! whose `params` is the event payload. Emits are notifications (no `id`);
//! acknowledged calls carry an `id` and resolve when the matching response
//! arrives. Server-initiated requests are published to subscribers and, when
//! they carry an `id`, acknowledged with a `null` result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::dispatch::{EventDispatcher, EventStream};
use super::protocol::{
    events, to_value, AuthenticateParams, IncomingMessage, JsonRpcRequest, JsonRpcResponse,
};
use super::SignalingChannel;
use crate::config::Credentials;
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

type PendingCalls = Arc<Mutex<HashMap<String, oneshot::Sender<Result<serde_json::Value>>>>>;

/// Shared connection state between the client handle and its I/O tasks
struct ConnectionState {
    dispatcher: EventDispatcher,
    pending: PendingCalls,
    connected: AtomicBool,
    shutdown: CancellationToken,
}

impl ConnectionState {
    /// Mark the connection lost: end streams, fail pending calls
    fn mark_disconnected(&self, reason: &str) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Signaling connection closed: {}", reason);
        self.dispatcher.close();

        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionError(format!(
                "signaling connection closed: {}",
                reason
            ))));
        }

        self.shutdown.cancel();
    }
}

/// WebSocket client for the rendezvous service
pub struct WebSocketSignaling {
    url: String,
    tx: mpsc::UnboundedSender<Message>,
    state: Arc<ConnectionState>,
}

impl WebSocketSignaling {
    /// Connect and authenticate
    ///
    /// # Errors
    ///
    /// `ConnectionError` when the endpoint is unreachable or rejects the
    /// credentials.
    #[instrument(skip(credentials), fields(user = %credentials.user_name))]
    pub async fn connect(url: &str, credentials: &Credentials, timeout: Duration) -> Result<Self> {
        info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| {
                Error::ConnectionError(format!("Timed out connecting to {} after {:?}", url, timeout))
            })?
            .map_err(|e| Error::ConnectionError(format!("Failed to connect to {}: {}", url, e)))?;

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();

        let state = Arc::new(ConnectionState {
            dispatcher: EventDispatcher::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            connected: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Self::sender_task(write, rx));
        tokio::spawn(Self::receiver_task(read, tx.clone(), Arc::clone(&state)));

        let client = Self {
            url: url.to_string(),
            tx,
            state,
        };

        let auth = AuthenticateParams {
            user_name: credentials.user_name.clone(),
            password: credentials.password.clone(),
        };
        client
            .call(events::AUTHENTICATE, to_value(&auth)?, timeout)
            .await
            .map_err(|e| Error::ConnectionError(format!("Authentication failed: {}", e)))?;

        info!("Connected and authenticated to signaling server");
        Ok(client)
    }

    /// Signaling server URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sender task: sends messages from channel to WebSocket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }

        let _ = write.close().await;
        debug!("Sender task terminated");
    }

    /// Receiver task: parses messages, resolves calls, dispatches events
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        tx: mpsc::UnboundedSender<Message>,
        state: Arc<ConnectionState>,
    ) {
        let reason = loop {
            let next = tokio::select! {
                _ = state.shutdown.cancelled() => None,
                msg = read.next() => Some(msg),
            };
            let Some(msg) = next else {
                break "local disconnect".to_string();
            };

            match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = Self::handle_message(&text, &tx, &state) {
                        warn!("Failed to handle signaling message: {}", e);
                    }
                }
                Some(Ok(Message::Close(_))) => break "closed by server".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("WebSocket error: {}", e),
                None => break "stream ended".to_string(),
            }
        };

        state.mark_disconnected(&reason);
        debug!("Receiver task terminated");
    }

    fn handle_message(
        text: &str,
        tx: &mpsc::UnboundedSender<Message>,
        state: &ConnectionState,
    ) -> Result<()> {
        debug!("Received signaling message: {}", text);

        match IncomingMessage::from_json(text)? {
            IncomingMessage::Request(req) => {
                if let Some(id) = req.id.clone() {
                    let ack = JsonRpcResponse::new(serde_json::Value::Null, id).to_json()?;
                    let _ = tx.send(Message::Text(ack));
                }
                state.dispatcher.publish(&req.method, req.params);
            }
            IncomingMessage::Response(resp) => {
                let key = id_key(&resp.id);
                match state.pending.lock().remove(&key) {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(resp.result));
                    }
                    None => debug!("Response for unknown or expired call {}", key),
                }
            }
            IncomingMessage::Error(err) => {
                let key = id_key(&err.id);
                match state.pending.lock().remove(&key) {
                    Some(waiter) => {
                        let _ = waiter.send(Err(Error::SignalingError(format!(
                            "{} (code {})",
                            err.error.message, err.error.code
                        ))));
                    }
                    None => warn!("Signaling error without pending call: {}", err.error.message),
                }
            }
        }

        Ok(())
    }

    fn send(&self, request: &JsonRpcRequest) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ConnectionError(format!(
                "signaling channel disconnected, cannot send '{}'",
                request.method
            )));
        }

        let json = request.to_json()?;
        debug!("Sending signaling message: {}", json);

        self.tx
            .send(Message::Text(json))
            .map_err(|e| Error::ConnectionError(format!("Failed to send message: {}", e)))
    }
}

fn id_key(id: &serde_json::Value) -> String {
    match id.as_str() {
        Some(s) => s.to_string(),
        None => id.to_string(),
    }
}

#[async_trait]
impl SignalingChannel for WebSocketSignaling {
    async fn emit(&self, event: &str, payload: serde_json::Value) -> Result<()> {
        self.send(&JsonRpcRequest::new(event, payload, None))
    }

    async fn call(
        &self,
        event: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let id = uuid::Uuid::new_v4().to_string();
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.state.pending.lock().insert(id.clone(), waiter_tx);

        let request = JsonRpcRequest::new(event, payload, Some(serde_json::Value::String(id.clone())));
        if let Err(e) = self.send(&request) {
            self.state.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, waiter_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionError(format!(
                "signaling connection dropped while awaiting '{}'",
                event
            ))),
            Err(_) => {
                self.state.pending.lock().remove(&id);
                Err(Error::TimeoutError(format!(
                    "no acknowledgment for '{}' within {:?}",
                    event, timeout
                )))
            }
        }
    }

    fn subscribe(&self, event: &str) -> EventStream {
        self.state.dispatcher.subscribe(event)
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<()> {
        if self.is_connected() {
            let _ = self.tx.send(Message::Close(None));
        }
        self.state.mark_disconnected("local disconnect");
        Ok(())
    }
}

impl Drop for WebSocketSignaling {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_key() {
        assert_eq!(id_key(&serde_json::json!("abc")), "abc");
        assert_eq!(id_key(&serde_json::json!(7)), "7");
    }

    #[tokio::test]
    async fn test_connect_unreachable_is_connection_error() {
        let credentials = crate::config::RelayConfig::default().credentials;
        let result =
            WebSocketSignaling::connect("ws://127.0.0.1:1", &credentials, Duration::from_secs(2))
                .await;
        match result {
            Err(e) => assert!(e.is_process_fatal(), "unexpected error {:?}", e),
            Ok(_) => panic!("connect to closed port must fail"),
        }
    }
}
