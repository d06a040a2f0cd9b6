//! Websocket connection with fixed-delay reconnect
//!
//! One background task owns the socket. When the socket drops it sleeps
//! for `reconnect_delay` and tries again, so at most one reconnect is ever
//! pending. `stop()` cancels the task and nothing reconnects until
//! `start()` or `reconnect()` is called.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use gq_core::config::ClientConfig;
use gq_protocol::{decode_frame, PushMessage};

use crate::connection::{ConnectionState, ConnectionTracker};
use crate::endpoint::{Endpoint, API_KEY_HEADER};

/// Something that happened on the push channel
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// Socket is open
    Opened,
    /// A decoded frame
    Message(PushMessage),
    /// Socket closed, failed to open, or was stopped
    Closed { reason: String },
}

/// A [`PushEvent`] tagged with the session that produced it
///
/// Every `start()` opens a new session; consumers drop frames from
/// sessions that are no longer current.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEnvelope {
    pub session: u64,
    pub event: PushEvent,
}

/// Handle to the push channel task
pub struct PushChannel {
    endpoint: Arc<Endpoint>,
    reconnect_delay: Duration,
    connect_timeout: Duration,
    tracker: Arc<ConnectionTracker>,
    events: mpsc::UnboundedSender<PushEnvelope>,
    session: Arc<AtomicU64>,
    running: Mutex<Option<CancellationToken>>,
}

impl PushChannel {
    pub fn new(
        endpoint: Arc<Endpoint>,
        config: &ClientConfig,
        events: mpsc::UnboundedSender<PushEnvelope>,
    ) -> Self {
        Self {
            endpoint,
            reconnect_delay: config.reconnect_delay,
            connect_timeout: config.request_timeout,
            tracker: Arc::new(ConnectionTracker::new()),
            events,
            session: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
        }
    }

    /// Open the channel; a no-op when it is already running
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        let task = ChannelTask {
            endpoint: Arc::clone(&self.endpoint),
            reconnect_delay: self.reconnect_delay,
            connect_timeout: self.connect_timeout,
            tracker: Arc::clone(&self.tracker),
            events: self.events.clone(),
            session,
        };
        tokio::spawn(task.run(token.clone()));
        *running = Some(token);
    }

    /// Close the channel and suppress reconnects
    pub fn stop(&self) {
        let Some(token) = self.running.lock().take() else {
            return;
        };
        token.cancel();

        if self.tracker.mark_stopped() {
            let _ = self.events.send(PushEnvelope {
                session: self.session(),
                event: PushEvent::Closed {
                    reason: "stopped".to_string(),
                },
            });
        }
        tracing::debug!("Push channel stopped");
    }

    /// Drop the current connection and open a new one immediately
    pub fn reconnect(&self) {
        self.stop();
        self.start();
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn is_live(&self) -> bool {
        self.tracker.is_live()
    }

    /// Current session number
    pub fn session(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// Shared session counter, for consumers filtering stale envelopes
    pub fn session_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.session)
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tracker.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.tracker.current()
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        if let Some(token) = self.running.get_mut().take() {
            token.cancel();
        }
    }
}

/// State moved into the background task
struct ChannelTask {
    endpoint: Arc<Endpoint>,
    reconnect_delay: Duration,
    connect_timeout: Duration,
    tracker: Arc<ConnectionTracker>,
    events: mpsc::UnboundedSender<PushEnvelope>,
    session: u64,
}

impl ChannelTask {
    async fn run(self, token: CancellationToken) {
        loop {
            self.tracker.mark_connecting(&token);

            let reason = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                reason = self.connect_and_read(&token) => reason,
            };
            if token.is_cancelled() {
                break;
            }

            self.tracker.mark_closed(reason.clone(), self.reconnect_delay);
            if !self.emit(PushEvent::Closed {
                reason: reason.clone(),
            }) {
                break;
            }
            tracing::info!(
                "Push channel closed ({}), reconnecting in {:?}",
                reason,
                self.reconnect_delay
            );

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        tracing::debug!(session = self.session, "Push channel task exiting");
    }

    /// Connect, pump frames until the socket ends, and return why it ended
    async fn connect_and_read(&self, token: &CancellationToken) -> String {
        let url = match self.endpoint.push_url() {
            Ok(url) => url,
            Err(e) => return e.to_string(),
        };

        let mut request = match url.as_str().into_client_request() {
            Ok(request) => request,
            Err(e) => return format!("Invalid push request: {}", e),
        };
        if let Some(key) = self.endpoint.api_key() {
            match (
                HeaderName::from_bytes(API_KEY_HEADER.as_bytes()),
                HeaderValue::from_str(key),
            ) {
                (Ok(name), Ok(value)) => {
                    request.headers_mut().insert(name, value);
                }
                _ => return "API key is not a valid header value".to_string(),
            }
        }

        tracing::debug!(url = %url, "Connecting push channel");
        let mut stream = match tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => return format!("Connection failed: {}", e),
            Err(_) => return format!("Connection timed out after {:?}", self.connect_timeout),
        };

        // Opened is emitted under the tracker update, so a concurrent
        // stop() cannot report Closed before it
        let mut delivered = true;
        if !self
            .tracker
            .mark_open(token, || delivered = self.emit(PushEvent::Opened))
        {
            return "stopped".to_string();
        }
        tracing::info!(url = %url, "Push channel connected");
        if !delivered {
            return "event receiver dropped".to_string();
        }

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match decode_frame(&text) {
                    Ok(message) => {
                        if !self.emit(PushEvent::Message(message)) {
                            return "event receiver dropped".to_string();
                        }
                    }
                    Err(e) => tracing::warn!("Skipping malformed push frame: {}", e),
                },
                Ok(Message::Binary(payload)) => {
                    tracing::debug!("Ignoring binary push frame ({} bytes)", payload.len());
                }
                Ok(Message::Close(frame)) => {
                    return match frame {
                        Some(frame) if !frame.reason.is_empty() => {
                            format!("closed by server: {}", frame.reason)
                        }
                        _ => "closed by server".to_string(),
                    };
                }
                Ok(_) => {}
                Err(e) => return format!("read error: {}", e),
            }
        }

        "stream ended".to_string()
    }

    fn emit(&self, event: PushEvent) -> bool {
        self.events
            .send(PushEnvelope {
                session: self.session,
                event,
            })
            .is_ok()
    }
}
