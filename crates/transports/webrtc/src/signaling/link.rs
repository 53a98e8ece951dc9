//! WebSocket link to the signaling relay

use super::protocol::SignalingEnvelope;
use super::reconnect::{Backoff, ReconnectPolicy};
use super::EnvelopeSink;
use crate::config::SignalingOptions;
use crate::identity::LocalIdentity;
use crate::{Error, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsReader = SplitStream<WsStream>;
type WsWriter = SplitSink<WsStream, Message>;

/// Callback for envelopes received from the relay
pub type MessageHandler = Arc<dyn Fn(SignalingEnvelope) + Send + Sync>;

/// Callback for link status changes
pub type StatusHandler = Arc<dyn Fn(LinkStatus) + Send + Sync>;

/// Relay link status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    /// Initial connection opened
    Connected,
    /// Connection lost; next attempt scheduled after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Connection restored after an outage
    Reconnected,
    /// Link closed without reconnecting
    Closed,
    /// Reconnect attempts exhausted; the link will not retry again
    Failed { attempts: u32 },
}

/// One persistent connection to the signaling relay
///
/// Sends `join` on every open, fans parsed envelopes out to registered
/// handlers and reconnects with exponential backoff on unexpected close.
/// Only [`SignalingLink::stop`] disables reconnection.
pub struct SignalingLink {
    url: String,
    connect_timeout: Duration,
    policy: ReconnectPolicy,

    /// Shared with the session; read for the `join` payload and the self filter
    identity: Arc<RwLock<LocalIdentity>>,

    /// Feeds the writer task of the current socket
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,

    message_handlers: Mutex<Vec<MessageHandler>>,
    status_handlers: Mutex<Vec<StatusHandler>>,

    should_reconnect: AtomicBool,
    is_reconnecting: AtomicBool,
    connected: AtomicBool,

    /// Attempts spent by the outage that exhausted the policy; 0 otherwise
    exhausted_after: AtomicU32,

    /// Reads frames and drives reconnection
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingLink {
    pub fn new(
        url: impl Into<String>,
        options: &SignalingOptions,
        identity: Arc<RwLock<LocalIdentity>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            connect_timeout: options.connect_timeout(),
            policy: ReconnectPolicy::from(options),
            identity,
            outbound: Mutex::new(None),
            message_handlers: Mutex::new(Vec::new()),
            status_handlers: Mutex::new(Vec::new()),
            should_reconnect: AtomicBool::new(false),
            is_reconnecting: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            exhausted_after: AtomicU32::new(0),
            supervisor: Mutex::new(None),
        })
    }

    /// Connect to the relay
    ///
    /// Resolves with the local identity once the socket is open and `join`
    /// has been queued. A failure here does not schedule reconnects; the
    /// caller may continue offline.
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn connect(self: &Arc<Self>) -> Result<LocalIdentity> {
        if self.is_connected() {
            return Err(Error::SignalingError("relay link already connected".to_string()));
        }

        info!("Connecting to signaling relay");
        self.should_reconnect.store(true, Ordering::SeqCst);
        self.exhausted_after.store(0, Ordering::SeqCst);

        let read = self.open_socket().await?;

        let link = Arc::clone(self);
        let handle = tokio::spawn(async move { link.supervise(read).await });
        if let Some(previous) = self.supervisor.lock().replace(handle) {
            previous.abort();
        }

        info!("Connected to signaling relay");
        self.emit_status(LinkStatus::Connected);

        Ok(self.identity.read().clone())
    }

    /// Queue an envelope for the relay
    pub fn send(&self, envelope: SignalingEnvelope) -> Result<()> {
        let text = envelope.to_json()?;
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            let attempts = self.exhausted_after.load(Ordering::SeqCst);
            if attempts > 0 {
                return Err(Error::ReconnectExhausted { attempts });
            }
            return Err(Error::SignalingError("relay not connected".to_string()));
        };

        tx.send(Message::Text(text))
            .map_err(|_| Error::SignalingError("relay writer closed".to_string()))
    }

    /// Register a handler for envelopes from other peers
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(SignalingEnvelope) + Send + Sync + 'static,
    {
        self.message_handlers.lock().push(Arc::new(handler));
    }

    /// Register a handler for link status changes
    pub fn on_status<F>(&self, handler: F)
    where
        F: Fn(LinkStatus) + Send + Sync + 'static,
    {
        self.status_handlers.lock().push(Arc::new(handler));
    }

    /// Disable reconnection, send `leave` best-effort and close the socket
    pub fn stop(&self) {
        info!("Stopping signaling link");
        self.should_reconnect.store(false, Ordering::SeqCst);

        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }

        let peer_id = self.identity.read().id.clone();
        if let Err(e) = self.send(SignalingEnvelope::Leave { peer_id }) {
            debug!("Leave not sent: {}", e);
        }

        // Dropping the sender lets the writer flush and close the socket
        if let Some(tx) = self.outbound.lock().take() {
            let _ = tx.send(Message::Close(None));
        }

        self.connected.store(false, Ordering::SeqCst);
        self.is_reconnecting.store(false, Ordering::SeqCst);
        self.emit_status(LinkStatus::Closed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.is_reconnecting.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open a socket, start its writer and queue `join`
    async fn open_socket(&self) -> Result<WsReader> {
        let (ws_stream, _) =
            match tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str())).await
            {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    return Err(Error::WebSocketError(format!("Failed to connect: {}", e)));
                }
                Err(_) => {
                    return Err(Error::ConnectionTimeout(format!(
                        "relay {} did not open within {}ms",
                        self.url,
                        self.connect_timeout.as_millis()
                    )));
                }
            };

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::writer_task(write, rx));

        let identity = self.identity.read().clone();
        let join = SignalingEnvelope::Join {
            peer_id: identity.id.clone(),
            data: identity,
        };
        tx.send(Message::Text(join.to_json()?))
            .map_err(|_| Error::SignalingError("relay writer closed".to_string()))?;

        *self.outbound.lock() = Some(tx);
        self.connected.store(true, Ordering::SeqCst);

        Ok(read)
    }

    /// Writer task: drains the outbound queue into the socket
    async fn writer_task(mut write: WsWriter, mut rx: mpsc::UnboundedReceiver<Message>) {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write.send(msg).await {
                warn!("Failed to send relay frame: {}", e);
                break;
            }
        }

        let _ = write.close().await;
        debug!("Relay writer terminated");
    }

    /// Read frames until the socket closes, then reconnect if allowed
    async fn supervise(self: Arc<Self>, mut read: WsReader) {
        loop {
            self.read_frames(&mut read).await;

            self.connected.store(false, Ordering::SeqCst);
            self.outbound.lock().take();

            if !self.should_reconnect.load(Ordering::SeqCst) {
                self.emit_status(LinkStatus::Closed);
                return;
            }

            match self.reconnect().await {
                Some(next) => read = next,
                None => return,
            }
        }
    }

    async fn read_frames(&self, read: &mut WsReader) {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => self.dispatch(&text),
                Ok(Message::Close(frame)) => {
                    info!("Relay closed the connection: {:?}", frame);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Relay socket error: {}", e);
                    break;
                }
            }
        }
    }

    /// Retry with backoff until connected, stopped or out of attempts
    async fn reconnect(&self) -> Option<WsReader> {
        if self.is_reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Reconnect already in flight");
            return None;
        }

        let mut backoff = Backoff::new(self.policy.clone());
        let result = loop {
            let Some((attempt, delay)) = backoff.next_delay() else {
                error!(
                    attempts = backoff.attempts(),
                    "Relay unreachable, giving up on reconnection"
                );
                self.exhausted_after
                    .store(backoff.attempts(), Ordering::SeqCst);
                self.emit_status(LinkStatus::Failed {
                    attempts: backoff.attempts(),
                });
                break None;
            };

            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Relay connection lost, scheduling reconnect"
            );
            self.emit_status(LinkStatus::Reconnecting { attempt, delay });

            tokio::time::sleep(delay).await;

            if !self.should_reconnect.load(Ordering::SeqCst) {
                break None;
            }

            match self.open_socket().await {
                Ok(read) => {
                    info!(attempt, "Reconnected to signaling relay");
                    self.emit_status(LinkStatus::Reconnected);
                    break Some(read);
                }
                Err(e) if e.is_retryable() => warn!(attempt, "Reconnect attempt failed: {}", e),
                Err(e) => {
                    error!(attempt, "Reconnect aborted: {}", e);
                    self.exhausted_after.store(attempt, Ordering::SeqCst);
                    self.emit_status(LinkStatus::Failed { attempts: attempt });
                    break None;
                }
            }
        };

        self.is_reconnecting.store(false, Ordering::SeqCst);
        result
    }

    fn dispatch(&self, text: &str) {
        let envelope = match SignalingEnvelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed relay frame: {}", e);
                return;
            }
        };

        let local_id = self.identity.read().id.clone();
        if envelope.sender() == Some(local_id.as_str()) {
            trace!(kind = envelope.kind(), "Ignoring own envelope");
            return;
        }
        if let Some(target) = envelope.target() {
            if target != local_id {
                trace!(kind = envelope.kind(), target, "Ignoring envelope for another peer");
                return;
            }
        }

        let handlers = self.message_handlers.lock().clone();
        for handler in handlers {
            handler(envelope.clone());
        }
    }

    fn emit_status(&self, status: LinkStatus) {
        let handlers = self.status_handlers.lock().clone();
        for handler in handlers {
            handler(status.clone());
        }
    }
}

impl EnvelopeSink for SignalingLink {
    fn send_envelope(&self, envelope: SignalingEnvelope) {
        let kind = envelope.kind();
        match self.send(envelope) {
            Ok(()) => {}
            Err(e) if e.is_fatal() => warn!(kind, "Relay send dropped: {}", e),
            Err(e) => debug!(kind, "Relay send skipped: {}", e),
        }
    }
}

impl Drop for SignalingLink {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }
}
