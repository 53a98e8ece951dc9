//! Embedded signaling relay for integration tests
//!
//! Routes envelopes carrying `targetPeer` to that peer and broadcasts the
//! rest to every other client. A client that disconnects after joining is
//! announced to the others with a synthesized `leave`. The relay can be
//! killed and restarted on the same address to exercise reconnection.

use super::{HarnessError, HarnessResult};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

struct Client {
    peer_id: Option<String>,
    tx: mpsc::UnboundedSender<Message>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RelayState {
    clients: Mutex<HashMap<u64, Client>>,
    received: Mutex<Vec<Value>>,
    next_client: AtomicU64,
}

impl RelayState {
    fn forward(&self, from: u64, frame: &Value) {
        let text = frame.to_string();
        let target = frame.get("targetPeer").and_then(Value::as_str);
        let clients = self.clients.lock();
        for (id, client) in clients.iter() {
            if *id == from {
                continue;
            }
            let deliver = match target {
                Some(target) => client.peer_id.as_deref() == Some(target),
                None => true,
            };
            if deliver {
                let _ = client.tx.send(Message::Text(text.clone()));
            }
        }
    }
}

/// WebSocket relay bound to 127.0.0.1
pub struct TestRelay {
    addr: SocketAddr,
    state: Arc<RelayState>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TestRelay {
    /// Start a relay on a random available port
    pub async fn start() -> HarnessResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| HarnessError::RelayError(format!("Failed to bind: {}", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| HarnessError::RelayError(format!("Failed to get local addr: {}", e)))?;

        info!("Test relay listening on {}", addr);

        let relay = Self {
            addr,
            state: Arc::new(RelayState::default()),
            accept_task: Mutex::new(None),
        };
        relay.spawn_accept(listener);
        Ok(relay)
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Drop the listener and every client socket
    pub fn kill(&self) {
        info!("Killing test relay");
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let clients: Vec<Client> = self.state.clients.lock().drain().map(|(_, c)| c).collect();
        for client in clients {
            if let Some(task) = client.task {
                task.abort();
            }
        }
    }

    /// Listen again on the original address
    pub async fn restart(&self) -> HarnessResult<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| HarnessError::RelayError(format!("Failed to rebind: {}", e)))?;
        info!("Test relay restarted on {}", self.addr);
        self.spawn_accept(listener);
        Ok(())
    }

    /// Every frame received so far, in arrival order
    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().clone()
    }

    /// Frames of one `type`
    pub fn received_of(&self, kind: &str) -> Vec<Value> {
        self.state
            .received
            .lock()
            .iter()
            .filter(|frame| frame.get("type").and_then(Value::as_str) == Some(kind))
            .cloned()
            .collect()
    }

    /// Frames of one `type` sent by `peer_id`
    pub fn received_from(&self, kind: &str, peer_id: &str) -> Vec<Value> {
        self.received_of(kind)
            .into_iter()
            .filter(|frame| frame.get("peerId").and_then(Value::as_str) == Some(peer_id))
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.state.clients.lock().len()
    }

    fn spawn_accept(&self, listener: TcpListener) {
        let state = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("Relay accepted {}", peer);
                        Self::register(&state, stream);
                    }
                    Err(e) => {
                        warn!("Relay accept failed: {}", e);
                        break;
                    }
                }
            }
        });
        if let Some(previous) = self.accept_task.lock().replace(task) {
            previous.abort();
        }
    }

    fn register(state: &Arc<RelayState>, stream: TcpStream) {
        let id = state.next_client.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        state.clients.lock().insert(
            id,
            Client {
                peer_id: None,
                tx,
                task: None,
            },
        );

        let task = tokio::spawn(Self::serve(Arc::clone(state), id, stream, rx));
        if let Some(client) = state.clients.lock().get_mut(&id) {
            client.task = Some(task);
        }
    }

    async fn serve(
        state: Arc<RelayState>,
        id: u64,
        stream: TcpStream,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("Relay handshake failed: {}", e);
                state.clients.lock().remove(&id);
                return;
            }
        };
        let (mut write, mut read) = ws.split();

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = read.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                warn!("Relay dropping malformed frame");
                continue;
            };

            if value.get("type").and_then(Value::as_str) == Some("join") {
                let peer_id = value.get("peerId").and_then(Value::as_str).map(str::to_string);
                if let Some(client) = state.clients.lock().get_mut(&id) {
                    client.peer_id = peer_id;
                }
            }

            state.received.lock().push(value.clone());
            state.forward(id, &value);
        }

        writer.abort();
        let departed = state.clients.lock().remove(&id).and_then(|c| c.peer_id);
        if let Some(peer_id) = departed {
            debug!("Relay synthesizing leave for {}", peer_id);
            state.forward(id, &json!({ "type": "leave", "peerId": peer_id }));
        }
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.kill();
    }
}
