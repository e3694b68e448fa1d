use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

use crate::events::{HostEvent, Modifiers};
use crate::DuplicatorError;

// Reduce type complexity for Clippy
type BridgeResult = Result<serde_json::Value, String>;
type PendingMap = HashMap<String, oneshot::Sender<BridgeResult>>;
type Pending = Arc<Mutex<PendingMap>>;
type Clients = Arc<Mutex<Vec<Client>>>;
type Subscriptions = Arc<StdMutex<HashMap<String, mpsc::UnboundedSender<()>>>>;

#[derive(Debug, Serialize, Deserialize)]
struct EvalRequest {
    id: String,
    action: String,
    code: String,
    #[serde(default)]
    await_promise: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum BridgeIncoming {
    EvalResult {
        id: String,
        ok: bool,
        result: Option<serde_json::Value>,
        error: Option<String>,
    },
    Typed(TypedIncoming),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum TypedIncoming {
    #[serde(rename = "hello")]
    Hello { from: Option<String> },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "console_event")]
    ConsoleEvent {
        level: Option<String>,
        args: Option<serde_json::Value>,
    },
    #[serde(rename = "item_activated")]
    ItemActivated {
        item_id: Option<String>,
        #[serde(default)]
        alt: bool,
        #[serde(default)]
        shift: bool,
        #[serde(default)]
        ctrl: bool,
        #[serde(default)]
        meta: bool,
    },
    #[serde(rename = "control_activated")]
    ControlActivated,
    #[serde(rename = "location_changed")]
    LocationChanged { url: String },
    #[serde(rename = "unloading")]
    Unloading,
    #[serde(rename = "mutation")]
    Mutation { subscription: String },
}

impl TypedIncoming {
    /// The host event this message stands for, if any.
    pub(crate) fn host_event(&self) -> Option<HostEvent> {
        match self {
            TypedIncoming::ItemActivated {
                item_id,
                alt,
                shift,
                ctrl,
                meta,
            } => Some(HostEvent::ItemActivated {
                item_id: item_id.clone().filter(|id| !id.is_empty()),
                modifiers: Modifiers {
                    alt: *alt,
                    shift: *shift,
                    ctrl: *ctrl,
                    meta: *meta,
                },
            }),
            TypedIncoming::ControlActivated => Some(HostEvent::ControlActivated),
            TypedIncoming::LocationChanged { url } => {
                Some(HostEvent::LocationChanged { url: url.clone() })
            }
            TypedIncoming::Unloading => Some(HostEvent::Unloading),
            _ => None,
        }
    }
}

struct Client {
    sender: mpsc::UnboundedSender<Message>,
}

/// WebSocket endpoint the browser extension connects to.
///
/// Scripts are evaluated in the active tab through the first connected
/// client. Everything the page reports back arrives on the same socket and is
/// routed either to a pending evaluation, to a mutation subscription, or out
/// as a [`HostEvent`].
pub struct ExtensionBridge {
    server_task: JoinHandle<()>,
    local_addr: SocketAddr,
    clients: Clients,
    pending: Pending,
    subscriptions: Subscriptions,
}

impl ExtensionBridge {
    /// Bind the listener and start accepting extension connections.
    pub async fn start(
        addr: &str,
    ) -> Result<(Arc<ExtensionBridge>, mpsc::UnboundedReceiver<HostEvent>), DuplicatorError> {
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::warn!(
                    %addr,
                    ?e,
                    "Port in use, waiting 2 seconds and retrying once..."
                );
                tokio::time::sleep(Duration::from_secs(2)).await;
                TcpListener::bind(addr).await.map_err(|e2| {
                    DuplicatorError::Bridge(format!("failed to bind {addr} after retry: {e2}"))
                })?
            }
            Err(e) => {
                return Err(DuplicatorError::Bridge(format!(
                    "failed to bind {addr}: {e}"
                )))
            }
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| DuplicatorError::Bridge(format!("listener address: {e}")))?;
        tracing::info!("Extension bridge listening on {}", local_addr);

        let clients: Clients = Arc::new(Mutex::new(Vec::new()));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let subscriptions: Subscriptions = Arc::new(StdMutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel::<HostEvent>();

        let clients_clone = clients.clone();
        let pending_clone = pending.clone();
        let subscriptions_clone = subscriptions.clone();
        let server_task = tokio::spawn(async move {
            loop {
                let (stream, _peer) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!("ws accept error: {}", e);
                        continue;
                    }
                };
                let ws_clients = clients_clone.clone();
                let ws_pending = pending_clone.clone();
                let ws_subscriptions = subscriptions_clone.clone();
                let ws_events = events_tx.clone();
                tokio::spawn(async move {
                    let ws_stream = match accept_async(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!("ws handshake error: {}", e);
                            return;
                        }
                    };
                    let (mut sink, mut stream) = ws_stream.split();
                    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

                    // writer task
                    let writer = tokio::spawn(async move {
                        while let Some(msg) = rx.recv().await {
                            if let Err(e) = sink.send(msg).await {
                                tracing::warn!("ws send error: {}", e);
                                break;
                            }
                        }
                    });

                    // register client
                    {
                        ws_clients.lock().await.push(Client { sender: tx.clone() });
                    }

                    // reader loop
                    while let Some(Ok(msg)) = stream.next().await {
                        if !msg.is_text() {
                            continue;
                        }
                        let txt = msg.into_text().unwrap_or_default();
                        match serde_json::from_str::<BridgeIncoming>(&txt) {
                            Ok(BridgeIncoming::EvalResult {
                                id,
                                ok,
                                result,
                                error,
                            }) => {
                                if !ok {
                                    let head: String = error
                                        .as_deref()
                                        .unwrap_or("unknown error")
                                        .chars()
                                        .take(400)
                                        .collect();
                                    tracing::debug!(id = %id, error = %head, "Bridge received EvalResult error");
                                }
                                if let Some(tx) = ws_pending.lock().await.remove(&id) {
                                    let _ = tx.send(if ok {
                                        Ok(result.unwrap_or(serde_json::Value::Null))
                                    } else {
                                        Err(error.unwrap_or_else(|| "unknown error".into()))
                                    });
                                }
                            }
                            Ok(BridgeIncoming::Typed(TypedIncoming::Mutation { subscription })) => {
                                let subs =
                                    ws_subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
                                if let Some(tx) = subs.get(&subscription) {
                                    let _ = tx.send(());
                                }
                            }
                            Ok(BridgeIncoming::Typed(TypedIncoming::ConsoleEvent {
                                level,
                                args,
                            })) => {
                                let args_str =
                                    args.map(|v| v.to_string()).unwrap_or_else(|| "[]".into());
                                match level.as_deref().unwrap_or("log") {
                                    "error" => tracing::error!(args = %args_str, "Console error event"),
                                    "warning" | "warn" => {
                                        tracing::warn!(args = %args_str, "Console warn event")
                                    }
                                    _ => tracing::debug!(args = %args_str, "Console event"),
                                }
                            }
                            Ok(BridgeIncoming::Typed(TypedIncoming::Hello { from })) => {
                                tracing::info!(from = ?from, "Extension connected");
                            }
                            Ok(BridgeIncoming::Typed(TypedIncoming::Pong)) => {}
                            Ok(BridgeIncoming::Typed(typed)) => {
                                if let Some(event) = typed.host_event() {
                                    tracing::debug!(?event, "Host event");
                                    let _ = ws_events.send(event);
                                }
                            }
                            Err(e) => tracing::warn!("Invalid incoming JSON: {}", e),
                        }
                    }

                    writer.abort();
                    ws_clients.lock().await.retain(|c| !c.sender.same_channel(&tx));
                    tracing::info!("Extension disconnected");
                });
            }
        });

        let bridge = ExtensionBridge {
            server_task,
            local_addr,
            clients,
            pending,
            subscriptions,
        };
        Ok((Arc::new(bridge), events_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn is_client_connected(&self) -> bool {
        !self.clients.lock().await.is_empty()
    }

    /// Wait for the extension to connect, polling every 500ms.
    pub async fn wait_for_client(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_client_connected().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Evaluate `code` in the active tab and return its (awaited) value.
    pub async fn eval(
        &self,
        code: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, DuplicatorError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel::<BridgeResult>();
        self.pending.lock().await.insert(id.clone(), tx);
        let req = EvalRequest {
            id: id.clone(),
            action: "eval".into(),
            code: code.to_string(),
            await_promise: true,
        };
        let payload = serde_json::to_string(&req)
            .map_err(|e| DuplicatorError::Bridge(format!("bridge serialize: {e}")))?;

        // send over first client
        let preview: String = payload.chars().take(120).collect();
        let sent = {
            let clients = self.clients.lock().await;
            tracing::trace!(clients = clients.len(), %preview, "Sending eval to extension");
            clients
                .first()
                .is_some_and(|c| c.sender.send(Message::Text(payload)).is_ok())
        };
        if !sent {
            self.pending.lock().await.remove(&id);
            return Err(DuplicatorError::Bridge(
                "no extension client connected".to_string(),
            ));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(val))) => Ok(val),
            Ok(Ok(Err(err))) => Err(DuplicatorError::Script(err)),
            Ok(Err(_canceled)) => Err(DuplicatorError::Bridge(
                "evaluation dropped before a result arrived".to_string(),
            )),
            Err(_elapsed) => {
                self.pending.lock().await.remove(&id);
                Err(DuplicatorError::Timeout(format!(
                    "no EvalResult within {timeout:?} (id={id})"
                )))
            }
        }
    }

    /// Route `mutation` messages carrying `subscription` to the returned receiver.
    pub fn register_subscription(&self, subscription: &str) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscription.to_string(), tx);
        rx
    }

    pub fn unregister_subscription(&self, subscription: &str) {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subscription);
    }
}

impl Drop for ExtensionBridge {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}
