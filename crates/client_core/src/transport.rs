//! Live duplex channel to the chat broker.
//!
//! A [`Transport`] opens one [`Connection`] per attempt. Every subscription
//! hands back its own inbound stream of raw JSON bodies. Connect failures and
//! mid-session drops are reported through the [`FailureCallback`] given to
//! `connect`, at most once per attempt. Retrying is the caller's job.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::{
    domain::UserId,
    protocol::{ClientFrame, ServerFrame},
};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{config::ClientSettings, error::TransportError};

pub type FailureCallback = Box<dyn FnOnce(TransportError) + Send + 'static>;
pub type InboundStream = mpsc::UnboundedReceiver<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        user_id: UserId,
        on_failure: FailureCallback,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn subscribe(
        &self,
        destination: &str,
    ) -> Result<(SubscriptionHandle, InboundStream), TransportError>;
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), TransportError>;
    async fn publish(&self, destination: &str, payload: Value) -> Result<(), TransportError>;
    /// Closes the connection without reporting a failure.
    async fn disconnect(&self);
}

/// Fire-once wrapper around a [`FailureCallback`].
pub struct FailureSignal {
    callback: std::sync::Mutex<Option<FailureCallback>>,
}

impl FailureSignal {
    pub fn new(callback: FailureCallback) -> Self {
        Self {
            callback: std::sync::Mutex::new(Some(callback)),
        }
    }

    /// Returns false when the callback already ran.
    pub fn fire(&self, err: TransportError) -> bool {
        let callback = match self.callback.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match callback {
            Some(callback) => {
                callback(err);
                true
            }
            None => false,
        }
    }
}

/// Transport for deployments without a broker; every attempt fails so sends
/// take the REST path.
pub struct MissingTransport;

#[async_trait]
impl Transport for MissingTransport {
    async fn connect(
        &self,
        _user_id: UserId,
        on_failure: FailureCallback,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let err = TransportError::Connect("live transport is unavailable".into());
        FailureSignal::new(on_failure).fire(err.clone());
        Err(err)
    }
}

pub struct WsTransport {
    settings: ClientSettings,
}

impl WsTransport {
    pub fn new(settings: ClientSettings) -> Self {
        Self { settings }
    }
}

type RouteTable = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Value>>>>;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        user_id: UserId,
        on_failure: FailureCallback,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let signal = Arc::new(FailureSignal::new(on_failure));

        let ws_url = match self.settings.websocket_url(user_id) {
            Ok(url) => url,
            Err(err) => {
                let err = TransportError::InvalidEndpoint(format!("{err:#}"));
                signal.fire(err.clone());
                return Err(err);
            }
        };

        let ws_stream = match connect_async(ws_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(err) => {
                let err = TransportError::Connect(format!("{ws_url}: {err}"));
                signal.fire(err.clone());
                return Err(err);
            }
        };
        info!(user_id = user_id.0, url = %ws_url, "live connection established");

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let routes: RouteTable = Arc::new(Mutex::new(HashMap::new()));
        let open = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let is_disconnect = matches!(frame, ClientFrame::Disconnect);
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("dropping unencodable frame: {err}");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    debug!("live connection writer stopped: {err}");
                    break;
                }
                if is_disconnect {
                    let _ = ws_writer.close().await;
                    break;
                }
            }
        });

        {
            let routes = Arc::clone(&routes);
            let open = Arc::clone(&open);
            let closing = Arc::clone(&closing);
            tokio::spawn(async move {
                let reason = loop {
                    match ws_reader.next().await {
                        Some(Ok(Message::Text(text))) => {
                            route_server_frame(&routes, &text).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break TransportError::Closed,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => break TransportError::Dropped(err.to_string()),
                    }
                };

                open.store(false, Ordering::SeqCst);
                routes.lock().await.clear();
                if closing.load(Ordering::SeqCst) {
                    debug!("live connection closed by client");
                } else {
                    warn!("live connection lost: {reason}");
                    signal.fire(reason);
                }
            });
        }

        Ok(Arc::new(WsConnection {
            outbound,
            routes,
            next_subscription: AtomicU64::new(1),
            open,
            closing,
        }))
    }
}

async fn route_server_frame(routes: &RouteTable, text: &str) {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(ServerFrame::Message {
            subscription,
            destination,
            body,
        }) => {
            let mut routes = routes.lock().await;
            let delivered = match routes.get(&subscription) {
                Some(sink) => sink.send(body).is_ok(),
                None => {
                    debug!(subscription, %destination, "frame for unknown subscription");
                    return;
                }
            };
            if !delivered {
                routes.remove(&subscription);
            }
        }
        Ok(ServerFrame::Error { message }) => {
            warn!("broker reported error: {message}");
        }
        Err(err) => {
            debug!("ignoring malformed server frame: {err}");
        }
    }
}

struct WsConnection {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    routes: RouteTable,
    next_subscription: AtomicU64,
    open: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
}

impl WsConnection {
    fn send_frame(&self, frame: ClientFrame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) || self.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn subscribe(
        &self,
        destination: &str,
    ) -> Result<(SubscriptionHandle, InboundStream), TransportError> {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let (sink, stream) = mpsc::unbounded_channel();
        self.routes.lock().await.insert(id, sink);

        if let Err(err) = self.send_frame(ClientFrame::Subscribe {
            id,
            destination: destination.to_string(),
        }) {
            self.routes.lock().await.remove(&id);
            return Err(err);
        }
        debug!(subscription = id, destination, "subscribed");
        Ok((SubscriptionHandle(id), stream))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), TransportError> {
        self.routes.lock().await.remove(&handle.0);
        self.send_frame(ClientFrame::Unsubscribe { id: handle.0 })
    }

    async fn publish(&self, destination: &str, payload: Value) -> Result<(), TransportError> {
        self.send_frame(ClientFrame::Send {
            destination: destination.to_string(),
            body: payload,
        })
    }

    async fn disconnect(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.send(ClientFrame::Disconnect);
        self.routes.lock().await.clear();
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
