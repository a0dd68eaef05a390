//! rosbridge WebSocket transport.
//!
//! [`Ros2Bridge`] moves text frames between a WebSocket and the internal
//! [`EventBus`], delegating every translation to a [`TagAdapter`]:
//!
//! 1. **Inbound** text frames are handed to [`TagAdapter::ingest`], which
//!    publishes camera frames and enable switches on the bus.
//! 2. **Outbound** events on [`Topic::OUTBOUND`] are rendered with
//!    [`TagAdapter::encode`] and written to the socket.
//!
//! The bridge can either dial a running `rosbridge_server`
//! ([`connect`](Ros2Bridge::connect)) or accept connections itself
//! ([`run_ws_server`](Ros2Bridge::run_ws_server)).  Either way each
//! connection first receives the adapter's handshake frames.
//!
//! The bridge is agnostic about the *meaning* of the data it routes; it only
//! handles transport.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tagframe_types::{Event, TagError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::adapter::TagAdapter;
use crate::bus::{EventBus, Topic};

/// Outbound events buffered per connection before the socket writer
/// applies back-pressure to the topic forwarders.
const OUTBOUND_BUFFER: usize = 64;

/// Bridge between a rosbridge WebSocket and the internal [`EventBus`].
#[derive(Clone)]
pub struct Ros2Bridge {
    bus: Arc<EventBus>,
    adapter: Arc<dyn TagAdapter>,
}

impl Ros2Bridge {
    /// Create a new bridge backed by `bus`, translating with `adapter`.
    pub fn new(bus: Arc<EventBus>, adapter: Arc<dyn TagAdapter>) -> Self {
        Self { bus, adapter }
    }

    /// Dial `url` (typically `ws://localhost:9090`) and pump traffic until
    /// the server closes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::Channel`] if the connection cannot be established.
    pub async fn connect(self, url: &str) -> Result<(), TagError> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| TagError::Channel(format!("ws connect to {url}: {e}")))?;
        info!(url, "connected to rosbridge");
        self.pump(ws_stream, url).await
    }

    /// Start a WebSocket server on `addr`.
    ///
    /// Every connecting client is served independently.  The server runs
    /// until it encounters a fatal bind error.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::Channel`] if the TCP listener cannot be bound.
    pub async fn run_ws_server(self, addr: SocketAddr) -> Result<(), TagError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TagError::Channel(format!("ws bind error on {addr}: {e}")))?;
        info!(%addr, "rosbridge endpoint listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let bridge = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = bridge.handle_ws_client(stream, peer).await {
                            error!(peer = %peer, error = %e, "ws client error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "ws accept error");
                }
            }
        }
    }

    async fn handle_ws_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), TagError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| TagError::Channel(format!("ws handshake from {peer}: {e}")))?;
        self.pump(ws_stream, &peer.to_string()).await
    }

    /// Serve one connection until either side closes it.
    async fn pump<S>(&self, ws_stream: WebSocketStream<S>, peer: &str) -> Result<(), TagError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        for frame in self.adapter.handshake() {
            ws_tx
                .send(Message::Text(frame.into()))
                .await
                .map_err(|e| TagError::Channel(format!("ws send to {peer}: {e}")))?;
        }

        // One forwarder per outbound topic funnels into a single queue.
        let (out_tx, mut out_rx) = mpsc::channel::<Event>(OUTBOUND_BUFFER);
        let mut forwarders = JoinSet::new();
        for topic in Topic::OUTBOUND {
            let mut rx = self.bus.subscribe_to(topic);
            let out_tx = out_tx.clone();
            let peer = peer.to_string();
            forwarders.spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            if out_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(peer = %peer, ?topic, lagged_by = n, "ws client lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }
        drop(out_tx);

        loop {
            tokio::select! {
                // Forward events from the bus to the WebSocket.
                event = out_rx.recv() => {
                    let Some(event) = event else { break };
                    let Some(text) = self.render_outbound(&event) else { continue };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                // Handle incoming WebSocket frames.
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            debug!(peer, error = %e, "ws read error");
                            break;
                        }
                        Some(Ok(Message::Text(text))) => self.handle_incoming_ws_message(text.as_str()),
                        _ => {}
                    }
                }
            }
        }

        forwarders.abort_all();
        info!(peer, "ws connection closed");
        Ok(())
    }

    /// Encode one outbound event.  Events the adapter cannot render are
    /// logged and skipped; the connection stays up.
    fn render_outbound(&self, event: &Event) -> Option<String> {
        match self.adapter.encode(event) {
            Ok(text) => text,
            Err(e) => {
                warn!(source = %event.source, error = %e, "dropping outbound event");
                None
            }
        }
    }

    /// Hand one inbound frame to the adapter.  Bad frames are logged and
    /// dropped; the connection stays up.
    fn handle_incoming_ws_message(&self, text: &str) {
        match self.adapter.ingest(text) {
            Ok(Some(topic)) => debug!(?topic, "ingested rosbridge frame"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "dropping rosbridge frame"),
        }
    }
}
