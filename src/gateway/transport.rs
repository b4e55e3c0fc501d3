//! Frame transports.
//!
//! A [`Connector`] opens a link to the gateway and hands back a pair of
//! channels: text frames out, [`TransportEvent`]s in. The websocket
//! implementation runs a pump task that owns the socket; dropping the
//! outbound sender closes it.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::debug;

use crate::gateway::GatewayError;

/// Something observed on the inbound side of a link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    /// The peer closed the link, with its close code if one was sent.
    Closed(Option<u16>),
}

/// An open link to the gateway.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens gateway links.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: String) -> BoxFuture<'_, Result<TransportLink, GatewayError>>;
}

/// [`Connector`] over tokio-tungstenite.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: String) -> BoxFuture<'_, Result<TransportLink, GatewayError>> {
        Box::pin(async move {
            let (socket, _) = connect_async(url.as_str()).await?;
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            tokio::spawn(pump_socket(socket, outbound_rx, inbound_tx));
            Ok(TransportLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        })
    }
}

async fn pump_socket<S>(
    mut socket: WebSocketStream<S>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    inbound_tx: mpsc::UnboundedSender<TransportEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            let _ = inbound_tx.send(TransportEvent::Closed(None));
                            return;
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        return;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(TransportEvent::Text(text)).is_err() {
                            let _ = socket.close(None).await;
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            let _ = inbound_tx.send(TransportEvent::Closed(None));
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|frame| u16::from(frame.code));
                        let _ = inbound_tx.send(TransportEvent::Closed(code));
                        return;
                    }
                    Some(Ok(_)) => {
                        debug!(event = "gateway_non_text_frame_ignored");
                    }
                    Some(Err(_)) | None => {
                        let _ = inbound_tx.send(TransportEvent::Closed(None));
                        return;
                    }
                }
            }
        }
    }
}

/// In-process [`Connector`] for driving a session without a network.
///
/// Every `connect` produces a [`MemoryPeer`] on the receiver returned by
/// [`MemoryConnector::new`]; the peer plays the server side.
#[derive(Clone, Debug)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        (Self { peers }, peers_rx)
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, url: String) -> BoxFuture<'_, Result<TransportLink, GatewayError>> {
        Box::pin(async move {
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            self.peers
                .send(MemoryPeer {
                    url,
                    to_client: inbound_tx,
                    from_client: outbound_rx,
                })
                .map_err(|_| GatewayError::ConnectionLost("memory listener dropped".to_string()))?;
            Ok(TransportLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        })
    }
}

/// Server end of a [`MemoryConnector`] link.
#[derive(Debug)]
pub struct MemoryPeer {
    pub url: String,
    to_client: mpsc::UnboundedSender<TransportEvent>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Delivers a text frame to the client. Returns false once it hung up.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(TransportEvent::Text(text.into())).is_ok()
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Closes the link from the server side.
    pub fn close(&self, code: Option<u16>) -> bool {
        self.to_client.send(TransportEvent::Closed(code)).is_ok()
    }

    /// Next frame sent by the client, or `None` once the client dropped the link.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next frame sent by the client, parsed as JSON. Unparseable frames are skipped.
    pub async fn recv_json(&mut self) -> Option<Value> {
        loop {
            let text = self.from_client.recv().await?;
            if let Ok(value) = serde_json::from_str(&text) {
                return Some(value);
            }
        }
    }

    /// Next client frame with the given opcode, skipping others.
    pub async fn recv_op(&mut self, op: u8) -> Option<Value> {
        loop {
            let frame = self.recv_json().await?;
            if frame.get("op").and_then(Value::as_u64) == Some(u64::from(op)) {
                return Some(frame);
            }
        }
    }

    /// Whether the client has dropped its end of the link.
    pub fn is_client_gone(&self) -> bool {
        self.to_client.is_closed()
    }
}
