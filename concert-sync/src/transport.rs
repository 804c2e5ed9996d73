//! Transport endpoints.
//!
//! A [`Connection`] is a pair of unbounded message channels. The transport
//! keeps per-sender ordering; loss shows up as `incoming` returning `None`
//! (and `outgoing.send` failing), after which nothing more arrives on that
//! connection.
//!
//! ```text
//!  SessionClient                               SessionServer
//!  ┌──────────┐  outgoing ──► ws / relay ──► incoming  ┌────────────────┐
//!  │Connection│                                        │serve_connection│
//!  └──────────┘  incoming ◄── ws / relay ◄── outgoing  └────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::protocol::{ProtocolError, SessionMessage};

/// One established transport endpoint.
pub struct Connection {
    pub outgoing: mpsc::UnboundedSender<SessionMessage>,
    pub incoming: mpsc::UnboundedReceiver<SessionMessage>,
}

impl Connection {
    /// Two connected ends of an in-memory link.
    pub fn pair() -> (Connection, Connection) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Connection {
                outgoing: a_tx,
                incoming: b_rx,
            },
            Connection {
                outgoing: b_tx,
                incoming: a_rx,
            },
        )
    }

    pub fn send(&self, msg: SessionMessage) -> Result<(), ProtocolError> {
        self.outgoing.send(msg).map_err(|_| ProtocolError::ConnectionClosed)
    }
}

/// Opens connections to a session server.
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<Connection, ProtocolError>>;
}

/// Bridge a WebSocket stream to a [`Connection`].
///
/// One task encodes outgoing messages into binary frames; another decodes
/// incoming frames. Undecodable frames are logged and skipped.
pub fn spawn_websocket<S>(ws: WebSocketStream<S>, peer: String) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_writer, mut ws_reader) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SessionMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<SessionMessage>();

    let writer_peer = peer.clone();
    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let bytes = match msg.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("Dropping unencodable {:?} for {writer_peer}: {e}", msg.msg_type);
                    continue;
                }
            };
            if let Err(e) = ws_writer.send(Message::Binary(bytes.into())).await {
                log::debug!("WebSocket write to {writer_peer} failed: {e}");
                break;
            }
        }
        let _ = ws_writer.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = ws_reader.next().await {
            match frame {
                Ok(Message::Binary(data)) => match SessionMessage::decode(&data) {
                    Ok(msg) => {
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Failed to decode message from {peer}: {e}"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::debug!("WebSocket error from {peer}: {e}");
                    break;
                }
            }
        }
        log::debug!("WebSocket reader for {peer} finished");
    });

    Connection {
        outgoing: out_tx,
        incoming: in_rx,
    }
}

/// Connects over WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Connection, ProtocolError>> {
        Box::pin(async move {
            let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
                .await
                .map_err(|e| {
                    log::debug!("Connect to {} failed: {e}", self.url);
                    ProtocolError::ConnectionClosed
                })?;
            Ok(spawn_websocket(ws, self.url.clone()))
        })
    }
}

type AcceptFn = dyn Fn(Connection) + Send + Sync;

/// In-process connector.
///
/// Every `connect` creates a relayed link and hands the server end to the
/// accept callback. `sever_all` cuts every open link in both directions;
/// `set_reachable(false)` makes further connects fail.
#[derive(Clone)]
pub struct LocalConnector {
    accept: Arc<AcceptFn>,
    reachable: Arc<AtomicBool>,
    sever: Arc<watch::Sender<u64>>,
}

impl LocalConnector {
    pub fn new(accept: impl Fn(Connection) + Send + Sync + 'static) -> Self {
        let (sever, _) = watch::channel(0);
        Self {
            accept: Arc::new(accept),
            reachable: Arc::new(AtomicBool::new(true)),
            sever: Arc::new(sever),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Simulate transport loss on every open link.
    pub fn sever_all(&self) {
        self.sever.send_modify(|generation| *generation += 1);
    }

    fn relay(
        mut from: mpsc::UnboundedReceiver<SessionMessage>,
        to: mpsc::UnboundedSender<SessionMessage>,
        mut sever: watch::Receiver<u64>,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = from.recv() => match msg {
                        Some(msg) => {
                            if to.send(msg).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = sever.changed() => break,
                }
            }
        });
    }
}

impl Connector for LocalConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Connection, ProtocolError>> {
        Box::pin(async move {
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(ProtocolError::ConnectionClosed);
            }
            let (client_end, client_link) = Connection::pair();
            let (server_end, server_link) = Connection::pair();

            let Connection {
                outgoing: to_client,
                incoming: from_client,
            } = client_link;
            let Connection {
                outgoing: to_server,
                incoming: from_server,
            } = server_link;
            Self::relay(from_client, to_server, self.sever.subscribe());
            Self::relay(from_server, to_client, self.sever.subscribe());

            (self.accept)(server_end);
            Ok(client_end)
        })
    }
}
