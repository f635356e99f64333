//! tokio-tungstenite backed [`Transport`].
//!
//! Each open connection runs two tasks: a writer draining `Outbound` into the
//! sink, and a reader forwarding frames into `inbound`. Dropping every
//! outbound sender shuts the writer; dropping the inbound receiver stops the
//! reader.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, info, warn};

use super::socket::{Connection, Outbound, SocketEvent, Transport};
use crate::{
    error::{ParleyError, Result},
    protocol::WireFrame,
};

#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<Connection> {
        let (ws, response) = connect_async(url)
            .await
            .map_err(|e| ParleyError::Transport(format!("connect to {url}: {e}")))?;
        info!(url, status = %response.status(), "websocket open");

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SocketEvent>();

        let writer_events = in_tx.clone();
        tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                let result = match out {
                    Outbound::Frame(WireFrame::Binary(bytes)) => {
                        sink.send(Message::Binary(bytes)).await
                    }
                    Outbound::Frame(WireFrame::Text(text)) => sink.send(Message::Text(text)).await,
                    Outbound::Close => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client disconnect".into(),
                        };
                        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                            debug!("close frame not delivered: {e}");
                        }
                        break;
                    }
                };
                if let Err(e) = result {
                    let _ = writer_events.send(SocketEvent::Error(format!("send failed: {e}")));
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("websocket writer finished");
        });

        tokio::spawn(async move {
            let closed = loop {
                tokio::select! {
                    _ = in_tx.closed() => return,
                    next = stream.next() => match next {
                        Some(Ok(Message::Text(text))) => {
                            let _ = in_tx.send(SocketEvent::Frame(WireFrame::Text(text)));
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            let _ = in_tx.send(SocketEvent::Frame(WireFrame::Binary(bytes)));
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break match frame {
                                Some(f) => SocketEvent::closed(Some(u16::from(f.code)), f.reason.to_string()),
                                None => SocketEvent::closed(None, "closed without status"),
                            };
                        }
                        // Protocol-level ping/pong is answered by tungstenite.
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("websocket read error: {e}");
                            let _ = in_tx.send(SocketEvent::Error(e.to_string()));
                            break SocketEvent::closed(None, e.to_string());
                        }
                        None => break SocketEvent::closed(None, "stream ended"),
                    }
                }
            };
            let _ = in_tx.send(closed);
        });

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
