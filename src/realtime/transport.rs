use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as Frame;
use url::Url;

use crate::api::events::{ClientEvent, ServerEvent, parse_frame};
use crate::error::ChatResult;

/// An open, not yet authenticated realtime link.
///
/// `incoming` ends when the underlying socket goes away; dropping `outgoing`
/// closes the socket.
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<ClientEvent>,
    pub incoming: mpsc::UnboundedReceiver<ServerEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self) -> ChatResult<Link>;
}

/// JSON-over-websocket transport.
pub struct WsTransport {
    url: Url,
}

impl WsTransport {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self) -> ChatResult<Link> {
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        log::info!("WebSocket connected to {}", self.url);
        let (mut sink, mut stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerEvent>();

        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        log::warn!("Failed to encode {event:?}: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Frame::Text(text)).await {
                    log::warn!("WebSocket send failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Frame::Text(text)) => match parse_frame(&text) {
                        Ok(event) => {
                            if in_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::debug!("Skipping unrecognised frame: {e}"),
                    },
                    Ok(Frame::Close(reason)) => {
                        log::info!("WebSocket closed by server: {reason:?}");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("WebSocket read failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Link {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
