//! WebSocket connector

use crate::connector::{Connector, Link};
use crate::{Endpoint, TransportError, TransportResult};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

/// Connects to a relay over `ws://` or `wss://`
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &Endpoint) -> TransportResult<Link> {
        let url = endpoint.url();
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        info!(endpoint = %endpoint, "WebSocket link established");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let label = endpoint.to_string();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Binary(frame)).await {
                    debug!(endpoint = %label, error = %e, "WebSocket write failed");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let label = endpoint.to_string();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        if in_tx.send(data).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!(endpoint = %label, "Relay closed WebSocket");
                        break;
                    }
                    // Ping/pong are answered by tungstenite; text frames are not part of the protocol
                    Ok(_) => {}
                    Err(e) => {
                        debug!(endpoint = %label, error = %e, "WebSocket read failed");
                        break;
                    }
                }
            }
        });

        Ok(Link::new(out_tx, in_rx))
    }
}
