//! Link establishment
//!
//! A [`Connector`] turns an [`Endpoint`] into a [`Link`]: a pair of frame
//! channels to the relay. The session transport never touches sockets
//! directly, so the same state machine runs over WebSocket or the
//! in-process relay.

use crate::{Endpoint, TransportResult};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// An established relay link. Dropping `outgoing` closes it.
#[derive(Debug)]
pub struct Link {
    /// Encoded frames to the relay
    pub outgoing: mpsc::UnboundedSender<Vec<u8>>,
    /// Encoded frames from the relay; `None` once the relay closes the link
    pub incoming: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Link {
    pub fn new(outgoing: mpsc::UnboundedSender<Vec<u8>>, incoming: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { outgoing, incoming }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a link to the relay room named by `endpoint`
    async fn connect(&self, endpoint: &Endpoint) -> TransportResult<Link>;
}
