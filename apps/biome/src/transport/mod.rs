use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub mod mock;
pub mod websocket;

pub use mock::{MockConnector, MockPeer};
pub use websocket::WebSocketConnector;

/// Identifies one socket link; signals from a replaced link are stale.
pub type LinkId = u64;

pub type OutboundSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type InboundStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("socket error: {0}")]
    Socket(String),
}

/// Lifecycle of a socket link as observed by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketSignal {
    Opened,
    Text(String),
    Error(String),
    Closed,
}

/// Opens text-framed sockets. The real implementation speaks WebSocket; tests
/// swap in [`MockConnector`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(OutboundSink, InboundStream), TransportError>;
}

/// Drives one link until either side closes.
///
/// Reports `Opened` once connected, each inbound text frame, and always ends
/// with `Closed` (preceded by `Error` on failure). Dropping every sender of
/// `outbound` closes the socket gracefully.
pub fn spawn_link<F>(
    connector: Arc<dyn Connector>,
    url: String,
    mut outbound: mpsc::UnboundedReceiver<String>,
    report: F,
) -> JoinHandle<()>
where
    F: Fn(SocketSignal) + Send + 'static,
{
    tokio::spawn(async move {
        let (mut sink, mut stream) = match connector.connect(&url).await {
            Ok(halves) => halves,
            Err(err) => {
                debug!(target: "biome::transport", url = %url, error = %err, "socket open failed");
                report(SocketSignal::Error(err.to_string()));
                report(SocketSignal::Closed);
                return;
            }
        };
        debug!(target: "biome::transport", url = %url, "socket open");
        report(SocketSignal::Opened);

        loop {
            tokio::select! {
                next = outbound.recv() => match next {
                    Some(text) => {
                        trace!(target: "biome::transport", bytes = text.len(), "outbound frame");
                        if let Err(err) = sink.send(text).await {
                            report(SocketSignal::Error(err.to_string()));
                            break;
                        }
                    }
                    None => {
                        let _ = sink.close().await;
                        break;
                    }
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(text)) => report(SocketSignal::Text(text)),
                    Some(Err(err)) => {
                        report(SocketSignal::Error(err.to_string()));
                        break;
                    }
                    None => break,
                },
            }
        }

        debug!(target: "biome::transport", url = %url, "socket closed");
        report(SocketSignal::Closed);
    })
}
