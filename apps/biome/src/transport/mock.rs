use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{Connector, InboundStream, OutboundSink, TransportError};

/// In-memory connector. Every successful `connect` hands the server side of
/// the link to the receiver returned by [`MockConnector::new`].
pub struct MockConnector {
    peers: mpsc::UnboundedSender<MockPeer>,
    refuse: AtomicBool,
    attempts: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, accepted) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers,
            refuse: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        });
        (connector, accepted)
    }

    /// Makes subsequent connects fail as if the port were closed.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().map(|urls| urls.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<(OutboundSink, InboundStream), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut urls) = self.urls.lock() {
            urls.push(url.to_string());
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (client_tx, server_rx) = fmpsc::unbounded::<String>();
        let (server_tx, client_rx) = fmpsc::unbounded::<Result<String, TransportError>>();
        let peer = MockPeer {
            url: url.to_string(),
            from_client: server_rx,
            to_client: Some(server_tx),
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::Connect("mock server gone".into()))?;

        let outbound = client_tx.sink_map_err(|err| TransportError::Socket(err.to_string()));
        Ok((Box::pin(outbound), Box::pin(client_rx)))
    }
}

/// Server end of a mock link.
pub struct MockPeer {
    pub url: String,
    from_client: fmpsc::UnboundedReceiver<String>,
    to_client: Option<fmpsc::UnboundedSender<Result<String, TransportError>>>,
}

impl MockPeer {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client
            .as_ref()
            .is_some_and(|tx| tx.unbounded_send(Ok(text.into())).is_ok())
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Fails the link with a transport error; the client then sees it close.
    pub fn fail(&mut self, reason: &str) {
        if let Some(tx) = self.to_client.take() {
            let _ = tx.unbounded_send(Err(TransportError::Socket(reason.to_string())));
        }
    }

    /// Closes the link from the server side.
    pub fn close(&mut self) {
        self.to_client.take();
    }

    /// Next text frame sent by the client, `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.next().await
    }

    pub async fn recv_json(&mut self) -> Option<Value> {
        let text = self.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// Drains frames already sent by the client without waiting.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(Some(text)) = self.from_client.try_next() {
            if let Ok(value) = serde_json::from_str(&text) {
                frames.push(value);
            }
        }
        frames
    }
}
