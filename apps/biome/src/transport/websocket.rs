use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, future};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::trace;
use url::Url;

use super::{Connector, InboundStream, OutboundSink, TransportError};

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<(OutboundSink, InboundStream), TransportError> {
        let target = prefer_ipv4_loopback(url);
        let (ws_stream, _) = connect_async(target.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (ws_sender, ws_receiver) = ws_stream.split();

        let outbound = ws_sender
            .with(|text: String| future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(Message::Text(text))))
            .sink_map_err(|err| TransportError::Socket(err.to_string()));

        let inbound = ws_receiver.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(data)) => {
                    trace!(target: "biome::transport", bytes = data.len(), "ignoring binary frame");
                    None
                }
                // Close is followed by end-of-stream; pings are answered by tungstenite.
                Ok(_) => None,
                Err(err) => Some(Err(TransportError::Socket(err.to_string()))),
            })
        });

        Ok((Box::pin(outbound), Box::pin(inbound)))
    }
}

/// Rewrites `localhost` to `127.0.0.1` so the connect does not stall on an
/// IPv6 loopback the engine never binds.
fn prefer_ipv4_loopback(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    if parsed.host_str() != Some("localhost") {
        return url.to_string();
    }
    match parsed.set_host(Some("127.0.0.1")) {
        Ok(()) => parsed.into(),
        Err(_) => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::endpoint::normalize_endpoint;

    #[test]
    fn localhost_is_rewritten_to_ipv4() {
        assert_eq!(
            prefer_ipv4_loopback("ws://localhost:7987/ws"),
            "ws://127.0.0.1:7987/ws"
        );
        assert_eq!(
            prefer_ipv4_loopback("wss://gpu.example.com/ws"),
            "wss://gpu.example.com/ws"
        );
    }

    #[test]
    fn only_the_exact_localhost_host_is_rewritten() {
        let lan = normalize_endpoint("localhost.lan:7987");
        assert_eq!(prefer_ipv4_loopback(&lan), "ws://localhost.lan:7987/ws");
        assert_eq!(
            prefer_ipv4_loopback("ws://localhostx:7987/ws"),
            "ws://localhostx:7987/ws"
        );
        assert_eq!(
            prefer_ipv4_loopback("ws://gpu.example.com/ws?next=ws://localhost"),
            "ws://gpu.example.com/ws?next=ws://localhost"
        );
        assert_eq!(
            prefer_ipv4_loopback("wss://localhost/ws"),
            "wss://127.0.0.1/ws"
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn refused_connection_reports_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = WebSocketConnector::new()
            .connect(&format!("ws://127.0.0.1:{port}/ws"))
            .await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
