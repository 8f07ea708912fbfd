// Socket transport abstraction and its tokio-tungstenite implementation.

use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid socket url: {0}")]
    InvalidUrl(String),
    #[error("server rejected credentials: {0}")]
    Unauthorized(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
}

/// One established socket connection carrying text frames.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next text frame. `None` means the server closed the connection.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens transports. Injected into the connection manager so tests can run
/// without sockets.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, token: &str) -> Result<Box<dyn Transport>, TransportError>;
}

/// Check that `url` is a usable ws:// or wss:// endpoint.
pub fn validate_url(url: &str) -> Result<(), TransportError> {
    let request = url
        .into_client_request()
        .map_err(|e| TransportError::InvalidUrl(format!("{url}: {e}")))?;
    match request.uri().scheme_str() {
        Some("ws") | Some("wss") => Ok(()),
        other => Err(TransportError::InvalidUrl(format!(
            "{url}: unsupported scheme {other:?}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// tokio-tungstenite
// ---------------------------------------------------------------------------

/// Connects with `tokio_tungstenite::connect_async`, passing the token as a
/// bearer `Authorization` header on the upgrade request.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str, token: &str) -> Result<Box<dyn Transport>, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        if !token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| TransportError::Connect(format!("invalid token header: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        match tokio_tungstenite::connect_async(request).await {
            Ok((stream, response)) => {
                info!(status = %response.status(), "socket connected to {url}");
                Ok(Box::new(WsTransport { stream }))
            }
            Err(WsError::Http(response))
                if response.status() == StatusCode::UNAUTHORIZED
                    || response.status() == StatusCode::FORBIDDEN =>
            {
                Err(TransportError::Unauthorized(format!(
                    "upgrade refused with {}",
                    response.status()
                )))
            }
            Err(e) => Err(TransportError::Connect(e.to_string())),
        }
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        next_text(&mut self.stream).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

/// Pull the next text payload from a raw WebSocket message stream.
///
/// Binary, ping and pong frames are skipped. A close frame or the end of the
/// stream is reported as `None` (server-initiated disconnect); stream errors
/// are reported as `TransportError::Receive`.
///
/// Generic over the stream so it can be tested with in-memory streams.
pub async fn next_text<St>(stream: &mut St) -> Option<Result<String, TransportError>>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match stream.next().await? {
            Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
            Ok(Message::Close(frame)) => {
                info!("server sent close frame: {frame:?}");
                return None;
            }
            Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            Ok(_) => {
                debug!("ignoring non-text socket frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    /// Helper: create a stream of Message results from a vec.
    fn mock_stream(
        messages: Vec<Result<Message, WsError>>,
    ) -> impl Stream<Item = Result<Message, WsError>> + Unpin {
        stream::iter(messages)
    }

    #[tokio::test]
    async fn text_frames_returned_in_order() {
        let mut s = mock_stream(vec![
            Ok(Message::Text("first".into())),
            Ok(Message::Text("second".into())),
        ]);
        assert_eq!(next_text(&mut s).await, Some(Ok("first".to_string())));
        assert_eq!(next_text(&mut s).await, Some(Ok("second".to_string())));
        assert_eq!(next_text(&mut s).await, None);
    }

    #[tokio::test]
    async fn close_frame_reads_as_server_disconnect() {
        let mut s = mock_stream(vec![
            Ok(Message::Close(None)),
            Ok(Message::Text("after_close".into())),
        ]);
        assert_eq!(next_text(&mut s).await, None);
    }

    #[tokio::test]
    async fn error_is_reported() {
        let mut s = mock_stream(vec![Err(WsError::ConnectionClosed)]);
        assert!(matches!(
            next_text(&mut s).await,
            Some(Err(TransportError::Receive(_)))
        ));
    }

    #[tokio::test]
    async fn binary_and_ping_frames_are_skipped() {
        let mut s = mock_stream(vec![
            Ok(Message::Binary(vec![1, 2, 3].into())),
            Ok(Message::Ping(vec![].into())),
            Ok(Message::Pong(vec![].into())),
            Ok(Message::Text("after_ignored".into())),
        ]);
        assert_eq!(next_text(&mut s).await, Some(Ok("after_ignored".to_string())));
    }

    #[tokio::test]
    async fn json_payload_preserved_exactly() {
        let payload = r#"{"event":"tournament-updated","data":{"type":"match_updated"}}"#;
        let mut s = mock_stream(vec![Ok(Message::Text(payload.into()))]);
        assert_eq!(next_text(&mut s).await, Some(Ok(payload.to_string())));
    }

    #[test]
    fn url_validation() {
        assert!(validate_url("ws://localhost:3000/ws").is_ok());
        assert!(validate_url("wss://api.example.gg/ws").is_ok());
        assert!(matches!(
            validate_url("not a url"),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url("ftp://example.gg"),
            Err(TransportError::InvalidUrl(_))
        ));
    }
}
