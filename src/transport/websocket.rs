use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{Transport, TransportError, TransportSession};

/// Application close codes the server uses when it revokes a session's credential
const CLOSE_UNAUTHORIZED: u16 = 4401;
const CLOSE_FORBIDDEN: u16 = 4403;

/// WebSocket push channel.
///
/// The bearer credential is presented in the `Authorization` header of the
/// upgrade request, so a rejected credential surfaces as an HTTP 401/403 on the
/// handshake rather than as a message after connect.
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, credential: &str) -> Result<Box<dyn TransportSession>, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Protocol(format!("Invalid socket URL: {}", e)))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential))
            .map_err(|_| {
                TransportError::AuthRejected("Credential is not a valid header value".into())
            })?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, response) = connect_async(request).await.map_err(map_handshake_error)?;

        tracing::debug!(
            url = %self.url,
            status = %response.status(),
            "WebSocket handshake completed"
        );

        Ok(Box::new(WebSocketSession { stream }))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

fn map_handshake_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::Http(response) => classify_handshake_status(response.status()),
        other => map_stream_error(other),
    }
}

fn classify_handshake_status(status: StatusCode) -> TransportError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        TransportError::AuthRejected(format!("HTTP {}", status.as_u16()))
    } else {
        TransportError::Protocol(format!("Unexpected handshake status HTTP {}", status.as_u16()))
    }
}

fn map_stream_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        tungstenite::Error::Io(e) => TransportError::Io(e.to_string()),
        other => TransportError::Protocol(other.to_string()),
    }
}

struct WebSocketSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportSession for WebSocketSession {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        tracing::debug!(len = bytes.len(), "Ignoring non-UTF-8 binary frame");
                    }
                },
                Ok(Message::Ping(payload)) => {
                    if let Err(e) = self.stream.send(Message::Pong(payload)).await {
                        return Some(Err(map_stream_error(e)));
                    }
                }
                Ok(Message::Close(frame)) => {
                    let code = frame.as_ref().map(|f| u16::from(f.code));
                    tracing::debug!(code = ?code, "Server closed WebSocket");
                    return match code {
                        Some(CLOSE_UNAUTHORIZED) | Some(CLOSE_FORBIDDEN) => {
                            let reason = format!("Close code {}", code.unwrap_or_default());
                            Some(Err(TransportError::AuthRejected(reason)))
                        }
                        _ => None,
                    };
                }
                Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Err(e) => return Some(Err(map_stream_error(e))),
            }
        }
    }

    async fn close(&mut self) {
        let frame = tungstenite::protocol::CloseFrame {
            code: CloseCode::Normal,
            reason: "client disconnect".into(),
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            tracing::debug!(error = %e, "Error while closing WebSocket");
        }
    }
}
