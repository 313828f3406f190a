//! Transport seam of the realtime channel.
//!
//! A [`ChannelConnector`] opens one link per connection attempt; the channel
//! driver then speaks STOMP over it. The production connector runs STOMP over
//! a tokio-tungstenite WebSocket, tests plug in an in-memory one.

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use stomp_codec::{Packet, StompCodec};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::error::{ChannelError, Result};

/// One open duplex link carrying STOMP packets.
#[async_trait]
pub trait ChannelLink: Send {
    async fn send_packet(&mut self, packet: Packet) -> Result<()>;

    /// Next packet from the peer. `None` once the peer closed the link.
    ///
    /// Must be cancel-safe: it is polled inside `select!`.
    async fn next_packet(&mut self) -> Option<Result<Packet>>;

    async fn close(&mut self);
}

/// Opens links, attaching the bearer token to the upgrade request.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, bearer: Option<&str>) -> Result<Box<dyn ChannelLink>>;
}

/// Connects to a STOMP broker over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(&self, bearer: Option<&str>) -> Result<Box<dyn ChannelLink>> {
        barter_session::http::install_rustls_provider();

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::connect(format!("invalid websocket url: {e}")))?;
        if let Some(token) = bearer {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ChannelError::connect(format!("invalid bearer token: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| ChannelError::connect(e.to_string()))?;
        debug!(url = %self.url, status = %response.status(), "WebSocket connected");

        Ok(Box::new(WebSocketLink {
            stream,
            codec: StompCodec::default(),
            buffer: BytesMut::new(),
        }))
    }
}

struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    codec: StompCodec,
    /// Bytes received but not yet decoded into a packet.
    buffer: BytesMut,
}

#[async_trait]
impl ChannelLink for WebSocketLink {
    async fn send_packet(&mut self, packet: Packet) -> Result<()> {
        let mut dst = BytesMut::new();
        Encoder::<Packet>::encode(&mut self.codec, packet, &mut dst)?;
        // STOMP over WebSocket travels as text frames unless the body is binary.
        let message = match String::from_utf8(dst.to_vec()) {
            Ok(text) => Message::text(text),
            Err(e) => Message::binary(e.into_bytes()),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| ChannelError::transport(e.to_string()))
    }

    async fn next_packet(&mut self) -> Option<Result<Packet>> {
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(packet)) => return Some(Ok(packet)),
                Ok(None) => {}
                Err(e) => return Some(Err(e.into())),
            }

            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(ChannelError::transport(e.to_string()))),
            };
            match message {
                Message::Text(text) => self.buffer.extend_from_slice(text.as_bytes()),
                Message::Binary(data) => self.buffer.extend_from_slice(&data),
                Message::Close(frame) => {
                    trace!(?frame, "WebSocket closed by peer");
                    return None;
                }
                // Pings are answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
