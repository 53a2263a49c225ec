//! WebSocket frame transport: decoded envelopes in, auto-ack, raw
//! frames out. Kept free of any work heavier than JSON decode and the
//! ack write so the ack path stays fast.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::envelope::Envelope;
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct SocketTransport {
    stream: WsStream,
}

impl SocketTransport {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (stream, _response) = connect_async(url).await.map_err(TransportError::WebSocket)?;
        Ok(Self { stream })
    }

    /// Reads the next frame, decodes it, and immediately writes the
    /// ack reply before returning — the ack is observable on the wire
    /// before the caller does any dispatch work.
    pub async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        loop {
            let Some(msg) = self.stream.next().await else {
                return Ok(None);
            };
            let msg = msg.map_err(TransportError::WebSocket)?;

            match msg {
                Message::Text(text) => {
                    let envelope: Envelope =
                        serde_json::from_str(&text).map_err(TransportError::Decode)?;
                    if let Some(id) = &envelope.envelope_id {
                        self.ack(id).await?;
                    }
                    return Ok(Some(envelope));
                }
                Message::Ping(payload) => {
                    self.stream
                        .send(Message::Pong(payload))
                        .await
                        .map_err(TransportError::WebSocket)?;
                }
                Message::Close(_) => return Err(TransportError::ClosedByPeer),
                _ => continue,
            }
        }
    }

    async fn ack(&mut self, envelope_id: &str) -> Result<(), TransportError> {
        let frame = serde_json::json!({ "envelope_id": envelope_id }).to_string();
        self.stream
            .send(Message::Text(frame.into()))
            .await
            .map_err(TransportError::WebSocket)
    }

    pub async fn send_pong(&mut self, id: serde_json::Value) -> Result<(), TransportError> {
        let frame = serde_json::json!({ "type": "pong", "id": id }).to_string();
        self.stream
            .send(Message::Text(frame.into()))
            .await
            .map_err(TransportError::WebSocket)
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
