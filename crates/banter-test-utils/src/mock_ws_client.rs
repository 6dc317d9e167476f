use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::Message;

use banter_protocol::{BroadcastFrame, SocketFrame};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Frames a client can receive: a single event object or a batch array.
#[derive(Debug)]
pub enum Received {
    One(BroadcastFrame),
    Batch(Vec<BroadcastFrame>),
    /// A frame that is not a broadcast shape (e.g. a rate-limit notice);
    /// callers parse the raw text themselves.
    Other(String),
}

pub struct MockWsClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl MockWsClient {
    /// Connect with the gateway-style identity header the hub trusts.
    pub async fn connect_as(url: &str, user_id: u64) -> Result<Self, Box<dyn std::error::Error>> {
        use tokio_tungstenite::tungstenite::handshake::client::generate_key;
        let uri: tokio_tungstenite::tungstenite::http::Uri = url.parse()?;
        let host = uri.host().unwrap_or("localhost").to_owned();
        let host_header = match uri.port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };
        let request = Request::builder()
            .uri(url)
            .header("Host", host_header)
            .header("x-user-id", user_id.to_string())
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .body(())?;
        let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    pub async fn send_frame(&mut self, frame: &SocketFrame) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(frame)?;
        self.send_text(&json).await
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    /// Receive the next text frame, answering pings along the way.
    pub async fn recv(&mut self) -> Result<Received, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Ok(parse_received(&text)),
                Some(Ok(Message::Ping(data))) => {
                    self.write.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Receive with a deadline; `Ok(None)` on timeout.
    pub async fn recv_within(
        &mut self,
        wait: Duration,
    ) -> Result<Option<Received>, Box<dyn std::error::Error>> {
        match tokio::time::timeout(wait, self.recv()).await {
            Ok(received) => received.map(Some),
            Err(_) => Ok(None),
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}

fn parse_received(text: &str) -> Received {
    if let Ok(batch) = serde_json::from_str::<Vec<BroadcastFrame>>(text) {
        return Received::Batch(batch);
    }
    if let Ok(frame) = serde_json::from_str::<BroadcastFrame>(text) {
        return Received::One(frame);
    }
    Received::Other(text.to_owned())
}
