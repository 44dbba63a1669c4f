use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use super::{Packet, PushConnection, PushConnector, PushEvent};
use crate::error::{ChatError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the marketplace's Socket.IO server over the websocket
/// transport.
#[derive(Debug, Clone)]
pub struct SocketIoConnector {
    endpoint: Url,
    token: Option<String>,
    connect_timeout: Duration,
}

impl SocketIoConnector {
    pub fn new(ws_base: &str, token: Option<String>, connect_timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint: engine_endpoint(ws_base)?,
            token,
            connect_timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn handshake(&self) -> Result<WsStream> {
        let (mut ws, _response) = connect_async(self.endpoint.as_str()).await?;

        match next_packet(&mut ws).await? {
            Some(Packet::Open(info)) => debug!("Engine.IO session opened: {}", info),
            Some(other) => {
                return Err(ChatError::Protocol(format!(
                    "expected open packet, got {:?}",
                    other
                )))
            }
            None => return Err(ChatError::Closed),
        }

        let auth = self.token.as_ref().map(|token| json!({ "token": token }));
        send_packet(&mut ws, &Packet::Connect(auth)).await?;

        loop {
            match next_packet(&mut ws).await? {
                Some(Packet::Connect(_)) => return Ok(ws),
                Some(Packet::Ping) => send_packet(&mut ws, &Packet::Pong).await?,
                Some(Packet::ConnectError(reason)) => {
                    return Err(ChatError::Protocol(format!("connect refused: {}", reason)))
                }
                Some(other) => debug!("Ignoring {:?} during handshake", other),
                None => return Err(ChatError::Closed),
            }
        }
    }
}

#[async_trait]
impl PushConnector for SocketIoConnector {
    async fn connect(&self) -> Result<Box<dyn PushConnection>> {
        let ws = timeout(self.connect_timeout, self.handshake())
            .await
            .map_err(|_| ChatError::Timeout("connecting to the realtime channel"))??;

        info!("Realtime channel connected to {}", self.endpoint);
        Ok(Box::new(SocketIoConnection { ws, closed: false }))
    }
}

pub struct SocketIoConnection {
    ws: WsStream,
    closed: bool,
}

#[async_trait]
impl PushConnection for SocketIoConnection {
    async fn recv(&mut self) -> Result<Option<PushEvent>> {
        loop {
            match next_packet(&mut self.ws).await? {
                Some(Packet::Event { name, payload }) => {
                    return Ok(Some(PushEvent { name, payload }))
                }
                Some(Packet::Ping) => send_packet(&mut self.ws, &Packet::Pong).await?,
                Some(Packet::Disconnect) | Some(Packet::Close) | None => {
                    self.closed = true;
                    return Ok(None);
                }
                Some(other) => debug!("Ignoring {:?}", other),
            }
        }
    }

    async fn emit(&mut self, event: &str, payload: Value) -> Result<()> {
        if self.closed {
            return Err(ChatError::Closed);
        }
        send_packet(&mut self.ws, &Packet::event(event, payload)).await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = send_packet(&mut self.ws, &Packet::Disconnect).await {
            debug!("Disconnect packet not sent: {}", e);
        }
        if let Err(e) = self.ws.close(None).await {
            debug!("Websocket close failed: {}", e);
        }
    }
}

/// `http://host:5000` -> `ws://host:5000/socket.io/?EIO=4&transport=websocket`
fn engine_endpoint(ws_base: &str) -> Result<Url> {
    let mut url = Url::parse(ws_base)?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ChatError::Protocol(format!(
                "unsupported realtime scheme {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ChatError::Protocol(format!("cannot use scheme {}", scheme)))?;

    let path = format!("{}/socket.io/", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(Some("EIO=4&transport=websocket"));
    Ok(url)
}

async fn send_packet(ws: &mut WsStream, packet: &Packet) -> Result<()> {
    let frame = packet.encode();
    debug!(">> {}", frame);
    ws.send(WsMessage::text(frame)).await?;
    Ok(())
}

/// Next Engine.IO packet, skipping frames that are not Socket.IO text.
/// Malformed frames are logged and dropped.
async fn next_packet(ws: &mut WsStream) -> Result<Option<Packet>> {
    while let Some(frame) = ws.next().await {
        match frame? {
            WsMessage::Text(text) => {
                debug!("<< {}", text.as_str());
                match Packet::parse(text.as_str()) {
                    Ok(packet) => return Ok(Some(packet)),
                    Err(e) => warn!("Dropping malformed frame: {}", e),
                }
            }
            WsMessage::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}
