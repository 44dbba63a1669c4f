use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

pub use packet::Packet;
pub use rest::RestApi;
pub use socket::SocketIoConnector;

use crate::error::Result;

mod packet;
mod rest;
mod socket;

/// Body of `POST /messages`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub to: String,
    pub body: String,
    pub temp_id: String,
}

/// Request/response side of the marketplace API used by the chat core.
#[async_trait]
pub trait MessageApi: Send + Sync {
    /// Raw message records exchanged with `peer`, oldest first.
    async fn history(&self, peer: &str) -> Result<Vec<Value>>;

    /// Primary delivery path. `None` means the server accepted the request
    /// without returning a body.
    async fn post_message(&self, message: &OutgoingMessage) -> Result<Option<Value>>;

    /// Display name for the conversation header.
    async fn peer_name(&self, peer: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub name: String,
    pub payload: Value,
}

/// Opens connections to the real-time channel. Every call yields a fresh,
/// unshared connection.
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PushConnection>>;
}

#[async_trait]
pub trait PushConnection: Send {
    /// Next application event. `Ok(None)` once the server closed the channel.
    async fn recv(&mut self) -> Result<Option<PushEvent>>;

    async fn emit(&mut self, event: &str, payload: Value) -> Result<()>;

    async fn close(&mut self);
}
