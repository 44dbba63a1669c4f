//! Text framing of Socket.IO (protocol v5) on top of Engine.IO v4.
//!
//! Each websocket text frame is one Engine.IO packet: a single digit type
//! followed by its data. Socket.IO packets travel inside Engine.IO `message`
//! packets (`4`), so an event frame looks like `42["name",{...}]`.

use serde_json::Value;

use crate::error::{ChatError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Engine.IO handshake (`0{"sid":...,"pingInterval":...}`).
    Open(Value),
    Close,
    Ping,
    Pong,
    Noop,
    /// Socket.IO namespace connect, with optional auth/handshake data.
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, payload: Value },
    Ack,
    ConnectError(Value),
}

impl Packet {
    pub fn event(name: &str, payload: Value) -> Self {
        Packet::Event {
            name: name.to_string(),
            payload,
        }
    }

    pub fn parse(frame: &str) -> Result<Self> {
        let mut chars = frame.chars();
        let kind = chars
            .next()
            .ok_or_else(|| ChatError::Protocol("empty frame".to_string()))?;
        let rest = chars.as_str();

        match kind {
            '0' => Ok(Packet::Open(serde_json::from_str(rest)?)),
            '1' => Ok(Packet::Close),
            // "2probe" is only used during transport upgrades
            '2' => Ok(Packet::Ping),
            '3' => Ok(Packet::Pong),
            '4' => parse_socket_packet(rest),
            '5' | '6' => Ok(Packet::Noop),
            other => Err(ChatError::Protocol(format!(
                "unknown engine packet type {:?}",
                other
            ))),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Packet::Open(data) => format!("0{}", data),
            Packet::Close => "1".to_string(),
            Packet::Ping => "2".to_string(),
            Packet::Pong => "3".to_string(),
            Packet::Noop => "6".to_string(),
            Packet::Connect(None) => "40".to_string(),
            Packet::Connect(Some(auth)) => format!("40{}", auth),
            Packet::Disconnect => "41".to_string(),
            Packet::Event { name, payload } => {
                let args = if payload.is_null() {
                    Value::Array(vec![Value::String(name.clone())])
                } else {
                    Value::Array(vec![Value::String(name.clone()), payload.clone()])
                };
                format!("42{}", args)
            }
            Packet::Ack => "43".to_string(),
            Packet::ConnectError(data) => format!("44{}", data),
        }
    }
}

fn parse_socket_packet(rest: &str) -> Result<Packet> {
    let mut chars = rest.chars();
    let kind = chars
        .next()
        .ok_or_else(|| ChatError::Protocol("empty socket packet".to_string()))?;
    let data = skip_ack_id(skip_namespace(chars.as_str()));

    match kind {
        '0' if data.is_empty() => Ok(Packet::Connect(None)),
        '0' => Ok(Packet::Connect(Some(serde_json::from_str(data)?))),
        '1' => Ok(Packet::Disconnect),
        '2' => parse_event(data),
        '3' => Ok(Packet::Ack),
        '4' if data.is_empty() => Ok(Packet::ConnectError(Value::Null)),
        '4' => Ok(Packet::ConnectError(serde_json::from_str(data)?)),
        '5' | '6' => Err(ChatError::Protocol(
            "binary packets are not supported".to_string(),
        )),
        other => Err(ChatError::Protocol(format!(
            "unknown socket packet type {:?}",
            other
        ))),
    }
}

fn parse_event(data: &str) -> Result<Packet> {
    let Value::Array(mut args) = serde_json::from_str(data)? else {
        return Err(ChatError::Protocol("event data is not an array".to_string()));
    };
    if args.is_empty() {
        return Err(ChatError::Protocol("event without a name".to_string()));
    }

    let Value::String(name) = args.remove(0) else {
        return Err(ChatError::Protocol("event name is not a string".to_string()));
    };
    let payload = match args.len() {
        0 => Value::Null,
        1 => args.remove(0),
        _ => Value::Array(args),
    };

    Ok(Packet::Event { name, payload })
}

// "/chat,2[...]" -> "2[...]"; the default namespace has no prefix.
fn skip_namespace(data: &str) -> &str {
    if !data.starts_with('/') {
        return data;
    }
    match data.find(',') {
        Some(idx) => &data[idx + 1..],
        None => "",
    }
}

fn skip_ack_id(data: &str) -> &str {
    data.trim_start_matches(|c: char| c.is_ascii_digit())
}
