use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}

/// A single transcript entry in its canonical shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    pub from: String,
    pub to: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
}

impl Message {
    /// Optimistic entry for a send that has not been confirmed yet.
    pub fn pending(temp_id: &str, from: &str, to: &str, body: &str) -> Self {
        Self {
            id: temp_id.to_string(),
            temp_id: Some(temp_id.to_string()),
            from: from.to_string(),
            to: to.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
            delivery_state: DeliveryState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.delivery_state == DeliveryState::Pending
    }

    pub fn is_own(&self, local_user: &str) -> bool {
        self.from == local_user
    }

    /// The participant on the other side of `local_user`.
    pub fn counterpart(&self, local_user: &str) -> &str {
        if self.from == local_user {
            &self.to
        } else {
            &self.from
        }
    }
}

const FROM_KEYS: &[&str] = &["from", "senderId", "sender", "userId"];
const TO_KEYS: &[&str] = &["to", "receiverId", "recipientId"];
const BODY_KEYS: &[&str] = &["body", "content", "message"];
const CREATED_AT_KEYS: &[&str] = &["createdAt", "created_at", "timestamp"];
const ID_KEYS: &[&str] = &["_id", "id"];

/// Map a raw record from the REST API or the push channel onto the canonical
/// [`Message`]. Never fails; missing fields get defaults.
pub fn normalize(raw: &Value) -> Message {
    normalize_at(raw, Utc::now())
}

pub fn normalize_at(raw: &Value, now: DateTime<Utc>) -> Message {
    let delivery_state = raw
        .get("deliveryState")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or(DeliveryState::Confirmed);

    let mut message = build(raw, None, now);
    message.delivery_state = delivery_state;
    message
}

/// Normalize a primary-channel response for the send that produced `draft`.
/// Fields the response leaves out are taken from the optimistic entry, so a
/// bare `{"_id": ...}` acknowledgement still yields a complete message.
pub fn normalize_durable(raw: &Value, draft: &Message) -> Message {
    build(raw, Some(draft), Utc::now())
}

fn build(raw: &Value, draft: Option<&Message>, now: DateTime<Utc>) -> Message {
    let from = first(raw, FROM_KEYS, ident)
        .or_else(|| draft.map(|d| d.from.clone()))
        .unwrap_or_default();
    let to = first(raw, TO_KEYS, ident)
        .or_else(|| draft.map(|d| d.to.clone()))
        .unwrap_or_default();
    let body = first(raw, BODY_KEYS, text)
        .or_else(|| draft.map(|d| d.body.clone()))
        .unwrap_or_default();
    let created_at = first(raw, CREATED_AT_KEYS, timestamp)
        .or_else(|| draft.map(|d| d.created_at))
        .unwrap_or(now);

    let id = first(raw, ID_KEYS, ident).unwrap_or_else(|| {
        let sender = if from.is_empty() { "msg" } else { from.as_str() };
        format!("{}_{}", sender, created_at.timestamp_millis())
    });

    Message {
        id,
        temp_id: raw
            .get("tempId")
            .and_then(ident)
            .or_else(|| draft.and_then(|d| d.temp_id.clone())),
        from,
        to,
        body,
        created_at,
        delivery_state: DeliveryState::Confirmed,
    }
}

/// Durable identifier carried by a primary-channel response, if any.
pub fn durable_id(raw: &Value) -> Option<String> {
    first(raw, ID_KEYS, ident).filter(|id| !id.is_empty())
}

fn first<T>(raw: &Value, keys: &[&str], extract: impl Fn(&Value) -> Option<T>) -> Option<T> {
    keys.iter().filter_map(|key| raw.get(*key)).find_map(extract)
}

// Ids show up as strings, numbers, or populated user documents.
fn ident(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(_) => first(value, ID_KEYS, ident),
        _ => None,
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_millis),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.trim().parse::<i64>().ok().and_then(from_millis)),
        _ => None,
    }
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
