//! SocketCluster text frames.
//!
//! Every frame is a JSON object. Requests carry an `event` name, a `data`
//! payload and, when a reply is expected, a call id (`cid`); replies echo it
//! back as `rid`. Heartbeats are bare strings: `#1`/`#2` on protocol v1 and an
//! empty frame on v2.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::TransportError;
use crate::history::HistoryMessage;

pub const HANDSHAKE_EVENT: &str = "#handshake";
pub const SUBSCRIBE_EVENT: &str = "#subscribe";
pub const UNSUBSCRIBE_EVENT: &str = "#unsubscribe";
pub const PUBLISH_EVENT: &str = "#publish";
pub const KICK_OUT_EVENT: &str = "#kickOut";
pub const AUTH_EVENT: &str = "auth";
pub const HISTORY_REQUEST_EVENT: &str = "getHistory";
pub const HISTORY_REPLY_EVENT: &str = "history";

pub const PING_V1: &str = "#1";
pub const PONG_V1: &str = "#2";

#[derive(Debug, Serialize)]
struct OutgoingFrame<'a> {
    event: &'a str,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    cid: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: Option<String>,
    data: Option<Value>,
    rid: Option<u64>,
    error: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub request_id: String,
    pub channels: Vec<String>,
    pub since: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryReply {
    pub request_id: String,
    #[serde(default)]
    pub messages: Vec<HistoryMessage>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IncomingFrame {
    /// v2 heartbeat, answered with an empty frame.
    Ping,
    /// v1 heartbeat, answered with `#2`.
    PingV1,
    Reply {
        rid: u64,
        data: Value,
        error: Option<String>,
    },
    Publish {
        channel: String,
        data: Value,
    },
    History(HistoryReply),
    KickOut {
        channel: String,
    },
    Event {
        event: String,
        data: Value,
    },
}

fn encode(event: &str, data: Value, cid: Option<u64>) -> String {
    // a Value always serializes
    serde_json::to_string(&OutgoingFrame { event, data, cid }).unwrap_or_default()
}

pub fn handshake(cid: u64) -> String {
    encode(HANDSHAKE_EVENT, json!({ "authToken": null }), Some(cid))
}

pub fn auth(token: &str, user_id: &str, cid: u64) -> String {
    encode(AUTH_EVENT, json!({ "token": token, "uid": user_id }), Some(cid))
}

pub fn subscribe(channel: &str, cid: u64) -> String {
    encode(SUBSCRIBE_EVENT, json!({ "channel": channel }), Some(cid))
}

pub fn unsubscribe(channel: &str) -> String {
    encode(UNSUBSCRIBE_EVENT, json!(channel), None)
}

pub fn history_request(query: &HistoryQuery) -> String {
    let data = serde_json::to_value(query).unwrap_or(Value::Null);
    encode(HISTORY_REQUEST_EVENT, data, None)
}

pub fn parse_frame(text: &str) -> Result<IncomingFrame, TransportError> {
    match text {
        "" => return Ok(IncomingFrame::Ping),
        PING_V1 => return Ok(IncomingFrame::PingV1),
        _ => {}
    }

    let raw: RawFrame =
        serde_json::from_str(text).map_err(|e| TransportError::Decode(e.to_string()))?;
    let data = raw.data.unwrap_or(Value::Null);

    if let Some(rid) = raw.rid {
        return Ok(IncomingFrame::Reply {
            rid,
            data,
            error: raw.error.as_ref().map(error_text),
        });
    }

    let event = raw
        .event
        .ok_or_else(|| TransportError::Decode(format!("frame has neither event nor rid: {}", text)))?;

    match event.as_str() {
        PUBLISH_EVENT => {
            let channel = channel_of(&data)?;
            let payload = data.get("data").cloned().unwrap_or(Value::Null);
            Ok(IncomingFrame::Publish {
                channel,
                data: payload,
            })
        }
        HISTORY_REPLY_EVENT => serde_json::from_value(data)
            .map(IncomingFrame::History)
            .map_err(|e| TransportError::Decode(format!("bad history reply: {}", e))),
        KICK_OUT_EVENT => Ok(IncomingFrame::KickOut {
            channel: channel_of(&data)?,
        }),
        _ => Ok(IncomingFrame::Event { event, data }),
    }
}

fn channel_of(data: &Value) -> Result<String, TransportError> {
    data.get("channel")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TransportError::Decode(format!("frame without channel: {}", data)))
}

/// Errors arrive either as plain strings or as `{name, message}` objects.
fn error_text(error: &Value) -> String {
    match error {
        Value::String(text) => text.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| obj.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}
