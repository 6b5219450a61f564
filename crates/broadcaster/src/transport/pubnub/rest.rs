//! Thin client for the PubNub REST endpoints the adapter needs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{HistoryError, TransportError};

use super::history::{ChannelHistoryPage, PubnubHistoryApi, PubnubHistoryItem};

/// Subscribe long-polls are held open by the server for up to 280s.
const POLL_TIMEOUT: Duration = Duration::from_secs(310);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// Presence timeout announced with subscribe and heartbeat requests.
pub const PRESENCE_TIMEOUT_SECS: u64 = 300;

/// Converts a PubNub timetoken (100ns units) to epoch milliseconds.
pub fn timetoken_to_timestamp(timetoken: u64) -> i64 {
    (timetoken / 10_000) as i64
}

/// Converts epoch milliseconds to a PubNub timetoken.
pub fn timestamp_to_timetoken(timestamp: i64) -> u64 {
    (timestamp.max(0) as u64).saturating_mul(10_000)
}

pub struct PubnubSettings {
    pub origin: String,
    pub subscribe_key: String,
    pub auth_key: SecretString,
    pub user_id: String,
    pub strict_ssl: bool,
    pub proxy_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Timetoken {
    #[serde(deserialize_with = "de_timetoken")]
    pub t: u64,
    #[serde(default)]
    pub r: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeEnvelope {
    /// Channel the message was published on.
    pub c: String,
    /// Payload.
    pub d: Value,
    /// Publish timetoken.
    pub p: Timetoken,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeResponse {
    pub t: Timetoken,
    #[serde(default)]
    pub m: Vec<SubscribeEnvelope>,
}

pub struct PubnubRest {
    client: reqwest::Client,
    poll_client: reqwest::Client,
    base: Url,
    subscribe_key: String,
    auth_key: SecretString,
    user_id: String,
}

impl PubnubRest {
    pub fn new(settings: PubnubSettings) -> Result<Self, TransportError> {
        let base = Url::parse(&format!("https://{}", settings.origin))
            .map_err(|e| TransportError::HttpClient(format!("invalid origin: {}", e)))?;
        Ok(Self {
            client: build_client(&settings, REQUEST_TIMEOUT)?,
            poll_client: build_client(&settings, POLL_TIMEOUT)?,
            base,
            subscribe_key: settings.subscribe_key,
            auth_key: settings.auth_key,
            user_id: settings.user_id,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// One subscribe long-poll. A `timetoken` of 0 is a handshake and returns at once.
    pub async fn subscribe(
        &self,
        channels: &[String],
        timetoken: u64,
        region: u32,
    ) -> Result<SubscribeResponse, TransportError> {
        let channel_list = channels.join(",");
        let url = self.url(&["v2", "subscribe", &self.subscribe_key, &channel_list, "0"]);
        let mut query = self.identity();
        query.push(("tt", timetoken.to_string()));
        if region > 0 {
            query.push(("tr", region.to_string()));
        }
        query.push(("heartbeat", PRESENCE_TIMEOUT_SECS.to_string()));
        let response = self.poll_client.get(url).query(&query).send().await?;
        decode(response).await
    }

    pub async fn heartbeat(&self, channels: &[String]) -> Result<(), TransportError> {
        let url = self.presence_url(channels, Some("heartbeat"));
        let mut query = self.identity();
        query.push(("heartbeat", PRESENCE_TIMEOUT_SECS.to_string()));
        let response = self.client.get(url).query(&query).send().await?;
        decode::<Value>(response).await.map(|_| ())
    }

    pub async fn leave(&self, channels: &[String]) -> Result<(), TransportError> {
        let url = self.presence_url(channels, Some("leave"));
        let response = self.client.get(url).query(&self.identity()).send().await?;
        decode::<Value>(response).await.map(|_| ())
    }

    /// Returns the occupant UUIDs of each channel.
    pub async fn here_now(
        &self,
        channels: &[String],
    ) -> Result<HashMap<String, Vec<String>>, TransportError> {
        let url = self.presence_url(channels, None);
        let mut query = self.identity();
        query.push(("disable_uuids", "0".to_string()));
        let response = self.client.get(url).query(&query).send().await?;
        let body: Value = decode(response).await?;
        parse_here_now(channels, &body)
    }

    fn presence_url(&self, channels: &[String], action: Option<&str>) -> Url {
        let joined = channels.join(",");
        let mut segments: Vec<&str> =
            vec!["v2", "presence", "sub-key", &self.subscribe_key, "channel", &joined];
        if let Some(action) = action {
            segments.push(action);
        }
        self.url(&segments)
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments);
        }
        url
    }

    fn identity(&self) -> Vec<(&'static str, String)> {
        vec![
            ("uuid", self.user_id.clone()),
            ("auth", self.auth_key.expose_secret().to_string()),
        ]
    }
}

#[async_trait]
impl PubnubHistoryApi for PubnubRest {
    async fn fetch_messages(
        &self,
        channels: &[String],
        end: u64,
        max: usize,
    ) -> Result<HashMap<String, Vec<PubnubHistoryItem>>, HistoryError> {
        let channel_list = channels.join(",");
        let url = self.url(&["v3", "history", "sub-key", &self.subscribe_key, "channel", &channel_list]);
        let mut query = self.identity();
        query.push(("max", max.to_string()));
        query.push(("end", end.to_string()));
        let response = self
            .client
            .get(url)
            .query(&query)
            .send()
            .await
            .map_err(TransportError::from)?;
        let body: Value = decode(response).await?;
        parse_fetch_messages(&body)
    }

    async fn channel_history(
        &self,
        channel: &str,
        start: u64,
        end: u64,
        count: usize,
    ) -> Result<ChannelHistoryPage, HistoryError> {
        let url = self.url(&["v2", "history", "sub-key", &self.subscribe_key, "channel", channel]);
        let mut query = self.identity();
        query.push(("count", count.to_string()));
        query.push(("start", start.to_string()));
        query.push(("end", end.to_string()));
        query.push(("include_token", "true".to_string()));
        query.push(("string_message_token", "true".to_string()));
        let response = self
            .client
            .get(url)
            .query(&query)
            .send()
            .await
            .map_err(TransportError::from)?;
        let body: Value = decode(response).await?;
        parse_channel_history(&body)
    }
}

fn build_client(settings: &PubnubSettings, timeout: Duration) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(!settings.strict_ssl);
    if let Some(proxy) = &settings.proxy_url {
        builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
    }
    builder
        .build()
        .map_err(|e| TransportError::HttpClient(e.to_string()))
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, TransportError> {
    let status = response.status();
    if status != StatusCode::OK {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Status {
            status: status.as_u16(),
            body,
        });
    }
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
}

/// Channels named in an Access Manager 403 body, or `None` if the body can't be read.
pub fn access_denied_channels(body: &str) -> Option<Vec<String>> {
    let value: Value = serde_json::from_str(body).ok()?;
    let channels = value.get("payload")?.get("channels");
    Some(
        channels
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    )
}

fn parse_here_now(
    channels: &[String],
    body: &Value,
) -> Result<HashMap<String, Vec<String>>, TransportError> {
    let mut occupants = HashMap::new();

    // single-channel responses are not wrapped in payload.channels
    if let Some(by_channel) = body
        .get("payload")
        .and_then(|p| p.get("channels"))
        .and_then(Value::as_object)
    {
        for (channel, info) in by_channel {
            occupants.insert(channel.clone(), uuids_of(info));
        }
    } else if body.get("uuids").is_some() {
        if let [channel] = channels {
            occupants.insert(channel.clone(), uuids_of(body));
        }
    } else {
        return Err(TransportError::Decode(format!(
            "unexpected here_now response: {}",
            body
        )));
    }

    Ok(occupants)
}

fn uuids_of(info: &Value) -> Vec<String> {
    info.get("uuids")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|entry| match entry {
                    Value::String(uuid) => Some(uuid.clone()),
                    Value::Object(obj) => obj.get("uuid").and_then(Value::as_str).map(str::to_string),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_fetch_messages(body: &Value) -> Result<HashMap<String, Vec<PubnubHistoryItem>>, HistoryError> {
    if body.get("error").and_then(Value::as_bool) == Some(true) {
        let message = body
            .get("error_message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(HistoryError::Rejected(message.to_string()));
    }

    let mut result = HashMap::new();
    let Some(channels) = body.get("channels").and_then(Value::as_object) else {
        return Ok(result);
    };
    for (channel, items) in channels {
        let items = items
            .as_array()
            .ok_or_else(|| HistoryError::Malformed(format!("channel {} is not a list", channel)))?;
        let parsed = items.iter().map(parse_item).collect::<Result<Vec<_>, _>>()?;
        result.insert(channel.clone(), parsed);
    }
    Ok(result)
}

fn parse_channel_history(body: &Value) -> Result<ChannelHistoryPage, HistoryError> {
    let parts = body
        .as_array()
        .filter(|parts| parts.len() >= 2)
        .ok_or_else(|| HistoryError::Malformed("history response is not [messages, start, end]".to_string()))?;
    let messages = parts[0]
        .as_array()
        .ok_or_else(|| HistoryError::Malformed("history messages is not a list".to_string()))?
        .iter()
        .map(parse_item)
        .collect::<Result<Vec<_>, _>>()?;
    let start_timetoken = timetoken_value(&parts[1])
        .or_else(|| messages.iter().map(|m| m.timetoken).min())
        .unwrap_or(0);
    Ok(ChannelHistoryPage {
        messages,
        start_timetoken,
    })
}

fn parse_item(item: &Value) -> Result<PubnubHistoryItem, HistoryError> {
    let timetoken = item
        .get("timetoken")
        .and_then(timetoken_value)
        .ok_or_else(|| HistoryError::Malformed(format!("history item without timetoken: {}", item)))?;
    let message = item
        .get("message")
        .or_else(|| item.get("entry"))
        .cloned()
        .unwrap_or(Value::Null);
    Ok(PubnubHistoryItem { timetoken, message })
}

fn timetoken_value(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn de_timetoken<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    timetoken_value(&value).ok_or_else(|| serde::de::Error::custom("invalid timetoken"))
}
