//! Hub wire protocol: JSON messages, each terminated by the ASCII record
//! separator, carried over WebSocket text frames.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const RECORD_SEPARATOR: char = '\u{1e}';
pub const HUB_PROTOCOL: &str = "json";
pub const HUB_PROTOCOL_VERSION: u8 = 1;

const TYPE_INVOCATION: u8 = 1;
const TYPE_STREAM_ITEM: u8 = 2;
const TYPE_COMPLETION: u8 = 3;
const TYPE_PING: u8 = 6;
const TYPE_CLOSE: u8 = 7;

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Stream items, cancel-invocation and anything newer than this client knows.
    Ignored(u8),
}

#[derive(Debug)]
pub enum HubError {
    Json(serde_json::Error),
    Handshake(String),
    Protocol(String),
    Negotiate(String),
    Url(String),
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(err) => write!(f, "hub json error: {err}"),
            Self::Handshake(msg) => write!(f, "hub handshake failed: {msg}"),
            Self::Protocol(msg) => write!(f, "hub protocol error: {msg}"),
            Self::Negotiate(msg) => write!(f, "hub negotiate failed: {msg}"),
            Self::Url(msg) => write!(f, "hub url error: {msg}"),
        }
    }
}

impl std::error::Error for HubError {}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    invocation_id: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingInvocation<'a> {
    #[serde(rename = "type")]
    kind: u8,
    invocation_id: &'a str,
    target: &'a str,
    arguments: &'a [Value],
}

#[derive(Debug, Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub connection_token: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl NegotiateResponse {
    /// Newer servers hand out a separate token; older ones reuse the id.
    pub fn connection_key(&self) -> Option<&str> {
        self.connection_token
            .as_deref()
            .or(self.connection_id.as_deref())
    }
}

pub fn encode_handshake() -> String {
    let body = serde_json::json!({
        "protocol": HUB_PROTOCOL,
        "version": HUB_PROTOCOL_VERSION,
    });
    format!("{body}{RECORD_SEPARATOR}")
}

pub fn encode_invocation(
    invocation_id: &str,
    target: &str,
    arguments: &[Value],
) -> Result<String, HubError> {
    let body = serde_json::to_string(&OutgoingInvocation {
        kind: TYPE_INVOCATION,
        invocation_id,
        target,
        arguments,
    })
    .map_err(HubError::Json)?;
    Ok(format!("{body}{RECORD_SEPARATOR}"))
}

pub fn encode_ping() -> String {
    format!("{{\"type\":{TYPE_PING}}}{RECORD_SEPARATOR}")
}

/// Splits a text frame into its records, dropping the empty tail after the
/// final separator.
pub fn split_records(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
}

/// Checks the first record the server sends after connecting. Anything after
/// it in the same frame is returned so it is not lost.
pub fn parse_handshake_response(frame: &str) -> Result<Vec<&str>, HubError> {
    let mut records = split_records(frame);
    let first = records
        .next()
        .ok_or_else(|| HubError::Handshake("empty handshake response".to_string()))?;
    let response: HandshakeResponse = serde_json::from_str(first).map_err(HubError::Json)?;
    if let Some(err) = response.error {
        return Err(HubError::Handshake(err));
    }
    Ok(records.collect())
}

pub fn decode_message(record: &str) -> Result<HubMessage, HubError> {
    let raw: RawMessage = serde_json::from_str(record).map_err(HubError::Json)?;
    match raw.kind {
        TYPE_INVOCATION => {
            let target = raw
                .target
                .ok_or_else(|| HubError::Protocol("invocation without target".to_string()))?;
            Ok(HubMessage::Invocation {
                invocation_id: raw.invocation_id,
                target,
                arguments: raw.arguments,
            })
        }
        TYPE_COMPLETION => {
            let invocation_id = raw.invocation_id.ok_or_else(|| {
                HubError::Protocol("completion without invocationId".to_string())
            })?;
            Ok(HubMessage::Completion {
                invocation_id,
                result: raw.result,
                error: raw.error,
            })
        }
        TYPE_PING => Ok(HubMessage::Ping),
        TYPE_CLOSE => Ok(HubMessage::Close {
            error: raw.error,
            allow_reconnect: raw.allow_reconnect.unwrap_or(false),
        }),
        TYPE_STREAM_ITEM => Ok(HubMessage::Ignored(TYPE_STREAM_ITEM)),
        other => Ok(HubMessage::Ignored(other)),
    }
}

pub fn hub_url(endpoint: &str, hub_path: &str) -> Result<Url, HubError> {
    let mut base = Url::parse(endpoint.trim()).map_err(|err| HubError::Url(err.to_string()))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(hub_path.trim_start_matches('/'))
        .map_err(|err| HubError::Url(err.to_string()))
}

pub fn negotiate_url(hub: &Url) -> Url {
    let mut url = hub.clone();
    let path = format!("{}/negotiate", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    url
}

/// Maps the hub's http(s) URL to the ws(s) URL the transport connects to.
pub fn websocket_url(hub: &Url, connection_key: Option<&str>) -> Result<Url, HubError> {
    let scheme = match hub.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(HubError::Url(format!("unsupported scheme: {other}"))),
    };
    let mut url = hub.clone();
    url.set_scheme(scheme)
        .map_err(|_| HubError::Url(format!("cannot switch {} to {scheme}", hub.scheme())))?;
    if let Some(key) = connection_key {
        url.query_pairs_mut().append_pair("id", key);
    }
    Ok(url)
}

pub fn parse_negotiate_response(body: &str) -> Result<NegotiateResponse, HubError> {
    let response: NegotiateResponse = serde_json::from_str(body).map_err(HubError::Json)?;
    if let Some(err) = response.error.as_deref() {
        return Err(HubError::Negotiate(err.to_string()));
    }
    if response.connection_key().is_none() {
        return Err(HubError::Negotiate(
            "response carries neither connectionToken nor connectionId".to_string(),
        ));
    }
    Ok(response)
}
