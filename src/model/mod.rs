use serde::{Deserialize, Serialize};
use std::fmt;

/// What an invocation asks the overlay to do. Carried on the wire as a byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum PayloadType {
    Sound,
    Visual,
    Command,
    Other(u8),
}

impl From<u8> for PayloadType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Sound,
            1 => Self::Visual,
            0xff => Self::Command,
            other => Self::Other(other),
        }
    }
}

impl From<PayloadType> for u8 {
    fn from(value: PayloadType) -> Self {
        match value {
            PayloadType::Sound => 0,
            PayloadType::Visual => 1,
            PayloadType::Command => 0xff,
            PayloadType::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInvocation {
    #[serde(rename = "type")]
    pub kind: PayloadType,
    #[serde(default)]
    pub invoked_by: String,
    #[serde(default)]
    pub invoked_from: String,
    #[serde(default)]
    pub command_name: String,
    #[serde(default)]
    pub payload_to_play: String,
    #[serde(default)]
    pub invoked_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoundCommandAbstract {
    pub command_name: String,
    pub payload_to_play: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    LoggedIn,
    LoginFailed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::LoggedIn => "logged_in",
            Self::LoginFailed => "login_failed",
        };
        f.write_str(s)
    }
}
