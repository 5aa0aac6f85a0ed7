//! Visual alert payloads.
//!
//! The first line names the background file (`file://<name>`); every later
//! line is `key=value`. Lines that do not split into exactly one key and one
//! value are dropped.

use crate::cache::Asset;
use crate::model::CommandInvocation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const FILE_SCHEME: &str = "file://";

/// Keys that only the resolution step may set.
pub const FORBIDDEN_PROPERTIES: &[&str] = &["image"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vertical {
    Top,
    Center,
    Bottom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Horizontal {
    Left,
    Center,
    Right,
}

/// Serialized as `["top", "left"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertPosition(pub Vertical, pub Horizontal);

impl Default for AlertPosition {
    fn default() -> Self {
        Self(Vertical::Center, Horizontal::Center)
    }
}

impl AlertPosition {
    pub fn parse(value: &str) -> Self {
        let parts: Vec<String> = value
            .split('-')
            .map(|part| part.trim().to_lowercase())
            .collect();
        if parts.len() != 2 {
            tracing::warn!(value, "failed to parse alert position, using center");
            return Self::default();
        }
        let vertical = match parts[0].as_str() {
            "top" => Some(Vertical::Top),
            "center" => Some(Vertical::Center),
            "bottom" => Some(Vertical::Bottom),
            _ => None,
        };
        let horizontal = match parts[1].as_str() {
            "left" => Some(Horizontal::Left),
            "center" => Some(Horizontal::Center),
            "right" => Some(Horizontal::Right),
            _ => None,
        };
        match (vertical, horizontal) {
            (Some(v), Some(h)) => Self(v, h),
            _ => {
                tracing::warn!(value, "unknown alert position, using center");
                Self::default()
            }
        }
    }
}

/// Values used for every property the payload leaves unset.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertDefaults {
    pub duration_ms: u64,
    pub font: String,
    pub color: String,
    pub border_color: String,
}

impl Default for AlertDefaults {
    fn default() -> Self {
        Self {
            duration_ms: 5_000,
            font: "Poppins".to_string(),
            color: "green".to_string(),
            border_color: "black".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertProperties {
    /// Raw background file name taken from the first line.
    pub image: String,
    pub position: AlertPosition,
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    pub text: String,
    pub font: String,
    pub color: String,
    pub border_color: String,
    /// Raw audio file name, resolved separately.
    pub audio: Option<String>,
    /// Keys this client does not know, kept for forward compatibility.
    pub extra: BTreeMap<String, String>,
}

impl AlertProperties {
    pub fn with_defaults(image: impl Into<String>, defaults: &AlertDefaults) -> Self {
        Self {
            image: image.into(),
            position: AlertPosition::default(),
            duration_ms: defaults.duration_ms,
            text: String::new(),
            font: defaults.font.clone(),
            color: defaults.color.clone(),
            border_color: defaults.border_color.clone(),
            audio: None,
            extra: BTreeMap::new(),
        }
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "duration" => match parse_duration_ms(value) {
                Some(ms) => self.duration_ms = ms,
                None => tracing::warn!(value, "failed to parse alert duration, keeping previous"),
            },
            "position" => self.position = AlertPosition::parse(value),
            "text" => self.text = value.to_string(),
            "font" => self.font = value.to_string(),
            "color" => self.color = value.to_string(),
            "borderColor" => self.border_color = value.to_string(),
            "audio" => self.audio = Some(value.to_string()).filter(|v| !v.trim().is_empty()),
            other => {
                self.extra.insert(other.to_string(), value.to_string());
            }
        }
    }
}

/// `2000ms` → 2000, `1.5s` → 1500, `750` → 750. Suffixes are case-insensitive.
pub fn parse_duration_ms(value: &str) -> Option<u64> {
    let value = value.trim();
    let lower = value.to_ascii_lowercase();
    if let Some(ms) = lower.strip_suffix("ms") {
        return parse_whole(ms);
    }
    if let Some(secs) = lower.strip_suffix('s') {
        let secs: f64 = secs.trim().parse().ok()?;
        if !secs.is_finite() || secs < 0.0 {
            return None;
        }
        return Some((secs * 1000.0).round() as u64);
    }
    parse_whole(&lower)
}

fn parse_whole(value: &str) -> Option<u64> {
    let value = value.trim();
    value.parse::<u64>().ok().or_else(|| {
        // Fractional milliseconds are truncated.
        let f: f64 = value.parse().ok()?;
        (f.is_finite() && f >= 0.0).then(|| f.trunc() as u64)
    })
}

/// Returns the payload's file name when it references a file.
pub fn file_reference(payload: &str) -> Option<&str> {
    let first = payload.lines().next()?;
    first.strip_prefix(FILE_SCHEME).map(str::trim)
}

pub fn parse_alert_payload(payload: &str, defaults: &AlertDefaults) -> AlertProperties {
    let mut lines = payload.split('\n').map(|line| line.trim_end_matches('\r'));
    let first = lines.next().unwrap_or_default();
    let image = first.strip_prefix(FILE_SCHEME).unwrap_or(first).trim();
    let mut properties = AlertProperties::with_defaults(image, defaults);

    for line in lines {
        let parts: Vec<&str> = line.split('=').collect();
        let [key, value] = parts.as_slice() else {
            continue;
        };
        if FORBIDDEN_PROPERTIES.contains(key) {
            tracing::debug!(key, "ignoring forbidden alert property");
            continue;
        }
        properties.apply(key, value);
    }
    properties
}

/// Alert properties with their files fetched.
#[derive(Debug, Clone)]
pub struct ResolvedAlert {
    pub properties: AlertProperties,
    pub image: Arc<Asset>,
    pub audio: Option<Arc<Asset>>,
}

/// What the overlay shows while a visual invocation is in flight. Payloads
/// without a file reference never get this far.
#[derive(Debug, Clone)]
pub struct AlertInvocation {
    pub invocation: CommandInvocation,
    pub alert: ResolvedAlert,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(payload: &str) -> AlertProperties {
        parse_alert_payload(payload, &AlertDefaults::default())
    }

    #[test]
    fn parses_reference_payload() {
        let p = parse("file://bg.png\nduration=2s\nposition=TOP - Left\nbogus");
        assert_eq!(p.image, "bg.png");
        assert_eq!(p.duration_ms, 2000);
        assert_eq!(p.position, AlertPosition(Vertical::Top, Horizontal::Left));
        assert_eq!(p.text, "");
        assert!(p.extra.is_empty());
    }

    #[test]
    fn defaults_apply_to_unset_fields() {
        let p = parse("file://x.gif");
        assert_eq!(p.position, AlertPosition::default());
        assert_eq!(p.duration_ms, 5000);
        assert_eq!(p.font, "Poppins");
        assert_eq!(p.color, "green");
        assert_eq!(p.border_color, "black");
        assert!(p.audio.is_none());
    }

    #[test]
    fn forbidden_image_key_is_dropped() {
        let p = parse("file://real.png\nimage=https://evil.example/x.png\ntext=hi");
        assert_eq!(p.image, "real.png");
        assert_eq!(p.text, "hi");
        assert!(!p.extra.contains_key("image"));
    }

    #[test]
    fn last_write_wins_and_unknown_keys_are_kept() {
        let p = parse("file://a.png\ntext=one\ntext=two\nsize=large\nborderColor=#fff");
        assert_eq!(p.text, "two");
        assert_eq!(p.border_color, "#fff");
        assert_eq!(p.extra.get("size").map(String::as_str), Some("large"));
    }

    #[test]
    fn lines_with_extra_equals_are_dropped() {
        let p = parse("file://a.png\ntext=a=b\ncolor=red");
        assert_eq!(p.text, "");
        assert_eq!(p.color, "red");
    }

    #[test]
    fn malformed_position_falls_back_to_center() {
        assert_eq!(AlertPosition::parse("top"), AlertPosition::default());
        assert_eq!(AlertPosition::parse("top-left-right"), AlertPosition::default());
        assert_eq!(AlertPosition::parse("upper-left"), AlertPosition::default());
        assert_eq!(
            AlertPosition::parse(" bottom -RIGHT "),
            AlertPosition(Vertical::Bottom, Horizontal::Right)
        );
    }

    #[test]
    fn duration_units() {
        assert_eq!(parse_duration_ms("2500ms"), Some(2500));
        assert_eq!(parse_duration_ms("2500MS"), Some(2500));
        assert_eq!(parse_duration_ms("1.5s"), Some(1500));
        assert_eq!(parse_duration_ms("3S"), Some(3000));
        assert_eq!(parse_duration_ms("750"), Some(750));
        assert_eq!(parse_duration_ms("soon"), None);
        assert_eq!(parse_duration_ms("-1s"), None);

        let p = parse("file://a.png\nduration=soon");
        assert_eq!(p.duration_ms, 5000);
    }

    #[test]
    fn audio_and_crlf_payloads() {
        let p = parse("file://a.png\r\naudio=ding.mp3\r\ntext=hello\r\n");
        assert_eq!(p.image, "a.png");
        assert_eq!(p.audio.as_deref(), Some("ding.mp3"));
        assert_eq!(p.text, "hello");
    }

    #[test]
    fn position_serializes_as_pair() {
        let json = serde_json::to_value(AlertPosition(Vertical::Top, Horizontal::Left)).unwrap();
        assert_eq!(json, serde_json::json!(["top", "left"]));
    }

    #[test]
    fn file_reference_detection() {
        assert_eq!(file_reference("file://bg.png\ntext=x"), Some("bg.png"));
        assert_eq!(file_reference("just some text"), None);
        assert_eq!(file_reference(""), None);
    }
}
