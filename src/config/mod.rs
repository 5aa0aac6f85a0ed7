use crate::alert::AlertDefaults;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "CUE_OVERLAY_";
const APP_DIR: &str = "CueOverlay";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub hub: HubConfig,
    pub api: ApiConfig,
    pub session: SessionConfig,
    pub sequencer: SequencerConfig,
    pub overlay: OverlayConfig,
    pub alert: AlertDefaults,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HubConfig {
    pub endpoint: String,
    pub hub_path: String,
    pub skip_negotiation: bool,
    pub initial_delay_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub ping_interval_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://localhost:5001".to_string(),
            hub_path: "/hub/stream-source".to_string(),
            skip_negotiation: false,
            initial_delay_ms: 1_000,
            reconnect_delay_ms: 5_000,
            max_reconnect_delay_ms: 30_000,
            ping_interval_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { timeout_secs: 15 }
    }
}

/// Optional up-front credentials. Left empty, the overlay page supplies them.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SessionConfig {
    pub channel: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub cooldown_ms: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self { cooldown_ms: 1_000 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub bind_address: String,
    pub port: u16,
    pub playback_timeout_ms: u64,
    pub show_status: bool,
    /// Required by `POST /skip`. Falls back to `session.token` when unset.
    pub token: Option<String>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 7070,
            playback_timeout_ms: 120_000,
            show_status: true,
            token: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = active_config_path();
        let mut config = match fs::read_to_string(&config_path) {
            Ok(raw) => toml::from_str::<Config>(&raw)
                .map_err(|err| format!("invalid {}: {err}", config_path.display()))?,
            Err(_) => Self::default(),
        };

        config.apply_overrides(|key| env::var(format!("{ENV_PREFIX}{key}")).ok());

        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Hub
        if let Some(val) = lookup("HUB_ENDPOINT") {
            self.hub.endpoint = val;
        }
        if let Some(val) = lookup("HUB_PATH") {
            self.hub.hub_path = val;
        }
        if let Some(val) = lookup("HUB_SKIP_NEGOTIATION") {
            self.hub.skip_negotiation = val.parse().unwrap_or(false);
        }
        if let Some(ms) = lookup("HUB_RECONNECT_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.hub.reconnect_delay_ms = ms;
        }

        // Api
        if let Some(secs) = lookup("API_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.api.timeout_secs = secs;
        }

        // Session
        if let Some(val) = lookup("CHANNEL") {
            self.session.channel = Some(val);
        }
        if let Some(val) = lookup("TOKEN") {
            self.session.token = Some(val);
        }

        // Sequencer
        if let Some(ms) = lookup("COOLDOWN_MS").and_then(|v| v.parse().ok()) {
            self.sequencer.cooldown_ms = ms;
        }

        // Overlay
        if let Some(val) = lookup("OVERLAY_BIND_ADDRESS") {
            self.overlay.bind_address = val;
        }
        if let Some(port) = lookup("OVERLAY_PORT").and_then(|v| v.parse().ok()) {
            self.overlay.port = port;
        }
        if let Some(val) = lookup("OVERLAY_TOKEN") {
            self.overlay.token = Some(val);
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let endpoint = self.hub.endpoint.trim();
        if endpoint.is_empty() {
            return Err("hub.endpoint must be set".into());
        }
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err("hub.endpoint must be an http:// or https:// url".into());
        }
        if self.hub.reconnect_delay_ms == 0 {
            return Err("hub.reconnect_delay_ms must be non-zero".into());
        }
        if self.hub.max_reconnect_delay_ms < self.hub.reconnect_delay_ms {
            return Err("hub.max_reconnect_delay_ms must be >= hub.reconnect_delay_ms".into());
        }
        if self.hub.ping_interval_ms == 0 {
            return Err("hub.ping_interval_ms must be non-zero".into());
        }
        if self.overlay.port == 0 {
            return Err("overlay.port must be non-zero".into());
        }
        if self.overlay.bind_address.trim().is_empty() {
            return Err("overlay.bind_address must be set".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
    Path::new(&appdata).join(APP_DIR).join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.sequencer.cooldown_ms, 1_000);
        assert_eq!(parsed.alert.font, "Poppins");
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [hub]
            endpoint = "https://bot.example.test"

            [session]
            channel = "floppy"

            [alert]
            color = "red"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.hub.hub_path, "/hub/stream-source");
        assert_eq!(cfg.hub.reconnect_delay_ms, 5_000);
        assert_eq!(cfg.session.channel.as_deref(), Some("floppy"));
        assert!(cfg.session.token.is_none());
        assert_eq!(cfg.alert.color, "red");
        assert_eq!(cfg.alert.duration_ms, 5_000);
        assert_eq!(cfg.overlay.port, 7070);
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut cfg = Config::default();
        cfg.overlay.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_endpoints() {
        let mut cfg = Config::default();
        cfg.hub.endpoint = "  ".to_string();
        assert!(cfg.validate().is_err());
        cfg.hub.endpoint = "ftp://bot.example.test".to_string();
        assert!(cfg.validate().is_err());
        cfg.hub.endpoint = "http://127.0.0.1:5000".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let mut cfg = Config::default();
        cfg.hub.reconnect_delay_ms = 0;
        assert!(cfg.validate().is_err());

        cfg.hub.reconnect_delay_ms = 10_000;
        cfg.hub.max_reconnect_delay_ms = 5_000;
        assert!(cfg.validate().is_err());

        cfg.hub.max_reconnect_delay_ms = 10_000;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn overrides_apply_and_ignore_unparseable_numbers() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("HUB_ENDPOINT", "http://127.0.0.1:5000"),
            ("HUB_SKIP_NEGOTIATION", "true"),
            ("CHANNEL", "floppy"),
            ("TOKEN", "secret"),
            ("OVERLAY_PORT", "not-a-port"),
            ("COOLDOWN_MS", "250"),
            ("OVERLAY_TOKEN", "ctl"),
        ]);
        let mut cfg = Config::default();
        cfg.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(cfg.hub.endpoint, "http://127.0.0.1:5000");
        assert!(cfg.hub.skip_negotiation);
        assert_eq!(cfg.session.channel.as_deref(), Some("floppy"));
        assert_eq!(cfg.session.token.as_deref(), Some("secret"));
        assert_eq!(cfg.overlay.port, 7070);
        assert_eq!(cfg.sequencer.cooldown_ms, 250);
        assert_eq!(cfg.overlay.token.as_deref(), Some("ctl"));
    }

    #[test]
    fn write_default_refuses_to_overwrite() {
        let dir = env::temp_dir().join(format!("cue-overlay-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join(CONFIG_FILE);
        Config::write_default(&path).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("[hub]"));
        assert!(Config::write_default(&path).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }
}
