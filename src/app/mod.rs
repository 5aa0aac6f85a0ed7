use crate::api::StreamSourceApi;
use crate::cache::AssetCache;
use crate::channel::{self, ChannelSettings, SessionChannel};
use crate::config::Config;
use crate::hub;
use crate::overlay::{self, OverlayHub, OverlayState};
use crate::sequencer::{Sequencer, SequencerSettings};
use crate::session::{ChannelSession, SessionProvider};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
        if command == "list-commands" {
            return handle_list_commands(&config).await;
        }
        if command == "file-url" {
            return handle_file_url(&config);
        }
    }

    let api = build_api(&config)?;
    let sessions = SessionProvider::new(configured_session(&config));
    let cache = Arc::new(AssetCache::new(api));

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.api.timeout_secs))
        .build()?;
    let (channel, connection) = SessionChannel::new(channel_settings(&config)?, http);

    let playback = Arc::new(OverlayHub::new(Duration::from_millis(
        config.overlay.playback_timeout_ms,
    )));
    let sequencer = Sequencer::spawn(
        cache.clone(),
        playback.clone(),
        sessions.clone(),
        SequencerSettings {
            cooldown: Duration::from_millis(config.sequencer.cooldown_ms),
            alert_defaults: config.alert.clone(),
        },
    );

    // Subscribe everything before the connection task can publish.
    let forward_task = playback.forward(
        channel.status(),
        channel.connected(),
        sequencer.busy(),
        sequencer.active_alert(),
    );
    let invocation_task = sequencer.attach(channel.invocations());
    let login_task = channel::spawn_login_on_connect(
        channel.connected(),
        sessions.clone(),
        Arc::new(channel.clone()),
    );
    let connection_task = connection.spawn();

    let addr: SocketAddr =
        format!("{}:{}", config.overlay.bind_address, config.overlay.port).parse()?;
    if sessions.current().is_some() {
        println!("Overlay page: http://{addr}/overlay");
    } else {
        println!("Overlay page: http://{addr}/overlay?channel=<channel>&token=<token>");
    }

    let state = OverlayState {
        hub: playback,
        assets: cache,
        sessions,
        skip: {
            let sequencer = sequencer.clone();
            Arc::new(move || sequencer.skip())
        },
        busy: sequencer.busy(),
        active: sequencer.active_alert(),
        connection: channel.state(),
        show_status: config.overlay.show_status,
        control_token: control_token(&config),
    };
    if state.control_token.is_none() {
        tracing::warn!("no overlay.token or session token configured, POST /skip is disabled");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = tokio::select! {
        res = overlay::start(addr, state, shutdown_rx) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            let _ = shutdown_tx.send(true);
            Ok(())
        }
    };

    for task in [connection_task, login_task, invocation_task, forward_task] {
        task.abort();
    }
    result
}

fn build_api(config: &Config) -> Result<StreamSourceApi, Box<dyn std::error::Error>> {
    Ok(StreamSourceApi::builder(config.hub.endpoint.as_str())
        .timeout(Duration::from_secs(config.api.timeout_secs))
        .build()?)
}

fn channel_settings(config: &Config) -> Result<ChannelSettings, Box<dyn std::error::Error>> {
    Ok(ChannelSettings {
        hub_url: hub::hub_url(&config.hub.endpoint, &config.hub.hub_path)?,
        skip_negotiation: config.hub.skip_negotiation,
        initial_delay: Duration::from_millis(config.hub.initial_delay_ms),
        reconnect_delay: Duration::from_millis(config.hub.reconnect_delay_ms),
        max_reconnect_delay: Duration::from_millis(config.hub.max_reconnect_delay_ms),
        ping_interval: Duration::from_millis(config.hub.ping_interval_ms),
    })
}

fn configured_session(config: &Config) -> Option<ChannelSession> {
    let channel = config.session.channel.as_deref()?.trim();
    let token = config.session.token.as_deref()?.trim();
    if channel.is_empty() || token.is_empty() {
        return None;
    }
    Some(ChannelSession::new(channel, token))
}

/// Token for `POST /skip`, taken from config only so the overlay page query
/// cannot grant itself control.
fn control_token(config: &Config) -> Option<String> {
    config
        .overlay
        .token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .or_else(|| configured_session(config).map(|session| session.token))
}

fn require_session(config: &Config) -> Result<ChannelSession, Box<dyn std::error::Error>> {
    configured_session(config)
        .ok_or_else(|| "missing session.channel / session.token in config".into())
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn handle_list_commands(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let channel = config
        .session
        .channel
        .as_deref()
        .ok_or("missing session.channel in config")?;
    let api = build_api(config)?;
    let commands = api.sound_commands(channel).await?;
    tracing::info!(channel, count = commands.len(), "sound commands listed");
    println!("{}", serde_json::to_string_pretty(&commands)?);
    Ok(())
}

fn handle_file_url(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let file_name = args
        .next()
        .ok_or("missing file name (usage: file-url <fileName>)")?;
    let session = require_session(config)?;
    let url = build_api(config)?.file_url(&session, &file_name)?;
    println!("{url}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_from_config_needs_both_parts() {
        let mut config = Config::default();
        assert!(configured_session(&config).is_none());

        config.session.channel = Some("floppy".to_string());
        assert!(configured_session(&config).is_none());

        config.session.token = Some("  ".to_string());
        assert!(configured_session(&config).is_none());

        config.session.token = Some(" key ".to_string());
        let session = configured_session(&config).unwrap();
        assert_eq!(session.channel, "floppy");
        assert_eq!(session.token, "key");
    }

    #[test]
    fn control_token_prefers_overlay_token() {
        let mut config = Config::default();
        assert!(control_token(&config).is_none());

        config.session.channel = Some("floppy".to_string());
        config.session.token = Some("key".to_string());
        assert_eq!(control_token(&config).as_deref(), Some("key"));

        config.overlay.token = Some(" ".to_string());
        assert_eq!(control_token(&config).as_deref(), Some("key"));

        config.overlay.token = Some("ctl".to_string());
        assert_eq!(control_token(&config).as_deref(), Some("ctl"));
    }

    #[test]
    fn channel_settings_follow_config() {
        let mut config = Config::default();
        config.hub.endpoint = "http://127.0.0.1:5000".to_string();
        config.hub.skip_negotiation = true;
        let settings = channel_settings(&config).unwrap();
        assert_eq!(
            settings.hub_url.as_str(),
            "http://127.0.0.1:5000/hub/stream-source"
        );
        assert!(settings.skip_negotiation);
        assert_eq!(settings.reconnect_delay, Duration::from_secs(5));
        assert_eq!(settings.max_reconnect_delay, Duration::from_secs(30));
    }
}
