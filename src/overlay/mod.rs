use crate::alert::{AlertInvocation, AlertProperties};
use crate::cache::{Asset, AssetCache, FileSource};
use crate::model::ConnectionStatus;
use crate::sequencer::{ActiveAlert, PlaybackDriver, PlaybackError};
use crate::session::{ChannelSession, SessionProvider};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

type CueAck = oneshot::Sender<Result<(), PlaybackError>>;

/// Pushed to every connected overlay page as a JSON text frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverlayEvent {
    Snapshot {
        connection: ConnectionStatus,
        busy: bool,
        alert: Option<AlertView>,
        show_status: bool,
    },
    Status {
        text: String,
    },
    Connected {
        connected: bool,
    },
    Busy {
        busy: bool,
    },
    Alert {
        alert: Option<AlertView>,
    },
    PlayAudio {
        cue: String,
        file_name: String,
    },
    StopAudio {
        cue: String,
    },
}

/// What a page sends back.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PageMessage {
    AudioEnded {
        cue: String,
    },
    AudioFailed {
        cue: String,
        #[serde(default)]
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertView {
    pub command_name: String,
    pub invoked_by: String,
    pub image_type: &'static str,
    pub properties: AlertProperties,
}

impl AlertView {
    pub fn from_invocation(invocation: &AlertInvocation) -> Self {
        Self {
            command_name: invocation.invocation.command_name.clone(),
            invoked_by: invocation.invocation.invoked_by.clone(),
            image_type: invocation.alert.image.content_type,
            properties: invocation.alert.properties.clone(),
        }
    }
}

/// Fan-out point between the client core and the overlay pages. Also the
/// production [`PlaybackDriver`]: audio is played by the pages, which report
/// back when a cue has ended.
pub struct OverlayHub {
    events: broadcast::Sender<OverlayEvent>,
    pending: Mutex<HashMap<String, CueAck>>,
    clients: AtomicUsize,
    playback_timeout: Duration,
}

impl OverlayHub {
    pub fn new(playback_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            pending: Mutex::new(HashMap::new()),
            clients: AtomicUsize::new(0),
            playback_timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: OverlayEvent) {
        let _ = self.events.send(event);
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    pub fn connect_client(self: &Arc<Self>) -> ClientGuard {
        let now = self.clients.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(clients = now, "overlay page connected");
        ClientGuard { hub: self.clone() }
    }

    pub fn handle_page_message(&self, message: PageMessage) {
        let (cue, outcome) = match message {
            PageMessage::AudioEnded { cue } => (cue, Ok(())),
            PageMessage::AudioFailed { cue, error } => {
                let reason = error.unwrap_or_else(|| "audio element error".to_string());
                (cue, Err(PlaybackError::Failed(reason)))
            }
        };
        match self.lock_pending().remove(&cue) {
            Some(ack) => {
                let _ = ack.send(outcome);
            }
            None => tracing::debug!(%cue, "ack for unknown or finished cue"),
        }
    }

    /// Relays client state into the page event stream until the sources close.
    pub fn forward(
        self: &Arc<Self>,
        mut status: broadcast::Receiver<String>,
        mut connected: broadcast::Receiver<bool>,
        mut busy: watch::Receiver<bool>,
        mut active: watch::Receiver<ActiveAlert>,
    ) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = status.recv() => match msg {
                        Ok(text) => hub.publish(OverlayEvent::Status { text }),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    msg = connected.recv() => match msg {
                        Ok(connected) => hub.publish(OverlayEvent::Connected { connected }),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = busy.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let busy = *busy.borrow_and_update();
                        hub.publish(OverlayEvent::Busy { busy });
                    }
                    changed = active.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let alert = active
                            .borrow_and_update()
                            .as_deref()
                            .map(AlertView::from_invocation);
                        hub.publish(OverlayEvent::Alert { alert });
                    }
                }
            }
            tracing::debug!("overlay event forwarding stopped");
        })
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, CueAck>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Held by each connected page. The last page leaving fails every cue still
/// in flight, since nobody is left to finish them.
pub struct ClientGuard {
    hub: Arc<OverlayHub>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let before = self.hub.clients.fetch_sub(1, Ordering::SeqCst);
        tracing::info!(clients = before - 1, "overlay page disconnected");
        if before == 1 {
            for (_, ack) in self.hub.lock_pending().drain() {
                let _ = ack.send(Err(PlaybackError::Disconnected));
            }
        }
    }
}

struct CueGuard<'a> {
    hub: &'a OverlayHub,
    cue: String,
    acked: bool,
}

impl Drop for CueGuard<'_> {
    fn drop(&mut self) {
        self.hub.lock_pending().remove(&self.cue);
        if !self.acked {
            self.hub.publish(OverlayEvent::StopAudio {
                cue: self.cue.clone(),
            });
        }
    }
}

impl PlaybackDriver for OverlayHub {
    fn play_audio(
        &self,
        asset: Arc<Asset>,
    ) -> impl Future<Output = Result<(), PlaybackError>> + Send {
        async move {
            if self.client_count() == 0 {
                return Err(PlaybackError::NoOutput);
            }
            let cue = Uuid::new_v4().to_string();
            let (ack, rx) = oneshot::channel();
            self.lock_pending().insert(cue.clone(), ack);
            let mut guard = CueGuard {
                hub: self,
                cue: cue.clone(),
                acked: false,
            };

            tracing::debug!(cue, file_name = %asset.file_name, "sending audio cue");
            self.publish(OverlayEvent::PlayAudio {
                cue,
                file_name: asset.file_name.clone(),
            });

            match tokio::time::timeout(self.playback_timeout, rx).await {
                Ok(Ok(outcome)) => {
                    guard.acked = true;
                    outcome
                }
                Ok(Err(_)) => Err(PlaybackError::Disconnected),
                Err(_) => Err(PlaybackError::TimedOut(self.playback_timeout)),
            }
        }
    }
}

/// Read access to already-fetched assets, for serving them to pages.
pub trait AssetLookup: Send + Sync + 'static {
    fn peek(&self, file_name: &str) -> Option<Arc<Asset>>;
    fn cached_count(&self) -> usize;
}

impl<F: FileSource> AssetLookup for AssetCache<F> {
    fn peek(&self, file_name: &str) -> Option<Arc<Asset>> {
        AssetCache::peek(self, file_name)
    }

    fn cached_count(&self) -> usize {
        AssetCache::cached_count(self)
    }
}

#[derive(Clone)]
pub struct OverlayState {
    pub hub: Arc<OverlayHub>,
    pub assets: Arc<dyn AssetLookup>,
    pub sessions: SessionProvider,
    pub skip: Arc<dyn Fn() + Send + Sync>,
    pub busy: watch::Receiver<bool>,
    pub active: watch::Receiver<ActiveAlert>,
    pub connection: watch::Receiver<ConnectionStatus>,
    pub show_status: bool,
    /// Guards `POST /skip`. Fixed at startup so a page query cannot change it.
    pub control_token: Option<String>,
}

impl OverlayState {
    fn snapshot(&self) -> OverlayEvent {
        OverlayEvent::Snapshot {
            connection: *self.connection.borrow(),
            busy: *self.busy.borrow(),
            alert: self
                .active
                .borrow()
                .as_deref()
                .map(AlertView::from_invocation),
            show_status: self.show_status,
        }
    }
}

pub fn router(state: OverlayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/overlay", get(overlay_page))
        .route("/ws", get(ws_handler))
        .route("/state", get(state_handler))
        .route("/assets/:name", get(asset_handler))
        .route("/skip", post(skip_handler))
        .with_state(Arc::new(state))
}

pub async fn start(
    addr: SocketAddr,
    state: OverlayState,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "overlay server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

async fn overlay_page(
    State(state): State<Arc<OverlayState>>,
    query: Query<HashMap<String, String>>,
) -> impl IntoResponse {
    // A browser source can carry its own credentials in the URL.
    if let (Some(channel), Some(token)) = (query.get("channel"), query.get("token")) {
        if !channel.trim().is_empty() && !token.trim().is_empty() {
            state
                .sessions
                .set(ChannelSession::new(channel.trim(), token.trim()));
        }
    }

    let html = OVERLAY_HTML.replace(
        "{{SHOW_STATUS}}",
        if state.show_status { "true" } else { "false" },
    );
    Html(html)
}

async fn ws_handler(
    State(state): State<Arc<OverlayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<OverlayState>) {
    // Subscribe before registering so no cue sent to this page is missed.
    let mut events = state.hub.subscribe();
    let _client = state.hub.connect_client();

    if send_event(&mut socket, &state.snapshot()).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "overlay page lagged behind events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<PageMessage>(&text) {
                        Ok(message) => state.hub.handle_page_message(message),
                        Err(err) => tracing::debug!(error = %err, "ignoring page message"),
                    },
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &OverlayEvent) -> Result<(), ()> {
    let payload = serde_json::to_string(event).map_err(|_| ())?;
    socket.send(Message::Text(payload)).await.map_err(|_| ())
}

async fn asset_handler(
    State(state): State<Arc<OverlayState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.assets.peek(&name) {
        Some(asset) => (
            [
                (header::CONTENT_TYPE, asset.content_type),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            asset.bytes.clone(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn skip_handler(
    State(state): State<Arc<OverlayState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(token) = state.control_token.as_deref() else {
        return StatusCode::UNAUTHORIZED;
    };
    if !is_token_valid(&headers, &query.0, token) {
        return StatusCode::UNAUTHORIZED;
    }
    (state.skip)();
    StatusCode::ACCEPTED
}

async fn state_handler(State(state): State<Arc<OverlayState>>) -> impl IntoResponse {
    axum::Json(state.snapshot())
}

fn is_token_valid(headers: &HeaderMap, query: &HashMap<String, String>, token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    // Authorization header first, then the query parameter used by browser sources.
    if let Some(auth_header) = headers.get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(provided_token) = auth_str.strip_prefix("Bearer ") {
                return provided_token == token;
            }
        }
    }

    query.get("token").map(|t| t == token).unwrap_or(false)
}

async fn health_check(State(state): State<Arc<OverlayState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({
            "status": "healthy",
            "pages": state.hub.client_count(),
            "cached_assets": state.assets.cached_count(),
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })),
    )
}

const OVERLAY_HTML: &str = r##"<!doctype html>
<html>
<head>
  <meta charset="utf-8" />
  <title>Cue Overlay</title>
  <style>
    html, body { margin: 0; width: 100%; height: 100%; overflow: hidden; background: transparent; }
    #stage { position: absolute; inset: 0; display: flex; padding: 24px; box-sizing: border-box; }
    #alert { display: none; flex-direction: column; align-items: center; gap: 12px; }
    #alert img, #alert video { max-width: 60vw; max-height: 60vh; }
    #alert .text { font-size: 42px; font-weight: bold; text-align: center; }
    #status { position: absolute; left: 8px; bottom: 8px; padding: 4px 8px; border-radius: 4px;
              font: 12px sans-serif; color: #e6f0ff; background: rgba(11, 14, 18, 0.7); transition: opacity 1s; }
  </style>
</head>
<body>
  <div id="stage"><div id="alert"></div></div>
  <div id="status">connecting...</div>
  <script>
    const SHOW_STATUS = {{SHOW_STATUS}};
    const VERTICAL = { top: "flex-start", center: "center", bottom: "flex-end" };
    const HORIZONTAL = { left: "flex-start", center: "center", right: "flex-end" };
    const stage = document.getElementById("stage");
    const alertBox = document.getElementById("alert");
    const statusBox = document.getElementById("status");
    const cues = new Map();
    let statusTimer = null;
    let ws = null;

    function assetUrl(name) { return "/assets/" + encodeURIComponent(name); }

    function showStatus(text) {
      if (!SHOW_STATUS) { statusBox.style.display = "none"; return; }
      statusBox.textContent = text;
      statusBox.style.opacity = "1";
      clearTimeout(statusTimer);
      statusTimer = setTimeout(() => { statusBox.style.opacity = "0"; }, 5000);
    }

    function renderAlert(alert) {
      alertBox.innerHTML = "";
      if (!alert) { alertBox.style.display = "none"; return; }
      const p = alert.properties;
      stage.style.alignItems = VERTICAL[p.position[0]] || "center";
      stage.style.justifyContent = HORIZONTAL[p.position[1]] || "center";
      let media;
      if (alert.image_type.startsWith("video/")) {
        media = document.createElement("video");
        media.autoplay = true; media.muted = true; media.loop = true;
      } else {
        media = document.createElement("img");
      }
      media.src = assetUrl(p.image);
      alertBox.appendChild(media);
      if (p.text) {
        const text = document.createElement("div");
        text.className = "text";
        text.textContent = p.text;
        text.style.fontFamily = p.font;
        text.style.color = p.color;
        text.style.webkitTextStroke = "1px " + p.borderColor;
        alertBox.appendChild(text);
      }
      alertBox.style.display = "flex";
    }

    function send(msg) { if (ws && ws.readyState === WebSocket.OPEN) ws.send(JSON.stringify(msg)); }

    function playAudio(cue, fileName) {
      const audio = new Audio(assetUrl(fileName));
      cues.set(cue, audio);
      const finish = (msg) => { if (cues.delete(cue)) send(msg); };
      audio.onended = () => finish({ type: "audio_ended", cue });
      audio.onerror = () => finish({ type: "audio_failed", cue, error: "cannot load " + fileName });
      audio.play().catch((err) => finish({ type: "audio_failed", cue, error: String(err) }));
    }

    function stopAudio(cue) {
      const audio = cues.get(cue);
      if (audio) { cues.delete(cue); audio.pause(); audio.src = ""; }
    }

    function handle(msg) {
      switch (msg.type) {
        case "snapshot":
          showStatus(msg.connection);
          renderAlert(msg.alert);
          break;
        case "status": showStatus(msg.text); break;
        case "connected": if (!msg.connected) showStatus("disconnected"); break;
        case "alert": renderAlert(msg.alert); break;
        case "play_audio": playAudio(msg.cue, msg.file_name); break;
        case "stop_audio": stopAudio(msg.cue); break;
      }
    }

    function connect() {
      const proto = location.protocol === "https:" ? "wss" : "ws";
      ws = new WebSocket(proto + "://" + location.host + "/ws");
      ws.onmessage = (ev) => handle(JSON.parse(ev.data));
      ws.onclose = () => {
        for (const cue of Array.from(cues.keys())) stopAudio(cue);
        showStatus("overlay disconnected");
        setTimeout(connect, 2000);
      };
    }
    connect();
  </script>
</body>
</html>
"##;
