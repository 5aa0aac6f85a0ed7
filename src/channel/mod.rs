//! Session channel: the persistent hub connection.
//!
//! A background [`ConnectionTask`] owns the WebSocket. It negotiates,
//! performs the hub handshake, republishes every `SoundCommandReceived`
//! invocation verbatim and reconnects forever with capped exponential
//! backoff. [`SessionChannel`] is the cheap handle the rest of the client
//! holds: status text, connectivity and invocation streams, plus `login`.

use crate::hub::{self, HubError, HubMessage};
use crate::model::{CommandInvocation, ConnectionStatus};
use crate::session::{ChannelSession, SessionProvider};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use reqwest::{Client, Url};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub const INVOCATION_TARGET: &str = "SoundCommandReceived";
pub const LOGIN_TARGET: &str = "Login";
pub const LOGIN_OK_STATUS: &str = "Login successful, ready to take commands";

#[cfg(not(test))]
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
#[cfg(test)]
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);

const STREAM_CAPACITY: usize = 64;

type HubStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Ack = oneshot::Sender<Result<Option<Value>, ChannelError>>;

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub hub_url: Url,
    pub skip_negotiation: bool,
    pub initial_delay: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub ping_interval: Duration,
}

#[derive(Debug)]
pub enum ChannelError {
    NotConnected,
    Disconnected(String),
    Rejected(String),
    Transport(String),
    Hub(HubError),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected to hub"),
            Self::Disconnected(reason) => write!(f, "connection lost: {reason}"),
            Self::Rejected(reason) => write!(f, "rejected by server: {reason}"),
            Self::Transport(err) => write!(f, "transport error: {err}"),
            Self::Hub(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<HubError> for ChannelError {
    fn from(err: HubError) -> Self {
        Self::Hub(err)
    }
}

struct Outbound {
    target: &'static str,
    arguments: Vec<Value>,
    ack: Ack,
}

impl Outbound {
    fn reject(self, err: ChannelError) {
        let _ = self.ack.send(Err(err));
    }
}

struct Publishers {
    status: broadcast::Sender<String>,
    connected: broadcast::Sender<bool>,
    invocations: broadcast::Sender<CommandInvocation>,
    state: watch::Sender<ConnectionStatus>,
}

impl Publishers {
    fn status(&self, text: impl Into<String>) {
        // No subscribers is fine; the streams do not replay.
        let _ = self.status.send(text.into());
    }

    fn connected(&self, connected: bool) {
        let _ = self.connected.send(connected);
    }

    fn state(&self, state: ConnectionStatus) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(from = %current, to = %state, "connection state changed");
            *current = state;
            true
        });
    }
}

/// Handle to the hub connection. Clones share the same connection.
#[derive(Clone)]
pub struct SessionChannel {
    publishers: Arc<Publishers>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// The connection loop. Nothing connects until it is spawned, so subscribers
/// can attach first and see the very first `Connected`.
pub struct ConnectionTask {
    publishers: Arc<Publishers>,
    settings: ChannelSettings,
    http: Client,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl SessionChannel {
    pub fn new(settings: ChannelSettings, http: Client) -> (Self, ConnectionTask) {
        let (status, _) = broadcast::channel(STREAM_CAPACITY);
        let (connected, _) = broadcast::channel(STREAM_CAPACITY);
        let (invocations, _) = broadcast::channel(STREAM_CAPACITY);
        let (state, _) = watch::channel(ConnectionStatus::Disconnected);
        let publishers = Arc::new(Publishers {
            status,
            connected,
            invocations,
            state,
        });
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let channel = Self {
            publishers: publishers.clone(),
            outbound: outbound_tx,
        };
        let task = ConnectionTask {
            publishers,
            settings,
            http,
            outbound: outbound_rx,
        };
        (channel, task)
    }

    pub fn status(&self) -> broadcast::Receiver<String> {
        self.publishers.status.subscribe()
    }

    pub fn connected(&self) -> broadcast::Receiver<bool> {
        self.publishers.connected.subscribe()
    }

    pub fn invocations(&self) -> broadcast::Receiver<CommandInvocation> {
        self.publishers.invocations.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionStatus> {
        self.publishers.state.subscribe()
    }

    /// Sends the session to the hub and waits for the acknowledgement. The
    /// outcome is reported on the status stream only.
    pub async fn login(&self, session: &ChannelSession) {
        tracing::info!(channel = %session.channel, "logging in");
        let argument = match serde_json::to_value(session) {
            Ok(value) => value,
            Err(err) => {
                self.login_failed(&ChannelError::Hub(HubError::Json(err)));
                return;
            }
        };
        match self.invoke(LOGIN_TARGET, vec![argument]).await {
            Ok(_) => {
                tracing::info!(channel = %session.channel, "login successful");
                self.publishers.status(LOGIN_OK_STATUS);
                self.publishers.state(ConnectionStatus::LoggedIn);
            }
            Err(err) => self.login_failed(&err),
        }
    }

    fn login_failed(&self, err: &ChannelError) {
        tracing::error!(error = %err, "login failed");
        self.publishers.status(format!("Login failed: {err}"));
        self.publishers.state(ConnectionStatus::LoginFailed);
    }

    /// Invokes a hub method and waits for its completion.
    pub async fn invoke(
        &self,
        target: &'static str,
        arguments: Vec<Value>,
    ) -> Result<Option<Value>, ChannelError> {
        let (ack, rx) = oneshot::channel();
        self.outbound
            .send(Outbound {
                target,
                arguments,
                ack,
            })
            .map_err(|_| ChannelError::NotConnected)?;
        rx.await
            .map_err(|_| ChannelError::Disconnected("connection task stopped".to_string()))?
    }
}

/// Something that can log a session in. Lets the login trigger be driven
/// without a live hub.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, session: &ChannelSession) -> impl Future<Output = ()> + Send;
}

impl Authenticator for SessionChannel {
    fn authenticate(&self, session: &ChannelSession) -> impl Future<Output = ()> + Send {
        self.login(session)
    }
}

/// Logs in once per rising edge of connectivity, and again whenever the
/// session changes while connected. The server-side session does not survive
/// a transport reconnect, so every `false -> true` needs a fresh login;
/// repeated `true`s do not.
pub fn spawn_login_on_connect<A: Authenticator>(
    mut connected: broadcast::Receiver<bool>,
    sessions: SessionProvider,
    auth: Arc<A>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut session_rx = sessions.subscribe();
        let mut was_connected = false;
        loop {
            tokio::select! {
                edge = connected.recv() => match edge {
                    Ok(true) if !was_connected => {
                        was_connected = true;
                        let waited = sessions.wait().await;
                        // Whatever changed while offline is covered by this login.
                        let session = session_rx.borrow_and_update().clone().unwrap_or(waited);
                        auth.authenticate(&session).await;
                    }
                    Ok(now) => was_connected = now,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "connectivity listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = session_rx.changed(), if was_connected => {
                    if changed.is_err() {
                        break;
                    }
                    let session = session_rx.borrow_and_update().clone();
                    if let Some(session) = session {
                        tracing::info!(channel = %session.channel, "session changed, logging in again");
                        auth.authenticate(&session).await;
                    }
                }
            }
        }
    })
}

impl ConnectionTask {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let ConnectionTask {
            publishers,
            settings,
            http,
            mut outbound,
        } = self;

        offline(tokio::time::sleep(settings.initial_delay), &mut outbound).await;

        let mut delay = settings.reconnect_delay;
        let mut has_connected = false;
        loop {
            publishers.state(if has_connected {
                ConnectionStatus::Reconnecting
            } else {
                ConnectionStatus::Connecting
            });
            tracing::info!(url = %settings.hub_url, "connecting to hub");

            match offline(connect(&settings, &http), &mut outbound).await {
                Ok((ws, backlog)) => {
                    delay = settings.reconnect_delay;
                    let status = if has_connected { "Reconnected" } else { "Connected" };
                    tracing::info!(url = %settings.hub_url, "{}", status.to_lowercase());
                    has_connected = true;
                    publishers.status(status);
                    publishers.state(ConnectionStatus::Connected);
                    publishers.connected(true);

                    let reason =
                        run_session(ws, backlog, &mut outbound, &publishers, settings.ping_interval)
                            .await;
                    tracing::warn!(error = %reason, "hub connection lost");
                    publishers.connected(false);
                    publishers.state(ConnectionStatus::Reconnecting);
                    publishers.status(format!("Reconnecting: {reason}"));
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "failed to connect to hub"
                    );
                    publishers.state(ConnectionStatus::Disconnected);
                    publishers.status(format!("Failed to connect: {err}"));
                }
            }

            offline(tokio::time::sleep(with_jitter(delay)), &mut outbound).await;
            delay = next_delay(delay, settings.max_reconnect_delay);
        }
    }
}

/// Drives `fut` while rejecting every outbound request, since there is no
/// connection to send it on.
async fn offline<T>(
    fut: impl Future<Output = T>,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> T {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return out,
            Some(request) = outbound.recv() => {
                tracing::debug!(method = request.target, "rejecting hub call while offline");
                request.reject(ChannelError::NotConnected);
            }
        }
    }
}

async fn negotiate(http: &Client, hub_url: &Url) -> Result<String, ChannelError> {
    let url = hub::negotiate_url(hub_url);
    tracing::debug!(%url, "negotiating hub connection");
    let resp = http
        .post(url)
        .send()
        .await
        .map_err(|err| ChannelError::Transport(err.to_string()))?;
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|err| ChannelError::Transport(err.to_string()))?;
    if !status.is_success() {
        return Err(HubError::Negotiate(format!("{}: {}", status.as_u16(), body)).into());
    }
    let response = hub::parse_negotiate_response(&body)?;
    response
        .connection_key()
        .map(str::to_string)
        .ok_or_else(|| HubError::Negotiate("no connection key".to_string()).into())
}

async fn connect(
    settings: &ChannelSettings,
    http: &Client,
) -> Result<(HubStream, Vec<String>), ChannelError> {
    let key = if settings.skip_negotiation {
        None
    } else {
        Some(negotiate(http, &settings.hub_url).await?)
    };
    let url = hub::websocket_url(&settings.hub_url, key.as_deref())?;
    let (mut ws, _) = connect_async(url.as_str())
        .await
        .map_err(|err| ChannelError::Transport(err.to_string()))?;

    ws.send(Message::Text(hub::encode_handshake()))
        .await
        .map_err(|err| ChannelError::Transport(err.to_string()))?;

    let backlog = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut ws))
        .await
        .map_err(|_| HubError::Handshake("timed out waiting for response".to_string()))??;
    Ok((ws, backlog))
}

async fn read_handshake(ws: &mut HubStream) -> Result<Vec<String>, ChannelError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let rest = hub::parse_handshake_response(&text)?;
                return Ok(rest.into_iter().map(str::to_string).collect());
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(ChannelError::Disconnected(
                    "closed during handshake".to_string(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(ChannelError::Transport(err.to_string())),
        }
    }
}

/// Runs one connected session until it ends; returns why it ended. Calls
/// still waiting for a completion are failed on the way out.
async fn run_session(
    ws: HubStream,
    backlog: Vec<String>,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    publishers: &Publishers,
    ping_interval: Duration,
) -> ChannelError {
    let (mut sink, mut stream) = ws.split();
    let mut pending: HashMap<String, Ack> = HashMap::new();
    let mut next_id: u64 = 0;

    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + ping_interval,
        ping_interval,
    );
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut reason = None;
    for record in &backlog {
        if let Err(err) = handle_record(record, &mut pending, publishers) {
            reason = Some(err);
            break;
        }
    }

    let reason = match reason {
        Some(reason) => reason,
        None => loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let ended = hub::split_records(&text)
                            .find_map(|record| handle_record(record, &mut pending, publishers).err());
                        if let Some(err) = ended {
                            break err;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let why = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "server closed the connection".to_string());
                        break ChannelError::Disconnected(why);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break ChannelError::Transport(err.to_string()),
                    None => break ChannelError::Disconnected("stream ended".to_string()),
                },
                Some(request) = outbound.recv() => {
                    next_id += 1;
                    let invocation_id = next_id.to_string();
                    let frame = match hub::encode_invocation(&invocation_id, request.target, &request.arguments) {
                        Ok(frame) => frame,
                        Err(err) => {
                            request.reject(err.into());
                            continue;
                        }
                    };
                    tracing::debug!(method = request.target, %invocation_id, "invoking hub method");
                    if let Err(err) = sink.send(Message::Text(frame)).await {
                        request.reject(ChannelError::Transport(err.to_string()));
                        break ChannelError::Transport(err.to_string());
                    }
                    pending.insert(invocation_id, request.ack);
                }
                _ = ping.tick() => {
                    if let Err(err) = sink.send(Message::Text(hub::encode_ping())).await {
                        break ChannelError::Transport(err.to_string());
                    }
                }
            }
        },
    };

    for (_, ack) in pending.drain() {
        let _ = ack.send(Err(ChannelError::Disconnected(reason.to_string())));
    }
    let _ = sink.close().await;
    reason
}

/// Handles one hub record. An `Err` means the server ended the session.
fn handle_record(
    record: &str,
    pending: &mut HashMap<String, Ack>,
    publishers: &Publishers,
) -> Result<(), ChannelError> {
    let message = match hub::decode_message(record) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(error = %err, "dropping undecodable hub record");
            return Ok(());
        }
    };
    match message {
        HubMessage::Invocation {
            target, arguments, ..
        } if target.eq_ignore_ascii_case(INVOCATION_TARGET) => {
            let Some(argument) = arguments.into_iter().next() else {
                tracing::warn!("invocation without arguments");
                return Ok(());
            };
            match serde_json::from_value::<CommandInvocation>(argument) {
                Ok(invocation) => {
                    tracing::info!(
                        invoked_by = %invocation.invoked_by,
                        command = %invocation.command_name,
                        kind = u8::from(invocation.kind),
                        "command invocation received"
                    );
                    publishers.status(format!(
                        "{} invoked command {}",
                        invocation.invoked_by, invocation.command_name
                    ));
                    let _ = publishers.invocations.send(invocation);
                }
                Err(err) => tracing::warn!(error = %err, "malformed command invocation"),
            }
        }
        HubMessage::Invocation { target, .. } => {
            tracing::debug!(method = %target, "ignoring unknown hub method");
        }
        HubMessage::Completion {
            invocation_id,
            result,
            error,
        } => match pending.remove(&invocation_id) {
            Some(ack) => {
                let outcome = match error {
                    Some(err) => Err(ChannelError::Rejected(err)),
                    None => Ok(result),
                };
                let _ = ack.send(outcome);
            }
            None => tracing::debug!(%invocation_id, "completion for unknown invocation"),
        },
        HubMessage::Ping => {}
        HubMessage::Close {
            error,
            allow_reconnect,
        } => {
            tracing::info!(?error, allow_reconnect, "hub sent close");
            return Err(ChannelError::Disconnected(
                error.unwrap_or_else(|| "server closed the connection".to_string()),
            ));
        }
        HubMessage::Ignored(kind) => tracing::debug!(kind, "ignoring hub message"),
    }
    Ok(())
}

fn next_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Adds up to 10% random spread so a fleet of overlays does not reconnect in
/// lockstep.
fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 10;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
