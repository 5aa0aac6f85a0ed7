//! Local stand-in for the stream-source backend.
//!
//! Serves the hub endpoint and the file API on one port, acknowledges logins
//! and pushes invocations typed on stdin to every connected client:
//!
//! ```text
//! sound bell.mp3
//! visual file://bg.png\ntext=Hello\nduration=3000
//! skip
//! command <name>
//! ```

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use uuid::Uuid;

const RECORD_SEPARATOR: char = '\u{1e}';
const DEFAULT_ADDR: &str = "127.0.0.1:5000";
const HUB_PATH: &str = "/hub/stream-source";
const INVOCATION_TARGET: &str = "SoundCommandReceived";

const TYPE_INVOCATION: u8 = 1;
const TYPE_COMPLETION: u8 = 3;
const TYPE_PING: u8 = 6;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Invocation {
    #[serde(rename = "type")]
    kind: u8,
    invoked_by: String,
    invoked_from: String,
    command_name: String,
    payload_to_play: String,
    invoked_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingRecord {
    #[serde(rename = "type", default)]
    kind: u8,
    #[serde(default)]
    invocation_id: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
}

#[derive(Clone)]
struct DevState {
    files: Arc<PathBuf>,
    pushes: broadcast::Sender<String>,
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn record(body: &Value) -> String {
    format!("{body}{RECORD_SEPARATOR}")
}

fn make_invocation(kind: u8, command_name: &str, payload: &str) -> Invocation {
    Invocation {
        kind,
        invoked_by: "hub-dev-server".to_string(),
        invoked_from: "stdin".to_string(),
        command_name: command_name.to_string(),
        payload_to_play: payload.to_string(),
        invoked_at: now_unix_ms().to_string(),
    }
}

/// Turns a stdin line into an invocation. `None` for blank or unknown input.
fn parse_line(line: &str) -> Option<Invocation> {
    let line = line.trim();
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match verb {
        "sound" if !rest.is_empty() => Some(make_invocation(0, "sound", rest)),
        "visual" if !rest.is_empty() => {
            Some(make_invocation(1, "visual", &rest.replace("\\n", "\n")))
        }
        // Control commands are dispatched on the payload, not the name.
        "skip" => Some(make_invocation(0xff, "skip", "skip")),
        "command" if !rest.is_empty() => Some(make_invocation(0xff, rest, rest)),
        _ => None,
    }
}

fn push_record(invocation: &Invocation) -> Result<String, serde_json::Error> {
    Ok(record(&json!({
        "type": TYPE_INVOCATION,
        "target": INVOCATION_TARGET,
        "arguments": [serde_json::to_value(invocation)?],
    })))
}

async fn negotiate() -> Json<Value> {
    let id = Uuid::new_v4().to_string();
    Json(json!({
        "connectionId": id,
        "connectionToken": id,
        "negotiateVersion": 1,
        "availableTransports": [{
            "transport": "WebSockets",
            "transferFormats": ["Text"],
        }],
    }))
}

async fn hub_handler(ws: WebSocketUpgrade, State(state): State<DevState>) -> Response {
    ws.on_upgrade(move |socket| handle_hub_socket(socket, state))
}

async fn handle_hub_socket(mut socket: WebSocket, state: DevState) {
    let mut pushes = state.pushes.subscribe();
    let mut handshaken = false;
    println!("hub-dev-server: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(frame) = msg else { continue };
                for raw in frame.split(RECORD_SEPARATOR).filter(|r| !r.trim().is_empty()) {
                    if !handshaken {
                        handshaken = true;
                        println!("<- handshake {raw}");
                        if socket.send(Message::Text(record(&json!({})))).await.is_err() {
                            return;
                        }
                        continue;
                    }
                    let Some(reply) = reply_to(raw) else { continue };
                    if socket.send(Message::Text(reply)).await.is_err() {
                        return;
                    }
                }
            }
            pushed = pushes.recv() => {
                match pushed {
                    Ok(frame) => {
                        if !handshaken {
                            continue;
                        }
                        if socket.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    println!("hub-dev-server: client disconnected");
}

/// Completion for client calls, pong for pings, nothing otherwise.
fn reply_to(raw: &str) -> Option<String> {
    let incoming: IncomingRecord = match serde_json::from_str(raw) {
        Ok(incoming) => incoming,
        Err(err) => {
            eprintln!("hub-dev-server: bad record: {err}");
            return None;
        }
    };
    match incoming.kind {
        TYPE_PING => Some(record(&json!({ "type": TYPE_PING }))),
        TYPE_INVOCATION => {
            let target = incoming.target.unwrap_or_default();
            println!(
                "<- {} {}",
                target,
                serde_json::to_string(&incoming.arguments).unwrap_or_default()
            );
            let id = incoming.invocation_id?;
            Some(record(&json!({
                "type": TYPE_COMPLETION,
                "invocationId": id,
                "result": null,
            })))
        }
        _ => None,
    }
}

async fn file_handler(
    State(state): State<DevState>,
    Path(channel): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let Some(file_name) = query.get("fileName") else {
        return (StatusCode::BAD_REQUEST, "missing fileName").into_response();
    };
    let has_key = headers.contains_key("x-api-key") || query.contains_key("apiKey");
    if !has_key {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if file_name.contains("..") || file_name.contains('/') || file_name.contains('\\') {
        return StatusCode::BAD_REQUEST.into_response();
    }
    match tokio::fs::read(state.files.join(file_name)).await {
        Ok(bytes) => {
            println!("-> file {channel}/{file_name} ({} bytes)", bytes.len());
            (
                [(header::CONTENT_TYPE, "application/octet-stream")],
                bytes,
            )
                .into_response()
        }
        Err(_) => (StatusCode::NOT_FOUND, format!("no such file: {file_name}")).into_response(),
    }
}

async fn sound_commands_handler(State(state): State<DevState>) -> Json<Value> {
    let mut commands = Vec::new();
    if let Ok(mut dir) = tokio::fs::read_dir(state.files.as_path()).await {
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let command = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(&name);
            commands.push(json!({ "commandName": command, "payloadToPlay": name }));
        }
    }
    Json(Value::Array(commands))
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let files = PathBuf::from(args.next().unwrap_or_else(|| ".".to_string()));
    let addr = args.next().unwrap_or_else(|| DEFAULT_ADDR.to_string());

    let (pushes, _) = broadcast::channel(64);
    let state = DevState {
        files: Arc::new(files),
        pushes: pushes.clone(),
    };

    let app = Router::new()
        .route(HUB_PATH, get(hub_handler))
        .route(&format!("{HUB_PATH}/negotiate"), post(negotiate))
        .route("/api/v2/stream-source/:channel/file", get(file_handler))
        .route(
            "/api/v2/stream-source/:channel/sound-commands",
            get(sound_commands_handler),
        )
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    println!(
        "hub-dev-server: listening on http://{} serving {}",
        listener.local_addr()?,
        state.files.display()
    );

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Some(invocation) = parse_line(&line) else {
                if !line.trim().is_empty() {
                    eprintln!("usage: sound <file> | visual <payload> | skip | command <name>");
                }
                continue;
            };
            match push_record(&invocation) {
                Ok(frame) => {
                    let receivers = pushes.send(frame).unwrap_or(0);
                    println!(
                        "-> {} {:?} ({receivers} clients)",
                        invocation.command_name, invocation.payload_to_play
                    );
                }
                Err(err) => eprintln!("hub-dev-server: encode failed: {err}"),
            }
        }
    });

    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    run().await
}
