//! Mock Kodi for integration testing
//!
//! Simulates the JSON-RPC v6 interface at /jsonrpc with an in-memory
//! audio player, playlist and file library. Only the methods the bridge
//! drives are implemented; everything else answers "Method not found".

use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// In-memory Kodi state, driven by the RPC handlers and inspected by tests
struct MockKodiState {
    volume: i64,
    playlist: Vec<Value>,
    /// Playlist position of the active audio player, `None` while stopped
    position: Option<usize>,
    speed: i64,
    elapsed: f64,
    repeat: String,
    shuffled: bool,
    /// Directory path (no trailing separator) -> listing entries
    directories: HashMap<String, Vec<Value>>,
    /// File path -> full item, so playlist adds carry metadata
    tracks: HashMap<String, Value>,
}

impl MockKodiState {
    fn new() -> Self {
        Self {
            volume: 100,
            playlist: Vec::new(),
            position: None,
            speed: 0,
            elapsed: 0.0,
            repeat: "off".to_string(),
            shuffled: false,
            directories: HashMap::new(),
            tracks: HashMap::new(),
        }
    }

    fn is_directory(&self, path: &str) -> bool {
        self.directories.contains_key(trim_dir(path))
    }

    /// Resolve a Playlist.Add/Insert item descriptor into playlist entries.
    /// A "file" descriptor naming a directory is rejected the way Kodi
    /// rejects it, which is what the bridge's fallback keys on.
    fn resolve_item(&self, item: &Value) -> Result<Vec<Value>, RpcError> {
        if let Some(file) = item.get("file").and_then(Value::as_str) {
            if self.is_directory(file) {
                return Err(invalid_params());
            }
            let entry = self
                .tracks
                .get(file)
                .cloned()
                .unwrap_or_else(|| json!({"file": file}));
            return Ok(vec![entry]);
        }
        if let Some(dir) = item.get("directory").and_then(Value::as_str) {
            let entries = self
                .directories
                .get(trim_dir(dir))
                .ok_or_else(invalid_params)?;
            return Ok(entries
                .iter()
                .filter(|e| e.get("filetype").and_then(Value::as_str) != Some("directory"))
                .cloned()
                .collect());
        }
        Err(invalid_params())
    }

    fn current_duration(&self) -> f64 {
        self.position
            .and_then(|p| self.playlist.get(p))
            .and_then(|item| item.get("duration"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }
}

/// Mock Kodi server
pub struct MockKodiServer {
    addr: SocketAddr,
    state: Arc<RwLock<MockKodiState>>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl MockKodiServer {
    /// Start a mock Kodi on a random port
    pub async fn start() -> Self {
        let state = Arc::new(RwLock::new(MockKodiState::new()));

        let app = Router::new()
            .route("/jsonrpc", post(handle_jsonrpc))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
                .unwrap();
        });

        Self {
            addr,
            state,
            shutdown,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Register a directory node. `path` has no trailing separator;
    /// listings advertise it with one, the way Kodi file views do.
    pub async fn add_directory(&self, parent: &str, path: &str) {
        let mut state = self.state.write().await;
        state
            .directories
            .entry(trim_dir(parent).to_string())
            .or_default()
            .push(json!({"file": format!("{}/", path), "filetype": "directory"}));
        state.directories.entry(path.to_string()).or_default();
    }

    /// Register a music file under a directory
    pub async fn add_track(&self, dir: &str, file: &str, title: &str, artist: &str, duration: i64) {
        let item = json!({
            "file": file,
            "filetype": "file",
            "type": "song",
            "label": title,
            "title": title,
            "artist": [artist],
            "duration": duration,
        });
        let mut state = self.state.write().await;
        state
            .directories
            .entry(trim_dir(dir).to_string())
            .or_default()
            .push(item.clone());
        state.tracks.insert(file.to_string(), item);
    }

    pub async fn set_volume(&self, volume: i64) {
        self.state.write().await.volume = volume.clamp(0, 100);
    }

    pub async fn volume(&self) -> i64 {
        self.state.read().await.volume
    }

    pub async fn playlist_files(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .playlist
            .iter()
            .filter_map(|item| item.get("file").and_then(Value::as_str))
            .map(String::from)
            .collect()
    }

    pub async fn player_position(&self) -> Option<usize> {
        self.state.read().await.position
    }

    pub async fn speed(&self) -> i64 {
        self.state.read().await.speed
    }

    pub async fn elapsed(&self) -> f64 {
        self.state.read().await.elapsed
    }

    pub async fn repeat_mode(&self) -> String {
        self.state.read().await.repeat.clone()
    }

    pub async fn is_shuffled(&self) -> bool {
        self.state.read().await.shuffled
    }

    /// Stop the mock server. Keep-alive connections are closed before
    /// this returns, so clients cannot keep talking to a dead Kodi
    /// through a pooled connection.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

/// JSON-RPC request format
#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

type RpcError = (i64, String);

fn invalid_params() -> RpcError {
    (-32602, "Invalid params.".to_string())
}

fn trim_dir(path: &str) -> &str {
    path.trim_end_matches(['/', '\\'])
}

/// Kodi time objects are `{hours, minutes, seconds, milliseconds}`
fn seconds_to_time(seconds: f64) -> Value {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    json!({
        "hours": total_ms / 3_600_000,
        "minutes": total_ms % 3_600_000 / 60_000,
        "seconds": total_ms % 60_000 / 1000,
        "milliseconds": total_ms % 1000,
    })
}

fn time_to_seconds(value: &Value) -> f64 {
    let part = |key: &str| value.get(key).and_then(Value::as_f64).unwrap_or(0.0);
    part("hours") * 3600.0 + part("minutes") * 60.0 + part("seconds") + part("milliseconds") / 1000.0
}

/// Handle JSON-RPC requests
async fn handle_jsonrpc(
    State(state): State<Arc<RwLock<MockKodiState>>>,
    Json(request): Json<JsonRpcRequest>,
) -> Json<Value> {
    let params = &request.params;
    let outcome = dispatch(&state, &request.method, params).await;

    Json(match outcome {
        Ok(result) => json!({
            "jsonrpc": "2.0",
            "id": request.id,
            "result": result,
        }),
        Err((code, message)) => json!({
            "jsonrpc": "2.0",
            "id": request.id,
            "error": {"code": code, "message": message},
        }),
    })
}

async fn dispatch(
    state: &Arc<RwLock<MockKodiState>>,
    method: &str,
    params: &Value,
) -> Result<Value, RpcError> {
    match method {
        "Player.GetActivePlayers" => {
            let s = state.read().await;
            if s.position.is_some() {
                Ok(json!([{"playerid": 0, "type": "audio"}]))
            } else {
                Ok(json!([]))
            }
        }
        "Player.GetProperties" => {
            let s = state.read().await;
            Ok(json!({
                "position": s.position.map(|p| p as i64).unwrap_or(-1),
                "time": seconds_to_time(s.elapsed),
                "totaltime": seconds_to_time(s.current_duration()),
                "speed": s.speed,
                "repeat": s.repeat,
                "shuffled": s.shuffled,
            }))
        }
        "Player.Open" => {
            let position = params
                .get("item")
                .and_then(|i| i.get("position"))
                .and_then(Value::as_u64)
                .ok_or_else(invalid_params)? as usize;
            let mut s = state.write().await;
            if position >= s.playlist.len() {
                return Err(invalid_params());
            }
            s.position = Some(position);
            s.speed = 1;
            s.elapsed = 0.0;
            Ok(json!("OK"))
        }
        "Player.PlayPause" => {
            let mut s = state.write().await;
            match params.get("play") {
                Some(Value::Bool(true)) => s.speed = 1,
                Some(Value::Bool(false)) => s.speed = 0,
                _ => s.speed = if s.speed == 0 { 1 } else { 0 },
            }
            Ok(json!({"speed": s.speed}))
        }
        "Player.Stop" => {
            let mut s = state.write().await;
            s.position = None;
            s.speed = 0;
            s.elapsed = 0.0;
            Ok(json!("OK"))
        }
        "Player.GoTo" => {
            let mut s = state.write().await;
            match params.get("to") {
                Some(Value::String(dir)) if dir == "next" => {
                    match s.position.map(|p| p + 1) {
                        Some(next) if next < s.playlist.len() => s.position = Some(next),
                        _ => {
                            s.position = None;
                            s.speed = 0;
                        }
                    }
                }
                Some(Value::String(dir)) if dir == "previous" => {
                    if let Some(p) = s.position {
                        s.position = Some(p.saturating_sub(1));
                    }
                }
                Some(Value::Number(n)) => {
                    let target = n.as_u64().ok_or_else(invalid_params)? as usize;
                    if target >= s.playlist.len() {
                        return Err(invalid_params());
                    }
                    s.position = Some(target);
                }
                _ => return Err(invalid_params()),
            }
            s.elapsed = 0.0;
            Ok(json!("OK"))
        }
        "Player.Seek" => {
            let time = params
                .get("value")
                .and_then(|v| v.get("time"))
                .ok_or_else(invalid_params)?;
            let mut s = state.write().await;
            s.elapsed = time_to_seconds(time);
            Ok(json!({}))
        }
        "Player.SetShuffle" => {
            let shuffle = params
                .get("shuffle")
                .and_then(Value::as_bool)
                .ok_or_else(invalid_params)?;
            state.write().await.shuffled = shuffle;
            Ok(json!("OK"))
        }
        "Player.SetRepeat" => {
            let repeat = params
                .get("repeat")
                .and_then(Value::as_str)
                .ok_or_else(invalid_params)?;
            state.write().await.repeat = repeat.to_string();
            Ok(json!("OK"))
        }
        "Playlist.GetItems" => {
            let s = state.read().await;
            // Kodi omits "items" for an empty playlist
            if s.playlist.is_empty() {
                Ok(json!({"limits": {"start": 0, "end": 0, "total": 0}}))
            } else {
                Ok(json!({
                    "items": s.playlist,
                    "limits": {"start": 0, "end": s.playlist.len(), "total": s.playlist.len()},
                }))
            }
        }
        "Playlist.Add" => {
            let item = params.get("item").ok_or_else(invalid_params)?;
            let mut s = state.write().await;
            let entries = s.resolve_item(item)?;
            s.playlist.extend(entries);
            Ok(json!("OK"))
        }
        "Playlist.Insert" => {
            let item = params.get("item").ok_or_else(invalid_params)?;
            let position = params
                .get("position")
                .and_then(Value::as_u64)
                .ok_or_else(invalid_params)? as usize;
            let mut s = state.write().await;
            if position > s.playlist.len() {
                return Err(invalid_params());
            }
            let entries = s.resolve_item(item)?;
            s.playlist.splice(position..position, entries);
            Ok(json!("OK"))
        }
        "Playlist.Remove" => {
            let position = params
                .get("position")
                .and_then(Value::as_u64)
                .ok_or_else(invalid_params)? as usize;
            let mut s = state.write().await;
            if position >= s.playlist.len() {
                return Err(invalid_params());
            }
            s.playlist.remove(position);
            if s.playlist.is_empty() {
                s.position = None;
                s.speed = 0;
            } else if let Some(p) = s.position {
                if position < p {
                    s.position = Some(p - 1);
                } else if p >= s.playlist.len() {
                    s.position = Some(s.playlist.len() - 1);
                }
            }
            Ok(json!("OK"))
        }
        "Playlist.Clear" => {
            let mut s = state.write().await;
            s.playlist.clear();
            s.position = None;
            s.speed = 0;
            s.elapsed = 0.0;
            Ok(json!("OK"))
        }
        "Playlist.Swap" => {
            let pos = |key: &str| {
                params
                    .get(key)
                    .and_then(Value::as_u64)
                    .map(|p| p as usize)
                    .ok_or_else(invalid_params)
            };
            let (a, b) = (pos("position1")?, pos("position2")?);
            let mut s = state.write().await;
            if a >= s.playlist.len() || b >= s.playlist.len() {
                return Err(invalid_params());
            }
            s.playlist.swap(a, b);
            // The playing item moves with the swap
            if s.position == Some(a) {
                s.position = Some(b);
            } else if s.position == Some(b) {
                s.position = Some(a);
            }
            Ok(json!("OK"))
        }
        "Application.GetProperties" => {
            let s = state.read().await;
            Ok(json!({"volume": s.volume, "muted": false}))
        }
        "Application.SetVolume" => {
            let volume = params
                .get("volume")
                .and_then(Value::as_i64)
                .ok_or_else(invalid_params)?;
            let mut s = state.write().await;
            s.volume = volume.clamp(0, 100);
            Ok(json!(s.volume))
        }
        "Files.GetDirectory" => {
            let directory = params
                .get("directory")
                .and_then(Value::as_str)
                .ok_or_else(invalid_params)?;
            let s = state.read().await;
            let entries = s
                .directories
                .get(trim_dir(directory))
                .ok_or_else(invalid_params)?;
            Ok(json!({
                "files": entries,
                "limits": {"start": 0, "end": entries.len(), "total": entries.len()},
            }))
        }
        _ => Err((-32601, "Method not found.".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn rpc(addr: &SocketAddr, method: &str, params: Value) -> Value {
        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{}/jsonrpc", addr))
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await
            .unwrap();
        response.json().await.unwrap()
    }

    #[tokio::test]
    async fn mock_kodi_starts_and_stops() {
        let server = MockKodiServer::start().await;
        assert!(server.addr().port() > 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn mock_kodi_rejects_directory_added_as_file() {
        let server = MockKodiServer::start().await;
        server.add_directory("/music", "/music/Albums").await;
        server
            .add_track("/music/Albums", "/music/Albums/a.mp3", "A", "B", 60)
            .await;
        let addr = server.addr();

        let body = rpc(
            &addr,
            "Playlist.Add",
            json!({"playlistid": 0, "item": {"file": "/music/Albums"}}),
        )
        .await;
        assert_eq!(body["error"]["code"], -32602);

        let body = rpc(
            &addr,
            "Playlist.Add",
            json!({"playlistid": 0, "item": {"directory": "/music/Albums"}}),
        )
        .await;
        assert!(body.get("error").is_none());
        assert_eq!(server.playlist_files().await, vec!["/music/Albums/a.mp3"]);

        server.stop().await;
    }

    #[tokio::test]
    async fn mock_kodi_player_lifecycle() {
        let server = MockKodiServer::start().await;
        server.add_directory("/music", "/music/Albums").await;
        server
            .add_track("/music/Albums", "/music/Albums/a.mp3", "A", "B", 60)
            .await;
        let addr = server.addr();

        rpc(
            &addr,
            "Playlist.Add",
            json!({"playlistid": 0, "item": {"file": "/music/Albums/a.mp3"}}),
        )
        .await;

        let body = rpc(&addr, "Player.GetActivePlayers", json!({})).await;
        assert_eq!(body["result"].as_array().unwrap().len(), 0);

        rpc(
            &addr,
            "Player.Open",
            json!({"item": {"playlistid": 0, "position": 0}}),
        )
        .await;
        let body = rpc(&addr, "Player.GetActivePlayers", json!({})).await;
        assert_eq!(body["result"][0]["type"], "audio");
        assert_eq!(server.player_position().await, Some(0));
        assert_eq!(server.speed().await, 1);

        rpc(&addr, "Player.Stop", json!({"playerid": 0})).await;
        assert_eq!(server.player_position().await, None);

        server.stop().await;
    }
}
