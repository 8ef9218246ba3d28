//! Kodi JSON-RPC client
//!
//! Speaks JSON-RPC 2.0 over HTTP POST against Kodi's `/jsonrpc`
//! endpoint. One thin wrapper per method this bridge drives; response
//! payloads are picked apart by hand since Kodi omits absent fields
//! rather than nulling them.
//!
//! Kodi assigns fixed ids to its players and playlists: audio is 0 for
//! both. Everything here operates on the audio pair.

use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Kodi's audio playlist id.
pub const AUDIO_PLAYLIST_ID: i64 = 0;
/// Kodi's audio player id.
pub const AUDIO_PLAYER_ID: i64 = 0;

/// Request id tagged on every call (aids correlation in Kodi's debug log).
const REQUEST_ID: i32 = 808;

/// JSON-RPC "invalid params" error code. Kodi answers with it when an
/// item descriptor does not fit the path kind, which is how file vs
/// directory adds are told apart.
const RPC_INVALID_PARAMS: i64 = -32602;

/// Item properties requested for playlist and directory entries.
const ITEM_PROPERTIES: [&str; 8] = [
    "title", "artist", "album", "genre", "year", "track", "duration", "file",
];

#[derive(Debug, Error)]
pub enum KodiError {
    #[error("kodi unreachable: {0}")]
    Unavailable(reqwest::Error),
    #[error("kodi protocol error: {0}")]
    Protocol(String),
    #[error("kodi error {code}: {message}")]
    Rpc { code: i64, message: String },
}

impl KodiError {
    /// Transport-level failure, as opposed to Kodi rejecting a request.
    /// Drives the cache staleness path.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, KodiError::Unavailable(_))
    }
}

/// One entry of a Kodi playlist or directory listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KodiItem {
    pub file: String,
    /// Kodi library id, absent for ad-hoc file entries.
    pub id: Option<i64>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub year: Option<u32>,
    pub track: Option<u32>,
    pub duration: Option<f64>,
}

/// A directory listing split the way the MPD surface needs it.
#[derive(Debug, Clone, Default)]
pub struct DirectoryListing {
    pub dirs: Vec<String>,
    pub files: Vec<KodiItem>,
    pub playlists: Vec<String>,
}

/// Playback-session properties of the active audio player.
#[derive(Debug, Clone)]
pub struct ActivePlayer {
    pub player_id: i64,
    /// Playlist position of the current item, absent while Kodi reports -1.
    pub position: Option<usize>,
    pub elapsed: f64,
    pub duration: f64,
    pub paused: bool,
    /// Kodi repeat mode: "off", "one" or "all".
    pub repeat: String,
    pub shuffled: bool,
}

/// Remote-side view assembled from several calls, consumed by the state
/// cache. `player` is `None` when no audio player is active.
#[derive(Debug, Clone, Default)]
pub struct KodiSnapshot {
    pub volume: u8,
    pub player: Option<ActivePlayer>,
    pub items: Vec<KodiItem>,
}

/// Target of a `Player.GoTo` call.
#[derive(Debug, Clone, Copy)]
pub enum GoTo {
    Next,
    Previous,
    Position(usize),
}

#[derive(Clone)]
pub struct KodiClient {
    client: Client,
    url: String,
    auth: Option<(String, String)>,
}

impl KodiClient {
    pub fn new(host: &str, port: u16, username: Option<String>, password: Option<String>) -> Self {
        #[allow(clippy::expect_used)] // HTTP client creation only fails if TLS setup fails
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            url: format!("http://{}:{}/jsonrpc", host, port),
            auth: username.zip(password),
        }
    }

    /// Execute one JSON-RPC call and return its `result` member.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, KodiError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": REQUEST_ID,
            "method": method,
            "params": params,
        });

        debug!(method, params = ?body["params"], "kodi request");

        let mut request = self.client.post(&self.url).json(&body);
        if let Some((username, password)) = &self.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await.map_err(KodiError::Unavailable)?;
        if !response.status().is_success() {
            return Err(KodiError::Protocol(format!(
                "http status {}",
                response.status()
            )));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| KodiError::Protocol(format!("undecodable response: {}", e)))?;

        if let Some(error) = data.get("error") {
            if !error.is_null() {
                return Err(KodiError::Rpc {
                    code: error.get("code").and_then(|v| v.as_i64()).unwrap_or(0),
                    message: error
                        .get("message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unspecified error")
                        .to_string(),
                });
            }
        }

        debug!(method, result = ?data.get("result"), "kodi response");

        match data.get("result") {
            Some(result) => Ok(result.clone()),
            None => Err(KodiError::Protocol("response missing result".to_string())),
        }
    }

    /// Id of the active audio player, `None` when playback is stopped.
    pub async fn active_player(&self) -> Result<Option<i64>, KodiError> {
        let result = self.call("Player.GetActivePlayers", json!({})).await?;
        let players = result.as_array().cloned().unwrap_or_default();
        Ok(players
            .iter()
            .find(|p| p.get("type").and_then(|v| v.as_str()) == Some("audio"))
            .and_then(|p| p.get("playerid"))
            .and_then(|v| v.as_i64()))
    }

    pub async fn player_properties(&self, player_id: i64) -> Result<ActivePlayer, KodiError> {
        let result = self
            .call(
                "Player.GetProperties",
                json!({
                    "playerid": player_id,
                    "properties": ["position", "time", "totaltime", "speed", "repeat", "shuffled"],
                }),
            )
            .await?;

        let position = result
            .get("position")
            .and_then(|v| v.as_i64())
            .and_then(|p| usize::try_from(p).ok());

        Ok(ActivePlayer {
            player_id,
            position,
            elapsed: time_to_seconds(result.get("time")),
            duration: time_to_seconds(result.get("totaltime")),
            paused: result.get("speed").and_then(|v| v.as_i64()).unwrap_or(0) == 0,
            repeat: result
                .get("repeat")
                .and_then(|v| v.as_str())
                .unwrap_or("off")
                .to_string(),
            shuffled: result
                .get("shuffled")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })
    }

    pub async fn get_volume(&self) -> Result<u8, KodiError> {
        let result = self
            .call(
                "Application.GetProperties",
                json!({"properties": ["volume"]}),
            )
            .await?;
        let volume = result
            .get("volume")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| KodiError::Protocol("missing volume".to_string()))?;
        Ok(volume.clamp(0, 100) as u8)
    }

    pub async fn set_volume(&self, volume: u8) -> Result<(), KodiError> {
        self.call("Application.SetVolume", json!({"volume": volume}))
            .await?;
        Ok(())
    }

    pub async fn playlist_items(&self) -> Result<Vec<KodiItem>, KodiError> {
        let result = self
            .call(
                "Playlist.GetItems",
                json!({
                    "playlistid": AUDIO_PLAYLIST_ID,
                    "properties": ITEM_PROPERTIES,
                }),
            )
            .await?;

        // Kodi omits "items" entirely for an empty playlist
        Ok(result
            .get("items")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().map(parse_item).collect())
            .unwrap_or_default())
    }

    /// Append a path to the audio playlist. Tried as a file first; when
    /// Kodi rejects the descriptor shape the path names a directory, so
    /// retry as one.
    pub async fn playlist_add(&self, path: &str) -> Result<(), KodiError> {
        let file = json!({
            "playlistid": AUDIO_PLAYLIST_ID,
            "item": {"file": path},
        });
        match self.call("Playlist.Add", file).await {
            Ok(_) => Ok(()),
            Err(KodiError::Rpc { code, .. }) if code == RPC_INVALID_PARAMS => {
                let dir = json!({
                    "playlistid": AUDIO_PLAYLIST_ID,
                    "item": {"directory": path},
                });
                self.call("Playlist.Add", dir).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Insert a path before `position`, with the same file-then-directory
    /// fallback as [`playlist_add`](Self::playlist_add).
    pub async fn playlist_insert(&self, position: usize, path: &str) -> Result<(), KodiError> {
        let file = json!({
            "playlistid": AUDIO_PLAYLIST_ID,
            "position": position,
            "item": {"file": path},
        });
        match self.call("Playlist.Insert", file).await {
            Ok(_) => Ok(()),
            Err(KodiError::Rpc { code, .. }) if code == RPC_INVALID_PARAMS => {
                let dir = json!({
                    "playlistid": AUDIO_PLAYLIST_ID,
                    "position": position,
                    "item": {"directory": path},
                });
                self.call("Playlist.Insert", dir).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn playlist_remove(&self, position: usize) -> Result<(), KodiError> {
        self.call(
            "Playlist.Remove",
            json!({"playlistid": AUDIO_PLAYLIST_ID, "position": position}),
        )
        .await?;
        Ok(())
    }

    pub async fn playlist_clear(&self) -> Result<(), KodiError> {
        self.call("Playlist.Clear", json!({"playlistid": AUDIO_PLAYLIST_ID}))
            .await?;
        Ok(())
    }

    pub async fn playlist_swap(&self, position1: usize, position2: usize) -> Result<(), KodiError> {
        self.call(
            "Playlist.Swap",
            json!({
                "playlistid": AUDIO_PLAYLIST_ID,
                "position1": position1,
                "position2": position2,
            }),
        )
        .await?;
        Ok(())
    }

    /// Start playback of the audio playlist at `position`.
    pub async fn open_position(&self, position: usize) -> Result<(), KodiError> {
        self.call(
            "Player.Open",
            json!({"item": {"playlistid": AUDIO_PLAYLIST_ID, "position": position}}),
        )
        .await?;
        Ok(())
    }

    /// `play` of `None` toggles, `Some(true)` resumes, `Some(false)` pauses.
    pub async fn play_pause(&self, player_id: i64, play: Option<bool>) -> Result<(), KodiError> {
        let play = match play {
            Some(flag) => json!(flag),
            None => json!("toggle"),
        };
        self.call(
            "Player.PlayPause",
            json!({"playerid": player_id, "play": play}),
        )
        .await?;
        Ok(())
    }

    pub async fn stop(&self, player_id: i64) -> Result<(), KodiError> {
        self.call("Player.Stop", json!({"playerid": player_id}))
            .await?;
        Ok(())
    }

    pub async fn go_to(&self, player_id: i64, target: GoTo) -> Result<(), KodiError> {
        let to = match target {
            GoTo::Next => json!("next"),
            GoTo::Previous => json!("previous"),
            GoTo::Position(position) => json!(position),
        };
        self.call("Player.GoTo", json!({"playerid": player_id, "to": to}))
            .await?;
        Ok(())
    }

    /// Absolute seek within the current item.
    pub async fn seek_to(&self, player_id: i64, seconds: f64) -> Result<(), KodiError> {
        self.call(
            "Player.Seek",
            json!({"playerid": player_id, "value": {"time": seconds_to_time(seconds)}}),
        )
        .await?;
        Ok(())
    }

    pub async fn set_shuffle(&self, player_id: i64, shuffle: bool) -> Result<(), KodiError> {
        self.call(
            "Player.SetShuffle",
            json!({"playerid": player_id, "shuffle": shuffle}),
        )
        .await?;
        Ok(())
    }

    /// `repeat` is one of Kodi's modes: "off", "one" or "all".
    pub async fn set_repeat(&self, player_id: i64, repeat: &str) -> Result<(), KodiError> {
        self.call(
            "Player.SetRepeat",
            json!({"playerid": player_id, "repeat": repeat}),
        )
        .await?;
        Ok(())
    }

    /// List a Kodi directory, split into subdirectories, music files and
    /// playlist nodes. Directory nodes carry a trailing separator; nodes
    /// typed "directory" without one are playlists (smart playlists and
    /// the like).
    pub async fn get_directory(&self, directory: &str) -> Result<DirectoryListing, KodiError> {
        let result = self
            .call(
                "Files.GetDirectory",
                json!({
                    "directory": directory,
                    "media": "music",
                    "properties": ITEM_PROPERTIES,
                }),
            )
            .await?;

        let mut listing = DirectoryListing::default();
        let entries = result.get("files").and_then(|v| v.as_array());
        for entry in entries.into_iter().flatten() {
            let file = entry.get("file").and_then(|v| v.as_str()).unwrap_or("");
            if entry.get("filetype").and_then(|v| v.as_str()) == Some("directory") {
                if file.ends_with('/') || file.ends_with('\\') {
                    listing.dirs.push(file.to_string());
                } else {
                    listing.playlists.push(file.to_string());
                }
            } else {
                listing.files.push(parse_item(entry));
            }
        }
        Ok(listing)
    }

    /// Assemble the full remote view the state cache mirrors.
    pub async fn snapshot(&self) -> Result<KodiSnapshot, KodiError> {
        let volume = self.get_volume().await?;
        let items = self.playlist_items().await?;
        let player = match self.active_player().await? {
            Some(player_id) => Some(self.player_properties(player_id).await?),
            None => None,
        };
        Ok(KodiSnapshot {
            volume,
            player,
            items,
        })
    }
}

fn parse_item(value: &Value) -> KodiItem {
    KodiItem {
        file: value
            .get("file")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        id: value.get("id").and_then(|v| v.as_i64()),
        title: non_empty(value.get("title")),
        artist: join_multi(value.get("artist")),
        album: non_empty(value.get("album")),
        genre: join_multi(value.get("genre")),
        year: positive_u32(value.get("year")),
        track: positive_u32(value.get("track")),
        duration: value
            .get("duration")
            .and_then(|v| v.as_f64())
            .filter(|d| *d > 0.0),
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Kodi reports artist and genre as string arrays; older item shapes use
/// a plain string.
fn join_multi(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(values) => {
            let parts: Vec<&str> = values
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(", "))
            }
        }
        _ => None,
    }
}

/// Kodi uses 0 for unset year and track numbers.
fn positive_u32(value: Option<&Value>) -> Option<u32> {
    value
        .and_then(|v| v.as_u64())
        .filter(|n| *n > 0)
        .and_then(|n| u32::try_from(n).ok())
}

/// Kodi time objects are `{hours, minutes, seconds, milliseconds}`.
fn time_to_seconds(value: Option<&Value>) -> f64 {
    let Some(t) = value else { return 0.0 };
    let part = |key: &str| t.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0);
    part("hours") * 3600.0 + part("minutes") * 60.0 + part("seconds") + part("milliseconds") / 1000.0
}

fn seconds_to_time(seconds: f64) -> Value {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    json!({
        "hours": total_ms / 3_600_000,
        "minutes": total_ms % 3_600_000 / 60_000,
        "seconds": total_ms % 60_000 / 1000,
        "milliseconds": total_ms % 1000,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_to_seconds() {
        let t = json!({"hours": 1, "minutes": 2, "seconds": 3, "milliseconds": 500});
        assert_eq!(time_to_seconds(Some(&t)), 3723.5);
        assert_eq!(time_to_seconds(None), 0.0);
    }

    #[test]
    fn test_seconds_to_time() {
        assert_eq!(
            seconds_to_time(3723.5),
            json!({"hours": 1, "minutes": 2, "seconds": 3, "milliseconds": 500})
        );
        // Negative input clamps to zero rather than wrapping
        assert_eq!(
            seconds_to_time(-5.0),
            json!({"hours": 0, "minutes": 0, "seconds": 0, "milliseconds": 0})
        );
    }

    #[test]
    fn test_parse_item_full() {
        let value = json!({
            "file": "/big/music/a.mp3",
            "id": 17,
            "title": "A Song",
            "artist": ["First", "Second"],
            "album": "An Album",
            "genre": ["Rock"],
            "year": 1999,
            "track": 4,
            "duration": 215,
        });
        let item = parse_item(&value);
        assert_eq!(item.file, "/big/music/a.mp3");
        assert_eq!(item.id, Some(17));
        assert_eq!(item.title.as_deref(), Some("A Song"));
        assert_eq!(item.artist.as_deref(), Some("First, Second"));
        assert_eq!(item.genre.as_deref(), Some("Rock"));
        assert_eq!(item.year, Some(1999));
        assert_eq!(item.track, Some(4));
        assert_eq!(item.duration, Some(215.0));
    }

    #[test]
    fn test_parse_item_empty_fields_become_none() {
        let value = json!({
            "file": "/big/music/b.mp3",
            "title": "",
            "artist": [],
            "year": 0,
            "track": 0,
            "duration": 0,
        });
        let item = parse_item(&value);
        assert_eq!(item.id, None);
        assert_eq!(item.title, None);
        assert_eq!(item.artist, None);
        assert_eq!(item.year, None);
        assert_eq!(item.track, None);
        assert_eq!(item.duration, None);
    }

    #[test]
    fn test_parse_item_legacy_string_artist() {
        let value = json!({"file": "x.mp3", "artist": "Solo"});
        assert_eq!(parse_item(&value).artist.as_deref(), Some("Solo"));
    }
}
