//! Cached view of the Kodi player
//!
//! All MPD reads are served from here; Kodi is only consulted by
//! `refresh`. Refreshes diff the new remote view against the previous
//! one and broadcast one notification per changed subsystem, which is
//! what `idle` sessions wait on.
//!
//! A refresh that cannot reach Kodi leaves the last snapshot in place
//! and marks it stale. After three consecutive failures the cached
//! state degrades to stopped with an empty playlist, so clients see a
//! quiet player instead of a frozen one.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::kodi::{KodiClient, KodiError, KodiItem, KodiSnapshot};
use crate::paths::PathTranslator;

/// Consecutive failed refreshes tolerated before the cached state
/// degrades to stopped.
const DEGRADE_AFTER_FAILURES: u32 = 3;

/// Notification channel capacity. Sessions drain eagerly; a lagged
/// receiver over-reports rather than losing changes.
const NOTIFY_CAPACITY: usize = 64;

/// MPD idle subsystems this bridge can signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Player,
    Playlist,
    Mixer,
    Options,
    Update,
}

impl Subsystem {
    pub const ALL: [Subsystem; 5] = [
        Subsystem::Player,
        Subsystem::Playlist,
        Subsystem::Mixer,
        Subsystem::Options,
        Subsystem::Update,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Subsystem::Player => "player",
            Subsystem::Playlist => "playlist",
            Subsystem::Mixer => "mixer",
            Subsystem::Options => "options",
            Subsystem::Update => "update",
        }
    }

    pub fn parse(name: &str) -> Option<Subsystem> {
        Subsystem::ALL.iter().copied().find(|s| s.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

impl PlayerState {
    pub fn as_mpd(&self) -> &'static str {
        match self {
            PlayerState::Stopped => "stop",
            PlayerState::Playing => "play",
            PlayerState::Paused => "pause",
        }
    }
}

/// Player status as MPD models it. `song`, `elapsed` and `duration` are
/// present exactly when the state is not stopped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackStatus {
    pub state: PlayerState,
    /// 0-100; `None` until the first successful refresh.
    pub volume: Option<u8>,
    pub playlist_version: u64,
    pub song: Option<usize>,
    pub elapsed: Option<f64>,
    pub duration: Option<f64>,
    pub random: bool,
    pub repeat: bool,
    pub single: bool,
}

/// One queue entry, with its path already in MPD form.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    pub file: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub year: Option<u32>,
    pub track: Option<u32>,
    pub duration: Option<f64>,
}

impl PlaylistEntry {
    pub fn from_item(file: String, item: &KodiItem) -> Self {
        Self {
            file,
            title: item.title.clone(),
            artist: item.artist.clone(),
            album: item.album.clone(),
            genre: item.genre.clone(),
            year: item.year,
            track: item.track,
            duration: item.duration,
        }
    }
}

/// Point-in-time copy of everything the protocol layer reads.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub status: PlaybackStatus,
    pub playlist: Vec<PlaylistEntry>,
}

struct Inner {
    snapshot: Snapshot,
    stale: bool,
    consecutive_failures: u32,
}

pub struct StateCache {
    kodi: KodiClient,
    paths: PathTranslator,
    inner: RwLock<Inner>,
    /// Serializes refreshes so concurrent commands cannot interleave
    /// fetch and commit.
    refresh_lock: Mutex<()>,
    notify: broadcast::Sender<Subsystem>,
}

pub type SharedCache = Arc<StateCache>;

impl StateCache {
    pub fn new(kodi: KodiClient, paths: PathTranslator) -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            kodi,
            paths,
            inner: RwLock::new(Inner {
                snapshot: Snapshot {
                    status: PlaybackStatus {
                        playlist_version: 1,
                        ..PlaybackStatus::default()
                    },
                    playlist: Vec::new(),
                },
                stale: false,
                consecutive_failures: 0,
            }),
            refresh_lock: Mutex::new(()),
            notify,
        }
    }

    pub fn shared(kodi: KodiClient, paths: PathTranslator) -> SharedCache {
        Arc::new(Self::new(kodi, paths))
    }

    /// Current snapshot plus its staleness flag. Never touches Kodi.
    pub async fn read(&self) -> (Snapshot, bool) {
        let inner = self.inner.read().await;
        (inner.snapshot.clone(), inner.stale)
    }

    /// Subscribe to subsystem change notifications. Sessions subscribe at
    /// connect time so changes queue up between `idle` commands.
    pub fn subscribe(&self) -> broadcast::Receiver<Subsystem> {
        self.notify.subscribe()
    }

    pub async fn refresh(&self) -> Result<(), KodiError> {
        self.refresh_with(&[]).await
    }

    /// Refresh from Kodi. `forced` subsystems are signalled even when
    /// the diff sees no change; command handlers use this for effects
    /// diffing cannot observe, like a seek within the same song.
    pub async fn refresh_with(&self, forced: &[Subsystem]) -> Result<(), KodiError> {
        let _serial = self.refresh_lock.lock().await;

        let fetched = match self.kodi.snapshot().await {
            Ok(fetched) => fetched,
            Err(e) => {
                if e.is_unavailable() {
                    self.note_failure().await;
                }
                return Err(e);
            }
        };

        let playlist: Vec<PlaylistEntry> =
            fetched.items.iter().map(|item| self.entry_for(item)).collect();
        let mut status = derive_status(&fetched, &playlist);

        let mut changed;
        {
            let mut inner = self.inner.write().await;
            inner.stale = false;
            inner.consecutive_failures = 0;

            let old = &inner.snapshot;
            let composition_changed = old.playlist.len() != playlist.len()
                || old
                    .playlist
                    .iter()
                    .zip(playlist.iter())
                    .any(|(a, b)| a.file != b.file);
            status.playlist_version = if composition_changed {
                old.status.playlist_version + 1
            } else {
                old.status.playlist_version
            };

            changed = diff_subsystems(&old.status, &status, composition_changed);
            inner.snapshot = Snapshot { status, playlist };
        }

        for sub in forced {
            if !changed.contains(sub) {
                changed.push(*sub);
            }
        }
        for sub in changed {
            // No receivers is fine; nobody is idling
            let _ = self.notify.send(sub);
        }
        Ok(())
    }

    /// Record an unreachable Kodi. At the degrade threshold the cached
    /// state collapses to stopped and the playlist empties, once.
    async fn note_failure(&self) {
        let mut changed = Vec::new();
        {
            let mut guard = self.inner.write().await;
            // Borrow the target, not the guard, so the status and
            // playlist borrows below can split
            let inner = &mut *guard;
            inner.consecutive_failures += 1;
            inner.stale = true;
            if inner.consecutive_failures == DEGRADE_AFTER_FAILURES {
                warn!(
                    "kodi unreachable for {} refreshes, degrading to stopped",
                    DEGRADE_AFTER_FAILURES
                );
                let status = &mut inner.snapshot.status;
                if status.state != PlayerState::Stopped {
                    changed.push(Subsystem::Player);
                }
                status.state = PlayerState::Stopped;
                status.song = None;
                status.elapsed = None;
                status.duration = None;
                if !inner.snapshot.playlist.is_empty() {
                    inner.snapshot.playlist.clear();
                    status.playlist_version += 1;
                    changed.push(Subsystem::Playlist);
                }
            }
        }
        for sub in changed {
            let _ = self.notify.send(sub);
        }
    }

    fn entry_for(&self, item: &KodiItem) -> PlaylistEntry {
        // Queue positions must stay aligned with Kodi's, so entries
        // outside the music root keep their raw remote path
        let file = match self.paths.to_mpd(&item.file) {
            Ok(file) => file,
            Err(_) => item.file.clone(),
        };
        PlaylistEntry::from_item(file, item)
    }
}

/// Status fields derived from one remote view. The playlist version is
/// assigned at commit time.
fn derive_status(fetched: &KodiSnapshot, playlist: &[PlaylistEntry]) -> PlaybackStatus {
    // An active player without a playlist position is playing something
    // outside the audio queue; that is outside this bridge's model and
    // presents as stopped.
    let player = fetched
        .player
        .as_ref()
        .and_then(|p| p.position.map(|position| (p, position)));

    match player {
        Some((player, position)) => PlaybackStatus {
            state: if player.paused {
                PlayerState::Paused
            } else {
                PlayerState::Playing
            },
            volume: Some(fetched.volume),
            playlist_version: 0,
            song: Some(position),
            elapsed: Some(player.elapsed),
            duration: if player.duration > 0.0 {
                Some(player.duration)
            } else {
                playlist.get(position).and_then(|entry| entry.duration)
            },
            random: player.shuffled,
            repeat: player.repeat != "off",
            single: player.repeat == "one",
        },
        None => PlaybackStatus {
            state: PlayerState::Stopped,
            volume: Some(fetched.volume),
            playlist_version: 0,
            song: None,
            elapsed: None,
            duration: None,
            random: false,
            repeat: false,
            single: false,
        },
    }
}

fn diff_subsystems(
    old: &PlaybackStatus,
    new: &PlaybackStatus,
    composition_changed: bool,
) -> Vec<Subsystem> {
    let mut changed = Vec::new();
    if old.state != new.state || old.song != new.song {
        changed.push(Subsystem::Player);
    }
    if composition_changed {
        changed.push(Subsystem::Playlist);
    }
    if old.volume != new.volume {
        changed.push(Subsystem::Mixer);
    }
    if old.random != new.random || old.repeat != new.repeat || old.single != new.single {
        changed.push(Subsystem::Options);
    }
    changed
}

/// Poll Kodi on a fixed interval until shutdown. Failures are logged
/// once per outage; the cache handles degradation itself.
pub async fn run_poller(cache: SharedCache, period: Duration, shutdown: CancellationToken) {
    let mut timer = interval(period);
    let mut failing = false;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("poller shutting down");
                break;
            }
            _ = timer.tick() => {
                match cache.refresh().await {
                    Ok(()) => {
                        if failing {
                            info!("kodi poll recovered");
                            failing = false;
                        }
                    }
                    Err(e) => {
                        if failing {
                            debug!("kodi poll failed: {}", e);
                        } else {
                            warn!("kodi poll failed: {}", e);
                            failing = true;
                        }
                    }
                }
            }
        }
    }
}
