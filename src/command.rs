//! MPD command dispatch
//!
//! One handler per MPD command. Read commands render the cached
//! snapshot; write commands drive Kodi through the typed client and
//! refresh the cache afterwards so the next status query and any idling
//! session see the effect without waiting for the poller.
//!
//! Handlers return either a response body or an `Ack`; terminators
//! (`OK`, `list_OK`) belong to the session layer.

use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::kodi::{GoTo, KodiClient, KodiError, AUDIO_PLAYER_ID};
use crate::paths::{PathError, PathTranslator};
use crate::protocol::{tokenize, Ack, AckCode, Response};
use crate::state::{PlayerState, PlaylistEntry, SharedCache, Snapshot, Subsystem};

/// Commands this server answers, as reported by `commands`.
const COMMANDS: &[&str] = &[
    "add",
    "addid",
    "clear",
    "close",
    "command_list_begin",
    "command_list_end",
    "command_list_ok_begin",
    "commands",
    "currentsong",
    "delete",
    "deleteid",
    "idle",
    "listall",
    "listallinfo",
    "lsinfo",
    "move",
    "next",
    "noidle",
    "notcommands",
    "outputs",
    "pause",
    "ping",
    "play",
    "playid",
    "playlistid",
    "playlistinfo",
    "plchanges",
    "plchangesposid",
    "previous",
    "random",
    "repeat",
    "seek",
    "seekcur",
    "setvol",
    "single",
    "status",
    "stop",
    "tagtypes",
];

// =============================================================================
// Tag masking
// =============================================================================

/// Tags a client can toggle with `tagtypes`. `file`, `Time`, `Pos` and
/// `Id` are structural fields, not tags, and are always emitted.
pub const TAG_TYPES: [&str; 6] = ["Artist", "Album", "Title", "Track", "Genre", "Date"];

#[derive(Debug, Clone)]
pub struct TagMask {
    enabled: [bool; TAG_TYPES.len()],
}

impl Default for TagMask {
    fn default() -> Self {
        Self {
            enabled: [true; TAG_TYPES.len()],
        }
    }
}

impl TagMask {
    fn position(name: &str) -> Option<usize> {
        TAG_TYPES.iter().position(|t| t.eq_ignore_ascii_case(name))
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        Self::position(name).map_or(true, |i| self.enabled[i])
    }

    /// Returns false for a name that is not a known tag type.
    pub fn set(&mut self, name: &str, value: bool) -> bool {
        match Self::position(name) {
            Some(i) => {
                self.enabled[i] = value;
                true
            }
            None => false,
        }
    }

    pub fn set_all(&mut self, value: bool) {
        self.enabled = [value; TAG_TYPES.len()];
    }

    pub fn enabled_names(&self) -> Vec<&'static str> {
        TAG_TYPES
            .iter()
            .copied()
            .zip(self.enabled)
            .filter_map(|(name, on)| on.then_some(name))
            .collect()
    }
}

/// Per-connection dispatch state.
#[derive(Default)]
pub struct SessionCtx {
    pub tags: TagMask,
}

// =============================================================================
// Command parsing
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    /// Split one request line into a command name and its arguments.
    pub fn parse(line: &str) -> Result<Command, Ack> {
        let mut tokens =
            tokenize(line).map_err(|e| Ack::new(AckCode::UnknownCommand, "", e.to_string()))?;
        if tokens.is_empty() {
            return Err(Ack::new(AckCode::UnknownCommand, "", "No command given"));
        }
        let name = tokens.remove(0);
        Ok(Command { name, args: tokens })
    }

    fn arg(&self, index: usize) -> Result<&str, Ack> {
        self.args
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| self.wrong_args())
    }

    fn opt_arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    fn int_arg(&self, index: usize) -> Result<i64, Ack> {
        let raw = self.arg(index)?;
        raw.parse().map_err(|_| self.bad_int(raw))
    }

    fn pos_arg(&self, index: usize) -> Result<usize, Ack> {
        let raw = self.arg(index)?;
        raw.parse().map_err(|_| self.bad_int(raw))
    }

    fn opt_pos_arg(&self, index: usize) -> Result<Option<usize>, Ack> {
        match self.opt_arg(index) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| self.bad_int(raw)),
        }
    }

    fn bool_arg(&self, index: usize) -> Result<bool, Ack> {
        match self.arg(index)? {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(Ack::new(
                AckCode::Argument,
                &self.name,
                format!("Boolean (0/1) expected: {}", other),
            )),
        }
    }

    fn float_arg(&self, index: usize) -> Result<f64, Ack> {
        let raw = self.arg(index)?;
        raw.parse().map_err(|_| {
            Ack::new(
                AckCode::Argument,
                &self.name,
                format!("Number expected: {}", raw),
            )
        })
    }

    /// Queue position or `START:END` range (end exclusive, open when
    /// omitted), resolved against the current queue length.
    fn range_arg(&self, index: usize, len: usize) -> Result<(usize, usize), Ack> {
        let raw = self.arg(index)?;
        let bad = || {
            Ack::new(
                AckCode::Argument,
                &self.name,
                format!("Integer or range expected: {}", raw),
            )
        };
        match raw.split_once(':') {
            None => {
                let pos: usize = raw.parse().map_err(|_| bad())?;
                if pos >= len {
                    return Err(no_such_song(&self.name));
                }
                Ok((pos, pos + 1))
            }
            Some((from, to)) => {
                let start: usize = from.parse().map_err(|_| bad())?;
                let end: usize = if to.is_empty() {
                    len
                } else {
                    to.parse().map_err(|_| bad())?
                };
                if end < start {
                    return Err(bad());
                }
                Ok((start.min(len), end.min(len)))
            }
        }
    }

    fn wrong_args(&self) -> Ack {
        Ack::new(
            AckCode::Argument,
            &self.name,
            format!("wrong number of arguments for \"{}\"", self.name),
        )
    }

    fn bad_int(&self, raw: &str) -> Ack {
        Ack::new(
            AckCode::Argument,
            &self.name,
            format!("Integer expected: {}", raw),
        )
    }
}

// =============================================================================
// Error mapping
// =============================================================================

fn unknown_command(name: &str) -> Ack {
    Ack::new(
        AckCode::UnknownCommand,
        name,
        format!("unknown command \"{}\"", name),
    )
}

fn no_such_song(command: &str) -> Ack {
    Ack::new(AckCode::NoExist, command, "No such song")
}

fn kodi_ack(command: &str, e: &KodiError) -> Ack {
    if e.is_unavailable() {
        debug!("{} failed: {}", command, e);
        Ack::new(AckCode::System, command, "kodi unreachable")
    } else {
        warn!("{} failed: {}", command, e);
        Ack::new(AckCode::System, command, e.to_string())
    }
}

fn path_ack(command: &str, e: PathError) -> Ack {
    let code = match e {
        PathError::Invalid { .. } => AckCode::Argument,
        PathError::OutsideRoot { .. } => AckCode::NoExist,
    };
    Ack::new(code, command, e.to_string())
}

// =============================================================================
// Dispatch
// =============================================================================

/// Shared handles every session dispatches against.
pub struct Bridge {
    pub kodi: KodiClient,
    pub cache: SharedCache,
    pub paths: PathTranslator,
}

impl Bridge {
    pub async fn dispatch(&self, ctx: &mut SessionCtx, cmd: &Command) -> Result<Response, Ack> {
        match cmd.name.as_str() {
            "ping" => Ok(Response::new()),
            "status" => self.status().await,
            "currentsong" => self.currentsong(ctx).await,
            "playlistinfo" => self.playlistinfo(cmd, ctx).await,
            "playlistid" => self.playlistid(cmd, ctx).await,
            "plchanges" => self.plchanges(cmd, ctx).await,
            "plchangesposid" => self.plchangesposid(cmd).await,
            "lsinfo" => self.lsinfo(cmd, ctx).await,
            "listall" => self.listall(cmd, false, ctx).await,
            "listallinfo" => self.listall(cmd, true, ctx).await,
            "commands" => Ok(commands_response()),
            "notcommands" => Ok(Response::new()),
            "tagtypes" => tagtypes(cmd, ctx),
            "outputs" => Ok(outputs_response()),
            "play" | "playid" => self.play(cmd).await,
            "pause" => self.pause(cmd).await,
            "stop" => self.stop().await,
            "next" => self.skip(cmd, GoTo::Next).await,
            "previous" => self.skip(cmd, GoTo::Previous).await,
            "seek" => self.seek(cmd).await,
            "seekcur" => self.seekcur(cmd).await,
            "setvol" => self.setvol(cmd).await,
            "random" => self.random(cmd).await,
            "repeat" => self.repeat(cmd).await,
            "single" => self.single(cmd).await,
            "add" => self.add(cmd).await,
            "addid" => self.addid(cmd).await,
            "delete" => self.delete(cmd).await,
            "deleteid" => self.deleteid(cmd).await,
            "clear" => self.clear().await,
            "move" => self.move_entry(cmd).await,
            _ => Err(unknown_command(&cmd.name)),
        }
    }

    /// Best-effort refresh then read. A failed refresh serves the last
    /// snapshot; staleness degradation is the cache's concern.
    async fn fresh_snapshot(&self) -> Snapshot {
        if let Err(e) = self.cache.refresh().await {
            debug!("pre-read refresh failed: {}", e);
        }
        let (snapshot, _) = self.cache.read().await;
        snapshot
    }

    /// Post-write refresh. Diffing turns whatever changed into idle
    /// notifications; `forced` covers effects diffing cannot see.
    async fn refresh_after_write(&self, forced: &[Subsystem]) {
        if let Err(e) = self.cache.refresh_with(forced).await {
            debug!("post-write refresh failed: {}", e);
        }
    }

    /// Kodi scopes shuffle and repeat to an active player; without one
    /// there is nothing to set.
    async fn require_player(&self, command: &str) -> Result<Snapshot, Ack> {
        let (snapshot, _) = self.cache.read().await;
        if snapshot.status.state == PlayerState::Stopped {
            return Err(Ack::new(AckCode::System, command, "no active player"));
        }
        Ok(snapshot)
    }

    // =========================================================================
    // Status and queue queries
    // =========================================================================

    async fn status(&self) -> Result<Response, Ack> {
        let snapshot = self.fresh_snapshot().await;
        let status = &snapshot.status;
        let mut r = Response::new();
        r.field("volume", status.volume.map(i64::from).unwrap_or(-1));
        r.field("repeat", u8::from(status.repeat));
        r.field("random", u8::from(status.random));
        r.field("single", u8::from(status.single));
        r.field("consume", 0);
        r.field("playlist", status.playlist_version);
        r.field("playlistlength", snapshot.playlist.len());
        r.field("xfade", 0);
        r.field("state", status.state.as_mpd());
        if let Some(song) = status.song {
            r.field("song", song);
            r.field("songid", song);
            if let Some(elapsed) = status.elapsed {
                let total = status.duration.unwrap_or(0.0);
                r.field(
                    "time",
                    format!("{}:{}", elapsed.round() as u64, total.round() as u64),
                );
                r.field("elapsed", format!("{:.3}", elapsed));
            }
        }
        Ok(r)
    }

    async fn currentsong(&self, ctx: &SessionCtx) -> Result<Response, Ack> {
        let snapshot = self.fresh_snapshot().await;
        let mut r = Response::new();
        if let Some(pos) = snapshot.status.song {
            if let Some(entry) = snapshot.playlist.get(pos) {
                song_block(&mut r, entry, Some(pos), &ctx.tags);
            }
        }
        Ok(r)
    }

    async fn playlistinfo(&self, cmd: &Command, ctx: &SessionCtx) -> Result<Response, Ack> {
        let snapshot = self.fresh_snapshot().await;
        let (start, end) = match cmd.opt_arg(0) {
            Some(_) => cmd.range_arg(0, snapshot.playlist.len())?,
            None => (0, snapshot.playlist.len()),
        };
        let mut r = Response::new();
        for (offset, entry) in snapshot.playlist[start..end].iter().enumerate() {
            song_block(&mut r, entry, Some(start + offset), &ctx.tags);
        }
        Ok(r)
    }

    async fn playlistid(&self, cmd: &Command, ctx: &SessionCtx) -> Result<Response, Ack> {
        let snapshot = self.fresh_snapshot().await;
        let mut r = Response::new();
        match cmd.opt_pos_arg(0)? {
            Some(id) => {
                let entry = snapshot
                    .playlist
                    .get(id)
                    .ok_or_else(|| no_such_song(&cmd.name))?;
                song_block(&mut r, entry, Some(id), &ctx.tags);
            }
            None => {
                for (pos, entry) in snapshot.playlist.iter().enumerate() {
                    song_block(&mut r, entry, Some(pos), &ctx.tags);
                }
            }
        }
        Ok(r)
    }

    /// No per-version change journal is kept; a client behind the
    /// current version gets the full queue, which the protocol permits.
    async fn plchanges(&self, cmd: &Command, ctx: &SessionCtx) -> Result<Response, Ack> {
        let version = cmd.int_arg(0)?.max(0) as u64;
        let snapshot = self.fresh_snapshot().await;
        let mut r = Response::new();
        if version < snapshot.status.playlist_version {
            for (pos, entry) in snapshot.playlist.iter().enumerate() {
                song_block(&mut r, entry, Some(pos), &ctx.tags);
            }
        }
        Ok(r)
    }

    async fn plchangesposid(&self, cmd: &Command) -> Result<Response, Ack> {
        let version = cmd.int_arg(0)?.max(0) as u64;
        let snapshot = self.fresh_snapshot().await;
        let mut r = Response::new();
        if version < snapshot.status.playlist_version {
            for pos in 0..snapshot.playlist.len() {
                r.field("cpos", pos);
                r.field("Id", pos);
            }
        }
        Ok(r)
    }

    // =========================================================================
    // Browsing
    // =========================================================================

    async fn lsinfo(&self, cmd: &Command, ctx: &SessionCtx) -> Result<Response, Ack> {
        let path = cmd.opt_arg(0).unwrap_or("");
        let dir = self
            .paths
            .to_kodi_dir(path)
            .map_err(|e| path_ack(&cmd.name, e))?;
        let listing = self
            .kodi
            .get_directory(&dir)
            .await
            .map_err(|e| kodi_ack(&cmd.name, &e))?;

        let mut r = Response::new();
        for dir in &listing.dirs {
            match self.paths.to_mpd(dir) {
                Ok(mpd) => r.field("directory", mpd),
                Err(e) => debug!("skipping unmapped directory: {}", e),
            }
        }
        for item in &listing.files {
            match self.paths.to_mpd(&item.file) {
                Ok(mpd) => song_block(
                    &mut r,
                    &PlaylistEntry::from_item(mpd, item),
                    None,
                    &ctx.tags,
                ),
                Err(e) => debug!("skipping unmapped file: {}", e),
            }
        }
        for playlist in &listing.playlists {
            match self.paths.to_mpd(playlist) {
                Ok(mpd) => r.field("playlist", mpd),
                Err(e) => debug!("skipping unmapped playlist: {}", e),
            }
        }
        Ok(r)
    }

    /// Breadth-first walk over the directory tree. Kodi returns
    /// subdirectories as ready-to-use paths, so the frontier carries
    /// remote paths directly.
    async fn listall(&self, cmd: &Command, with_info: bool, ctx: &SessionCtx) -> Result<Response, Ack> {
        let path = cmd.opt_arg(0).unwrap_or("");
        let start = self
            .paths
            .to_kodi_dir(path)
            .map_err(|e| path_ack(&cmd.name, e))?;

        let mut r = Response::new();
        let mut frontier = VecDeque::from([start]);
        while let Some(dir) = frontier.pop_front() {
            let listing = self
                .kodi
                .get_directory(&dir)
                .await
                .map_err(|e| kodi_ack(&cmd.name, &e))?;
            for sub in listing.dirs {
                match self.paths.to_mpd(&sub) {
                    Ok(mpd) => {
                        r.field("directory", mpd);
                        frontier.push_back(sub);
                    }
                    Err(e) => debug!("skipping unmapped directory: {}", e),
                }
            }
            for item in &listing.files {
                match self.paths.to_mpd(&item.file) {
                    Ok(mpd) => {
                        if with_info {
                            song_block(
                                &mut r,
                                &PlaylistEntry::from_item(mpd, item),
                                None,
                                &ctx.tags,
                            );
                        } else {
                            r.field("file", mpd);
                        }
                    }
                    Err(e) => debug!("skipping unmapped file: {}", e),
                }
            }
        }
        Ok(r)
    }

    // =========================================================================
    // Playback control
    // =========================================================================

    async fn play(&self, cmd: &Command) -> Result<Response, Ack> {
        let (snapshot, _) = self.cache.read().await;
        match cmd.opt_pos_arg(0)? {
            Some(pos) => {
                if pos >= snapshot.playlist.len() {
                    return Err(Ack::new(AckCode::Argument, &cmd.name, "Bad song index"));
                }
                self.kodi
                    .open_position(pos)
                    .await
                    .map_err(|e| kodi_ack(&cmd.name, &e))?;
            }
            None => match snapshot.status.state {
                PlayerState::Paused => {
                    self.kodi
                        .play_pause(AUDIO_PLAYER_ID, Some(true))
                        .await
                        .map_err(|e| kodi_ack(&cmd.name, &e))?;
                }
                PlayerState::Playing => {}
                PlayerState::Stopped => {
                    if !snapshot.playlist.is_empty() {
                        self.kodi
                            .open_position(0)
                            .await
                            .map_err(|e| kodi_ack(&cmd.name, &e))?;
                    }
                }
            },
        }
        self.refresh_after_write(&[]).await;
        Ok(Response::new())
    }

    async fn pause(&self, cmd: &Command) -> Result<Response, Ack> {
        let play = match cmd.opt_arg(0) {
            None => None,
            Some(_) => Some(!cmd.bool_arg(0)?),
        };
        let (snapshot, _) = self.cache.read().await;
        if snapshot.status.state == PlayerState::Stopped {
            // Nothing to pause; MPD treats this as a no-op
            return Ok(Response::new());
        }
        self.kodi
            .play_pause(AUDIO_PLAYER_ID, play)
            .await
            .map_err(|e| kodi_ack(&cmd.name, &e))?;
        self.refresh_after_write(&[]).await;
        Ok(Response::new())
    }

    async fn stop(&self) -> Result<Response, Ack> {
        let (snapshot, _) = self.cache.read().await;
        if snapshot.status.state != PlayerState::Stopped {
            self.kodi
                .stop(AUDIO_PLAYER_ID)
                .await
                .map_err(|e| kodi_ack("stop", &e))?;
            self.refresh_after_write(&[]).await;
        }
        Ok(Response::new())
    }

    async fn skip(&self, cmd: &Command, target: GoTo) -> Result<Response, Ack> {
        let (snapshot, _) = self.cache.read().await;
        if snapshot.status.state == PlayerState::Stopped {
            return Err(Ack::new(AckCode::PlayerSync, &cmd.name, "Not playing"));
        }
        self.kodi
            .go_to(AUDIO_PLAYER_ID, target)
            .await
            .map_err(|e| kodi_ack(&cmd.name, &e))?;
        self.refresh_after_write(&[]).await;
        Ok(Response::new())
    }

    async fn seek(&self, cmd: &Command) -> Result<Response, Ack> {
        let pos = cmd.pos_arg(0)?;
        let time = cmd.float_arg(1)?;
        if time < 0.0 {
            return Err(Ack::new(AckCode::Argument, &cmd.name, "Bad time"));
        }
        let (snapshot, _) = self.cache.read().await;
        if pos >= snapshot.playlist.len() {
            return Err(Ack::new(AckCode::Argument, &cmd.name, "Bad song index"));
        }
        if snapshot.status.song != Some(pos) {
            self.kodi
                .open_position(pos)
                .await
                .map_err(|e| kodi_ack(&cmd.name, &e))?;
        }
        self.kodi
            .seek_to(AUDIO_PLAYER_ID, time)
            .await
            .map_err(|e| kodi_ack(&cmd.name, &e))?;
        // A seek within the same song changes nothing the diff can see
        self.refresh_after_write(&[Subsystem::Player]).await;
        Ok(Response::new())
    }

    async fn seekcur(&self, cmd: &Command) -> Result<Response, Ack> {
        let raw = cmd.arg(0)?;
        let (snapshot, _) = self.cache.read().await;
        let Some(elapsed) = snapshot.status.elapsed else {
            return Err(Ack::new(AckCode::PlayerSync, &cmd.name, "Not playing"));
        };
        let parse = |s: &str| -> Result<f64, Ack> {
            s.parse()
                .map_err(|_| Ack::new(AckCode::Argument, &cmd.name, format!("Number expected: {}", raw)))
        };
        // A leading sign makes the time relative to the current position
        let target = if let Some(rest) = raw.strip_prefix('+') {
            elapsed + parse(rest)?
        } else if let Some(rest) = raw.strip_prefix('-') {
            elapsed - parse(rest)?
        } else {
            parse(raw)?
        };
        self.kodi
            .seek_to(AUDIO_PLAYER_ID, target.max(0.0))
            .await
            .map_err(|e| kodi_ack(&cmd.name, &e))?;
        self.refresh_after_write(&[Subsystem::Player]).await;
        Ok(Response::new())
    }

    async fn setvol(&self, cmd: &Command) -> Result<Response, Ack> {
        let volume = cmd.int_arg(0)?;
        if !(0..=100).contains(&volume) {
            return Err(Ack::new(AckCode::Argument, &cmd.name, "Invalid volume value"));
        }
        self.kodi
            .set_volume(volume as u8)
            .await
            .map_err(|e| kodi_ack(&cmd.name, &e))?;
        self.refresh_after_write(&[]).await;
        Ok(Response::new())
    }

    async fn random(&self, cmd: &Command) -> Result<Response, Ack> {
        let value = cmd.bool_arg(0)?;
        self.require_player(&cmd.name).await?;
        self.kodi
            .set_shuffle(AUDIO_PLAYER_ID, value)
            .await
            .map_err(|e| kodi_ack(&cmd.name, &e))?;
        self.refresh_after_write(&[]).await;
        Ok(Response::new())
    }

    async fn repeat(&self, cmd: &Command) -> Result<Response, Ack> {
        let value = cmd.bool_arg(0)?;
        self.require_player(&cmd.name).await?;
        let mode = if value { "all" } else { "off" };
        self.kodi
            .set_repeat(AUDIO_PLAYER_ID, mode)
            .await
            .map_err(|e| kodi_ack(&cmd.name, &e))?;
        self.refresh_after_write(&[]).await;
        Ok(Response::new())
    }

    /// MPD single maps onto Kodi's "one" repeat mode; switching it off
    /// restores plain repeat if that was on.
    async fn single(&self, cmd: &Command) -> Result<Response, Ack> {
        let value = cmd.bool_arg(0)?;
        let snapshot = self.require_player(&cmd.name).await?;
        let mode = if value {
            "one"
        } else if snapshot.status.repeat {
            "all"
        } else {
            "off"
        };
        self.kodi
            .set_repeat(AUDIO_PLAYER_ID, mode)
            .await
            .map_err(|e| kodi_ack(&cmd.name, &e))?;
        self.refresh_after_write(&[]).await;
        Ok(Response::new())
    }

    // =========================================================================
    // Queue editing
    // =========================================================================

    async fn add(&self, cmd: &Command) -> Result<Response, Ack> {
        let path = cmd.arg(0)?;
        let kodi_path = self
            .paths
            .to_kodi(path)
            .map_err(|e| path_ack(&cmd.name, e))?;
        self.kodi
            .playlist_add(&kodi_path)
            .await
            .map_err(|e| kodi_ack(&cmd.name, &e))?;
        self.refresh_after_write(&[]).await;
        Ok(Response::new())
    }

    async fn addid(&self, cmd: &Command) -> Result<Response, Ack> {
        let path = cmd.arg(0)?;
        let kodi_path = self
            .paths
            .to_kodi(path)
            .map_err(|e| path_ack(&cmd.name, e))?;
        let (snapshot, _) = self.cache.read().await;
        let position = match cmd.opt_pos_arg(1)? {
            Some(pos) => {
                if pos > snapshot.playlist.len() {
                    return Err(Ack::new(AckCode::Argument, &cmd.name, "Bad song index"));
                }
                self.kodi
                    .playlist_insert(pos, &kodi_path)
                    .await
                    .map_err(|e| kodi_ack(&cmd.name, &e))?;
                pos
            }
            None => {
                self.kodi
                    .playlist_add(&kodi_path)
                    .await
                    .map_err(|e| kodi_ack(&cmd.name, &e))?;
                snapshot.playlist.len()
            }
        };
        self.refresh_after_write(&[]).await;
        let mut r = Response::new();
        r.field("Id", position);
        Ok(r)
    }

    async fn delete(&self, cmd: &Command) -> Result<Response, Ack> {
        let (snapshot, _) = self.cache.read().await;
        let (start, end) = cmd.range_arg(0, snapshot.playlist.len())?;
        // Remove back to front so earlier positions stay valid
        for pos in (start..end).rev() {
            self.kodi
                .playlist_remove(pos)
                .await
                .map_err(|e| kodi_ack(&cmd.name, &e))?;
        }
        self.refresh_after_write(&[]).await;
        Ok(Response::new())
    }

    async fn deleteid(&self, cmd: &Command) -> Result<Response, Ack> {
        let id = cmd.pos_arg(0)?;
        let (snapshot, _) = self.cache.read().await;
        if id >= snapshot.playlist.len() {
            return Err(no_such_song(&cmd.name));
        }
        self.kodi
            .playlist_remove(id)
            .await
            .map_err(|e| kodi_ack(&cmd.name, &e))?;
        self.refresh_after_write(&[]).await;
        Ok(Response::new())
    }

    async fn clear(&self) -> Result<Response, Ack> {
        self.kodi
            .playlist_clear()
            .await
            .map_err(|e| kodi_ack("clear", &e))?;
        self.refresh_after_write(&[]).await;
        Ok(Response::new())
    }

    /// Kodi has no move primitive; walk the entry over with adjacent
    /// swaps.
    async fn move_entry(&self, cmd: &Command) -> Result<Response, Ack> {
        let from = cmd.pos_arg(0)?;
        let to = cmd.pos_arg(1)?;
        let (snapshot, _) = self.cache.read().await;
        let len = snapshot.playlist.len();
        if from >= len || to >= len {
            return Err(Ack::new(AckCode::Argument, &cmd.name, "Bad song index"));
        }
        if from < to {
            for pos in from..to {
                self.kodi
                    .playlist_swap(pos, pos + 1)
                    .await
                    .map_err(|e| kodi_ack(&cmd.name, &e))?;
            }
        } else {
            for pos in ((to + 1)..=from).rev() {
                self.kodi
                    .playlist_swap(pos, pos - 1)
                    .await
                    .map_err(|e| kodi_ack(&cmd.name, &e))?;
            }
        }
        self.refresh_after_write(&[]).await;
        Ok(Response::new())
    }
}

// =============================================================================
// Response rendering
// =============================================================================

/// Render one song. `pos` is present for queue listings and absent for
/// directory browsing, where entries have no queue position.
fn song_block(r: &mut Response, entry: &PlaylistEntry, pos: Option<usize>, tags: &TagMask) {
    r.field("file", &entry.file);
    if tags.is_enabled("Artist") {
        if let Some(artist) = &entry.artist {
            r.field("Artist", artist);
        }
    }
    if tags.is_enabled("Album") {
        if let Some(album) = &entry.album {
            r.field("Album", album);
        }
    }
    if tags.is_enabled("Title") {
        if let Some(title) = &entry.title {
            r.field("Title", title);
        }
    }
    if tags.is_enabled("Track") {
        if let Some(track) = entry.track {
            r.field("Track", track);
        }
    }
    if tags.is_enabled("Genre") {
        if let Some(genre) = &entry.genre {
            r.field("Genre", genre);
        }
    }
    if tags.is_enabled("Date") {
        if let Some(year) = entry.year {
            r.field("Date", year);
        }
    }
    if let Some(duration) = entry.duration {
        r.field("Time", duration.round() as u64);
    }
    if let Some(pos) = pos {
        r.field("Pos", pos);
        r.field("Id", pos);
    }
}

fn commands_response() -> Response {
    let mut r = Response::new();
    for name in COMMANDS {
        r.field("command", name);
    }
    r
}

fn outputs_response() -> Response {
    let mut r = Response::new();
    r.field("outputid", 0);
    r.field("outputname", "Kodi");
    r.field("outputenabled", 1);
    r
}

fn tagtypes(cmd: &Command, ctx: &mut SessionCtx) -> Result<Response, Ack> {
    let mut r = Response::new();
    match cmd.opt_arg(0) {
        None => {
            for name in ctx.tags.enabled_names() {
                r.field("tagtype", name);
            }
        }
        Some("all") => ctx.tags.set_all(true),
        Some("clear") => ctx.tags.set_all(false),
        Some(action @ ("enable" | "disable")) => {
            if cmd.args.len() < 2 {
                return Err(cmd.wrong_args());
            }
            let value = action == "enable";
            for name in &cmd.args[1..] {
                if !ctx.tags.set(name, value) {
                    return Err(Ack::new(
                        AckCode::Argument,
                        &cmd.name,
                        format!("Unknown tag type: {}", name),
                    ));
                }
            }
        }
        Some(other) => {
            return Err(Ack::new(
                AckCode::Argument,
                &cmd.name,
                format!("Unknown sub command: {}", other),
            ))
        }
    }
    Ok(r)
}

// =============================================================================
// Command lists
// =============================================================================

/// Buffered `command_list_begin` block, accumulated by the session.
#[derive(Debug)]
pub struct CommandList {
    ok_mode: bool,
    lines: Vec<String>,
}

impl CommandList {
    pub fn new(ok_mode: bool) -> Self {
        Self {
            ok_mode,
            lines: Vec::new(),
        }
    }

    pub fn push(&mut self, line: String) {
        self.lines.push(line);
    }
}

/// Result of executing a buffered list: everything to write before the
/// final `OK` or `ACK`, and whether the client asked to disconnect.
pub struct ListOutcome {
    pub body: String,
    pub ack: Option<Ack>,
    pub close: bool,
}

/// Execute a command list in order. The first failure stops the batch
/// and carries its list index; already-issued remote calls stay applied.
pub async fn run_list(bridge: &Bridge, ctx: &mut SessionCtx, list: &CommandList) -> ListOutcome {
    let mut body = String::new();
    for (index, line) in list.lines.iter().enumerate() {
        let cmd = match Command::parse(line) {
            Ok(cmd) => cmd,
            Err(ack) => {
                return ListOutcome {
                    body,
                    ack: Some(ack.at_index(index)),
                    close: false,
                }
            }
        };
        match cmd.name.as_str() {
            "close" => {
                return ListOutcome {
                    body,
                    ack: None,
                    close: true,
                }
            }
            "command_list_begin" | "command_list_ok_begin" => {
                let ack = Ack::new(AckCode::NotList, &cmd.name, "command list may not be nested")
                    .at_index(index);
                return ListOutcome {
                    body,
                    ack: Some(ack),
                    close: false,
                };
            }
            "idle" => {
                let ack = Ack::new(AckCode::NotList, "idle", "idle not allowed in command lists")
                    .at_index(index);
                return ListOutcome {
                    body,
                    ack: Some(ack),
                    close: false,
                };
            }
            "noidle" => {}
            _ => match bridge.dispatch(ctx, &cmd).await {
                Ok(response) => body.push_str(&response.into_inner()),
                Err(ack) => {
                    return ListOutcome {
                        body,
                        ack: Some(ack.at_index(index)),
                        close: false,
                    }
                }
            },
        }
        if list.ok_mode {
            body.push_str("list_OK\n");
        }
    }
    ListOutcome {
        body,
        ack: None,
        close: false,
    }
}
