//! kodipd - MPD protocol bridge for Kodi
//!
//! Exposes a Music Player Daemon compatible TCP server and drives a
//! Kodi instance over its JSON-RPC HTTP API underneath, so classic MPD
//! clients can control Kodi playback.
//!
//! This library provides:
//! - MPD wire grammar: tokenizer, ACK errors, response framing
//! - Kodi JSON-RPC client for the audio player and playlist
//! - A polled state cache with idle-subsystem change notification
//! - MPD command dispatch and per-connection session handling

pub mod command;
pub mod config;
pub mod kodi;
pub mod paths;
pub mod protocol;
pub mod server;
pub mod session;
pub mod state;
