//! Configuration management
//!
//! Settings merge from an optional config file and `KODIPD_*`
//! environment variables, environment last. `KODIPD_CONFIG` names an
//! explicit config file; without it, `kodipd.{toml,json,yaml}` next to
//! the working directory is picked up when present.

use std::time::Duration;

use anyhow::{bail, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Address the MPD listener binds.
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    /// MPD listener port.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_kodi_host")]
    pub kodi_host: String,

    /// Kodi's HTTP JSON-RPC port ("Allow remote control via HTTP").
    #[serde(default = "default_kodi_port")]
    pub kodi_port: u16,

    #[serde(default)]
    pub kodi_username: Option<String>,

    #[serde(default)]
    pub kodi_password: Option<String>,

    /// Kodi-side directory the MPD tree is rooted at.
    #[serde(default = "default_music_root")]
    pub music_root: String,

    /// Path separator Kodi uses under the music root ("\\" for smb
    /// sources browsed from Windows shares).
    #[serde(default = "default_path_separator")]
    pub path_separator: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    6601
}

fn default_kodi_host() -> String {
    "localhost".to_string()
}

fn default_kodi_port() -> u16 {
    8080
}

fn default_music_root() -> String {
    "/".to_string()
}

fn default_path_separator() -> String {
    "/".to_string()
}

fn default_poll_interval_secs() -> u64 {
    2
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.music_root.is_empty() {
            bail!("music_root must not be empty");
        }
        if self.path_separator.is_empty() {
            bail!("path_separator must not be empty");
        }
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be at least 1");
        }
        Ok(())
    }
}

pub fn load_config() -> Result<Config> {
    // An explicitly named config file must exist; the conventional one
    // next to the working directory is optional.
    let (file, required) = match std::env::var("KODIPD_CONFIG") {
        Ok(path) => (path, true),
        Err(_) => ("kodipd".to_string(), false),
    };

    let builder = ::config::Config::builder()
        .set_default("port", default_port() as i64)?
        .add_source(::config::File::with_name(&file).required(required))
        // Override with environment variables (KODIPD_PORT,
        // KODIPD_KODI_HOST, KODIPD_MUSIC_ROOT, etc.)
        .add_source(
            ::config::Environment::with_prefix("KODIPD")
                // Without this the key separator doubles as the prefix
                // separator and only KODIPD__PORT style names match
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config: Config = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}
